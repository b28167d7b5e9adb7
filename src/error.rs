//! Unified application error model and mapping helpers.
//! This module provides a common error enum used across frontends (HTTP,
//! WebSocket) and the Store, along with helper mappers to HTTP status codes.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AppError {
    Setup { code: String, message: String },
    Protocol { code: String, message: String },
    Persistence { code: String, message: String },
    Internal { code: String, message: String },
}

impl AppError {
    pub fn code_str(&self) -> &str {
        match self {
            AppError::Setup { code, .. }
            | AppError::Protocol { code, .. }
            | AppError::Persistence { code, .. }
            | AppError::Internal { code, .. } => code.as_str(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            AppError::Setup { message, .. }
            | AppError::Protocol { message, .. }
            | AppError::Persistence { message, .. }
            | AppError::Internal { message, .. } => message.as_str(),
        }
    }

    pub fn setup<S: Into<String>>(code: S, msg: S) -> Self {
        AppError::Setup { code: code.into(), message: msg.into() }
    }
    pub fn protocol<S: Into<String>>(code: S, msg: S) -> Self {
        AppError::Protocol { code: code.into(), message: msg.into() }
    }
    pub fn persistence<S: Into<String>>(code: S, msg: S) -> Self {
        AppError::Persistence { code: code.into(), message: msg.into() }
    }
    pub fn internal<S: Into<String>>(code: S, msg: S) -> Self {
        AppError::Internal { code: code.into(), message: msg.into() }
    }

    /// Map to HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            AppError::Setup { .. } => 500,
            AppError::Protocol { .. } => 400,
            AppError::Persistence { .. } => 500,
            AppError::Internal { .. } => 500,
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code_str(), self.message())
    }
}

impl std::error::Error for AppError {}

pub type AppResult<T> = Result<T, AppError>;

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal { code: "internal_error".into(), message: err.to_string() }
    }
}
