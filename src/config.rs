//!
//! Alfred configuration
//! ---------------------
//! The store file's top-level `Configuration` object, plus the `Roles`
//! identifier -> role-list map. Both are recognised top-level keys of the
//! same JSON document the `Store` holds; this module only concerns itself
//! with pulling them into typed structs with the documented defaults.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_min_save_interval() -> f64 {
    60.0
}

fn default_http_port() -> String {
    "8100".to_string()
}

fn default_too_many_requests_threshold() -> String {
    "0.0".to_string()
}

/// `Configuration.Http`: server option key -> string, merged over the
/// defaults `Port=8100` and `TooManyRequestsThreshold=0.0`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpConfig {
    #[serde(flatten)]
    pub options: HashMap<String, String>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        let mut options = HashMap::new();
        options.insert("Port".to_string(), default_http_port());
        options.insert(
            "TooManyRequestsThreshold".to_string(),
            default_too_many_requests_threshold(),
        );
        Self { options }
    }
}

impl HttpConfig {
    fn merged_over_defaults(mut self) -> Self {
        let defaults = HttpConfig::default();
        for (k, v) in defaults.options {
            self.options.entry(k).or_insert(v);
        }
        self
    }

    pub fn port(&self) -> u16 {
        self.options
            .get("Port")
            .and_then(|s| s.parse().ok())
            .unwrap_or(8100)
    }
}

fn default_ws_max_frame_size() -> u64 {
    64 * 1024 * 1024
}

fn default_ws_auth_timeout() -> f64 {
    30.0
}

fn default_ws_close_linger() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "PascalCase")]
pub struct Config {
    #[serde(default = "default_min_save_interval")]
    pub min_save_interval: f64,

    #[serde(default)]
    pub request_timeout_seconds: Option<f64>,

    #[serde(default)]
    pub ssl_certificate: Option<String>,
    #[serde(default)]
    pub ssl_key: Option<String>,
    #[serde(default)]
    pub ssl_key_passphrase: Option<String>,
    #[serde(default)]
    pub ca_certificates: Option<String>,

    #[serde(default)]
    pub log_file: Option<String>,

    #[serde(default)]
    pub diagnostic_reporting_thresholds: HashMap<String, i64>,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default = "default_ws_max_frame_size")]
    pub web_socket_max_frame_size: u64,
    #[serde(default = "default_ws_auth_timeout")]
    pub web_socket_authentication_timeout: f64,
    #[serde(default = "default_ws_close_linger")]
    pub web_socket_close_linger: f64,
}

impl Config {
    /// Parse the `Configuration` object out of the store document, falling
    /// back to every documented default when the key (or the whole object)
    /// is absent.
    pub fn from_document(doc: &serde_json::Value) -> Self {
        let mut cfg: Config = doc
            .get("Configuration")
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default();
        if cfg.min_save_interval <= 0.0 {
            cfg.min_save_interval = default_min_save_interval();
        }
        cfg.http = cfg.http.merged_over_defaults();
        cfg
    }
}

/// `Roles`: identifier -> held role list. Looked up during WS
/// authentication to resolve an identifier into the role set a session
/// holds.
pub fn roles_from_document(doc: &serde_json::Value) -> HashMap<String, Vec<String>> {
    doc.get("Roles")
        .and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_when_configuration_absent() {
        let doc = json!({});
        let cfg = Config::from_document(&doc);
        assert_eq!(cfg.min_save_interval, 60.0);
        assert_eq!(cfg.http.port(), 8100);
        assert_eq!(
            cfg.http.options.get("TooManyRequestsThreshold").unwrap(),
            "0.0"
        );
    }

    #[test]
    fn explicit_values_override_defaults() {
        let doc = json!({
            "Configuration": {
                "MinSaveInterval": 5,
                "Http": {"Port": "9100"}
            }
        });
        let cfg = Config::from_document(&doc);
        assert_eq!(cfg.min_save_interval, 5.0);
        assert_eq!(cfg.http.port(), 9100);
        // Unspecified Http keys still merge in the default.
        assert_eq!(
            cfg.http.options.get("TooManyRequestsThreshold").unwrap(),
            "0.0"
        );
    }

    #[test]
    fn roles_parsed_from_document() {
        let doc = json!({"Roles": {"key:abc": ["editor", "viewer"]}});
        let roles = roles_from_document(&doc);
        assert_eq!(roles.get("key:abc").unwrap(), &vec!["editor", "viewer"]);
    }
}
