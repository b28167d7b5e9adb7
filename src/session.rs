//!
//! WS Session
//! ----------
//! Per-connection state machine: `Opened -> AwaitingAuth -> Authenticated
//! -> Closing -> Dropped`. Owns the authentication timer, the dispatch
//! table for inbound messages, and the outbound HTTP transaction map used
//! by `twitch` authentication.
//!
//! Grounded on `clarium::server`'s `ws_handler` loop (`src/server.rs`) for
//! the per-connection message shape, and on
//! `clarium::identity::session::Session` (`src/identity/session.rs`) for
//! the "per-entity mutex-guarded state with issued/expiry bookkeeping"
//! idiom, generalized into an explicit state machine with a table-driven
//! dispatcher instead of clarium's flat `match` on message text.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

use crate::access::RoleSet;
use crate::clock::{CancelToken, Clock, Scheduler, Timestamp};
use crate::store::{StoreHandle, Subscription};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Opened,
    AwaitingAuth,
    Authenticated,
    Closing,
    Dropped,
}

/// What a Session hands the WS Listener to actually put on the wire; the
/// Session itself never touches the raw `axum` socket.
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Close { code: u16, reason: String },
}

pub type OutboundSender = UnboundedSender<Outbound>;

#[derive(Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    Authenticated,
    Notice { path: Vec<String>, data: Value },
    Error { message: String },
}

#[derive(Deserialize)]
struct AuthenticateMessage {
    key: Option<String>,
    twitch: Option<String>,
}

struct Inner {
    state: SessionState,
    identifiers: std::collections::HashSet<String>,
    roles_held: RoleSet,
    auth_timer: Option<CancelToken>,
    subscriptions: Vec<Subscription>,
    outbound_transactions: HashMap<u64, ()>,
    next_transaction_id: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: SessionState::Opened,
            identifiers: std::collections::HashSet::new(),
            roles_held: RoleSet::new(),
            auth_timer: None,
            subscriptions: Vec::new(),
            outbound_transactions: HashMap::new(),
            next_transaction_id: 0,
        }
    }
}

#[derive(Clone)]
pub struct SessionHandle {
    inner: Arc<parking_lot::Mutex<Inner>>,
    store: StoreHandle,
    clock: Arc<dyn Clock>,
    http: reqwest::Client,
    outbound: OutboundSender,
    auth_timeout: Timestamp,
}

impl SessionHandle {
    pub fn new(
        store: StoreHandle,
        clock: Arc<dyn Clock>,
        http: reqwest::Client,
        outbound: OutboundSender,
        auth_timeout: Timestamp,
    ) -> Self {
        Self { inner: Arc::new(parking_lot::Mutex::new(Inner::new())), store, clock, http, outbound, auth_timeout }
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    /// `Opened -> AwaitingAuth`: arm the authentication timer.
    pub fn on_opened(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::Opened {
            return;
        }
        inner.state = SessionState::AwaitingAuth;
        let deadline = self.clock.now() + self.auth_timeout;
        let session = self.clone();
        let token = Scheduler::new().schedule_at(self.clock.clone(), deadline, move || {
            session.on_auth_timeout();
        });
        inner.auth_timer = Some(token);
    }

    fn on_auth_timeout(&self) {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::AwaitingAuth {
            return;
        }
        inner.auth_timer = None;
        self.enter_closing(&mut inner, "Authentication timeout");
    }

    /// Delivered exactly once by the Listener when it begins tearing a
    /// connection down, whatever the cause (client close frame, dropped
    /// stream, or a Close the Session already queued itself). Idempotent:
    /// a Session that already moved itself to `Closing` via a protocol
    /// error is left alone.
    pub fn mark_closed(&self) {
        let mut inner = self.inner.lock();
        self.cancel_pending(&mut inner);
        if !matches!(inner.state, SessionState::Closing | SessionState::Dropped) {
            inner.state = SessionState::Closing;
        }
    }

    /// Final teardown once the Listener's linger window has elapsed.
    pub fn mark_dropped(&self) {
        let mut inner = self.inner.lock();
        self.cancel_pending(&mut inner);
        inner.state = SessionState::Dropped;
    }

    fn cancel_pending(&self, inner: &mut Inner) {
        if let Some(token) = inner.auth_timer.take() {
            token.cancel();
        }
        for sub in inner.subscriptions.drain(..) {
            sub.cancel();
        }
    }

    fn enter_closing(&self, inner: &mut Inner, message: &str) {
        if matches!(inner.state, SessionState::Closing | SessionState::Dropped) {
            return;
        }
        self.cancel_pending(inner);
        inner.state = SessionState::Closing;
        drop_send_text(&self.outbound, &ServerMessage::Error { message: message.to_string() });
        let _ = self.outbound.send(Outbound::Close { code: 1005, reason: message.to_string() });
    }

    /// Entry point for every inbound WS text frame.
    pub async fn handle_text(&self, raw: &str) {
        let parsed: Result<Value, _> = serde_json::from_str(raw);
        let value = match parsed {
            Ok(v) if v.is_object() => v,
            _ => {
                self.fail("malformed message received");
                return;
            }
        };
        let Some(msg_type) = value.get("type").and_then(Value::as_str) else {
            self.fail("malformed message received");
            return;
        };

        for (name, handler) in dispatch_table() {
            if *name == msg_type {
                handler(self.clone(), value).await;
                return;
            }
        }
        self.send_text(&ServerMessage::Error {
            message: format!("Unknown message type: {msg_type}"),
        });
    }

    fn fail(&self, message: &str) {
        let mut inner = self.inner.lock();
        self.enter_closing(&mut inner, message);
    }

    fn send_text(&self, message: &ServerMessage) {
        drop_send_text(&self.outbound, message);
    }

    async fn handle_authenticate(self, value: Value) {
        let parsed: Result<AuthenticateMessage, _> = serde_json::from_value(value);
        let Ok(msg) = parsed else {
            self.fail("malformed message received");
            return;
        };

        {
            let inner = self.inner.lock();
            if inner.state != SessionState::AwaitingAuth {
                drop(inner);
                self.fail("Authentication already completed");
                return;
            }
        }

        if let Some(key) = msg.key {
            let identifier = format!("key:{key}");
            self.resolve_identifier(identifier);
            return;
        }

        if let Some(token) = msg.twitch {
            self.start_twitch_transaction(token).await;
            return;
        }

        self.fail("Authenticate requires key or twitch");
    }

    fn resolve_identifier(&self, identifier: String) {
        let roles_doc = self.store.get(&["Roles".to_string()], &RoleSet::new());
        let Some(roles) = roles_doc.get(&identifier).and_then(Value::as_array) else {
            self.fail("unknown identifier");
            return;
        };
        let roles: Vec<String> = roles.iter().filter_map(|v| v.as_str().map(str::to_string)).collect();
        self.apply_authenticated(identifier, roles);
    }

    fn apply_authenticated(&self, identifier: String, roles: Vec<String>) {
        let mut inner = self.inner.lock();
        if inner.state != SessionState::AwaitingAuth {
            return;
        }
        if let Some(token) = inner.auth_timer.take() {
            token.cancel();
        }
        inner.identifiers.insert(identifier);
        inner.roles_held.extend(roles);
        inner.state = SessionState::Authenticated;
        drop(inner);
        info!("session authenticated");
        self.send_text(&ServerMessage::Authenticated);
    }

    async fn start_twitch_transaction(&self, token: String) {
        let transaction_id = {
            let mut inner = self.inner.lock();
            inner.next_transaction_id += 1;
            let id = inner.next_transaction_id;
            inner.outbound_transactions.insert(id, ());
            id
        };

        let session = self.clone();
        let http = self.http.clone();
        tokio::spawn(async move {
            let outcome = validate_twitch_token(&http, &token).await;
            session.complete_twitch_transaction(transaction_id, outcome);
        });
    }

    fn complete_twitch_transaction(&self, transaction_id: u64, outcome: Result<String, String>) {
        let still_live = {
            let mut inner = self.inner.lock();
            let present = inner.outbound_transactions.remove(&transaction_id).is_some();
            present && inner.state != SessionState::Dropped
        };
        if !still_live {
            warn!(transaction_id, "outbound transaction completed after session was destroyed; abandoning");
            return;
        }
        match outcome {
            Ok(user_id) => self.resolve_identifier(format!("twitch:{user_id}")),
            Err(message) => self.fail(&message),
        }
    }

    /// Wire a server-push `Notice` for `path`, scoped to the roles this
    /// session currently holds. Not reachable from any client message in
    /// this revision (no `Set` operation is exposed), but exercised
    /// directly by tests so the fan-out path is proven rather than
    /// aspirational.
    pub fn subscribe_to(&self, path: Vec<String>) {
        let roles_held = self.inner.lock().roles_held.clone();
        let session = self.clone();
        let watched_path = path.clone();
        let subscription = self.store.subscribe(path, roles_held, move |data| {
            session.send_text(&ServerMessage::Notice { path: watched_path.clone(), data });
        });
        self.inner.lock().subscriptions.push(subscription);
    }
}

fn drop_send_text(outbound: &OutboundSender, message: &ServerMessage) {
    if let Ok(text) = serde_json::to_string(message) {
        let _ = outbound.send(Outbound::Text(text));
    }
}

async fn validate_twitch_token(http: &reqwest::Client, token: &str) -> Result<String, String> {
    let response = http
        .get("https://id.twitch.tv/oauth2/validate")
        .header("Authorization", format!("OAuth {token}"))
        .send()
        .await
        .map_err(|e| format!("twitch validation request failed: {e}"))?;

    if response.status().as_u16() != 200 {
        return Err(format!("twitch validation rejected token: {}", response.status()));
    }
    let body: Value = response
        .json()
        .await
        .map_err(|e| format!("twitch validation response undecodable: {e}"))?;
    let user_id = body
        .get("user_id")
        .and_then(|v| v.as_str().map(str::to_string).or_else(|| v.as_i64().map(|n| n.to_string())))
        .ok_or_else(|| "twitch validation response missing user_id".to_string())?;
    Ok(user_id)
}

type HandlerFn = fn(SessionHandle, Value) -> BoxFuture<'static, ()>;

fn dispatch_table() -> &'static [(&'static str, HandlerFn)] {
    &[("Authenticate", |session, value| session.handle_authenticate(value).boxed())]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio::sync::mpsc::unbounded_channel;

    struct ManualClock(AtomicU64);
    impl Clock for ManualClock {
        fn now(&self) -> Timestamp {
            self.0.load(Ordering::SeqCst) as f64
        }
    }

    fn temp_store(contents: &str) -> (StoreHandle, tempfile::NamedTempFile) {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), contents).unwrap();
        let store = StoreHandle::new();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock(AtomicU64::new(0)));
        store.mobilize(file.path(), clock).unwrap();
        (store, file)
    }

    fn new_session(store: StoreHandle) -> (SessionHandle, tokio::sync::mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = unbounded_channel();
        let clock: Arc<dyn Clock> = Arc::new(ManualClock(AtomicU64::new(0)));
        let session = SessionHandle::new(store, clock, reqwest::Client::new(), tx, 30.0);
        (session, rx)
    }

    #[tokio::test]
    async fn opens_into_awaiting_auth_and_arms_timer() {
        let (store, _file) = temp_store(r#"{"Roles":{}}"#);
        let (session, _rx) = new_session(store);
        assert_eq!(session.state(), SessionState::Opened);
        session.on_opened();
        assert_eq!(session.state(), SessionState::AwaitingAuth);
    }

    #[tokio::test]
    async fn authenticate_by_key_with_known_identifier_succeeds() {
        let (store, _file) = temp_store(r#"{"Roles":{"key:abc":["viewer","editor"]}}"#);
        let (session, mut rx) = new_session(store);
        session.on_opened();
        session.handle_text(r#"{"type":"Authenticate","key":"abc"}"#).await;
        assert_eq!(session.state(), SessionState::Authenticated);
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Text(t) if t.contains("Authenticated")));
    }

    #[tokio::test]
    async fn authenticate_by_key_with_unknown_identifier_closes() {
        let (store, _file) = temp_store(r#"{"Roles":{}}"#);
        let (session, mut rx) = new_session(store);
        session.on_opened();
        session.handle_text(r#"{"type":"Authenticate","key":"nope"}"#).await;
        assert_eq!(session.state(), SessionState::Closing);
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Text(t) if t.contains("Error")));
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close { code: 1005, .. }));
    }

    #[tokio::test]
    async fn reauthentication_is_rejected() {
        let (store, _file) = temp_store(r#"{"Roles":{"key:abc":["viewer"]}}"#);
        let (session, _rx) = new_session(store);
        session.on_opened();
        session.handle_text(r#"{"type":"Authenticate","key":"abc"}"#).await;
        assert_eq!(session.state(), SessionState::Authenticated);
        session.handle_text(r#"{"type":"Authenticate","key":"abc"}"#).await;
        assert_eq!(session.state(), SessionState::Closing);
    }

    #[tokio::test]
    async fn malformed_message_closes_with_error() {
        let (store, _file) = temp_store(r#"{"Roles":{}}"#);
        let (session, mut rx) = new_session(store);
        session.on_opened();
        session.handle_text("not json at all").await;
        assert_eq!(session.state(), SessionState::Closing);
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Text(t) if t.contains("malformed")));
    }

    #[tokio::test]
    async fn unknown_message_type_does_not_close() {
        let (store, _file) = temp_store(r#"{"Roles":{}}"#);
        let (session, mut rx) = new_session(store);
        session.on_opened();
        session.handle_text(r#"{"type":"DoSomethingElse"}"#).await;
        assert_eq!(session.state(), SessionState::AwaitingAuth);
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Text(t) if t.contains("Unknown message type")));
    }

    #[tokio::test]
    async fn subscription_fans_out_notice_and_cancels_on_drop() {
        let (store, _file) = temp_store(r#"{"Roles":{"key:abc":["viewer"]},"Public":"hello"}"#);
        let (session, mut rx) = new_session(store.clone());
        session.on_opened();
        session.handle_text(r#"{"type":"Authenticate","key":"abc"}"#).await;
        let _ = rx.try_recv(); // Authenticated
        session.subscribe_to(vec!["Public".to_string()]);
        match rx.try_recv().unwrap() {
            Outbound::Text(t) => assert!(t.contains("\"Notice\"") && t.contains("hello")),
            other => panic!("expected initial Notice, got {other:?}"),
        }

        store.touch(|doc| doc["Public"] = json!("updated"));
        match rx.try_recv().unwrap() {
            Outbound::Text(t) => assert!(t.contains("updated")),
            other => panic!("expected update Notice, got {other:?}"),
        }

        session.mark_dropped();
        store.touch(|doc| doc["Public"] = json!("again"));
        assert!(rx.try_recv().is_err());
    }

    #[derive(Clone)]
    struct TokioVirtualClock {
        start: tokio::time::Instant,
    }
    impl TokioVirtualClock {
        fn new() -> Self {
            Self { start: tokio::time::Instant::now() }
        }
    }
    impl Clock for TokioVirtualClock {
        fn now(&self) -> Timestamp {
            self.start.elapsed().as_secs_f64()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn p7_auth_timeout_closes_session_at_the_deadline() {
        let (store, _file) = temp_store(r#"{"Roles":{}}"#);
        let (tx, mut rx) = unbounded_channel();
        let clock: Arc<dyn Clock> = Arc::new(TokioVirtualClock::new());
        let session = SessionHandle::new(store, clock, reqwest::Client::new(), tx, 5.0);

        session.on_opened();
        assert_eq!(session.state(), SessionState::AwaitingAuth);

        tokio::time::advance(std::time::Duration::from_secs(5)).await;
        tokio::task::yield_now().await;

        assert_eq!(session.state(), SessionState::Closing);
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Text(t) if t.contains("Authentication timeout")));
        assert!(matches!(rx.try_recv().unwrap(), Outbound::Close { code: 1005, .. }));
    }
}
