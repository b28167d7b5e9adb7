//!
//! WS Listener
//! -----------
//! Upgrade handling at `/ws`: construct the WebSocket, register the new
//! Session in a connection registry keyed by a monotonic connection id,
//! and run the per-connection read loop. Closing is linger-then-erase so
//! in-flight frames and late outbound-transaction callbacks find a nulled
//! but still-present slot.
//!
//! Grounded on `clarium::server::ws_handler`'s `WebSocketUpgrade` /
//! `on_upgrade` shape (`src/server.rs`) for the handshake itself; the
//! registry and linger-drop machinery have no direct teacher counterpart
//! and are modeled on the generation-guarded cooperative shutdown used by
//! the GraphStore GC ticker in `server::run_with_ports`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc::unbounded_channel;
use tracing::debug;

use crate::clock::{Clock, Scheduler, Timestamp};
use crate::service::AppState;
use crate::session::{Outbound, SessionHandle};

#[derive(Debug, Clone, Copy)]
pub struct WsConfig {
    pub max_frame_size: usize,
    pub authentication_timeout: Timestamp,
    pub close_linger: Timestamp,
}

struct Slot {
    session: SessionHandle,
    active: Arc<AtomicBool>,
}

/// The connection registry. Cheap to clone; every field is itself `Arc`-backed.
#[derive(Clone)]
pub struct WsListener {
    connections: Arc<Mutex<HashMap<u64, Option<Slot>>>>,
    next_id: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
    pub config: WsConfig,
}

impl WsListener {
    pub fn new(clock: Arc<dyn Clock>, config: WsConfig) -> Self {
        Self { connections: Arc::new(Mutex::new(HashMap::new())), next_id: Arc::new(AtomicU64::new(0)), clock, config }
    }

    fn register(&self, session: SessionHandle) -> (u64, Arc<AtomicBool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let active = Arc::new(AtomicBool::new(true));
        self.connections.lock().insert(id, Some(Slot { session, active: active.clone() }));
        (id, active)
    }

    /// Null the slot, deliver `OnClosed` once, and schedule the erase.
    fn begin_close(&self, id: u64, session: &SessionHandle) {
        let slot = self.connections.lock().get_mut(&id).and_then(Option::take);
        let Some(slot) = slot else {
            return;
        };
        slot.active.store(false, Ordering::SeqCst);
        session.mark_closed();

        let listener = self.clone();
        let deadline = self.clock.now() + self.config.close_linger;
        Scheduler::new().schedule_at(self.clock.clone(), deadline, move || {
            listener.erase(id);
        });
    }

    fn erase(&self, id: u64) {
        if let Some(slot) = self.connections.lock().remove(&id).flatten() {
            slot.session.mark_dropped();
        }
    }

    /// Close every live connection; used by the service shutdown hook.
    pub fn close_all(&self) {
        let live: Vec<(u64, SessionHandle)> = {
            let map = self.connections.lock();
            map.iter()
                .filter_map(|(id, slot)| slot.as_ref().map(|s| (*id, s.session.clone())))
                .collect()
        };
        for (id, session) in live {
            self.begin_close(id, &session);
        }
    }

    pub fn live_connection_count(&self) -> usize {
        self.connections.lock().values().filter(|s| s.is_some()).count()
    }
}

/// Axum handler for `GET /ws`. Performs the upgrade handshake manually
/// (rather than taking `WebSocketUpgrade` as a plain extractor) so a
/// failed handshake can be reported as `426 Upgrade Required` instead of
/// Axum's default rejection body.
pub async fn ws_handler(State(state): State<AppState>, request: Request) -> Response {
    let (mut parts, _body) = request.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(upgrade) => {
            let max_frame_size = state.ws.config.max_frame_size;
            upgrade
                .max_frame_size(max_frame_size)
                .on_upgrade(move |socket| handle_socket(state, socket))
        }
        Err(_) => {
            let mut response = StatusCode::from_u16(426).unwrap().into_response();
            response.headers_mut().insert(header::UPGRADE, "websocket".parse().unwrap());
            response
        }
    }
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = unbounded_channel::<Outbound>();

    let session = SessionHandle::new(
        state.store.clone(),
        state.clock.clone(),
        state.http.clone(),
        outbound_tx,
        state.ws.config.authentication_timeout,
    );
    let (connection_id, active) = state.ws.register(session.clone());
    session.on_opened();

    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let result = match message {
                Outbound::Text(text) => sink.send(Message::Text(text.into())).await,
                Outbound::Close { code, reason } => {
                    let frame = CloseFrame { code, reason: reason.into() };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    while active.load(Ordering::SeqCst) {
        let Some(frame) = stream.next().await else { break };
        let message = match frame {
            Ok(m) => m,
            Err(e) => {
                debug!("ws stream error: {e}");
                break;
            }
        };
        match message {
            Message::Text(text) => session.handle_text(&text).await,
            Message::Close(_) => break,
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    state.ws.begin_close(connection_id, &session);
    writer.abort();
}
