//!
//! Store
//! ------
//! Owns the in-memory document, projects reads through the `AccessEngine`,
//! and runs the coalesced background persister described in `spec.md`
//! §4.2. Grounded on `clarium::storage::Store`/`SharedStore`
//! (`src/storage.rs`) for the `Arc<Mutex<...>>`-wrapped handle shape; the
//! coalescing/generation machinery itself has no teacher equivalent and is
//! built directly from the spec.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::access::{self, RoleSet};
use crate::clock::{CancelToken, Clock, Scheduler, Timestamp};
use crate::config::Config;
use crate::error::AppError;

type SubscriberCallback = Arc<dyn Fn(Value) + Send + Sync>;

struct Subscriber {
    path: Vec<String>,
    roles_held: RoleSet,
    callback: SubscriberCallback,
}

struct Inner {
    document: Value,
    mobilized: bool,
    file_path: Option<PathBuf>,
    clock: Option<Arc<dyn Clock>>,
    min_save_interval: f64,

    dirty: bool,
    saving: bool,
    next_save_time: Timestamp,
    generation: u64,
    pending_save_token: Option<CancelToken>,

    subscribers: HashMap<u64, Subscriber>,
    next_subscriber_token: u64,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            document: Value::Null,
            mobilized: false,
            file_path: None,
            clock: None,
            min_save_interval: 60.0,
            dirty: false,
            saving: false,
            next_save_time: 0.0,
            generation: 0,
            pending_save_token: None,
            subscribers: HashMap::new(),
            next_subscriber_token: 1,
        }
    }
}

/// Cheaply-cloneable handle to a `Store`. `AppState` and every WS `Session`
/// hold a clone.
#[derive(Clone)]
pub struct StoreHandle(Arc<Mutex<Inner>>);

/// A live subscription; cancel it to erase it from the Store's registry.
pub struct Subscription {
    token: u64,
    store: StoreHandle,
}

impl Subscription {
    pub fn cancel(self) {
        self.store.0.lock().subscribers.remove(&self.token);
    }
}

impl Default for StoreHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl StoreHandle {
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(Inner::default())))
    }

    /// Load `path`, decode it as JSON, read `Configuration.MinSaveInterval`,
    /// bind `clock`, mark mobilized, bump the generation counter.
    /// Idempotent if already mobilized.
    pub fn mobilize<P: AsRef<Path>>(&self, path: P, clock: Arc<dyn Clock>) -> Result<bool, AppError> {
        let mut inner = self.0.lock();
        if inner.mobilized {
            return Ok(true);
        }
        let path = path.as_ref().to_path_buf();
        let text = std::fs::read_to_string(&path).map_err(|e| {
            AppError::setup("store_unreadable".to_string(), format!("failed to read {}: {e}", path.display()))
        })?;
        let document: Value = serde_json::from_str(&text).map_err(|e| {
            AppError::setup("store_undecodable".to_string(), format!("failed to parse {}: {e}", path.display()))
        })?;

        let cfg = Config::from_document(&document);
        inner.document = document;
        inner.min_save_interval = cfg.min_save_interval;
        inner.file_path = Some(path);
        inner.clock = Some(clock);
        inner.mobilized = true;
        inner.generation += 1;
        inner.dirty = false;
        inner.saving = false;
        inner.next_save_time = 0.0;
        debug!(generation = inner.generation, "store mobilized");
        Ok(true)
    }

    /// Cancel any pending save, clear dirty, detach the clock, mark
    /// un-mobilized. Safe to call when already un-mobilized.
    pub fn demobilize(&self) {
        let mut inner = self.0.lock();
        if let Some(token) = inner.pending_save_token.take() {
            token.cancel();
        }
        inner.dirty = false;
        inner.saving = false;
        inner.clock = None;
        inner.mobilized = false;
    }

    pub fn is_mobilized(&self) -> bool {
        self.0.lock().mobilized
    }

    /// Run the `AccessEngine` under the lock and return the projection.
    pub fn get(&self, path: &[String], roles_held: &RoleSet) -> Value {
        let inner = self.0.lock();
        access::get(&inner.document, path, roles_held)
    }

    /// Register a subscription, synchronously deliver its initial
    /// projection *outside* the Store lock, and return a cancel handle.
    pub fn subscribe<F>(&self, path: Vec<String>, roles_held: RoleSet, on_update: F) -> Subscription
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        let callback: SubscriberCallback = Arc::new(on_update);
        let (token, initial) = {
            let mut inner = self.0.lock();
            let token = inner.next_subscriber_token;
            inner.next_subscriber_token += 1;
            let initial = access::get(&inner.document, &path, &roles_held);
            inner.subscribers.insert(
                token,
                Subscriber { path, roles_held, callback: callback.clone() },
            );
            (token, initial)
        };
        callback(initial);
        Subscription { token, store: self.clone() }
    }

    /// Apply a mutation to the document and arm the coalesced saver. Every
    /// mutation path (including the reserved `Set` operation `spec.md`
    /// §4.2 describes but does not expose in this revision) funnels through
    /// here so the "any mutation arms the saver" invariant holds. Also
    /// fans the new projection out to every subscriber whose path the
    /// mutation may have touched — the update side of the subscription
    /// contract `spec.md` §9 flags as unobserved in the original sources.
    pub fn touch<M: FnOnce(&mut Value)>(&self, mutate: M) {
        let notifications: Vec<(SubscriberCallback, Value)> = {
            let mut inner = self.0.lock();
            mutate(&mut inner.document);
            inner
                .subscribers
                .values()
                .map(|sub| {
                    let projected = access::get(&inner.document, &sub.path, &sub.roles_held);
                    (sub.callback.clone(), projected)
                })
                .collect()
        };
        for (callback, value) in notifications {
            callback(value);
        }
        self.schedule_save();
    }

    /// Coalesced save: arm a scheduled write no sooner than
    /// `MinSaveInterval` after the previous one. See `spec.md` §4.2.
    fn schedule_save(&self) {
        let (clock, next, generation) = {
            let mut inner = self.0.lock();
            if !inner.mobilized {
                return;
            }
            let Some(clock) = inner.clock.clone() else { return };
            let now = clock.now();
            let next = inner.next_save_time.max(now);
            if inner.saving {
                inner.dirty = true;
                return;
            }
            inner.saving = true;
            inner.dirty = false;
            let generation = inner.generation;
            inner.next_save_time = next + inner.min_save_interval;
            (clock, next, generation)
        };

        let handle = self.clone();
        let token = Scheduler::new().schedule_at(clock, next, move || {
            handle.run_scheduled_save(generation);
        });

        let mut inner = self.0.lock();
        // Only the most recently armed save's token is worth keeping —
        // demobilize only needs to cancel whichever one is still pending.
        if inner.generation == generation {
            inner.pending_save_token = Some(token);
        } else {
            token.cancel();
        }
    }

    fn run_scheduled_save(&self, generation: u64) {
        let rearm = {
            let mut inner = self.0.lock();
            if inner.generation != generation || !inner.mobilized {
                // A stale callback from a prior incarnation: no-op (P6).
                return;
            }
            if let Err(e) = write_document(&inner.file_path, &inner.document) {
                error!("store save failed: {e}");
            }
            inner.saving = false;
            inner.pending_save_token = None;
            inner.dirty
        };
        if rearm {
            self.schedule_save();
        }
    }
}

/// Write the document to `path`'s parent via a temp file then rename into
/// place, so a crash mid-write cannot corrupt the prior good copy (resolves
/// the crash-safety open question in `spec.md` §9).
fn write_document(path: &Option<PathBuf>, document: &Value) -> Result<(), AppError> {
    let Some(path) = path else {
        warn!("save requested with no backing file path; skipping");
        return Ok(());
    };
    let pretty = serde_json::to_string_pretty(document)
        .map_err(|e| AppError::persistence("encode_failed".to_string(), e.to_string()))?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp_path = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("store")
    ));
    std::fs::write(&tmp_path, pretty)
        .map_err(|e| AppError::persistence("write_failed".to_string(), format!("{}: {e}", tmp_path.display())))?;
    std::fs::rename(&tmp_path, path)
        .map_err(|e| AppError::persistence("rename_failed".to_string(), format!("{}: {e}", path.display())))?;
    Ok(())
}
