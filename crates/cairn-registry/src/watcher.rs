//! Background watch loops.
//!
//! A [`WatchLoop`] owns its own [`StoreClient`]. A producer thread blocks in
//! `wait` and forwards every change over a channel to a dispatcher thread that
//! runs the caller's callback, so slow handlers never hold up the socket.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use cairn::{ClientConfig, Event, StoreClient, Value};
use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{RegistryError, RegistryResult};
use crate::pattern_matches;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

/// A change delivered to registry handlers.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    /// Logical key relative to the registry root, with a leading `/`.
    pub key: String,
    /// Decoded value; `None` for deletes.
    pub value: Option<Value>,
    pub rev: i64,
}

pub type Handler = Arc<dyn Fn(&Change) + Send + Sync>;

/// Handlers keyed by change kind and pattern.
#[derive(Default)]
pub(crate) struct Handlers {
    entries: RwLock<Vec<(ChangeKind, String, Handler)>>,
}

impl Handlers {
    pub(crate) fn add(&self, kind: ChangeKind, pattern: &str, handler: Handler) {
        self.entries.write().push((kind, pattern.to_string(), handler));
    }

    /// Runs every handler matching the change. The handler list is copied out
    /// first so handlers may register more handlers.
    pub(crate) fn fire(&self, change: &Change) {
        let matching: Vec<Handler> = self
            .entries
            .read()
            .iter()
            .filter(|(kind, pattern, _)| {
                *kind == change.kind && pattern_matches(pattern, &change.key)
            })
            .map(|(_, _, handler)| handler.clone())
            .collect();
        for handler in matching {
            handler(change);
        }
    }
}

pub struct WatchLoop {
    client: Arc<StoreClient>,
    pattern: String,
    producer: Mutex<Option<JoinHandle<()>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for WatchLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatchLoop")
            .field("pattern", &self.pattern)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl WatchLoop {
    /// Starts watching `pattern` from `from_rev`, handing each change to
    /// `dispatch` in revision order.
    pub fn spawn<F>(
        config: ClientConfig,
        pattern: impl Into<String>,
        from_rev: i64,
        mut dispatch: F,
    ) -> RegistryResult<Self>
    where
        F: FnMut(Event) + Send + 'static,
    {
        let pattern = pattern.into();
        let client = Arc::new(StoreClient::new(config));
        let (tx, rx) = crossbeam_channel::unbounded::<Event>();

        let dispatcher = thread::Builder::new()
            .name("cairn-watch-dispatch".into())
            .spawn(move || {
                for ev in rx.iter() {
                    dispatch(ev);
                }
            })
            .map_err(RegistryError::Spawn)?;

        let producer = {
            let client = client.clone();
            let pattern = pattern.clone();
            thread::Builder::new()
                .name("cairn-watch".into())
                .spawn(move || produce(&client, &pattern, from_rev, tx))
        };
        let producer = match producer {
            Ok(handle) => handle,
            Err(err) => {
                // The sender went down with the closure, so the dispatcher exits.
                let _ = dispatcher.join();
                return Err(RegistryError::Spawn(err));
            }
        };

        Ok(Self {
            client,
            pattern,
            producer: Mutex::new(Some(producer)),
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub fn is_stopped(&self) -> bool {
        self.client.is_closed()
    }

    /// Closes the loop's connection and joins both threads. Called from a
    /// handler, the dispatcher thread is left to finish on its own. Idempotent.
    pub fn stop(&self) {
        self.client.close();
        let current = thread::current().id();
        for slot in [&self.producer, &self.dispatcher] {
            let Some(handle) = slot.lock().take() else {
                continue;
            };
            if handle.thread().id() == current {
                continue;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for WatchLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn produce(client: &StoreClient, pattern: &str, from_rev: i64, tx: Sender<Event>) {
    debug!(pattern, from_rev, "watch loop started");
    let retry_interval = client.config().retry_interval;
    for next in client.watch(pattern, from_rev) {
        match next {
            Ok(ev) => {
                if tx.send(ev).is_err() {
                    break;
                }
            }
            Err(err) => {
                warn!(pattern, error = %err, "watch loop error; retrying");
                thread::sleep(retry_interval);
            }
        }
    }
    debug!(pattern, "watch loop stopped");
}
