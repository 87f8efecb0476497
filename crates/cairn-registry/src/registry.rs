use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use cairn::value::{decode, encode};
use cairn::{is_response_error, ClientConfig, ErrorCode, Event, StoreClient, Value, CLOBBER};
use parking_lot::Mutex;
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::scope::Scope;
use crate::tree;
use crate::watcher::{Change, ChangeKind, Handler, Handlers, WatchLoop};

/// Typed key-value view of a store subtree.
///
/// Every read goes to the store. Each `on_update`/`on_delete` registration
/// runs its own watch loop on a dedicated connection.
pub struct Registry {
    scope: Scope,
    client: StoreClient,
    loops: Mutex<Vec<WatchLoop>>,
    finalized: AtomicBool,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("root", &self.scope.root())
            .field("watches", &self.loops.lock().len())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

impl Registry {
    pub fn new(root: &str, config: ClientConfig) -> RegistryResult<Self> {
        let scope = Scope::new(root)?;
        let client = StoreClient::connect(config)?;
        Ok(Self {
            scope,
            client,
            loops: Mutex::new(Vec::new()),
            finalized: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &str {
        self.scope.root()
    }

    pub fn client(&self) -> &StoreClient {
        &self.client
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Reads and decodes `key`; `None` when the store reports it absent.
    pub fn get(&self, key: &str) -> RegistryResult<Option<Value>> {
        self.ensure_live()?;
        let (raw, rev) = self.client.read(&self.scope.store_path(key), None)?;
        Ok((rev > 0).then(|| decode(&raw)))
    }

    pub fn set(&self, key: &str, value: impl Into<Value>) -> RegistryResult<()> {
        self.ensure_live()?;
        let value = value.into();
        self.client
            .write(&self.scope.store_path(key), &encode(&value), CLOBBER)?;
        Ok(())
    }

    /// Deletes `key`. Deleting an absent key succeeds.
    pub fn delete(&self, key: &str) -> RegistryResult<()> {
        self.ensure_live()?;
        match self.client.delete(&self.scope.store_path(key), CLOBBER) {
            Ok(()) => Ok(()),
            Err(err) if is_response_error(&err, ErrorCode::Noent) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Visits every leaf under the root with its decoded value.
    pub fn each_pair<F>(&self, mut f: F) -> RegistryResult<()>
    where
        F: FnMut(&str, Value),
    {
        self.ensure_live()?;
        self.client.walk_with(&self.scope.subtree(), None, 0, |ev| {
            if let (Some(key), Some(raw)) = (self.scope.key_of(&ev.path), ev.value) {
                f(&key, decode(&raw));
            }
        })?;
        Ok(())
    }

    /// Snapshot of the subtree as nested mappings.
    pub fn to_mapping(&self) -> RegistryResult<Value> {
        let mut pairs = Vec::new();
        self.each_pair(|key, value| pairs.push((key.to_string(), value)))?;
        Ok(tree::nest(pairs))
    }

    /// Calls `handler` whenever a key matching `pattern` is written.
    pub fn on_update<F>(&self, pattern: &str, handler: F) -> RegistryResult<()>
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.watch(ChangeKind::Update, pattern, Arc::new(handler))
    }

    /// Calls `handler` whenever a key matching `pattern` is deleted.
    pub fn on_delete<F>(&self, pattern: &str, handler: F) -> RegistryResult<()>
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.watch(ChangeKind::Delete, pattern, Arc::new(handler))
    }

    /// Stops every watch loop and closes the connection. Idempotent.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        let loops: Vec<WatchLoop> = self.loops.lock().drain(..).collect();
        for watch in &loops {
            watch.stop();
        }
        self.client.close();
        debug!(root = %self.scope.root(), watches = loops.len(), "registry finalized");
    }

    fn watch(&self, kind: ChangeKind, pattern: &str, handler: Handler) -> RegistryResult<()> {
        self.ensure_live()?;
        let from_rev = self.client.current_revision()? + 1;

        let handlers = Handlers::default();
        handlers.add(kind, pattern, handler);
        let scope = self.scope.clone();
        let dispatch = move |ev: Event| {
            let Some(key) = scope.key_of(&ev.path) else {
                return;
            };
            let change = Change {
                kind: if ev.is_delete() {
                    ChangeKind::Delete
                } else {
                    ChangeKind::Update
                },
                key,
                value: ev.value.as_deref().map(decode),
                rev: ev.rev,
            };
            handlers.fire(&change);
        };

        let watch = WatchLoop::spawn(
            self.client.config().clone(),
            self.scope.subtree(),
            from_rev,
            dispatch,
        )?;
        debug!(root = %self.scope.root(), pattern, ?kind, from_rev, "registry watch registered");

        let mut loops = self.loops.lock();
        if self.is_finalized() {
            drop(loops);
            watch.stop();
            return Err(RegistryError::Finalized);
        }
        loops.push(watch);
        Ok(())
    }

    fn ensure_live(&self) -> RegistryResult<()> {
        if self.is_finalized() {
            Err(RegistryError::Finalized)
        } else {
            Ok(())
        }
    }
}

impl Drop for Registry {
    fn drop(&mut self) {
        self.finalize();
    }
}
