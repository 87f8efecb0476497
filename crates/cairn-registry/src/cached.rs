//! Registry backed by a complete local mirror.
//!
//! The mirror is filled by a walk pinned to one revision and kept current by a
//! single watch loop started right after that revision, so no change falls
//! between the snapshot and the watch. Writes go straight to the store; the
//! mirror only ever changes when the watch reports them back.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use cairn::value::{decode, encode};
use cairn::{is_response_error, ClientConfig, ErrorCode, Event, StoreClient, Value, CLOBBER};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::error::{RegistryError, RegistryResult};
use crate::scope::Scope;
use crate::tree;
use crate::watcher::{Change, ChangeKind, Handlers, WatchLoop};

struct Mirror {
    scope: Scope,
    entries: RwLock<BTreeMap<String, Value>>,
    revision: AtomicI64,
    handlers: Handlers,
}

impl Mirror {
    /// Classifies a change against the mirror, fires its handlers, then
    /// applies it.
    fn apply(&self, ev: Event) {
        let Some(key) = self.scope.key_of(&ev.path) else {
            return;
        };
        let value = ev.value.as_deref().map(decode);
        let kind = match &value {
            None => ChangeKind::Delete,
            Some(_) if self.entries.read().contains_key(&key) => ChangeKind::Update,
            Some(_) => ChangeKind::Create,
        };
        debug!(key = %key, ?kind, rev = ev.rev, "cache change");

        let change = Change {
            kind,
            key,
            value,
            rev: ev.rev,
        };
        self.handlers.fire(&change);

        let mut entries = self.entries.write();
        match change.value {
            Some(value) => {
                entries.insert(change.key, value);
            }
            None => {
                entries.remove(&change.key);
            }
        }
        self.revision.fetch_max(change.rev, Ordering::SeqCst);
    }
}

pub struct CachedRegistry {
    client: StoreClient,
    mirror: Arc<Mirror>,
    watch: Mutex<Option<WatchLoop>>,
    finalized: AtomicBool,
}

impl std::fmt::Debug for CachedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedRegistry")
            .field("root", &self.mirror.scope.root())
            .field("entries", &self.len())
            .field("revision", &self.revision())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

impl CachedRegistry {
    /// Loads the subtree under `root` and starts mirroring its changes.
    pub fn new(root: &str, config: ClientConfig) -> RegistryResult<Self> {
        let scope = Scope::new(root)?;
        let client = StoreClient::connect(config)?;

        let (rev, events) = client.snapshot(&scope.subtree())?;
        let mut entries = BTreeMap::new();
        for ev in events {
            if let (Some(key), Some(raw)) = (scope.key_of(&ev.path), ev.value) {
                entries.insert(key, decode(&raw));
            }
        }
        debug!(root = %scope.root(), rev, entries = entries.len(), "cache loaded");

        let mirror = Arc::new(Mirror {
            scope,
            entries: RwLock::new(entries),
            revision: AtomicI64::new(rev),
            handlers: Handlers::default(),
        });

        let dispatch = {
            let mirror = mirror.clone();
            move |ev: Event| mirror.apply(ev)
        };
        let watch = WatchLoop::spawn(
            client.config().clone(),
            mirror.scope.subtree(),
            rev + 1,
            dispatch,
        )?;

        Ok(Self {
            client,
            mirror,
            watch: Mutex::new(Some(watch)),
            finalized: AtomicBool::new(false),
        })
    }

    pub fn root(&self) -> &str {
        self.mirror.scope.root()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    /// Last revision applied to the mirror.
    pub fn revision(&self) -> i64 {
        self.mirror.revision.load(Ordering::SeqCst)
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.mirror
            .entries
            .read()
            .get(&cairn::path::normalize_key(key))
            .cloned()
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.mirror
            .entries
            .read()
            .contains_key(&cairn::path::normalize_key(key))
    }

    pub fn len(&self) -> usize {
        self.mirror.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirror.entries.read().is_empty()
    }

    /// Writes through to the store. The mirror picks the value up from the
    /// watch, not from this call.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> RegistryResult<()> {
        self.ensure_live()?;
        let value = value.into();
        self.client.write(
            &self.mirror.scope.store_path(key),
            &encode(&value),
            CLOBBER,
        )?;
        Ok(())
    }

    pub fn delete(&self, key: &str) -> RegistryResult<()> {
        self.ensure_live()?;
        match self
            .client
            .delete(&self.mirror.scope.store_path(key), CLOBBER)
        {
            Ok(()) => Ok(()),
            Err(err) if is_response_error(&err, ErrorCode::Noent) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Visits every mirrored entry in key order.
    pub fn each_pair<F>(&self, mut f: F)
    where
        F: FnMut(&str, &Value),
    {
        for (key, value) in self.mirror.entries.read().iter() {
            f(key, value);
        }
    }

    pub fn to_mapping(&self) -> Value {
        let pairs: Vec<(String, Value)> = self
            .mirror
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        tree::nest(pairs)
    }

    pub fn on_create<F>(&self, pattern: &str, handler: F) -> RegistryResult<()>
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.register(ChangeKind::Create, pattern, handler)
    }

    pub fn on_update<F>(&self, pattern: &str, handler: F) -> RegistryResult<()>
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.register(ChangeKind::Update, pattern, handler)
    }

    pub fn on_delete<F>(&self, pattern: &str, handler: F) -> RegistryResult<()>
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.register(ChangeKind::Delete, pattern, handler)
    }

    /// Stops the watch loop and closes the connection. The mirror stays
    /// readable. Idempotent.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(watch) = self.watch.lock().take() {
            watch.stop();
        }
        self.client.close();
        debug!(root = %self.root(), "cache finalized");
    }

    fn register<F>(&self, kind: ChangeKind, pattern: &str, handler: F) -> RegistryResult<()>
    where
        F: Fn(&Change) + Send + Sync + 'static,
    {
        self.ensure_live()?;
        self.mirror.handlers.add(kind, pattern, Arc::new(handler));
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

impl Drop for CachedRegistry {
    fn drop(&mut self) {
        self.finalize();
    }
}
