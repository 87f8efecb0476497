pub mod cached;
pub mod error;
pub mod registry;
mod scope;
pub mod tree;
pub mod watcher;

pub use cached::CachedRegistry;
pub use error::{RegistryError, RegistryResult};
pub use registry::Registry;
pub use watcher::{Change, ChangeKind, Handler, WatchLoop};

/// Whether a handler registered for `pattern` wants changes to `key`.
///
/// `key` is a logical path relative to the registry root. `"*"` matches
/// everything under the root; any other pattern must name the key exactly.
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    pattern == "*" || cairn::path::normalize_key(pattern) == key
}
