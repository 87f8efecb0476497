use cairn::path;

/// Maps registry keys to store paths under a root and back.
#[derive(Debug, Clone)]
pub(crate) struct Scope {
    logical_root: String,
}

impl Scope {
    pub(crate) fn new(root: &str) -> cairn::Result<Self> {
        path::validate(root)?;
        Ok(Self {
            logical_root: path::logical(root.trim_end_matches('/')),
        })
    }

    pub(crate) fn root(&self) -> &str {
        if self.logical_root.is_empty() {
            "/"
        } else {
            &self.logical_root
        }
    }

    pub(crate) fn store_path(&self, key: &str) -> String {
        path::to_store(&path::join(&self.logical_root, &path::normalize_key(key)))
    }

    /// Walk/watch pattern covering the whole subtree.
    pub(crate) fn subtree(&self) -> String {
        path::to_store(&path::join(&self.logical_root, "**"))
    }

    /// Logical key for a path reported by the store, if it lies under the root.
    pub(crate) fn key_of(&self, store_path: &str) -> Option<String> {
        let logical = path::from_store(store_path);
        path::relative(&self.logical_root, &logical)
            .filter(|key| !key.is_empty())
            .map(str::to_string)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_map_to_canonical_store_paths() {
        let scope = Scope::new("/svc_a/").unwrap();
        assert_eq!(scope.root(), "/svc_a");
        assert_eq!(scope.store_path("max_conns"), "/svc-a/max-conns");
        assert_eq!(scope.store_path("/db/pool_size"), "/svc-a/db/pool-size");
        assert_eq!(scope.subtree(), "/svc-a/**");
        assert_eq!(scope.key_of("/svc-a/max-conns").as_deref(), Some("/max_conns"));
        assert_eq!(scope.key_of("/other/x"), None);
        assert_eq!(scope.key_of("/svc-a"), None);
    }

    #[test]
    fn root_scope_covers_everything() {
        let scope = Scope::new("/").unwrap();
        assert_eq!(scope.root(), "/");
        assert_eq!(scope.store_path("x"), "/x");
        assert_eq!(scope.subtree(), "/**");
        assert_eq!(scope.key_of("/a/b").as_deref(), Some("/a/b"));
        assert!(Scope::new("relative").is_err());
    }
}
