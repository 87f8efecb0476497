use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use cairn::testing::MockStore;
use cairn::{with_retry_interval, ClientConfig, Value};
use cairn_registry::{CachedRegistry, Change, RegistryError};

fn config_for(store: &MockStore) -> ClientConfig {
    ClientConfig::new(store.addr()).with_options([with_retry_interval(Duration::from_millis(10))])
}

fn eventually(mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    check()
}

fn counter() -> (Arc<AtomicUsize>, impl Fn(&Change) + Send + Sync + 'static) {
    let count = Arc::new(AtomicUsize::new(0));
    let inner = count.clone();
    (count, move |_: &Change| {
        inner.fetch_add(1, Ordering::SeqCst);
    })
}

#[test]
fn initial_snapshot_fills_the_mirror() {
    let store = MockStore::start().unwrap();
    store.put("/app/db/port", "5432");
    store.put("/app/max-conns", "10");
    let rev = store.put("/other/x", "1");

    let cache = CachedRegistry::new("/app", config_for(&store)).unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.revision(), rev);
    assert_eq!(cache.get("/db/port"), Some(Value::Integer(5432)));
    assert_eq!(cache.get("max_conns"), Some(Value::Integer(10)));
    assert!(cache.contains_key("/max-conns"));
    assert!(!cache.contains_key("/x"));
}

#[test]
fn changes_are_classified_against_the_mirror() {
    let store = MockStore::start().unwrap();
    let cache = CachedRegistry::new("/app", config_for(&store)).unwrap();
    let (creates, on_create) = counter();
    let (updates, on_update) = counter();
    let (deletes, on_delete) = counter();
    cache.on_create("*", on_create).unwrap();
    cache.on_update("*", on_update).unwrap();
    cache.on_delete("*", on_delete).unwrap();

    cache.set("/x", "1").unwrap();
    assert!(eventually(|| creates.load(Ordering::SeqCst) == 1));
    assert_eq!(updates.load(Ordering::SeqCst), 0);
    assert_eq!(cache.get("/x"), Some(Value::Integer(1)));

    cache.set("/x", "2").unwrap();
    assert!(eventually(|| updates.load(Ordering::SeqCst) == 1));
    assert_eq!(creates.load(Ordering::SeqCst), 1);
    assert!(eventually(|| cache.get("/x") == Some(Value::Integer(2))));

    cache.delete("/x").unwrap();
    assert!(eventually(|| deletes.load(Ordering::SeqCst) == 1));
    assert!(eventually(|| cache.get("/x").is_none()));
    assert_eq!(cache.to_mapping(), Value::empty_mapping());
    assert_eq!(creates.load(Ordering::SeqCst), 1);
    assert_eq!(updates.load(Ordering::SeqCst), 1);
}

#[test]
fn exact_handlers_ignore_other_keys() {
    let store = MockStore::start().unwrap();
    let cache = CachedRegistry::new("/app", config_for(&store)).unwrap();
    let (hits, on_create) = counter();
    cache.on_create("/wanted", on_create).unwrap();

    cache.set("/other", "1").unwrap();
    cache.set("/wanted", "2").unwrap();
    assert!(eventually(|| cache.contains_key("/wanted")));
    assert!(cache.contains_key("/other"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn external_writes_reach_the_mirror() {
    let store = MockStore::start().unwrap();
    let cache = CachedRegistry::new("/app", config_for(&store)).unwrap();

    let rev = store.put("/app/feature/enabled", "true");
    assert!(eventually(|| cache.get("/feature/enabled") == Some(Value::Boolean(true))));
    assert!(eventually(|| cache.revision() >= rev));
    assert_eq!(
        cache.to_mapping(),
        Value::mapping([("feature", Value::mapping([("enabled", Value::Boolean(true))]))])
    );

    let mut pairs = Vec::new();
    cache.each_pair(|key, value| pairs.push((key.to_string(), value.clone())));
    assert_eq!(pairs, vec![("/feature/enabled".to_string(), Value::Boolean(true))]);
}

#[test]
fn mirror_survives_a_dropped_watch_connection() {
    let store = MockStore::start().unwrap();
    let cache = CachedRegistry::new("/app", config_for(&store)).unwrap();

    store.put("/app/a", "1");
    assert!(eventually(|| cache.contains_key("/a")));

    store.drop_connections();
    store.put("/app/b", "2");
    assert!(eventually(|| cache.contains_key("/b")));
}

#[test]
fn finalize_is_prompt_and_idempotent() {
    let store = MockStore::start().unwrap();
    store.put("/app/x", "1");
    let cache = CachedRegistry::new("/app", config_for(&store)).unwrap();

    let started = Instant::now();
    cache.finalize();
    cache.finalize();
    assert!(started.elapsed() < Duration::from_secs(2));

    // The mirror stays readable; writes are refused.
    assert_eq!(cache.get("/x"), Some(Value::Integer(1)));
    assert!(matches!(cache.set("/y", "2"), Err(RegistryError::Finalized)));
    assert!(matches!(
        cache.on_create("*", |_| {}),
        Err(RegistryError::Finalized)
    ));
}

#[test]
fn non_utf8_values_do_not_stall_the_mirror() {
    let store = MockStore::start().unwrap();
    let cache = CachedRegistry::new("/app", config_for(&store)).unwrap();

    store.put_bytes("/app/bad", &[0xff, 0xfe]);
    store.put("/app/good", "1");
    assert!(eventually(|| cache.get("/good") == Some(Value::Integer(1))));
    assert!(cache.contains_key("/bad"));

    // A fresh mirror must also load a snapshot holding the bad value.
    let fresh = CachedRegistry::new("/app", config_for(&store)).unwrap();
    assert!(fresh.contains_key("/bad"));
    assert_eq!(fresh.get("/good"), Some(Value::Integer(1)));
    store.put("/app/later", "2");
    assert!(eventually(|| fresh.contains_key("/later")));
}
