use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use cairn::testing::MockStore;
use cairn::{with_retry_interval, ClientConfig, Value};
use cairn_registry::{Change, ChangeKind, Registry, RegistryError};

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

fn recorder() -> (Arc<Mutex<Vec<Change>>>, impl Fn(&Change) + Send + Sync + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, move |change: &Change| sink.lock().unwrap().push(change.clone()))
}

#[test]
fn set_get_delete_on_fresh_root() {
    let store = MockStore::start().unwrap();
    let registry = Registry::new("/app", config_for(&store)).unwrap();

    registry.set("/x", "hello").unwrap();
    assert_eq!(registry.get("/x").unwrap(), Some(Value::from("hello")));

    registry.delete("/x").unwrap();
    assert_eq!(registry.get("/x").unwrap(), None);
    registry.delete("/x").unwrap();
}

#[test]
fn keys_are_canonicalized_and_values_typed() {
    let store = MockStore::start().unwrap();
    let registry = Registry::new("/svc_a", config_for(&store)).unwrap();

    registry.set("max_conns", Value::Integer(10)).unwrap();
    assert_eq!(store.get("/svc-a/max-conns").as_deref(), Some("10"));
    assert_eq!(registry.get("/max_conns").unwrap(), Some(Value::Integer(10)));
    assert_eq!(registry.get("max-conns").unwrap(), Some(Value::Integer(10)));

    let nested = Value::mapping([
        ("a", Value::Integer(1)),
        ("b", Value::mapping([("c", Value::Integer(2))])),
    ]);
    registry.set("/limits", nested.clone()).unwrap();
    assert_eq!(
        store.get("/svc-a/limits").as_deref(),
        Some(r#"{"a":"1","b":{"c":"2"}}"#)
    );
    assert_eq!(registry.get("/limits").unwrap(), Some(nested));
}

#[test]
fn to_mapping_nests_the_subtree() {
    let store = MockStore::start().unwrap();
    store.put("/app/db/host", "localhost");
    store.put("/app/db/port", "5432");
    store.put("/app/name", ":svc");
    store.put("/other/ignored", "1");
    let registry = Registry::new("/app", config_for(&store)).unwrap();

    let mut keys = Vec::new();
    registry.each_pair(|key, _| keys.push(key.to_string())).unwrap();
    assert_eq!(keys, vec!["/db/host", "/db/port", "/name"]);

    assert_eq!(
        registry.to_mapping().unwrap(),
        Value::mapping([
            (
                "db",
                Value::mapping([
                    ("host", Value::from("localhost")),
                    ("port", Value::Integer(5432)),
                ]),
            ),
            ("name", Value::symbol("svc")),
        ])
    );
}

#[test]
fn exact_update_handlers_fire_only_for_their_key() {
    let store = MockStore::start().unwrap();
    let registry = Registry::new("/app", config_for(&store)).unwrap();
    let (on_x, record_x) = recorder();
    let (on_y, record_y) = recorder();
    registry.on_update("/x", record_x).unwrap();
    registry.on_update("/y", record_y).unwrap();

    registry.set("/x", "v").unwrap();
    assert!(eventually(|| on_x.lock().unwrap().len() == 1));

    // Give the other loop time to (wrongly) deliver.
    thread::sleep(Duration::from_millis(200));
    let seen = on_x.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].key, "/x");
    assert_eq!(seen[0].kind, ChangeKind::Update);
    assert_eq!(seen[0].value, Some(Value::from("v")));
    assert!(seen[0].rev > 0);
    assert!(on_y.lock().unwrap().is_empty());
}

#[test]
fn wildcard_handlers_see_every_key() {
    let store = MockStore::start().unwrap();
    let registry = Registry::new("/app", config_for(&store)).unwrap();
    let (seen, record) = recorder();
    registry.on_update("*", record).unwrap();

    registry.set("/a", "1").unwrap();
    registry.set("/b/c", "2").unwrap();
    store.put("/outside", "3");

    assert!(eventually(|| seen.lock().unwrap().len() == 2));
    let keys: Vec<String> = seen.lock().unwrap().iter().map(|c| c.key.clone()).collect();
    assert_eq!(keys, vec!["/a", "/b/c"]);
}

#[test]
fn delete_handlers_fire_on_delete() {
    let store = MockStore::start().unwrap();
    let registry = Registry::new("/app", config_for(&store)).unwrap();
    registry.set("/x", "1").unwrap();

    let (updates, record_update) = recorder();
    let (deletes, record_delete) = recorder();
    registry.on_update("/x", record_update).unwrap();
    registry.on_delete("/x", record_delete).unwrap();

    registry.delete("/x").unwrap();
    assert!(eventually(|| deletes.lock().unwrap().len() == 1));
    let change = deletes.lock().unwrap()[0].clone();
    assert_eq!(change.kind, ChangeKind::Delete);
    assert_eq!(change.value, None);
    // The write before registration is not replayed.
    assert!(updates.lock().unwrap().is_empty());
}

#[test]
fn finalize_stops_loops_and_is_idempotent() {
    let store = MockStore::start().unwrap();
    let registry = Registry::new("/app", config_for(&store)).unwrap();
    let (seen, record) = recorder();
    registry.on_update("*", record).unwrap();

    let started = Instant::now();
    registry.finalize();
    registry.finalize();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(registry.is_finalized());

    assert!(matches!(registry.set("/x", "1"), Err(RegistryError::Finalized)));
    assert!(matches!(
        registry.on_update("/x", |_| {}),
        Err(RegistryError::Finalized)
    ));

    store.put("/app/x", "1");
    thread::sleep(Duration::from_millis(100));
    assert!(seen.lock().unwrap().is_empty());
    assert!(eventually(|| store.connection_count() == 0));
}

#[test]
fn finalize_from_a_handler_does_not_deadlock() {
    let store = MockStore::start().unwrap();
    let registry = Arc::new(Registry::new("/app", config_for(&store)).unwrap());

    let handle = registry.clone();
    registry
        .on_update("/stop", move |_| handle.finalize())
        .unwrap();
    registry.set("/stop", "now").unwrap();

    assert!(eventually(|| registry.is_finalized()));
}
