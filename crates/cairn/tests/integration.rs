// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use cairn::{ClientConfig, StoreClient, CLOBBER};

#[test]
fn integration_write_read_smoke() {
    let _ = dotenvy::dotenv();
    if std::env::var("CAIRN_INTEGRATION").is_err() {
        eprintln!("CAIRN_INTEGRATION not set; skipping integration test");
        return;
    }

    let client = StoreClient::connect(ClientConfig::from_env()).expect("connect failed");
    let path = format!("/cairn-test/smoke-{}", std::process::id());
    let rev = client.write(&path, "hello", CLOBBER).expect("write failed");
    assert!(rev > 0);

    let (value, read_rev) = client.read(&path, None).expect("read failed");
    assert_eq!(value, "hello");
    assert_eq!(read_rev, rev);

    client.delete(&path, CLOBBER).expect("delete failed");
    let peers = client.discover_peers().expect("peer discovery failed");
    assert!(!peers.is_empty());
}
