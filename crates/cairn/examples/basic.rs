// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use cairn::value::{decode, encode};
use cairn::{ClientConfig, StoreClient, Value, CLOBBER};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let client = StoreClient::connect(ClientConfig::from_env())?;

    let settings = Value::mapping([
        ("max_conns", Value::Integer(10)),
        ("mode", Value::symbol("fast")),
    ]);
    let rev = client.write("/demo/settings", &encode(&settings), CLOBBER)?;

    let (raw, _) = client.read("/demo/settings", None)?;
    println!("rev={rev} settings={:?}", decode(&raw));

    match client.wait("/demo/**", rev + 1, Some(Duration::from_secs(1))) {
        Ok(ev) => println!("change at {} rev={}", ev.path, ev.rev),
        Err(cairn::Error::Timeout) => println!("no further changes"),
        Err(err) => return Err(err.into()),
    }

    println!("peers={:?}", client.discover_peers()?);
    Ok(())
}
