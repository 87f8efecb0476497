// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Revision-aware client for a hierarchical coordination store.
//!
//! Exposes a synchronous, reconnecting TCP client for the store's verbs,
//! blocking waits and watches, and a codec mapping typed values to the
//! store's string form.

pub mod client;
pub mod config;
pub mod connection;
pub mod error;
pub mod path;
pub mod protocol;
pub mod testing;
pub mod value;

pub use crate::client::{Event, Stat, StoreClient, Watch};
pub use crate::config::{
    with_addrs, with_connect_timeout, with_read_timeout, with_retry_count, with_retry_interval,
    with_secret, ClientConfig, ClientOption,
};
pub use crate::connection::{Connection, Session};
pub use crate::error::{is_connection_error, is_response_error, Error, ResponseError, Result};
pub use crate::protocol::{ErrorCode, Verb, CLOBBER, DIR, MISSING};
pub use crate::value::{Key, Value};
