// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;

use crate::protocol::{
    DEFAULT_ADDR, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT, DEFAULT_RETRY_COUNT,
    DEFAULT_RETRY_INTERVAL,
};

/// Connection settings handed to every [`Connection`](crate::Connection).
#[derive(Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Store nodes, tried in order on every (re)connect.
    pub addrs: Vec<String>,
    pub connect_timeout: Duration,
    /// Read timeout for ordinary requests. `wait` uses its own deadline.
    pub read_timeout: Duration,
    /// Reconnect attempts after the first failure.
    pub retry_count: usize,
    pub retry_interval: Duration,
    /// Shared secret presented with `ACCESS` on every new session.
    pub secret: Option<String>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("addrs", &self.addrs)
            .field("connect_timeout", &self.connect_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("retry_count", &self.retry_count)
            .field("retry_interval", &self.retry_interval)
            .field("secret", &self.secret.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            addrs: vec![DEFAULT_ADDR.to_string()],
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            retry_count: DEFAULT_RETRY_COUNT,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            secret: None,
        }
    }
}

impl ClientConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addrs: vec![addr.into()],
            ..Default::default()
        }
    }

    /// Builds a config from `CAIRN_ADDR` (comma separated) and `CAIRN_SECRET`,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(raw) = std::env::var("CAIRN_ADDR") {
            let addrs: Vec<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(str::to_string)
                .collect();
            if !addrs.is_empty() {
                config.addrs = addrs;
            }
        }
        config.secret = std::env::var("CAIRN_SECRET")
            .ok()
            .filter(|value| !value.trim().is_empty());
        config
    }

    pub fn with_options(mut self, opts: impl IntoIterator<Item = ClientOption>) -> Self {
        for opt in opts {
            opt(&mut self);
        }
        self
    }
}

pub type ClientOption = Arc<dyn Fn(&mut ClientConfig) + Send + Sync>;

pub fn with_connect_timeout(timeout: Duration) -> ClientOption {
    Arc::new(move |config| config.connect_timeout = timeout)
}

pub fn with_read_timeout(timeout: Duration) -> ClientOption {
    Arc::new(move |config| config.read_timeout = timeout)
}

pub fn with_retry_count(count: usize) -> ClientOption {
    Arc::new(move |config| config.retry_count = count)
}

pub fn with_retry_interval(interval: Duration) -> ClientOption {
    Arc::new(move |config| config.retry_interval = interval)
}

pub fn with_secret(secret: impl Into<String>) -> ClientOption {
    let secret = secret.into();
    Arc::new(move |config| config.secret = Some(secret.clone()))
}

/// Appends failover addresses after the primary one.
pub fn with_addrs(addrs: impl IntoIterator<Item = String>) -> ClientOption {
    let addrs: Vec<String> = addrs.into_iter().collect();
    Arc::new(move |config| {
        for addr in &addrs {
            if !config.addrs.contains(addr) {
                config.addrs.push(addr.clone());
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_store_conventions() {
        let config = ClientConfig::default();
        assert_eq!(config.addrs, vec!["127.0.0.1:8046".to_string()]);
        assert_eq!(config.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.read_timeout, Duration::from_secs(5));
        assert_eq!(config.retry_count, 3);
        assert_eq!(config.retry_interval, Duration::from_millis(100));
        assert!(config.secret.is_none());
    }

    #[test]
    fn options_apply_in_order() {
        let config = ClientConfig::new("10.0.0.1:8046").with_options([
            with_retry_count(7),
            with_read_timeout(Duration::from_millis(250)),
            with_secret("s3cret"),
            with_addrs(["10.0.0.2:8046".to_string(), "10.0.0.1:8046".to_string()]),
            with_retry_count(1),
        ]);
        assert_eq!(config.retry_count, 1);
        assert_eq!(config.read_timeout, Duration::from_millis(250));
        assert_eq!(config.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.addrs, vec!["10.0.0.1:8046", "10.0.0.2:8046"]);
    }

    #[test]
    fn debug_output_redacts_secret() {
        let config = ClientConfig::default().with_options([with_secret("hunter2")]);
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
