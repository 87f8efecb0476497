// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

use tracing::{debug, warn};

use crate::config::{ClientConfig, ClientOption};
use crate::connection::{Connection, Session};
use crate::error::{is_response_error, Error, Result};
use crate::path;
use crate::protocol::{ErrorCode, Request, Response, Verb, CLOBBER, DIR};

const PEER_PATTERN: &str = "/ctl/node/*/addr";

/// One change observed by `wait`, `watch` or `walk`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub path: String,
    /// `None` when the change deleted the path.
    pub value: Option<String>,
    pub rev: i64,
}

impl Event {
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }

    // Values that are not UTF-8 are decoded lossily so one bad write cannot
    // stall a watch or abort a walk.
    fn from_change(resp: &Response) -> Self {
        let value = (!resp.is_delete()).then(|| resp.value_lossy());
        Self {
            path: resp.path.clone().unwrap_or_default(),
            value,
            rev: resp.rev.unwrap_or(0),
        }
    }
}

/// Result of `stat`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stat {
    /// File revision, [`DIR`] for a directory, `<= 0` when absent.
    pub rev: i64,
    /// Byte length of a file or number of entries in a directory.
    pub len: i32,
}

impl Stat {
    pub fn exists(&self) -> bool {
        self.rev > 0 || self.is_dir()
    }

    pub fn is_dir(&self) -> bool {
        self.rev == DIR
    }
}

/// Verb-level client for one store connection.
///
/// Read-only verbs are replayed across reconnects. Writes and deletes are
/// replayed only when they carry an explicit revision, since replaying an
/// unconditional mutation could apply it twice.
#[derive(Debug)]
pub struct StoreClient {
    conn: Connection,
}

impl StoreClient {
    /// Connects eagerly, failing if no configured node is reachable.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        Ok(Self {
            conn: Connection::open(config)?,
        })
    }

    /// Creates a client that dials on first use.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            conn: Connection::new(config),
        }
    }

    pub fn dial(
        addr: impl Into<String>,
        opts: impl IntoIterator<Item = ClientOption>,
    ) -> Result<Self> {
        Self::connect(ClientConfig::new(addr).with_options(opts))
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn config(&self) -> &ClientConfig {
        self.conn.config()
    }

    /// Closes the connection. A blocked `wait` on another thread fails with
    /// [`Error::Closed`].
    pub fn close(&self) {
        self.conn.close();
    }

    pub fn is_closed(&self) -> bool {
        self.conn.is_closed()
    }

    pub fn current_revision(&self) -> Result<i64> {
        let resp = self.call(Request::new(Verb::Rev))?;
        Ok(resp.rev.unwrap_or(0))
    }

    /// Reads a file. Absence is reported as an empty value with rev `<= 0`.
    pub fn read(&self, path: &str, rev: Option<i64>) -> Result<(String, i64)> {
        path::validate(path)?;
        let mut req = Request::new(Verb::Get).with_path(path);
        req.rev = rev;
        let resp = self.call(req)?;
        Ok((resp.value_lossy(), resp.rev.unwrap_or(0)))
    }

    /// Writes `value` at `path`, returning the new revision.
    ///
    /// `rev` is [`CLOBBER`] for an unconditional write, [`MISSING`](crate::MISSING)
    /// to create only if absent, or the revision the caller last saw.
    pub fn write(&self, path: &str, value: &str, rev: i64) -> Result<i64> {
        path::validate(path)?;
        let req = Request::new(Verb::Set)
            .with_path(path)
            .with_value(value.as_bytes().to_vec())
            .with_rev(rev);
        let resp = self.mutate(req, path, rev)?;
        let new_rev = resp.rev.unwrap_or(0);
        debug!(path, rev = new_rev, "store write");
        Ok(new_rev)
    }

    pub fn delete(&self, path: &str, rev: i64) -> Result<()> {
        path::validate(path)?;
        let req = Request::new(Verb::Del).with_path(path).with_rev(rev);
        self.mutate(req, path, rev)?;
        debug!(path, "store delete");
        Ok(())
    }

    /// Returns the child of `path` at position `offset`, or `None` past the end.
    pub fn list_directory(
        &self,
        path: &str,
        offset: i32,
        rev: Option<i64>,
    ) -> Result<Option<String>> {
        path::validate(path)?;
        let mut req = Request::new(Verb::Getdir)
            .with_path(path)
            .with_offset(offset);
        req.rev = rev;
        match self.call(req) {
            Ok(resp) => Ok(Some(resp.path.unwrap_or_default())),
            Err(err) if err.is_range_exhausted() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Lists every child of `path`, paging at a single revision.
    pub fn directory(&self, path: &str, rev: Option<i64>) -> Result<Vec<String>> {
        let rev = self.pin(rev)?;
        let mut entries = Vec::new();
        let mut offset = 0;
        while let Some(entry) = self.list_directory(path, offset, Some(rev))? {
            entries.push(entry);
            offset += 1;
        }
        Ok(entries)
    }

    pub fn stat(&self, path: &str, rev: Option<i64>) -> Result<Stat> {
        path::validate(path)?;
        let mut req = Request::new(Verb::Stat).with_path(path);
        req.rev = rev;
        let resp = self.call(req)?;
        Ok(Stat {
            rev: resp.rev.unwrap_or(0),
            len: resp.len.unwrap_or(0),
        })
    }

    /// Authorizes this session. Later sessions authorize through
    /// [`ClientConfig::secret`].
    pub fn access(&self, secret: &str) -> Result<()> {
        let req = Request::new(Verb::Access).with_value(secret.as_bytes());
        self.call(req)?;
        Ok(())
    }

    /// Collects every file matching `pattern`. `*` matches one path segment,
    /// `**` any number of them.
    pub fn walk(&self, pattern: &str, rev: Option<i64>, offset: i32) -> Result<Vec<Event>> {
        let mut events = Vec::new();
        self.walk_with(pattern, rev, offset, |ev| events.push(ev))?;
        Ok(events)
    }

    /// Streams matches of `pattern` into `sink` and returns the revision the
    /// walk was pinned to.
    pub fn walk_with<F>(
        &self,
        pattern: &str,
        rev: Option<i64>,
        offset: i32,
        mut sink: F,
    ) -> Result<i64>
    where
        F: FnMut(Event),
    {
        path::validate(pattern)?;
        let rev = self.pin(rev)?;
        let mut offset = offset;
        loop {
            let req = Request::new(Verb::Walk)
                .with_path(pattern)
                .with_rev(rev)
                .with_offset(offset);
            match self.call(req) {
                Ok(resp) => {
                    sink(Event {
                        path: resp.path.clone().unwrap_or_default(),
                        value: Some(resp.value_lossy()),
                        rev: resp.rev.unwrap_or(0),
                    });
                    offset += 1;
                }
                Err(err) if err.is_range_exhausted() => return Ok(rev),
                Err(err) => return Err(err),
            }
        }
    }

    /// Walks `pattern` at the current revision and returns that revision, so a
    /// watch started at `rev + 1` misses nothing.
    pub fn snapshot(&self, pattern: &str) -> Result<(i64, Vec<Event>)> {
        let mut events = Vec::new();
        let rev = self.walk_with(pattern, None, 0, |ev| events.push(ev))?;
        Ok((rev, events))
    }

    /// Blocks until the first change matching `pattern` with revision `>= rev`.
    /// With a `timeout`, fails with [`Error::Timeout`] once it elapses.
    pub fn wait(&self, pattern: &str, rev: i64, timeout: Option<Duration>) -> Result<Event> {
        path::validate(pattern)?;
        let req = Request::new(Verb::Wait).with_path(pattern).with_rev(rev);
        let resp = self
            .conn
            .run_with_retry(|s| s.call_with_deadline(req.clone(), timeout))?;
        Ok(Event::from_change(&resp))
    }

    /// Lazily yields every change matching `pattern` from `rev` on.
    pub fn watch(&self, pattern: &str, rev: i64) -> Watch<'_> {
        Watch {
            client: self,
            pattern: pattern.to_string(),
            rev,
        }
    }

    /// Addresses of the store's nodes, as advertised under `/ctl/node`.
    pub fn discover_peers(&self) -> Result<Vec<String>> {
        let mut peers: Vec<String> = Vec::new();
        for ev in self.walk(PEER_PATTERN, None, 0)? {
            let Some(addr) = ev.value else { continue };
            if !addr.is_empty() && !peers.contains(&addr) {
                peers.push(addr);
            }
        }
        Ok(peers)
    }

    fn pin(&self, rev: Option<i64>) -> Result<i64> {
        match rev {
            Some(rev) if rev > 0 => Ok(rev),
            _ => self.current_revision(),
        }
    }

    /// Sends `req`, replaying it after a dropped connection only when a replay
    /// cannot apply a mutation twice.
    fn call(&self, req: Request) -> Result<Response> {
        let replayable = req.verb_kind().is_some_and(Verb::is_read_only)
            || req.rev.is_some_and(|rev| rev > CLOBBER);
        let op = |s: &mut Session| s.call(req.clone());
        if replayable {
            self.conn.run_with_retry(op)
        } else {
            self.conn.run_once(op)
        }
    }

    fn mutate(&self, req: Request, path: &str, rev: i64) -> Result<Response> {
        self.call(req).map_err(|err| {
            if is_response_error(&err, ErrorCode::RevMismatch) {
                Error::StaleRevision {
                    path: path.to_string(),
                    rev,
                }
            } else {
                err
            }
        })
    }
}

/// Iterator returned by [`StoreClient::watch`].
///
/// Ends once the client is closed. Other errors are yielded and the next
/// call resumes from the last delivered revision.
pub struct Watch<'a> {
    client: &'a StoreClient,
    pattern: String,
    rev: i64,
}

impl Watch<'_> {
    /// Revision the next wait starts from.
    pub fn next_rev(&self) -> i64 {
        self.rev
    }
}

impl Iterator for Watch<'_> {
    type Item = Result<Event>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.client.is_closed() {
            return None;
        }
        match self.client.wait(&self.pattern, self.rev, None) {
            Ok(ev) => {
                self.rev = ev.rev + 1;
                Some(Ok(ev))
            }
            Err(Error::Closed) => None,
            Err(err) => {
                warn!(pattern = %self.pattern, rev = self.rev, error = %err, "watch wait failed");
                Some(Err(err))
            }
        }
    }
}
