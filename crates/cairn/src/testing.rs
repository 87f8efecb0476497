// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! In-process store speaking the wire protocol, for tests.
//!
//! [`MockStore`] listens on an ephemeral localhost port, keeps a full
//! mutation history (so reads, walks and waits at old revisions work) and can
//! inject connection faults into the next request it receives.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Write;
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, WriteBytesExt};
use glob::{MatchOptions, Pattern};
use parking_lot::{Condvar, Mutex};
use prost::Message;

use crate::error::Result;
use crate::protocol::{
    read_frame, write_frame, ErrorCode, Request, Response, Verb, CLOBBER, DIR, FLAG_DEL, FLAG_SET,
};

const WAIT_POLL: Duration = Duration::from_millis(20);

/// Connection fault applied to the next request the store receives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Close the connection without applying the request.
    DropRequest,
    /// Apply the request, then close without answering.
    DropAfterApply,
    /// Apply the request and send only part of the response header.
    TruncateResponse,
}

#[derive(Debug, Clone)]
struct Mutation {
    rev: i64,
    path: String,
    value: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct StoreState {
    rev: i64,
    files: BTreeMap<String, (Vec<u8>, i64)>,
    history: Vec<Mutation>,
}

impl StoreState {
    fn apply(&mut self, path: &str, value: Option<Vec<u8>>) -> i64 {
        self.rev += 1;
        let rev = self.rev;
        match &value {
            Some(bytes) => {
                self.files.insert(path.to_string(), (bytes.clone(), rev));
            }
            None => {
                self.files.remove(path);
            }
        }
        self.history.push(Mutation {
            rev,
            path: path.to_string(),
            value,
        });
        rev
    }

    /// File tree as it stood at `rev`; non-positive means latest.
    fn files_at(&self, rev: Option<i64>) -> BTreeMap<String, (Vec<u8>, i64)> {
        match rev {
            Some(rev) if rev > 0 && rev < self.rev => {
                let mut files = BTreeMap::new();
                for m in self.history.iter().take_while(|m| m.rev <= rev) {
                    match &m.value {
                        Some(bytes) => {
                            files.insert(m.path.clone(), (bytes.clone(), m.rev));
                        }
                        None => {
                            files.remove(&m.path);
                        }
                    }
                }
                files
            }
            _ => self.files.clone(),
        }
    }
}

struct Shared {
    addr: String,
    secret: Option<String>,
    state: Mutex<StoreState>,
    changed: Condvar,
    faults: Mutex<VecDeque<Fault>>,
    conns: Mutex<Vec<(TcpStream, Arc<AtomicBool>)>>,
    stopped: AtomicBool,
}

pub struct MockStore {
    shared: Arc<Shared>,
}

impl MockStore {
    pub fn start() -> Result<Self> {
        Self::spawn(None)
    }

    /// Starts a store that rejects requests until `ACCESS` presents `secret`.
    pub fn with_secret(secret: impl Into<String>) -> Result<Self> {
        Self::spawn(Some(secret.into()))
    }

    fn spawn(secret: Option<String>) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?.to_string();

        let mut state = StoreState::default();
        state.apply("/ctl/node/mock/addr", Some(addr.clone().into_bytes()));

        let shared = Arc::new(Shared {
            addr,
            secret,
            state: Mutex::new(state),
            changed: Condvar::new(),
            faults: Mutex::new(VecDeque::new()),
            conns: Mutex::new(Vec::new()),
            stopped: AtomicBool::new(false),
        });

        let accept_shared = shared.clone();
        thread::Builder::new()
            .name("cairn-mock-accept".into())
            .spawn(move || accept_loop(listener, accept_shared))?;

        Ok(Self { shared })
    }

    pub fn addr(&self) -> String {
        self.shared.addr.clone()
    }

    pub fn revision(&self) -> i64 {
        self.shared.state.lock().rev
    }

    /// Writes directly, bypassing the wire. Returns the new revision.
    pub fn put(&self, path: &str, value: &str) -> i64 {
        let rev = self
            .shared
            .state
            .lock()
            .apply(path, Some(value.as_bytes().to_vec()));
        self.shared.changed.notify_all();
        rev
    }

    pub fn remove(&self, path: &str) -> i64 {
        let rev = self.shared.state.lock().apply(path, None);
        self.shared.changed.notify_all();
        rev
    }

    pub fn get(&self, path: &str) -> Option<String> {
        self.shared
            .state
            .lock()
            .files
            .get(path)
            .map(|(bytes, _)| String::from_utf8_lossy(bytes).into_owned())
    }

    /// Writes raw bytes directly, for values a client would never send.
    pub fn put_bytes(&self, path: &str, value: &[u8]) -> i64 {
        let rev = self.shared.state.lock().apply(path, Some(value.to_vec()));
        self.shared.changed.notify_all();
        rev
    }

    pub fn inject(&self, fault: Fault) {
        self.shared.faults.lock().push_back(fault);
    }

    /// Number of client connections currently open.
    pub fn connection_count(&self) -> usize {
        let mut conns = self.shared.conns.lock();
        conns.retain(|(_, dead)| !dead.load(Ordering::SeqCst));
        conns.len()
    }

    /// Severs every open client connection.
    pub fn drop_connections(&self) {
        let conns: Vec<_> = self.shared.conns.lock().drain(..).collect();
        for (stream, dead) in conns {
            dead.store(true, Ordering::SeqCst);
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.shared.changed.notify_all();
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.drop_connections();
        // Wake the accept loop so it notices the stop flag.
        let _ = TcpStream::connect(&self.shared.addr);
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    for stream in listener.incoming() {
        if shared.stopped.load(Ordering::SeqCst) {
            return;
        }
        let Ok(stream) = stream else {
            continue;
        };
        let Ok(handle) = stream.try_clone() else {
            continue;
        };
        let dead = Arc::new(AtomicBool::new(false));
        shared.conns.lock().push((handle, dead.clone()));

        let conn_shared = shared.clone();
        let _ = thread::Builder::new()
            .name("cairn-mock-conn".into())
            .spawn(move || serve(stream, conn_shared, dead));
    }
}

fn serve(mut stream: TcpStream, shared: Arc<Shared>, dead: Arc<AtomicBool>) {
    let mut authorized = shared.secret.is_none();
    loop {
        let Ok(frame) = read_frame(&mut stream) else {
            break;
        };
        let Ok(req) = Request::decode(frame.as_slice()) else {
            break;
        };

        let fault = shared.faults.lock().pop_front();
        if fault == Some(Fault::DropRequest) {
            break;
        }

        let Some(mut resp) = handle(&shared, &stream, &dead, &mut authorized, &req) else {
            break;
        };
        resp.tag = req.tag;

        match fault {
            Some(Fault::DropAfterApply) => break,
            Some(Fault::TruncateResponse) => {
                let payload = resp.encode_to_vec();
                let mut header = Vec::with_capacity(4);
                let _ = header.write_u32::<BigEndian>(payload.len() as u32);
                let _ = stream.write_all(&header[..2]);
                let _ = stream.flush();
                break;
            }
            _ => {}
        }

        if write_frame(&mut stream, &resp.encode_to_vec()).is_err() {
            break;
        }
    }
    dead.store(true, Ordering::SeqCst);
    let _ = stream.shutdown(Shutdown::Both);
}

fn error(code: ErrorCode, detail: impl Into<String>) -> Response {
    Response {
        err_code: Some(code as i32),
        err_detail: Some(detail.into()),
        ..Default::default()
    }
}

fn handle(
    shared: &Shared,
    stream: &TcpStream,
    dead: &AtomicBool,
    authorized: &mut bool,
    req: &Request,
) -> Option<Response> {
    let Some(verb) = req.verb_kind() else {
        return Some(error(ErrorCode::UnknownVerb, ""));
    };

    if verb == Verb::Access {
        let presented = req.value.clone().unwrap_or_default();
        return Some(match &shared.secret {
            Some(secret) if secret.as_bytes() != presented.as_slice() => {
                error(ErrorCode::Other, "permission denied")
            }
            _ => {
                *authorized = true;
                Response::default()
            }
        });
    }
    if !*authorized {
        return Some(error(ErrorCode::Other, "permission denied"));
    }

    let path = req.path.clone().unwrap_or_default();
    let resp = match verb {
        Verb::Nop => Response::default(),
        Verb::Rev => Response {
            rev: Some(shared.state.lock().rev),
            ..Default::default()
        },
        Verb::Get => {
            let state = shared.state.lock();
            let files = state.files_at(req.rev);
            match files.get(&path) {
                Some((bytes, rev)) => Response {
                    value: Some(bytes.clone()),
                    rev: Some(*rev),
                    ..Default::default()
                },
                None if has_children(&files, &path) => error(ErrorCode::Isdir, path),
                None => Response {
                    rev: Some(0),
                    ..Default::default()
                },
            }
        }
        Verb::Set | Verb::Del => mutate(shared, verb, &path, req),
        Verb::Walk => {
            let state = shared.state.lock();
            let files = state.files_at(req.rev);
            let offset = req.offset.unwrap_or(0).max(0) as usize;
            match files
                .iter()
                .filter(|(p, _)| glob_match(&path, p))
                .nth(offset)
            {
                Some((p, (bytes, rev))) => Response {
                    path: Some(p.clone()),
                    value: Some(bytes.clone()),
                    rev: Some(*rev),
                    flags: Some(FLAG_SET),
                    ..Default::default()
                },
                None => error(ErrorCode::Range, ""),
            }
        }
        Verb::Getdir => {
            let state = shared.state.lock();
            let files = state.files_at(req.rev);
            if files.contains_key(&path) {
                error(ErrorCode::Notdir, path)
            } else {
                let names = children(&files, &path);
                if names.is_empty() {
                    error(ErrorCode::Noent, path)
                } else {
                    let offset = req.offset.unwrap_or(0).max(0) as usize;
                    match names.into_iter().nth(offset) {
                        Some(name) => Response {
                            path: Some(name),
                            ..Default::default()
                        },
                        None => error(ErrorCode::Range, ""),
                    }
                }
            }
        }
        Verb::Stat => {
            let state = shared.state.lock();
            let files = state.files_at(req.rev);
            if let Some((bytes, rev)) = files.get(&path) {
                Response {
                    rev: Some(*rev),
                    len: Some(bytes.len() as i32),
                    ..Default::default()
                }
            } else {
                let names = children(&files, &path);
                if names.is_empty() {
                    Response {
                        rev: Some(0),
                        len: Some(0),
                        ..Default::default()
                    }
                } else {
                    Response {
                        rev: Some(DIR),
                        len: Some(names.len() as i32),
                        ..Default::default()
                    }
                }
            }
        }
        Verb::Wait => return wait(shared, stream, dead, &path, req.rev.unwrap_or(0)),
        Verb::Access => Response::default(),
    };
    Some(resp)
}

fn mutate(shared: &Shared, verb: Verb, path: &str, req: &Request) -> Response {
    if !path.starts_with('/') || path.contains('_') {
        return error(ErrorCode::BadPath, path);
    }
    let Some(rev) = req.rev else {
        return error(ErrorCode::MissingArg, "rev");
    };

    let mut state = shared.state.lock();
    let current = state.files.get(path).map(|(_, r)| *r).unwrap_or(0);
    if verb == Verb::Set && has_children(&state.files, path) {
        return error(ErrorCode::Isdir, path);
    }
    if verb == Verb::Del && current == 0 {
        return error(ErrorCode::Noent, path);
    }
    if rev != CLOBBER && current > rev {
        return error(ErrorCode::RevMismatch, path);
    }

    let value = match verb {
        Verb::Set => Some(req.value.clone().unwrap_or_default()),
        _ => None,
    };
    let new_rev = state.apply(path, value);
    drop(state);
    shared.changed.notify_all();
    Response {
        rev: Some(new_rev),
        ..Default::default()
    }
}

fn wait(
    shared: &Shared,
    stream: &TcpStream,
    dead: &AtomicBool,
    pattern: &str,
    from_rev: i64,
) -> Option<Response> {
    let mut state = shared.state.lock();
    loop {
        let found = state
            .history
            .iter()
            .find(|m| m.rev >= from_rev && glob_match(pattern, &m.path))
            .cloned();
        if let Some(m) = found {
            let flags = if m.value.is_some() { FLAG_SET } else { FLAG_DEL };
            return Some(Response {
                path: Some(m.path),
                value: m.value,
                rev: Some(m.rev),
                flags: Some(flags),
                ..Default::default()
            });
        }
        shared.changed.wait_for(&mut state, WAIT_POLL);
        if dead.load(Ordering::SeqCst)
            || shared.stopped.load(Ordering::SeqCst)
            || peer_closed(stream)
        {
            return None;
        }
    }
}

fn peer_closed(stream: &TcpStream) -> bool {
    if stream.set_nonblocking(true).is_err() {
        return true;
    }
    let mut buf = [0u8; 1];
    let closed = match stream.peek(&mut buf) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => err.kind() != std::io::ErrorKind::WouldBlock,
    };
    let _ = stream.set_nonblocking(false);
    closed
}

fn has_children(files: &BTreeMap<String, (Vec<u8>, i64)>, path: &str) -> bool {
    !children(files, path).is_empty()
}

fn children(files: &BTreeMap<String, (Vec<u8>, i64)>, path: &str) -> BTreeSet<String> {
    let prefix = if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    };
    files
        .keys()
        .filter_map(|p| p.strip_prefix(&prefix))
        .filter_map(|rest| rest.split('/').next())
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

/// Matches store glob patterns: `*` stays within one path segment, `**`
/// spans any number of segments.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: false,
    };
    Pattern::new(pattern).is_ok_and(|pattern| pattern.matches_with(path, options))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_patterns() {
        assert!(glob_match("/app/**", "/app/x"));
        assert!(glob_match("/app/**", "/app/x/y/z"));
        assert!(!glob_match("/app/**", "/apple/x"));
        assert!(glob_match("/ctl/node/*/addr", "/ctl/node/a1/addr"));
        assert!(!glob_match("/ctl/node/*/addr", "/ctl/node/a1/b/addr"));
        assert!(glob_match("/app/*", "/app/x"));
        assert!(!glob_match("/app/*", "/app/x/y"));
        assert!(glob_match("/app/db-*", "/app/db-primary"));
        assert!(glob_match("/app/x", "/app/x"));
    }

    #[test]
    fn history_reconstructs_old_trees() {
        let mut state = StoreState::default();
        state.apply("/a", Some(b"1".to_vec()));
        state.apply("/b", Some(b"2".to_vec()));
        state.apply("/a", None);

        let at2 = state.files_at(Some(2));
        assert_eq!(at2.len(), 2);
        let latest = state.files_at(None);
        assert_eq!(latest.keys().collect::<Vec<_>>(), vec!["/b"]);
    }

    #[test]
    fn mock_seeds_its_own_node_address() {
        let store = MockStore::start().unwrap();
        assert_eq!(store.get("/ctl/node/mock/addr"), Some(store.addr()));
        assert_eq!(store.revision(), 1);
    }
}
