// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! A resilient session to one store node.
//!
//! Requests and responses are matched positionally, so a [`Connection`]
//! serializes every exchange behind a mutex. A session that saw a transport
//! error, a timeout or a malformed response is thrown away and the next
//! request dials again, restarting the tag sequence.

use std::io::ErrorKind;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{is_connection_error, Error, Result};
use crate::protocol::{read_response, write_request, Request, Response, Verb};

/// One live TCP session. Handed to the closure passed to
/// [`Connection::run_with_retry`].
pub struct Session {
    stream: TcpStream,
    addr: String,
    next_tag: i32,
    read_timeout: Duration,
}

impl Session {
    /// Sends a request and reads its response under the configured read timeout.
    pub fn call(&mut self, req: Request) -> Result<Response> {
        let timeout = self.read_timeout;
        self.exchange(req, Some(timeout))
    }

    /// Like [`Session::call`] with an explicit read deadline; `None` blocks
    /// until a response arrives or the socket is shut down.
    pub fn call_with_deadline(
        &mut self,
        req: Request,
        deadline: Option<Duration>,
    ) -> Result<Response> {
        self.exchange(req, deadline)
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Tag the next request will carry; equals the number of requests sent
    /// on this session.
    pub fn next_tag(&self) -> i32 {
        self.next_tag
    }

    fn exchange(&mut self, mut req: Request, deadline: Option<Duration>) -> Result<Response> {
        let tag = self.next_tag;
        self.next_tag = self.next_tag.checked_add(1).unwrap_or(0);
        req.tag = Some(tag);

        // A zero duration is rejected by the socket API.
        let deadline = deadline.filter(|d| !d.is_zero());
        self.stream.set_read_timeout(deadline)?;
        write_request(&mut self.stream, &req)?;
        let resp = read_response(&mut self.stream).map_err(|err| match err {
            Error::Connection(io) if is_timeout(&io) => Error::Timeout,
            err => err,
        })?;
        if resp.tag != Some(tag) {
            return Err(Error::invalid_response(format!(
                "response tag {:?} does not match request tag {tag}",
                resp.tag
            )));
        }
        resp.into_result()
    }
}

/// Whether an I/O error is a socket read timeout.
pub fn is_timeout(err: &std::io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

pub struct Connection {
    config: ClientConfig,
    session: Mutex<Option<Session>>,
    // Clone of the live socket so `close` can unblock a pending read without
    // taking the session lock.
    interrupt: Mutex<Option<TcpStream>>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("addrs", &self.config.addrs)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Connection {
    /// Creates a connection without dialing; the first request connects.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            session: Mutex::new(None),
            interrupt: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Creates a connection and establishes the first session eagerly.
    pub fn open(config: ClientConfig) -> Result<Self> {
        let conn = Self::new(config);
        let session = conn.connect()?;
        *conn.session.lock() = Some(session);
        Ok(conn)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Address of the live session, if any and not busy.
    pub fn connected_addr(&self) -> Option<String> {
        self.session
            .try_lock()
            .and_then(|guard| guard.as_ref().map(|s| s.addr.clone()))
    }

    /// Runs `op`, reconnecting and replaying it after a connection failure
    /// that happened before any response bytes were read.
    pub fn run_with_retry<T, F>(&self, op: F) -> Result<T>
    where
        F: FnMut(&mut Session) -> Result<T>,
    {
        self.run(true, op)
    }

    /// Runs `op` at most once. Only session establishment is retried.
    pub fn run_once<T, F>(&self, op: F) -> Result<T>
    where
        F: FnMut(&mut Session) -> Result<T>,
    {
        self.run(false, op)
    }

    /// Marks the connection closed and shuts the socket down, failing any
    /// blocked request. Safe to call repeatedly and from any thread.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(stream) = self.interrupt.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
        // A blocked request holds the session lock and drops the session on
        // its own once the shutdown wakes it.
        if let Some(mut guard) = self.session.try_lock() {
            guard.take();
        }
        debug!(addrs = ?self.config.addrs, "store connection closed");
    }

    fn run<T, F>(&self, replay: bool, mut op: F) -> Result<T>
    where
        F: FnMut(&mut Session) -> Result<T>,
    {
        let mut attempts = 0usize;
        loop {
            if self.is_closed() {
                return Err(Error::Closed);
            }

            let mut guard = self.session.lock();
            if guard.is_none() {
                *guard = Some(self.connect()?);
            }
            let Some(session) = guard.as_mut() else {
                continue;
            };

            let err = match op(session) {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if err.poisons_session() {
                debug!(addr = %session.addr, error = %err, "discarding store session");
                guard.take();
                self.interrupt.lock().take();
            }
            drop(guard);

            if self.is_closed() {
                return Err(Error::Closed);
            }
            if !replay || !is_connection_error(&err) || attempts >= self.config.retry_count {
                return Err(err);
            }
            attempts += 1;
            warn!(
                attempt = attempts,
                max = self.config.retry_count,
                error = %err,
                "store request failed; reconnecting"
            );
            thread::sleep(self.config.retry_interval);
        }
    }

    fn connect(&self) -> Result<Session> {
        let mut attempts = 0usize;
        loop {
            match self.open_session() {
                Ok(session) => return Ok(session),
                Err(err)
                    if is_connection_error(&err)
                        && attempts < self.config.retry_count
                        && !self.is_closed() =>
                {
                    attempts += 1;
                    debug!(attempt = attempts, error = %err, "store dial failed");
                    thread::sleep(self.config.retry_interval);
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn open_session(&self) -> Result<Session> {
        let mut last_err = None;
        for addr in &self.config.addrs {
            match self.dial(addr) {
                Ok(session) => return Ok(session),
                Err(err) if is_connection_error(&err) => {
                    debug!(addr = %addr, error = %err, "store node unreachable");
                    last_err = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            Error::Connection(std::io::Error::new(
                ErrorKind::InvalidInput,
                "no store addresses configured",
            ))
        }))
    }

    fn dial(&self, addr: &str) -> Result<Session> {
        let mut stream = None;
        let mut last_err = None;
        for sock_addr in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&sock_addr, self.config.connect_timeout) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let stream = match stream {
            Some(stream) => stream,
            None => {
                return Err(Error::Connection(last_err.unwrap_or_else(|| {
                    std::io::Error::new(ErrorKind::NotFound, format!("no address for {addr}"))
                })))
            }
        };
        stream.set_nodelay(true)?;
        let interrupt = stream.try_clone()?;

        let mut session = Session {
            stream,
            addr: addr.to_string(),
            next_tag: 0,
            read_timeout: self.config.read_timeout,
        };
        if let Some(secret) = &self.config.secret {
            session.call(Request::new(Verb::Access).with_value(secret.as_bytes()))?;
        }

        *self.interrupt.lock() = Some(interrupt);
        if self.is_closed() {
            if let Some(stream) = self.interrupt.lock().take() {
                let _ = stream.shutdown(Shutdown::Both);
            }
            return Err(Error::Closed);
        }
        debug!(addr = %addr, "connected to store");
        Ok(session)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(stream) = self.interrupt.get_mut().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}
