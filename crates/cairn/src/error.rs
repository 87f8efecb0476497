// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

use std::fmt;

use crate::protocol::ErrorCode;

/// Cairn client error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Transport failure, surfaced once the retry policy gave up.
    #[error("cairn connection: {0}")]
    Connection(#[source] std::io::Error),

    /// The connection dropped after part of a response was read. The request
    /// may or may not have been applied.
    #[error("cairn connection lost mid-response: {0}")]
    PartialResponse(#[source] std::io::Error),

    #[error("{0}")]
    Response(#[from] ResponseError),

    #[error("cairn: stale revision {rev} for {path}")]
    StaleRevision { path: String, rev: i64 },

    #[error("cairn: deadline exceeded")]
    Timeout,

    #[error("cairn: connection closed")]
    Closed,

    #[error("cairn: invalid response: {0}")]
    InvalidResponse(String),

    #[error("cairn: invalid path {0:?}")]
    InvalidPath(String),
}

/// Non-zero error code returned by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseError {
    pub code: ErrorCode,
    pub detail: String,
}

impl fmt::Display for ResponseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "cairn server error {}", self.code.name())
        } else {
            write!(f, "cairn server error {}: {}", self.code.name(), self.detail)
        }
    }
}

impl std::error::Error for ResponseError {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Connection(err)
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::InvalidResponse(format!("message decode error: {err}"))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Checks whether an error is a store response carrying the given code.
pub fn is_response_error(err: &Error, code: ErrorCode) -> bool {
    matches!(err, Error::Response(ResponseError { code: c, .. }) if *c == code)
}

/// Errors that leave the session unusable; the request may be replayed on a
/// fresh connection.
pub fn is_connection_error(err: &Error) -> bool {
    matches!(err, Error::Connection(_))
}

impl Error {
    pub fn invalid_response(msg: impl Into<String>) -> Self {
        Error::InvalidResponse(msg.into())
    }

    pub fn response(code: ErrorCode, detail: impl Into<String>) -> Self {
        Error::Response(ResponseError {
            code,
            detail: detail.into(),
        })
    }

    /// True for the store's end-of-enumeration signal.
    pub fn is_range_exhausted(&self) -> bool {
        is_response_error(self, ErrorCode::Range)
    }

    /// Whether the session that produced this error must be discarded before
    /// the next request. Store-level errors leave the stream in sync.
    pub(crate) fn poisons_session(&self) -> bool {
        !matches!(
            self,
            Error::Response(_) | Error::StaleRevision { .. } | Error::InvalidPath(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_error_display_uses_symbolic_name() {
        let err = Error::response(ErrorCode::Noent, "/missing");
        assert_eq!(err.to_string(), "cairn server error NOENT: /missing");

        let err = Error::response(ErrorCode::Range, "");
        assert_eq!(err.to_string(), "cairn server error RANGE");
        assert!(err.is_range_exhausted());
    }

    #[test]
    fn io_errors_are_connection_errors() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::ConnectionReset).into();
        assert!(is_connection_error(&err));
        assert!(err.poisons_session());

        let partial = Error::PartialResponse(std::io::ErrorKind::UnexpectedEof.into());
        assert!(!is_connection_error(&partial));
        assert!(partial.poisons_session());
    }

    #[test]
    fn store_errors_keep_session() {
        let stale = Error::StaleRevision {
            path: "/a".into(),
            rev: 3,
        };
        assert!(!stale.poisons_session());
        assert!(!Error::response(ErrorCode::Other, "boom").poisons_session());
        assert!(Error::Timeout.poisons_session());
    }
}
