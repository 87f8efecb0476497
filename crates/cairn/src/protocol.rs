// Copyright 2025 StrongDM Inc
// SPDX-License-Identifier: Apache-2.0

//! Wire framing and the request/response message schema.
//!
//! Every message travels as a 4-byte big-endian length followed by exactly that
//! many bytes of a protobuf-encoded [`Request`] or [`Response`].

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use prost::Message;

use crate::error::{Error, Result};

pub const DEFAULT_ADDR: &str = "127.0.0.1:8046";
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_RETRY_COUNT: usize = 3;
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(100);

pub const MAX_FRAME_SIZE: u32 = 64 * 1024 * 1024; // 64 MiB

/// Unconditional write/delete.
pub const CLOBBER: i64 = -1;
/// Conditional create: succeeds only while the path is absent.
pub const MISSING: i64 = 0;
/// Revision reported by `stat` for a directory.
pub const DIR: i64 = -2;

pub const FLAG_SET: i32 = 4;
pub const FLAG_DEL: i32 = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum Verb {
    Get = 1,
    Set = 2,
    Del = 3,
    Rev = 5,
    Wait = 6,
    Nop = 7,
    Walk = 9,
    Getdir = 14,
    Stat = 16,
    Access = 99,
}

impl Verb {
    /// Verbs that never mutate the store and may be replayed freely.
    pub fn is_read_only(self) -> bool {
        !matches!(self, Verb::Set | Verb::Del)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    Other = 127,
    TagInUse = 1,
    UnknownVerb = 2,
    Readonly = 3,
    TooLate = 4,
    RevMismatch = 5,
    BadPath = 6,
    MissingArg = 7,
    Range = 8,
    Notdir = 20,
    Isdir = 21,
    Noent = 22,
}

impl ErrorCode {
    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Other => "OTHER",
            ErrorCode::TagInUse => "TAG_IN_USE",
            ErrorCode::UnknownVerb => "UNKNOWN_VERB",
            ErrorCode::Readonly => "READONLY",
            ErrorCode::TooLate => "TOO_LATE",
            ErrorCode::RevMismatch => "REV_MISMATCH",
            ErrorCode::BadPath => "BAD_PATH",
            ErrorCode::MissingArg => "MISSING_ARG",
            ErrorCode::Range => "RANGE",
            ErrorCode::Notdir => "NOTDIR",
            ErrorCode::Isdir => "ISDIR",
            ErrorCode::Noent => "NOENT",
        }
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Request {
    #[prost(int32, optional, tag = "1")]
    pub tag: Option<i32>,
    #[prost(enumeration = "Verb", optional, tag = "2")]
    pub verb: Option<i32>,
    #[prost(string, optional, tag = "4")]
    pub path: Option<String>,
    #[prost(bytes = "vec", optional, tag = "5")]
    pub value: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "6")]
    pub other_tag: Option<i32>,
    #[prost(int32, optional, tag = "7")]
    pub offset: Option<i32>,
    #[prost(int64, optional, tag = "9")]
    pub rev: Option<i64>,
}

impl Request {
    pub fn new(verb: Verb) -> Self {
        Self {
            verb: Some(verb as i32),
            ..Default::default()
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_value(mut self, value: impl Into<Vec<u8>>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn with_rev(mut self, rev: i64) -> Self {
        self.rev = Some(rev);
        self
    }

    pub fn with_offset(mut self, offset: i32) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn verb_kind(&self) -> Option<Verb> {
        self.verb.and_then(|v| Verb::try_from(v).ok())
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Response {
    #[prost(int32, optional, tag = "1")]
    pub tag: Option<i32>,
    #[prost(int32, optional, tag = "2")]
    pub flags: Option<i32>,
    #[prost(int64, optional, tag = "3")]
    pub rev: Option<i64>,
    #[prost(string, optional, tag = "5")]
    pub path: Option<String>,
    #[prost(bytes = "vec", optional, tag = "6")]
    pub value: Option<Vec<u8>>,
    #[prost(int32, optional, tag = "8")]
    pub len: Option<i32>,
    #[prost(enumeration = "ErrorCode", optional, tag = "100")]
    pub err_code: Option<i32>,
    #[prost(string, optional, tag = "101")]
    pub err_detail: Option<String>,
}

impl Response {
    /// Converts a non-zero error code into [`Error::Response`].
    pub fn into_result(self) -> Result<Response> {
        match self.err_code {
            Some(code) if code != 0 => {
                let code = ErrorCode::try_from(code).unwrap_or(ErrorCode::Other);
                Err(Error::response(code, self.err_detail.unwrap_or_default()))
            }
            _ => Ok(self),
        }
    }

    /// Value as text, with invalid UTF-8 replaced rather than rejected.
    pub fn value_lossy(&self) -> String {
        let bytes = self.value.as_deref().unwrap_or_default();
        String::from_utf8_lossy(bytes).into_owned()
    }

    /// A wait/watch response describes a deletion.
    pub fn is_delete(&self) -> bool {
        match self.flags {
            Some(flags) => flags & FLAG_DEL != 0,
            None => self.value.is_none(),
        }
    }
}

pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> Result<()> {
    writer.write_u32::<BigEndian>(payload.len() as u32)?;
    writer.write_all(payload)?;
    writer.flush()?;
    Ok(())
}

/// Reads one frame.
///
/// A failure before the first header byte arrives is reported as
/// [`Error::Connection`]; once any byte has been consumed it becomes
/// [`Error::PartialResponse`].
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let mut header = [0u8; 4];
    let mut filled = 0;
    while filled < header.len() {
        match reader.read(&mut header[filled..]) {
            Ok(0) => {
                let err = std::io::Error::new(ErrorKind::UnexpectedEof, "frame header truncated");
                return Err(if filled == 0 {
                    Error::Connection(err)
                } else {
                    Error::PartialResponse(err)
                });
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => {
                return Err(if filled == 0 {
                    Error::Connection(err)
                } else {
                    Error::PartialResponse(err)
                });
            }
        }
    }

    let len = BigEndian::read_u32(&header);
    if len > MAX_FRAME_SIZE {
        return Err(Error::invalid_response(format!(
            "frame size {} exceeds maximum {}",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .map_err(Error::PartialResponse)?;
    Ok(payload)
}

pub fn write_request<W: Write>(writer: &mut W, req: &Request) -> Result<()> {
    write_frame(writer, &req.encode_to_vec())
}

pub fn read_response<R: Read>(reader: &mut R) -> Result<Response> {
    let payload = read_frame(reader)?;
    Ok(Response::decode(payload.as_slice())?)
}
