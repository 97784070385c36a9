// lib0 reading on top of the `yrs` cursor, with errors that carry the offset
// of the read that failed. Writing goes straight through
// `yrs::encoding::write::Write`, which `Vec<u8>` implements.

use thiserror::Error;
use yrs::encoding::read::{self, Cursor, Read};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {offset}: {needed} bytes requested")]
    UnexpectedEnd { offset: usize, needed: usize },

    #[error("varint at offset {offset} is longer than 64 bits")]
    VarUintOverflow { offset: usize },

    #[error("string at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },

    #[error("malformed input at offset {offset}: {reason}")]
    Malformed { offset: usize, reason: String },

    #[error("unexpected trailing bytes at offset {offset}")]
    TrailingBytes { offset: usize },

    #[error("unknown message kind: {0}")]
    UnknownMessageKind(u64),

    #[error("unknown sync step: {0}")]
    UnknownSyncStep(u64),

    #[error("awareness state for client {client_id} is not valid JSON")]
    InvalidAwarenessState { client_id: u64 },
}

fn decode_error(error: read::Error, offset: usize) -> DecodeError {
    match error {
        read::Error::EndOfBuffer(needed) => DecodeError::UnexpectedEnd { offset, needed },
        read::Error::InvalidVarInt => DecodeError::VarUintOverflow { offset },
        other => DecodeError::Malformed { offset, reason: other.to_string() },
    }
}

/// Forward-only reader over a lib0-encoded buffer. Every error reports the
/// offset at which the failing read started.
pub struct Lib0Reader<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Lib0Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { cursor: Cursor::new(buf) }
    }

    pub fn position(&self) -> usize {
        self.cursor.next
    }

    pub fn remaining(&self) -> usize {
        self.cursor.buf.len() - self.cursor.next
    }

    pub fn has_remaining(&self) -> bool {
        self.cursor.has_content()
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let offset = self.position();
        self.cursor.read_u8().map_err(|error| decode_error(error, offset))
    }

    pub fn read_var_uint(&mut self) -> Result<u64, DecodeError> {
        let offset = self.position();
        self.cursor.read_var::<u64>().map_err(|error| decode_error(error, offset))
    }

    pub fn read_var_bytes(&mut self) -> Result<&[u8], DecodeError> {
        let offset = self.position();
        self.cursor.read_buf().map_err(|error| decode_error(error, offset))
    }

    /// Reads a length-prefixed string. `yrs` does not check UTF-8 here, so
    /// the bytes are validated before they are handed out.
    pub fn read_var_string(&mut self) -> Result<&str, DecodeError> {
        let offset = self.position();
        let bytes = self.cursor.read_buf().map_err(|error| decode_error(error, offset))?;
        std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset })
    }
}
