// Structural checks for v1 state vectors and updates received from clients.
//
// `yrs` sizes collections from the counts it reads off the wire, so a handful
// of bytes can ask for gigabytes before the decoder notices the input is
// short. Every blob is walked here first: each count must fit in the bytes
// that remain, text must be UTF-8, tags must be known and embedded values have
// bounded depth. A blob that passes only asks `yrs` for memory proportional to
// its own length.

use thiserror::Error;
use yrs::block::{
    BLOCK_GC_REF_NUMBER, BLOCK_ITEM_ANY_REF_NUMBER, BLOCK_ITEM_BINARY_REF_NUMBER,
    BLOCK_ITEM_DELETED_REF_NUMBER, BLOCK_ITEM_DOC_REF_NUMBER, BLOCK_ITEM_EMBED_REF_NUMBER,
    BLOCK_ITEM_FORMAT_REF_NUMBER, BLOCK_ITEM_JSON_REF_NUMBER, BLOCK_ITEM_MOVE_REF_NUMBER,
    BLOCK_ITEM_STRING_REF_NUMBER, BLOCK_ITEM_TYPE_REF_NUMBER, BLOCK_SKIP_REF_NUMBER, HAS_ORIGIN,
    HAS_PARENT_SUB, HAS_RIGHT_ORIGIN,
};
use yrs::encoding::read::{self, Cursor, Read};
use yrs::types::{
    TYPE_REFS_ARRAY, TYPE_REFS_DOC, TYPE_REFS_MAP, TYPE_REFS_TEXT, TYPE_REFS_UNDEFINED,
    TYPE_REFS_XML_ELEMENT, TYPE_REFS_XML_FRAGMENT, TYPE_REFS_XML_HOOK, TYPE_REFS_XML_TEXT,
};

/// Deepest nesting of maps and arrays inside an embedded value.
pub const MAX_VALUE_DEPTH: usize = 64;

/// Longest signed varint accepted. Nine bytes carry 62 bits, which keeps the
/// decoded magnitude clear of `i64` overflow.
const MAX_SIGNED_VAR_BYTES: usize = 9;

const CONTENT_MASK: u8 = 0b0000_1111;

// Embedded value tags, as written by lib0's `writeAny`.
const VALUE_UNDEFINED: u8 = 127;
const VALUE_NULL: u8 = 126;
const VALUE_INTEGER: u8 = 125;
const VALUE_FLOAT32: u8 = 124;
const VALUE_FLOAT64: u8 = 123;
const VALUE_BIGINT: u8 = 122;
const VALUE_FALSE: u8 = 121;
const VALUE_TRUE: u8 = 120;
const VALUE_STRING: u8 = 119;
const VALUE_MAP: u8 = 118;
const VALUE_ARRAY: u8 = 117;
const VALUE_BUFFER: u8 = 116;

#[derive(Debug, Error)]
pub enum ShapeError {
    #[error(transparent)]
    Read(#[from] read::Error),

    #[error("count {count} at offset {offset} exceeds the {remaining} bytes left")]
    CountTooLarge { offset: usize, count: u64, remaining: usize },

    #[error("string at offset {offset} is not valid UTF-8")]
    InvalidUtf8 { offset: usize },

    #[error("unknown {what} tag {tag} at offset {offset}")]
    UnknownTag { what: &'static str, tag: u8, offset: usize },

    #[error("values nested deeper than {} levels", MAX_VALUE_DEPTH)]
    TooDeep,

    #[error("signed varint at offset {offset} is too long")]
    SignedVarTooLong { offset: usize },

    #[error("clock range {clock}+{len} overflows")]
    ClockOverflow { clock: u32, len: u32 },
}

/// Checks a v1 state vector: a count followed by `(client, clock)` pairs.
pub fn check_state_vector(bytes: &[u8]) -> Result<(), ShapeError> {
    let mut walker = Walker::new(bytes);
    let entries = walker.count()?;
    for _ in 0..entries {
        walker.var()?;
        walker.var()?;
    }
    Ok(())
}

/// Checks a v1 update: the struct blocks of every client, then the delete set.
pub fn check_update(bytes: &[u8]) -> Result<(), ShapeError> {
    let mut walker = Walker::new(bytes);
    let clients = walker.count()?;
    for _ in 0..clients {
        let blocks = walker.count()?;
        walker.var()?;
        let mut clock: u32 = walker.cursor.read_var()?;
        for _ in 0..blocks {
            let len = walker.block()?;
            clock = clock.checked_add(len).ok_or(ShapeError::ClockOverflow { clock, len })?;
        }
    }
    walker.delete_set()
}

struct Walker<'a> {
    cursor: Cursor<'a>,
}

impl<'a> Walker<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { cursor: Cursor::new(bytes) }
    }

    fn offset(&self) -> usize {
        self.cursor.next
    }

    fn remaining(&self) -> usize {
        self.cursor.buf.len() - self.cursor.next
    }

    fn var(&mut self) -> Result<u64, ShapeError> {
        Ok(self.cursor.read_var::<u64>()?)
    }

    /// Reads an element count. Every element takes at least one byte.
    fn count(&mut self) -> Result<u64, ShapeError> {
        let offset = self.offset();
        let count = self.var()?;
        let remaining = self.remaining();
        if count > remaining as u64 {
            return Err(ShapeError::CountTooLarge { offset, count, remaining });
        }
        Ok(count)
    }

    /// Skips a zigzag-free lib0 signed varint and returns its first byte.
    fn signed_var(&mut self) -> Result<u8, ShapeError> {
        let offset = self.offset();
        let first = self.cursor.read_u8()?;
        let mut byte = first;
        for _ in 1..MAX_SIGNED_VAR_BYTES {
            if byte & 0x80 == 0 {
                return Ok(first);
            }
            byte = self.cursor.read_u8()?;
        }
        if byte & 0x80 == 0 {
            Ok(first)
        } else {
            Err(ShapeError::SignedVarTooLong { offset })
        }
    }

    fn bytes(&mut self) -> Result<(), ShapeError> {
        self.cursor.read_buf()?;
        Ok(())
    }

    /// Skips a length-prefixed string and returns its length in UTF-16 units.
    fn string(&mut self) -> Result<u32, ShapeError> {
        let offset = self.offset();
        let bytes = self.cursor.read_buf()?;
        let text = std::str::from_utf8(bytes).map_err(|_| ShapeError::InvalidUtf8 { offset })?;
        Ok(text.encode_utf16().count() as u32)
    }

    fn id(&mut self) -> Result<(), ShapeError> {
        self.var()?;
        self.var()?;
        Ok(())
    }

    /// Skips one struct block and returns the clock span it covers.
    fn block(&mut self) -> Result<u32, ShapeError> {
        let info = self.cursor.read_u8()?;
        if info == BLOCK_SKIP_REF_NUMBER || info == BLOCK_GC_REF_NUMBER {
            return Ok(self.cursor.read_var()?);
        }
        if info & HAS_ORIGIN != 0 {
            self.id()?;
        }
        if info & HAS_RIGHT_ORIGIN != 0 {
            self.id()?;
        }
        if info & (HAS_ORIGIN | HAS_RIGHT_ORIGIN) == 0 {
            let parent_is_named = self.cursor.read_var::<u32>()? == 1;
            if parent_is_named {
                self.string()?;
            } else {
                self.id()?;
            }
            if info & HAS_PARENT_SUB != 0 {
                self.string()?;
            }
        }
        self.content(info & CONTENT_MASK)
    }

    fn content(&mut self, tag: u8) -> Result<u32, ShapeError> {
        let offset = self.offset();
        match tag {
            BLOCK_ITEM_DELETED_REF_NUMBER => Ok(self.cursor.read_var()?),
            BLOCK_ITEM_JSON_REF_NUMBER => {
                // The decoder reads one more string than the count says.
                let count = self.count()?;
                for _ in 0..=count {
                    self.string()?;
                }
                Ok(count as u32 + 1)
            }
            BLOCK_ITEM_BINARY_REF_NUMBER => {
                self.bytes()?;
                Ok(1)
            }
            BLOCK_ITEM_STRING_REF_NUMBER => self.string(),
            BLOCK_ITEM_EMBED_REF_NUMBER => {
                self.string()?;
                Ok(1)
            }
            BLOCK_ITEM_FORMAT_REF_NUMBER => {
                self.string()?;
                self.string()?;
                Ok(1)
            }
            BLOCK_ITEM_TYPE_REF_NUMBER => {
                self.type_ref()?;
                Ok(1)
            }
            BLOCK_ITEM_ANY_REF_NUMBER => {
                let count = self.count()?;
                for _ in 0..count {
                    self.value(0)?;
                }
                Ok(count as u32)
            }
            BLOCK_ITEM_DOC_REF_NUMBER => {
                self.string()?;
                self.value(0)?;
                Ok(1)
            }
            BLOCK_ITEM_MOVE_REF_NUMBER => {
                // Negation keeps parity, so the collapsed bit is the low bit
                // of the first byte.
                let collapsed = self.signed_var()? & 1 != 0;
                self.id()?;
                if !collapsed {
                    self.id()?;
                }
                Ok(1)
            }
            tag => Err(ShapeError::UnknownTag { what: "content", tag, offset }),
        }
    }

    fn type_ref(&mut self) -> Result<(), ShapeError> {
        let offset = self.offset();
        match self.cursor.read_u8()? {
            TYPE_REFS_XML_ELEMENT => {
                self.string()?;
            }
            TYPE_REFS_ARRAY | TYPE_REFS_MAP | TYPE_REFS_TEXT | TYPE_REFS_XML_FRAGMENT
            | TYPE_REFS_XML_HOOK | TYPE_REFS_XML_TEXT | TYPE_REFS_DOC | TYPE_REFS_UNDEFINED => {}
            tag => return Err(ShapeError::UnknownTag { what: "type", tag, offset }),
        }
        Ok(())
    }

    fn value(&mut self, depth: usize) -> Result<(), ShapeError> {
        if depth >= MAX_VALUE_DEPTH {
            return Err(ShapeError::TooDeep);
        }
        let offset = self.offset();
        match self.cursor.read_u8()? {
            VALUE_UNDEFINED | VALUE_NULL | VALUE_FALSE | VALUE_TRUE => {}
            VALUE_INTEGER => {
                self.signed_var()?;
            }
            VALUE_FLOAT32 => {
                self.cursor.read_exact(4)?;
            }
            VALUE_FLOAT64 | VALUE_BIGINT => {
                self.cursor.read_exact(8)?;
            }
            VALUE_STRING => {
                self.string()?;
            }
            VALUE_MAP => {
                let entries = self.count()?;
                for _ in 0..entries {
                    self.string()?;
                    self.value(depth + 1)?;
                }
            }
            VALUE_ARRAY => {
                let items = self.count()?;
                for _ in 0..items {
                    self.value(depth + 1)?;
                }
            }
            VALUE_BUFFER => self.bytes()?,
            tag => return Err(ShapeError::UnknownTag { what: "value", tag, offset }),
        }
        Ok(())
    }

    fn delete_set(&mut self) -> Result<(), ShapeError> {
        let clients = self.count()?;
        for _ in 0..clients {
            self.var()?;
            let ranges = self.count()?;
            for _ in 0..ranges {
                let clock: u32 = self.cursor.read_var()?;
                let len: u32 = self.cursor.read_var()?;
                if clock.checked_add(len).is_none() {
                    return Err(ShapeError::ClockOverflow { clock, len });
                }
            }
        }
        Ok(())
    }
}
