// Top-level relay messages. A WebSocket binary frame carries one or more of
// these back to back.

use yrs::encoding::write::Write;

use super::awareness::AwarenessUpdate;
use super::lib0::{DecodeError, Lib0Reader};

pub const MESSAGE_SYNC: u64 = 0;
pub const MESSAGE_AWARENESS: u64 = 1;

pub const SYNC_STEP_REQUEST: u64 = 0;
pub const SYNC_STEP_RESPONSE: u64 = 1;
pub const SYNC_UPDATE: u64 = 2;

/// Document sync payloads. The blobs are opaque to the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncMessage {
    /// Step 1: the sender's state summary, asking for whatever it lacks.
    Request(Vec<u8>),
    /// Step 2: the delta answering a request.
    Response(Vec<u8>),
    /// Incremental update produced by a local edit.
    Update(Vec<u8>),
}

impl SyncMessage {
    pub fn step(&self) -> u64 {
        match self {
            Self::Request(_) => SYNC_STEP_REQUEST,
            Self::Response(_) => SYNC_STEP_RESPONSE,
            Self::Update(_) => SYNC_UPDATE,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::Request(bytes) | Self::Response(bytes) | Self::Update(bytes) => bytes,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "sync_request",
            Self::Response(_) => "sync_response",
            Self::Update(_) => "sync_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayMessage {
    Sync(SyncMessage),
    Awareness(AwarenessUpdate),
}

impl RelayMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Sync(sync) => sync.kind(),
            Self::Awareness(_) => "awareness",
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode_into(&mut out);
        out
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Self::Sync(sync) => {
                out.write_var(MESSAGE_SYNC);
                out.write_var(sync.step());
                out.write_buf(sync.payload());
            }
            Self::Awareness(update) => {
                out.write_var(MESSAGE_AWARENESS);
                out.write_buf(update.encode());
            }
        }
    }

    /// Decodes exactly one message; bytes after it are an error.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Lib0Reader::new(frame);
        let message = Self::read(&mut reader)?;
        if reader.has_remaining() {
            return Err(DecodeError::TrailingBytes { offset: reader.position() });
        }
        Ok(message)
    }

    pub fn read(reader: &mut Lib0Reader<'_>) -> Result<Self, DecodeError> {
        match reader.read_var_uint()? {
            MESSAGE_SYNC => {
                let step = reader.read_var_uint()?;
                let payload = reader.read_var_bytes()?.to_vec();
                let sync = match step {
                    SYNC_STEP_REQUEST => SyncMessage::Request(payload),
                    SYNC_STEP_RESPONSE => SyncMessage::Response(payload),
                    SYNC_UPDATE => SyncMessage::Update(payload),
                    other => return Err(DecodeError::UnknownSyncStep(other)),
                };
                Ok(Self::Sync(sync))
            }
            MESSAGE_AWARENESS => {
                let payload = reader.read_var_bytes()?;
                Ok(Self::Awareness(AwarenessUpdate::decode(payload)?))
            }
            other => Err(DecodeError::UnknownMessageKind(other)),
        }
    }
}

/// Iterates the messages packed into one frame. Yields the first decode error
/// and then stops, since the cursor position after a bad message is unknown.
pub struct MessageReader<'a> {
    reader: Lib0Reader<'a>,
    failed: bool,
}

impl Iterator for MessageReader<'_> {
    type Item = Result<RelayMessage, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || !self.reader.has_remaining() {
            return None;
        }

        let result = RelayMessage::read(&mut self.reader);
        self.failed = result.is_err();
        Some(result)
    }
}

pub fn read_messages(frame: &[u8]) -> MessageReader<'_> {
    MessageReader { reader: Lib0Reader::new(frame), failed: false }
}
