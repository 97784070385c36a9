// Awareness update payload: `varuint count` followed by `(clientId, clock, JSON state)` triples.

use serde::de::IgnoredAny;
use yrs::encoding::write::Write;

use super::lib0::{DecodeError, Lib0Reader};

/// JSON literal used on the wire for a retracted (absent) state.
pub const ABSENT_STATE: &str = "null";

/// Smallest possible encoded entry: one-byte id, one-byte clock, one-byte length.
const MIN_ENTRY_BYTES: usize = 3;

/// One client's presence record as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    /// Raw JSON state. `None` marks the client as gone.
    pub state: Option<String>,
}

impl AwarenessEntry {
    pub fn present(client_id: u64, clock: u64, state: impl Into<String>) -> Self {
        Self { client_id, clock, state: Some(state.into()) }
    }

    pub fn removed(client_id: u64, clock: u64) -> Self {
        Self { client_id, clock, state: None }
    }

    pub fn is_removal(&self) -> bool {
        self.state.is_none()
    }

    /// Best-effort display name from the conventional `{"user": {"name": ..}}` shape.
    pub fn user_name(&self) -> Option<String> {
        let state: serde_json::Value = serde_json::from_str(self.state.as_deref()?).ok()?;
        state.get("user")?.get("name")?.as_str().map(str::to_owned)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    pub fn new(entries: Vec<AwarenessEntry>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn client_ids(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| entry.client_id).collect()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.write_var(self.entries.len() as u64);
        for entry in &self.entries {
            out.write_var(entry.client_id);
            out.write_var(entry.clock);
            out.write_string(entry.state.as_deref().unwrap_or(ABSENT_STATE));
        }
        out
    }

    /// Decodes a complete awareness payload. Trailing bytes are ignored, matching
    /// the lenient y-protocols reader.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let mut reader = Lib0Reader::new(payload);
        let count = reader.read_var_uint()?;

        // A hostile count must not drive the allocation.
        let capacity = usize::try_from(count)
            .unwrap_or(usize::MAX)
            .min(reader.remaining() / MIN_ENTRY_BYTES);
        let mut entries = Vec::with_capacity(capacity);

        for _ in 0..count {
            let client_id = reader.read_var_uint()?;
            let clock = reader.read_var_uint()?;
            let raw = reader.read_var_string()?;

            if serde_json::from_str::<IgnoredAny>(raw).is_err() {
                return Err(DecodeError::InvalidAwarenessState { client_id });
            }

            let state = (raw.trim() != ABSENT_STATE).then(|| raw.to_owned());
            entries.push(AwarenessEntry { client_id, clock, state });
        }

        Ok(Self { entries })
    }
}
