// The CRDT replica a room holds. The relay never looks inside updates; it
// only needs to summarize, diff and merge them.

use thiserror::Error;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::shape;

/// v1 encoding of an update with no structs and an empty delete set.
const EMPTY_UPDATE: [u8; 2] = [0, 0];

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("update payload could not be decoded: {0}")]
    InvalidUpdate(String),

    #[error("state summary could not be decoded: {0}")]
    InvalidSummary(String),

    #[error("update rejected by document: {0}")]
    Rejected(String),
}

/// Mergeable document state. Implementations must make `merge` commutative
/// and idempotent.
pub trait SyncDocument: Send + 'static {
    /// Compact description of what this replica has seen (a state vector).
    fn summary(&self) -> Vec<u8>;

    /// Everything this replica has that a peer with `remote_summary` lacks.
    fn diff(&self, remote_summary: &[u8]) -> Result<Vec<u8>, DocumentError>;

    /// Merges `update`. Returns the part of it that was new to this replica,
    /// or `None` when nothing changed.
    fn merge(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, DocumentError>;
}

/// [`SyncDocument`] backed by a `yrs` document.
#[derive(Default)]
pub struct YrsDocument {
    doc: Doc,
}

impl YrsDocument {
    pub fn doc(&self) -> &Doc {
        &self.doc
    }
}

impl std::fmt::Debug for YrsDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("YrsDocument").field("client_id", &self.doc.client_id()).finish()
    }
}

impl SyncDocument for YrsDocument {
    fn summary(&self) -> Vec<u8> {
        self.doc.transact().state_vector().encode_v1()
    }

    fn diff(&self, remote_summary: &[u8]) -> Result<Vec<u8>, DocumentError> {
        shape::check_state_vector(remote_summary)
            .map_err(|error| DocumentError::InvalidSummary(error.to_string()))?;
        let remote = StateVector::decode_v1(remote_summary)
            .map_err(|error| DocumentError::InvalidSummary(error.to_string()))?;
        Ok(self.doc.transact().encode_diff_v1(&remote))
    }

    fn merge(&mut self, update: &[u8]) -> Result<Option<Vec<u8>>, DocumentError> {
        shape::check_update(update).map_err(|error| DocumentError::InvalidUpdate(error.to_string()))?;
        let decoded = Update::decode_v1(update)
            .map_err(|error| DocumentError::InvalidUpdate(error.to_string()))?;

        let mut txn = self.doc.transact_mut();
        txn.apply_update(decoded).map_err(|error| DocumentError::Rejected(error.to_string()))?;

        // Structs waiting on missing dependencies are parked, not integrated,
        // so they do not appear in the transaction's delta yet.
        let delta = txn.encode_update_v1();
        Ok((delta != EMPTY_UPDATE).then_some(delta))
    }
}
