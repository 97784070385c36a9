// Document sync handshake and update fan-out.

pub mod document;
mod shape;

pub use document::{DocumentError, SyncDocument, YrsDocument};

use tandem_common::protocol::{RelayMessage, SyncMessage};

/// Outcome of handling one inbound message: replies for the sender and
/// messages for the rest of the room.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Dispatch {
    pub direct_messages: Vec<RelayMessage>,
    pub broadcast_messages: Vec<RelayMessage>,
}

impl Dispatch {
    pub fn direct(message: RelayMessage) -> Self {
        Self { direct_messages: vec![message], broadcast_messages: Vec::new() }
    }

    pub fn broadcast(message: RelayMessage) -> Self {
        Self { direct_messages: Vec::new(), broadcast_messages: vec![message] }
    }

    pub fn is_empty(&self) -> bool {
        self.direct_messages.is_empty() && self.broadcast_messages.is_empty()
    }
}

/// The sync-request every new connection receives, seeded from the room's state.
pub fn initial_request<D: SyncDocument>(document: &D) -> RelayMessage {
    RelayMessage::Sync(SyncMessage::Request(document.summary()))
}

pub fn handle_sync<D: SyncDocument>(
    document: &mut D,
    message: SyncMessage,
) -> Result<Dispatch, DocumentError> {
    match message {
        SyncMessage::Request(remote_summary) => {
            let missing = document.diff(&remote_summary)?;
            Ok(Dispatch::direct(RelayMessage::Sync(SyncMessage::Response(missing))))
        }
        SyncMessage::Response(update) | SyncMessage::Update(update) => {
            match document.merge(&update)? {
                Some(delta) => Ok(Dispatch::broadcast(RelayMessage::Sync(SyncMessage::Update(delta)))),
                None => Ok(Dispatch::default()),
            }
        }
    }
}
