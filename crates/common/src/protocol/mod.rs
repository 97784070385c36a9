// Binary sync protocol, compatible with y-protocols.

pub mod awareness;
pub mod lib0;
pub mod message;

pub use awareness::{AwarenessEntry, AwarenessUpdate};
pub use lib0::DecodeError;
pub use message::{read_messages, MessageReader, RelayMessage, SyncMessage};
