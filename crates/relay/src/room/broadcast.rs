use std::collections::HashMap;

use axum::body::Bytes;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use super::{ConnectionHandle, ConnectionId};
use crate::metrics;

/// Whether a message is echoed back to the connection that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BroadcastPolicy {
    /// Every connection in the room, the origin included. Clients drop the
    /// echo because re-applying an update is a no-op.
    #[default]
    IncludeOrigin,
    ExcludeOrigin,
}

impl BroadcastPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "include" => Some(Self::IncludeOrigin),
            "exclude" => Some(Self::ExcludeOrigin),
            _ => None,
        }
    }

    pub fn excluded(self, origin: ConnectionId) -> Option<ConnectionId> {
        match self {
            Self::IncludeOrigin => None,
            Self::ExcludeOrigin => Some(origin),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Queues `frame` on every writable connection except `exclude`.
///
/// Never waits on a socket. A connection whose queue is full is cut off:
/// its sender is dropped so its task drains what it has and disconnects.
pub fn broadcast(
    doc_id: &str,
    connections: &mut HashMap<ConnectionId, ConnectionHandle>,
    frame: &Bytes,
    exclude: Option<ConnectionId>,
) -> BroadcastReport {
    let mut report = BroadcastReport::default();

    for (connection_id, handle) in connections.iter_mut() {
        if Some(*connection_id) == exclude {
            continue;
        }
        let Some(outbound) = handle.outbound.as_ref() else {
            continue;
        };

        match outbound.try_send(frame.clone()) {
            Ok(()) => report.delivered += 1,
            Err(TrySendError::Full(_)) => {
                warn!(doc_id, connection_id, "outbound queue full, dropping slow connection");
                handle.outbound = None;
                report.dropped += 1;
            }
            Err(TrySendError::Closed(_)) => {
                handle.outbound = None;
                report.dropped += 1;
            }
        }
    }

    metrics::record_broadcast(report.delivered as u64, report.dropped as u64);
    report
}
