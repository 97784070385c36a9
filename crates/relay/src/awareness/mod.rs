// Per-room awareness (presence, cursors, names) keyed by CRDT client id.

use std::collections::HashMap;

use tandem_common::protocol::{AwarenessEntry, AwarenessUpdate};

/// Departed clients whose final clock is remembered. Past this many the
/// oldest departure is forgotten.
pub const MAX_DEPARTED: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ClientRecord {
    clock: u64,
    state: String,
}

/// Last clock seen from a client that is no longer live, so a delayed older
/// update cannot bring it back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Departure {
    clock: u64,
    seq: u64,
}

/// What one [`AwarenessStore::apply`] call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChanges {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
    /// The accepted entries behind those ids, in arrival order.
    pub accepted: Vec<AwarenessEntry>,
}

impl AwarenessChanges {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    /// Ids that now carry a live state.
    pub fn present(&self) -> impl Iterator<Item = u64> + '_ {
        self.added.iter().chain(self.updated.iter()).copied()
    }
}

/// Latest known awareness state of every live client in a room.
///
/// Client clocks only move forward. A triple is accepted when its client is
/// unknown or its clock is newer. An equal clock is accepted only when it
/// retracts a live entry, so removals win ties. Removed clients leave the
/// live map; their last clock is kept in a bounded departure list.
#[derive(Debug, Default)]
pub struct AwarenessStore {
    clients: HashMap<u64, ClientRecord>,
    departed: HashMap<u64, Departure>,
    next_seq: u64,
}

impl AwarenessStore {
    pub fn apply(&mut self, update: &AwarenessUpdate) -> AwarenessChanges {
        let mut changes = AwarenessChanges::default();

        for entry in &update.entries {
            let client_id = entry.client_id;
            let accepted = match (self.clients.get(&client_id), self.departed.get(&client_id)) {
                (Some(record), _) => {
                    entry.clock > record.clock || (entry.clock == record.clock && entry.is_removal())
                }
                (None, Some(departure)) => entry.clock > departure.clock,
                (None, None) => true,
            };
            if !accepted {
                continue;
            }

            match &entry.state {
                Some(state) => {
                    self.departed.remove(&client_id);
                    let previous = self
                        .clients
                        .insert(client_id, ClientRecord { clock: entry.clock, state: state.clone() });
                    if previous.is_some() {
                        changes.updated.push(client_id);
                    } else {
                        changes.added.push(client_id);
                    }
                }
                None => {
                    let was_live = self.clients.remove(&client_id).is_some();
                    self.record_departure(client_id, entry.clock);
                    if !was_live {
                        continue;
                    }
                    changes.removed.push(client_id);
                }
            }
            changes.accepted.push(entry.clone());
        }

        changes
    }

    /// Retracts the given clients on behalf of a departed connection. Returns
    /// the removal entries to broadcast; ids that are not live are skipped.
    pub fn remove(&mut self, client_ids: impl IntoIterator<Item = u64>) -> Vec<AwarenessEntry> {
        let mut removed = Vec::new();
        for client_id in client_ids {
            let Some(record) = self.clients.remove(&client_id) else {
                continue;
            };
            let clock = record.clock.saturating_add(1);
            self.record_departure(client_id, clock);
            removed.push(AwarenessEntry::removed(client_id, clock));
        }
        removed
    }

    fn record_departure(&mut self, client_id: u64, clock: u64) {
        self.next_seq += 1;
        self.departed.insert(client_id, Departure { clock, seq: self.next_seq });
        if self.departed.len() > MAX_DEPARTED {
            let oldest =
                self.departed.iter().min_by_key(|(_, departure)| departure.seq).map(|(id, _)| *id);
            if let Some(oldest) = oldest {
                self.departed.remove(&oldest);
            }
        }
    }

    /// Every live client's latest state, ordered by client id.
    pub fn snapshot(&self) -> AwarenessUpdate {
        let mut entries: Vec<AwarenessEntry> = self
            .clients
            .iter()
            .map(|(client_id, record)| {
                AwarenessEntry::present(*client_id, record.clock, record.state.clone())
            })
            .collect();
        entries.sort_by_key(|entry| entry.client_id);
        AwarenessUpdate::new(entries)
    }

    pub fn is_live(&self, client_id: u64) -> bool {
        self.clients.contains_key(&client_id)
    }

    /// Number of live clients.
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
