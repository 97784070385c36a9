// Rooms: one per document id, holding the document replica, awareness and
// the set of live connections. Created on first join, dropped on last leave.

mod broadcast;

pub use broadcast::{broadcast, BroadcastPolicy};

use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};

use axum::body::Bytes;
use tandem_common::protocol::{read_messages, AwarenessUpdate, RelayMessage};
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::awareness::{AwarenessChanges, AwarenessStore};
use crate::metrics;
use crate::sync::{self, Dispatch, SyncDocument};

pub type ConnectionId = u64;

#[derive(Debug)]
pub struct ConnectionHandle {
    /// `None` once the connection stopped accepting broadcasts.
    pub outbound: Option<mpsc::Sender<Bytes>>,
    /// Awareness client ids this connection last spoke for.
    pub owned: HashSet<u64>,
}

pub struct RoomState<D> {
    pub document: D,
    pub awareness: AwarenessStore,
    pub connections: HashMap<ConnectionId, ConnectionHandle>,
    /// Set when the last connection left. A closed room is about to be
    /// dropped from the registry and must not accept joins.
    closed: bool,
}

pub struct Room<D> {
    id: String,
    policy: BroadcastPolicy,
    state: Mutex<RoomState<D>>,
}

impl<D: SyncDocument> Room<D> {
    fn new(id: String, policy: BroadcastPolicy, document: D) -> Self {
        Self {
            id,
            policy,
            state: Mutex::new(RoomState {
                document,
                awareness: AwarenessStore::default(),
                connections: HashMap::new(),
                closed: false,
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Runs `f` with exclusive access to the room's state.
    pub async fn with_state<R>(&self, f: impl FnOnce(&mut RoomState<D>) -> R) -> R {
        let mut state = self.state.lock().await;
        f(&mut state)
    }

    /// Handles every message packed in one inbound frame from `origin`, in
    /// order. Returns the frames to send back to `origin` alone.
    ///
    /// Bad input never fails the connection: a decode error discards the
    /// rest of the frame, a merge error discards that one message.
    pub async fn handle_frame(&self, origin: ConnectionId, frame: &[u8]) -> Vec<Bytes> {
        let mut state = self.state.lock().await;
        let mut replies = Vec::new();

        for decoded in read_messages(frame) {
            let message = match decoded {
                Ok(message) => message,
                Err(error) => {
                    warn!(doc_id = %self.id, connection_id = origin, %error, "discarding malformed message");
                    metrics::increment_decode_errors();
                    break;
                }
            };

            let kind = message.kind();
            metrics::record_ws_message(kind);

            let dispatch = match message {
                RelayMessage::Sync(sync_message) => {
                    match sync::handle_sync(&mut state.document, sync_message) {
                        Ok(dispatch) => dispatch,
                        Err(error) => {
                            warn!(doc_id = %self.id, connection_id = origin, kind, %error, "update rejected");
                            metrics::increment_merge_errors();
                            continue;
                        }
                    }
                }
                RelayMessage::Awareness(update) => apply_awareness(&mut state, origin, &update),
            };

            replies.extend(dispatch.direct_messages.iter().map(|reply| Bytes::from(reply.encode())));
            for outgoing in &dispatch.broadcast_messages {
                let frame = Bytes::from(outgoing.encode());
                let report =
                    broadcast(&self.id, &mut state.connections, &frame, self.policy.excluded(origin));
                debug!(
                    doc_id = %self.id,
                    connection_id = origin,
                    kind = outgoing.kind(),
                    delivered = report.delivered,
                    dropped = report.dropped,
                    "broadcast"
                );
            }
        }

        replies
    }
}

/// Applies an awareness update and moves ownership of every id it touched.
fn apply_awareness<D>(
    state: &mut RoomState<D>,
    origin: ConnectionId,
    update: &AwarenessUpdate,
) -> Dispatch {
    let changes = state.awareness.apply(update);
    if changes.is_empty() {
        return Dispatch::default();
    }

    transfer_ownership(&mut state.connections, origin, &changes);

    Dispatch::broadcast(RelayMessage::Awareness(AwarenessUpdate::new(changes.accepted)))
}

fn transfer_ownership(
    connections: &mut HashMap<ConnectionId, ConnectionHandle>,
    origin: ConnectionId,
    changes: &AwarenessChanges,
) {
    for client_id in changes.present() {
        for (connection_id, handle) in connections.iter_mut() {
            if *connection_id == origin {
                handle.owned.insert(client_id);
            } else {
                handle.owned.remove(&client_id);
            }
        }
    }
    for client_id in &changes.removed {
        for handle in connections.values_mut() {
            handle.owned.remove(client_id);
        }
    }
}

/// A connection's membership in a room, with the frames it must receive first.
pub struct JoinedRoom<D> {
    pub room: Arc<Room<D>>,
    pub connection_id: ConnectionId,
    pub initial_frames: Vec<Bytes>,
}

/// Document id to room. Rooms exist only while they have connections.
pub struct RoomRegistry<D> {
    rooms: RwLock<HashMap<String, Arc<Room<D>>>>,
    policy: BroadcastPolicy,
    next_connection_id: AtomicU64,
}

impl<D: SyncDocument + Default> Default for RoomRegistry<D> {
    fn default() -> Self {
        Self::new(BroadcastPolicy::default())
    }
}

impl<D: SyncDocument + Default> RoomRegistry<D> {
    pub fn new(policy: BroadcastPolicy) -> Self {
        Self { rooms: RwLock::new(HashMap::new()), policy, next_connection_id: AtomicU64::new(1) }
    }

    pub fn policy(&self) -> BroadcastPolicy {
        self.policy
    }

    /// Returns the room for `doc_id`, creating it if needed. Concurrent
    /// callers for the same id all get the same room.
    pub async fn get_or_create(&self, doc_id: &str) -> Arc<Room<D>> {
        if let Some(room) = self.rooms.read().await.get(doc_id) {
            return Arc::clone(room);
        }

        let mut rooms = self.rooms.write().await;
        match rooms.entry(doc_id.to_string()) {
            Entry::Occupied(occupied) => Arc::clone(occupied.get()),
            Entry::Vacant(vacant) => {
                let room = Arc::new(Room::new(doc_id.to_string(), self.policy, D::default()));
                vacant.insert(Arc::clone(&room));
                metrics::room_opened();
                info!(doc_id, "room created");
                room
            }
        }
    }

    pub async fn get(&self, doc_id: &str) -> Option<Arc<Room<D>>> {
        self.rooms.read().await.get(doc_id).cloned()
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Registers a connection in the room for `doc_id`. Broadcasts for the
    /// connection are queued on `outbound`.
    pub async fn join(&self, doc_id: &str, outbound: mpsc::Sender<Bytes>) -> JoinedRoom<D> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        loop {
            let room = self.get_or_create(doc_id).await;
            let mut state = room.state.lock().await;
            if state.closed {
                // Lost the race with the last leave; the registry entry is
                // about to go, so retry against a fresh room.
                drop(state);
                tokio::task::yield_now().await;
                continue;
            }

            state
                .connections
                .insert(connection_id, ConnectionHandle { outbound: Some(outbound), owned: HashSet::new() });

            let mut initial_frames = vec![Bytes::from(sync::initial_request(&state.document).encode())];
            if !state.awareness.is_empty() {
                initial_frames.push(Bytes::from(RelayMessage::Awareness(state.awareness.snapshot()).encode()));
            }
            let connections = state.connections.len();
            drop(state);

            metrics::connection_opened();
            info!(doc_id, connection_id, connections, "connection joined");
            return JoinedRoom { room, connection_id, initial_frames };
        }
    }

    /// Removes a connection, retracts the awareness ids it owned and drops
    /// the room if it was the last one.
    pub async fn leave(&self, room: &Arc<Room<D>>, connection_id: ConnectionId) {
        let now_empty = {
            let mut state = room.state.lock().await;
            let Some(handle) = state.connections.remove(&connection_id) else {
                return;
            };

            let removed = state.awareness.remove(handle.owned);
            if !removed.is_empty() {
                let client_ids: Vec<u64> = removed.iter().map(|entry| entry.client_id).collect();
                let frame = Bytes::from(RelayMessage::Awareness(AwarenessUpdate::new(removed)).encode());
                broadcast(&room.id, &mut state.connections, &frame, None);
                info!(doc_id = %room.id, connection_id, ?client_ids, "awareness retracted");
            }

            if state.connections.is_empty() {
                state.closed = true;
                true
            } else {
                false
            }
        };

        metrics::connection_closed();
        info!(doc_id = %room.id, connection_id, "connection left");

        if now_empty {
            self.dispose(room).await;
        }
    }

    async fn dispose(&self, room: &Arc<Room<D>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(&room.id).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(&room.id);
            metrics::room_closed();
            info!(doc_id = %room.id, "room disposed");
        }
    }
}

#[cfg(test)]
mod tests {
    use tandem_common::protocol::{AwarenessEntry, SyncMessage};
    use tokio::sync::mpsc;

    use super::*;
    use crate::sync::testing::{SetDocument, REJECTED_ITEM};

    type TestRegistry = RoomRegistry<SetDocument>;

    struct Client {
        joined: JoinedRoom<SetDocument>,
        inbox: mpsc::Receiver<Bytes>,
    }

    impl Client {
        async fn connect(registry: &TestRegistry, doc_id: &str) -> Self {
            let (outbound, inbox) = mpsc::channel(16);
            let joined = registry.join(doc_id, outbound).await;
            Self { joined, inbox }
        }

        async fn send(&self, message: RelayMessage) -> Vec<RelayMessage> {
            self.joined
                .room
                .handle_frame(self.joined.connection_id, &message.encode())
                .await
                .iter()
                .map(|frame| RelayMessage::decode(frame).expect("reply should decode"))
                .collect()
        }

        fn drain(&mut self) -> Vec<RelayMessage> {
            let mut received = Vec::new();
            while let Ok(frame) = self.inbox.try_recv() {
                received.push(RelayMessage::decode(&frame).expect("broadcast should decode"));
            }
            received
        }

        async fn leave(self, registry: &TestRegistry) {
            registry.leave(&self.joined.room, self.joined.connection_id).await;
        }
    }

    fn update(items: &[u8]) -> RelayMessage {
        RelayMessage::Sync(SyncMessage::Update(items.to_vec()))
    }

    fn presence(client_id: u64, clock: u64) -> RelayMessage {
        RelayMessage::Awareness(AwarenessUpdate::new(vec![AwarenessEntry::present(
            client_id,
            clock,
            r#"{"user":{"name":"x"}}"#,
        )]))
    }

    #[tokio::test]
    async fn join_sends_sync_request_and_awareness_snapshot() {
        let registry = TestRegistry::default();

        let first = Client::connect(&registry, "doc").await;
        assert_eq!(first.joined.initial_frames.len(), 1);
        assert_eq!(
            RelayMessage::decode(&first.joined.initial_frames[0]).expect("request should decode"),
            RelayMessage::Sync(SyncMessage::Request(Vec::new()))
        );

        first.send(update(&[1, 2])).await;
        first.send(presence(10, 1)).await;

        let second = Client::connect(&registry, "doc").await;
        let frames: Vec<RelayMessage> = second
            .joined
            .initial_frames
            .iter()
            .map(|frame| RelayMessage::decode(frame).expect("initial frame should decode"))
            .collect();
        assert_eq!(frames[0], RelayMessage::Sync(SyncMessage::Request(vec![1, 2])));
        let RelayMessage::Awareness(snapshot) = &frames[1] else {
            panic!("expected awareness snapshot, got {:?}", frames[1]);
        };
        assert_eq!(snapshot.client_ids(), vec![10]);
    }

    #[tokio::test]
    async fn concurrent_first_joins_share_one_room() {
        let registry = Arc::new(TestRegistry::default());

        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = Arc::clone(&registry);
            tasks.push(tokio::spawn(async move { registry.get_or_create("shared").await }));
        }

        let mut rooms = Vec::new();
        for task in tasks {
            rooms.push(task.await.expect("task should finish"));
        }
        assert!(rooms.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn sync_request_is_answered_only_to_requester() {
        let registry = TestRegistry::default();
        let author = Client::connect(&registry, "doc").await;
        let mut reader = Client::connect(&registry, "doc").await;
        author.send(update(&[3, 4])).await;
        reader.drain();

        let replies = reader.send(RelayMessage::Sync(SyncMessage::Request(vec![3]))).await;

        assert_eq!(replies, vec![RelayMessage::Sync(SyncMessage::Response(vec![4]))]);
        assert!(reader.drain().is_empty());
    }

    #[tokio::test]
    async fn include_policy_echoes_updates_to_origin() {
        let registry = TestRegistry::new(BroadcastPolicy::IncludeOrigin);
        let mut author = Client::connect(&registry, "doc").await;
        let mut peer = Client::connect(&registry, "doc").await;

        assert!(author.send(update(&[1])).await.is_empty());

        assert_eq!(author.drain(), vec![update(&[1])]);
        assert_eq!(peer.drain(), vec![update(&[1])]);
    }

    #[tokio::test]
    async fn exclude_policy_skips_origin() {
        let registry = TestRegistry::new(BroadcastPolicy::ExcludeOrigin);
        let mut author = Client::connect(&registry, "doc").await;
        let mut peer = Client::connect(&registry, "doc").await;

        author.send(update(&[1])).await;
        author.send(presence(5, 0)).await;

        assert!(author.drain().is_empty());
        assert_eq!(peer.drain().len(), 2);
    }

    #[tokio::test]
    async fn duplicate_update_is_not_rebroadcast() {
        let registry = TestRegistry::default();
        let author = Client::connect(&registry, "doc").await;
        let mut peer = Client::connect(&registry, "doc").await;

        author.send(update(&[1, 2])).await;
        author.send(update(&[2, 1])).await;
        author.send(update(&[2, 3])).await;

        assert_eq!(peer.drain(), vec![update(&[1, 2]), update(&[3])]);
    }

    #[tokio::test]
    async fn rooms_are_isolated() {
        let registry = TestRegistry::default();
        let author = Client::connect(&registry, "left").await;
        let mut neighbour = Client::connect(&registry, "right").await;

        author.send(update(&[1])).await;
        author.send(presence(1, 0)).await;

        assert!(neighbour.drain().is_empty());
        assert_eq!(registry.room_count().await, 2);
    }

    #[tokio::test]
    async fn leave_retracts_exactly_the_leavers_awareness() {
        let registry = TestRegistry::default();
        let leaver = Client::connect(&registry, "doc").await;
        let stayer = Client::connect(&registry, "doc").await;
        let mut observer = Client::connect(&registry, "doc").await;

        leaver
            .send(RelayMessage::Awareness(AwarenessUpdate::new(vec![
                AwarenessEntry::present(1, 0, "{}"),
                AwarenessEntry::present(2, 0, "{}"),
            ])))
            .await;
        stayer.send(presence(3, 0)).await;
        observer.drain();

        leaver.leave(&registry).await;

        let received = observer.drain();
        assert_eq!(received.len(), 1);
        let RelayMessage::Awareness(removal) = &received[0] else {
            panic!("expected awareness removal, got {:?}", received[0]);
        };
        let mut ids = removal.client_ids();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        assert!(removal.entries.iter().all(AwarenessEntry::is_removal));

        let snapshot = stayer.joined.room.with_state(|state| state.awareness.snapshot()).await;
        assert_eq!(snapshot.client_ids(), vec![3]);
    }

    #[tokio::test]
    async fn latest_sender_owns_a_client_id() {
        let registry = TestRegistry::default();
        let first = Client::connect(&registry, "doc").await;
        let second = Client::connect(&registry, "doc").await;
        let mut observer = Client::connect(&registry, "doc").await;

        first.send(presence(7, 0)).await;
        // The same client id reconnected on a new socket.
        second.send(presence(7, 1)).await;
        observer.drain();

        first.leave(&registry).await;
        assert!(observer.drain().is_empty());

        second.leave(&registry).await;
        let received = observer.drain();
        assert_eq!(
            received,
            vec![RelayMessage::Awareness(AwarenessUpdate::new(vec![AwarenessEntry::removed(7, 2)]))]
        );
    }

    #[tokio::test]
    async fn explicit_removal_releases_ownership() {
        let registry = TestRegistry::default();
        let client = Client::connect(&registry, "doc").await;
        let mut observer = Client::connect(&registry, "doc").await;

        client.send(presence(4, 0)).await;
        client
            .send(RelayMessage::Awareness(AwarenessUpdate::new(vec![AwarenessEntry::removed(4, 1)])))
            .await;
        assert_eq!(observer.drain().len(), 2);

        client.leave(&registry).await;
        assert!(observer.drain().is_empty());
    }

    #[tokio::test]
    async fn last_leave_drops_the_room_and_rejoin_starts_fresh() {
        let registry = TestRegistry::default();
        let client = Client::connect(&registry, "doc").await;
        client.send(update(&[9])).await;
        client.send(presence(1, 0)).await;
        let old_room = Arc::clone(&client.joined.room);

        client.leave(&registry).await;
        assert_eq!(registry.room_count().await, 0);
        assert!(registry.get("doc").await.is_none());

        let fresh = Client::connect(&registry, "doc").await;
        assert!(!Arc::ptr_eq(&old_room, &fresh.joined.room));
        assert_eq!(
            fresh.joined.initial_frames,
            vec![Bytes::from(RelayMessage::Sync(SyncMessage::Request(Vec::new())).encode())]
        );
    }

    #[tokio::test]
    async fn join_racing_the_last_leave_lands_in_a_fresh_room() {
        let registry = Arc::new(TestRegistry::default());
        let client = Client::connect(&registry, "doc").await;
        client.send(update(&[9])).await;
        let old_room = Arc::clone(&client.joined.room);

        // Hold the room lock so the leave and the join queue up behind it in
        // that order. The join then finds the room closed and must retry.
        let guard = old_room.state.lock().await;
        let leave = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move { client.leave(&registry).await }
        });
        tokio::task::yield_now().await;
        let join = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                let (outbound, _inbox) = mpsc::channel(16);
                registry.join("doc", outbound).await
            }
        });
        tokio::task::yield_now().await;
        drop(guard);

        leave.await.expect("leave should finish");
        let joined = join.await.expect("join should finish");

        assert!(!Arc::ptr_eq(&old_room, &joined.room));
        assert!(old_room.with_state(|state| state.closed).await);
        assert_eq!(registry.room_count().await, 1);
        let current = registry.get("doc").await.expect("fresh room should be registered");
        assert!(Arc::ptr_eq(&current, &joined.room));
        assert_eq!(joined.room.connection_count().await, 1);
        assert_eq!(
            joined.initial_frames,
            vec![Bytes::from(RelayMessage::Sync(SyncMessage::Request(Vec::new())).encode())]
        );
    }

    #[tokio::test]
    async fn leaving_twice_is_harmless() {
        let registry = TestRegistry::default();
        let client = Client::connect(&registry, "doc").await;
        let _other = Client::connect(&registry, "doc").await;
        let room = Arc::clone(&client.joined.room);
        let connection_id = client.joined.connection_id;

        registry.leave(&room, connection_id).await;
        registry.leave(&room, connection_id).await;

        assert_eq!(room.connection_count().await, 1);
        assert_eq!(registry.room_count().await, 1);
    }

    #[tokio::test]
    async fn malformed_tail_keeps_earlier_messages() {
        let registry = TestRegistry::default();
        let author = Client::connect(&registry, "doc").await;
        let mut peer = Client::connect(&registry, "doc").await;

        let mut frame = update(&[1]).encode();
        frame.extend_from_slice(&[0x09, 0x00]);
        update(&[2]).encode_into(&mut frame);

        let replies = author.joined.room.handle_frame(author.joined.connection_id, &frame).await;

        assert!(replies.is_empty());
        assert_eq!(peer.drain(), vec![update(&[1])]);
    }

    #[tokio::test]
    async fn rejected_update_skips_only_that_message() {
        let registry = TestRegistry::default();
        let author = Client::connect(&registry, "doc").await;
        let mut peer = Client::connect(&registry, "doc").await;

        let mut frame = update(&[REJECTED_ITEM]).encode();
        update(&[5]).encode_into(&mut frame);
        author.joined.room.handle_frame(author.joined.connection_id, &frame).await;

        assert_eq!(peer.drain(), vec![update(&[5])]);
    }

    #[tokio::test]
    async fn slow_consumer_is_cut_off_without_blocking_others() {
        let registry = TestRegistry::default();
        let (slow_outbound, mut slow_inbox) = mpsc::channel(1);
        let slow = registry.join("doc", slow_outbound).await;
        let author = Client::connect(&registry, "doc").await;
        let mut peer = Client::connect(&registry, "doc").await;

        for item in 1..=3u8 {
            author.send(update(&[item])).await;
        }

        assert_eq!(peer.drain().len(), 3);
        assert!(slow_inbox.recv().await.is_some());
        assert!(slow_inbox.recv().await.is_none());

        registry.leave(&slow.room, slow.connection_id).await;
        assert_eq!(slow.room.connection_count().await, 2);
    }
}
