// Contract: the relay's wire codec is byte-compatible with y-protocols as
// implemented by `yrs::sync`.

use serde_json::json;
use tandem_common::protocol::{read_messages, AwarenessEntry, AwarenessUpdate, RelayMessage, SyncMessage};
use yrs::sync::{Awareness, Message, SyncMessage as YSyncMessage};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, Transact, Update};

fn doc_with_text(client_id: u64, content: &str) -> Doc {
    let doc = Doc::with_client_id(client_id);
    let text = doc.get_or_insert_text("content");
    let mut txn = doc.transact_mut();
    text.push(&mut txn, content);
    drop(txn);
    doc
}

#[test]
fn sync_request_matches_yrs_step1_encoding() {
    let doc = doc_with_text(11, "hello");
    let state_vector = doc.transact().state_vector();

    let ours = RelayMessage::Sync(SyncMessage::Request(state_vector.encode_v1())).encode();
    let theirs = Message::Sync(YSyncMessage::SyncStep1(state_vector)).encode_v1();

    assert_eq!(ours, theirs);
}

#[test]
fn sync_response_and_update_match_yrs_encoding() {
    let doc = doc_with_text(12, "world");
    let update = doc.transact().encode_state_as_update_v1(&StateVector::default());

    let response = RelayMessage::Sync(SyncMessage::Response(update.clone())).encode();
    assert_eq!(response, Message::Sync(YSyncMessage::SyncStep2(update.clone())).encode_v1());

    let incremental = RelayMessage::Sync(SyncMessage::Update(update.clone())).encode();
    assert_eq!(incremental, Message::Sync(YSyncMessage::Update(update)).encode_v1());
}

#[test]
fn yrs_update_frame_carries_a_mergeable_blob() {
    let source = doc_with_text(13, "payload");
    let update = source.transact().encode_state_as_update_v1(&StateVector::default());
    let frame = Message::Sync(YSyncMessage::Update(update)).encode_v1();

    let decoded = RelayMessage::decode(&frame).expect("yrs frame should decode");
    let RelayMessage::Sync(SyncMessage::Update(blob)) = decoded else {
        panic!("expected sync update, got {decoded:?}");
    };

    let target = Doc::with_client_id(14);
    let text = target.get_or_insert_text("content");
    {
        let mut txn = target.transact_mut();
        txn.apply_update(Update::decode_v1(&blob).expect("blob should be a v1 update"))
            .expect("update should apply");
    }
    assert_eq!(text.get_string(&target.transact()), "payload");
}

#[test]
fn yrs_awareness_update_decodes_to_entries() {
    let awareness = Awareness::new(Doc::with_client_id(21));
    awareness
        .set_local_state(json!({ "user": { "name": "ana", "color": "#30bced" } }))
        .expect("local state should serialize");

    let frame = Message::Awareness(awareness.update().expect("awareness update should encode"))
        .encode_v1();

    let decoded = RelayMessage::decode(&frame).expect("awareness frame should decode");
    let RelayMessage::Awareness(update) = decoded else {
        panic!("expected awareness message, got {decoded:?}");
    };

    assert_eq!(update.client_ids(), vec![21]);
    assert!(!update.entries[0].is_removal());
    assert_eq!(update.entries[0].user_name().as_deref(), Some("ana"));
}

#[test]
fn our_awareness_frames_decode_in_yrs() {
    let ours = RelayMessage::Awareness(AwarenessUpdate::new(vec![
        AwarenessEntry::present(31, 2, r#"{"user":{"name":"bo"}}"#),
        AwarenessEntry::removed(32, 5),
    ]))
    .encode();

    let decoded = Message::decode_v1(&ours).expect("yrs should decode relay awareness frame");
    let Message::Awareness(update) = decoded else {
        panic!("expected awareness message");
    };

    assert_eq!(update.clients.len(), 2);
    assert_eq!(update.clients[&31].clock, 2);
    assert_eq!(update.clients[&32].clock, 5);
}

#[test]
fn concatenated_yrs_messages_are_read_in_order() {
    let doc = doc_with_text(41, "abc");
    let txn = doc.transact();

    let mut frame = Message::Sync(YSyncMessage::SyncStep1(txn.state_vector())).encode_v1();
    frame.extend(
        Message::Sync(YSyncMessage::SyncStep2(txn.encode_state_as_update_v1(&StateVector::default())))
            .encode_v1(),
    );

    let kinds: Vec<&str> = read_messages(&frame)
        .map(|message| message.expect("each message should decode").kind())
        .collect();
    assert_eq!(kinds, vec!["sync_request", "sync_response"]);
}
