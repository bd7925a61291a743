use anyhow::Result;
use rand::prelude::*;

use super::{compat, Message, MessageType, StoredFlags, StoredHeader, StoredMessage, TrafficClass, FRAME_LEN_PREFIX};
use crate::error::ProtocolError;
use crate::types::{NodeId, RecordId, ShardId, Status, INDEX_INVALID, REBUILDING_ID_INVALID};

/// Build a message with random field values, shaped to what the given protocol & flags can carry.
fn random_message(rebuilding: bool, status: Status, proto: u16) -> StoredMessage {
    let mut rng = rand::thread_rng();
    let mut header = StoredHeader::new(RecordId::new(rng.gen(), rng.gen()), rng.gen(), status, rng.gen_range(0..64));
    header.redirect = NodeId::new(rng.gen_range(0..1000), rng.gen());
    header.flags.insert(StoredFlags::SYNCED);
    if rebuilding {
        header.flags.insert(StoredFlags::REBUILDING);
    }
    if proto < compat::SHARD_ID_IN_STORED_MSG {
        header.shard = INDEX_INVALID;
    }

    let mut msg = StoredMessage::from_header(header);
    if rebuilding {
        msg.rebuilding_version = rng.gen_range(1..u64::MAX);
        msg.rebuilding_wave = rng.gen();
        msg.flush_token = rng.gen_range(1..u64::MAX);
        msg.server_instance_id = rng.gen_range(1..u64::MAX);
        if proto >= compat::REBUILDING_WITHOUT_WAL_2 {
            msg.rebuilding_id = rng.gen_range(1..u64::MAX);
        }
    }
    if status == Status::Rebuilding {
        msg.rebuilding_recipient = ShardId::new(rng.gen_range(0..1000), rng.gen_range(0..64));
    }
    msg
}

const PRE_SHARDING_PROTOCOL: u16 = compat::SHARD_ID_IN_STORED_MSG - 1;

fn body_of(frame: &[u8]) -> &[u8] {
    &frame[FRAME_LEN_PREFIX + 2..]
}

#[test]
fn stored_round_trips_across_flags_status_and_protocol() -> Result<()> {
    // The pre-sharding layout is still decodable even though no connection negotiates it.
    let protos = PRE_SHARDING_PROTOCOL..=compat::MAX_PROTOCOL_SUPPORTED;
    for rebuilding in [false, true] {
        for status in [Status::Ok, Status::Rebuilding] {
            for proto in protos.clone() {
                let expected = random_message(rebuilding, status, proto);
                let frame = Message::Stored(expected).encode_frame(proto);

                let output = Message::decode(MessageType::Stored as u16, body_of(&frame), proto)?;

                assert_eq!(
                    output,
                    Message::Stored(expected),
                    "round trip mismatch for rebuilding={} status={} proto={}",
                    rebuilding,
                    status,
                    proto
                );
                let reencoded = output.encode_frame(proto);
                assert_eq!(&reencoded[..], &frame[..], "re-encode not byte identical for rebuilding={} status={} proto={}", rebuilding, status, proto);
            }
        }
    }
    Ok(())
}

#[test]
fn stored_frame_length_prefix_matches_body() {
    let msg = random_message(true, Status::Rebuilding, compat::MAX_PROTOCOL_SUPPORTED);
    let frame = Message::Stored(msg).encode_frame(compat::MAX_PROTOCOL_SUPPORTED);
    let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    assert_eq!(len, frame.len() - FRAME_LEN_PREFIX, "expected length prefix {} got {}", frame.len() - FRAME_LEN_PREFIX, len);
    let tag = u16::from_le_bytes([frame[4], frame[5]]);
    assert_eq!(tag, MessageType::Stored as u16, "expected STORED tag, got {}", tag);
}

#[test]
fn stored_rebuilding_id_omitted_below_gate() -> Result<()> {
    let old = compat::SHARD_ID_IN_STORED_MSG;
    let mut msg = random_message(true, Status::Ok, compat::REBUILDING_WITHOUT_WAL_2);
    msg.rebuilding_id = 77;
    let new_len = Message::Stored(msg).encode_frame(compat::REBUILDING_WITHOUT_WAL_2).len();
    let old_frame = Message::Stored(msg).encode_frame(old);

    let output = match Message::decode(MessageType::Stored as u16, body_of(&old_frame), old)? {
        Message::Stored(output) => output,
        other => anyhow::bail!("expected STORED message, got {:?}", other),
    };

    assert_eq!(new_len - old_frame.len(), 8, "expected rebuilding id to account for 8 bytes");
    assert_eq!(output.rebuilding_id, REBUILDING_ID_INVALID, "expected rebuilding id to be implied invalid, got {}", output.rebuilding_id);
    assert_eq!(output.flush_token, msg.flush_token, "flush token mismatch");
    assert_eq!(output.server_instance_id, msg.server_instance_id, "server instance id mismatch");
    Ok(())
}

#[test]
fn stored_pre_sharding_protocol_decodes_unresolved_shard() -> Result<()> {
    let proto = PRE_SHARDING_PROTOCOL;
    let mut msg = random_message(false, Status::Ok, compat::MAX_PROTOCOL_SUPPORTED);
    msg.header.shard = 5;
    let frame = Message::Stored(msg).encode_frame(proto);

    let output = match Message::decode(MessageType::Stored as u16, body_of(&frame), proto)? {
        Message::Stored(output) => output,
        other => anyhow::bail!("expected STORED message, got {:?}", other),
    };

    assert_eq!(output.header.shard, INDEX_INVALID, "expected unresolved shard, got {}", output.header.shard);
    assert_eq!(output.header.rid, msg.header.rid, "record id mismatch");
    Ok(())
}

#[test]
fn stored_truncated_input_fails_at_every_length() {
    let proto = compat::MAX_PROTOCOL_SUPPORTED;
    let msg = random_message(true, Status::Rebuilding, proto);
    let frame = Message::Stored(msg).encode_frame(proto);
    let body = body_of(&frame);

    for len in 0..body.len() {
        let res = Message::decode(MessageType::Stored as u16, &body[..len], proto);
        assert!(
            matches!(res, Err(ProtocolError::Truncated { .. })),
            "expected truncation error for body of len {}/{}, got {:?}",
            len,
            body.len(),
            res
        );
    }
}

#[test]
fn stored_trailing_bytes_rejected() {
    let proto = compat::MAX_PROTOCOL_SUPPORTED;
    let msg = random_message(false, Status::Ok, proto);
    let frame = Message::Stored(msg).encode_frame(proto);
    let mut body = body_of(&frame).to_vec();
    body.push(0);

    let res = Message::decode(MessageType::Stored as u16, &body, proto);

    assert!(matches!(res, Err(ProtocolError::TrailingBytes(1))), "expected trailing bytes error, got {:?}", res);
}

#[test]
fn stored_unknown_status_rejected() {
    let proto = compat::MAX_PROTOCOL_SUPPORTED;
    let msg = random_message(false, Status::Ok, proto);
    let frame = Message::Stored(msg).encode_frame(proto);
    let mut body = body_of(&frame).to_vec();
    // Status code sits after the record id (16 bytes) and wave (4 bytes).
    body[20] = 0xff;
    body[21] = 0x7f;

    let res = Message::decode(MessageType::Stored as u16, &body, proto);

    assert!(matches!(res, Err(ProtocolError::UnknownStatus(0x7fff))), "expected unknown status error, got {:?}", res);
}

#[test]
fn unknown_message_type_rejected() {
    let res = Message::decode(42, &[], compat::MAX_PROTOCOL_SUPPORTED);
    assert!(matches!(res, Err(ProtocolError::UnknownMessageType(42))), "expected unknown type error, got {:?}", res);
}

#[test]
fn stored_traffic_class_follows_rebuilding_flag() {
    let append = random_message(false, Status::Ok, compat::MAX_PROTOCOL_SUPPORTED);
    let rebuild = random_message(true, Status::Ok, compat::MAX_PROTOCOL_SUPPORTED);
    assert_eq!(append.traffic_class(), TrafficClass::Append, "expected append traffic class");
    assert_eq!(rebuild.traffic_class(), TrafficClass::Rebuild, "expected rebuild traffic class");
}

#[test]
fn stored_debug_info_includes_rebuilding_fields_only_with_flag() {
    let plain = random_message(false, Status::Ok, compat::MAX_PROTOCOL_SUPPORTED);
    let rebuild = random_message(true, Status::Rebuilding, compat::MAX_PROTOCOL_SUPPORTED);

    let plain_keys: Vec<&str> = plain.debug_info().into_iter().map(|(key, _)| key).collect();
    let rebuild_info = rebuild.debug_info();

    assert!(!plain_keys.contains(&"flush_token"), "expected no rebuilding fields, got {:?}", plain_keys);
    assert_eq!(rebuild_info.len(), 13, "expected 13 debug info entries, got {}", rebuild_info.len());
    let flags = rebuild_info.iter().find(|(key, _)| *key == "flags").map(|(_, val)| val.clone());
    assert_eq!(flags, Some(serde_json::json!("SYNCED|REBUILDING")), "unexpected flags rendering {:?}", flags);
}

#[test]
fn hello_negotiates_protocol() -> Result<()> {
    let hello = super::Hello {
        proto_max: compat::MAX_PROTOCOL_SUPPORTED + 10,
        role: crate::types::PeerRole::Server(3),
    };
    let frame = Message::Hello(hello).encode_frame(compat::MIN_PROTOCOL_SUPPORTED);

    let output = Message::decode(MessageType::Hello as u16, body_of(&frame), compat::MIN_PROTOCOL_SUPPORTED)?;

    assert_eq!(output, Message::Hello(hello), "hello did not round trip");
    assert_eq!(hello.negotiate()?, compat::MAX_PROTOCOL_SUPPORTED, "expected negotiation to cap at max supported");
    let oldest = super::Hello { proto_max: compat::MIN_PROTOCOL_SUPPORTED, ..hello };
    assert_eq!(oldest.negotiate()?, compat::MIN_PROTOCOL_SUPPORTED, "expected oldest supported protocol to be accepted");
    let pre_sharding = super::Hello { proto_max: PRE_SHARDING_PROTOCOL, ..hello };
    let res = pre_sharding.negotiate();
    assert!(
        matches!(res, Err(ProtocolError::UnsupportedProtocol(PRE_SHARDING_PROTOCOL))),
        "expected pre-sharding protocol to be rejected, got {:?}",
        res
    );
    Ok(())
}
