//! Integration tests: DSDL tree on disk, rule generation, frame encode/decode, reassembly and the receiver.

use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;
use uavcan_dsdl::{
    parse_frame, serialize_frame, serialize_frame_values, FrameType, SerializationRules, UavcanError, UavcanFrame,
    UavcanReceiver,
};

const PITOT_TUBE: &str = "\
saturated float32 pressure_delta
saturated uint8 error_bf
";

const TELEMETRY: &str = "\
float32 speed
float32 rpm
uint16 lap
";

const BLOB: &str = "\
uint8[<=12] data
uint8 seq
";

const RTDS: &str = "\
bool enable
---
uint8 state
";

fn dsdl_tree() -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    for (path, text) in [
        ("TestDsdl/413.PitotTube.1.0.uavcan", PITOT_TUBE),
        ("TestDsdl/100.Telemetry.uavcan", TELEMETRY),
        ("TestDsdl/35.Rtds.uavcan", RTDS),
        ("TestDsdl/101.Blob.uavcan", BLOB),
    ] {
        let path = dir.path().join(path);
        fs::create_dir_all(path.parent().expect("parent")).expect("mkdir");
        fs::write(path, text).expect("write");
    }
    dir
}

fn load_rules() -> SerializationRules {
    let dir = dsdl_tree();
    SerializationRules::load(dir.path()).expect("rules")
}

fn tail(start: bool, end: bool, toggle: bool, transfer_id: u8) -> u8 {
    (u8::from(start) << 7) | (u8::from(end) << 6) | (u8::from(toggle) << 5) | transfer_id
}

#[test]
fn test_send_pitot_tube() {
    let rules = load_rules();
    let channels = rules.try_get_message_by_name("TestDsdl.PitotTube").expect("pitot");
    let mut template = UavcanFrame::new_message(413, 1, 1);
    template.transfer_id = 1;
    let frame = serialize_frame_values(channels, &[128.64, 1.0], &template).expect("serialize");
    assert_eq!(frame.payload, vec![215, 163, 0, 67, 1]);
    assert_eq!(frame.can_id(), 73506049);
    assert_eq!(frame.tail_byte(), 225);
    assert_eq!(frame.to_wire_bytes(), vec![215, 163, 0, 67, 1, 225]);
}

#[test]
fn test_receive_pitot_tube() {
    let receiver = UavcanReceiver::new(load_rules());
    let transfer = receiver
        .on_frame_received(73506049, &[0, 64, 154, 68, 0, 225], 42)
        .expect("receive")
        .expect("single frame transfer");
    assert_eq!(transfer.name, "TestDsdl.PitotTube");
    assert_eq!(transfer.subject_id, 413);
    assert_eq!(transfer.source_node_id, 1);
    assert!(!transfer.is_service);
    assert_eq!(transfer.values["TestDsdl.PitotTube.pressure_delta"], 1234.0);
    assert_eq!(transfer.values["TestDsdl.PitotTube.error_bf"], 0.0);
}

#[test]
fn test_named_values_round_trip_through_the_wire() {
    let rules = load_rules();
    let channels = rules.try_get_message_by_id(413).expect("pitot");
    let values: HashMap<String, f64> = [
        ("TestDsdl.PitotTube.pressure_delta".to_string(), -12.5),
        ("TestDsdl.PitotTube.error_bf".to_string(), 7.0),
    ]
    .into_iter()
    .collect();
    let frame = serialize_frame(channels, &values, &UavcanFrame::new_message(413, 127, 1)).expect("serialize");

    let receiver = UavcanReceiver::new(rules.clone());
    let transfer = receiver
        .on_frame_received(frame.can_id(), &frame.to_wire_bytes(), 0)
        .expect("receive")
        .expect("transfer");
    assert_eq!(transfer.source_node_id, 127);
    assert_eq!(transfer.values, values);
}

#[test]
fn test_multi_frame_transfer() {
    let rules = load_rules();
    let channels = rules.try_get_message_by_id(100).expect("telemetry").to_vec();
    let full = serialize_frame_values(&channels, &[31.5, 8200.0, 12.0], &UavcanFrame::new_message(100, 5, 2))
        .expect("serialize");
    assert_eq!(full.payload.len(), 10);
    let can_id = full.can_id();

    let receiver = UavcanReceiver::new(rules);
    let mut first = full.payload[..7].to_vec();
    first.push(tail(true, false, true, 3));
    let mut second = full.payload[7..].to_vec();
    second.push(tail(false, true, false, 3));

    assert_eq!(receiver.on_frame_received(can_id, &first, 1), Ok(None));
    assert_eq!(receiver.storage().pending(), 1);
    let transfer = receiver.on_frame_received(can_id, &second, 2).expect("receive").expect("completed");
    assert_eq!(receiver.storage().pending(), 0);
    // the start frame's timestamp is kept
    assert_eq!(transfer.timestamp, 1);
    assert_eq!(transfer.values["TestDsdl.Telemetry.speed"], 31.5);
    assert_eq!(transfer.values["TestDsdl.Telemetry.rpm"], 8200.0);
    assert_eq!(transfer.values["TestDsdl.Telemetry.lap"], 12.0);
}

#[test]
fn test_dynamic_array_filled_to_max() {
    let rules = load_rules();
    let channels = rules.try_get_message_by_name("TestDsdl.Blob").expect("blob").to_vec();
    assert_eq!(channels[0].size_prefix_bits, 4);

    let mut values = vec![12.0];
    values.extend((1..=12u32).map(|v| f64::from(v * 20)));
    values.push(7.0);
    let full = serialize_frame_values(&channels, &values, &UavcanFrame::new_message(101, 4, 9)).expect("serialize");
    // 4 + 12 * 8 + 8 bits
    assert_eq!(full.payload.len(), 14);

    let receiver = UavcanReceiver::new(rules);
    let can_id = full.can_id();
    let mut first = full.payload[..7].to_vec();
    first.push(tail(true, false, true, 5));
    let mut second = full.payload[7..].to_vec();
    second.push(tail(false, true, false, 5));
    assert_eq!(receiver.on_frame_received(can_id, &first, 0), Ok(None));
    let transfer = receiver.on_frame_received(can_id, &second, 0).expect("receive").expect("completed");
    assert_eq!(transfer.values.len(), 13);
    assert_eq!(transfer.values["TestDsdl.Blob.data_0"], 20.0);
    assert_eq!(transfer.values["TestDsdl.Blob.data_11"], 240.0);
    assert_eq!(transfer.values["TestDsdl.Blob.seq"], 7.0);

    let again = serialize_frame(&channels, &transfer.values, &UavcanFrame::new_message(101, 4, 9)).expect("serialize");
    assert_eq!(again.payload, full.payload);

    let mut too_many = vec![13.0];
    too_many.extend(std::iter::repeat(1.0).take(13));
    too_many.push(7.0);
    assert_eq!(
        serialize_frame_values(&channels, &too_many, &UavcanFrame::new_message(101, 4, 9)),
        Err(UavcanError::ArrayTooLong { name: "TestDsdl.Blob.data".to_string(), max: 12, count: 13 })
    );
}

#[test]
fn test_oversized_transfer_is_dropped() {
    let receiver = UavcanReceiver::new(load_rules());
    let limit = receiver.storage().max_transfer_bytes();
    // largest rule is the 14-byte blob
    assert!(limit >= 14);
    let can_id = UavcanFrame::new_message(100, 5, 2).can_id();
    assert_eq!(receiver.on_frame_received(can_id, &[0, 0, 0, 0, 0, 0, 0, tail(true, false, true, 2)], 0), Ok(None));
    let mut toggle = false;
    for _ in 0..limit / 7 + 1 {
        assert_eq!(receiver.on_frame_received(can_id, &[0, 0, 0, 0, 0, 0, 0, tail(false, false, toggle, 2)], 0), Ok(None));
        toggle = !toggle;
    }
    assert_eq!(receiver.storage().pending(), 0);
    assert_eq!(receiver.on_frame_received(can_id, &[0, tail(false, true, toggle, 2)], 0), Ok(None));
}

#[test]
fn test_lost_frame_drops_transfer() {
    let receiver = UavcanReceiver::new(load_rules());
    let can_id = UavcanFrame::new_message(100, 5, 2).can_id();
    assert_eq!(receiver.on_frame_received(can_id, &[1, 2, 3, 4, 5, 6, 7, tail(true, false, true, 9)], 0), Ok(None));
    // a middle frame went missing: the end frame repeats the start's toggle
    assert_eq!(receiver.on_frame_received(can_id, &[8, 9, 10, tail(false, true, true, 9)], 0), Ok(None));
    assert_eq!(receiver.storage().pending(), 0);
}

#[test]
fn test_service_request_and_response() {
    let rules = load_rules();
    let service = rules.try_get_service_by_id(35).expect("rtds").clone();

    let request = serialize_frame_values(&service.request, &[1.0], &UavcanFrame::new_service(35, 11, 4, true, 1))
        .expect("request");
    assert_eq!(request.can_id(), 118014475);
    let response = serialize_frame_values(&service.response, &[3.0], &UavcanFrame::new_service(35, 4, 11, false, 1))
        .expect("response");
    assert_eq!(response.can_id(), 101238148);

    let receiver = UavcanReceiver::new(rules);
    let parsed = receiver
        .on_frame_received(request.can_id(), &request.to_wire_bytes(), 0)
        .expect("receive")
        .expect("request transfer");
    assert!(parsed.is_service && parsed.is_request);
    assert_eq!(parsed.destination_node_id, 4);
    assert_eq!(parsed.values["TestDsdl.Rtds.enable"], 1.0);

    let parsed = receiver
        .on_frame_received(response.can_id(), &response.to_wire_bytes(), 0)
        .expect("receive")
        .expect("response transfer");
    assert!(!parsed.is_request);
    assert_eq!(parsed.values["TestDsdl.Rtds.state"], 3.0);
}

#[test]
fn test_decode_header_fields() {
    let frame = UavcanFrame::decode(73506175, &[0, 64, 154, 68, 0, 224], 0).expect("decode");
    assert_eq!(frame.subject_id, 413);
    assert_eq!(frame.priority, 1);
    assert_eq!(frame.source_node_id, 127);
    assert_eq!(frame.transfer_id, 0);
    assert_eq!(frame.frame_type, FrameType::Single);
    assert_eq!(frame.payload, vec![0, 64, 154, 68, 0]);
    assert!(frame.completed);
}

#[test]
fn test_malformed_input() {
    let receiver = UavcanReceiver::new(load_rules());
    assert_eq!(receiver.on_frame_received(73506049, &[], 0), Err(UavcanError::EmptyPayload));
    assert!(matches!(
        receiver.on_frame_received(73506049, &[0, 64, 225], 0),
        Err(UavcanError::PayloadTooShort { .. })
    ));
    let rules = receiver.rules();
    let channels = rules.try_get_message_by_id(413).expect("pitot");
    let short = UavcanFrame { payload: vec![1], ..UavcanFrame::new_message(413, 1, 1) };
    assert!(parse_frame(&short, channels).is_err());
}

#[test]
fn test_receiver_is_shared_across_threads() {
    let receiver = Arc::new(UavcanReceiver::new(load_rules()));
    let handles: Vec<_> = (0..4u8)
        .map(|transfer_id| {
            let receiver = Arc::clone(&receiver);
            std::thread::spawn(move || {
                let can_id = UavcanFrame::new_message(100, 5, 2).can_id();
                let mut first = vec![0u8; 7];
                first.push(tail(true, false, true, transfer_id));
                let mut second = vec![0u8; 3];
                second.push(tail(false, true, false, transfer_id));
                assert_eq!(receiver.on_frame_received(can_id, &first, 0), Ok(None));
                receiver.on_frame_received(can_id, &second, 0).expect("receive").is_some()
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().expect("thread"));
    }
    assert_eq!(receiver.storage().pending(), 0);
}

#[test]
fn test_reload_swaps_rules() {
    let receiver = UavcanReceiver::new(SerializationRules::default());
    assert_eq!(receiver.on_frame_received(73506049, &[0, 64, 154, 68, 0, 225], 0), Ok(None));
    receiver.reload(load_rules());
    assert!(receiver
        .on_frame_received(73506049, &[0, 64, 154, 68, 0, 225], 0)
        .expect("receive")
        .is_some());
}
