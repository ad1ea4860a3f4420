//! One CAN frame (or a reassembled transfer): the 29-bit identifier, the tail byte and the payload.

use thiserror::Error;

/// Protocol errors raised while decoding, reassembling or (de)serializing frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UavcanError {
    #[error("frame has no tail byte")]
    EmptyPayload,
    #[error("start of transfer with toggle bit 0 is UAVCAN v0 encoding, which is not supported")]
    LegacyEncoding,
    #[error("single frames cannot be appended")]
    AppendSingleFrame,
    #[error("payload too short: need {needed} bits, have {available}")]
    PayloadTooShort { needed: usize, available: usize },
    #[error("no value for channel {0}")]
    MissingValue(String),
    #[error("not enough values: ran out after {0}")]
    NotEnoughValues(usize),
    #[error("dynamic array {name} holds at most {max} elements, got {count}")]
    ArrayTooLong { name: String, max: u32, count: usize },
}

const SOURCE_NODE_INDEX: u32 = 0;
const NODE_ID_LENGTH: u32 = 7;
const DESTINATION_NODE_INDEX: u32 = 7;
const MESSAGE_ID_INDEX: u32 = 8;
const MESSAGE_ID_LENGTH: u32 = 13;
const MESSAGE_RESERVED_SET: [u32; 2] = [21, 22];
const SERVICE_ID_INDEX: u32 = 14;
const SERVICE_ID_LENGTH: u32 = 9;
const IS_REQUEST_INDEX: u32 = 24;
const IS_SERVICE_INDEX: u32 = 25;
const PRIORITY_INDEX: u32 = 26;
const PRIORITY_LENGTH: u32 = 3;

const START_OF_TRANSFER: u8 = 1 << 7;
const END_OF_TRANSFER: u8 = 1 << 6;
const TOGGLE: u8 = 1 << 5;
const TRANSFER_ID_MASK: u8 = 0x1f;

fn get(can_id: u32, index: u32, len: u32) -> u32 {
    (can_id >> index) & ((1 << len) - 1)
}

fn put(can_id: &mut u32, index: u32, len: u32, value: u32) {
    let mask = (1 << len) - 1;
    *can_id |= (value & mask) << index;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Single,
    MultiStart,
    MultiMiddle,
    MultiEnd,
}

impl FrameType {
    /// Classify a frame from its tail-byte flags.
    pub fn classify(start: bool, end: bool, toggle: bool) -> Result<Self, UavcanError> {
        match (start, end, toggle) {
            (true, true, true) => Ok(FrameType::Single),
            (true, false, true) => Ok(FrameType::MultiStart),
            (false, true, _) => Ok(FrameType::MultiEnd),
            (true, _, false) => Err(UavcanError::LegacyEncoding),
            _ => Ok(FrameType::MultiMiddle),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UavcanFrame {
    pub subject_id: u32,
    pub is_service: bool,
    /// Always true for messages.
    pub is_request: bool,
    pub source_node_id: u8,
    /// Zero for messages.
    pub destination_node_id: u8,
    pub priority: u8,
    pub transfer_id: u8,
    pub toggle: bool,
    pub start_of_transfer: bool,
    pub end_of_transfer: bool,
    pub frame_type: FrameType,
    /// Payload without the tail byte.
    pub payload: Vec<u8>,
    pub completed: bool,
    pub timestamp: i64,
}

impl UavcanFrame {
    /// Decode a received frame. `data` still carries the tail byte as its last byte.
    pub fn decode(can_id: u32, data: &[u8], timestamp: i64) -> Result<Self, UavcanError> {
        let (&tail, payload) = data.split_last().ok_or(UavcanError::EmptyPayload)?;
        let is_service = get(can_id, IS_SERVICE_INDEX, 1) == 1;
        let (subject_id, is_request, destination_node_id) = if is_service {
            (
                get(can_id, SERVICE_ID_INDEX, SERVICE_ID_LENGTH),
                get(can_id, IS_REQUEST_INDEX, 1) == 1,
                get(can_id, DESTINATION_NODE_INDEX, NODE_ID_LENGTH) as u8,
            )
        } else {
            (get(can_id, MESSAGE_ID_INDEX, MESSAGE_ID_LENGTH), true, 0)
        };
        let start_of_transfer = tail & START_OF_TRANSFER != 0;
        let end_of_transfer = tail & END_OF_TRANSFER != 0;
        let toggle = tail & TOGGLE != 0;
        let frame_type = FrameType::classify(start_of_transfer, end_of_transfer, toggle)?;
        Ok(UavcanFrame {
            subject_id,
            is_service,
            is_request,
            source_node_id: get(can_id, SOURCE_NODE_INDEX, NODE_ID_LENGTH) as u8,
            destination_node_id,
            priority: get(can_id, PRIORITY_INDEX, PRIORITY_LENGTH) as u8,
            transfer_id: tail & TRANSFER_ID_MASK,
            toggle,
            start_of_transfer,
            end_of_transfer,
            frame_type,
            payload: payload.to_vec(),
            completed: frame_type == FrameType::Single,
            timestamp,
        })
    }

    /// Template for an outgoing single-frame message.
    pub fn new_message(subject_id: u32, source_node_id: u8, priority: u8) -> Self {
        UavcanFrame {
            subject_id,
            is_service: false,
            is_request: true,
            source_node_id,
            destination_node_id: 0,
            priority,
            transfer_id: 0,
            toggle: true,
            start_of_transfer: true,
            end_of_transfer: true,
            frame_type: FrameType::Single,
            payload: Vec::new(),
            completed: true,
            timestamp: 0,
        }
    }

    /// Template for an outgoing single-frame service request or response.
    pub fn new_service(
        service_id: u32,
        source_node_id: u8,
        destination_node_id: u8,
        is_request: bool,
        priority: u8,
    ) -> Self {
        UavcanFrame {
            is_service: true,
            is_request,
            destination_node_id,
            ..Self::new_message(service_id, source_node_id, priority)
        }
    }

    /// Encode the 29-bit CAN identifier. Values wider than their field are masked.
    pub fn can_id(&self) -> u32 {
        let mut id = 0u32;
        put(&mut id, SOURCE_NODE_INDEX, NODE_ID_LENGTH, u32::from(self.source_node_id));
        if self.is_service {
            put(&mut id, DESTINATION_NODE_INDEX, NODE_ID_LENGTH, u32::from(self.destination_node_id));
            put(&mut id, SERVICE_ID_INDEX, SERVICE_ID_LENGTH, self.subject_id);
            put(&mut id, IS_REQUEST_INDEX, 1, u32::from(self.is_request));
            put(&mut id, IS_SERVICE_INDEX, 1, 1);
        } else {
            put(&mut id, MESSAGE_ID_INDEX, MESSAGE_ID_LENGTH, self.subject_id);
            for bit in MESSAGE_RESERVED_SET {
                put(&mut id, bit, 1, 1);
            }
        }
        put(&mut id, PRIORITY_INDEX, PRIORITY_LENGTH, u32::from(self.priority));
        id
    }

    pub fn tail_byte(&self) -> u8 {
        let mut b = self.transfer_id & TRANSFER_ID_MASK;
        if self.start_of_transfer {
            b |= START_OF_TRANSFER;
        }
        if self.end_of_transfer {
            b |= END_OF_TRANSFER;
        }
        if self.toggle {
            b |= TOGGLE;
        }
        b
    }

    /// Payload followed by the tail byte, ready for transmission.
    pub fn to_wire_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.payload.len() + 1);
        out.extend_from_slice(&self.payload);
        out.push(self.tail_byte());
        out
    }

    /// Append the next part of a multi-frame transfer.
    pub fn append(&mut self, next: &UavcanFrame) -> Result<(), UavcanError> {
        if self.frame_type == FrameType::Single || next.frame_type == FrameType::Single {
            return Err(UavcanError::AppendSingleFrame);
        }
        self.start_of_transfer = false;
        self.payload.extend_from_slice(&next.payload);
        self.toggle = next.toggle;
        self.frame_type = next.frame_type;
        self.completed = next.frame_type == FrameType::MultiEnd;
        Ok(())
    }
}
