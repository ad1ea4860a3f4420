//! Receive path: decode a raw frame, reassemble it, and apply the matching channel table.

use crate::codec::parse_frame;
use crate::frame::{UavcanError, UavcanFrame};
use crate::rules::{SerializationRules, UavcanChannel};
use crate::storage::FrameStorage;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Reassembly headroom above the largest known payload: the transfer CRC plus the padding
/// of one CAN FD frame.
const TRANSFER_SLACK_BYTES: usize = 64;

fn transfer_limit(rules: &SerializationRules) -> usize {
    rules.max_payload_bytes() + TRANSFER_SLACK_BYTES
}

/// A completed transfer with its decoded values.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedTransfer {
    pub subject_id: u32,
    pub name: String,
    pub is_service: bool,
    pub is_request: bool,
    pub source_node_id: u8,
    pub destination_node_id: u8,
    pub timestamp: i64,
    pub values: HashMap<String, f64>,
}

/// Frame sink for a transport. Safe to share between receive threads.
pub struct UavcanReceiver {
    rules: RwLock<Arc<SerializationRules>>,
    storage: FrameStorage,
    unknown_messages: Mutex<HashSet<u32>>,
    unknown_services: Mutex<HashSet<u32>>,
}

impl UavcanReceiver {
    pub fn new(rules: SerializationRules) -> Self {
        UavcanReceiver {
            storage: FrameStorage::with_max_transfer_bytes(transfer_limit(&rules)),
            rules: RwLock::new(Arc::new(rules)),
            unknown_messages: Mutex::new(HashSet::new()),
            unknown_services: Mutex::new(HashSet::new()),
        }
    }

    /// Snapshot of the current rule set.
    pub fn rules(&self) -> Arc<SerializationRules> {
        Arc::clone(&self.rules.read())
    }

    /// Replace the rule set and the reassembly size limit derived from it. Transfers in flight finish against whichever set is current
    /// when their last frame arrives.
    pub fn reload(&self, rules: SerializationRules) {
        self.storage.set_max_transfer_bytes(transfer_limit(&rules));
        *self.rules.write() = Arc::new(rules);
        self.unknown_messages.lock().clear();
        self.unknown_services.lock().clear();
    }

    pub fn storage(&self) -> &FrameStorage {
        &self.storage
    }

    /// Handle one frame from the transport. `data` includes the tail byte.
    ///
    /// Returns `Ok(None)` while a transfer is incomplete, when it was dropped during
    /// reassembly, or when no rule exists for its id.
    pub fn on_frame_received(
        &self,
        can_id: u32,
        data: &[u8],
        timestamp: i64,
    ) -> Result<Option<ParsedTransfer>, UavcanError> {
        let frame = UavcanFrame::decode(can_id, data, timestamp)?;
        match self.storage.store_frame(frame)? {
            Some(completed) => self.parse_completed(&completed),
            None => Ok(None),
        }
    }

    /// Decode a completed frame with the channel table for its id.
    pub fn parse_completed(&self, frame: &UavcanFrame) -> Result<Option<ParsedTransfer>, UavcanError> {
        let rules = self.rules();
        let Some((name, channels)) = self.lookup(&rules, frame) else {
            return Ok(None);
        };
        let values = parse_frame(frame, channels)?;
        Ok(Some(ParsedTransfer {
            subject_id: frame.subject_id,
            name: name.to_string(),
            is_service: frame.is_service,
            is_request: frame.is_request,
            source_node_id: frame.source_node_id,
            destination_node_id: frame.destination_node_id,
            timestamp: frame.timestamp,
            values,
        }))
    }

    fn lookup<'r>(
        &self,
        rules: &'r SerializationRules,
        frame: &UavcanFrame,
    ) -> Option<(&'r str, &'r [UavcanChannel])> {
        let id = frame.subject_id;
        if frame.is_service {
            let found = rules.try_get_service_by_id(id).map(|s| {
                let side = if frame.is_request { &s.request } else { &s.response };
                (s.name.as_str(), side.as_slice())
            });
            if found.is_none() && self.unknown_services.lock().insert(id) {
                warn!(service_id = id, "no serialization rule for service, frames dropped");
            }
            found
        } else {
            let found = rules
                .try_get_message_by_id(id)
                .and_then(|channels| Some((rules.message_name(id)?, channels)));
            if found.is_none() && self.unknown_messages.lock().insert(id) {
                warn!(subject_id = id, "no serialization rule for message, frames dropped");
            }
            found
        }
    }
}
