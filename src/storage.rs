//! Multi-frame reassembly keyed by (transfer id, subject id).

use crate::frame::{FrameType, UavcanError, UavcanFrame};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

type SlotKey = (u8, u32);

/// Buffers partial transfers until their end frame arrives.
///
/// A slot is either empty or holds the frames received so far, appended into one
/// [`UavcanFrame`]. One lock covers the whole table, so storing and emitting are atomic
/// with respect to frames arriving from other threads.
///
/// A transfer whose reassembled payload grows past the size limit is dropped. The limit is
/// unbounded unless set.
#[derive(Debug)]
pub struct FrameStorage {
    slots: Mutex<HashMap<SlotKey, UavcanFrame>>,
    max_transfer_bytes: AtomicUsize,
}

impl Default for FrameStorage {
    fn default() -> Self {
        FrameStorage { slots: Mutex::new(HashMap::new()), max_transfer_bytes: AtomicUsize::new(usize::MAX) }
    }
}

impl FrameStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_transfer_bytes(max: usize) -> Self {
        let storage = Self::default();
        storage.set_max_transfer_bytes(max);
        storage
    }

    pub fn max_transfer_bytes(&self) -> usize {
        self.max_transfer_bytes.load(Ordering::Relaxed)
    }

    /// Applies to frames stored from now on; transfers already buffered keep their bytes.
    pub fn set_max_transfer_bytes(&self, max: usize) {
        self.max_transfer_bytes.store(max, Ordering::Relaxed);
    }

    /// Feed one frame. Returns the completed transfer when `frame` finishes one.
    ///
    /// Lost or out-of-order frames are not errors: the affected transfer is dropped and
    /// `Ok(None)` is returned.
    pub fn store_frame(&self, frame: UavcanFrame) -> Result<Option<UavcanFrame>, UavcanError> {
        if frame.frame_type == FrameType::Single {
            return Ok(Some(frame));
        }
        let key = (frame.transfer_id, frame.subject_id);
        let mut slots = self.slots.lock();

        let max = self.max_transfer_bytes();

        if frame.frame_type == FrameType::MultiStart {
            if frame.payload.len() > max {
                warn!(transfer_id = key.0, subject_id = key.1, max, "start frame exceeds the transfer size limit");
                slots.remove(&key);
                return Ok(None);
            }
            if slots.insert(key, frame).is_some() {
                debug!(transfer_id = key.0, subject_id = key.1, "start frame replaced an unfinished transfer");
            }
            return Ok(None);
        }

        let Some(buffered) = slots.get_mut(&key) else {
            warn!(
                transfer_id = key.0,
                subject_id = key.1,
                "no start frame found for this transfer, frame discarded"
            );
            return Ok(None);
        };
        if buffered.toggle == frame.toggle {
            debug!(transfer_id = key.0, subject_id = key.1, "toggle bit did not alternate, transfer discarded");
            slots.remove(&key);
            return Ok(None);
        }
        buffered.append(&frame)?;
        if buffered.payload.len() > max {
            warn!(
                transfer_id = key.0,
                subject_id = key.1,
                max,
                "transfer exceeds the size limit, transfer discarded"
            );
            slots.remove(&key);
            return Ok(None);
        }
        if buffered.completed {
            return Ok(slots.remove(&key));
        }
        Ok(None)
    }

    /// Number of transfers currently being reassembled.
    pub fn pending(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn clear(&self) {
        self.slots.lock().clear();
    }
}
