//! Frame fragmentation and order-tolerant reassembly.
//!
//! The sending side [`cut`]s a frame into MTU-sized fragments sharing one
//! timestamp. The receiving side holds one [`FragmentList`] per peer
//! inside a [`FragmentManager`]: a pre-sized buffer plus the set of still
//! missing fragment indices. Fragments may arrive in any order and more
//! than once; the frame is complete exactly when the missing set empties.
//!
//! The transport is lossy and frames age fast, so the manager keeps only
//! the newest frame per peer: a fragment with a new timestamp evicts the
//! in-progress frame even if it never completed: freshness over
//! completeness.

use std::collections::BTreeSet;

use crate::media::{FrameTimestamp, MTU};
use crate::net::Endpoint;
use crate::proto::packets::FragmentPacket;
use crate::trace::{debug, warn};

/// Splits a frame into `ceil(len / MTU)` fragments.
///
/// Every fragment carries the same fresh timestamp, the total frame
/// size and its zero-based index; the last one may be shorter than the
/// MTU. An empty frame yields no fragments.
#[must_use]
pub fn cut(frame: &[u8], source: Endpoint) -> Vec<FragmentPacket> {
    let timestamp = FrameTimestamp::now();
    frame
        .chunks(MTU)
        .enumerate()
        .map(|(index, chunk)| FragmentPacket {
            payload: chunk.to_vec(),
            timestamp,
            index: index as u32,
            frame_size: frame.len() as u32,
            source,
        })
        .collect()
}

/// One frame being reassembled.
pub struct FragmentList {
    timestamp: FrameTimestamp,
    /// Pre-sized destination buffer; fragments land at `index * MTU`.
    data: Vec<u8>,
    missing: BTreeSet<u32>,
}

impl FragmentList {
    /// Prepares an empty frame of `size` bytes: all
    /// `ceil(size / MTU)` fragment indices start out missing.
    #[must_use]
    pub fn new(size: u32, timestamp: FrameTimestamp) -> Self {
        let size = size as usize;
        let fragments = size.div_ceil(MTU) as u32;
        Self {
            timestamp,
            data: vec![0; size],
            missing: (0..fragments).collect(),
        }
    }

    /// The frame timestamp this list is keyed on.
    #[must_use]
    pub fn timestamp(&self) -> FrameTimestamp {
        self.timestamp
    }

    /// Writes a fragment's payload at its slot and marks the index
    /// received.
    ///
    /// Re-adding an index is a no-op beyond overwriting the same bytes.
    /// A fragment that does not fit the declared frame (index out of
    /// range, payload overrunning the buffer) is logged and ignored, so
    /// the missing set always stays within the frame's index range.
    pub fn add_fragment(&mut self, fragment: &FragmentPacket) {
        let offset = fragment.index as usize * MTU;
        let end = offset + fragment.payload.len();
        if end > self.data.len() || fragment.payload.len() > MTU {
            warn!(
                index = fragment.index,
                payload = fragment.payload.len(),
                frame = self.data.len(),
                "fragment does not fit its frame, ignoring"
            );
            return;
        }
        self.data[offset..end].copy_from_slice(&fragment.payload);
        self.missing.remove(&fragment.index);
    }

    /// Whether every fragment index has been received at least once.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty()
    }

    /// Number of indices still missing.
    #[must_use]
    pub fn missing_count(&self) -> usize {
        self.missing.len()
    }

    /// The assembled frame; only meaningful once complete.
    #[must_use]
    pub fn into_data(self) -> Vec<u8> {
        self.data
    }
}

/// Per-peer reassembly slot: at most one frame in flight.
///
/// Not internally synchronized; the receiving thread of one peer is the
/// single writer.
#[derive(Default)]
pub struct FragmentManager {
    current: Option<FragmentList>,
}

impl FragmentManager {
    /// Creates an empty manager.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds one fragment.
    ///
    /// A timestamp different from the in-progress frame discards that
    /// frame, complete or not, and starts a new one sized from the
    /// fragment's declared total.
    pub fn eat(&mut self, fragment: &FragmentPacket) {
        let stale = self
            .current
            .as_ref()
            .is_some_and(|list| list.timestamp() != fragment.timestamp);
        if stale {
            if let Some(list) = self.current.take()
                && !list.is_complete()
            {
                debug!(
                    timestamp = %list.timestamp(),
                    missing = list.missing_count(),
                    "newer frame arrived, dropping incomplete one"
                );
            }
        }
        let list = self.current.get_or_insert_with(|| {
            FragmentList::new(fragment.frame_size, fragment.timestamp)
        });
        list.add_fragment(fragment);
    }

    /// Whether the in-progress frame is fully assembled.
    #[must_use]
    pub fn has_complete_frame(&self) -> bool {
        self.current.as_ref().is_some_and(FragmentList::is_complete)
    }

    /// Takes the assembled frame out, clearing the slot.
    ///
    /// Returns `None` while the frame is still incomplete.
    #[must_use]
    pub fn take_complete_frame(&mut self) -> Option<Vec<u8>> {
        if self.has_complete_frame() {
            self.current.take().map(FragmentList::into_data)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source() -> Endpoint {
        Endpoint::new_v4(10, 0, 0, 7, 9000)
    }

    fn frame_of(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn cut_splits_at_mtu() {
        let frame = frame_of(3600);
        let fragments = cut(&frame, source());
        assert_eq!(fragments.len(), 3);
        assert_eq!(fragments[0].payload.len(), 1500);
        assert_eq!(fragments[1].payload.len(), 1500);
        assert_eq!(fragments[2].payload.len(), 600);
        assert_eq!(
            fragments.iter().map(|f| f.index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        // One shared timestamp and the full size on every fragment.
        assert!(fragments.iter().all(|f| f.timestamp == fragments[0].timestamp));
        assert!(fragments.iter().all(|f| f.frame_size == 3600));
    }

    #[test]
    fn cut_exact_multiple_has_no_runt() {
        let fragments = cut(&frame_of(3000), source());
        assert_eq!(fragments.len(), 2);
        assert!(fragments.iter().all(|f| f.payload.len() == 1500));
    }

    #[test]
    fn single_byte_frame() {
        let frame = vec![0xA5];
        let fragments = cut(&frame, source());
        assert_eq!(fragments.len(), 1);

        let mut manager = FragmentManager::new();
        manager.eat(&fragments[0]);
        assert_eq!(manager.take_complete_frame().unwrap(), frame);
    }

    #[test]
    fn out_of_order_delivery_completes_on_last() {
        let frame = frame_of(3600);
        let fragments = cut(&frame, source());

        let mut manager = FragmentManager::new();
        manager.eat(&fragments[2]);
        assert!(!manager.has_complete_frame());
        manager.eat(&fragments[0]);
        assert!(!manager.has_complete_frame());
        manager.eat(&fragments[1]);
        assert!(manager.has_complete_frame());
        assert_eq!(manager.take_complete_frame().unwrap(), frame);
        // Taking clears the slot.
        assert!(!manager.has_complete_frame());
    }

    #[test]
    fn duplicates_are_idempotent() {
        let frame = frame_of(4000);
        let fragments = cut(&frame, source());

        let mut manager = FragmentManager::new();
        manager.eat(&fragments[1]);
        manager.eat(&fragments[1]);
        manager.eat(&fragments[0]);
        manager.eat(&fragments[0]);
        assert!(!manager.has_complete_frame());
        manager.eat(&fragments[2]);
        assert_eq!(manager.take_complete_frame().unwrap(), frame);
    }

    #[test]
    fn any_order_with_duplicates_reconstructs() {
        for len in [1, 1499, 1500, 1501, 7321] {
            let frame = frame_of(len);
            let fragments = cut(&frame, source());
            let mut manager = FragmentManager::new();
            // Deliver in reverse, each fragment twice.
            for fragment in fragments.iter().rev() {
                manager.eat(fragment);
                manager.eat(fragment);
            }
            assert_eq!(manager.take_complete_frame().unwrap(), frame, "len {len}");
        }
    }

    #[test]
    fn newer_timestamp_evicts_incomplete_frame() {
        let old_frame = frame_of(3600);
        let new_frame = frame_of(1800);
        let old = cut(&old_frame, source());
        let new = cut(&new_frame, source());
        assert_ne!(old[0].timestamp, new[0].timestamp);

        let mut manager = FragmentManager::new();
        manager.eat(&old[0]);
        manager.eat(&old[1]);

        // The newer frame takes the slot over; the old one is gone even
        // though it never completed.
        manager.eat(&new[1]);
        assert!(!manager.has_complete_frame());

        manager.eat(&new[0]);
        assert!(manager.has_complete_frame());
        assert_eq!(manager.take_complete_frame().unwrap(), new_frame);
    }

    #[test]
    fn oversized_fragment_is_ignored() {
        let mut list = FragmentList::new(1000, FrameTimestamp::from_micros(1));
        let rogue = FragmentPacket {
            payload: frame_of(1500),
            timestamp: FrameTimestamp::from_micros(1),
            index: 0,
            frame_size: 1000,
            source: source(),
        };
        list.add_fragment(&rogue);
        assert!(!list.is_complete());
        assert_eq!(list.missing_count(), 1);
    }

    #[test]
    fn out_of_range_index_is_ignored() {
        let mut list = FragmentList::new(1000, FrameTimestamp::from_micros(1));
        let rogue = FragmentPacket {
            payload: vec![1, 2, 3],
            timestamp: FrameTimestamp::from_micros(1),
            index: 40,
            frame_size: 1000,
            source: source(),
        };
        list.add_fragment(&rogue);
        assert_eq!(list.missing_count(), 1);
    }
}
