//! H4 stream framing
//!
//! UART style transports deliver HCI packets as an unstructured byte stream
//! where each packet is prefixed by its one-byte type indicator. The
//! [`H4Decoder`] reassembles complete frames from arbitrary chunks. On a
//! framing error it drops the offending bytes and sets a resynchronization
//! marker: bytes are then skipped until the next plausible packet indicator.

use crate::error::HciError;
use crate::hci::constants::*;
use crate::hci::packet::HciPacket;
use log::{debug, warn};
use std::collections::VecDeque;

/// Incremental H4 frame decoder
#[derive(Debug)]
pub struct H4Decoder {
    buffer: VecDeque<u8>,
    max_frame_len: usize,
    resync: bool,
    dropped: usize,
}

fn is_inbound_indicator(byte: u8) -> bool {
    matches!(byte, HCI_ACL_PKT | HCI_SCO_PKT | HCI_EVENT_PKT | HCI_ISO_PKT)
}

impl H4Decoder {
    pub fn new(max_frame_len: usize) -> Self {
        Self {
            buffer: VecDeque::new(),
            max_frame_len,
            resync: false,
            dropped: 0,
        }
    }

    /// Append received bytes
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend(data);
    }

    /// True while the decoder is discarding bytes after a framing error
    pub fn resyncing(&self) -> bool {
        self.resync
    }

    /// Total number of bytes discarded so far
    pub fn dropped_bytes(&self) -> usize {
        self.dropped
    }

    fn drop_front(&mut self, count: usize) {
        self.buffer.drain(..count);
        self.dropped += count;
    }

    /// Extract the next complete frame
    ///
    /// Returns `None` when more bytes are needed. A framing error is returned
    /// once; the decoder has already recovered and can be polled again.
    pub fn next_frame(&mut self) -> Option<Result<Vec<u8>, HciError>> {
        if self.resync {
            let skip = self
                .buffer
                .iter()
                .position(|&b| is_inbound_indicator(b))
                .unwrap_or(self.buffer.len());
            self.drop_front(skip);
            if self.buffer.is_empty() {
                return None;
            }
            debug!("H4 resynchronized after {} dropped bytes", self.dropped);
            self.resync = false;
        }

        let &packet_type = self.buffer.front()?;
        if !is_inbound_indicator(packet_type) {
            warn!("H4 unknown packet indicator 0x{:02x}", packet_type);
            self.drop_front(1);
            self.resync = true;
            return Some(Err(HciError::UnknownPacketType(packet_type)));
        }

        let header: Vec<u8> = self.buffer.iter().skip(1).take(HCI_ACL_HDR_SIZE).copied().collect();
        let (hdr_len, payload_len) = match HciPacket::declared_len(packet_type, &header) {
            Ok(Some(lens)) => lens,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };

        let total = 1 + hdr_len + payload_len;
        if total > self.max_frame_len {
            warn!(
                "H4 frame of {} bytes exceeds limit {}, resynchronizing",
                total, self.max_frame_len
            );
            self.drop_front(1);
            self.resync = true;
            return Some(Err(HciError::LengthMismatch {
                declared: payload_len,
                available: self.max_frame_len.saturating_sub(1 + hdr_len),
            }));
        }

        if self.buffer.len() < total {
            return None;
        }

        Some(Ok(self.buffer.drain(..total).collect()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frames_split_across_chunks() {
        let mut decoder = H4Decoder::new(1028);
        let frame = [HCI_EVENT_PKT, EVT_CMD_COMPLETE, 4, 1, 0x03, 0x0C, 0x00];

        decoder.feed(&frame[..3]);
        assert!(decoder.next_frame().is_none());
        decoder.feed(&frame[3..]);
        decoder.feed(&[HCI_ACL_PKT, 0x40, 0x00, 0x02]);

        assert_eq!(decoder.next_frame().unwrap().unwrap(), frame.to_vec());
        assert!(decoder.next_frame().is_none());

        decoder.feed(&[0x00, 0xAA, 0xBB]);
        let acl = decoder.next_frame().unwrap().unwrap();
        assert_eq!(acl, vec![HCI_ACL_PKT, 0x40, 0x00, 0x02, 0x00, 0xAA, 0xBB]);
    }

    #[test]
    fn test_garbage_triggers_resync() {
        let mut decoder = H4Decoder::new(1028);
        decoder.feed(&[0x7F, 0x00, 0x11]);
        decoder.feed(&[HCI_EVENT_PKT, EVT_HARDWARE_ERROR, 1, 0x05]);

        assert!(matches!(
            decoder.next_frame(),
            Some(Err(HciError::UnknownPacketType(0x7F)))
        ));
        assert!(decoder.resyncing());

        let frame = decoder.next_frame().unwrap().unwrap();
        assert_eq!(frame, vec![HCI_EVENT_PKT, EVT_HARDWARE_ERROR, 1, 0x05]);
        assert!(!decoder.resyncing());
        assert_eq!(decoder.dropped_bytes(), 3);
    }

    #[test]
    fn test_oversized_frame_is_rejected() {
        let mut decoder = H4Decoder::new(16);
        decoder.feed(&[HCI_ACL_PKT, 0x01, 0x00, 0xFF, 0x00]);
        assert!(matches!(
            decoder.next_frame(),
            Some(Err(HciError::LengthMismatch { declared: 255, .. }))
        ));
        assert!(decoder.resyncing());
    }
}
