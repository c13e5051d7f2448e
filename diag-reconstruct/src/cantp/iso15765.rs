//! ISO 15765-2 (ISO-TP) passive reassembly
//!
//! The high nibble of the first byte (N_PCI) selects the frame type:
//!
//! | N_PCI | Frame              | Layout                                  |
//! |-------|--------------------|-----------------------------------------|
//! | 0     | Single Frame       | `0L d1..dL`                             |
//! | 1     | First Frame        | `1L LL d1..d6`, 12-bit total length     |
//! | 2     | Consecutive Frame  | `2N d1..d7`, N = sequence number mod 16 |
//! | 3     | Flow Control       | ignored when sniffing                   |
//!
//! One session is shared by every allow-listed ID, so interleaved multi-frame
//! transfers from two ECUs corrupt each other.

use super::FrameOutcome;
use crate::config::ReconstructConfig;
use crate::hexdump::Hex;
use crate::types::{CanMessage, Protocol, ReconstructError, ReconstructedDatagram};

/// Largest length a 12-bit First Frame can announce
pub const MAX_DATAGRAM_LEN: usize = 0xFFF;

/// Decoded N_PCI
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pci {
    SingleFrame { len: usize },
    FirstFrame { len: usize },
    ConsecutiveFrame { sequence: u8 },
    FlowControl,
    Invalid(u8),
}

impl Pci {
    /// Decode the PCI of a non-empty frame payload
    pub fn decode(data: &[u8]) -> Pci {
        let Some(&first) = data.first() else {
            return Pci::Invalid(0);
        };
        let low = (first & 0x0F) as usize;
        match first >> 4 {
            0 => Pci::SingleFrame { len: low },
            1 => match data.get(1) {
                Some(&second) => Pci::FirstFrame {
                    len: (low << 8) | second as usize,
                },
                None => Pci::Invalid(first),
            },
            2 => Pci::ConsecutiveFrame {
                sequence: first & 0x0F,
            },
            3 => Pci::FlowControl,
            _ => Pci::Invalid(first),
        }
    }
}

#[derive(Debug)]
struct Session {
    remaining: usize,
    next_sequence: u8,
    payload: Vec<u8>,
}

impl Session {
    /// Append up to `remaining` bytes; true once the datagram is complete
    fn append(&mut self, bytes: &[u8]) -> bool {
        let take = bytes.len().min(self.remaining);
        self.payload.extend_from_slice(&bytes[..take]);
        self.remaining -= take;
        self.remaining == 0
    }
}

/// ISO-TP reassembler over a fixed allow-list of CAN IDs
pub struct Iso15765Reassembler {
    allowed_ids: Vec<u32>,
    session: Option<Session>,
    sequence_mismatches: u64,
}

impl Iso15765Reassembler {
    pub fn new(allowed_ids: Vec<u32>) -> Self {
        Self {
            allowed_ids,
            session: None,
            sequence_mismatches: 0,
        }
    }

    pub fn from_config(config: &ReconstructConfig) -> Self {
        Self::new(config.iso15765_ids.clone())
    }

    /// True while a multi-frame datagram is being collected
    pub fn is_pending(&self) -> bool {
        self.session.is_some()
    }

    pub fn sequence_mismatches(&self) -> u64 {
        self.sequence_mismatches
    }

    /// Drop any partially collected datagram
    pub fn reset(&mut self) {
        self.session = None;
    }

    /// Process one frame
    ///
    /// Frames from IDs outside the allow-list, empty frames and frames with an
    /// invalid PCI are reported as [`FrameOutcome::NotHandled`].
    pub fn feed(&mut self, msg: &CanMessage) -> FrameOutcome {
        if !self.allowed_ids.contains(&msg.id) || msg.dlc() == 0 {
            return FrameOutcome::NotHandled;
        }
        let data = msg.data();

        match Pci::decode(data) {
            Pci::SingleFrame { len } => self.single_frame(msg, len),
            Pci::FirstFrame { len } => self.first_frame(msg, len),
            Pci::ConsecutiveFrame { sequence } => self.consecutive_frame(msg, sequence),
            Pci::FlowControl => FrameOutcome::Consumed,
            Pci::Invalid(pci) => {
                let error = ReconstructError::UnsupportedVariant(format!("PCI byte 0x{:02X}", pci));
                log::error!("ISO15765 on 0x{:X}: {}", msg.id, error);
                FrameOutcome::NotHandled
            }
        }
    }

    fn single_frame(&mut self, msg: &CanMessage, len: usize) -> FrameOutcome {
        self.abandon_pending();
        let data = msg.data();
        if len > data.len() - 1 {
            log::warn!(
                "ISO15765: single frame on 0x{:X} announces {} bytes but carries {}",
                msg.id,
                len,
                data.len() - 1
            );
            return FrameOutcome::Consumed;
        }
        FrameOutcome::Datagram(self.datagram(msg, data[1..1 + len].to_vec()))
    }

    fn first_frame(&mut self, msg: &CanMessage, len: usize) -> FrameOutcome {
        self.abandon_pending();
        if len == 0 {
            log::warn!("ISO15765: first frame on 0x{:X} announces zero length", msg.id);
            return FrameOutcome::Consumed;
        }

        let mut session = Session {
            remaining: len,
            next_sequence: 1,
            payload: Vec::with_capacity(len),
        };
        log::trace!("ISO15765: first frame on 0x{:X}, {} bytes", msg.id, len);
        if session.append(&msg.data()[2..]) {
            return FrameOutcome::Datagram(self.datagram(msg, session.payload));
        }
        self.session = Some(session);
        FrameOutcome::Consumed
    }

    fn consecutive_frame(&mut self, msg: &CanMessage, sequence: u8) -> FrameOutcome {
        let Some(session) = self.session.as_mut() else {
            log::warn!(
                "ISO15765: consecutive frame 0x{:X} on 0x{:X} without a first frame",
                sequence,
                msg.id
            );
            return FrameOutcome::Consumed;
        };

        if sequence != session.next_sequence {
            let mismatch = ReconstructError::SequenceMismatch {
                expected: session.next_sequence,
                received: sequence,
            };
            log::warn!("ISO15765 on 0x{:X}: {}", msg.id, mismatch);
            self.sequence_mismatches += 1;
        }
        session.next_sequence = (sequence + 1) & 0x0F;

        if session.append(&msg.data()[1..]) {
            let payload = self.session.take().map(|s| s.payload).unwrap_or_default();
            return FrameOutcome::Datagram(self.datagram(msg, payload));
        }
        FrameOutcome::Consumed
    }

    fn abandon_pending(&mut self) {
        if let Some(session) = self.session.take() {
            log::warn!(
                "ISO15765: new datagram while {} bytes are buffered, still missing {}: {}",
                session.payload.len(),
                session.remaining,
                Hex(&session.payload)
            );
        }
    }

    fn datagram(&self, msg: &CanMessage, payload: Vec<u8>) -> ReconstructedDatagram {
        log::debug!("ISO15765 datagram on 0x{:X}: {}", msg.id, Hex(&payload));
        ReconstructedDatagram::new(Protocol::Iso15765, msg.id, msg.timestamp_ms, payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(id: u32, data: &[u8]) -> CanMessage {
        CanMessage::new(id, data, 100)
    }

    fn datagram(outcome: FrameOutcome) -> ReconstructedDatagram {
        match outcome {
            FrameOutcome::Datagram(d) => d,
            other => panic!("expected datagram, got {:?}", other),
        }
    }

    #[test]
    fn test_pci_decode() {
        assert_eq!(Pci::decode(&[0x03, 0x22]), Pci::SingleFrame { len: 3 });
        assert_eq!(Pci::decode(&[0x11, 0x23]), Pci::FirstFrame { len: 0x123 });
        assert_eq!(Pci::decode(&[0x10]), Pci::Invalid(0x10));
        assert_eq!(Pci::decode(&[0x2F]), Pci::ConsecutiveFrame { sequence: 0xF });
        assert_eq!(Pci::decode(&[0x30, 0x00, 0x00]), Pci::FlowControl);
        assert_eq!(Pci::decode(&[0x45]), Pci::Invalid(0x45));
    }

    #[test]
    fn test_single_frame() {
        let mut tp = Iso15765Reassembler::new(vec![0x7E8]);
        let d = datagram(tp.feed(&frame(0x7E8, &[0x03, 0x01, 0x02, 0x03])));
        assert_eq!(d.payload, vec![0x01, 0x02, 0x03]);
        assert_eq!(d.id, 0x7E8);
        assert_eq!(d.protocol, Protocol::Iso15765);
        assert_eq!(d.timestamp_ms, 100);
    }

    #[test]
    fn test_single_frame_length_exceeds_dlc() {
        let mut tp = Iso15765Reassembler::new(vec![0x7E8]);
        assert_eq!(tp.feed(&frame(0x7E8, &[0x05, 0x01, 0x02])), FrameOutcome::Consumed);
    }

    #[test]
    fn test_multi_frame() {
        let mut tp = Iso15765Reassembler::new(vec![0x7E0, 0x7E8]);
        assert_eq!(
            tp.feed(&frame(0x7E8, &[0x10, 0x0A, 0, 1, 2, 3, 4, 5])),
            FrameOutcome::Consumed
        );
        assert!(tp.is_pending());
        assert_eq!(tp.feed(&frame(0x7E0, &[0x30, 0x00, 0x00])), FrameOutcome::Consumed);
        let d = datagram(tp.feed(&frame(0x7E8, &[0x21, 6, 7, 8, 9])));
        assert_eq!(d.payload, (0..10).collect::<Vec<u8>>());
        assert!(!tp.is_pending());
        assert_eq!(tp.sequence_mismatches(), 0);
    }

    #[test]
    fn test_first_frame_fitting_entirely() {
        let mut tp = Iso15765Reassembler::new(vec![0x7E8]);
        let d = datagram(tp.feed(&frame(0x7E8, &[0x10, 0x04, 9, 8, 7, 6, 0xAA, 0xAA])));
        assert_eq!(d.payload, vec![9, 8, 7, 6]);
        assert!(!tp.is_pending());
    }

    #[test]
    fn test_sequence_mismatch_resynchronizes() {
        let mut tp = Iso15765Reassembler::new(vec![0x7E8]);
        tp.feed(&frame(0x7E8, &[0x10, 0x14, 0, 1, 2, 3, 4, 5]));
        // S/N 2 instead of 1: logged, adopted, session kept
        assert_eq!(tp.feed(&frame(0x7E8, &[0x22, 6, 7, 8, 9, 10, 11, 12])), FrameOutcome::Consumed);
        assert_eq!(tp.sequence_mismatches(), 1);
        let d = datagram(tp.feed(&frame(0x7E8, &[0x23, 13, 14, 15, 16, 17, 18, 19])));
        assert_eq!(d.payload, (0..20).collect::<Vec<u8>>());
        assert_eq!(tp.sequence_mismatches(), 1);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut tp = Iso15765Reassembler::new(vec![0x7E8]);
        // 6 + 16 * 7 = 118 bytes: sequence numbers 1..=15, 0, 1
        let total = 6 + 16 * 7;
        tp.feed(&frame(0x7E8, &[0x10, total as u8, 0, 0, 0, 0, 0, 0]));
        let mut result = None;
        for n in 1..=16u8 {
            let pci = 0x20 | (n & 0x0F);
            if let FrameOutcome::Datagram(d) = tp.feed(&frame(0x7E8, &[pci, 0, 0, 0, 0, 0, 0, 0])) {
                result = Some(d);
            }
        }
        assert_eq!(result.map(|d| d.len()), Some(total));
        assert_eq!(tp.sequence_mismatches(), 0);
    }

    #[test]
    fn test_new_single_frame_abandons_session() {
        let mut tp = Iso15765Reassembler::new(vec![0x7E8]);
        tp.feed(&frame(0x7E8, &[0x10, 0x20, 0, 1, 2, 3, 4, 5]));
        let d = datagram(tp.feed(&frame(0x7E8, &[0x02, 0x7E, 0x00])));
        assert_eq!(d.payload, vec![0x7E, 0x00]);
        assert!(!tp.is_pending());
        assert_eq!(tp.feed(&frame(0x7E8, &[0x21, 1, 2])), FrameOutcome::Consumed);
    }

    #[test]
    fn test_new_first_frame_abandons_session() {
        let mut tp = Iso15765Reassembler::new(vec![0x7E8]);
        assert_eq!(
            tp.feed(&frame(0x7E8, &[0x10, 0x0A, 0, 1, 2, 3, 4, 5])),
            FrameOutcome::Consumed
        );
        assert_eq!(
            tp.feed(&frame(0x7E8, &[0x10, 0x09, 0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5])),
            FrameOutcome::Consumed
        );
        assert!(tp.is_pending());

        let d = datagram(tp.feed(&frame(0x7E8, &[0x21, 0xA6, 0xA7, 0xA8])));
        assert_eq!(d.payload, vec![0xA0, 0xA1, 0xA2, 0xA3, 0xA4, 0xA5, 0xA6, 0xA7, 0xA8]);
        assert!(!tp.is_pending());
        assert_eq!(tp.sequence_mismatches(), 0);
        assert_eq!(tp.feed(&frame(0x7E8, &[0x22, 6, 7, 8, 9])), FrameOutcome::Consumed);
    }

    #[test]
    fn test_filtering() {
        let mut tp = Iso15765Reassembler::new(vec![0x7E8]);
        assert_eq!(tp.feed(&frame(0x123, &[0x02, 0x01, 0x02])), FrameOutcome::NotHandled);
        assert_eq!(tp.feed(&frame(0x7E8, &[])), FrameOutcome::NotHandled);
        assert_eq!(tp.feed(&frame(0x7E8, &[0x45, 0x00])), FrameOutcome::NotHandled);
    }
}
