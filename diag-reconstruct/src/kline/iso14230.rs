//! ISO 14230 (KWP2000 on K-Line) frame recognition
//!
//! Frame layout:
//!
//! ```text
//! FMT [TGT SRC] [LEN] DATA... CS
//! ```
//!
//! - FMT bits 0..5 carry the data length; 0 means an explicit LEN byte follows
//!   the header
//! - FMT bit 7 set means target and source address bytes are present
//! - CS is the mod-256 sum of every preceding byte of the frame

use super::ring::ByteWindow;
use crate::types::ReconstructError;
use std::ops::Range;

/// Outcome of parsing one candidate frame at a fixed offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameParse {
    /// Complete frame with a valid checksum occupying `start..end`
    Good { start: usize, end: usize },
    /// Frame complete but the checksum byte is wrong
    InvalidCs { expected: u8, found: u8 },
    /// Frame not complete yet; keep the bytes and retry later
    NotEnoughData,
    /// Parsing was started outside the buffered window
    InvalidState,
}

/// Result of scanning a window for the earliest valid frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Search {
    /// A valid frame; bytes before `frame.start` are garbage
    Found { frame: Range<usize> },
    /// No frame yet. The first `garbage` bytes can never start a valid frame
    /// no matter what arrives next.
    Pending { garbage: usize },
}

/// Smallest possible frame: FMT with inline length 1, one data byte, CS
pub const MIN_FRAME_LEN: usize = 3;

const FMT_ADDRESS_MODE: u8 = 0x80;
const FMT_LENGTH_MASK: u8 = 0x3F;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Fmt,
    Tgt,
    Src,
    Len,
    Data,
    Cs,
}

/// Try to parse exactly one frame starting at `offset`
pub fn parse_frame<W: ByteWindow + ?Sized>(window: &W, offset: usize) -> FrameParse {
    if offset >= window.len() {
        return FrameParse::InvalidState;
    }

    let mut state = State::Fmt;
    let mut checksum: u8 = 0;
    let mut data_len = 0usize;
    let mut remaining = 0usize;
    let mut header_len = 1usize;

    for i in offset..window.len() {
        let byte = window.at(i);
        match state {
            State::Fmt => {
                checksum = byte;
                data_len = (byte & FMT_LENGTH_MASK) as usize;
                let has_address = byte & FMT_ADDRESS_MODE != 0;
                if has_address {
                    header_len += 2;
                }
                if data_len == 0 {
                    header_len += 1;
                } else if offset + header_len + data_len + 1 > window.len() {
                    return FrameParse::NotEnoughData;
                }
                remaining = data_len;
                state = match (has_address, data_len) {
                    (true, _) => State::Tgt,
                    (false, 0) => State::Len,
                    (false, _) => State::Data,
                };
            }
            State::Tgt => {
                checksum = checksum.wrapping_add(byte);
                state = State::Src;
            }
            State::Src => {
                checksum = checksum.wrapping_add(byte);
                state = if data_len == 0 { State::Len } else { State::Data };
            }
            State::Len => {
                checksum = checksum.wrapping_add(byte);
                data_len = byte as usize;
                remaining = data_len;
                if offset + header_len + data_len + 1 > window.len() {
                    return FrameParse::NotEnoughData;
                }
                state = if data_len == 0 { State::Cs } else { State::Data };
            }
            State::Data => {
                checksum = checksum.wrapping_add(byte);
                remaining -= 1;
                if remaining == 0 {
                    state = State::Cs;
                }
            }
            State::Cs => {
                if byte == checksum {
                    return FrameParse::Good {
                        start: offset,
                        end: i + 1,
                    };
                }
                return FrameParse::InvalidCs {
                    expected: checksum,
                    found: byte,
                };
            }
        }
    }
    FrameParse::NotEnoughData
}

/// Slide over every offset of the window and return the earliest valid frame
///
/// A frame is only reported once every earlier offset has been ruled out. A
/// longer frame still waiting for bytes wins over a shorter frame nested
/// inside it, so the outcome does not depend on how the bytes were chunked.
pub fn search<W: ByteWindow + ?Sized>(window: &W) -> Search {
    let len = window.len();
    if len < MIN_FRAME_LEN {
        return Search::Pending { garbage: 0 };
    }

    let mut first_pending: Option<usize> = None;
    for offset in 0..len {
        match parse_frame(window, offset) {
            FrameParse::Good { start, end } => {
                return match first_pending {
                    Some(pending) => Search::Pending { garbage: pending },
                    None => Search::Found { frame: start..end },
                };
            }
            FrameParse::NotEnoughData => {
                first_pending.get_or_insert(offset);
            }
            FrameParse::InvalidCs { expected, found } => {
                log::trace!(
                    "ISO14230 candidate at {} rejected: {}",
                    offset,
                    ReconstructError::ChecksumMismatch { expected, found }
                );
            }
            FrameParse::InvalidState => {}
        }
    }
    Search::Pending {
        garbage: first_pending.unwrap_or(len),
    }
}

/// Mod-256 additive checksum as used by the CS byte
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_cs(mut frame: Vec<u8>) -> Vec<u8> {
        frame.push(checksum(&frame));
        frame
    }

    #[test]
    fn test_addressed_frame_with_inline_length() {
        // StartCommunication request: C1 33 F1 81 66
        let frame = [0xC1u8, 0x33, 0xF1, 0x81, 0x66];
        assert_eq!(parse_frame(&frame[..], 0), FrameParse::Good { start: 0, end: 5 });
    }

    #[test]
    fn test_frame_with_length_byte() {
        let frame = with_cs(vec![0x80, 0x10, 0xF1, 0x02, 0x21, 0x01]);
        assert_eq!(
            parse_frame(&frame[..], 0),
            FrameParse::Good { start: 0, end: frame.len() }
        );

        let no_addr = with_cs(vec![0x00, 0x03, 0x22, 0xF1, 0x90]);
        assert_eq!(
            parse_frame(&no_addr[..], 0),
            FrameParse::Good { start: 0, end: no_addr.len() }
        );
    }

    #[test]
    fn test_zero_length_payload() {
        let frame = with_cs(vec![0x80, 0x10, 0xF1, 0x00]);
        assert_eq!(parse_frame(&frame[..], 0), FrameParse::Good { start: 0, end: 5 });
    }

    #[test]
    fn test_not_enough_data_for_every_prefix() {
        let frame = with_cs(vec![0x83, 0xF1, 0x10, 0xC1, 0xEF, 0x8F]);
        for cut in 1..frame.len() {
            assert_eq!(parse_frame(&frame[..cut], 0), FrameParse::NotEnoughData, "cut {}", cut);
        }
    }

    #[test]
    fn test_invalid_checksum() {
        let frame = [0xC1u8, 0x33, 0xF1, 0x81, 0x67];
        assert_eq!(
            parse_frame(&frame[..], 0),
            FrameParse::InvalidCs { expected: 0x66, found: 0x67 }
        );
    }

    #[test]
    fn test_offset_outside_window() {
        let frame = [0xC1u8];
        assert_eq!(parse_frame(&frame[..], 1), FrameParse::InvalidState);
    }

    #[test]
    fn test_search_skips_leading_garbage() {
        let mut buf = vec![0xFEu8, 0x13];
        buf.extend_from_slice(&[0xC1, 0x33, 0xF1, 0x81, 0x66]);
        assert_eq!(search(&buf[..]), Search::Found { frame: 2..7 });
    }

    #[test]
    fn test_search_reports_dead_prefix() {
        // 0x01 0x05 0x07 is a complete frame with a bad checksum; 0x81 starts a
        // frame that still needs bytes.
        let buf = [0x01u8, 0x05, 0x07, 0x81, 0x10];
        match search(&buf[..]) {
            Search::Pending { garbage } => assert_eq!(garbage, 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_search_waits_for_enclosing_frame() {
        // 01 AA AB is a valid frame nested inside the payload of 05 ...
        let frame = with_cs(vec![0x05, 0x01, 0xAA, 0xAB, 0x10, 0x20]);
        assert_eq!(frame[6], 0x8B);
        for cut in 4..frame.len() {
            assert_eq!(search(&frame[..cut]), Search::Pending { garbage: 0 }, "cut {}", cut);
        }
        assert_eq!(search(&frame[..]), Search::Found { frame: 0..7 });
    }

    #[test]
    fn test_search_releases_nested_frame_after_bad_outer() {
        // The outer candidate completes with a wrong checksum, so the inner
        // frame is reported with the dead first byte as garbage.
        let buf = [0x05u8, 0x01, 0xAA, 0xAB, 0x10, 0x20, 0x00];
        assert_eq!(search(&buf[..]), Search::Found { frame: 1..4 });
    }

    #[test]
    fn test_search_needs_minimum_length() {
        assert_eq!(search(&[0x01u8, 0x01][..]), Search::Pending { garbage: 0 });
    }
}
