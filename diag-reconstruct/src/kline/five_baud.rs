//! 5-baud initialization detector
//!
//! After the tester clocks out the ECU address at 5 baud the line carries:
//!
//! ```text
//! [00 00] 55 KB1 KB2 ~KB2 [~ADDR]
//! ```
//!
//! KB2 selects the protocol that follows: 0x8A for KW1281 (the ECU does not
//! echo the inverted address), 0x8F for ISO 14230 (the inverted address byte
//! closes the sequence).

use super::ring::ByteWindow;
use std::ops::Range;

/// Synchronization pattern sent by the ECU
pub const SYNC_PATTERN: u8 = 0x55;

/// KB2 announcing KW1281
pub const KB2_KW1281: u8 = 0x8A;

/// KB2 announcing ISO 14230
pub const KB2_ISO14230: u8 = 0x8F;

/// Protocol announced by the key bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyBytesProtocol {
    Iso14230,
    Kw1281,
}

/// Completed init sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// Supported protocol; `range` covers 0x55 up to the last init byte
    Found {
        range: Range<usize>,
        protocol: KeyBytesProtocol,
        key_bytes: [u8; 2],
    },
    /// Valid key byte exchange announcing a protocol we do not parse
    Unsupported { range: Range<usize>, kb2: u8 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ConnectionPattern55,
    Kb1,
    Kb2,
    NKb2,
    NEcuAddress,
}

/// Scan the window for the first init sequence
///
/// A candidate whose fourth byte is not `~KB2` is abandoned and the scan
/// resumes right after its 0x55, so leading noise and stray 0x55 bytes are
/// tolerated.
pub fn search<W: ByteWindow + ?Sized>(window: &W) -> Option<Detection> {
    let mut state = State::ConnectionPattern55;
    let mut start = 0usize;
    let mut kb1 = 0u8;
    let mut kb2 = 0u8;
    let mut i = 0usize;

    while i < window.len() {
        let byte = window.at(i);
        match state {
            State::ConnectionPattern55 => {
                if byte == SYNC_PATTERN {
                    start = i;
                    state = State::Kb1;
                }
            }
            State::Kb1 => {
                kb1 = byte;
                state = State::Kb2;
            }
            State::Kb2 => {
                kb2 = byte;
                state = State::NKb2;
            }
            State::NKb2 => {
                if byte != !kb2 {
                    state = State::ConnectionPattern55;
                    i = start + 1;
                    continue;
                }
                match kb2 {
                    KB2_KW1281 => {
                        return Some(Detection::Found {
                            range: start..i + 1,
                            protocol: KeyBytesProtocol::Kw1281,
                            key_bytes: [kb1, kb2],
                        });
                    }
                    KB2_ISO14230 => state = State::NEcuAddress,
                    _ => {
                        return Some(Detection::Unsupported {
                            range: start..i + 1,
                            kb2,
                        });
                    }
                }
            }
            State::NEcuAddress => {
                return Some(Detection::Found {
                    range: start..i + 1,
                    protocol: KeyBytesProtocol::Iso14230,
                    key_bytes: [kb1, kb2],
                });
            }
        }
        i += 1;
    }
    None
}
