//! KW1281 block recognition
//!
//! Every block byte except the trailing ETX is echoed back inverted by the
//! other side, so the sniffed stream looks like:
//!
//! ```text
//! 0F F0   block length (counts itself)
//! 01 FE   block counter
//! F6 09   block title
//! ...     data / ~data pairs
//! 03      ETX, not complemented
//! ```

use super::ring::ByteWindow;
use std::ops::Range;

/// Block end byte
pub const ETX: u8 = 0x03;

/// Block title of the "end communication" command
pub const TITLE_END_COMMUNICATION: u8 = 0x06;

/// Position of the block title in a de-paired block
const TITLE_INDEX: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Data,
    DataComplement,
    Etx,
}

/// Find the first complete block in the window
///
/// A byte that is not the complement of its predecessor restarts pairing at
/// that very byte, which becomes the candidate length byte of a new block.
pub fn search<W: ByteWindow + ?Sized>(window: &W) -> Option<Range<usize>> {
    let mut state = State::Data;
    let mut start = 0usize;
    let mut paired = 0usize;
    let mut expected = 0usize;
    let mut data = 0u8;

    for i in 0..window.len() {
        let byte = window.at(i);
        match state {
            State::Data => {
                data = byte;
                if paired == 0 {
                    start = i;
                }
                state = State::DataComplement;
            }
            State::DataComplement => {
                if byte == !data {
                    paired += 1;
                    if paired == 1 {
                        expected = data as usize;
                    }
                    state = if paired == expected {
                        State::Etx
                    } else {
                        State::Data
                    };
                } else {
                    paired = 0;
                    data = byte;
                    start = i;
                }
            }
            State::Etx => {
                if byte == ETX {
                    return Some(start..i + 1);
                }
                paired = 0;
                data = byte;
                start = i;
                state = State::DataComplement;
            }
        }
    }
    None
}

/// Drop the complement bytes, keeping positions 0, 2, 4... (ETX included)
pub fn strip_complements(raw: &[u8]) -> Vec<u8> {
    raw.iter().step_by(2).copied().collect()
}

/// True if a de-paired block carries the "end communication" title
pub fn is_end_communication(block: &[u8]) -> bool {
    block.get(TITLE_INDEX) == Some(&TITLE_END_COMMUNICATION)
}
