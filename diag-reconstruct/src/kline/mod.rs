//! Passive K-Line reconstruction
//!
//! [`KlineBus`] owns the byte buffer and decides which framer runs on it:
//!
//! - `Idle`: look for a 5-baud init first, fall back to a bare ISO 14230 frame
//! - `Iso14230`: ISO 14230 frames only
//! - `Kw1281`: KW1281 blocks only, entered after a KB2 = 0x8A init
//!
//! The bus returns to `Idle` after an idle timeout, a buffer overflow or a
//! KW1281 "end communication" block.

pub mod five_baud;
pub mod iso14230;
pub mod kw1281;
pub mod ring;

use crate::config::ReconstructConfig;
use crate::hexdump::{self, Hex};
use crate::types::{Protocol, ReconstructError, ReconstructedDatagram, Result};
use five_baud::{Detection, KeyBytesProtocol};
use ring::RingBuffer;
use serde::Serialize;
use std::fmt;
use std::ops::Range;

/// Protocol the bus is currently parsed as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum KlineBusState {
    #[default]
    Idle,
    Iso14230,
    Kw1281,
}

impl fmt::Display for KlineBusState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KlineBusState::Idle => write!(f, "Idle"),
            KlineBusState::Iso14230 => write!(f, "ISO14230"),
            KlineBusState::Kw1281 => write!(f, "KW1281"),
        }
    }
}

/// Counters kept for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KlineStats {
    pub bytes: u64,
    pub init_sequences: u64,
    pub iso14230_frames: u64,
    pub kw1281_blocks: u64,
    pub garbage_bytes: u64,
    pub overflows: u64,
    pub idle_resets: u64,
}

enum Step {
    Datagram(ReconstructedDatagram),
    Discarded,
    Waiting,
}

/// K-Line bus state machine
pub struct KlineBus {
    ring: RingBuffer,
    state: KlineBusState,
    idle_timeout_ms: u64,
    last_activity_ms: u64,
    stats: KlineStats,
}

impl KlineBus {
    pub fn new(config: &ReconstructConfig) -> Self {
        Self::with_limits(config.kline_buffer_capacity, config.kline_idle_timeout_ms)
    }

    pub fn with_limits(capacity: usize, idle_timeout_ms: u64) -> Self {
        Self {
            ring: RingBuffer::new(capacity),
            state: KlineBusState::Idle,
            idle_timeout_ms,
            last_activity_ms: 0,
            stats: KlineStats::default(),
        }
    }

    pub fn state(&self) -> KlineBusState {
        self.state
    }

    /// Number of bytes waiting in the buffer
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    pub fn stats(&self) -> &KlineStats {
        &self.stats
    }

    /// Append one byte and run the framer for the current state
    ///
    /// Returns every datagram completed by this byte. A full buffer is
    /// flushed, the bus drops back to `Idle` and
    /// [`ReconstructError::BufferOverflow`] is returned.
    pub fn feed(&mut self, byte: u8, now_ms: u64) -> Result<Vec<ReconstructedDatagram>> {
        log::trace!("K-Line byte 0x{:02X} @ {} ms ({})", byte, now_ms, self.state);
        self.stats.bytes += 1;

        if self.ring.push(byte).is_err() || self.ring.is_full() {
            let capacity = self.ring.capacity();
            log::warn!(
                "K-Line buffer overflow, dropping {} bytes:\n{}",
                self.ring.len(),
                hexdump::dump(&self.ring.contents())
            );
            self.stats.overflows += 1;
            self.stats.garbage_bytes += self.ring.len() as u64;
            self.reset();
            return Err(ReconstructError::BufferOverflow { capacity });
        }
        self.last_activity_ms = now_ms;

        let mut datagrams = Vec::new();
        loop {
            match self.step(now_ms) {
                Step::Datagram(datagram) => datagrams.push(datagram),
                Step::Discarded => {}
                Step::Waiting => break,
            }
            if self.ring.is_empty() {
                break;
            }
        }
        Ok(datagrams)
    }

    /// Fall back to `Idle` when the line has been quiet for too long
    ///
    /// Must be polled by the host loop. Returns true if the bus was reset.
    pub fn check_idle(&mut self, now_ms: u64) -> bool {
        let quiet = now_ms.saturating_sub(self.last_activity_ms) > self.idle_timeout_ms;
        if !quiet || (self.ring.is_empty() && self.state == KlineBusState::Idle) {
            return false;
        }

        if !self.ring.is_empty() {
            log::warn!(
                "K-Line idle with {} unparsed bytes:\n{}",
                self.ring.len(),
                hexdump::dump(&self.ring.contents())
            );
            self.stats.garbage_bytes += self.ring.len() as u64;
        }
        self.reset();
        self.stats.idle_resets += 1;
        log::info!("K-Line reset back to idle @ {} ms", now_ms);
        true
    }

    /// Drop buffered bytes and return to `Idle`
    pub fn reset(&mut self) {
        self.ring.clear();
        self.state = KlineBusState::Idle;
    }

    fn step(&mut self, now_ms: u64) -> Step {
        match self.state {
            KlineBusState::Idle => self.step_idle(now_ms),
            KlineBusState::Iso14230 => match iso14230::search(&self.ring) {
                iso14230::Search::Found { frame } => {
                    Step::Datagram(self.dequeue_iso14230(frame, now_ms))
                }
                iso14230::Search::Pending { garbage } if garbage > 0 => {
                    self.discard(garbage, "ISO14230");
                    Step::Discarded
                }
                iso14230::Search::Pending { .. } => Step::Waiting,
            },
            KlineBusState::Kw1281 => match kw1281::search(&self.ring) {
                Some(block) => Step::Datagram(self.dequeue_kw1281(block, now_ms)),
                None => Step::Waiting,
            },
        }
    }

    fn step_idle(&mut self, now_ms: u64) -> Step {
        match five_baud::search(&self.ring) {
            Some(Detection::Found {
                range,
                protocol,
                key_bytes,
            }) => {
                self.state = match protocol {
                    KeyBytesProtocol::Iso14230 => KlineBusState::Iso14230,
                    KeyBytesProtocol::Kw1281 => KlineBusState::Kw1281,
                };
                self.stats.init_sequences += 1;
                log::info!(
                    "5-baud init KB1=0x{:02X} KB2=0x{:02X}, bus switched to {}",
                    key_bytes[0],
                    key_bytes[1],
                    self.state
                );
                // Init sequences are reported with the ISO14230 tag whatever
                // protocol they announce.
                let init = self.take_frame(range, "5-baud init");
                log::debug!("5-baud init: {}", Hex(&init));
                return Step::Datagram(ReconstructedDatagram::new(Protocol::Iso14230, 0, now_ms, init));
            }
            Some(Detection::Unsupported { range, kb2 }) => {
                let error = ReconstructError::UnsupportedVariant(format!("K-Line KB2 0x{:02X}", kb2));
                log::error!("5-baud init rejected: {}", error);
                self.discard(range.end, "unsupported init");
                return Step::Discarded;
            }
            None => {}
        }

        if let iso14230::Search::Found { frame } = iso14230::search(&self.ring) {
            log::debug!("ISO14230 frame without 5-baud init, bus switched to ISO14230");
            self.state = KlineBusState::Iso14230;
            return Step::Datagram(self.dequeue_iso14230(frame, now_ms));
        }
        Step::Waiting
    }

    /// Remove `[0, range.end)`: garbage before `range.start`, frame after
    fn take_frame(&mut self, range: Range<usize>, what: &str) -> Vec<u8> {
        let mut taken = self.ring.consume_until(range.end);
        let frame = taken.split_off(range.start.min(taken.len()));
        if !taken.is_empty() {
            self.stats.garbage_bytes += taken.len() as u64;
            log::warn!("{} garbage bytes before {} frame: {}", taken.len(), what, Hex(&taken));
        }
        frame
    }

    fn dequeue_iso14230(&mut self, range: Range<usize>, now_ms: u64) -> ReconstructedDatagram {
        let frame = self.take_frame(range, "ISO14230");
        self.stats.iso14230_frames += 1;
        log::debug!("ISO14230 frame: {}", Hex(&frame));
        ReconstructedDatagram::new(Protocol::Iso14230, 0, now_ms, frame)
    }

    fn dequeue_kw1281(&mut self, range: Range<usize>, now_ms: u64) -> ReconstructedDatagram {
        let raw = self.take_frame(range, "KW1281");
        let block = kw1281::strip_complements(&raw);
        self.stats.kw1281_blocks += 1;
        log::debug!("KW1281 block: {}", Hex(&block));
        if kw1281::is_end_communication(&block) {
            log::info!("K-Line bus reset by KW1281 end communication");
            self.state = KlineBusState::Idle;
        }
        ReconstructedDatagram::new(Protocol::Kw1281, 0, now_ms, block)
    }

    fn discard(&mut self, count: usize, what: &str) {
        let garbage = self.ring.consume_until(count);
        self.stats.garbage_bytes += garbage.len() as u64;
        log::warn!("{} {} garbage bytes: {}", garbage.len(), what, Hex(&garbage));
    }
}
