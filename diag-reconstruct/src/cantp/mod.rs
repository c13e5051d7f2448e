//! CAN transport protocol reconstruction
//!
//! [`CanDispatcher`] routes every CAN frame through the ignore list, then
//! ISO 15765 and finally VW TP 2.0. The first reassembler that recognises a
//! frame consumes it.

pub mod iso15765;
pub mod vwtp20;

use crate::config::ReconstructConfig;
use crate::types::{CanMessage, Protocol, ReconstructedDatagram};
use iso15765::Iso15765Reassembler;
use serde::Serialize;
use vwtp20::Vwtp20Reassembler;

/// Result of offering a frame to a reassembler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameOutcome {
    /// Frame does not belong to this protocol
    NotHandled,
    /// Frame was used, no datagram finished yet
    Consumed,
    /// Frame completed a datagram
    Datagram(ReconstructedDatagram),
}

/// Counters kept for diagnostics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CanStats {
    pub frames: u64,
    pub ignored: u64,
    pub unhandled: u64,
    pub iso15765_datagrams: u64,
    pub vwtp20_datagrams: u64,
    pub sequence_mismatches: u64,
    pub vwtp20_header_anomalies: u64,
    pub vwtp20_dropped: u64,
}

/// Routes CAN frames to the transport reassemblers
pub struct CanDispatcher {
    ignored_ids: Vec<u32>,
    enable_iso15765: bool,
    enable_vwtp20: bool,
    iso15765: Iso15765Reassembler,
    vwtp20: Vwtp20Reassembler,
    frames: u64,
    ignored: u64,
    unhandled: u64,
    iso15765_datagrams: u64,
    vwtp20_datagrams: u64,
}

impl CanDispatcher {
    pub fn new(config: &ReconstructConfig) -> Self {
        Self {
            ignored_ids: config.ignored_ids.clone(),
            enable_iso15765: config.enable_iso15765,
            enable_vwtp20: config.enable_vwtp20,
            iso15765: Iso15765Reassembler::from_config(config),
            vwtp20: Vwtp20Reassembler::new(),
            frames: 0,
            ignored: 0,
            unhandled: 0,
            iso15765_datagrams: 0,
            vwtp20_datagrams: 0,
        }
    }

    pub fn iso15765(&self) -> &Iso15765Reassembler {
        &self.iso15765
    }

    pub fn vwtp20(&self) -> &Vwtp20Reassembler {
        &self.vwtp20
    }

    /// Offer one frame; returns the datagram it completed, if any
    pub fn feed(&mut self, msg: &CanMessage) -> Option<ReconstructedDatagram> {
        self.frames += 1;
        log::trace!(
            "CAN 0x{:X} [{}] {:02X?} @ {} ms",
            msg.id,
            msg.dlc,
            msg.data(),
            msg.timestamp_ms
        );

        if self.ignored_ids.contains(&msg.id) {
            self.ignored += 1;
            return None;
        }

        if self.enable_iso15765 {
            match self.iso15765.feed(msg) {
                FrameOutcome::NotHandled => {}
                outcome => return self.finish(outcome),
            }
        }

        if self.enable_vwtp20 {
            match self.vwtp20.feed(msg) {
                FrameOutcome::NotHandled => {}
                outcome => return self.finish(outcome),
            }
        }

        self.unhandled += 1;
        None
    }

    /// Abandon every partial transfer
    pub fn reset(&mut self) {
        self.iso15765.reset();
        self.vwtp20 = Vwtp20Reassembler::new();
    }

    pub fn stats(&self) -> CanStats {
        CanStats {
            frames: self.frames,
            ignored: self.ignored,
            unhandled: self.unhandled,
            iso15765_datagrams: self.iso15765_datagrams,
            vwtp20_datagrams: self.vwtp20_datagrams,
            sequence_mismatches: self.iso15765.sequence_mismatches(),
            vwtp20_header_anomalies: self.vwtp20.header_anomalies(),
            vwtp20_dropped: self.vwtp20.dropped(),
        }
    }

    fn finish(&mut self, outcome: FrameOutcome) -> Option<ReconstructedDatagram> {
        let FrameOutcome::Datagram(datagram) = outcome else {
            return None;
        };
        match datagram.protocol {
            Protocol::Iso15765 => self.iso15765_datagrams += 1,
            Protocol::Vwtp20 => self.vwtp20_datagrams += 1,
            _ => {}
        }
        Some(datagram)
    }
}
