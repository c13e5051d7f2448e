//! VW TP 2.0 passive reassembly
//!
//! Channel setup happens on the broadcast range 0x200..0x2FF (DLC 7):
//!
//! ```text
//! [ecu address] [opcode] [tx id lo] [tx id hi] [rx id lo] [rx id hi] [app type]
//! ```
//!
//! A positive response (opcode 0xD0) binds the two dynamic IDs of the unicast
//! channel. Every unicast frame starts with a TCPI byte; data frames carry a
//! datagram whose first two bytes are its big-endian length.

use super::FrameOutcome;
use crate::hexdump::Hex;
use crate::types::{CanMessage, Protocol, ReconstructError, ReconstructedDatagram};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::ops::Range;

/// Broadcast channel IDs
pub const BROADCAST_RANGE: Range<u32> = 0x200..0x300;

/// Broadcast request (tester to ECU)
pub const BROADCAST_REQUEST_ID: u32 = 0x200;

/// Positive channel setup response
pub const OPCODE_SETUP_POSITIVE: u8 = 0xD0;

/// Length header plus the largest length it can express
pub const MAX_BUFFER_LEN: usize = 2 + u16::MAX as usize;

/// Transport control byte of a unicast frame
///
/// Data and ACK codes keep the sequence number of the low nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tcpi {
    /// 0x0N: block size reached, ACK expected
    BlockSizeReachedAck(u8),
    /// 0x1N: last frame of the datagram, ACK expected
    LastMessageAck(u8),
    /// 0x2N: more frames follow, no ACK
    ConsecutiveFlow(u8),
    /// 0x3N: last frame of the datagram, no ACK
    LastMessageNoAck(u8),
    /// 0xBN: ACK
    Ack(u8),
    /// 0xA0
    ParamRequest,
    /// 0xA1
    ParamResponse,
    /// 0xA3: channel test (keep alive)
    ChannelTest,
    /// 0xA4: receiver discards data since the last ACK
    Break,
    /// 0xA8
    Disconnect,
    Unknown(u8),
}

impl Tcpi {
    pub fn decode(byte: u8) -> Tcpi {
        let sequence = byte & 0x0F;
        match byte >> 4 {
            0x0 => Tcpi::BlockSizeReachedAck(sequence),
            0x1 => Tcpi::LastMessageAck(sequence),
            0x2 => Tcpi::ConsecutiveFlow(sequence),
            0x3 => Tcpi::LastMessageNoAck(sequence),
            0xB => Tcpi::Ack(sequence),
            0xA => match byte {
                0xA0 => Tcpi::ParamRequest,
                0xA1 => Tcpi::ParamResponse,
                0xA3 => Tcpi::ChannelTest,
                0xA4 => Tcpi::Break,
                0xA8 => Tcpi::Disconnect,
                _ => Tcpi::Unknown(byte),
            },
            _ => Tcpi::Unknown(byte),
        }
    }
}

/// Dynamic IDs learned from a channel setup response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Channel {
    pub tester_id: u32,
    pub ecu_id: u32,
}

impl Channel {
    fn matches(&self, id: u32) -> bool {
        id == self.tester_id || id == self.ecu_id
    }
}

/// VW TP 2.0 reassembler
#[derive(Debug, Default)]
pub struct Vwtp20Reassembler {
    channel: Option<Channel>,
    buffer: Vec<u8>,
    datagram_received: bool,
    expecting_ack: bool,
    header_anomalies: u64,
    dropped: u64,
}

impl Vwtp20Reassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Currently bound unicast channel
    pub fn channel(&self) -> Option<Channel> {
        self.channel
    }

    pub fn expecting_ack(&self) -> bool {
        self.expecting_ack
    }

    /// Bytes collected for the datagram in progress
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Datagrams emitted despite a 0x8000-flagged length header
    pub fn header_anomalies(&self) -> u64 {
        self.header_anomalies
    }

    /// Datagrams dropped because of a bad header or length
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Process one frame: broadcast channel first, then the unicast channel
    pub fn feed(&mut self, msg: &CanMessage) -> FrameOutcome {
        if let Some(outcome) = self.broadcast_channel(msg) {
            return outcome;
        }
        if let Some(outcome) = self.unicast_channel(msg) {
            return outcome;
        }
        FrameOutcome::NotHandled
    }

    fn broadcast_channel(&mut self, msg: &CanMessage) -> Option<FrameOutcome> {
        if !BROADCAST_RANGE.contains(&msg.id) || msg.dlc() != 7 {
            return None;
        }
        let frame = msg.data();
        let ecu_address = frame[0];
        let opcode = frame[1];
        let tx_id = LittleEndian::read_u16(&frame[2..4]) as u32;
        let rx_id = LittleEndian::read_u16(&frame[4..6]) as u32;
        log::info!(
            "VWTP20: ECU at address 0x{:X}. TXID=0x{:X} / RXID=0x{:X}",
            ecu_address,
            tx_id,
            rx_id
        );

        if msg.id == BROADCAST_REQUEST_ID {
            if self.channel.take().is_some() {
                log::debug!("VWTP20: channel setup request, unicast channel unbound");
            }
        } else if opcode == OPCODE_SETUP_POSITIVE {
            let channel = Channel {
                tester_id: tx_id,
                ecu_id: rx_id,
            };
            log::debug!("VWTP20: unicast channel bound {:X?}", channel);
            self.channel = Some(channel);
            self.buffer.clear();
            self.datagram_received = false;
        }
        Some(FrameOutcome::Consumed)
    }

    fn unicast_channel(&mut self, msg: &CanMessage) -> Option<FrameOutcome> {
        if !self.channel.is_some_and(|c| c.matches(msg.id)) {
            return None;
        }
        let frame = msg.data();
        let Some(&control) = frame.first() else {
            return Some(FrameOutcome::Consumed);
        };

        match Tcpi::decode(control) {
            Tcpi::LastMessageNoAck(_) => {
                self.append(frame);
                self.datagram_received = true;
                self.expecting_ack = false;
            }
            Tcpi::ConsecutiveFlow(_) => {
                self.append(&frame[1..]);
            }
            Tcpi::LastMessageAck(_) => {
                self.append(&frame[1..]);
                self.datagram_received = true;
                self.expecting_ack = true;
            }
            Tcpi::BlockSizeReachedAck(_) => {
                self.append(&frame[1..]);
                self.expecting_ack = true;
            }
            Tcpi::Ack(_) => {
                self.expecting_ack = false;
            }
            Tcpi::Disconnect => {
                log::debug!("VWTP20: disconnect on 0x{:X}, unicast channel unbound", msg.id);
                self.channel = None;
            }
            Tcpi::Break
            | Tcpi::ParamRequest
            | Tcpi::ParamResponse
            | Tcpi::ChannelTest => {}
            Tcpi::Unknown(byte) => {
                log::trace!("VWTP20: unknown TCPI 0x{:02X} on 0x{:X}", byte, msg.id);
            }
        }

        if self.datagram_received {
            return Some(self.complete(msg));
        }
        Some(FrameOutcome::Consumed)
    }

    fn append(&mut self, bytes: &[u8]) {
        if self.buffer.len() + bytes.len() > MAX_BUFFER_LEN {
            log::warn!(
                "VWTP20: datagram exceeds {} bytes, dropping {} buffered bytes",
                MAX_BUFFER_LEN,
                self.buffer.len()
            );
            self.buffer.clear();
            self.dropped += 1;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Validate the length header of a finished datagram and emit it
    fn complete(&mut self, msg: &CanMessage) -> FrameOutcome {
        let buffer = std::mem::take(&mut self.buffer);
        self.datagram_received = false;

        if buffer.len() < 3 {
            let error = ReconstructError::MalformedHeader(format!(
                "datagram is smaller than 3 bytes: {}",
                Hex(&buffer)
            ));
            log::error!("VWTP20 on 0x{:X}: {}", msg.id, error);
            self.dropped += 1;
            return FrameOutcome::Consumed;
        }

        let declared = BigEndian::read_u16(&buffer[..2]) as usize;
        let actual = buffer.len() - 2;
        if declared != actual {
            if declared ^ 0x8000 != actual {
                let error = ReconstructError::MalformedHeader(format!(
                    "declared {} bytes, received {}: {}",
                    declared,
                    actual,
                    Hex(&buffer)
                ));
                log::error!("VWTP20 on 0x{:X}: {}", msg.id, error);
                self.dropped += 1;
                return FrameOutcome::Consumed;
            }
            log::warn!("VWTP20: datagram header starts on 0x8000");
            self.header_anomalies += 1;
        }

        let payload = buffer[2..].to_vec();
        log::debug!("VWTP20 datagram on 0x{:X}: {}", msg.id, Hex(&payload));
        FrameOutcome::Datagram(ReconstructedDatagram::new(
            Protocol::Vwtp20,
            msg.id,
            msg.timestamp_ms,
            payload,
        ))
    }
}
