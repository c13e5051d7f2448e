//! Core types for the diagnostic reconstruction library
//!
//! This module defines the values that flow through the reconstructors: the raw
//! CAN frames they consume, the datagrams they emit and the error taxonomy used
//! for diagnostics. Reconstructors never mutate a frame and hand each datagram
//! off to a sink as soon as it is complete.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Result type for reconstruction operations
pub type Result<T> = std::result::Result<T, ReconstructError>;

/// Maximum payload bytes in a classic CAN frame
pub const CAN_MAX_DLC: usize = 8;

/// CAN identifier format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IdType {
    /// 11-bit identifier
    Standard,
    /// 29-bit identifier
    Extended,
}

/// Raw CAN frame as delivered by the frame source
///
/// Immutable once created; reconstructors only read from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanMessage {
    /// Arbitration ID (11-bit or 29-bit)
    pub id: u32,
    /// Identifier format
    pub id_type: IdType,
    /// Data length code, 0..=8
    pub dlc: u8,
    /// Payload; only the first `dlc` bytes are meaningful
    pub frame: [u8; CAN_MAX_DLC],
    /// Monotonic reception time in milliseconds
    pub timestamp_ms: u64,
}

impl CanMessage {
    /// Build a standard-ID frame from a data slice
    ///
    /// Data longer than 8 bytes is truncated; the DLC follows the kept length.
    pub fn new(id: u32, data: &[u8], timestamp_ms: u64) -> Self {
        let dlc = data.len().min(CAN_MAX_DLC);
        let mut frame = [0u8; CAN_MAX_DLC];
        frame[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            id_type: if id > 0x7FF { IdType::Extended } else { IdType::Standard },
            dlc: dlc as u8,
            frame,
            timestamp_ms,
        }
    }

    /// Same as [`CanMessage::new`] but with an explicit identifier format
    pub fn with_id_type(mut self, id_type: IdType) -> Self {
        self.id_type = id_type;
        self
    }

    /// Valid payload bytes (`frame[..dlc]`)
    pub fn data(&self) -> &[u8] {
        &self.frame[..self.dlc()]
    }

    /// Get the data length code clamped to the frame size
    pub fn dlc(&self) -> usize {
        (self.dlc as usize).min(CAN_MAX_DLC)
    }
}

/// Protocol a datagram was reconstructed from
///
/// The numeric codes are the protocol numbers the capture viewer dissects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    Iso14230,
    Kw1281,
    Vwtp20,
    Iso15765,
}

impl Protocol {
    /// Wire code of this protocol
    pub fn code(self) -> u8 {
        match self {
            Protocol::Iso14230 => 0x91,
            Protocol::Kw1281 => 0x92,
            Protocol::Vwtp20 => 0x93,
            Protocol::Iso15765 => 0x94,
        }
    }

    /// Inverse of [`Protocol::code`]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0x91 => Some(Protocol::Iso14230),
            0x92 => Some(Protocol::Kw1281),
            0x93 => Some(Protocol::Vwtp20),
            0x94 => Some(Protocol::Iso15765),
            _ => None,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Iso14230 => write!(f, "ISO14230"),
            Protocol::Kw1281 => write!(f, "KW1281"),
            Protocol::Vwtp20 => write!(f, "VWTP20"),
            Protocol::Iso15765 => write!(f, "ISO15765"),
        }
    }
}

/// A complete datagram recovered from bus traffic
///
/// Ownership moves to the sink on emission; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconstructedDatagram {
    /// Source protocol
    pub protocol: Protocol,
    /// CAN arbitration ID of the completing frame, 0 for K-Line
    pub id: u32,
    /// Monotonic time in milliseconds
    pub timestamp_ms: u64,
    /// Reassembled payload bytes
    pub payload: Vec<u8>,
}

impl ReconstructedDatagram {
    pub fn new(protocol: Protocol, id: u32, timestamp_ms: u64, payload: Vec<u8>) -> Self {
        Self {
            protocol,
            id,
            timestamp_ms,
            payload,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// True if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Errors and diagnostic conditions raised during reconstruction
///
/// Parsing conditions are logged rather than returned to the dispatcher; the
/// variants exist so every diagnostic has one typed, printable form.
#[derive(Debug, thiserror::Error)]
pub enum ReconstructError {
    #[error("Checksum mismatch: computed 0x{expected:02X}, found 0x{found:02X}")]
    ChecksumMismatch { expected: u8, found: u8 },

    #[error("Sequence mismatch: expected 0x{expected:X}, received 0x{received:X}")]
    SequenceMismatch { expected: u8, received: u8 },

    #[error("Buffer overflow at capacity {capacity}")]
    BufferOverflow { capacity: usize },

    #[error("Unsupported variant: {0}")]
    UnsupportedVariant(String),

    #[error("Malformed header: {0}")]
    MalformedHeader(String),

    #[error("Sink queue full, {0} datagram dropped")]
    SinkFull(Protocol),

    #[error("Sink disconnected")]
    SinkClosed,

    #[error("Invalid configuration: {0}")]
    Config(String),
}
