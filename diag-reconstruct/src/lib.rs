//! Diagnostic Protocol Reconstruction Library
//!
//! Passively rebuilds diagnostic datagrams from sniffed K-Line bytes and CAN
//! frames, ready to be forwarded to a capture viewer.
//!
//! # Architecture
//!
//! - K-Line: a bounded byte buffer parsed as 5-baud init, ISO 14230 frames or
//!   KW1281 blocks depending on the bus state
//! - CAN: ISO 15765 reassembly on an allow-list of IDs, then VW TP 2.0 on the
//!   channel learned from the broadcast handshake
//! - A host loop reading byte and frame sources, driven by a monotonic clock
//!   and handing datagrams to a non-blocking sink
//!
//! The library does NOT:
//! - Send anything on either bus
//! - Interpret UDS / KWP2000 services
//! - Own drivers, FIFOs or the capture transport
//!
//! # Example Usage
//!
//! ```no_run
//! use diag_reconstruct::{CanMessage, ManualClock, Reconstructor, ReconstructConfig, VecSink};
//!
//! let config = ReconstructConfig::new().add_iso15765_pair(0x7E2, 0x7EA);
//! let mut reconstructor = Reconstructor::new(config, ManualClock::new(0), VecSink::new()).unwrap();
//!
//! reconstructor
//!     .feed_frame(&CanMessage::new(0x7EA, &[0x03, 0x7F, 0x22, 0x31], 12))
//!     .unwrap();
//! for byte in [0xC1, 0x33, 0xF1, 0x81, 0x66] {
//!     reconstructor.feed_byte(byte).unwrap();
//! }
//!
//! for datagram in reconstructor.sink() {
//!     println!("{} {:02X?}", datagram.protocol, datagram.payload);
//! }
//! ```

// Public modules
pub mod cantp;
pub mod config;
pub mod hexdump;
pub mod io;
pub mod kline;
pub mod reconstructor;
pub mod types;

// Re-export main types for convenience
pub use cantp::{CanDispatcher, CanStats, FrameOutcome};
pub use config::ReconstructConfig;
pub use io::{ByteSource, Clock, DatagramSink, FrameSource, ManualClock, QueueSink, SystemClock, VecSink};
pub use kline::{KlineBus, KlineBusState, KlineStats};
pub use reconstructor::{ReconstructStats, Reconstructor};
pub use types::{CanMessage, IdType, Protocol, ReconstructError, ReconstructedDatagram, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_basics() {
        // Smoke test: a fresh reconstructor starts idle with no output
        let rec = Reconstructor::new(ReconstructConfig::new(), ManualClock::new(0), VecSink::new()).unwrap();
        assert_eq!(rec.kline_state(), KlineBusState::Idle);
        assert_eq!(rec.stats(), ReconstructStats::default());
        assert!(!VERSION.is_empty());
    }
}
