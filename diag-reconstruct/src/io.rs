//! Boundary interfaces of the reconstruction core
//!
//! The core consumes bytes and CAN frames from sources, reads time from a
//! monotonic clock and hands finished datagrams to a sink. Drivers, FIFOs and
//! the capture transport live behind these traits.

use crate::types::{CanMessage, ReconstructError, ReconstructedDatagram, Result};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::Instant;

/// Supplies K-Line bytes one at a time
pub trait ByteSource {
    /// Next received byte, `None` when nothing is pending
    fn next_byte(&mut self) -> Option<u8>;

    /// Report and clear a receive overflow in the upstream FIFO
    fn take_overflow(&mut self) -> bool {
        false
    }
}

/// Supplies CAN frames one at a time
pub trait FrameSource {
    /// Next received frame, `None` when nothing is pending
    fn next_frame(&mut self) -> Option<CanMessage>;
}

/// Receives reconstructed datagrams
///
/// Implementations must not block. A full sink returns
/// [`ReconstructError::SinkFull`] and the datagram is dropped by the caller.
pub trait DatagramSink {
    fn emit(&mut self, datagram: ReconstructedDatagram) -> Result<()>;
}

/// Monotonic millisecond clock
pub trait Clock {
    fn now_ms(&self) -> u64;
}

impl ByteSource for VecDeque<u8> {
    fn next_byte(&mut self) -> Option<u8> {
        self.pop_front()
    }
}

impl FrameSource for VecDeque<CanMessage> {
    fn next_frame(&mut self) -> Option<CanMessage> {
        self.pop_front()
    }
}

/// Collects every datagram in memory
pub type VecSink = Vec<ReconstructedDatagram>;

impl DatagramSink for VecSink {
    fn emit(&mut self, datagram: ReconstructedDatagram) -> Result<()> {
        self.push(datagram);
        Ok(())
    }
}

/// Bounded, non-blocking handoff to a consumer thread
///
/// Wraps a [`mpsc::sync_channel`]; `emit` uses `try_send` and never waits.
pub struct QueueSink {
    tx: SyncSender<ReconstructedDatagram>,
}

impl QueueSink {
    /// Create a sink with room for `depth` datagrams and its receiving end
    pub fn bounded(depth: usize) -> (Self, Receiver<ReconstructedDatagram>) {
        let (tx, rx) = mpsc::sync_channel(depth);
        (Self { tx }, rx)
    }
}

impl DatagramSink for QueueSink {
    fn emit(&mut self, datagram: ReconstructedDatagram) -> Result<()> {
        match self.tx.try_send(datagram) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(dropped)) => Err(ReconstructError::SinkFull(dropped.protocol)),
            Err(TrySendError::Disconnected(_)) => Err(ReconstructError::SinkClosed),
        }
    }
}

/// Clock backed by [`Instant`], counting from construction
#[derive(Debug, Clone)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }
}

/// Clock advanced explicitly; clones share the same time
///
/// Used for replaying recorded traffic and in tests.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new(start_ms: u64) -> Self {
        Self {
            now: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Jump to an absolute time; going backwards is ignored
    pub fn set(&self, now_ms: u64) {
        self.now.fetch_max(now_ms, Ordering::Relaxed);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::Relaxed);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Protocol;

    fn datagram(protocol: Protocol) -> ReconstructedDatagram {
        ReconstructedDatagram::new(protocol, 0, 0, vec![0x01])
    }

    #[test]
    fn test_queue_sink_drops_when_full() {
        let (mut sink, rx) = QueueSink::bounded(1);
        assert!(sink.emit(datagram(Protocol::Iso14230)).is_ok());
        match sink.emit(datagram(Protocol::Kw1281)) {
            Err(ReconstructError::SinkFull(Protocol::Kw1281)) => {}
            other => panic!("expected SinkFull, got {:?}", other),
        }
        assert_eq!(rx.try_recv().map(|d| d.protocol).ok(), Some(Protocol::Iso14230));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_queue_sink_reports_closed_receiver() {
        let (mut sink, rx) = QueueSink::bounded(4);
        drop(rx);
        assert!(matches!(
            sink.emit(datagram(Protocol::Vwtp20)),
            Err(ReconstructError::SinkClosed)
        ));
    }

    #[test]
    fn test_manual_clock_is_shared_and_monotonic() {
        let clock = ManualClock::new(100);
        let other = clock.clone();
        clock.advance(50);
        assert_eq!(other.now_ms(), 150);
        other.set(120);
        assert_eq!(clock.now_ms(), 150);
        other.set(4000);
        assert_eq!(clock.now_ms(), 4000);
    }

    #[test]
    fn test_deque_sources() {
        let mut bytes: VecDeque<u8> = vec![0x55, 0x01].into();
        assert_eq!(bytes.next_byte(), Some(0x55));
        assert_eq!(bytes.next_byte(), Some(0x01));
        assert_eq!(bytes.next_byte(), None);
        assert!(!bytes.take_overflow());

        let mut frames: VecDeque<CanMessage> = vec![CanMessage::new(0x7E0, &[0x01], 1)].into();
        assert_eq!(frames.next_frame().map(|f| f.id), Some(0x7E0));
        assert!(frames.next_frame().is_none());
    }
}
