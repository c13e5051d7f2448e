//! Host polling loop
//!
//! The [`Reconstructor`] owns both buses, a clock and a sink. Each iteration
//! reads at most one K-Line byte and one CAN frame, feeds them through the
//! matching state machine and re-checks the K-Line idle timeout.

use crate::cantp::{CanDispatcher, CanStats};
use crate::config::ReconstructConfig;
use crate::hexdump::Hex;
use crate::io::{ByteSource, Clock, DatagramSink, FrameSource};
use crate::kline::{KlineBus, KlineBusState, KlineStats};
use crate::types::{CanMessage, ReconstructError, ReconstructedDatagram, Result};
use serde::Serialize;

/// Snapshot of every counter kept by the reconstructor
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconstructStats {
    pub kline: KlineStats,
    pub can: CanStats,
    pub emitted: u64,
    pub sink_drops: u64,
    pub source_overflows: u64,
}

/// Passive reconstruction of K-Line and CAN diagnostic traffic
pub struct Reconstructor<C: Clock, S: DatagramSink> {
    config: ReconstructConfig,
    kline: KlineBus,
    can: CanDispatcher,
    clock: C,
    sink: S,
    emitted: u64,
    sink_drops: u64,
    source_overflows: u64,
}

impl<C: Clock, S: DatagramSink> Reconstructor<C, S> {
    /// Create a reconstructor after validating the configuration
    pub fn new(config: ReconstructConfig, clock: C, sink: S) -> Result<Self> {
        config.validate()?;
        log::debug!(
            "Reconstructor: K-Line {} ({} bytes, idle {} ms), ISO15765 {} {:X?}, VWTP20 {}",
            config.enable_kline,
            config.kline_buffer_capacity,
            config.kline_idle_timeout_ms,
            config.enable_iso15765,
            config.iso15765_ids,
            config.enable_vwtp20
        );
        Ok(Self {
            kline: KlineBus::new(&config),
            can: CanDispatcher::new(&config),
            config,
            clock,
            sink,
            emitted: 0,
            sink_drops: 0,
            source_overflows: 0,
        })
    }

    pub fn config(&self) -> &ReconstructConfig {
        &self.config
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }

    pub fn kline_state(&self) -> KlineBusState {
        self.kline.state()
    }

    pub fn stats(&self) -> ReconstructStats {
        ReconstructStats {
            kline: self.kline.stats().clone(),
            can: self.can.stats(),
            emitted: self.emitted,
            sink_drops: self.sink_drops,
            source_overflows: self.source_overflows,
        }
    }

    /// Feed one K-Line byte stamped with the current clock
    ///
    /// A buffer overflow is handled inside the bus and not returned; only a
    /// closed sink is an error.
    pub fn feed_byte(&mut self, byte: u8) -> Result<()> {
        if !self.config.enable_kline {
            return Ok(());
        }
        let now_ms = self.clock.now_ms();
        match self.kline.feed(byte, now_ms) {
            Ok(datagrams) => {
                for datagram in datagrams {
                    self.emit(datagram)?;
                }
                Ok(())
            }
            Err(ReconstructError::BufferOverflow { .. }) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Feed one CAN frame
    pub fn feed_frame(&mut self, msg: &CanMessage) -> Result<()> {
        match self.can.feed(msg) {
            Some(datagram) => self.emit(datagram),
            None => Ok(()),
        }
    }

    /// Re-check the K-Line idle timeout against the clock
    pub fn tick(&mut self) -> bool {
        self.kline.check_idle(self.clock.now_ms())
    }

    /// One iteration of the host loop
    ///
    /// Returns true if a byte or a frame was read.
    pub fn poll<B, F>(&mut self, bytes: &mut B, frames: &mut F) -> Result<bool>
    where
        B: ByteSource + ?Sized,
        F: FrameSource + ?Sized,
    {
        if bytes.take_overflow() {
            log::warn!(
                "K-Line source overflow, dropping {} buffered bytes",
                self.kline.buffered()
            );
            self.source_overflows += 1;
            self.kline.reset();
        }

        let mut active = false;
        if let Some(byte) = bytes.next_byte() {
            self.feed_byte(byte)?;
            active = true;
        }
        if let Some(frame) = frames.next_frame() {
            self.feed_frame(&frame)?;
            active = true;
        }
        self.tick();
        Ok(active)
    }

    /// Poll until both sources are drained
    pub fn drain<B, F>(&mut self, bytes: &mut B, frames: &mut F) -> Result<()>
    where
        B: ByteSource + ?Sized,
        F: FrameSource + ?Sized,
    {
        while self.poll(bytes, frames)? {}
        Ok(())
    }

    fn emit(&mut self, datagram: ReconstructedDatagram) -> Result<()> {
        log::info!(
            "{} datagram id=0x{:X} @ {} ms: {}",
            datagram.protocol,
            datagram.id,
            datagram.timestamp_ms,
            Hex(&datagram.payload)
        );
        match self.sink.emit(datagram) {
            Ok(()) => {
                self.emitted += 1;
                Ok(())
            }
            Err(e @ ReconstructError::SinkFull(_)) => {
                log::warn!("{}", e);
                self.sink_drops += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
