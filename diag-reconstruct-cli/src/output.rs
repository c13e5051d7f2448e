//! Datagram output and the end-of-run summary

use anyhow::{Context, Result};
use diag_reconstruct::hexdump::Hex;
use diag_reconstruct::{ReconstructStats, ReconstructedDatagram};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::config::OutputFormat;

/// Writes one datagram per line as text or JSON
pub struct DatagramWriter {
    out: Box<dyn Write>,
    format: OutputFormat,
    written: u64,
}

impl DatagramWriter {
    /// Write to `path`, or to stdout when no path is given
    pub fn create(path: Option<&Path>, format: OutputFormat) -> Result<Self> {
        let out: Box<dyn Write> = match path {
            Some(path) => Box::new(BufWriter::new(
                File::create(path).with_context(|| format!("Failed to create output file: {:?}", path))?,
            )),
            None => Box::new(BufWriter::new(io::stdout())),
        };
        Ok(Self::from_writer(out, format))
    }

    pub fn from_writer(out: Box<dyn Write>, format: OutputFormat) -> Self {
        Self {
            out,
            format,
            written: 0,
        }
    }

    pub fn write(&mut self, datagram: &ReconstructedDatagram) -> Result<()> {
        match self.format {
            OutputFormat::Text => writeln!(self.out, "{}", format_text(datagram))?,
            OutputFormat::Json => {
                serde_json::to_writer(&mut self.out, datagram)?;
                writeln!(self.out)?;
            }
        }
        self.written += 1;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().context("Failed to flush output")
    }

    pub fn written(&self) -> u64 {
        self.written
    }
}

/// `[t ms] PROTO id=0x.. len=n: HEX`
pub fn format_text(datagram: &ReconstructedDatagram) -> String {
    format!(
        "[{} ms] {} id=0x{:X} len={}: {}",
        datagram.timestamp_ms,
        datagram.protocol,
        datagram.id,
        datagram.len(),
        Hex(&datagram.payload)
    )
}

/// Print the counters of a finished run to stderr
pub fn print_summary(stats: &ReconstructStats) {
    let kline = &stats.kline;
    let can = &stats.can;

    eprintln!("═══════════════════════════════════════════════");
    eprintln!("  Reconstruction Summary");
    eprintln!("═══════════════════════════════════════════════");
    eprintln!("K-Line:");
    eprintln!("  Bytes:          {}", kline.bytes);
    eprintln!("  5-baud inits:   {}", kline.init_sequences);
    eprintln!("  ISO14230:       {}", kline.iso14230_frames);
    eprintln!("  KW1281:         {}", kline.kw1281_blocks);
    eprintln!("  Garbage bytes:  {}", kline.garbage_bytes);
    eprintln!("  Overflows:      {}", kline.overflows);
    eprintln!("  Idle resets:    {}", kline.idle_resets);
    eprintln!("CAN:");
    eprintln!("  Frames:         {} ({} ignored, {} unhandled)", can.frames, can.ignored, can.unhandled);
    eprintln!("  ISO15765:       {} ({} S/N mismatches)", can.iso15765_datagrams, can.sequence_mismatches);
    eprintln!(
        "  VWTP20:         {} ({} header anomalies, {} dropped)",
        can.vwtp20_datagrams, can.vwtp20_header_anomalies, can.vwtp20_dropped
    );
    eprintln!("Datagrams emitted: {}, dropped by sink: {}", stats.emitted, stats.sink_drops);
}
