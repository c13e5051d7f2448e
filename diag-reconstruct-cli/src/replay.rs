//! Replay of recorded bus traffic
//!
//! Two log formats are understood:
//!
//! ```text
//! (1700000000.123456) can0 7E8#0341050C       candump, one CAN frame per line
//! 1250 55 01 8A 75                            K-Line, timestamp in ms then bytes
//! ```
//!
//! CAN timestamps are made relative to the first frame of their file so both
//! logs share a time base starting at zero. Empty lines and lines starting
//! with `#` are skipped.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use diag_reconstruct::types::CAN_MAX_DLC;
use diag_reconstruct::{
    CanMessage, IdType, ManualClock, QueueSink, ReconstructConfig, ReconstructStats, Reconstructor,
};
use std::fs;
use std::path::Path;

use crate::output::DatagramWriter;

/// Malformed line in a replay log
#[derive(Debug, thiserror::Error)]
pub enum ReplayError {
    #[error("line {line}: {reason}")]
    Syntax { line: usize, reason: String },
}

fn syntax(line: usize, reason: impl Into<String>) -> ReplayError {
    ReplayError::Syntax {
        line,
        reason: reason.into(),
    }
}

/// One input of the replay, in recorded order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayEvent {
    Kline { timestamp_ms: u64, byte: u8 },
    Can(CanMessage),
}

impl ReplayEvent {
    pub fn timestamp_ms(&self) -> u64 {
        match self {
            ReplayEvent::Kline { timestamp_ms, .. } => *timestamp_ms,
            ReplayEvent::Can(msg) => msg.timestamp_ms,
        }
    }
}

fn is_skipped(line: &str) -> bool {
    let line = line.trim();
    line.is_empty() || line.starts_with('#')
}

fn parse_hex_bytes(text: &str, line: usize) -> std::result::Result<Vec<u8>, ReplayError> {
    hex::decode(text).map_err(|e| syntax(line, format!("invalid hex data {:?}: {}", text, e)))
}

/// Wall-clock time of an epoch timestamp in milliseconds
pub fn wall_clock(epoch_ms: u64) -> Option<DateTime<Utc>> {
    i64::try_from(epoch_ms).ok().and_then(DateTime::from_timestamp_millis)
}

/// Parse one candump line; `None` for blank and comment lines
///
/// The timestamp is returned in absolute milliseconds.
pub fn parse_candump_line(text: &str, line: usize) -> std::result::Result<Option<CanMessage>, ReplayError> {
    if is_skipped(text) {
        return Ok(None);
    }
    let mut fields = text.split_whitespace();
    let (Some(stamp), Some(_iface), Some(frame)) = (fields.next(), fields.next(), fields.next()) else {
        return Err(syntax(line, "expected `(sec.usec) iface ID#DATA`"));
    };

    let stamp = stamp
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| syntax(line, format!("invalid timestamp {:?}", stamp)))?;
    let (secs, micros) = stamp.split_once('.').unwrap_or((stamp, "0"));
    let secs: u64 = secs
        .parse()
        .map_err(|_| syntax(line, format!("invalid seconds {:?}", secs)))?;
    if !micros.bytes().all(|b| b.is_ascii_digit()) {
        return Err(syntax(line, format!("invalid fraction {:?}", micros)));
    }
    let micros: u64 = format!("{:0<6}", micros)[..6]
        .parse()
        .map_err(|_| syntax(line, format!("invalid fraction {:?}", micros)))?;
    let timestamp_ms = secs * 1000 + micros / 1000;

    let (id, data) = frame
        .split_once('#')
        .ok_or_else(|| syntax(line, format!("missing '#' in {:?}", frame)))?;
    let can_id = u32::from_str_radix(id, 16).map_err(|_| syntax(line, format!("invalid CAN ID {:?}", id)))?;
    if data.starts_with('R') {
        return Err(syntax(line, "remote frames carry no data"));
    }
    let data = parse_hex_bytes(data, line)?;
    if data.len() > CAN_MAX_DLC {
        return Err(syntax(line, format!("{} data bytes exceed classic CAN", data.len())));
    }

    let id_type = if id.len() > 3 { IdType::Extended } else { IdType::Standard };
    Ok(Some(CanMessage::new(can_id, &data, timestamp_ms).with_id_type(id_type)))
}

/// Parse one K-Line log line into its timestamp and bytes
pub fn parse_kline_line(text: &str, line: usize) -> std::result::Result<Option<(u64, Vec<u8>)>, ReplayError> {
    if is_skipped(text) {
        return Ok(None);
    }
    let mut fields = text.split_whitespace();
    let stamp = fields.next().unwrap_or_default();
    let timestamp_ms: u64 = stamp
        .parse()
        .map_err(|_| syntax(line, format!("invalid timestamp {:?}", stamp)))?;

    let mut bytes = Vec::new();
    for field in fields {
        bytes.extend(parse_hex_bytes(field, line)?);
    }
    Ok(Some((timestamp_ms, bytes)))
}

/// Read a candump log, timestamps relative to its first frame
pub fn load_can_log(path: &Path) -> Result<Vec<ReplayEvent>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read CAN log: {:?}", path))?;

    let mut frames = Vec::new();
    for (i, text) in content.lines().enumerate() {
        if let Some(msg) = parse_candump_line(text, i + 1)
            .with_context(|| format!("Failed to parse CAN log: {:?}", path))?
        {
            frames.push(msg);
        }
    }

    let origin = frames.first().map(|m| m.timestamp_ms).unwrap_or(0);
    match wall_clock(origin).filter(|_| !frames.is_empty()) {
        Some(start) => log::info!(
            "Loaded {} CAN frames from {:?}, capture started {}",
            frames.len(),
            path,
            start.format("%Y-%m-%d %H:%M:%S%.3f UTC")
        ),
        None => log::info!("Loaded {} CAN frames from {:?}", frames.len(), path),
    }
    Ok(frames
        .into_iter()
        .map(|mut msg| {
            msg.timestamp_ms = msg.timestamp_ms.saturating_sub(origin);
            ReplayEvent::Can(msg)
        })
        .collect())
}

/// Read a K-Line byte log
pub fn load_kline_log(path: &Path) -> Result<Vec<ReplayEvent>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read K-Line log: {:?}", path))?;

    let mut events = Vec::new();
    for (i, text) in content.lines().enumerate() {
        let parsed = parse_kline_line(text, i + 1)
            .with_context(|| format!("Failed to parse K-Line log: {:?}", path))?;
        if let Some((timestamp_ms, bytes)) = parsed {
            events.extend(bytes.into_iter().map(|byte| ReplayEvent::Kline { timestamp_ms, byte }));
        }
    }
    log::info!("Loaded {} K-Line bytes from {:?}", events.len(), path);
    Ok(events)
}

/// Interleave every source by timestamp, keeping per-source order on ties
pub fn merge(sources: Vec<Vec<ReplayEvent>>) -> Vec<ReplayEvent> {
    let mut events: Vec<ReplayEvent> = sources.into_iter().flatten().collect();
    events.sort_by_key(ReplayEvent::timestamp_ms);
    events
}

/// Run the events through a reconstructor driven by the recorded time
///
/// The idle timeout is checked before every event, so gaps in the recording
/// reset the K-Line bus exactly as a live host loop would.
pub fn run(
    events: &[ReplayEvent],
    config: ReconstructConfig,
    writer: &mut DatagramWriter,
) -> Result<ReconstructStats> {
    let clock = ManualClock::new(0);
    let (sink, rx) = QueueSink::bounded(config.sink_queue_depth);
    let mut reconstructor = Reconstructor::new(config, clock.clone(), sink)
        .context("Failed to create reconstructor")?;

    for event in events {
        clock.set(event.timestamp_ms());
        reconstructor.tick();
        match event {
            ReplayEvent::Kline { byte, .. } => reconstructor.feed_byte(*byte)?,
            ReplayEvent::Can(msg) => reconstructor.feed_frame(msg)?,
        }
        for datagram in rx.try_iter() {
            writer.write(&datagram)?;
        }
    }

    writer.flush()?;
    Ok(reconstructor.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OutputFormat;
    use diag_reconstruct::Protocol;
    use std::io::Write;

    #[test]
    fn test_parse_candump_line() {
        let msg = parse_candump_line("(1436509052.249713) vcan0 7E8#0341050C", 1)
            .unwrap()
            .unwrap();
        assert_eq!(msg.id, 0x7E8);
        assert_eq!(msg.id_type, IdType::Standard);
        assert_eq!(msg.data(), &[0x03, 0x41, 0x05, 0x0C]);
        assert_eq!(msg.timestamp_ms, 1_436_509_052_249);

        let ext = parse_candump_line("(0.5) can1 18DAF110#021001", 2).unwrap().unwrap();
        assert_eq!(ext.id, 0x18DA_F110);
        assert_eq!(ext.id_type, IdType::Extended);
        assert_eq!(ext.timestamp_ms, 500);

        let empty = parse_candump_line("(1.000000) can0 200#", 3).unwrap().unwrap();
        assert_eq!(empty.dlc(), 0);
    }

    #[test]
    fn test_parse_candump_rejects_garbage() {
        assert!(parse_candump_line("", 1).unwrap().is_none());
        assert!(parse_candump_line("# comment", 1).unwrap().is_none());
        assert!(parse_candump_line("(1.0) can0", 4).is_err());
        assert!(parse_candump_line("(1.0) can0 7E8#123", 4).is_err());
        assert!(parse_candump_line("(1.0) can0 7E8#R", 4).is_err());
        assert!(parse_candump_line("(1.0) can0 7E8#000102030405060708", 4).is_err());
        let err = parse_candump_line("1.0 can0 7E8#00", 9).unwrap_err();
        assert!(err.to_string().starts_with("line 9:"));
    }

    #[test]
    fn test_invalid_hex_is_a_syntax_error() {
        let err = parse_candump_line("(1.0) can0 7E8#02ZZ", 7).unwrap_err();
        assert!(matches!(err, ReplayError::Syntax { line: 7, .. }));
        assert!(err.to_string().contains("\"02ZZ\""));
        assert!(parse_kline_line("10 C1 é3", 2).is_err());
        assert_eq!(parse_hex_bytes("c133F1", 1).unwrap(), vec![0xC1, 0x33, 0xF1]);
    }

    #[test]
    fn test_wall_clock_of_candump_stamp() {
        let msg = parse_candump_line("(1700000000.123456) can0 7E8#01", 1)
            .unwrap()
            .unwrap();
        let start = wall_clock(msg.timestamp_ms).unwrap();
        assert_eq!(
            start.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string(),
            "2023-11-14 22:13:20.123 UTC"
        );
        assert!(wall_clock(u64::MAX).is_none());
    }

    #[test]
    fn test_parse_kline_line() {
        assert_eq!(
            parse_kline_line("1250 55 01 8A 75", 1).unwrap(),
            Some((1250, vec![0x55, 0x01, 0x8A, 0x75]))
        );
        assert_eq!(
            parse_kline_line("  7 C133F18166 ", 1).unwrap(),
            Some((7, vec![0xC1, 0x33, 0xF1, 0x81, 0x66]))
        );
        assert!(parse_kline_line("x 55", 1).is_err());
        assert!(parse_kline_line("10 5", 1).is_err());
    }

    #[test]
    fn test_merge_orders_by_time() {
        let kline = vec![
            ReplayEvent::Kline { timestamp_ms: 5, byte: 0x55 },
            ReplayEvent::Kline { timestamp_ms: 20, byte: 0x01 },
        ];
        let can = vec![ReplayEvent::Can(CanMessage::new(0x7E8, &[0x01, 0x3E], 10))];
        let merged = merge(vec![kline, can]);
        let stamps: Vec<u64> = merged.iter().map(ReplayEvent::timestamp_ms).collect();
        assert_eq!(stamps, vec![5, 10, 20]);
    }

    #[test]
    fn test_replay_files() {
        let mut can = tempfile::NamedTempFile::new().unwrap();
        writeln!(can, "(100.000000) can0 7E0#0210030000000000").unwrap();
        writeln!(can, "(100.020000) can0 7E8#065003003201F400").unwrap();

        let mut kline = tempfile::NamedTempFile::new().unwrap();
        writeln!(kline, "# ISO 14230 fast init").unwrap();
        writeln!(kline, "0 C1 33 F1 81 66").unwrap();
        writeln!(kline, "30 83 F1 10 C1 EF 8F C3").unwrap();

        let events = merge(vec![
            load_can_log(can.path()).unwrap(),
            load_kline_log(kline.path()).unwrap(),
        ]);
        assert_eq!(events.len(), 2 + 12);

        let out = tempfile::NamedTempFile::new().unwrap();
        let mut writer = DatagramWriter::create(Some(out.path()), OutputFormat::Json).unwrap();
        let stats = run(&events, ReconstructConfig::new(), &mut writer).unwrap();
        assert_eq!(stats.emitted, 4);
        assert_eq!(stats.can.iso15765_datagrams, 2);
        assert_eq!(stats.kline.iso14230_frames, 2);
        drop(writer);

        let lines: Vec<diag_reconstruct::ReconstructedDatagram> = fs::read_to_string(out.path())
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let protocols: Vec<Protocol> = lines.iter().map(|d| d.protocol).collect();
        assert_eq!(
            protocols,
            vec![Protocol::Iso15765, Protocol::Iso14230, Protocol::Iso15765, Protocol::Iso14230]
        );
        assert_eq!(lines[0].payload, vec![0x10, 0x03]);
        assert_eq!(lines[1].payload, vec![0xC1, 0x33, 0xF1, 0x81, 0x66]);
        assert_eq!(lines[2].timestamp_ms, 20);
        assert_eq!(lines[3].timestamp_ms, 30);
    }

    #[test]
    fn test_recorded_gap_triggers_idle_reset() {
        let bytes = [
            (0u64, 0x83u8),
            (0, 0xF1),
            (5000, 0xC1),
            (5000, 0x33),
            (5000, 0xF1),
            (5000, 0x81),
            (5000, 0x66),
        ];
        let events: Vec<ReplayEvent> = bytes
            .into_iter()
            .map(|(timestamp_ms, byte)| ReplayEvent::Kline { timestamp_ms, byte })
            .collect();

        let mut writer = DatagramWriter::from_writer(Box::new(std::io::sink()), OutputFormat::Text);
        let stats = run(&events, ReconstructConfig::new(), &mut writer).unwrap();
        assert_eq!(stats.kline.idle_resets, 1);
        assert_eq!(stats.kline.iso14230_frames, 1);
        assert_eq!(writer.written(), 1);
    }
}
