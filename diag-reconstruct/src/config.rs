//! Reconstruction configuration
//!
//! This module defines the knobs the reconstructors need: which CAN IDs carry
//! ISO15765, which IDs to ignore entirely, and the K-Line buffer and idle
//! timeout parameters.

use crate::types::{ReconstructError, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the reconstruction library
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructConfig {
    /// CAN IDs carrying ISO15765 traffic (requests, responses, functional)
    pub iso15765_ids: Vec<u32>,

    /// CAN IDs dropped before any protocol sees them
    pub ignored_ids: Vec<u32>,

    /// Inactivity after which the K-Line bus falls back to idle
    pub kline_idle_timeout_ms: u64,

    /// K-Line byte buffer capacity
    pub kline_buffer_capacity: usize,

    /// Depth of the bounded queue between reconstructors and the sink
    pub sink_queue_depth: usize,

    pub enable_iso15765: bool,
    pub enable_vwtp20: bool,
    pub enable_kline: bool,
}

/// Default ISO15765 allow-list: functional request plus two request/response pairs
pub const DEFAULT_ISO15765_IDS: [u32; 5] = [0x700, 0x7E0, 0x7E8, 0x7E1, 0x7E9];

impl Default for ReconstructConfig {
    fn default() -> Self {
        Self {
            iso15765_ids: DEFAULT_ISO15765_IDS.to_vec(),
            ignored_ids: Vec::new(),
            kline_idle_timeout_ms: 3000,
            kline_buffer_capacity: 512,
            sink_queue_depth: 64,
            enable_iso15765: true,
            enable_vwtp20: true,
            enable_kline: true,
        }
    }
}

impl ReconstructConfig {
    /// Create a new configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: replace the ISO15765 allow-list
    pub fn with_iso15765_ids(mut self, ids: Vec<u32>) -> Self {
        self.iso15765_ids = ids;
        self
    }

    /// Builder method: add one ISO15765 request/response pair
    pub fn add_iso15765_pair(mut self, request: u32, response: u32) -> Self {
        for id in [request, response] {
            if !self.iso15765_ids.contains(&id) {
                self.iso15765_ids.push(id);
            }
        }
        self
    }

    /// Builder method: ignore a CAN ID
    pub fn add_ignored_id(mut self, id: u32) -> Self {
        self.ignored_ids.push(id);
        self
    }

    /// Builder method: set the K-Line idle timeout
    pub fn with_kline_idle_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.kline_idle_timeout_ms = timeout_ms;
        self
    }

    /// Builder method: set the K-Line buffer capacity
    pub fn with_kline_buffer_capacity(mut self, capacity: usize) -> Self {
        self.kline_buffer_capacity = capacity;
        self
    }

    /// Builder method: set the sink queue depth
    pub fn with_sink_queue_depth(mut self, depth: usize) -> Self {
        self.sink_queue_depth = depth;
        self
    }

    /// Builder method: enable or disable protocols
    pub fn with_protocols(mut self, iso15765: bool, vwtp20: bool, kline: bool) -> Self {
        self.enable_iso15765 = iso15765;
        self.enable_vwtp20 = vwtp20;
        self.enable_kline = kline;
        self
    }

    /// Check if a CAN frame should be passed to the reconstructors at all
    pub fn should_process_frame(&self, can_id: u32) -> bool {
        !self.ignored_ids.contains(&can_id)
    }

    /// Check if a CAN ID is on the ISO15765 allow-list
    pub fn is_iso15765_id(&self, can_id: u32) -> bool {
        self.iso15765_ids.contains(&can_id)
    }

    /// Reject values the reconstructors cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.kline_buffer_capacity < 8 {
            return Err(ReconstructError::Config(format!(
                "kline_buffer_capacity must be at least 8, got {}",
                self.kline_buffer_capacity
            )));
        }
        if self.sink_queue_depth == 0 {
            return Err(ReconstructError::Config(
                "sink_queue_depth must be at least 1".to_string(),
            ));
        }
        if self.kline_idle_timeout_ms == 0 {
            return Err(ReconstructError::Config(
                "kline_idle_timeout_ms must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReconstructConfig::new();
        assert_eq!(config.iso15765_ids, vec![0x700, 0x7E0, 0x7E8, 0x7E1, 0x7E9]);
        assert_eq!(config.kline_idle_timeout_ms, 3000);
        assert_eq!(config.kline_buffer_capacity, 512);
        assert!(config.enable_kline && config.enable_vwtp20 && config.enable_iso15765);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_and_filters() {
        let config = ReconstructConfig::new()
            .with_iso15765_ids(vec![0x7E0])
            .add_iso15765_pair(0x7E0, 0x7E8)
            .add_ignored_id(0x123)
            .with_kline_idle_timeout_ms(1500);

        assert_eq!(config.iso15765_ids, vec![0x7E0, 0x7E8]);
        assert!(config.is_iso15765_id(0x7E8));
        assert!(!config.is_iso15765_id(0x7E1));
        assert!(!config.should_process_frame(0x123));
        assert!(config.should_process_frame(0x124));
        assert_eq!(config.kline_idle_timeout_ms, 1500);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(ReconstructConfig::new().with_kline_buffer_capacity(4).validate().is_err());
        assert!(ReconstructConfig::new().with_sink_queue_depth(0).validate().is_err());
        assert!(ReconstructConfig::new().with_kline_idle_timeout_ms(0).validate().is_err());
    }
}
