//! Upgrader configuration.
//!
//! All timing and protocol knobs the engine uses live here with
//! defaults matching the device's documented behavior, so a station
//! can tune them from a TOML file instead of rebuilding.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Timing contract of the CDB mailbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CdbTiming {
    /// Busy-poll step while waiting for a command to complete.
    pub poll_interval_ms: u64,
    /// Busy-poll budget. Expiry reports status 0.
    pub status_timeout_ms: u64,
    /// Settle delay after 0101h. The full erase stalls the module's
    /// internal bus, so register traffic must hold off this long.
    pub erase_settle_ms: u64,
    /// Settle delay after 0103h flash writes.
    pub write_settle_ms: u64,
    /// Settle delay after 0107h and 0100h.
    pub complete_settle_ms: u64,
}

impl Default for CdbTiming {
    fn default() -> Self {
        Self {
            poll_interval_ms: 2,
            status_timeout_ms: 200,
            erase_settle_ms: 1750,
            write_settle_ms: 1,
            complete_settle_ms: 100,
        }
    }
}

/// Configuration for a firmware upgrade session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgraderConfig {
    /// Manufacturer password written to unlock CDB commands.
    pub password: [u8; 4],
    /// Maximum bytes per register write and per 0103h chunk.
    pub chunk_size: usize,
    /// Attempts before an upgrade failure is reported to the caller.
    pub dfu_attempts: u32,
    /// Delay after a module reset before re-unlocking.
    pub reset_delay_ms: u64,
    /// Power-mode transition wait: attempts x interval.
    pub power_wait_attempts: u32,
    pub power_wait_interval_ms: u64,
    /// Retimer readiness wait after a DSP load: attempts x interval.
    pub retimer_wait_attempts: u32,
    pub retimer_wait_interval_ms: u64,
    pub cdb: CdbTiming,
}

impl Default for UpgraderConfig {
    fn default() -> Self {
        Self {
            password: [0x88, 0x88, 0x88, 0x88],
            chunk_size: 64,
            dfu_attempts: 3,
            reset_delay_ms: 1000,
            power_wait_attempts: 8,
            power_wait_interval_ms: 1000,
            retimer_wait_attempts: 60,
            retimer_wait_interval_ms: 1000,
            cdb: CdbTiming::default(),
        }
    }
}

impl UpgraderConfig {
    /// Load configuration from a TOML file.
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: UpgraderConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_device_contract() {
        let cfg = UpgraderConfig::default();
        assert_eq!(cfg.password, [0x88; 4]);
        assert_eq!(cfg.chunk_size, 64);
        assert_eq!(cfg.dfu_attempts, 3);
        assert_eq!(cfg.cdb.poll_interval_ms, 2);
        assert_eq!(cfg.cdb.status_timeout_ms, 200);
        assert_eq!(cfg.cdb.erase_settle_ms, 1750);
    }

    #[test]
    fn toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upgrader.toml");
        let mut cfg = UpgraderConfig::default();
        cfg.chunk_size = 128;
        cfg.save_to_file(&path).unwrap();
        let loaded = UpgraderConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.chunk_size, 128);
        assert_eq!(loaded.password, cfg.password);
    }
}
