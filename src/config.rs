//! Session/scanner configuration, loaded the way the teacher repo loads
//! `PlaneSystemConfig`: a `config::Config` layering a file over environment
//! variables, deserialized into a plain struct with `serde`.

use std::path::PathBuf;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};

/// Which property-read operation to try, in order, when polling Sony's
/// ObjectInMemory gate. Kept configurable per spec's note that the
/// fallback ordering is empirical, not a published guarantee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SonyPropertyReadStrategy {
    GetAllDevicePropData,
    GetDevicePropDesc,
    StandardGetDevicePropDesc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RawPolicy {
    JpegOnly,
    KeepAll,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub host_name: String,
    pub command_timeout_ms: u32,
    pub event_poll_timeout_ms: u32,
    pub canon_poll_min_ms: u32,
    pub canon_poll_max_ms: u32,
    pub canon_poll_step_ms: u32,
    pub raw_policy: RawPolicy,
    pub scan_waves: u32,
    pub scan_wave_delay_ms: u32,
    pub scan_ip_retries: u32,
    pub scan_ip_retry_delay_ms: u32,
    pub scan_ip_timeout_ms: u32,
    pub sony_gate_max_polls: u32,
    pub sony_gate_poll_interval_ms: u32,
    pub sony_property_read_strategies: Vec<SonyPropertyReadStrategy>,
    pub partial_object_chunk_bytes: usize,
    pub guid_store_path: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host_name: "framefast".to_owned(),
            command_timeout_ms: 10_000,
            event_poll_timeout_ms: 1_000,
            canon_poll_min_ms: 50,
            canon_poll_max_ms: 200,
            canon_poll_step_ms: 50,
            raw_policy: RawPolicy::JpegOnly,
            scan_waves: 3,
            scan_wave_delay_ms: 3_000,
            scan_ip_retries: 3,
            scan_ip_retry_delay_ms: 500,
            scan_ip_timeout_ms: 2_000,
            sony_gate_max_polls: 20,
            sony_gate_poll_interval_ms: 250,
            sony_property_read_strategies: vec![
                SonyPropertyReadStrategy::GetAllDevicePropData,
                SonyPropertyReadStrategy::GetDevicePropDesc,
                SonyPropertyReadStrategy::StandardGetDevicePropDesc,
            ],
            partial_object_chunk_bytes: 512 * 1024,
            guid_store_path: None,
        }
    }
}

impl ClientConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms as u64)
    }

    pub fn event_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.event_poll_timeout_ms as u64)
    }

    pub fn scan_wave_delay(&self) -> Duration {
        Duration::from_millis(self.scan_wave_delay_ms as u64)
    }

    pub fn scan_ip_retry_delay(&self) -> Duration {
        Duration::from_millis(self.scan_ip_retry_delay_ms as u64)
    }

    pub fn scan_ip_timeout(&self) -> Duration {
        Duration::from_millis(self.scan_ip_timeout_ms as u64)
    }

    pub fn sony_gate_poll_interval(&self) -> Duration {
        Duration::from_millis(self.sony_gate_poll_interval_ms as u64)
    }

    /// Reads configuration from `ptpip-camera-client.{toml,yaml,json,...}`
    /// in the current directory, overlaid with `PTPIP_*` environment
    /// variables, falling back to built-in defaults if no file is present.
    pub fn read() -> Result<Self, ConfigError> {
        let c = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::with_name("ptpip-camera-client").required(false))
            .add_source(Environment::with_prefix("PTPIP"))
            .build()?;

        c.try_deserialize()
    }

    pub fn read_from_path(path: PathBuf) -> Result<Self, ConfigError> {
        let c = Config::builder()
            .add_source(Config::try_from(&Self::default())?)
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("PTPIP"))
            .build()?;

        c.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_configuration_table() {
        let config = ClientConfig::default();
        assert_eq!(config.host_name, "framefast");
        assert_eq!(config.command_timeout_ms, 10_000);
        assert_eq!(config.event_poll_timeout_ms, 1_000);
        assert_eq!(config.canon_poll_min_ms, 50);
        assert_eq!(config.canon_poll_max_ms, 200);
        assert_eq!(config.canon_poll_step_ms, 50);
        assert_eq!(config.raw_policy, RawPolicy::JpegOnly);
        assert_eq!(config.scan_waves, 3);
        assert_eq!(config.scan_wave_delay_ms, 3_000);
        assert_eq!(config.scan_ip_retries, 3);
        assert_eq!(config.scan_ip_retry_delay_ms, 500);
        assert_eq!(config.scan_ip_timeout_ms, 2_000);
    }
}
