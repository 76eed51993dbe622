//! Node configuration.
//!
//! One [`NodeConfig`] is built (or decoded) at startup and handed to the node
//! loop. It is stored as a compact postcard blob; replacing the blob and
//! restarting the node is how a deployment is reconfigured.

use alloc::string::String;
use alloc::vec;
use alloc::vec::Vec;

use embassy_time::Duration;
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::calibration::Calibration;
use crate::link::{MacAddress, PeerTable};

/// Channel the heated leaf is measured on.
pub const TREATMENT: &str = "TREATMENT";
/// Unheated reference leaf.
pub const REFERENCE: &str = "REFERENCE";
/// Heating pad.
pub const HEAT: &str = "HEAT";
pub const CONTROL: &str = "CONTROL";
pub const CONTROL_HEAT: &str = "CONTROL_HEAT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Bench calibration of thermocouples
    Calibrate,
    /// Aggregator: stores records, serves time
    DataLogger,
    /// Thermocouple array with the heating relay
    Trc,
    /// Aspirated temperature / humidity / pressure sensor
    Thp,
}

impl Role {
    pub const fn name(self) -> &'static str {
        match self {
            Self::Calibrate => "CALIBRATE",
            Self::DataLogger => "DATALOGGER",
            Self::Trc => "TRC",
            Self::Thp => "THP",
        }
    }

    const fn samples(self) -> bool {
        matches!(self, Self::Trc | Self::Thp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub name: String,
    /// 1-based multiplexer select line
    pub select: u8,
    /// Identifier of the physical thermocouple, e.g. `T107`
    pub sensor_id: Option<String>,
    pub calibration: Option<Calibration>,
}

impl ChannelConfig {
    pub fn new(name: &str, select: u8) -> Self {
        Self {
            name: name.into(),
            select,
            sensor_id: None,
            calibration: None,
        }
    }

    pub fn calibrated(mut self, sensor_id: &str, calibration: Calibration) -> Self {
        self.sensor_id = Some(sensor_id.into());
        self.calibration = Some(calibration);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Time between scans
    pub sample_interval_ms: u32,
    /// Records are flushed when `minute % log_interval_minutes == 0`
    pub log_interval_minutes: u8,
    /// Reads of each channel averaged into one scan value
    pub reads_per_scan: u8,
    /// Multiplexer settle time before each read
    pub settle_ms: u32,
}

impl SamplingConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms as u64)
    }

    pub fn log_interval(&self) -> Duration {
        Duration::from_secs(self.log_interval_minutes as u64 * 60)
    }
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            log_interval_minutes: 3,
            reads_per_scan: 4,
            settle_ms: crate::sensors::DEFAULT_SETTLE_MS,
        }
    }
}

/// Heating limits, all in °C.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeatingThresholds {
    /// Target treatment leaf excess over the reference leaf
    pub tdiff: f64,
    /// Treatment leaf ceiling
    pub tmax: f64,
    /// Heating pad ceiling; must exceed `tmax`
    pub tmax_heater: f64,
}

impl Default for HeatingThresholds {
    fn default() -> Self {
        Self {
            tdiff: 3.0,
            tmax: 40.0,
            tmax_heater: 55.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSyncConfig {
    /// How long to wait for the reply to one `GET_TIME`
    pub reply_timeout_ms: u32,
    /// Pause before retrying an unanswered request
    pub retry_delay_ms: u32,
    /// `None` keeps retrying until the time authority answers
    pub max_attempts: Option<u32>,
    /// Resynchronize after every this many records
    pub resync_every: u32,
}

impl TimeSyncConfig {
    pub fn reply_timeout(&self) -> Duration {
        Duration::from_millis(self.reply_timeout_ms as u64)
    }
}

impl Default for TimeSyncConfig {
    fn default() -> Self {
        Self {
            reply_timeout_ms: 1_000,
            retry_delay_ms: 1_000,
            max_attempts: None,
            resync_every: 20,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("invalid {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("missing {0} channel")]
    MissingChannel(&'static str),
    #[error("duplicate channel {0}")]
    DuplicateChannel(String),
    #[error("configuration could not be encoded")]
    Encode,
    #[error("configuration blob is corrupt")]
    Decode,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub role: Role,
    /// This node's own link address
    pub address: MacAddress,
    pub peers: PeerTable,
    pub channels: Vec<ChannelConfig>,
    pub sampling: SamplingConfig,
    pub heating: HeatingThresholds,
    pub time_sync: TimeSyncConfig,
    /// Aggregator receive timeout
    pub listen_timeout_ms: u32,
}

impl NodeConfig {
    fn base(role: Role, address: MacAddress, peers: PeerTable) -> Self {
        Self {
            role,
            address,
            peers,
            channels: Vec::new(),
            sampling: SamplingConfig::default(),
            heating: HeatingThresholds::default(),
            time_sync: TimeSyncConfig::default(),
            listen_timeout_ms: 30_000,
        }
    }

    /// Five-thermocouple heating box: 3 minute records from 5 s scans of
    /// 4 reads, TDIFF 3, TMAX 40, TMAX_HEATER 55, resync every 20 records.
    pub fn trc(address: MacAddress, peers: PeerTable) -> Self {
        let mut config = Self::base(Role::Trc, address, peers);
        config.channels = vec![
            ChannelConfig::new(TREATMENT, 1),
            ChannelConfig::new(CONTROL, 2),
            ChannelConfig::new(REFERENCE, 3),
            ChannelConfig::new(HEAT, 4),
            ChannelConfig::new(CONTROL_HEAT, 5),
        ];
        config
    }

    /// Climate sensor: 15 minute records from 15 s samples, resync every 4.
    pub fn thp(address: MacAddress, peers: PeerTable) -> Self {
        let mut config = Self::base(Role::Thp, address, peers);
        config.sampling.sample_interval_ms = 15_000;
        config.sampling.log_interval_minutes = 15;
        config.sampling.reads_per_scan = 1;
        config.time_sync.resync_every = 4;
        config
    }

    pub fn data_logger(address: MacAddress) -> Self {
        Self::base(Role::DataLogger, address, PeerTable::default())
    }

    pub fn calibrate(address: MacAddress, peers: PeerTable) -> Self {
        let mut config = Self::trc(address, peers);
        config.role = Role::Calibrate;
        config
    }

    pub fn channel(&self, name: &str) -> Option<&ChannelConfig> {
        self.channels.iter().find(|c| c.name == name)
    }

    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms as u64)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sampling = &self.sampling;
        if sampling.reads_per_scan == 0 {
            return Err(ConfigError::Invalid {
                field: "reads_per_scan",
                reason: "must be at least 1",
            });
        }
        // A one minute interval never changes the boundary, so it never flushes.
        if !(2..=60).contains(&sampling.log_interval_minutes) {
            return Err(ConfigError::Invalid {
                field: "log_interval_minutes",
                reason: "must be between 2 and 60",
            });
        }
        if sampling.log_interval().as_millis() <= sampling.sample_interval_ms as u64 {
            return Err(ConfigError::Invalid {
                field: "log_interval_minutes",
                reason: "must be longer than the sample interval",
            });
        }
        if self.time_sync.resync_every == 0 {
            return Err(ConfigError::Invalid {
                field: "resync_every",
                reason: "must be at least 1",
            });
        }
        if self.time_sync.max_attempts == Some(0) {
            return Err(ConfigError::Invalid {
                field: "max_attempts",
                reason: "must be at least 1 when set",
            });
        }

        for (i, channel) in self.channels.iter().enumerate() {
            if channel.select == 0 {
                return Err(ConfigError::Invalid {
                    field: "select",
                    reason: "select lines are numbered from 1",
                });
            }
            let clash = self.channels[..i]
                .iter()
                .any(|c| c.name == channel.name || c.select == channel.select);
            if clash {
                return Err(ConfigError::DuplicateChannel(channel.name.clone()));
            }
        }

        if self.role.samples() {
            if self.peers.time.is_none() {
                return Err(ConfigError::Invalid {
                    field: "peers",
                    reason: "a TIME peer is required",
                });
            }
            if self.peers.data_loggers.is_empty() {
                return Err(ConfigError::Invalid {
                    field: "peers",
                    reason: "at least one DATA_LOGGER peer is required",
                });
            }
        }

        if self.role == Role::Trc {
            let heating = &self.heating;
            if !(heating.tmax < heating.tmax_heater) {
                return Err(ConfigError::Invalid {
                    field: "tmax",
                    reason: "must be below tmax_heater",
                });
            }
            if !(heating.tdiff > 0.0) {
                return Err(ConfigError::Invalid {
                    field: "tdiff",
                    reason: "must be positive",
                });
            }
            for name in [TREATMENT, REFERENCE, HEAT] {
                if self.channel(name).is_none() {
                    return Err(ConfigError::MissingChannel(name));
                }
            }
        }

        if self.role == Role::Calibrate && self.peers.calibrate.is_empty() {
            return Err(ConfigError::Invalid {
                field: "peers",
                reason: "a CALIBRATE peer is required",
            });
        }

        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ConfigError> {
        postcard::to_allocvec(self).map_err(|_| ConfigError::Encode)
    }

    /// Decode and validate a stored configuration.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = postcard::from_bytes(bytes).map_err(|_| ConfigError::Decode)?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOGGER: MacAddress = MacAddress([0xC4, 0x5B, 0xBE, 0xE4, 0xFE, 0x08]);
    const ME: MacAddress = MacAddress([0x48, 0x55, 0x19, 0xDF, 0x29, 0x86]);

    fn peers() -> PeerTable {
        PeerTable {
            data_loggers: vec![LOGGER],
            time: Some(LOGGER),
            calibrate: vec![],
        }
    }

    #[test]
    fn test_presets_are_valid() {
        assert_eq!(NodeConfig::trc(ME, peers()).validate(), Ok(()));
        assert_eq!(NodeConfig::thp(ME, peers()).validate(), Ok(()));
        assert_eq!(NodeConfig::data_logger(LOGGER).validate(), Ok(()));
    }

    #[test]
    fn test_log_interval_must_exceed_sample_interval() {
        let mut config = NodeConfig::trc(ME, peers());
        config.sampling.log_interval_minutes = 2;
        config.sampling.sample_interval_ms = 120_000;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "log_interval_minutes", .. })
        ));
    }

    #[test]
    fn test_tmax_must_be_below_heater_limit() {
        let mut config = NodeConfig::trc(ME, peers());
        config.heating.tmax = 60.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { field: "tmax", .. })));
    }

    #[test]
    fn test_trc_needs_control_channels() {
        let mut config = NodeConfig::trc(ME, peers());
        config.channels.retain(|c| c.name != HEAT);
        assert_eq!(config.validate(), Err(ConfigError::MissingChannel(HEAT)));
    }

    #[test]
    fn test_duplicate_select_line_rejected() {
        let mut config = NodeConfig::trc(ME, peers());
        config.channels.push(ChannelConfig::new("SPARE", 2));
        assert_eq!(config.validate(), Err(ConfigError::DuplicateChannel("SPARE".into())));
    }

    #[test]
    fn test_sensing_roles_need_time_peer() {
        let mut table = peers();
        table.time = None;
        assert!(NodeConfig::thp(ME, table).validate().is_err());
    }

    #[test]
    fn test_postcard_blob() {
        let mut config = NodeConfig::trc(ME, peers());
        config.channels[0] = ChannelConfig::new(TREATMENT, 1)
            .calibrated("T107", Calibration::linear(-3.7182, 1.0541));
        config.time_sync.max_attempts = Some(5);

        let bytes = config.to_bytes().unwrap();
        assert_eq!(NodeConfig::from_bytes(&bytes), Ok(config));
        assert_eq!(NodeConfig::from_bytes(&bytes[..bytes.len() / 2]), Err(ConfigError::Decode));
    }

    #[test]
    fn test_from_bytes_validates() {
        let mut config = NodeConfig::trc(ME, peers());
        config.sampling.reads_per_scan = 0;
        let bytes = config.to_bytes().unwrap();
        assert!(matches!(NodeConfig::from_bytes(&bytes), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_durations() {
        let config = NodeConfig::trc(ME, peers());
        assert_eq!(config.sampling.sample_interval(), Duration::from_secs(5));
        assert_eq!(config.sampling.log_interval(), Duration::from_secs(180));
        assert_eq!(config.listen_timeout(), Duration::from_secs(30));
    }
}
