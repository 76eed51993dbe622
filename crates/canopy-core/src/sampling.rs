//! Multiplexed thermocouple scans.
//!
//! A scan makes `reads_per_scan` passes over every configured channel, one
//! read per channel per pass, so each channel's reads are spread across the
//! whole scan rather than taken back to back. Faulted frames and bus errors
//! are left out of the average; a channel with no usable read reports NaN.

use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, warn};

use crate::calibration::{self, Calibration};
use crate::config::ChannelConfig;
use crate::sensors::{ChannelReader, FrameReading};

/// Round to two decimals, as every reported temperature is.
pub fn round2(value: f64) -> f64 {
    libm::round(value * 100.0) / 100.0
}

/// Running sums for one channel during one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct ScanAccumulator {
    sum: f64,
    internal_sum: f64,
    valid: u32,
}

impl ScanAccumulator {
    fn add(&mut self, temperature: f64, internal: f64) {
        self.sum += temperature;
        self.internal_sum += internal;
        self.valid += 1;
    }

    fn mean(sum: f64, count: u32) -> f64 {
        if count == 0 {
            f64::NAN
        } else {
            round2(sum / count as f64)
        }
    }
}

/// A named thermocouple position on the multiplexer.
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    /// 1-based select line
    pub select: u8,
    pub calibration: Option<Calibration>,
    acc: ScanAccumulator,
}

impl Channel {
    pub fn new(name: impl Into<String>, select: u8, calibration: Option<Calibration>) -> Self {
        Self {
            name: name.into(),
            select,
            calibration,
            acc: ScanAccumulator::default(),
        }
    }

    pub fn from_config(config: &ChannelConfig) -> Self {
        Self::new(config.name.clone(), config.select, config.calibration)
    }

    fn result(&self) -> ScanResult {
        let temperature = ScanAccumulator::mean(self.acc.sum, self.acc.valid);
        ScanResult {
            name: self.name.clone(),
            temperature,
            internal: ScanAccumulator::mean(self.acc.internal_sum, self.acc.valid),
            calibrated: calibration::correct(self.calibration.as_ref(), temperature),
            count: u32::from(self.acc.valid > 0),
            valid_reads: self.acc.valid,
        }
    }
}

/// Outcome of one scan for one channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ScanResult {
    pub name: String,
    /// Mean thermocouple temperature, rounded; NaN without a valid read.
    pub temperature: f64,
    /// Mean cold-junction temperature, rounded; NaN without a valid read.
    pub internal: f64,
    /// `temperature` after the channel's calibration.
    pub calibrated: f64,
    /// 1 if any read was usable, else 0.
    pub count: u32,
    pub valid_reads: u32,
}

/// Results of a scan, in channel order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanResults(pub Vec<ScanResult>);

impl ScanResults {
    pub fn get(&self, name: &str) -> Option<&ScanResult> {
        self.0.iter().find(|r| r.name == name)
    }

    /// Calibrated temperature of `name`, NaN when the channel is unknown.
    pub fn calibrated(&self, name: &str) -> f64 {
        self.get(name).map_or(f64::NAN, |r| r.calibrated)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ScanResult> {
        self.0.iter()
    }
}

pub struct Sampler {
    reads_per_scan: u8,
}

impl Sampler {
    pub fn new(reads_per_scan: u8) -> Self {
        Self {
            reads_per_scan: reads_per_scan.max(1),
        }
    }

    /// Run one scan over `channels`. Accumulators are reset first.
    pub async fn scan<R: ChannelReader>(
        &self,
        reader: &mut R,
        channels: &mut [Channel],
    ) -> ScanResults {
        for channel in channels.iter_mut() {
            channel.acc = ScanAccumulator::default();
        }

        for pass in 0..self.reads_per_scan {
            for channel in channels.iter_mut() {
                match reader.read_frame(channel.select).await {
                    Ok(frame) => match frame.decode() {
                        FrameReading::Valid {
                            temperature,
                            internal,
                        } => channel.acc.add(temperature, internal),
                        FrameReading::Fault(flags) => {
                            warn!(
                                "Thermocouple {} (select {}) fault on pass {}: {:?}",
                                channel.name, channel.select, pass, flags
                            );
                        }
                    },
                    Err(e) => {
                        warn!("Thermocouple {} read failed: {}", channel.name, e);
                    }
                }
            }
        }

        let results = ScanResults(channels.iter().map(Channel::result).collect());
        for r in results.iter() {
            debug!(
                "{}: {} ({} of {} reads)",
                r.name, r.temperature, r.valid_reads, self.reads_per_scan
            );
        }
        results
    }
}
