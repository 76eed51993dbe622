//! Thermocouple calibration: the per-channel correction polynomial and the
//! bench capture used to collect reference points for it.
//!
//! Coefficients are fitted offline from the `CALIBRATE:` runs the aggregator
//! stores, then written into each node's configuration.

use alloc::vec::Vec;

use embedded_hal_async::delay::DelayNs;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

use crate::link::message::{MessageBuilder, Reading};
use crate::link::{MacAddress, Payload, Tag};
use crate::sensors::{ChannelReader, FrameReading, SensorError};

/// Readings that must agree for a capture to count as stable.
pub const STABLE_READINGS: usize = 30;
/// Largest allowed spread (max - min, °C) across the stable readings.
pub const STABLE_RANGE: f64 = 0.75;
/// Reads attempted before giving up on a capture.
pub const CAPTURE_TIMEOUT_READS: usize = 50;
/// Pause between capture reads.
pub const CAPTURE_INTERVAL_MS: u32 = 250;

/// `corrected = offset + slope * raw + quadratic * raw²`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Calibration {
    pub offset: f64,
    pub slope: f64,
    pub quadratic: f64,
}

impl Calibration {
    pub const fn new(offset: f64, slope: f64, quadratic: f64) -> Self {
        Self {
            offset,
            slope,
            quadratic,
        }
    }

    pub const fn linear(offset: f64, slope: f64) -> Self {
        Self::new(offset, slope, 0.0)
    }

    /// Apply the polynomial.
    ///
    /// Exact zero and NaN pass through unchanged: a zero reading is the
    /// heating controller's dead-sensor signal and must reach it as-is.
    pub fn correct(&self, raw: f64) -> f64 {
        if raw == 0.0 || raw.is_nan() {
            raw
        } else {
            self.offset + self.slope * raw + self.quadratic * raw * raw
        }
    }
}

/// Correct with an optional calibration; channels without one pass through.
pub fn correct(calibration: Option<&Calibration>, raw: f64) -> f64 {
    calibration.map_or(raw, |c| c.correct(raw))
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CalibrationError {
    #[error("thermocouple fault on select line {select}, check the connection")]
    Fault { select: u8 },
    #[error("sensor error: {0}")]
    Sensor(SensorError),
    #[error("readings never settled: spread {range} after {reads} reads")]
    Unstable { range: f64, reads: usize },
}

/// Summary of the readings kept by a capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureStats {
    pub mean: f64,
    /// Sample standard deviation
    pub std_dev: f64,
    pub min: f64,
    pub max: f64,
}

impl CaptureStats {
    pub fn from_readings(readings: &[f64]) -> Option<Self> {
        if readings.is_empty() {
            return None;
        }
        let n = readings.len() as f64;
        let mean = readings.iter().sum::<f64>() / n;
        let min = readings.iter().copied().fold(f64::INFINITY, f64::min);
        let max = readings.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let std_dev = if readings.len() > 1 {
            let ss: f64 = readings.iter().map(|x| (x - mean) * (x - mean)).sum();
            libm::sqrt(ss / (n - 1.0))
        } else {
            0.0
        };
        Some(Self {
            mean,
            std_dev,
            min,
            max,
        })
    }

    pub fn range(&self) -> f64 {
        self.max - self.min
    }

    /// Coefficient of variation.
    pub fn cv(&self) -> f64 {
        self.std_dev / self.mean
    }
}

/// A stable run of readings from one thermocouple held at a reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    pub readings: Vec<f64>,
    pub stats: CaptureStats,
    pub reads_taken: usize,
}

/// Rolling window of the most recent readings.
#[derive(Debug)]
pub struct StabilityWindow {
    readings: heapless::Deque<f64, STABLE_READINGS>,
    reads: usize,
}

impl StabilityWindow {
    pub const fn new() -> Self {
        Self {
            readings: heapless::Deque::new(),
            reads: 0,
        }
    }

    pub fn push(&mut self, reading: f64) {
        if self.readings.is_full() {
            self.readings.pop_front();
        }
        // Room was made above.
        let _ = self.readings.push_back(reading);
        self.reads += 1;
    }

    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Spread of the window once it is full.
    pub fn range(&self) -> Option<f64> {
        if !self.readings.is_full() {
            return None;
        }
        let (min, max) = self
            .readings
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &x| (lo.min(x), hi.max(x)));
        Some(max - min)
    }

    pub fn is_stable(&self) -> bool {
        self.range().is_some_and(|r| r <= STABLE_RANGE)
    }

    pub fn readings(&self) -> Vec<f64> {
        self.readings.iter().copied().collect()
    }
}

/// Read one channel until [`STABLE_READINGS`] consecutive readings fall
/// within [`STABLE_RANGE`], or [`CAPTURE_TIMEOUT_READS`] reads pass.
pub async fn capture<R, D>(
    reader: &mut R,
    delay: &mut D,
    select: u8,
) -> Result<Capture, CalibrationError>
where
    R: ChannelReader,
    D: DelayNs,
{
    let mut window = StabilityWindow::new();

    while window.reads() < CAPTURE_TIMEOUT_READS && !window.is_stable() {
        let frame = reader
            .read_frame(select)
            .await
            .map_err(CalibrationError::Sensor)?;
        match frame.decode() {
            FrameReading::Valid { temperature, .. } => window.push(temperature),
            FrameReading::Fault(flags) => {
                warn!("Calibration read on select line {} faulted: {:?}", select, flags);
                return Err(CalibrationError::Fault { select });
            }
        }
        delay.delay_ms(CAPTURE_INTERVAL_MS).await;
    }

    info!("Calibration capture took {} reads", window.reads());

    if !window.is_stable() {
        return Err(CalibrationError::Unstable {
            range: window.range().unwrap_or(f64::NAN),
            reads: window.reads(),
        });
    }

    let readings = window.readings();
    let stats = CaptureStats::from_readings(&readings).ok_or(CalibrationError::Unstable {
        range: f64::NAN,
        reads: window.reads(),
    })?;
    Ok(Capture {
        readings,
        stats,
        reads_taken: window.reads(),
    })
}

/// Build the `CALIBRATE:` frame for a capture:
/// `<mac>,<sensor id>,<position>,<reference>,[r1,r2,...]`.
///
/// Spaces are removed from the sensor id so the run fits one frame.
pub fn calibration_payload(
    node: &MacAddress,
    sensor_id: &str,
    position: u8,
    reference: f64,
    readings: &[f64],
) -> Result<Payload, crate::link::MessageError> {
    let mut list = alloc::string::String::from("[");
    for (i, r) in readings.iter().enumerate() {
        if i > 0 {
            list.push(',');
        }
        list.push_str(&alloc::format!("{}", Reading(*r)));
    }
    list.push(']');

    let id: alloc::string::String = sensor_id.chars().filter(|c| !c.is_whitespace()).collect();

    let mut msg = MessageBuilder::new(Tag::Calibrate);
    msg.field(node)
        .field(id)
        .field(position)
        .field(reference)
        .field(list);
    msg.finish()
}
