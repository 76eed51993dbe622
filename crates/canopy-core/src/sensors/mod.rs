mod max31855;
mod mux;

pub use max31855::{FaultFlags, FrameReading, RawFrame};
pub use mux::{DEFAULT_SETTLE_MS, MuxedThermocouples};

use core::future::Future;

use thiserror_no_std::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SensorError {
    #[error("{sensor} bus transfer failed during {operation}")]
    Bus {
        sensor: &'static str,
        operation: &'static str,
    },
    #[error("no select line {select} on the multiplexer")]
    InvalidChannel { select: u8 },
    #[error("{sensor} read failed: {details}")]
    ReadFailed {
        sensor: &'static str,
        details: heapless::String<64>,
    },
}

/// Multiplexed thermocouple bank.
///
/// `select` is the 1-based position of the amplifier on the board. One call
/// returns one raw 32-bit amplifier frame; decoding and fault handling are
/// the sampler's job.
pub trait ChannelReader {
    fn read_frame(&mut self, select: u8) -> impl Future<Output = Result<RawFrame, SensorError>>;
}

impl<R: ChannelReader + ?Sized> ChannelReader for &mut R {
    fn read_frame(&mut self, select: u8) -> impl Future<Output = Result<RawFrame, SensorError>> {
        (**self).read_frame(select)
    }
}

/// One aspirated temperature/humidity/pressure measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClimateReading {
    /// Degrees Celsius
    pub temperature: f64,
    /// Percent relative humidity
    pub humidity: f64,
    /// Hectopascal
    pub pressure: f64,
}

impl ClimateReading {
    pub const fn to_array(self) -> [f64; 3] {
        [self.temperature, self.humidity, self.pressure]
    }
}

/// Climate sensor on the THP node.
pub trait ClimateSensor {
    fn read(&mut self) -> impl Future<Output = Result<ClimateReading, SensorError>>;
}
