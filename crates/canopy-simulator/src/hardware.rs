//! Simulated node hardware: accelerated time, drifting clocks, the
//! amplifier bank over a heated leaf with its select lines, the relay and
//! the climate sensor.

use std::cell::RefCell;
use std::convert::Infallible;
use std::f64::consts::TAU;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use canopy_core::sensors::{
    ChannelReader, ClimateReading, ClimateSensor, FaultFlags, RawFrame, SensorError,
};
use canopy_core::{Clock, DateTime};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embedded_hal::digital::{ErrorType, OutputPin};
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::{self, ErrorKind, Operation, SpiDevice};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

/// Simulated time running `speed` times faster than real time.
#[derive(Debug, Clone, Copy)]
pub struct SimTime {
    started: Instant,
    speed: f64,
}

impl SimTime {
    pub fn new(speed: f64) -> Self {
        Self {
            started: Instant::now(),
            speed: speed.max(1.0),
        }
    }

    /// Simulated seconds since start.
    pub fn elapsed_secs(&self) -> f64 {
        self.started.elapsed().as_secs_f64() * self.speed
    }

    /// Real duration of a simulated one.
    pub fn real(&self, sim: embassy_time::Duration) -> std::time::Duration {
        std::time::Duration::from_micros(sim.as_micros()).div_f64(self.speed)
    }
}

/// Real-time clock of one station, drifting by `drift_ppm`.
pub struct SimClock {
    time: SimTime,
    base_unix: f64,
    base_elapsed: f64,
    drift_ppm: f64,
}

impl SimClock {
    /// Clock that starts at the host's wall time.
    pub fn wall(time: SimTime) -> Self {
        let unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        Self {
            time,
            base_unix: unix,
            base_elapsed: time.elapsed_secs(),
            drift_ppm: 0.0,
        }
    }

    /// Clock that has lost its battery backed time and runs off by
    /// `drift_ppm`.
    pub fn unset(time: SimTime, drift_ppm: f64) -> Self {
        Self {
            time,
            base_unix: 946_684_800.0, // 2000-01-01
            base_elapsed: time.elapsed_secs(),
            drift_ppm,
        }
    }
}

impl Clock for SimClock {
    fn now(&mut self) -> DateTime {
        let since = self.time.elapsed_secs() - self.base_elapsed;
        let unix = self.base_unix + since * (1.0 + self.drift_ppm / 1e6);
        DateTime::from_unix(unix as i64)
    }

    fn set(&mut self, time: DateTime) {
        self.base_unix = time.to_unix() as f64;
        self.base_elapsed = self.time.elapsed_secs();
    }
}

/// Blocking delay scaled by the simulation speed.
pub struct SimDelay(pub SimTime);

impl DelayNs for SimDelay {
    async fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(self.0.real(embassy_time::Duration::from_nanos(ns as u64)));
    }

    async fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(self.0.real(embassy_time::Duration::from_millis(ms as u64)));
    }
}

// ---------------------------------------------------------------------------
// Weather and the heated leaf
// ---------------------------------------------------------------------------

/// Air temperature: daily cycle between 12 and 24 °C.
fn ambient(t: f64) -> f64 {
    18.0 - 6.0 * (TAU * t / 86_400.0).cos()
}

/// Small repeatable jitter so averages have something to do.
fn jitter(n: u64, amplitude: f64) -> f64 {
    amplitude * (n as f64 * 1.7).sin()
}

/// First-order lag of `value` toward `target`.
fn settle(value: f64, target: f64, dt: f64, tau: f64) -> f64 {
    value + (target - value) * (1.0 - (-dt / tau).exp())
}

const LEAF_TAU_SECS: f64 = 180.0;
const PAD_TAU_SECS: f64 = 60.0;
/// Steady-state excess of the heated leaf and pad over the air.
const LEAF_GAIN: f64 = 6.0;
const PAD_GAIN: f64 = 25.0;

#[derive(Debug)]
struct PlantState {
    last: f64,
    leaf: f64,
    pad: f64,
}

/// Heated leaf, its pad and the surrounding air, shared between the board
/// that measures them and the relay that heats them.
#[derive(Clone)]
pub struct Plant {
    time: SimTime,
    heating: Arc<AtomicBool>,
    state: Arc<Mutex<CriticalSectionRawMutex, RefCell<PlantState>>>,
}

impl Plant {
    pub fn new(time: SimTime) -> Self {
        let air = ambient(0.0);
        Self {
            time,
            heating: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(RefCell::new(PlantState {
                last: 0.0,
                leaf: air,
                pad: air,
            }))),
        }
    }

    pub fn relay(&self) -> SimRelay {
        SimRelay(self.heating.clone())
    }

    pub fn is_heating(&self) -> bool {
        self.heating.load(Ordering::Relaxed)
    }

    /// `(air, leaf, pad)` at the current simulated time.
    fn temperatures(&self) -> (f64, f64, f64) {
        let t = self.time.elapsed_secs();
        let air = ambient(t);
        let heating = self.is_heating();
        self.state.lock(|state| {
            let mut s = state.borrow_mut();
            let dt = (t - s.last).max(0.0);
            let boost = if heating { 1.0 } else { 0.0 };
            s.leaf = settle(s.leaf, air + LEAF_GAIN * boost, dt, LEAF_TAU_SECS);
            s.pad = settle(s.pad, air + PAD_GAIN * boost, dt, PAD_TAU_SECS);
            s.last = t;
            (air, s.leaf, s.pad)
        })
    }
}

/// The five MAX31855 amplifiers of a heating box on one SPI bus.
///
/// Each amplifier answers only while its select line is low. A transfer
/// with no line or several lines low is a chip-select fault.
pub struct SimAmplifiers {
    plant: Plant,
    faulty: Option<u8>,
    /// Bit `n - 1` is set while select line `n` is low
    selected: Arc<AtomicU8>,
    reads: u64,
}

impl SimAmplifiers {
    pub const CHANNELS: u8 = 5;

    pub fn new(plant: Plant, faulty: Option<u8>) -> Self {
        Self {
            plant,
            faulty,
            selected: Arc::new(AtomicU8::new(0)),
            reads: 0,
        }
    }

    /// Select lines 1 to `CHANNELS`, in order.
    pub fn select_lines(&self) -> Vec<SimSelectLine> {
        (0..Self::CHANNELS)
            .map(|i| SimSelectLine {
                selected: self.selected.clone(),
                mask: 1 << i,
            })
            .collect()
    }

    fn frame(&mut self, select: u8) -> RawFrame {
        if self.faulty == Some(select) {
            return RawFrame::encode_fault(FaultFlags {
                open_circuit: true,
                ..Default::default()
            });
        }

        self.reads += 1;
        let (air, leaf, pad) = self.plant.temperatures();
        let temperature = match select {
            1 => leaf,
            2 => air + 0.3,
            3 => air,
            4 => pad,
            _ => air + 0.5,
        };
        let noise = jitter(self.reads, 0.15);
        RawFrame::encode(temperature + noise, air + 2.0)
    }
}

impl spi::ErrorType for SimAmplifiers {
    type Error = ErrorKind;
}

impl SpiDevice<u8> for SimAmplifiers {
    async fn transaction(&mut self, operations: &mut [Operation<'_, u8>]) -> Result<(), ErrorKind> {
        let active = self.selected.load(Ordering::Relaxed);
        if active.count_ones() != 1 {
            return Err(ErrorKind::ChipSelectFault);
        }
        let frame = self.frame(active.trailing_zeros() as u8 + 1);
        for op in operations {
            let read = match op {
                Operation::Read(buf) | Operation::TransferInPlace(buf) => buf,
                Operation::Transfer(read, _) => read,
                _ => continue,
            };
            for (byte, value) in read.iter_mut().zip(frame.0) {
                *byte = value;
            }
        }
        Ok(())
    }
}

/// Active-low select line of one amplifier.
pub struct SimSelectLine {
    selected: Arc<AtomicU8>,
    mask: u8,
}

impl ErrorType for SimSelectLine {
    type Error = Infallible;
}

impl OutputPin for SimSelectLine {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.selected.fetch_or(self.mask, Ordering::Relaxed);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.selected.fetch_and(!self.mask, Ordering::Relaxed);
        Ok(())
    }
}

/// Thermocouple held in a reference bath for calibration.
pub struct BenchThermocouple {
    bath: f64,
    /// Sensor error before calibration
    bias: f64,
    reads: u64,
}

impl BenchThermocouple {
    pub fn new(bath: f64, bias: f64) -> Self {
        Self { bath, bias, reads: 0 }
    }
}

impl ChannelReader for BenchThermocouple {
    async fn read_frame(&mut self, _select: u8) -> Result<RawFrame, SensorError> {
        self.reads += 1;
        Ok(RawFrame::encode(self.bath + self.bias + jitter(self.reads, 0.1), 21.0))
    }
}

/// Heater relay output.
pub struct SimRelay(Arc<AtomicBool>);

impl ErrorType for SimRelay {
    type Error = Infallible;
}

impl OutputPin for SimRelay {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.0.store(false, Ordering::Relaxed);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.0.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Aspirated temperature / humidity / pressure sensor.
pub struct SimClimate {
    time: SimTime,
    reads: u64,
}

impl SimClimate {
    pub fn new(time: SimTime) -> Self {
        Self { time, reads: 0 }
    }
}

impl ClimateSensor for SimClimate {
    async fn read(&mut self) -> Result<ClimateReading, SensorError> {
        self.reads += 1;
        let t = self.time.elapsed_secs();
        let temperature = ambient(t) + jitter(self.reads, 0.05);
        Ok(ClimateReading {
            temperature,
            // Relative humidity falls as the air warms.
            humidity: (75.0 - 2.5 * (temperature - 12.0)).clamp(0.0, 100.0),
            pressure: 1013.0 + 2.0 * (TAU * t / 43_200.0).sin(),
        })
    }
}
