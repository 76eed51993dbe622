//! Closed-loop leaf heating.
//!
//! The heater is switched to keep the treatment leaf `TDIFF` degrees above
//! the reference leaf. A deadband between `0.8 * TDIFF` and `1.05 * TDIFF`
//! holds the previous command so the relay does not chatter, and a set of
//! safety checks overrides everything else to switch the heater off.

use embedded_hal::digital::OutputPin;
use log::{debug, error, warn};
use thiserror_no_std::Error;

use crate::config::HeatingThresholds;

/// Heater turns on at or below this fraction of TDIFF.
pub const ON_FACTOR: f64 = 0.8;
/// Heater turns off above this fraction of TDIFF.
pub const OFF_FACTOR: f64 = 1.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeatingState {
    On,
    #[default]
    Off,
}

/// Why the heater was forced off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SafetyTrip {
    /// Treatment leaf reads exactly zero: dead sensor
    TreatmentZero,
    /// Reference leaf reads exactly zero: dead sensor
    ReferenceZero,
    /// Treatment or reference missing from the scan
    NoDifference,
    HeaterTooHot,
    TreatmentTooHot,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatingDecision {
    pub state: HeatingState,
    /// Treatment minus reference
    pub diff: f64,
    pub trip: Option<SafetyTrip>,
}

pub struct HeatingController {
    thresholds: HeatingThresholds,
    last: HeatingState,
}

impl HeatingController {
    pub fn new(thresholds: HeatingThresholds) -> Self {
        Self {
            thresholds,
            last: HeatingState::Off,
        }
    }

    pub fn on_threshold(&self) -> f64 {
        self.thresholds.tdiff * ON_FACTOR
    }

    pub fn off_threshold(&self) -> f64 {
        self.thresholds.tdiff * OFF_FACTOR
    }

    /// Last commanded state.
    pub fn state(&self) -> HeatingState {
        self.last
    }

    pub fn decide(&mut self, treatment: f64, reference: f64, heater: f64) -> HeatingState {
        self.evaluate(treatment, reference, heater).state
    }

    /// Decide the relay command from calibrated scan temperatures.
    pub fn evaluate(&mut self, treatment: f64, reference: f64, heater: f64) -> HeatingDecision {
        let diff = treatment - reference;

        if let Some(trip) = self.safety_trip(treatment, reference, diff, heater) {
            warn!(
                "Heater forced off ({:?}): treatment {} reference {} heater {}",
                trip, treatment, reference, heater
            );
            self.last = HeatingState::Off;
            return HeatingDecision {
                state: HeatingState::Off,
                diff,
                trip: Some(trip),
            };
        }

        if diff <= self.on_threshold() {
            self.last = HeatingState::On;
        } else if diff > self.off_threshold() {
            self.last = HeatingState::Off;
        }

        debug!(
            "Heater {:?}: diff {} (on <= {}, off > {})",
            self.last,
            diff,
            self.on_threshold(),
            self.off_threshold()
        );

        HeatingDecision {
            state: self.last,
            diff,
            trip: None,
        }
    }

    fn safety_trip(
        &self,
        treatment: f64,
        reference: f64,
        diff: f64,
        heater: f64,
    ) -> Option<SafetyTrip> {
        if treatment == 0.0 {
            Some(SafetyTrip::TreatmentZero)
        } else if reference == 0.0 {
            Some(SafetyTrip::ReferenceZero)
        } else if diff.is_nan() {
            Some(SafetyTrip::NoDifference)
        } else if heater >= self.thresholds.tmax_heater {
            Some(SafetyTrip::HeaterTooHot)
        } else if treatment >= self.thresholds.tmax {
            Some(SafetyTrip::TreatmentTooHot)
        } else {
            None
        }
    }
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayError {
    #[error("unable to drive the heater relay")]
    Pin,
}

/// Heater relay on an active-high output.
pub struct Relay<P> {
    pin: P,
    state: HeatingState,
}

impl<P: OutputPin> Relay<P> {
    /// Take the pin and switch the heater off.
    pub fn new(pin: P) -> Result<Self, RelayError> {
        let mut relay = Self {
            pin,
            state: HeatingState::Off,
        };
        relay.force_off()?;
        Ok(relay)
    }

    /// Drive the relay. Repeating the current state is harmless.
    pub fn apply(&mut self, state: HeatingState) -> Result<(), RelayError> {
        let result = match state {
            HeatingState::On => self.pin.set_high(),
            HeatingState::Off => self.pin.set_low(),
        };
        result.map_err(|e| {
            error!("Heater relay pin failed: {:?}", e);
            RelayError::Pin
        })?;
        self.state = state;
        Ok(())
    }

    pub fn force_off(&mut self) -> Result<(), RelayError> {
        self.apply(HeatingState::Off)
    }

    pub fn state(&self) -> HeatingState {
        self.state
    }

    pub fn release(self) -> P {
        self.pin
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    fn controller() -> HeatingController {
        HeatingController::new(HeatingThresholds {
            tdiff: 3.0,
            tmax: 40.0,
            tmax_heater: 55.0,
        })
    }

    #[test]
    fn test_thresholds() {
        let c = controller();
        assert!((c.on_threshold() - 2.4).abs() < 1e-9);
        assert!((c.off_threshold() - 3.15).abs() < 1e-9);
    }

    #[test]
    fn test_deadband() {
        let mut c = controller();
        assert_eq!(c.decide(22.0, 20.0, 30.0), HeatingState::On);
        // 2.8 is inside the band: hold
        assert_eq!(c.decide(22.8, 20.0, 30.0), HeatingState::On);
        assert_eq!(c.decide(23.5, 20.0, 30.0), HeatingState::Off);
        assert_eq!(c.decide(22.8, 20.0, 30.0), HeatingState::Off);
    }

    #[test]
    fn test_band_edges() {
        let mut c = controller();
        assert_eq!(c.decide(22.4, 20.0, 30.0), HeatingState::On);
        // exactly at the off threshold still holds
        assert_eq!(c.decide(23.0, 19.85, 30.0), HeatingState::On);
    }

    #[test]
    fn test_initial_hold_is_off() {
        let mut c = controller();
        assert_eq!(c.decide(22.8, 20.0, 30.0), HeatingState::Off);
    }

    #[test]
    fn test_dead_sensor_forces_off() {
        let mut c = controller();
        let d = c.evaluate(0.0, 5.0, 30.0);
        assert_eq!(d.state, HeatingState::Off);
        assert_eq!(d.trip, Some(SafetyTrip::TreatmentZero));
        assert_eq!(c.evaluate(5.0, 0.0, 30.0).trip, Some(SafetyTrip::ReferenceZero));
        assert_eq!(c.evaluate(f64::NAN, 20.0, 30.0).trip, Some(SafetyTrip::NoDifference));
    }

    #[test]
    fn test_over_temperature_forces_off() {
        let mut c = controller();
        assert_eq!(c.decide(22.0, 20.0, 30.0), HeatingState::On);
        assert_eq!(c.evaluate(22.0, 20.0, 55.0).trip, Some(SafetyTrip::HeaterTooHot));
        assert_eq!(c.evaluate(40.0, 39.0, 30.0).trip, Some(SafetyTrip::TreatmentTooHot));
    }

    #[test]
    fn test_trip_resets_hold_state() {
        let mut c = controller();
        assert_eq!(c.decide(22.0, 20.0, 30.0), HeatingState::On);
        assert_eq!(c.decide(22.0, 20.0, 60.0), HeatingState::Off);
        assert_eq!(c.decide(22.8, 20.0, 30.0), HeatingState::Off);
    }

    #[test]
    fn test_missing_heater_reading_does_not_trip() {
        let mut c = controller();
        let d = c.evaluate(22.0, 20.0, f64::NAN);
        assert_eq!(d.state, HeatingState::On);
        assert_eq!(d.trip, None);
    }

    struct Pin {
        high: bool,
        writes: usize,
    }

    impl embedded_hal::digital::ErrorType for Pin {
        type Error = Infallible;
    }

    impl OutputPin for Pin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.high = false;
            self.writes += 1;
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.high = true;
            self.writes += 1;
            Ok(())
        }
    }

    #[test]
    fn test_relay_starts_off_and_is_idempotent() {
        let mut relay = Relay::new(Pin { high: true, writes: 0 }).unwrap();
        assert_eq!(relay.state(), HeatingState::Off);
        relay.apply(HeatingState::On).unwrap();
        relay.apply(HeatingState::On).unwrap();
        assert_eq!(relay.state(), HeatingState::On);
        relay.force_off().unwrap();
        let pin = relay.release();
        assert!(!pin.high);
        assert_eq!(pin.writes, 4);
    }
}
