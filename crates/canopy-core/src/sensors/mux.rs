//! Thermocouple amplifiers sharing one SPI bus behind active-low select lines.

use alloc::vec::Vec;

use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use embedded_hal_async::spi::SpiDevice;
use log::error;

use super::{ChannelReader, RawFrame, SensorError};
use crate::config::SamplingConfig;

/// Settle time after switching the multiplexer before the amplifier output
/// is valid.
pub const DEFAULT_SETTLE_MS: u32 = 250;

/// Bank of MAX31855 amplifiers, one per select line.
///
/// Select line `n` (1-based) enables amplifier `n` when driven low. Exactly
/// one line is low while a frame is clocked out; all lines are high at rest.
pub struct MuxedThermocouples<S, P, D> {
    spi: S,
    select_lines: Vec<P>,
    delay: D,
    settle_ms: u32,
}

impl<S, P, D> MuxedThermocouples<S, P, D>
where
    S: SpiDevice<u8>,
    P: OutputPin,
    D: DelayNs,
{
    pub fn new(spi: S, select_lines: Vec<P>, delay: D, settle_ms: u32) -> Self {
        let mut bank = Self {
            spi,
            select_lines,
            delay,
            settle_ms,
        };
        deselect_all(&mut bank.select_lines);
        bank
    }

    /// Bank that waits the configured settle time before each read.
    pub fn from_config(spi: S, select_lines: Vec<P>, delay: D, sampling: &SamplingConfig) -> Self {
        Self::new(spi, select_lines, delay, sampling.settle_ms)
    }

    pub fn channel_count(&self) -> usize {
        self.select_lines.len()
    }

    pub fn release(self) -> (S, Vec<P>, D) {
        (self.spi, self.select_lines, self.delay)
    }
}

impl<S, P, D> ChannelReader for MuxedThermocouples<S, P, D>
where
    S: SpiDevice<u8>,
    P: OutputPin,
    D: DelayNs,
{
    async fn read_frame(&mut self, select: u8) -> Result<RawFrame, SensorError> {
        let index = (select as usize)
            .checked_sub(1)
            .filter(|i| *i < self.select_lines.len())
            .ok_or(SensorError::InvalidChannel { select })?;

        let _selected = Selection::activate(&mut self.select_lines, index)?;
        self.delay.delay_ms(self.settle_ms).await;

        let mut buf = [0u8; 4];
        self.spi.read(&mut buf).await.map_err(|e| {
            error!("MAX31855 read on select line {} failed: {:?}", select, e);
            SensorError::Bus {
                sensor: "MAX31855",
                operation: "read frame",
            }
        })?;

        Ok(RawFrame(buf))
    }
}

/// One active select line. Dropping it returns every line to inactive, on
/// the error paths as well.
struct Selection<'a, P: OutputPin> {
    lines: &'a mut [P],
}

impl<'a, P: OutputPin> Selection<'a, P> {
    fn activate(lines: &'a mut [P], index: usize) -> Result<Self, SensorError> {
        deselect_all(lines);
        let mut selection = Self { lines };
        selection.lines[index].set_low().map_err(|e| {
            error!("Unable to drive select line {}: {:?}", index + 1, e);
            SensorError::Bus {
                sensor: "MAX31855",
                operation: "select channel",
            }
        })?;
        Ok(selection)
    }
}

impl<P: OutputPin> Drop for Selection<'_, P> {
    fn drop(&mut self) {
        deselect_all(self.lines);
    }
}

fn deselect_all<P: OutputPin>(lines: &mut [P]) {
    for (i, line) in lines.iter_mut().enumerate() {
        if let Err(e) = line.set_high() {
            error!("Unable to release select line {}: {:?}", i + 1, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use core::convert::Infallible;
    use embassy_futures::block_on;
    use embedded_hal_async::spi::{ErrorKind, ErrorType, Operation};
    use std::rc::Rc;

    /// Shared event trace: `L<n>`/`H<n>` pin edges, `D<ms>` delay, `R` transfer.
    type Trace = Rc<RefCell<Vec<String>>>;

    struct TracePin {
        id: usize,
        trace: Trace,
        low: bool,
    }

    impl embedded_hal::digital::ErrorType for TracePin {
        type Error = Infallible;
    }

    impl OutputPin for TracePin {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.low = true;
            self.trace.borrow_mut().push(format!("L{}", self.id));
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.low = false;
            self.trace.borrow_mut().push(format!("H{}", self.id));
            Ok(())
        }
    }

    struct TraceDelay(Trace);

    impl DelayNs for TraceDelay {
        async fn delay_ns(&mut self, ns: u32) {
            self.0.borrow_mut().push(format!("D{}", ns / 1_000_000));
        }
    }

    struct FakeSpi {
        trace: Trace,
        frame: [u8; 4],
        fail: bool,
    }

    impl ErrorType for FakeSpi {
        type Error = ErrorKind;
    }

    impl SpiDevice<u8> for FakeSpi {
        async fn transaction(
            &mut self,
            operations: &mut [Operation<'_, u8>],
        ) -> Result<(), ErrorKind> {
            self.trace.borrow_mut().push("R".into());
            if self.fail {
                return Err(ErrorKind::Other);
            }
            for op in operations {
                if let Operation::Read(buf) = op {
                    buf.copy_from_slice(&self.frame);
                }
            }
            Ok(())
        }
    }

    fn parts(fail: bool) -> (FakeSpi, Vec<TracePin>, TraceDelay, Trace) {
        let trace: Trace = Rc::new(RefCell::new(Vec::new()));
        let pins = (1..=3)
            .map(|id| TracePin {
                id,
                trace: trace.clone(),
                low: false,
            })
            .collect();
        let spi = FakeSpi {
            trace: trace.clone(),
            frame: RawFrame::encode(20.0, 21.0).0,
            fail,
        };
        (spi, pins, TraceDelay(trace.clone()), trace)
    }

    fn bank(fail: bool) -> (MuxedThermocouples<FakeSpi, TracePin, TraceDelay>, Trace) {
        let (spi, pins, delay, trace) = parts(fail);
        let bank = MuxedThermocouples::new(spi, pins, delay, DEFAULT_SETTLE_MS);
        trace.borrow_mut().clear();
        (bank, trace)
    }

    #[test]
    fn test_read_sequence_is_scoped() {
        let (mut bank, trace) = bank(false);
        let frame = block_on(bank.read_frame(2)).unwrap();
        assert_eq!(frame, RawFrame::encode(20.0, 21.0));
        assert_eq!(
            *trace.borrow(),
            ["H1", "H2", "H3", "L2", "D250", "R", "H1", "H2", "H3"]
        );
        assert!(bank.select_lines.iter().all(|p| !p.low));
    }

    #[test]
    fn test_bus_error_still_releases_lines() {
        let (mut bank, trace) = bank(true);
        let err = block_on(bank.read_frame(3)).unwrap_err();
        assert!(matches!(err, SensorError::Bus { .. }));
        assert_eq!(trace.borrow().last().map(String::as_str), Some("H3"));
        assert!(bank.select_lines.iter().all(|p| !p.low));
    }

    #[test]
    fn test_invalid_select_touches_nothing() {
        let (mut bank, trace) = bank(false);
        assert_eq!(
            block_on(bank.read_frame(0)),
            Err(SensorError::InvalidChannel { select: 0 })
        );
        assert_eq!(
            block_on(bank.read_frame(4)),
            Err(SensorError::InvalidChannel { select: 4 })
        );
        assert!(trace.borrow().is_empty());
    }

    #[test]
    fn test_settle_time_comes_from_sampling_config() {
        let (spi, pins, delay, trace) = parts(false);
        let sampling = SamplingConfig {
            settle_ms: 100,
            ..SamplingConfig::default()
        };
        let mut bank = MuxedThermocouples::from_config(spi, pins, delay, &sampling);
        trace.borrow_mut().clear();

        block_on(bank.read_frame(1)).unwrap();
        assert_eq!(trace.borrow()[4], "D100");
        assert_eq!(bank.channel_count(), 3);
    }
}
