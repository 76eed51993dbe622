//! Minute-aligned telemetry records.
//!
//! Scans are folded into a window; when the wall clock crosses a multiple
//! of the log interval the window is averaged, serialized into one frame
//! and cleared. Records are numbered from 1 for the life of the process.
//!
//! ## Record layouts
//!
//! - Thermocouple: `TRC:<record>,<timestamp>,<node id>,<means...>,<internal means...>`
//! - Climate: `CLIMATE:<record>,<timestamp>,<node id>,<temp>,<humidity>,<pressure>,<samples>`

use alloc::string::String;
use alloc::vec::Vec;

use log::{debug, info};

use crate::link::message::MessageBuilder;
use crate::link::{MacAddress, MessageError, Payload, Tag};
use crate::sampling::{ScanResults, round2};
use crate::sensors::ClimateReading;
use crate::time::DateTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordLayout {
    /// Per-channel means followed by per-channel cold-junction means,
    /// rounded to two decimals
    Thermocouple,
    /// Unrounded means followed by the number of samples
    Climate,
}

impl RecordLayout {
    pub const fn tag(self) -> Tag {
        match self {
            Self::Thermocouple => Tag::Trc,
            Self::Climate => Tag::Climate,
        }
    }
}

/// Edge-triggered detector for log interval boundaries.
///
/// The tracker arms when the minute's position within the interval changes
/// to 0, and only then: sitting on a boundary minute never re-arms it.
#[derive(Debug, Clone)]
pub struct BoundaryTracker {
    interval: u8,
    last: Option<u8>,
    armed_at: Option<DateTime>,
}

impl BoundaryTracker {
    pub fn new(interval_minutes: u8) -> Self {
        Self {
            interval: interval_minutes.max(1),
            last: None,
            armed_at: None,
        }
    }

    /// Feed the current time. Returns `true` if this observation armed the
    /// tracker.
    pub fn observe(&mut self, now: DateTime) -> bool {
        let boundary = now.minute % self.interval;
        if self.last == Some(boundary) {
            return false;
        }
        self.last = Some(boundary);
        self.armed_at = (boundary == 0).then_some(now);
        self.armed_at.is_some()
    }

    /// Time of the observation that armed the tracker.
    pub fn armed_at(&self) -> Option<DateTime> {
        self.armed_at
    }

    pub fn is_armed(&self) -> bool {
        self.armed_at.is_some()
    }

    pub fn disarm(&mut self) {
        self.armed_at = None;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct Column {
    sum: f64,
    internal_sum: f64,
    count: u32,
}

impl Column {
    fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }

    fn internal_mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.internal_sum / self.count as f64
        }
    }
}

/// Samples accumulated since the last flush.
#[derive(Debug, Clone)]
pub struct TelemetryWindow {
    layout: RecordLayout,
    names: Vec<String>,
    columns: Vec<Column>,
    samples: u32,
}

impl TelemetryWindow {
    /// Window over the named thermocouple channels, in record order.
    pub fn thermocouple<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        Self {
            layout: RecordLayout::Thermocouple,
            columns: alloc::vec![Column::default(); names.len()],
            names,
            samples: 0,
        }
    }

    pub fn climate() -> Self {
        Self {
            layout: RecordLayout::Climate,
            names: ["temperature", "humidity", "pressure"].map(String::from).into(),
            columns: alloc::vec![Column::default(); 3],
            samples: 0,
        }
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    /// Scans (or climate samples) added since the last reset.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    /// Fold in one scan. Channels without a valid read contribute nothing.
    pub fn add_scan(&mut self, scan: &ScanResults) {
        for (name, column) in self.names.iter().zip(self.columns.iter_mut()) {
            match scan.get(name) {
                Some(r) if r.count > 0 && !r.temperature.is_nan() => {
                    column.sum += r.temperature;
                    column.internal_sum += r.internal;
                    column.count += 1;
                }
                _ => debug!("No reading for {} in this scan", name),
            }
        }
        self.samples += 1;
    }

    pub fn add_climate(&mut self, reading: &ClimateReading) {
        for (column, value) in self.columns.iter_mut().zip(reading.to_array()) {
            if !value.is_nan() {
                column.sum += value;
                column.count += 1;
            }
        }
        self.samples += 1;
    }

    pub fn means(&self) -> Vec<f64> {
        self.columns.iter().map(Column::mean).collect()
    }

    pub fn internal_means(&self) -> Vec<f64> {
        self.columns.iter().map(Column::internal_mean).collect()
    }

    pub fn reset(&mut self) {
        self.columns.fill(Column::default());
        self.samples = 0;
    }

    fn record(
        &self,
        record: u32,
        timestamp: DateTime,
        node_id: &str,
    ) -> Result<Payload, MessageError> {
        let mut msg = MessageBuilder::new(self.layout.tag());
        msg.field(record).field(timestamp).field(node_id);
        match self.layout {
            RecordLayout::Thermocouple => {
                for mean in self.means() {
                    msg.reading(round2(mean));
                }
                for mean in self.internal_means() {
                    msg.reading(round2(mean));
                }
            }
            RecordLayout::Climate => {
                for mean in self.means() {
                    msg.reading(mean);
                }
                msg.field(self.samples);
            }
        }
        msg.finish()
    }
}

/// A record ready to broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct Flush {
    pub payload: Payload,
    pub record: u32,
    /// Time at which the boundary was observed
    pub timestamp: DateTime,
    /// The clock is due for a resync
    pub resync: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FlushDecision {
    Idle,
    Flush(Flush),
}

pub struct TelemetryBatcher {
    node_id: heapless::String<12>,
    tracker: BoundaryTracker,
    window: TelemetryWindow,
    record_number: u32,
    resync_every: u32,
}

impl TelemetryBatcher {
    pub fn new(
        node: &MacAddress,
        window: TelemetryWindow,
        log_interval_minutes: u8,
        resync_every: u32,
    ) -> Self {
        Self {
            node_id: node.node_id(),
            tracker: BoundaryTracker::new(log_interval_minutes),
            window,
            record_number: 1,
            resync_every: resync_every.max(1),
        }
    }

    pub fn window(&self) -> &TelemetryWindow {
        &self.window
    }

    pub fn window_mut(&mut self) -> &mut TelemetryWindow {
        &mut self.window
    }

    /// Number the next record will carry.
    pub fn record_number(&self) -> u32 {
        self.record_number
    }

    /// Advance with the current time. Flushes once armed with at least one
    /// sample in the window.
    ///
    /// A flush that is ready (armed with samples) stops boundary
    /// observation until it happens. An arm over an empty window keeps
    /// observing, so it lapses at the next boundary change.
    pub fn tick(&mut self, now: DateTime) -> Result<FlushDecision, MessageError> {
        let ready = self.tracker.is_armed() && self.window.samples() > 0;
        if !ready && self.tracker.observe(now) {
            debug!("Log boundary at {}", now);
        }

        let armed_at = match self.tracker.armed_at() {
            Some(at) if self.window.samples() > 0 => at,
            _ => return Ok(FlushDecision::Idle),
        };

        let record = self.record_number;
        let payload = self.window.record(record, armed_at, &self.node_id)?;
        info!("Record {} at {}: {} samples", record, armed_at, self.window.samples());

        self.window.reset();
        self.tracker.disarm();
        self.record_number += 1;

        Ok(FlushDecision::Flush(Flush {
            payload,
            record,
            timestamp: armed_at,
            resync: self.record_number % self.resync_every == 0,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampling::ScanResult;

    const NODE: MacAddress = MacAddress([0x48, 0x55, 0x19, 0xDF, 0x29, 0x86]);

    fn at(minute: u8, second: u8) -> DateTime {
        DateTime::new(2024, 6, 1, 10, minute, second).unwrap()
    }

    fn scan(values: &[(&str, f64)]) -> ScanResults {
        ScanResults(
            values
                .iter()
                .map(|(name, t)| ScanResult {
                    name: (*name).into(),
                    temperature: *t,
                    internal: if t.is_nan() { f64::NAN } else { 21.0 },
                    calibrated: *t,
                    count: u32::from(!t.is_nan()),
                    valid_reads: u32::from(!t.is_nan()),
                })
                .collect(),
        )
    }

    #[test]
    fn test_edge_triggered_arming() {
        let mut tracker = BoundaryTracker::new(5);
        let arms = [0, 0, 0, 1, 2, 3, 4, 0]
            .into_iter()
            .filter(|m| tracker.observe(at(*m, 0)))
            .count();
        assert_eq!(arms, 2);
    }

    #[test]
    fn test_unknown_start_arms_on_boundary() {
        let mut tracker = BoundaryTracker::new(3);
        assert!(!tracker.observe(at(4, 0)));
        assert!(!tracker.observe(at(5, 0)));
        assert!(tracker.observe(at(6, 0)));
        assert_eq!(tracker.armed_at(), Some(at(6, 0)));
    }

    #[test]
    fn test_window_skips_missing_channels() {
        let mut window = TelemetryWindow::thermocouple(["A", "B"]);
        window.add_scan(&scan(&[("A", 20.0), ("B", f64::NAN)]));
        window.add_scan(&scan(&[("A", 21.0), ("B", f64::NAN)]));
        assert_eq!(window.samples(), 2);
        let means = window.means();
        assert_eq!(means[0], 20.5);
        assert!(means[1].is_nan());
    }

    #[test]
    fn test_thermocouple_flush() {
        let window = TelemetryWindow::thermocouple(["A", "B"]);
        let mut batcher = TelemetryBatcher::new(&NODE, window, 3, 20);
        assert_eq!(batcher.tick(at(2, 0)), Ok(FlushDecision::Idle));
        batcher.window_mut().add_scan(&scan(&[("A", 20.0), ("B", 30.333)]));
        batcher.window_mut().add_scan(&scan(&[("A", 21.0), ("B", f64::NAN)]));
        let FlushDecision::Flush(flush) = batcher.tick(at(3, 0)).unwrap() else {
            panic!("expected a flush");
        };
        assert_eq!(
            core::str::from_utf8(&flush.payload).unwrap(),
            "TRC:1,2024-06-01 10:03:00,485519DF2986,20.5,30.33,21,21"
        );
        assert_eq!(flush.record, 1);
        assert!(!flush.resync);
        assert_eq!(batcher.record_number(), 2);
        assert_eq!(batcher.window().samples(), 0);

        batcher.window_mut().add_scan(&scan(&[("A", 20.0), ("B", 30.0)]));
        assert_eq!(batcher.tick(at(3, 5)), Ok(FlushDecision::Idle));
    }

    #[test]
    fn test_no_flush_without_samples() {
        let mut batcher = TelemetryBatcher::new(&NODE, TelemetryWindow::climate(), 15, 4);
        assert!(!matches!(batcher.tick(at(0, 0)), Ok(FlushDecision::Flush(_))));
        assert_eq!(batcher.tick(at(0, 10)), Ok(FlushDecision::Idle));
        batcher.window_mut().add_climate(&ClimateReading {
            temperature: 22.5,
            humidity: 50.0,
            pressure: 1000.0,
        });
        let FlushDecision::Flush(flush) = batcher.tick(at(0, 20)).unwrap() else {
            panic!("expected a flush");
        };
        assert_eq!(
            core::str::from_utf8(&flush.payload).unwrap(),
            "CLIMATE:1,2024-06-01 10:00:00,485519DF2986,22.5,50,1000,1"
        );
        // already flushed for this boundary
        assert_eq!(batcher.tick(at(0, 30)), Ok(FlushDecision::Idle));
        batcher.window_mut().add_climate(&ClimateReading {
            temperature: 22.5,
            humidity: 50.0,
            pressure: 1000.0,
        });
        assert_eq!(batcher.tick(at(1, 0)), Ok(FlushDecision::Idle));
    }

    #[test]
    fn test_empty_arm_lapses_at_next_minute() {
        let mut batcher = TelemetryBatcher::new(&NODE, TelemetryWindow::climate(), 15, 4);
        assert_eq!(batcher.tick(at(0, 0)), Ok(FlushDecision::Idle));
        assert_eq!(batcher.tick(at(1, 0)), Ok(FlushDecision::Idle));
        batcher.window_mut().add_climate(&ClimateReading {
            temperature: 22.5,
            humidity: 50.0,
            pressure: 1000.0,
        });
        assert_eq!(batcher.tick(at(1, 10)), Ok(FlushDecision::Idle));
        assert_eq!(batcher.window().samples(), 1);
    }

    #[test]
    fn test_resync_every_nth_record() {
        let mut batcher = TelemetryBatcher::new(&NODE, TelemetryWindow::climate(), 2, 4);
        let reading = ClimateReading {
            temperature: 20.0,
            humidity: 40.0,
            pressure: 990.0,
        };
        let mut resyncs = Vec::new();
        for minute in 0..16u8 {
            batcher.window_mut().add_climate(&reading);
            if let FlushDecision::Flush(flush) = batcher.tick(at(minute, 0)).unwrap() {
                resyncs.push((flush.record, flush.resync));
            }
        }
        assert_eq!(resyncs.len(), 8);
        // record 3 makes the counter 4, record 7 makes it 8
        let due: Vec<u32> = resyncs.iter().filter(|(_, r)| *r).map(|(n, _)| *n).collect();
        assert_eq!(due, [3, 7]);
    }
}
