//! Clock correction from the network's time authority.
//!
//! A node sends `GET_TIME` to its configured TIME peer and waits for the RTC
//! tuple in reply. Until a usable reply arrives the request is repeated
//! after a fixed delay. This is the only exchange in the system that waits
//! for an answer.

use embedded_hal_async::delay::DelayNs;
use log::{debug, info, warn};
use thiserror_no_std::Error;

use crate::config::TimeSyncConfig;
use crate::link::{GET_TIME, LinkTransport, MacAddress, Radio};
use crate::time::{Clock, DateTime};

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeSyncError {
    #[error("no TIME peer configured")]
    NoAuthority,
    #[error("time authority did not answer after {attempts} attempts")]
    Exhausted { attempts: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    /// Clock reading just before the correction
    pub previous: DateTime,
    pub time: DateTime,
    pub attempts: u32,
}

impl SyncReport {
    /// Seconds the local clock was ahead of the authority.
    pub fn drift_secs(&self) -> i64 {
        self.previous.to_unix() - self.time.to_unix()
    }
}

pub struct TimeSync {
    authority: Option<MacAddress>,
    config: TimeSyncConfig,
}

impl TimeSync {
    pub fn new(authority: Option<MacAddress>, config: TimeSyncConfig) -> Self {
        Self { authority, config }
    }

    /// Request the time until the authority answers (or the attempt cap is
    /// reached), then apply it to `clock`.
    pub async fn synchronize<R, C, D>(
        &self,
        link: &mut LinkTransport<R>,
        clock: &mut C,
        delay: &mut D,
    ) -> Result<SyncReport, TimeSyncError>
    where
        R: Radio,
        C: Clock,
        D: DelayNs,
    {
        let authority = self.authority.ok_or(TimeSyncError::NoAuthority)?;
        let stale = link.discard_pending().await;
        if stale > 0 {
            debug!("Dropped {} stale frame(s) before requesting the time", stale);
        }
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            link.send(&authority, GET_TIME).await;

            let received = link.receive(self.config.reply_timeout()).await;
            match (received.sender, received.payload) {
                (Some(sender), Some(payload)) if sender == authority => {
                    match DateTime::parse_wire_bytes(&payload) {
                        Ok(time) => {
                            let previous = clock.now();
                            clock.set(time);
                            info!(
                                "Clock set to {} from {} after {} attempt(s), was {}",
                                time, authority, attempts, previous
                            );
                            return Ok(SyncReport {
                                previous,
                                time,
                                attempts,
                            });
                        }
                        Err(e) => warn!("Unusable time reply from {}: {}", authority, e),
                    }
                }
                (Some(sender), Some(_)) => {
                    debug!("Ignoring frame from {} while waiting for the time", sender);
                }
                _ => info!("No time reply from {} (attempt {})", authority, attempts),
            }

            if self.config.max_attempts.is_some_and(|max| attempts >= max) {
                return Err(TimeSyncError::Exhausted { attempts });
            }
            delay.delay_ms(self.config.retry_delay_ms).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::PeerTable;
    use crate::link::testing::FakeRadio;
    use embassy_futures::block_on;

    const AUTHORITY: MacAddress = MacAddress([0xC4, 0x5B, 0xBE, 0xE4, 0xFE, 0x08]);
    const STRANGER: MacAddress = MacAddress([0x8C, 0xAA, 0xB5, 0x4D, 0x7F, 0x18]);

    struct TestClock(DateTime);

    impl Clock for TestClock {
        fn now(&mut self) -> DateTime {
            self.0
        }

        fn set(&mut self, time: DateTime) {
            self.0 = time;
        }
    }

    #[derive(Default)]
    struct CountingDelay(u32);

    impl DelayNs for CountingDelay {
        async fn delay_ns(&mut self, _ns: u32) {}

        async fn delay_ms(&mut self, _ms: u32) {
            self.0 += 1;
        }
    }

    fn link(radio: FakeRadio) -> LinkTransport<FakeRadio> {
        LinkTransport::new(
            radio,
            PeerTable {
                data_loggers: vec![AUTHORITY],
                time: Some(AUTHORITY),
                calibrate: vec![],
            },
        )
    }

    fn sync(max_attempts: Option<u32>) -> TimeSync {
        TimeSync::new(
            Some(AUTHORITY),
            TimeSyncConfig {
                max_attempts,
                ..Default::default()
            },
        )
    }

    fn epoch() -> TestClock {
        TestClock(DateTime::new(2000, 1, 1, 0, 0, 0).unwrap())
    }

    #[test]
    fn test_reply_after_k_attempts() {
        let mut radio = FakeRadio::default();
        radio.queue_silence();
        radio.queue_silence();
        radio.queue_frame(AUTHORITY, b"(2024, 6, 1, 5, 12, 0, 30, 0)");
        let mut link = link(radio);
        let mut clock = epoch();
        let mut delay = CountingDelay::default();

        let report = block_on(sync(None).synchronize(&mut link, &mut clock, &mut delay)).unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(link.radio_mut().sent.len(), 3);
        assert!(link.radio_mut().sent.iter().all(|(mac, p)| *mac == AUTHORITY && p == b"GET_TIME"));
        assert_eq!(delay.0, 2);
        assert_eq!(clock.0.to_string(), "2024-06-01 12:00:30");
    }

    #[test]
    fn test_garbage_and_strangers_are_retried() {
        let mut radio = FakeRadio::default();
        radio.queue_frame(AUTHORITY, b"__import__('os')");
        radio.queue_frame(STRANGER, b"(2030, 1, 1, 1, 0, 0, 0, 0)");
        radio.queue_frame(AUTHORITY, b"(2024, 6, 1, 5, 12, 0, 30, 0)");
        let mut link = link(radio);
        let mut clock = epoch();

        let mut delay = CountingDelay::default();
        let report = block_on(sync(None).synchronize(&mut link, &mut clock, &mut delay)).unwrap();
        assert_eq!(report.attempts, 3);
        assert_eq!(clock.0.year, 2024);
    }

    #[test]
    fn test_late_reply_from_earlier_sync_is_ignored() {
        let mut radio = FakeRadio::default();
        radio.leave_waiting(AUTHORITY, b"(2024, 6, 1, 5, 9, 0, 0, 0)");
        radio.queue_frame(AUTHORITY, b"(2024, 6, 1, 5, 12, 0, 30, 0)");
        let mut link = link(radio);
        let mut clock = epoch();

        let mut delay = CountingDelay::default();
        let report = block_on(sync(None).synchronize(&mut link, &mut clock, &mut delay)).unwrap();
        assert_eq!(report.attempts, 1);
        assert_eq!(link.radio_mut().sent.len(), 1);
        assert_eq!(clock.0.to_string(), "2024-06-01 12:00:30");
    }

    #[test]
    fn test_attempt_cap() {
        let mut link = link(FakeRadio::default());
        let mut clock = epoch();
        let mut delay = CountingDelay::default();

        let err =
            block_on(sync(Some(4)).synchronize(&mut link, &mut clock, &mut delay)).unwrap_err();

        assert_eq!(err, TimeSyncError::Exhausted { attempts: 4 });
        assert_eq!(link.radio_mut().sent.len(), 4);
        assert_eq!(delay.0, 3);
        assert_eq!(clock.0.year, 2000);
    }

    #[test]
    fn test_no_authority() {
        let mut link = link(FakeRadio::default());
        let result = block_on(TimeSync::new(None, TimeSyncConfig::default()).synchronize(
            &mut link,
            &mut epoch(),
            &mut CountingDelay::default(),
        ));
        assert_eq!(result, Err(TimeSyncError::NoAuthority));
        assert!(link.radio_mut().sent.is_empty());
    }

    #[test]
    fn test_drift() {
        let report = SyncReport {
            previous: DateTime::new(2024, 1, 1, 0, 1, 0).unwrap(),
            time: DateTime::new(2024, 1, 1, 0, 0, 0).unwrap(),
            attempts: 1,
        };
        assert_eq!(report.drift_secs(), 60);
    }
}
