//! Sensing node loops.
//!
//! Each node is a single cooperative loop that owns all of its state. Any
//! error ends the loop (after the heater has been switched off); the
//! supervisor is expected to rebuild the node from a fresh configuration.

use core::convert::Infallible;
use core::fmt;

use alloc::vec::Vec;
use embedded_hal::digital::OutputPin;
use embedded_hal_async::delay::DelayNs;
use log::{error, info, warn};
use thiserror_no_std::Error;

use crate::calibration::{self, Capture, CalibrationError};
use crate::config::{ConfigError, HEAT, NodeConfig, REFERENCE, Role, TREATMENT};
use crate::heating::{HeatingController, HeatingDecision, Relay, RelayError};
use crate::link::message::MessageBuilder;
use crate::link::{LinkTransport, MessageError, PeerRole, Radio, Tag};
use crate::sampling::{Channel, Sampler, ScanResults};
use crate::sensors::{ChannelReader, ClimateReading, ClimateSensor, SensorError};
use crate::telemetry::{Flush, FlushDecision, TelemetryBatcher, TelemetryWindow};
use crate::time::Clock;
use crate::timesync::{SyncReport, TimeSync, TimeSyncError};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NodeError {
    #[error("configuration rejected: {0}")]
    Config(ConfigError),
    #[error("configuration is for a {found} node, not {expected}")]
    WrongRole {
        expected: &'static str,
        found: &'static str,
    },
    #[error("time sync failed: {0}")]
    TimeSync(TimeSyncError),
    #[error("relay failure: {0}")]
    Relay(RelayError),
    #[error("record could not be built: {0}")]
    Message(MessageError),
    #[error("sensor failure: {0}")]
    Sensor(SensorError),
    #[error("calibration failed: {0}")]
    Calibration(CalibrationError),
    #[error("no channel named {0}")]
    UnknownChannel(alloc::string::String),
}

impl From<ConfigError> for NodeError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<TimeSyncError> for NodeError {
    fn from(e: TimeSyncError) -> Self {
        Self::TimeSync(e)
    }
}

impl From<RelayError> for NodeError {
    fn from(e: RelayError) -> Self {
        Self::Relay(e)
    }
}

impl From<MessageError> for NodeError {
    fn from(e: MessageError) -> Self {
        Self::Message(e)
    }
}

impl From<SensorError> for NodeError {
    fn from(e: SensorError) -> Self {
        Self::Sensor(e)
    }
}

impl From<CalibrationError> for NodeError {
    fn from(e: CalibrationError) -> Self {
        Self::Calibration(e)
    }
}

fn expect_role(config: &NodeConfig, role: Role) -> Result<(), NodeError> {
    if config.role != role {
        return Err(NodeError::WrongRole {
            expected: role.name(),
            found: config.role.name(),
        });
    }
    config.validate()?;
    Ok(())
}

/// Send a `SYSLOG:` line to every data logger.
async fn announce<R: Radio>(
    link: &mut LinkTransport<R>,
    text: impl fmt::Display,
) -> Result<usize, NodeError> {
    let mut msg = MessageBuilder::new(Tag::Syslog);
    msg.field(text);
    let payload = msg.finish()?;
    Ok(link.send_to_role(PeerRole::DataLogger, &payload).await)
}

/// Broadcast a record, then resync the clock if it is due.
async fn deliver<R, C, D>(
    flush: &Flush,
    link: &mut LinkTransport<R>,
    time_sync: &TimeSync,
    clock: &mut C,
    delay: &mut D,
) -> Result<usize, NodeError>
where
    R: Radio,
    C: Clock,
    D: DelayNs,
{
    let delivered = link.send_to_role(PeerRole::DataLogger, &flush.payload).await;
    info!(
        "Record {} sent to {} of {} data loggers",
        flush.record,
        delivered,
        link.peers().data_loggers.len()
    );
    if flush.resync {
        let report = time_sync.synchronize(link, clock, delay).await?;
        info!("Clock resynced to {}, drift {} s", report.time, report.drift_secs());
    }
    Ok(delivered)
}

/// What one pass of a node loop did.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub scan: ScanResults,
    pub heating: Option<HeatingDecision>,
    /// Record number of a flushed record
    pub flushed: Option<u32>,
    pub delivered: usize,
}

/// Thermocouple array with the leaf heater.
pub struct ThermocoupleNode<R: Radio, T, P, C, D> {
    config: NodeConfig,
    link: LinkTransport<R>,
    reader: T,
    relay: Relay<P>,
    clock: C,
    delay: D,
    channels: Vec<Channel>,
    sampler: Sampler,
    controller: HeatingController,
    batcher: TelemetryBatcher,
    time_sync: TimeSync,
}

impl<R, T, P, C, D> ThermocoupleNode<R, T, P, C, D>
where
    R: Radio,
    T: ChannelReader,
    P: OutputPin,
    C: Clock,
    D: DelayNs,
{
    /// Build the node. The heater is switched off before anything else.
    pub fn new(
        config: NodeConfig,
        radio: R,
        reader: T,
        relay_pin: P,
        clock: C,
        delay: D,
    ) -> Result<Self, NodeError> {
        let relay = Relay::new(relay_pin)?;
        expect_role(&config, Role::Trc)?;

        let channels: Vec<Channel> = config.channels.iter().map(Channel::from_config).collect();
        let window = TelemetryWindow::thermocouple(channels.iter().map(|c| c.name.clone()));

        Ok(Self {
            link: LinkTransport::new(radio, config.peers.clone()),
            reader,
            relay,
            clock,
            delay,
            sampler: Sampler::new(config.sampling.reads_per_scan),
            controller: HeatingController::new(config.heating),
            batcher: TelemetryBatcher::new(
                &config.address,
                window,
                config.sampling.log_interval_minutes,
                config.time_sync.resync_every,
            ),
            time_sync: TimeSync::new(config.peers.time, config.time_sync),
            channels,
            config,
        })
    }

    pub fn link_mut(&mut self) -> &mut LinkTransport<R> {
        &mut self.link
    }

    pub fn relay(&self) -> &Relay<P> {
        &self.relay
    }

    pub fn clock_mut(&mut self) -> &mut C {
        &mut self.clock
    }

    pub fn batcher(&self) -> &TelemetryBatcher {
        &self.batcher
    }

    /// Announce the node and set the clock.
    pub async fn start(&mut self) -> Result<SyncReport, NodeError> {
        self.relay.force_off()?;
        info!("TRC node {} starting", self.config.address);
        let report = self
            .time_sync
            .synchronize(&mut self.link, &mut self.clock, &mut self.delay)
            .await?;
        announce(
            &mut self.link,
            format_args!("{} TRC started at {}", self.config.address, report.time),
        )
        .await?;
        Ok(report)
    }

    /// Scan, drive the heater, and flush a record if a boundary passed.
    pub async fn step(&mut self) -> Result<StepReport, NodeError> {
        let scan = self.sampler.scan(&mut self.reader, &mut self.channels).await;

        // Heating works on calibrated values, records keep the raw averages.
        let decision = self.controller.evaluate(
            scan.calibrated(TREATMENT),
            scan.calibrated(REFERENCE),
            scan.calibrated(HEAT),
        );
        self.relay.apply(decision.state)?;

        self.batcher.window_mut().add_scan(&scan);
        let now = self.clock.now();
        let mut report = StepReport {
            scan,
            heating: Some(decision),
            flushed: None,
            delivered: 0,
        };

        if let FlushDecision::Flush(flush) = self.batcher.tick(now)? {
            report.delivered = deliver(
                &flush,
                &mut self.link,
                &self.time_sync,
                &mut self.clock,
                &mut self.delay,
            )
            .await?;
            report.flushed = Some(flush.record);
        }
        Ok(report)
    }

    async fn serve(&mut self) -> Result<Infallible, NodeError> {
        self.start().await?;
        loop {
            self.step().await?;
            self.delay.delay_ms(self.config.sampling.sample_interval_ms).await;
        }
    }

    /// Run until the first error. The heater is off when this returns.
    pub async fn run(&mut self) -> NodeError {
        let err = match self.serve().await {
            Ok(never) => match never {},
            Err(e) => e,
        };
        error!("TRC node stopping: {}", err);
        if let Err(e) = self.relay.force_off() {
            error!("Unable to switch the heater off: {}", e);
        }
        err
    }
}

/// Aspirated temperature / humidity / pressure sensor.
pub struct ClimateNode<R: Radio, S, C, D> {
    config: NodeConfig,
    link: LinkTransport<R>,
    sensor: S,
    clock: C,
    delay: D,
    batcher: TelemetryBatcher,
    time_sync: TimeSync,
}

impl<R, S, C, D> ClimateNode<R, S, C, D>
where
    R: Radio,
    S: ClimateSensor,
    C: Clock,
    D: DelayNs,
{
    pub fn new(
        config: NodeConfig,
        radio: R,
        sensor: S,
        clock: C,
        delay: D,
    ) -> Result<Self, NodeError> {
        expect_role(&config, Role::Thp)?;
        Ok(Self {
            link: LinkTransport::new(radio, config.peers.clone()),
            sensor,
            clock,
            delay,
            batcher: TelemetryBatcher::new(
                &config.address,
                TelemetryWindow::climate(),
                config.sampling.log_interval_minutes,
                config.time_sync.resync_every,
            ),
            time_sync: TimeSync::new(config.peers.time, config.time_sync),
            config,
        })
    }

    pub fn link_mut(&mut self) -> &mut LinkTransport<R> {
        &mut self.link
    }

    pub fn batcher(&self) -> &TelemetryBatcher {
        &self.batcher
    }

    pub async fn start(&mut self) -> Result<SyncReport, NodeError> {
        info!("THP node {} starting", self.config.address);
        let report = self
            .time_sync
            .synchronize(&mut self.link, &mut self.clock, &mut self.delay)
            .await?;
        announce(
            &mut self.link,
            format_args!("{} THP started at {}", self.config.address, report.time),
        )
        .await?;
        Ok(report)
    }

    pub async fn step(&mut self) -> Result<(ClimateReading, Option<u32>), NodeError> {
        let reading = self.sensor.read().await?;
        self.batcher.window_mut().add_climate(&reading);

        let now = self.clock.now();
        let mut flushed = None;
        if let FlushDecision::Flush(flush) = self.batcher.tick(now)? {
            deliver(
                &flush,
                &mut self.link,
                &self.time_sync,
                &mut self.clock,
                &mut self.delay,
            )
            .await?;
            flushed = Some(flush.record);
        }
        Ok((reading, flushed))
    }

    async fn serve(&mut self) -> Result<Infallible, NodeError> {
        self.start().await?;
        loop {
            self.step().await?;
            self.delay.delay_ms(self.config.sampling.sample_interval_ms).await;
        }
    }

    pub async fn run(&mut self) -> NodeError {
        let err = match self.serve().await {
            Ok(never) => match never {},
            Err(e) => e,
        };
        error!("THP node stopping: {}", err);
        err
    }
}

/// Bench station that captures stable runs and sends them to the
/// CALIBRATE peers.
pub struct CalibrationStation<R: Radio, T, D> {
    config: NodeConfig,
    link: LinkTransport<R>,
    reader: T,
    delay: D,
}

impl<R, T, D> CalibrationStation<R, T, D>
where
    R: Radio,
    T: ChannelReader,
    D: DelayNs,
{
    pub fn new(config: NodeConfig, radio: R, reader: T, delay: D) -> Result<Self, NodeError> {
        expect_role(&config, Role::Calibrate)?;
        Ok(Self {
            link: LinkTransport::new(radio, config.peers.clone()),
            reader,
            delay,
            config,
        })
    }

    pub fn link_mut(&mut self) -> &mut LinkTransport<R> {
        &mut self.link
    }

    /// Capture `channel` held at `reference` °C and submit the run.
    /// Returns the capture and how many CALIBRATE peers accepted it.
    pub async fn calibrate(
        &mut self,
        channel: &str,
        reference: f64,
    ) -> Result<(Capture, usize), NodeError> {
        let channel = self
            .config
            .channel(channel)
            .ok_or_else(|| NodeError::UnknownChannel(channel.into()))?;
        let select = channel.select;
        let sensor_id = channel.sensor_id.clone().unwrap_or_else(|| channel.name.clone());

        let capture = calibration::capture(&mut self.reader, &mut self.delay, select).await?;
        info!(
            "{} at {}: mean {} std {} range {} cv {}",
            sensor_id,
            reference,
            capture.stats.mean,
            capture.stats.std_dev,
            capture.stats.range(),
            capture.stats.cv()
        );

        let payload = calibration::calibration_payload(
            &self.config.address,
            &sensor_id,
            select,
            reference,
            &capture.readings,
        )?;
        let sent = self.link.send_to_role(PeerRole::Calibrate, &payload).await;
        if sent == 0 {
            warn!("Calibration run for {} reached no CALIBRATE peer", sensor_id);
        }
        Ok((capture, sent))
    }
}
