//! Aggregator (data logger) side of the network.
//!
//! Every inbound frame is classified once: `GET_TIME` is answered
//! immediately with the local clock, tagged records are appended to a log
//! file named after their category, the receiving node and the sender, and
//! everything else is dropped without a trace.

use core::convert::Infallible;
use core::fmt::Write;

use embassy_time::Duration;
use log::{debug, error, info};
use thiserror_no_std::Error;

use crate::link::{LinkTransport, MacAddress, Message, Radio, Tag};
use crate::time::Clock;

/// Longest log file name, `CALIBRATE_<12 hex>_<12 hex>.log` plus slack.
pub const LOG_NAME_LEN: usize = 48;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LogError {
    #[error("log name does not fit 48 bytes")]
    NameTooLong,
    #[error("unable to append to {name}: {details}")]
    Append {
        name: heapless::String<LOG_NAME_LEN>,
        details: heapless::String<64>,
    },
}

/// Name of an append-only log file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogName(heapless::String<LOG_NAME_LEN>);

impl LogName {
    /// `<CATEGORY>_<local id>_<sender id>.log`
    pub fn category(tag: Tag, local: &MacAddress, sender: &MacAddress) -> Result<Self, LogError> {
        let mut name = heapless::String::new();
        write!(name, "{}_{}_{}.log", tag.category(), local.node_id(), sender.node_id())
            .map_err(|_| LogError::NameTooLong)?;
        Ok(Self(name))
    }

    /// `<local id>_sys.log`, the aggregator's own system log.
    pub fn system(local: &MacAddress) -> Result<Self, LogError> {
        let mut name = heapless::String::new();
        write!(name, "{}_sys.log", local.node_id()).map_err(|_| LogError::NameTooLong)?;
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for LogName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Append-only line storage (an SD card on the hardware).
pub trait LogSink {
    /// Append `line` and a newline to `name`, creating the file if needed.
    fn append_line(&mut self, name: &LogName, line: &str) -> Result<(), LogError>;
}

impl<S: LogSink + ?Sized> LogSink for &mut S {
    fn append_line(&mut self, name: &LogName, line: &str) -> Result<(), LogError> {
        (**self).append_line(name, line)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    TimeServed,
    Stored(Tag),
    Discarded,
}

pub struct Aggregator<R: Radio, C, S> {
    address: MacAddress,
    link: LinkTransport<R>,
    clock: C,
    sink: S,
}

impl<R, C, S> Aggregator<R, C, S>
where
    R: Radio,
    C: Clock,
    S: LogSink,
{
    pub fn new(address: MacAddress, link: LinkTransport<R>, clock: C, sink: S) -> Self {
        Self {
            address,
            link,
            clock,
            sink,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn link_mut(&mut self) -> &mut LinkTransport<R> {
        &mut self.link
    }

    /// Append a timestamped line to the system log.
    pub fn note(&mut self, text: &str) -> Result<(), LogError> {
        let name = LogName::system(&self.address)?;
        self.append(&name, text)
    }

    fn append(&mut self, name: &LogName, body: &str) -> Result<(), LogError> {
        let line = alloc::format!("{},{}", self.clock.now(), body);
        self.sink.append_line(name, &line).inspect_err(|e| {
            error!("Persisting to {} failed: {}", name, e);
        })
    }

    /// Route one received frame.
    pub async fn on_message(
        &mut self,
        sender: MacAddress,
        payload: &[u8],
    ) -> Result<RouteOutcome, LogError> {
        match Message::classify(payload) {
            Message::TimeRequest => {
                let wire = self.clock.now().to_wire();
                // Answer first: the requesting node is blocked on this reply.
                self.link.send(&sender, wire.as_bytes()).await;
                info!("Time {} sent to {}", wire, sender);
                self.note(&alloc::format!("{} requested time, sent {}", sender, wire))?;
                Ok(RouteOutcome::TimeServed)
            }
            Message::Tagged { tag, body } => {
                let name = LogName::category(tag, &self.address, &sender)?;
                debug!("{}: storing to {}", tag.category(), name);
                self.append(&name, body)?;
                Ok(RouteOutcome::Stored(tag))
            }
            Message::Unclassified => {
                debug!("Discarding {} byte frame from {}", payload.len(), sender);
                Ok(RouteOutcome::Discarded)
            }
        }
    }

    /// Listen forever. Returns only when persistence fails.
    pub async fn run(&mut self, listen_timeout: Duration) -> Result<Infallible, LogError> {
        self.note(&alloc::format!("{} data logger started", self.address))?;
        info!("Data logger {} listening", self.address);

        loop {
            let received = self.link.receive(listen_timeout).await;
            let (Some(sender), Some(payload)) = (received.sender, received.payload) else {
                debug!("Nothing received in {} ms", listen_timeout.as_millis());
                continue;
            };
            self.on_message(sender, &payload).await?;
        }
    }
}
