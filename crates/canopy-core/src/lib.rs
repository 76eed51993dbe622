//! Hardware-independent core library for canopy
//!
//! This crate contains all platform-agnostic logic for the canopy leaf-heating
//! sensor network: multiplexed thermocouple sampling, calibration, the heating
//! relay controller, minute-aligned telemetry windows, the best-effort radio
//! link with its time-sync exchange, and the aggregator's message router.
//!
//! Hardware is reached only through capability traits (`ChannelReader`,
//! `ClimateSensor`, `Clock`, `Radio`, `LogSink`) and the `embedded-hal`
//! pin/delay traits, so the same code runs on the nodes and on desktop hosts
//! (for the simulator and tests).
//!
//! It is `#![no_std]` with `extern crate alloc`.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod aggregator;
pub mod calibration;
pub mod config;
pub mod heating;
pub mod link;
pub mod node;
pub mod sampling;
pub mod sensors;
pub mod telemetry;
pub mod time;
pub mod timesync;

pub use config::{NodeConfig, Role};
pub use link::{LinkTransport, MacAddress, Radio};
pub use time::{Clock, DateTime};
