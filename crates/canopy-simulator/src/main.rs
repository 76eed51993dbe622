//! Desktop simulator for the canopy sensor network.
//!
//! Runs a data logger, a heating (TRC) node and a climate (THP) node on
//! their own threads, talking over a simulated radio. Time is accelerated
//! so records appear within seconds; the data logger writes its log files
//! to `--output-dir`.
//!
//! Each node is supervised the way the hardware watchdog does it: the node
//! loop ends on its first error, and the supervisor decodes the stored
//! configuration again and starts a fresh node.

mod air;
mod hardware;
mod storage;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::Parser;
use embassy_futures::block_on;
use log::{error, info, warn};

use canopy_core::aggregator::Aggregator;
use canopy_core::config::TREATMENT;
use canopy_core::link::PeerTable;
use canopy_core::node::{CalibrationStation, ClimateNode, NodeError, ThermocoupleNode};
use canopy_core::sensors::MuxedThermocouples;
use canopy_core::{LinkTransport, MacAddress, NodeConfig};

use air::Air;
use hardware::{BenchThermocouple, Plant, SimAmplifiers, SimClimate, SimClock, SimDelay, SimTime};
use storage::FileLogSink;

// ---------------------------------------------------------------------------
// Network
// ---------------------------------------------------------------------------

const DATA_LOGGER: MacAddress = MacAddress([0xC4, 0x5B, 0xBE, 0xE4, 0xFE, 0x08]);
const TRC_NODE: MacAddress = MacAddress([0x48, 0x55, 0x19, 0xDF, 0x29, 0x86]);
const THP_NODE: MacAddress = MacAddress([0x8C, 0xAA, 0xB5, 0x4D, 0x7F, 0x18]);
const BENCH: MacAddress = MacAddress([0x24, 0x0A, 0xC4, 0x00, 0x11, 0x22]);

/// Real time a supervisor waits before restarting a failed node.
const RESTART_DELAY: Duration = Duration::from_secs(1);

#[derive(Parser, Debug)]
#[command(name = "canopy-simulator", about = "Simulated canopy leaf-heating network")]
struct Args {
    /// Simulated seconds per real second
    #[arg(long, default_value_t = 60.0)]
    speed: f64,

    /// Real seconds to run before exiting
    #[arg(long, default_value_t = 60)]
    run_secs: u64,

    /// Directory the data logger writes its log files to
    #[arg(long, default_value = "canopy-logs")]
    output_dir: PathBuf,

    /// Select line (1-5) whose amplifier reports an open circuit
    #[arg(long)]
    faulty_channel: Option<u8>,

    /// Lose every n-th frame on the air
    #[arg(long)]
    drop_every: Option<u32>,

    /// Clock drift of the sensing nodes, parts per million
    #[arg(long, default_value_t = 200.0)]
    drift_ppm: f64,

    /// Also run a calibration of a bench thermocouple held at this
    /// reference temperature (°C)
    #[arg(long)]
    calibrate_reference: Option<f64>,
}

fn peers() -> PeerTable {
    PeerTable {
        data_loggers: vec![DATA_LOGGER],
        time: Some(DATA_LOGGER),
        calibrate: vec![DATA_LOGGER],
    }
}

// ---------------------------------------------------------------------------
// Supervision
// ---------------------------------------------------------------------------

/// Run `node` from the stored `blob` until the process exits, restarting
/// after every failure. A blob that no longer decodes ends supervision.
fn supervise<F>(label: &'static str, blob: Vec<u8>, mut node: F)
where
    F: FnMut(NodeConfig) -> NodeError + Send + 'static,
{
    let spawned = std::thread::Builder::new().name(label.into()).spawn(move || {
        let mut restarts = 0u32;
        loop {
            let config = match NodeConfig::from_bytes(&blob) {
                Ok(config) => config,
                Err(e) => {
                    error!("{}: stored configuration unusable: {}", label, e);
                    return;
                }
            };
            let err = node(config);
            restarts += 1;
            warn!("{}: node failed ({}), restart #{}", label, err, restarts);
            std::thread::sleep(RESTART_DELAY);
        }
    });
    if let Err(e) = spawned {
        error!("Unable to start {}: {}", label, e);
    }
}

fn start_data_logger(air: &Arc<Air>, time: SimTime, output_dir: PathBuf) {
    let config = NodeConfig::data_logger(DATA_LOGGER);
    let air = air.clone();
    let spawned = std::thread::Builder::new().name("data-logger".into()).spawn(move || {
        loop {
            let sink = match FileLogSink::new(&output_dir) {
                Ok(sink) => sink,
                Err(e) => {
                    error!("Cannot open {}: {}", output_dir.display(), e);
                    return;
                }
            };
            let link = LinkTransport::new(air.join(config.address), config.peers.clone());
            let mut aggregator = Aggregator::new(config.address, link, SimClock::wall(time), sink);
            if let Err(e) = block_on(aggregator.run(config.listen_timeout())) {
                warn!("Data logger stopped: {}; restarting", e);
            }
            std::thread::sleep(RESTART_DELAY);
        }
    });
    if let Err(e) = spawned {
        error!("Unable to start the data logger: {}", e);
    }
}

fn start_calibration(air: &Arc<Air>, time: SimTime, reference: f64) {
    let config = NodeConfig::calibrate(BENCH, peers());
    let radio = air.join(BENCH);
    let spawned = std::thread::Builder::new().name("calibrate".into()).spawn(move || {
        let bench = BenchThermocouple::new(reference, -0.4);
        let mut station = match CalibrationStation::new(config, radio, bench, SimDelay(time)) {
            Ok(station) => station,
            Err(e) => {
                error!("Calibration station rejected: {}", e);
                return;
            }
        };
        match block_on(station.calibrate(TREATMENT, reference)) {
            Ok((capture, sent)) => info!(
                "Calibration at {} °C: mean {:.3}, sent to {} peer(s)",
                reference, capture.stats.mean, sent
            ),
            Err(e) => error!("Calibration failed: {}", e),
        }
    });
    if let Err(e) = spawned {
        error!("Unable to start calibration: {}", e);
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

fn main() {
    env_logger::init();
    let args = Args::parse();

    info!("Starting canopy simulator at {}x", args.speed);
    let time = SimTime::new(args.speed);
    let air = Air::new(time, args.drop_every);

    let blobs = NodeConfig::trc(TRC_NODE, peers())
        .to_bytes()
        .and_then(|trc| Ok((trc, NodeConfig::thp(THP_NODE, peers()).to_bytes()?)));
    let (trc_blob, thp_blob) = match blobs {
        Ok(blobs) => blobs,
        Err(e) => {
            error!("Unable to encode node configuration: {}", e);
            std::process::exit(1);
        }
    };

    start_data_logger(&air, time, args.output_dir.clone());

    let plant = Plant::new(time);
    let trc_air = air.clone();
    let faulty = args.faulty_channel;
    let drift = args.drift_ppm;
    supervise("trc", trc_blob, move |config| {
        let radio = trc_air.join(config.address);
        let amplifiers = SimAmplifiers::new(plant.clone(), faulty);
        let lines = amplifiers.select_lines();
        let board =
            MuxedThermocouples::from_config(amplifiers, lines, SimDelay(time), &config.sampling);
        let node = ThermocoupleNode::new(
            config,
            radio,
            board,
            plant.relay(),
            SimClock::unset(time, drift),
            SimDelay(time),
        );
        match node {
            Ok(mut node) => block_on(node.run()),
            Err(e) => e,
        }
    });

    let thp_air = air.clone();
    supervise("thp", thp_blob, move |config| {
        let radio = thp_air.join(config.address);
        let node = ClimateNode::new(
            config,
            radio,
            SimClimate::new(time),
            SimClock::unset(time, -drift),
            SimDelay(time),
        );
        match node {
            Ok(mut node) => block_on(node.run()),
            Err(e) => e,
        }
    });

    if let Some(reference) = args.calibrate_reference {
        start_calibration(&air, time, reference);
    }

    let deadline = Instant::now() + Duration::from_secs(args.run_secs);
    while Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(250));
    }

    report(&args.output_dir);
    info!("Simulator exiting");
}

/// Log the files the data logger produced.
fn report(dir: &std::path::Path) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("No output in {}: {}", dir.display(), e);
            return;
        }
    };
    let mut files: Vec<_> = entries.filter_map(Result::ok).map(|e| e.path()).collect();
    files.sort();
    for path in files {
        let lines = std::fs::read_to_string(&path).map(|t| t.lines().count()).unwrap_or(0);
        info!("{}: {} lines", path.display(), lines);
    }
}
