//! Simulated radio medium.
//!
//! Every station that joins gets a bounded mailbox. A transmit drops the
//! frame into the destination's mailbox, or loses it when the air is
//! configured to drop frames. Nothing is acknowledged.

use std::cell::RefCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use canopy_core::link::{Inbound, MAX_PEERS, Payload, RadioError};
use canopy_core::{MacAddress, Radio};
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_time::Duration;
use log::debug;

use crate::hardware::SimTime;

/// Frames a station can have waiting before the sender sees it as busy.
const MAILBOX_DEPTH: usize = 16;

/// Real time between mailbox polls while waiting for a frame.
const POLL: std::time::Duration = std::time::Duration::from_millis(2);

type Mailbox = Channel<CriticalSectionRawMutex, Inbound, MAILBOX_DEPTH>;

pub struct Air {
    stations: Mutex<CriticalSectionRawMutex, RefCell<Vec<(MacAddress, Arc<Mailbox>)>>>,
    /// Lose every n-th transmitted frame
    drop_every: Option<u32>,
    transmitted: AtomicU32,
    time: SimTime,
}

impl Air {
    pub fn new(time: SimTime, drop_every: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            stations: Mutex::new(RefCell::new(Vec::new())),
            drop_every: drop_every.filter(|n| *n > 0),
            transmitted: AtomicU32::new(0),
            time,
        })
    }

    /// Attach a station. A restarted node keeps its mailbox.
    pub fn join(self: &Arc<Self>, address: MacAddress) -> SimRadio {
        let mailbox = self.stations.lock(|stations| {
            let mut stations = stations.borrow_mut();
            if let Some((_, mailbox)) = stations.iter().find(|(mac, _)| *mac == address) {
                return mailbox.clone();
            }
            let mailbox = Arc::new(Mailbox::new());
            stations.push((address, mailbox.clone()));
            mailbox
        });

        SimRadio {
            address,
            air: self.clone(),
            mailbox,
            peers: heapless::Vec::new(),
        }
    }

    fn mailbox_of(&self, address: &MacAddress) -> Option<Arc<Mailbox>> {
        self.stations.lock(|stations| {
            stations
                .borrow()
                .iter()
                .find(|(mac, _)| mac == address)
                .map(|(_, mailbox)| mailbox.clone())
        })
    }

    fn lose_next(&self) -> bool {
        let n = self.transmitted.fetch_add(1, Ordering::Relaxed) + 1;
        self.drop_every.is_some_and(|every| n % every == 0)
    }
}

/// One station's radio.
pub struct SimRadio {
    address: MacAddress,
    air: Arc<Air>,
    mailbox: Arc<Mailbox>,
    peers: heapless::Vec<MacAddress, MAX_PEERS>,
}

impl Radio for SimRadio {
    fn add_peer(&mut self, peer: &MacAddress) -> Result<(), RadioError> {
        if self.peers.contains(peer) {
            return Ok(());
        }
        self.peers.push(*peer).map_err(|_| RadioError::PeerTableFull)
    }

    async fn transmit(&mut self, peer: &MacAddress, payload: &[u8]) -> Result<(), RadioError> {
        if !self.peers.contains(peer) {
            return Err(RadioError::Driver(
                heapless::String::try_from("peer not registered").unwrap_or_default(),
            ));
        }
        let payload = Payload::from_slice(payload)
            .map_err(|_| RadioError::FrameTooLong(payload.len()))?;

        if self.air.lose_next() {
            debug!("Air lost a {} byte frame {} -> {}", payload.len(), self.address, peer);
            return Ok(());
        }
        let Some(mailbox) = self.air.mailbox_of(peer) else {
            // Nobody is listening on that address.
            return Ok(());
        };
        mailbox
            .try_send(Inbound {
                sender: self.address,
                payload,
            })
            .map_err(|_| RadioError::Timeout)
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Inbound>, RadioError> {
        let deadline = Instant::now() + self.air.time.real(timeout);
        loop {
            if let Ok(frame) = self.mailbox.try_receive() {
                return Ok(Some(frame));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(POLL);
        }
    }
}
