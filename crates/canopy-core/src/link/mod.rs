//! Best-effort radio link between nodes and the aggregator.
//!
//! The radio is a connectionless, lossy, short-range link with fixed
//! six-byte hardware addresses. [`LinkTransport`] wraps a [`Radio`] driver
//! with the delivery policy every node uses: one transmit attempt, no
//! acknowledgement, and errors that are logged rather than returned.

pub mod message;

use core::fmt;
use core::future::Future;

use embassy_time::Duration;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror_no_std::Error;

pub use message::{GET_TIME, Message, MessageError, Tag};

/// Hard per-frame ceiling of the radio.
pub const MAX_FRAME_LEN: usize = 250;

/// Peers the radio driver can hold at once.
pub const MAX_PEERS: usize = 20;

/// Most frames [`LinkTransport::discard_pending`] drops in one call.
const MAX_PENDING_DISCARD: usize = 32;

/// One frame's worth of payload bytes.
pub type Payload = heapless::Vec<u8, MAX_FRAME_LEN>;

/// Fixed-length link-layer address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Uppercase hex without separators, used as the node id in records
    /// and log file names (`C45BBEE4FE08`).
    pub fn node_id(&self) -> heapless::String<12> {
        let mut out = heapless::String::new();
        for b in self.0 {
            let _ = core::fmt::Write::write_fmt(&mut out, format_args!("{b:02X}"));
        }
        out
    }
}

/// Uppercase colon separated hex (`C4:5B:BE:E4:FE:08`).
impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

/// What a configured peer is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeerRole {
    /// Receives telemetry records.
    DataLogger,
    /// Answers `GET_TIME`.
    Time,
    /// Stores calibration runs.
    Calibrate,
}

/// Configured peers, keyed by role. Read-only once the node is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerTable {
    pub data_loggers: alloc::vec::Vec<MacAddress>,
    pub time: Option<MacAddress>,
    pub calibrate: alloc::vec::Vec<MacAddress>,
}

impl PeerTable {
    pub fn by_role(&self, role: PeerRole) -> &[MacAddress] {
        match role {
            PeerRole::DataLogger => &self.data_loggers,
            PeerRole::Time => self.time.as_slice(),
            PeerRole::Calibrate => &self.calibrate,
        }
    }

    /// Every configured address, deduplicated, in declaration order.
    pub fn all(&self) -> heapless::Vec<MacAddress, MAX_PEERS> {
        let mut out = heapless::Vec::new();
        let candidates = self
            .data_loggers
            .iter()
            .chain(self.time.iter())
            .chain(self.calibrate.iter());
        for mac in candidates {
            if !out.contains(mac) && out.push(*mac).is_err() {
                break;
            }
        }
        out
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RadioError {
    #[error("link-level timeout")]
    Timeout,
    #[error("peer table full")]
    PeerTableFull,
    #[error("frame of {0} bytes exceeds the radio ceiling")]
    FrameTooLong(usize),
    #[error("radio driver failure: {0}")]
    Driver(heapless::String<64>),
}

/// One received frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Inbound {
    pub sender: MacAddress,
    pub payload: Payload,
}

/// Radio driver capability.
///
/// Implementations wrap the hardware (or a simulated medium). The driver
/// needs every destination registered before it will transmit to it.
pub trait Radio {
    /// Register a destination with the driver.
    fn add_peer(&mut self, peer: &MacAddress) -> Result<(), RadioError>;

    /// Transmit one frame to `peer`.
    fn transmit(
        &mut self,
        peer: &MacAddress,
        payload: &[u8],
    ) -> impl Future<Output = Result<(), RadioError>>;

    /// Wait up to `timeout` for one frame. `Ok(None)` means nothing arrived.
    fn receive(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<Inbound>, RadioError>>;
}

/// Result of a best-effort send, for callers that want to count outcomes.
/// Ignoring it is always correct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// Link-level timeout; the radio was busy. Not retried.
    Busy,
    Failed,
}

/// Result of a timed receive. `payload` is `None` on timeout or error.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Received {
    pub sender: Option<MacAddress>,
    pub payload: Option<Payload>,
}

/// Best-effort transport over a [`Radio`].
pub struct LinkTransport<R: Radio> {
    radio: R,
    peers: PeerTable,
    registered: heapless::Vec<MacAddress, MAX_PEERS>,
}

impl<R: Radio> LinkTransport<R> {
    /// Wrap a radio and register every configured peer with it.
    pub fn new(radio: R, peers: PeerTable) -> Self {
        let mut link = Self {
            radio,
            peers,
            registered: heapless::Vec::new(),
        };
        for mac in link.peers.all() {
            link.ensure_registered(&mac);
        }
        link
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    fn ensure_registered(&mut self, peer: &MacAddress) -> bool {
        if self.registered.contains(peer) {
            return true;
        }
        match self.radio.add_peer(peer) {
            Ok(()) => {
                // Driver accepted it, so the local mirror has room too.
                let _ = self.registered.push(*peer);
                true
            }
            Err(e) => {
                warn!("Unable to register peer {}: {}", peer, e);
                false
            }
        }
    }

    /// Send one frame, once. Never fails the caller.
    pub async fn send(&mut self, peer: &MacAddress, payload: &[u8]) -> SendOutcome {
        if payload.len() > MAX_FRAME_LEN {
            warn!(
                "Dropping {} byte frame to {}: exceeds {} byte ceiling",
                payload.len(),
                peer,
                MAX_FRAME_LEN
            );
            return SendOutcome::Failed;
        }
        if !self.ensure_registered(peer) {
            return SendOutcome::Failed;
        }

        match self.radio.transmit(peer, payload).await {
            Ok(()) => {
                debug!("Sent {} bytes to {}", payload.len(), peer);
                SendOutcome::Sent
            }
            Err(RadioError::Timeout) => {
                info!("Send to {} timed out, radio busy", peer);
                SendOutcome::Busy
            }
            Err(e) => {
                warn!("Send to {} failed: {}", peer, e);
                SendOutcome::Failed
            }
        }
    }

    /// Send the same frame to every peer configured for `role`.
    /// Returns how many transmissions succeeded.
    pub async fn send_to_role(&mut self, role: PeerRole, payload: &[u8]) -> usize {
        let targets: heapless::Vec<MacAddress, MAX_PEERS> =
            self.peers.by_role(role).iter().take(MAX_PEERS).copied().collect();

        let mut sent = 0;
        for peer in targets.iter() {
            if self.send(peer, payload).await == SendOutcome::Sent {
                sent += 1;
            }
        }
        sent
    }

    /// Drop every frame that has already arrived, without waiting.
    /// Returns how many were dropped.
    pub async fn discard_pending(&mut self) -> usize {
        let mut dropped = 0;
        // A flooding sender can keep the inbox non-empty forever.
        while dropped < MAX_PENDING_DISCARD {
            let received = self.receive(Duration::from_ticks(0)).await;
            let (Some(sender), Some(_)) = (received.sender, received.payload) else {
                break;
            };
            debug!("Discarding stale frame from {}", sender);
            dropped += 1;
        }
        dropped
    }

    /// Wait up to `timeout` for one frame. Never fails the caller.
    pub async fn receive(&mut self, timeout: Duration) -> Received {
        match self.radio.receive(timeout).await {
            Ok(Some(frame)) => Received {
                sender: Some(frame.sender),
                payload: Some(frame.payload),
            },
            Ok(None) | Err(RadioError::Timeout) => Received::default(),
            Err(e) => {
                warn!("Receive failed: {}", e);
                Received::default()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeRadio;
    use super::*;
    use embassy_futures::block_on;

    const LOGGER_A: MacAddress = MacAddress([0xC4, 0x5B, 0xBE, 0xE4, 0xFE, 0x08]);
    const LOGGER_B: MacAddress = MacAddress([0x8C, 0xAA, 0xB5, 0x4D, 0x7F, 0x18]);

    fn peers() -> PeerTable {
        PeerTable {
            data_loggers: vec![LOGGER_A, LOGGER_B],
            time: Some(LOGGER_A),
            calibrate: vec![],
        }
    }

    #[test]
    fn test_mac_rendering() {
        assert_eq!(LOGGER_A.to_string(), "C4:5B:BE:E4:FE:08");
        assert_eq!(LOGGER_A.node_id().as_str(), "C45BBEE4FE08");
    }

    #[test]
    fn test_new_registers_each_peer_once() {
        let link = LinkTransport::new(FakeRadio::default(), peers());
        assert_eq!(link.radio.registered, vec![LOGGER_A, LOGGER_B]);
    }

    #[test]
    fn test_send_swallows_errors() {
        let mut radio = FakeRadio::default();
        radio.transmit_results.push_back(Err(RadioError::Timeout));
        radio.transmit_results.push_back(Err(RadioError::Driver(Default::default())));
        let mut link = LinkTransport::new(radio, peers());

        assert_eq!(block_on(link.send(&LOGGER_A, b"x")), SendOutcome::Busy);
        assert_eq!(block_on(link.send(&LOGGER_A, b"x")), SendOutcome::Failed);
        assert_eq!(block_on(link.send(&LOGGER_A, b"x")), SendOutcome::Sent);
        // one attempt each, no retries
        assert_eq!(link.radio.sent.len(), 3);
    }

    #[test]
    fn test_send_registers_unknown_peer() {
        let stranger = MacAddress([1, 2, 3, 4, 5, 6]);
        let mut link = LinkTransport::new(FakeRadio::default(), peers());
        assert_eq!(block_on(link.send(&stranger, b"hi")), SendOutcome::Sent);
        assert!(link.radio.registered.contains(&stranger));
    }

    #[test]
    fn test_send_rejects_oversized_frame() {
        let mut link = LinkTransport::new(FakeRadio::default(), peers());
        let big = [b'a'; MAX_FRAME_LEN + 1];
        assert_eq!(block_on(link.send(&LOGGER_A, &big)), SendOutcome::Failed);
        assert!(link.radio.sent.is_empty());
    }

    #[test]
    fn test_send_to_role_reaches_every_logger() {
        let mut link = LinkTransport::new(FakeRadio::default(), peers());
        let sent = block_on(link.send_to_role(PeerRole::DataLogger, b"TRC:1"));
        assert_eq!(sent, 2);
        let targets: Vec<_> = link.radio.sent.iter().map(|(mac, _)| *mac).collect();
        assert_eq!(targets, vec![LOGGER_A, LOGGER_B]);
    }

    #[test]
    fn test_discard_pending_leaves_future_frames() {
        let mut radio = FakeRadio::default();
        radio.leave_waiting(LOGGER_A, b"(2020, 1, 1, 2, 0, 0, 0, 0)");
        radio.leave_waiting(LOGGER_B, b"TRC:1");
        radio.queue_frame(LOGGER_A, b"fresh");
        let mut link = LinkTransport::new(radio, peers());

        assert_eq!(block_on(link.discard_pending()), 2);
        assert_eq!(block_on(link.discard_pending()), 0);
        let got = block_on(link.receive(Duration::from_millis(10)));
        assert_eq!(got.payload.as_deref(), Some(&b"fresh"[..]));
    }

    #[test]
    fn test_receive_never_raises() {
        let mut radio = FakeRadio::default();
        radio.inbox.push_back(Err(RadioError::Driver(Default::default())));
        radio.queue_silence();
        radio.queue_frame(LOGGER_B, b"GET_TIME");
        let mut link = LinkTransport::new(radio, peers());

        assert_eq!(block_on(link.receive(Duration::from_millis(10))), Received::default());
        assert_eq!(block_on(link.receive(Duration::from_millis(10))), Received::default());
        let got = block_on(link.receive(Duration::from_millis(10)));
        assert_eq!(got.sender, Some(LOGGER_B));
        assert_eq!(got.payload.as_deref(), Some(&b"GET_TIME"[..]));
    }
}
