//! UDP broadcast beacon advertising a hosted lobby.
//!
//! While a node is hosting and nobody has joined yet, the beacon sends the
//! current [`Advertisement`] as one datagram to the LAN broadcast address on
//! the discovery port, once per interval.  Every node running a
//! [`LobbyRegistry`](super::registry::LobbyRegistry) hears it.
//!
//! # Lifecycle
//!
//! ```text
//!   Idle ──start()──▶ Broadcasting ──stop()──▶ Stopped
//! ```
//!
//! The send loop runs as a Tokio task so [`DiscoveryBeacon::start`] returns
//! immediately.  [`DiscoveryBeacon::update_field`] edits the shared
//! advertisement in place; the loop takes a fresh snapshot on every tick, so
//! an edit is on the air at the next tick at the latest.
//!
//! An advertisement must encode to at most
//! [`MAX_DATAGRAM_LEN`](lobby_core::protocol::MAX_DATAGRAM_LEN) bytes.
//! `start` and `update_field` refuse anything larger.
//!
//! # Stopping
//!
//! `stop()` only clears the `running` flag.  The task observes it when its
//! next tick fires and exits without sending.

use std::net::{SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, MutexGuard, PoisonError,
};
use std::time::Duration;

use lobby_core::protocol::MAX_DATAGRAM_LEN;
use lobby_core::{encode, Advertisement, AdvertisementError};
use serde_json::Value;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Error type for beacon operations.
#[derive(Debug, Error)]
pub enum BeaconError {
    /// `start` was called while already broadcasting.
    #[error("beacon is already broadcasting")]
    AlreadyStarted,
    /// The send socket could not be created or configured.
    #[error("failed to set up beacon socket: {0}")]
    Io(#[from] std::io::Error),
    /// `start` was called outside a Tokio runtime.
    #[error("beacon must be started from within a Tokio runtime")]
    NoRuntime,
    /// The advertisement is invalid or too large for one datagram.
    #[error("advertisement rejected: {0}")]
    Advertisement(#[from] AdvertisementError),
    /// Interval must be non-zero.
    #[error("beacon interval must be greater than zero")]
    ZeroInterval,
}

/// Where the beacon is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconState {
    Idle,
    Broadcasting,
    Stopped,
}

/// Periodically broadcasts a lobby advertisement.
pub struct DiscoveryBeacon {
    target: SocketAddr,
    advertisement: Arc<Mutex<Advertisement>>,
    running: Arc<AtomicBool>,
    state: BeaconState,
    task: Option<JoinHandle<()>>,
}

impl DiscoveryBeacon {
    /// Creates an idle beacon that will send to `target`
    /// (normally `255.255.255.255:<discovery port>`).
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            advertisement: Arc::new(Mutex::new(Advertisement::new(0))),
            running: Arc::new(AtomicBool::new(false)),
            state: BeaconState::Idle,
            task: None,
        }
    }

    /// Starts broadcasting `advertisement` every `interval`.
    ///
    /// The first datagram goes out immediately.  A stopped beacon can be
    /// started again with a new advertisement.
    ///
    /// # Errors
    ///
    /// [`BeaconError::AlreadyStarted`] while broadcasting,
    /// [`BeaconError::Io`] if the socket cannot be bound or put in broadcast
    /// mode, [`BeaconError::NoRuntime`] outside Tokio,
    /// [`BeaconError::Advertisement`] if the advertisement does not fit one
    /// datagram.
    pub fn start(&mut self, advertisement: Advertisement, interval: Duration) -> Result<(), BeaconError> {
        if self.state == BeaconState::Broadcasting {
            return Err(BeaconError::AlreadyStarted);
        }
        if interval.is_zero() {
            return Err(BeaconError::ZeroInterval);
        }
        advertisement.check_datagram_size()?;
        let handle = tokio::runtime::Handle::try_current().map_err(|_| BeaconError::NoRuntime)?;

        let std_socket = StdUdpSocket::bind(("0.0.0.0", 0))?;
        std_socket.set_broadcast(true)?;
        std_socket.set_nonblocking(true)?;
        let socket = {
            let _guard = handle.enter();
            UdpSocket::from_std(std_socket)?
        };

        *lock(&self.advertisement) = advertisement;
        // Fresh flag: a task from a previous run may still be winding down.
        self.running = Arc::new(AtomicBool::new(true));

        let task = handle.spawn(broadcast_loop(
            socket,
            self.target,
            Arc::clone(&self.advertisement),
            Arc::clone(&self.running),
            interval,
        ));
        self.task = Some(task);
        self.state = BeaconState::Broadcasting;

        info!("beacon broadcasting to {} every {interval:?}", self.target);
        Ok(())
    }

    /// Sets one advertisement field.  Visible from the next tick on.
    ///
    /// # Errors
    ///
    /// Propagates [`AdvertisementError`] for invalid reserved values or
    /// non-scalar application fields, and [`AdvertisementError::Oversized`]
    /// if the change would not fit one datagram.  The advertisement is left
    /// unchanged on error.
    pub fn update_field(&self, key: &str, value: Value) -> Result<(), AdvertisementError> {
        let mut current = lock(&self.advertisement);
        let mut next = current.clone();
        next.set_field(key, value)?;
        next.check_datagram_size()?;
        *current = next;
        Ok(())
    }

    /// Applies `f` to the advertisement under the lock.
    pub fn modify<F: FnOnce(&mut Advertisement)>(&self, f: F) {
        f(&mut lock(&self.advertisement));
    }

    /// Snapshot of the advertisement as it will be sent on the next tick.
    pub fn advertisement(&self) -> Advertisement {
        lock(&self.advertisement).clone()
    }

    /// Halts broadcasting.  Idempotent.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if self.state == BeaconState::Broadcasting {
            info!("beacon to {} stopping", self.target);
            self.state = BeaconState::Stopped;
        }
    }

    pub fn state(&self) -> BeaconState {
        self.state
    }

    pub fn is_broadcasting(&self) -> bool {
        self.state == BeaconState::Broadcasting
    }

    /// `true` once the send task has exited (or was never started).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn target(&self) -> SocketAddr {
        self.target
    }
}

impl Drop for DiscoveryBeacon {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

/// Body of the beacon task.
async fn broadcast_loop(
    socket: UdpSocket,
    target: SocketAddr,
    advertisement: Arc<Mutex<Advertisement>>,
    running: Arc<AtomicBool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if !running.load(Ordering::Acquire) {
            break;
        }

        // One snapshot per tick; the lock is not held across the send.
        let snapshot = lock(&advertisement).clone();
        let bytes = match encode(&snapshot) {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode advertisement: {e}");
                continue;
            }
        };

        if bytes.len() > MAX_DATAGRAM_LEN {
            warn!("advertisement is {} bytes, not sent", bytes.len());
            continue;
        }

        match socket.send_to(&bytes, target).await {
            Ok(_) => trace!(
                "beacon sent {} bytes to {target} (status={}, players={})",
                bytes.len(),
                snapshot.status,
                snapshot.players
            ),
            Err(e) => warn!("beacon send to {target} failed: {e}"),
        }
    }

    debug!("beacon task for {target} exited");
}

fn lock(ad: &Mutex<Advertisement>) -> MutexGuard<'_, Advertisement> {
    ad.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
