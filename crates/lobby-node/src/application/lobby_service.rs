//! Use case: host, find and join a two-player LAN lobby.
//!
//! [`LobbyService`] is the single object an application drives.  It wires
//! together the three network adapters:
//!
//! ```text
//!   host side                          joiner side
//!   ─────────                          ───────────
//!   DiscoveryBeacon ── UDP bcast ──▶   LobbyRegistry   ─▶ get_lobbies()
//!   SessionListener ◀── TCP connect ── SessionChannel::connect  ◀─ join()
//!         │ try_accept (in update)
//!         ▼
//!   SessionChannel ◀──── records ────▶ SessionChannel
//! ```
//!
//! The caller invokes [`update`](LobbyService::update) once per tick.  It
//! drains discovery datagrams, evicts stale lobbies and, while hosting,
//! accepts the first pending connection.  Accepting flips the advertisement
//! to `in_game`, stops the beacon and drops the listener: a lobby holds
//! exactly two players.
//!
//! Failures never escape as errors from the per-tick surface; they are logged
//! and show up as `false`, `None` or `is_connected() == false`.  The
//! `try_*` variants expose the underlying error for callers that want it.

use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use lobby_core::{Advertisement, AdvertisementError, LobbyFilter};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::infrastructure::network::beacon::{BeaconError, DiscoveryBeacon};
use crate::infrastructure::network::registry::{LobbyRegistry, RegistryError};
use crate::infrastructure::network::session::{SessionChannel, SessionError, SessionListener};
use crate::infrastructure::storage::config::{ConfigError, NodeConfig};

/// Why a service operation did not happen.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("already hosting a lobby")]
    AlreadyHosting,
    #[error("a session is already connected")]
    AlreadyInSession,
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Advertisement(#[from] AdvertisementError),
    #[error(transparent)]
    Beacon(#[from] BeaconError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// One node of the lobby system.  May host, browse and join.
pub struct LobbyService {
    config: NodeConfig,
    host_id: Uuid,
    registry: Option<LobbyRegistry>,
    beacon: Option<DiscoveryBeacon>,
    listener: Option<SessionListener>,
    session: Option<SessionChannel>,
    /// Set once the loss of the current session has been reported.
    loss_reported: bool,
}

impl LobbyService {
    /// Creates an idle service.  No socket is opened until asked.
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            host_id: Uuid::new_v4(),
            registry: None,
            beacon: None,
            listener: None,
            session: None,
            loss_reported: false,
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Identifier placed in this node's advertisements.
    pub fn host_id(&self) -> Uuid {
        self.host_id
    }

    // ── Discovery ─────────────────────────────────────────────────────────────

    /// Starts listening for lobby advertisements.  Idempotent.
    ///
    /// The node's own beacon is hidden from [`get_lobbies`](Self::get_lobbies).
    ///
    /// # Errors
    ///
    /// [`ServiceError::Config`] for a bad bind address,
    /// [`ServiceError::Registry`] if the discovery port cannot be bound.
    pub fn start_discovery(&mut self) -> Result<(), ServiceError> {
        if self.registry.is_some() {
            return Ok(());
        }
        let addr = self.config.network.discovery_bind_addr()?;
        let mut registry = LobbyRegistry::bind_with_timeout(addr, self.config.timing.lobby_timeout())?;
        registry.ignore_host_id(self.host_id);
        self.registry = Some(registry);
        Ok(())
    }

    /// Local address of the discovery socket, once started.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.registry.as_ref().map(LobbyRegistry::local_addr)
    }

    /// Lobbies currently advertised on the LAN that match `filter`.
    ///
    /// Empty when discovery has not been started.
    pub fn get_lobbies(&self, filter: &LobbyFilter) -> Vec<(SocketAddr, Advertisement)> {
        self.registry
            .as_ref()
            .map(|registry| registry.list(filter))
            .unwrap_or_default()
    }

    // ── Hosting ───────────────────────────────────────────────────────────────

    /// Opens a lobby on TCP `port` (0 picks a free port) and starts
    /// advertising it with the given application fields.
    ///
    /// Returns `false` if already hosting or connected, or if any step
    /// fails; nothing stays half-acquired.  Must be called inside a Tokio
    /// runtime.
    pub fn host<I, K>(&mut self, port: u16, fields: I) -> bool
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        match self.try_host(port, fields) {
            Ok(addr) => {
                info!("hosting lobby on {addr}");
                true
            }
            Err(e) => {
                error!("failed to host lobby: {e}");
                false
            }
        }
    }

    /// Like [`host`](Self::host) but reports the bound session address or
    /// the reason for failure.
    ///
    /// # Errors
    ///
    /// [`ServiceError::AlreadyHosting`], [`ServiceError::AlreadyInSession`],
    /// or the error of the step that failed.
    pub fn try_host<I, K>(&mut self, port: u16, fields: I) -> Result<SocketAddr, ServiceError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        if self.listener.is_some() {
            return Err(ServiceError::AlreadyHosting);
        }
        if self.is_connected() {
            return Err(ServiceError::AlreadyInSession);
        }
        self.discard_session();

        let bind_addr = self.config.network.session_bind_addr(port)?;
        let target = self.config.network.broadcast_target()?;

        let mut advertisement = Advertisement::with_fields(0, fields)?;

        // Bound last so an invalid field or address leaves nothing open.
        let listener = SessionListener::bind(bind_addr)?;
        let local = listener.local_addr();

        // The real port and identity always win over caller fields.
        advertisement.port = local.port();
        advertisement.host_id = Some(self.host_id);

        let mut beacon = DiscoveryBeacon::new(target);
        beacon.start(advertisement, self.config.timing.beacon_interval())?;

        self.listener = Some(listener);
        self.beacon = Some(beacon);
        Ok(local)
    }

    /// Sets one field of the hosted advertisement.
    ///
    /// Returns `false` when not hosting or when the value is rejected.
    pub fn set_lobby_field(&self, key: &str, value: Value) -> bool {
        let Some(beacon) = &self.beacon else {
            return false;
        };
        match beacon.update_field(key, value) {
            Ok(()) => true,
            Err(e) => {
                warn!("lobby field not updated: {e}");
                false
            }
        }
    }

    /// Current advertisement of the lobby this node hosts or hosted.
    pub fn hosted_advertisement(&self) -> Option<Advertisement> {
        self.beacon.as_ref().map(DiscoveryBeacon::advertisement)
    }

    /// `true` while the beacon is still on the air.
    pub fn is_advertising(&self) -> bool {
        self.beacon.as_ref().is_some_and(DiscoveryBeacon::is_broadcasting)
    }

    // ── Joining ───────────────────────────────────────────────────────────────

    /// Connects to the lobby host at `ip:port`.
    ///
    /// Returns `false` if a session is already connected or the connection
    /// cannot be established within the configured timeout.  On success any
    /// lobby this node was hosting is closed.
    pub async fn join(&mut self, ip: IpAddr, port: u16) -> bool {
        match self.try_join(ip, port).await {
            Ok(()) => true,
            Err(e) => {
                error!("failed to join {ip}:{port}: {e}");
                false
            }
        }
    }

    /// Like [`join`](Self::join) but reports why it failed.
    ///
    /// # Errors
    ///
    /// [`ServiceError::AlreadyInSession`] or [`ServiceError::Session`].
    pub async fn try_join(&mut self, ip: IpAddr, port: u16) -> Result<(), ServiceError> {
        if self.is_connected() {
            return Err(ServiceError::AlreadyInSession);
        }

        let addr = SocketAddr::new(ip, port);
        let session = SessionChannel::connect(addr, self.config.timing.connect_timeout()).await?;

        self.stop_hosting();
        self.discard_session();
        self.session = Some(session);
        Ok(())
    }

    // ── Per-tick pump ─────────────────────────────────────────────────────────

    /// Runs one tick of housekeeping.  Returns immediately.
    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    fn update_at(&mut self, now: Instant) {
        if let Some(registry) = &mut self.registry {
            registry.poll();
            registry.evict_stale(now);
        }

        if self.session.is_none() {
            self.accept_pending();
        }

        if let Some(session) = &self.session {
            if !session.is_connected() && !self.loss_reported {
                warn!("session with {} is no longer connected", session.peer_addr());
                self.loss_reported = true;
            }
        }
    }

    /// Promotes the first pending connection to the session.
    fn accept_pending(&mut self) {
        let Some(listener) = &self.listener else {
            return;
        };

        let session = match listener.try_accept() {
            Ok(Some(session)) => session,
            Ok(None) => return,
            Err(e) => {
                warn!("accept failed: {e}");
                return;
            }
        };

        // Single peer: no further connection is ever accepted.
        self.listener = None;
        if let Some(beacon) = &mut self.beacon {
            beacon.modify(Advertisement::mark_in_game);
            beacon.stop();
        }

        info!("peer {} joined; lobby is now in game", session.peer_addr());
        self.loss_reported = false;
        self.session = Some(session);
    }

    // ── Session I/O ───────────────────────────────────────────────────────────

    /// Sends `record` to the peer.  Best effort; see [`SessionChannel::send`].
    pub fn send<T: Serialize + ?Sized>(&self, record: &T) -> bool {
        self.session.as_ref().is_some_and(|s| s.send(record))
    }

    /// Most recent record from the peer since the last call.
    pub fn receive(&self) -> Option<Value> {
        self.session.as_ref().and_then(SessionChannel::receive)
    }

    /// Typed variant of [`receive`](Self::receive).
    pub fn receive_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.session.as_ref().and_then(SessionChannel::receive_as::<T>)
    }

    pub fn is_connected(&self) -> bool {
        self.session.as_ref().is_some_and(SessionChannel::is_connected)
    }

    /// `true` while hosting, or when the session was accepted rather than
    /// joined.
    pub fn is_host(&self) -> bool {
        match &self.session {
            Some(session) => session.is_host(),
            None => self.listener.is_some(),
        }
    }

    /// Address of the peer, if a session exists.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.session.as_ref().map(SessionChannel::peer_addr)
    }

    // ── Teardown ──────────────────────────────────────────────────────────────

    /// Stops advertising, closes the listener and the session.  Discovery
    /// keeps running.
    pub fn stop(&mut self) {
        self.stop_hosting();
        self.discard_session();
        debug!("lobby service stopped");
    }

    fn stop_hosting(&mut self) {
        if let Some(mut beacon) = self.beacon.take() {
            beacon.stop();
        }
        self.listener = None;
    }

    fn discard_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close();
        }
        self.loss_reported = false;
    }
}

impl Drop for LobbyService {
    fn drop(&mut self) {
        self.stop();
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
