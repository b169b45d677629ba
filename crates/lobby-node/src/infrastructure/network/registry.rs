//! Passive lobby discovery.
//!
//! The registry binds a non-blocking UDP socket on the discovery port and
//! remembers the latest [`Advertisement`] heard from each source address.
//! It owns no thread: the application calls [`LobbyRegistry::poll`] and
//! [`LobbyRegistry::evict_stale`] once per tick and both return at once.
//!
//! # Staleness
//!
//! A host stops broadcasting when a peer joins, when it quits, or when its
//! process dies.  In every case the registry simply stops hearing from it.
//! An entry whose last datagram is older than the lobby timeout is hidden
//! from [`LobbyRegistry::list`] and removed by the next eviction pass.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

use lobby_core::{
    protocol::{decode_frame, LOBBY_TIMEOUT, MAX_DATAGRAM_LEN},
    Advertisement, LobbyFilter,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Receive errors tolerated in one `poll` before it gives up until the next.
const MAX_RECV_ERRORS_PER_POLL: usize = 16;

/// Error type for the discovery registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The UDP socket could not be bound.
    #[error("failed to bind discovery socket on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    /// The socket could not be configured.
    #[error("discovery socket error: {0}")]
    Io(#[from] io::Error),
}

/// The last advertisement heard from one address.
#[derive(Debug, Clone, PartialEq)]
pub struct LobbyEntry {
    pub advertisement: Advertisement,
    pub last_seen: Instant,
}

impl LobbyEntry {
    /// Time since the last datagram, as of `now`.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_seen)
    }
}

/// Table of currently advertised lobbies.
pub struct LobbyRegistry {
    socket: UdpSocket,
    local_addr: SocketAddr,
    entries: HashMap<SocketAddr, LobbyEntry>,
    timeout: Duration,
    ignored_host: Option<Uuid>,
    buf: Vec<u8>,
}

impl LobbyRegistry {
    /// Binds a non-blocking discovery socket on `addr` with the default
    /// [`LOBBY_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// [`RegistryError::BindFailed`] if the port is taken or not permitted.
    pub fn bind(addr: SocketAddr) -> Result<Self, RegistryError> {
        Self::bind_with_timeout(addr, LOBBY_TIMEOUT)
    }

    /// Like [`bind`](Self::bind) with a custom staleness timeout.
    ///
    /// # Errors
    ///
    /// See [`bind`](Self::bind).
    pub fn bind_with_timeout(addr: SocketAddr, timeout: Duration) -> Result<Self, RegistryError> {
        let socket = UdpSocket::bind(addr).map_err(|source| RegistryError::BindFailed { addr, source })?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        info!("lobby registry listening on UDP {local_addr}");

        Ok(Self {
            socket,
            local_addr,
            entries: HashMap::new(),
            timeout,
            ignored_host: None,
            buf: vec![0u8; MAX_DATAGRAM_LEN],
        })
    }

    /// Address the discovery socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Hides advertisements carrying this `host_id` (the node's own beacon).
    pub fn ignore_host_id(&mut self, id: Uuid) {
        self.ignored_host = Some(id);
        self.entries
            .retain(|_, e| e.advertisement.host_id != Some(id));
    }

    /// Drains every pending datagram without blocking.
    ///
    /// Returns how many advertisements were accepted.  Datagrams that do not
    /// decode as an advertisement are logged and dropped.  A receive error
    /// skips only the datagram it belongs to; after
    /// `MAX_RECV_ERRORS_PER_POLL` of them the rest waits for the next poll.
    pub fn poll(&mut self) -> usize {
        let mut accepted = 0;
        let mut errors = 0;

        loop {
            let (len, src) = match self.socket.recv_from(&mut self.buf) {
                Ok(pair) => pair,
                Err(e) if is_drained(&e) => break,
                Err(e) => {
                    // ICMP port-unreachable surfaces as ConnectionReset on some platforms.
                    if e.kind() == io::ErrorKind::ConnectionReset {
                        debug!("discovery recv: {e}");
                    } else {
                        warn!("discovery recv error: {e}");
                    }
                    errors += 1;
                    if errors >= MAX_RECV_ERRORS_PER_POLL {
                        warn!("{errors} discovery recv errors, deferring to next poll");
                        break;
                    }
                    continue;
                }
            };

            match decode_frame::<Advertisement>(&self.buf[..len]) {
                Ok(ad) => {
                    if self.observe(src, ad, Instant::now()) {
                        accepted += 1;
                    }
                }
                Err(e) => debug!("ignoring discovery datagram from {src}: {e}"),
            }
        }

        accepted
    }

    /// Records `advertisement` from `addr` as seen at `now`.
    ///
    /// Returns `false` if it was ignored as the node's own beacon.
    pub fn observe(&mut self, addr: SocketAddr, advertisement: Advertisement, now: Instant) -> bool {
        if self.ignored_host.is_some() && advertisement.host_id == self.ignored_host {
            return false;
        }

        let entry = LobbyEntry {
            advertisement,
            last_seen: now,
        };
        if self.entries.insert(addr, entry).is_none() {
            debug!("discovered lobby at {addr}");
        }
        true
    }

    /// Removes entries whose age exceeds the timeout and returns their addresses.
    pub fn evict_stale(&mut self, now: Instant) -> Vec<SocketAddr> {
        let timeout = self.timeout;
        let stale: Vec<SocketAddr> = self
            .entries
            .iter()
            .filter(|(_, e)| e.age(now) > timeout)
            .map(|(addr, _)| *addr)
            .collect();

        for addr in &stale {
            self.entries.remove(addr);
            debug!("lobby at {addr} went silent; evicted");
        }
        stale
    }

    /// Lobbies matching `filter` that are fresh right now, sorted by address.
    pub fn list(&self, filter: &LobbyFilter) -> Vec<(SocketAddr, Advertisement)> {
        self.list_at(filter, Instant::now())
    }

    /// Lobbies matching `filter` that are fresh as of `now`.
    ///
    /// Entries past the timeout are excluded even if not evicted yet.
    pub fn list_at(&self, filter: &LobbyFilter, now: Instant) -> Vec<(SocketAddr, Advertisement)> {
        let mut out: Vec<_> = self
            .entries
            .iter()
            .filter(|(_, e)| e.age(now) <= self.timeout && e.advertisement.matches(filter))
            .map(|(addr, e)| (*addr, e.advertisement.clone()))
            .collect();
        out.sort_by_key(|(addr, _)| *addr);
        out
    }

    pub fn entry(&self, addr: &SocketAddr) -> Option<&LobbyEntry> {
        self.entries.get(addr)
    }

    /// Number of tracked entries, stale ones included until evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `true` when the socket has no more datagrams queued.
fn is_drained(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use lobby_core::{encode, LobbyStatus};
    use serde_json::json;

    fn registry() -> LobbyRegistry {
        LobbyRegistry::bind("127.0.0.1:0".parse().unwrap()).expect("bind")
    }

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_bind_reports_local_addr() {
        let reg = registry();
        assert_ne!(reg.local_addr().port(), 0);
        assert_eq!(reg.timeout(), LOBBY_TIMEOUT);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_bind_fails_when_port_taken() {
        // Arrange
        let taken = UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken_addr = taken.local_addr().unwrap();

        // Act
        let result = LobbyRegistry::bind(taken_addr);

        // Assert
        assert!(matches!(result, Err(RegistryError::BindFailed { .. })));
    }

    #[test]
    fn test_poll_on_empty_socket_returns_zero_immediately() {
        let mut reg = registry();
        let started = Instant::now();

        assert_eq!(reg.poll(), 0);
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn test_poll_drains_all_pending_datagrams() {
        // Arrange: two senders, one of them sends twice
        let mut reg = registry();
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").unwrap();
        a.send_to(&encode(&Advertisement::new(1000)).unwrap(), reg.local_addr()).unwrap();
        b.send_to(&encode(&Advertisement::new(2000)).unwrap(), reg.local_addr()).unwrap();
        let mut updated = Advertisement::new(1000);
        updated.players = 2;
        a.send_to(&encode(&updated).unwrap(), reg.local_addr()).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        // Act
        let accepted = reg.poll();

        // Assert
        assert_eq!(accepted, 3);
        assert_eq!(reg.len(), 2, "keyed by source address");
        let a_entry = reg.entry(&a.local_addr().unwrap()).unwrap();
        assert_eq!(a_entry.advertisement.players, 2, "latest datagram wins");
    }

    #[test]
    fn test_only_would_block_ends_a_poll() {
        assert!(is_drained(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_drained(&io::Error::from(io::ErrorKind::ConnectionReset)));
        assert!(!is_drained(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_drained(&io::Error::new(io::ErrorKind::Other, "transient")));
    }

    #[test]
    fn test_single_poll_drains_a_burst_mixed_with_garbage() {
        // Arrange: 50 lobbies from distinct sockets, garbage between each
        let mut reg = registry();
        let noise = UdpSocket::bind("127.0.0.1:0").unwrap();
        let senders: Vec<UdpSocket> = (0..50)
            .map(|_| UdpSocket::bind("127.0.0.1:0").unwrap())
            .collect();
        for (i, sender) in senders.iter().enumerate() {
            let ad = Advertisement::new(6000 + i as u16);
            sender.send_to(&encode(&ad).unwrap(), reg.local_addr()).unwrap();
            noise.send_to(b"{broken\n", reg.local_addr()).unwrap();
        }
        std::thread::sleep(Duration::from_millis(100));

        // Act
        let accepted = reg.poll();

        // Assert
        assert_eq!(accepted, 50);
        assert_eq!(reg.len(), 50);
        assert_eq!(reg.poll(), 0, "nothing left for the next tick");
    }

    #[test]
    fn test_poll_drops_garbage_datagrams() {
        let mut reg = registry();
        let s = UdpSocket::bind("127.0.0.1:0").unwrap();
        s.send_to(b"definitely not json\n", reg.local_addr()).unwrap();
        s.send_to(b"{\"players\":1}\n", reg.local_addr()).unwrap();
        std::thread::sleep(Duration::from_millis(50));

        assert_eq!(reg.poll(), 0);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_entry_visible_until_timeout_then_evicted() {
        // Arrange
        let mut reg = registry();
        let t0 = Instant::now();
        let host = addr("192.168.1.20:40000");
        reg.observe(host, Advertisement::new(5555), t0);
        let all = LobbyFilter::new();

        // Act / Assert: exactly at the timeout it is still visible
        let at_timeout = t0 + LOBBY_TIMEOUT;
        assert_eq!(reg.list_at(&all, at_timeout).len(), 1);
        assert!(reg.evict_stale(at_timeout).is_empty());

        // Just past it: hidden, then evicted
        let past = at_timeout + Duration::from_millis(1);
        assert!(reg.list_at(&all, past).is_empty());
        assert_eq!(reg.evict_stale(past), vec![host]);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_refresh_resets_age() {
        let mut reg = registry();
        let t0 = Instant::now();
        let host = addr("10.0.0.2:40000");
        reg.observe(host, Advertisement::new(5555), t0);

        let t1 = t0 + Duration::from_secs(2);
        reg.observe(host, Advertisement::new(5555), t1);

        let t2 = t0 + Duration::from_secs(4);
        assert!(reg.evict_stale(t2).is_empty());
        assert_eq!(reg.list_at(&LobbyFilter::new(), t2).len(), 1);
    }

    #[test]
    fn test_list_applies_filter_and_sorts_by_address() {
        // Arrange
        let mut reg = registry();
        let now = Instant::now();
        let mut in_game = Advertisement::new(3000);
        in_game.status = LobbyStatus::InGame;
        let mut dunes = Advertisement::new(2000);
        dunes.set_field("map", json!("dunes")).unwrap();
        reg.observe(addr("10.0.0.3:1"), in_game, now);
        reg.observe(addr("10.0.0.2:1"), dunes, now);
        reg.observe(addr("10.0.0.1:1"), Advertisement::new(1000), now);

        // Act
        let open = reg.list_at(&LobbyFilter::new().with("status", "open"), now);
        let on_dunes = reg.list_at(&LobbyFilter::new().with("map", "dunes"), now);
        let all = reg.list_at(&LobbyFilter::new(), now);

        // Assert
        let ports: Vec<u16> = open.iter().map(|(_, ad)| ad.port).collect();
        assert_eq!(ports, vec![1000, 2000]);
        assert_eq!(on_dunes.len(), 1);
        assert_eq!(on_dunes[0].0, addr("10.0.0.2:1"));
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_ignore_host_id_hides_own_beacon() {
        // Arrange
        let mut reg = registry();
        let me = Uuid::new_v4();
        let mut own = Advertisement::new(5555);
        own.host_id = Some(me);
        let now = Instant::now();
        reg.observe(addr("127.0.0.1:50001"), own.clone(), now);

        // Act
        reg.ignore_host_id(me);
        let accepted = reg.observe(addr("127.0.0.1:50001"), own, now);

        // Assert
        assert!(!accepted);
        assert!(reg.is_empty(), "existing entry is purged too");
    }

    #[test]
    fn test_lobby_entry_age_saturates() {
        let now = Instant::now();
        let entry = LobbyEntry {
            advertisement: Advertisement::new(1),
            last_seen: now + Duration::from_secs(1),
        };
        assert_eq!(entry.age(now), Duration::ZERO);
    }
}
