//! Wire protocol: the frame codec and the well-known ports and timings.

pub mod codec;

use std::time::Duration;

pub use codec::{decode_frame, decode_stream, encode, DecodedStream, FrameBuffer, FrameError};

/// UDP port on which lobbies are advertised.
pub const DEFAULT_DISCOVERY_PORT: u16 = 50000;

/// TCP port a host listens on when the caller does not pick one.
pub const DEFAULT_SESSION_PORT: u16 = 5555;

/// Time between two beacon broadcasts.
pub const DEFAULT_BEACON_INTERVAL: Duration = Duration::from_secs(1);

/// Age after which a silent advertiser is forgotten.
///
/// Three beacon intervals: one lost datagram does not evict a lobby.
pub const LOBBY_TIMEOUT: Duration = Duration::from_secs(3);

/// Largest discovery datagram we expect to receive.
pub const MAX_DATAGRAM_LEN: usize = 4096;
