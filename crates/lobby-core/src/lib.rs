//! # lobby-core
//!
//! Shared library for LAN lobby discovery containing the frame codec and the
//! domain types exchanged between nodes.
//!
//! It has no dependencies on sockets or an async runtime; `lobby-node` builds
//! the beacon, the discovery registry and the session channel on top of it.
//!
//! # Architecture overview
//!
//! A *host* advertises a joinable lobby by broadcasting an [`Advertisement`]
//! over UDP once per second.  Every other node keeps a registry of the
//! advertisements it hears and forgets lobbies that go quiet.  When a player
//! picks a lobby, its node opens a TCP connection to the advertised port and
//! both sides exchange application records over it.
//!
//! - **`protocol`** – How records become bytes: one JSON document per line,
//!   used for both UDP advertisements and the TCP session stream.  Also holds
//!   the well-known ports and timings.
//!
//! - **`domain`** – The [`Advertisement`] with its reserved `port` / `players`
//!   / `status` fields, the [`LobbyFilter`] used to query lobbies, and the
//!   [`SessionRole`] of a connection.

pub mod domain;
pub mod protocol;

pub use domain::{Advertisement, AdvertisementError, LobbyFilter, LobbyStatus, SessionRole};
pub use protocol::codec::{decode_stream, encode, FrameBuffer, FrameError};
