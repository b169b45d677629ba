//! Session role.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Which side of the handshake created a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionRole {
    /// Accepted the connection on its listening socket.
    Host,
    /// Initiated the connection after discovering the lobby.
    Client,
}

impl SessionRole {
    pub fn is_host(self) -> bool {
        self == SessionRole::Host
    }
}

impl fmt::Display for SessionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionRole::Host => f.write_str("host"),
            SessionRole::Client => f.write_str("client"),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
