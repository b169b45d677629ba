//! Lobby advertisement entity.
//!
//! An [`Advertisement`] is what a host broadcasts once per beacon interval.
//! It carries three reserved fields every lobby has (`port`, `players`,
//! `status`), an optional `host_id` naming the hosting process, and any number
//! of application-defined scalar fields (`name`, `map`, `max_players`, ...).
//!
//! On the wire all of them sit side by side in one flat JSON object:
//!
//! ```text
//! {"port":5555,"players":1,"status":"open","name":"Friday night","map":"dunes"}
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::protocol::{encode, MAX_DATAGRAM_LEN};

/// Field names with a fixed meaning; never stored in the application map.
pub const RESERVED_FIELDS: [&str; 4] = ["port", "players", "status", "host_id"];

/// Whether a lobby can still be joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LobbyStatus {
    /// Waiting for a second player.
    Open,
    /// A peer has connected; the lobby is full.
    InGame,
}

impl LobbyStatus {
    /// The wire spelling, e.g. `"in_game"`.
    pub fn as_str(self) -> &'static str {
        match self {
            LobbyStatus::Open => "open",
            LobbyStatus::InGame => "in_game",
        }
    }
}

impl fmt::Display for LobbyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised when building or mutating an advertisement.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AdvertisementError {
    /// A reserved field was given a value of the wrong type or range.
    #[error("invalid value for reserved field `{key}`: {value}")]
    InvalidReserved { key: String, value: Value },

    /// Application fields must be strings, numbers, booleans or null.
    #[error("field `{key}` must be a scalar, got {value}")]
    NotScalar { key: String, value: Value },

    /// The encoded advertisement does not fit one discovery datagram.
    #[error("advertisement encodes to {len} bytes, limit is {limit}")]
    Oversized { len: usize, limit: usize },
}

/// Lobby metadata broadcast by a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advertisement {
    /// TCP port the host accepts the session connection on.
    pub port: u16,
    /// Current occupancy.  Starts at 1 (the host).
    pub players: u32,
    pub status: LobbyStatus,
    /// Identifies the hosting process so it can hide its own beacon.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_id: Option<Uuid>,
    /// Application-defined scalar fields.
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Advertisement {
    /// Creates an open, single-player advertisement for `port`.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            players: 1,
            status: LobbyStatus::Open,
            host_id: None,
            fields: BTreeMap::new(),
        }
    }

    /// Creates an advertisement and applies `fields` through [`set_field`].
    ///
    /// Reserved names in `fields` override the defaults, so
    /// `with_fields(5555, [("status", "in_game")])` is valid.
    ///
    /// # Errors
    ///
    /// Returns the first [`AdvertisementError`] raised by [`set_field`].
    ///
    /// [`set_field`]: Advertisement::set_field
    pub fn with_fields<I, K>(port: u16, fields: I) -> Result<Self, AdvertisementError>
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        let mut ad = Self::new(port);
        for (key, value) in fields {
            ad.set_field(key, value)?;
        }
        Ok(ad)
    }

    /// Sets one field by name.
    ///
    /// Reserved names are parsed into their typed slot; any other name is
    /// stored in [`fields`](Advertisement::fields) and must hold a scalar.
    ///
    /// # Errors
    ///
    /// [`AdvertisementError::InvalidReserved`] when a reserved value does not
    /// fit its type, [`AdvertisementError::NotScalar`] for arrays and objects.
    pub fn set_field(&mut self, key: impl Into<String>, value: Value) -> Result<(), AdvertisementError> {
        let key = key.into();
        let invalid = |key: &str, value: &Value| AdvertisementError::InvalidReserved {
            key: key.to_string(),
            value: value.clone(),
        };

        match key.as_str() {
            "port" => {
                self.port = value
                    .as_u64()
                    .and_then(|n| u16::try_from(n).ok())
                    .ok_or_else(|| invalid(&key, &value))?;
            }
            "players" => {
                self.players = value
                    .as_u64()
                    .and_then(|n| u32::try_from(n).ok())
                    .ok_or_else(|| invalid(&key, &value))?;
            }
            "status" => {
                self.status =
                    serde_json::from_value(value.clone()).map_err(|_| invalid(&key, &value))?;
            }
            "host_id" => {
                self.host_id = if value.is_null() {
                    None
                } else {
                    Some(serde_json::from_value(value.clone()).map_err(|_| invalid(&key, &value))?)
                };
            }
            _ => {
                if value.is_array() || value.is_object() {
                    return Err(AdvertisementError::NotScalar { key, value });
                }
                self.fields.insert(key, value);
            }
        }
        Ok(())
    }

    /// Returns the value of a field as it appears on the wire.
    pub fn get_field(&self, key: &str) -> Option<Value> {
        match key {
            "port" => Some(Value::from(self.port)),
            "players" => Some(Value::from(self.players)),
            "status" => Some(Value::from(self.status.as_str())),
            "host_id" => self.host_id.map(|id| Value::from(id.to_string())),
            other => self.fields.get(other).cloned(),
        }
    }

    /// `true` when every constraint in `filter` holds by exact equality.
    pub fn matches(&self, filter: &LobbyFilter) -> bool {
        filter
            .iter()
            .all(|(key, expected)| self.get_field(key).as_ref() == Some(expected))
    }

    /// Size of the advertisement as one discovery datagram.
    ///
    /// # Errors
    ///
    /// [`AdvertisementError::Oversized`] when it exceeds
    /// [`MAX_DATAGRAM_LEN`]; a registry would receive it truncated.
    pub fn check_datagram_size(&self) -> Result<usize, AdvertisementError> {
        let len = encode(self).map_or(usize::MAX, |bytes| bytes.len());
        if len > MAX_DATAGRAM_LEN {
            return Err(AdvertisementError::Oversized {
                len,
                limit: MAX_DATAGRAM_LEN,
            });
        }
        Ok(len)
    }

    /// Marks the lobby as full once a peer has connected.
    pub fn mark_in_game(&mut self) {
        self.status = LobbyStatus::InGame;
        self.players = self.players.saturating_add(1);
    }
}

// ── Filter ────────────────────────────────────────────────────────────────────

/// Field constraints for lobby queries.  An empty filter matches everything.
///
/// ```rust
/// use lobby_core::{Advertisement, LobbyFilter};
///
/// let ad = Advertisement::new(5555);
/// assert!(ad.matches(&LobbyFilter::new().with("status", "open")));
/// assert!(!ad.matches(&LobbyFilter::new().with("players", 2)));
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LobbyFilter {
    constraints: BTreeMap<String, Value>,
}

impl LobbyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a `key == value` constraint, replacing any previous one for `key`.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.constraints.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.constraints.iter()
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for LobbyFilter {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            constraints: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
