//! Application layer for a lobby node.
//!
//! The application layer sits between the domain types in `lobby_core`
//! and the socket adapters in `infrastructure`.  It owns the lifecycle
//! rules: when to advertise, when to accept, when to stop advertising, and
//! what a lost session means for the caller.
//!
//! # Sub-modules
//!
//! - **`lobby_service`** – The caller-facing surface: `host`, `join`,
//!   `update`, `send`, `receive`, `get_lobbies`, `is_connected`, `is_host`.

pub mod lobby_service;

pub use lobby_service::{LobbyService, ServiceError};
