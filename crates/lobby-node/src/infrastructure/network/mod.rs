//! Network infrastructure for a lobby node.
//!
//! # Sub-modules
//!
//! - **`beacon`** – Broadcasts the hosted lobby's advertisement on the
//!   discovery port once per interval until someone joins.
//!
//! - **`registry`** – Listens on the discovery port and keeps the set of
//!   lobbies currently being advertised, evicting those that go silent.
//!
//! - **`session`** – The point-to-point TCP channel between a host and its
//!   joiner, carrying newline-delimited JSON records with latest-value
//!   receive semantics.

pub mod beacon;
pub mod registry;
pub mod session;
