//! Infrastructure layer for a lobby node.
//!
//! Contains OS-facing adapters: the discovery and session sockets, and
//! file-system storage for the configuration.

pub mod network;
pub mod storage;
