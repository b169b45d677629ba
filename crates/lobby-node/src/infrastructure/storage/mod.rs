//! Storage infrastructure: configuration file persistence.
//!
//! The `config` sub-module reads the node's TOML file, supplies defaults
//! when it is missing, and turns the textual addresses into socket addresses.

pub mod config;
