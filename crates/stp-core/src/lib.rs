//! stp-core: Core types and configuration for stp
//!
//! This crate provides the shared types, configuration structures and
//! error taxonomy used by the broker and the tunnel client, the
//! bidirectional splice both sides of a tunnel use, and the small
//! filesystem helper that maintains `authorized_keys`.

pub mod authorized_keys;
pub mod config;
pub mod error;
pub mod splice;
pub mod time;
pub mod types;

pub use error::ConfigError;
pub use splice::splice;
pub use types::{Endpoint, PortRange};
