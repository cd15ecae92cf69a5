//! Reverse SSH tunnel to the broker

mod reconnect;
mod reverse;

pub use reconnect::ExponentialBackoff;
pub use reverse::{ReverseTunnel, TunnelError, TunnelHandle, TunnelSpec};
