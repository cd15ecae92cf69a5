//! stp-client: Tunnel client for stp
//!
//! The client dials the broker's control channel, logs in to obtain a
//! public port and SSH credentials, then keeps a reverse SSH tunnel from
//! that port to a local service open. Whenever the broker forces a relogin
//! or the control channel drops, the tunnel is torn down and the whole
//! cycle starts over.

pub mod session;
pub mod tunnel;

pub use session::{ActiveSession, ControlClient, SessionEnd, SessionError, SessionState};
pub use tunnel::{ExponentialBackoff, ReverseTunnel, TunnelError, TunnelHandle, TunnelSpec};
