//! stp-broker: Public port broker for reverse SSH tunnels
//!
//! The broker accepts control-channel connections from tunnel clients,
//! assigns each one a public port from a fixed pool, hands out the SSH
//! credentials the client needs to open a reverse tunnel onto that port,
//! and continuously probes every assigned port, reclaiming dead ones and
//! forcing their clients to log in again.

pub mod control;
pub mod http;
pub mod keys;
pub mod operator;
pub mod pool;
pub mod probe;
pub mod registry;
pub mod ssh;
pub mod state;
pub mod supervisor;

pub use keys::KeyMaterial;
pub use pool::PortPool;
pub use probe::{PortProbe, TcpProbe};
pub use registry::{ClientEntry, ClientInfo, ClientRegistry};
pub use state::BrokerState;
pub use supervisor::{LivenessSupervisor, SweepReport};
