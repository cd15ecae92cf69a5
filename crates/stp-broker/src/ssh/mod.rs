//! Embedded SSH endpoint for the tunnel data plane

mod handler;
mod listener;

pub use handler::{ForwardHandler, ForwardPolicy};
pub use listener::{load_or_generate_host_key, SshEndpoint};
