//! Registry of logged-in clients

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use stp_core::time::current_time_secs;

use crate::control::ControlHandle;

/// One logged-in client
#[derive(Debug)]
pub struct ClientEntry {
    name: String,
    port: u16,
    addr: SocketAddr,
    login_time: u64,
    online_time: AtomicU64,
    is_online: AtomicBool,
    control: ControlHandle,
}

impl ClientEntry {
    pub fn new(name: String, port: u16, addr: SocketAddr, control: ControlHandle) -> Self {
        Self {
            name,
            port,
            addr,
            login_time: current_time_secs(),
            online_time: AtomicU64::new(0),
            is_online: AtomicBool::new(false),
            control,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn login_time(&self) -> u64 {
        self.login_time
    }

    pub fn online_time(&self) -> u64 {
        self.online_time.load(Ordering::Relaxed)
    }

    pub fn is_online(&self) -> bool {
        self.is_online.load(Ordering::Relaxed)
    }

    pub fn control(&self) -> &ControlHandle {
        &self.control
    }

    /// Record a successful probe at `now`
    pub fn mark_online(&self, now: u64) {
        self.is_online.store(true, Ordering::Relaxed);
        self.online_time
            .store(now.saturating_sub(self.login_time), Ordering::Relaxed);
    }

    /// Record a failed probe
    pub fn mark_offline(&self) {
        self.is_online.store(false, Ordering::Relaxed);
    }

    /// Snapshot for the operator listing
    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            name: self.name.clone(),
            port: self.port,
            addr: self.addr.to_string(),
            login_time: self.login_time,
            online_time: self.online_time(),
            is_online: self.is_online(),
        }
    }
}

/// Serializable view of a client, as served on `/showClient`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    pub name: String,
    pub port: u16,
    pub addr: String,
    pub login_time: u64,
    pub online_time: u64,
    pub is_online: bool,
}

/// Ordered sequence of logged-in clients
///
/// New clients are appended. Removal swaps the last entry into the removed
/// position, so order is not stable across removals. Only the liveness
/// supervisor removes entries, which keeps the indices of a snapshot valid
/// until that supervisor removes them.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: Mutex<Vec<Arc<ClientEntry>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Arc<ClientEntry>>> {
        self.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a client
    pub fn add(&self, entry: Arc<ClientEntry>) {
        tracing::debug!("Registering client {} on port {}", entry.name(), entry.port());
        self.lock().push(entry);
    }

    /// Remove the entry at `index` by swapping the last entry into its place
    pub fn remove_at(&self, index: usize) -> Option<Arc<ClientEntry>> {
        let mut clients = self.lock();
        if index < clients.len() {
            Some(clients.swap_remove(index))
        } else {
            None
        }
    }

    /// Remove several entries by index
    ///
    /// Indices are processed from highest to lowest so every swap-delete
    /// only moves entries that are not themselves scheduled for removal.
    pub fn remove_indices(&self, mut indices: Vec<usize>) -> Vec<Arc<ClientEntry>> {
        indices.sort_unstable_by(|a, b| b.cmp(a));
        indices.dedup();

        let mut clients = self.lock();
        let mut removed = Vec::with_capacity(indices.len());
        for index in indices {
            if index < clients.len() {
                removed.push(clients.swap_remove(index));
            }
        }
        removed
    }

    /// Current entries in registry order
    pub fn snapshot(&self) -> Vec<Arc<ClientEntry>> {
        self.lock().clone()
    }

    /// Operator view of every client
    pub fn list(&self) -> Vec<ClientInfo> {
        self.lock().iter().map(|c| c.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
