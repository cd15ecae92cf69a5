//! Port pool
//!
//! A fixed set of assignable ports, one slot per port in the configured
//! range. Slots are handed out round-robin: a scan starts one slot past the
//! most recently assigned one and checks each of the other `N - 1` slots
//! once, in increasing order modulo `N`.

use std::sync::Arc;

use stp_core::PortRange;
use tokio::sync::Mutex;

use crate::probe::PortProbe;

#[derive(Debug)]
struct Slot {
    port: u16,
    used: bool,
}

#[derive(Debug)]
struct Slots {
    slots: Vec<Slot>,
    /// Index of the most recently assigned slot
    last_index: usize,
}

/// Pool of assignable public ports
pub struct PortPool {
    range: PortRange,
    inner: Mutex<Slots>,
    probe: Arc<dyn PortProbe>,
}

impl PortPool {
    /// Create a pool covering `range` with every slot free
    pub fn new(range: PortRange, probe: Arc<dyn PortProbe>) -> Self {
        let slots: Vec<Slot> = range.ports().map(|port| Slot { port, used: false }).collect();
        // The first scan starts at the beginning of the range
        let last_index = slots.len() - 1;
        tracing::info!("Port range {}", range);

        Self {
            range,
            inner: Mutex::new(Slots { slots, last_index }),
            probe,
        }
    }

    /// The range this pool covers
    pub fn range(&self) -> PortRange {
        self.range
    }

    /// Assign a free port, or `None` when the pool is exhausted.
    ///
    /// A free candidate is marked used before it is probed. If something is
    /// already listening on it the slot stays marked and the scan moves on;
    /// otherwise the port is returned.
    pub async fn assign(&self) -> Option<u16> {
        let (start, count) = {
            let inner = self.inner.lock().await;
            (inner.last_index, inner.slots.len())
        };

        let mut index = start;
        for _ in 0..count.saturating_sub(1) {
            index = (index + 1) % count;

            let port = {
                let mut inner = self.inner.lock().await;
                let slot = &mut inner.slots[index];
                if slot.used {
                    continue;
                }
                slot.used = true;
                slot.port
            };

            if self.probe.is_live(port).await {
                tracing::warn!("Port {} is occupied by another listener, skipping", port);
                continue;
            }

            self.inner.lock().await.last_index = index;
            tracing::debug!("Assigned port {}", port);
            return Some(port);
        }

        tracing::warn!("No free port in {}", self.range);
        None
    }

    /// Make `port` assignable again. Ports outside the range are ignored.
    pub async fn release(&self, port: u16) -> bool {
        if !self.range.contains(port) {
            tracing::debug!("Ignoring release of port {} outside {}", port, self.range);
            return false;
        }
        let index = usize::from(port - self.range.start());
        let mut inner = self.inner.lock().await;
        inner.slots[index].used = false;
        tracing::info!("Port {} released", port);
        true
    }

    /// Whether something is listening on `port` right now
    pub async fn ping(&self, port: u16) -> bool {
        self.probe.is_live(port).await
    }

    /// Whether `port` is currently marked used
    pub async fn is_used(&self, port: u16) -> bool {
        if !self.range.contains(port) {
            return false;
        }
        let index = usize::from(port - self.range.start());
        self.inner.lock().await.slots[index].used
    }

    /// Number of slots currently marked used
    pub async fn used_count(&self) -> usize {
        self.inner.lock().await.slots.iter().filter(|s| s.used).count()
    }

    /// Total number of slots
    pub fn capacity(&self) -> usize {
        self.range.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashSet;
    use std::sync::Mutex as StdMutex;

    /// Probe whose answers are scripted by the test
    #[derive(Default)]
    struct ScriptedProbe {
        live: StdMutex<HashSet<u16>>,
        probed: StdMutex<Vec<u16>>,
    }

    impl ScriptedProbe {
        fn set_live(&self, port: u16, live: bool) {
            let mut set = self.live.lock().unwrap();
            if live {
                set.insert(port);
            } else {
                set.remove(&port);
            }
        }
    }

    #[async_trait]
    impl PortProbe for ScriptedProbe {
        async fn is_live(&self, port: u16) -> bool {
            self.probed.lock().unwrap().push(port);
            self.live.lock().unwrap().contains(&port)
        }
    }

    fn pool(start: u16, end: u16) -> (PortPool, Arc<ScriptedProbe>) {
        let probe = Arc::new(ScriptedProbe::default());
        let pool = PortPool::new(PortRange::new(start, end).unwrap(), probe.clone());
        (pool, probe)
    }

    #[tokio::test]
    async fn test_assigns_in_order_from_range_start() {
        let (pool, _) = pool(9000, 9003);
        assert_eq!(pool.assign().await, Some(9000));
        assert_eq!(pool.assign().await, Some(9001));
        assert_eq!(pool.assign().await, Some(9002));
        assert_eq!(pool.used_count().await, 3);
    }

    #[tokio::test]
    async fn test_exhausted_pool_returns_none() {
        let (pool, _) = pool(9000, 9001);
        assert_eq!(pool.assign().await, Some(9000));
        assert_eq!(pool.assign().await, Some(9001));
        assert_eq!(pool.assign().await, None);
        assert_eq!(pool.used_count().await, 2);
    }

    #[tokio::test]
    async fn test_released_port_is_reassigned() {
        let (pool, _) = pool(9000, 9001);
        assert_eq!(pool.assign().await, Some(9000));
        assert_eq!(pool.assign().await, Some(9001));

        assert!(pool.release(9000).await);
        assert!(!pool.is_used(9000).await);
        assert_eq!(pool.assign().await, Some(9000));
    }

    #[tokio::test]
    async fn test_occupied_port_is_marked_and_skipped() {
        let (pool, probe) = pool(9000, 9002);
        probe.set_live(9000, true);

        assert_eq!(pool.assign().await, Some(9001));
        assert!(pool.is_used(9000).await);
        // 9000 stays marked even after the outside listener goes away
        probe.set_live(9000, false);
        assert_eq!(pool.assign().await, Some(9002));
        assert_eq!(pool.assign().await, None);
    }

    #[tokio::test]
    async fn test_scan_wraps_around() {
        let (pool, _) = pool(9000, 9002);
        assert_eq!(pool.assign().await, Some(9000));
        assert_eq!(pool.assign().await, Some(9001));
        assert_eq!(pool.assign().await, Some(9002));

        pool.release(9000).await;
        pool.release(9001).await;
        // Scan continues after 9002 and wraps to the start of the range
        assert_eq!(pool.assign().await, Some(9000));
        assert_eq!(pool.assign().await, Some(9001));
    }

    #[tokio::test]
    async fn test_scan_is_bounded() {
        let (pool, probe) = pool(9000, 9004);
        for port in 9000..=9004 {
            probe.set_live(port, true);
        }

        assert_eq!(pool.assign().await, None);
        // N - 1 candidates, each probed once
        assert_eq!(probe.probed.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_used_slots_are_not_probed() {
        let (pool, probe) = pool(9000, 9002);
        pool.assign().await;
        probe.probed.lock().unwrap().clear();

        pool.assign().await;
        assert_eq!(*probe.probed.lock().unwrap(), vec![9001]);
    }

    #[tokio::test]
    async fn test_release_outside_range_is_noop() {
        let (pool, _) = pool(9000, 9001);
        pool.assign().await;
        assert!(!pool.release(8999).await);
        assert!(!pool.release(9002).await);
        assert_eq!(pool.used_count().await, 1);
    }

    #[tokio::test]
    async fn test_used_never_exceeds_capacity_or_duplicates() {
        let (pool, _) = pool(9000, 9009);
        let pool = Arc::new(pool);

        let mut tasks = Vec::new();
        for _ in 0..25 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move { pool.assign().await }));
        }

        let mut assigned = HashSet::new();
        for task in tasks {
            if let Some(port) = task.await.unwrap() {
                assert!(assigned.insert(port), "port {} assigned twice", port);
            }
        }

        assert!(assigned.len() <= pool.capacity());
        assert_eq!(pool.used_count().await, assigned.len());
    }

    #[tokio::test]
    async fn test_ping_uses_probe() {
        let (pool, probe) = pool(9000, 9001);
        assert!(!pool.ping(9000).await);
        probe.set_live(9000, true);
        assert!(pool.ping(9000).await);
    }
}
