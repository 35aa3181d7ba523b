//! Port allocation
//!
//! Ports are handed out from a fixed range. The in-use set is always read
//! from the registry inside the same transaction that records the
//! assignment, so allocation is a single check-and-reserve.

use crate::registry::{Registry, RegistryError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, info};

/// Inclusive range of ports handed out to sites. Configured either as
/// `{ low = .., high = .. }` or as a `[low, high]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PortRangeRepr")]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PortRangeRepr {
    Pair(u16, u16),
    Table { low: u16, high: u16 },
}

impl From<PortRangeRepr> for PortRange {
    fn from(repr: PortRangeRepr) -> Self {
        match repr {
            PortRangeRepr::Pair(low, high) | PortRangeRepr::Table { low, high } => {
                PortRange { low, high }
            }
        }
    }
}

impl PortRange {
    pub fn new(low: u16, high: u16) -> Self {
        Self { low, high }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.low && port <= self.high
    }

    pub fn len(&self) -> usize {
        if self.high < self.low {
            0
        } else {
            (self.high - self.low) as usize + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self { low: 3000, high: 3999 }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("no free port in range {low}-{high}")]
    ExhaustedRange { low: u16, high: u16 },
    #[error("port {0} is not available")]
    Unavailable(u16),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Pick a port: `preferred` if it is in range, unused and passes `probe`,
/// otherwise the lowest port from `range.low` that does.
pub fn select_port(
    range: PortRange,
    used: &BTreeSet<u16>,
    preferred: Option<u16>,
    probe: impl Fn(u16) -> bool,
) -> Option<u16> {
    if let Some(port) = preferred {
        if range.contains(port) && !used.contains(&port) && probe(port) {
            return Some(port);
        }
    }

    (range.low..=range.high).find(|port| !used.contains(port) && probe(*port))
}

/// Check whether nothing on the host is bound to `port`
pub fn is_port_available(port: u16) -> bool {
    std::net::TcpListener::bind(("0.0.0.0", port)).is_ok()
}

pub struct PortAllocator {
    range: PortRange,
    registry: Registry,
    probe_host: bool,
}

impl PortAllocator {
    pub fn new(range: PortRange, registry: Registry, probe_host: bool) -> Self {
        Self {
            range,
            registry,
            probe_host,
        }
    }

    /// Assign a free port to `owner`
    pub fn allocate(&self, owner: &str, preferred: Option<u16>) -> Result<u16, PortError> {
        let range = self.range;
        let probe_host = self.probe_host;

        let port = self.registry.assign_port(owner, |used| {
            select_port(range, used, preferred, |port| !probe_host || is_port_available(port))
                .ok_or(PortError::ExhaustedRange {
                    low: range.low,
                    high: range.high,
                })
        })?;

        info!(site = owner, port, "Port allocated");
        Ok(port)
    }

    /// Reassign exactly `port` to `owner`, failing closed if another site
    /// holds it or it is out of range. The host is not probed: on redeploy
    /// the owner's current workload is still bound to the port.
    pub fn reserve_exact(&self, owner: &str, port: u16) -> Result<u16, PortError> {
        if !self.range.contains(port) {
            return Err(PortError::Unavailable(port));
        }

        let port = self.registry.assign_port(owner, |used| {
            if used.contains(&port) {
                Err(PortError::Unavailable(port))
            } else {
                Ok(port)
            }
        })?;

        debug!(site = owner, port, "Port reserved for redeploy");
        Ok(port)
    }

    /// Return a port to the pool. Releasing a free port is a no-op.
    pub fn release(&self, port: u16) -> Result<(), PortError> {
        if self.registry.release_port(port)? {
            info!(port, "Port released");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::{Site, SiteKind, SiteState, WorkloadRef};
    use std::sync::Arc;

    fn allocator(low: u16, high: u16) -> (Registry, PortAllocator) {
        let registry = Registry::open_in_memory().unwrap();
        let allocator = PortAllocator::new(PortRange::new(low, high), registry.clone(), false);
        (registry, allocator)
    }

    fn add_site(registry: &Registry, name: &str) {
        registry
            .create(&Site::pending(name, SiteKind::Process, &format!("{}.example.com", name)), &[])
            .unwrap();
    }

    #[test]
    fn test_select_port() {
        let range = PortRange::new(3000, 3002);
        let used: BTreeSet<u16> = [3000].into_iter().collect();

        assert_eq!(select_port(range, &used, None, |_| true), Some(3001));
        assert_eq!(select_port(range, &used, Some(3002), |_| true), Some(3002));
        // Preferred but taken or out of range falls back to lowest free
        assert_eq!(select_port(range, &used, Some(3000), |_| true), Some(3001));
        assert_eq!(select_port(range, &used, Some(8080), |_| true), Some(3001));
        // Probe rejects
        assert_eq!(select_port(range, &used, None, |p| p != 3001), Some(3002));

        let full: BTreeSet<u16> = (3000..=3002).collect();
        assert_eq!(select_port(range, &full, None, |_| true), None);
    }

    #[test]
    fn test_port_range() {
        let range = PortRange::new(3000, 3010);
        assert_eq!(range.len(), 11);
        assert!(range.contains(3000));
        assert!(range.contains(3010));
        assert!(!range.contains(3011));
        assert!(PortRange::new(10, 5).is_empty());
    }

    #[test]
    fn test_allocate_lowest_then_reuse_after_release() {
        let (registry, allocator) = allocator(3000, 3010);
        add_site(&registry, "blog");
        add_site(&registry, "shop");
        add_site(&registry, "news");

        assert_eq!(allocator.allocate("blog", None).unwrap(), 3000);
        assert_eq!(allocator.allocate("shop", None).unwrap(), 3001);

        allocator.release(3000).unwrap();
        allocator.release(3000).unwrap();
        assert_eq!(allocator.allocate("news", None).unwrap(), 3000);
    }

    #[test]
    fn test_allocate_exhausted() {
        let (registry, allocator) = allocator(3000, 3001);
        for name in ["a", "b", "c"] {
            add_site(&registry, name);
        }
        allocator.allocate("a", None).unwrap();
        allocator.allocate("b", None).unwrap();

        assert!(matches!(
            allocator.allocate("c", None),
            Err(PortError::ExhaustedRange { low: 3000, high: 3001 })
        ));
        assert_eq!(registry.get("c").unwrap().unwrap().port, None);
    }

    #[test]
    fn test_reserve_exact() {
        let (registry, allocator) = allocator(3000, 3010);
        add_site(&registry, "blog");
        add_site(&registry, "shop");

        let port = allocator.allocate("blog", Some(3004)).unwrap();
        assert_eq!(port, 3004);
        registry.update_state("blog", SiteState::Routing).unwrap();
        registry.mark_live("blog", 3004, &WorkloadRef::new("blog")).unwrap();
        assert_eq!(allocator.reserve_exact("blog", 3004).unwrap(), 3004);

        assert!(matches!(
            allocator.reserve_exact("shop", 3004),
            Err(PortError::Unavailable(3004))
        ));
        assert!(matches!(
            allocator.reserve_exact("shop", 9000),
            Err(PortError::Unavailable(9000))
        ));
    }

    #[test]
    fn test_concurrent_allocations_are_distinct() {
        let (registry, allocator) = allocator(3000, 3030);
        let allocator = Arc::new(allocator);
        for i in 0..20 {
            add_site(&registry, &format!("site{}", i));
        }

        let handles: Vec<_> = (0..20)
            .map(|i| {
                let allocator = allocator.clone();
                std::thread::spawn(move || allocator.allocate(&format!("site{}", i), None).unwrap())
            })
            .collect();

        let ports: BTreeSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(ports.len(), 20);
        assert!(ports.iter().all(|p| (3000..=3030).contains(p)));
        assert_eq!(registry.used_ports().unwrap(), ports);
    }

    #[test]
    fn test_is_port_available() {
        let listener = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!is_port_available(port));
    }
}
