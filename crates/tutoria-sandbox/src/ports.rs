use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::ops::RangeInclusive;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::error::SandboxError;

/// Hands out ports from a fixed range shared by every worker on the host.
///
/// A candidate is reserved locally, checked with a throwaway bind, then bound
/// for real. Losing the race to another process between check and bind just
/// moves on to the next candidate.
pub struct PortAllocator {
    host: IpAddr,
    range: RangeInclusive<u16>,
    attempts: u32,
    reserved: Mutex<HashSet<u16>>,
}

/// A reserved port. The reservation is released on drop.
pub struct PortLease {
    port: u16,
    allocator: Arc<PortAllocator>,
}

impl PortLease {
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        self.allocator.reserved.lock().remove(&self.port);
        debug!(port = self.port, "port released");
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

impl PortAllocator {
    /// A reversed range is taken end to start.
    pub fn new(host: IpAddr, range: RangeInclusive<u16>, attempts: u32) -> Arc<Self> {
        let (first, last) = range.into_inner();
        Arc::new(Self {
            host,
            range: first.min(last)..=first.max(last),
            attempts: attempts.max(1),
            reserved: Mutex::new(HashSet::new()),
        })
    }

    pub fn host(&self) -> IpAddr {
        self.host
    }

    pub fn reserved_count(&self) -> usize {
        self.reserved.lock().len()
    }

    /// Reserve and bind a port.
    pub async fn acquire(self: &Arc<Self>) -> Result<(PortLease, TcpListener), SandboxError> {
        let mut tried = HashSet::new();
        for attempt in 1..=self.attempts {
            let Some(port) = self.reserve_candidate(&tried) else {
                break;
            };
            tried.insert(port);
            let lease = PortLease {
                port,
                allocator: Arc::clone(self),
            };
            let addr = SocketAddr::new(self.host, port);

            match TcpListener::bind(addr).await {
                Ok(throwaway) => drop(throwaway),
                Err(_) => {
                    debug!(port, attempt, "port busy");
                    continue;
                }
            }

            match TcpListener::bind(addr).await {
                Ok(listener) => {
                    debug!(port, attempt, "port acquired");
                    return Ok((lease, listener));
                }
                Err(e) => {
                    warn!(port, attempt, error = %e, "lost bind race, retrying");
                }
            }
        }
        Err(SandboxError::NoFreePort {
            attempts: self.attempts,
        })
    }

    /// Reserve a port that is neither reserved nor already tried, scanning the
    /// range from a random offset.
    fn reserve_candidate(&self, tried: &HashSet<u16>) -> Option<u16> {
        let start = *self.range.start();
        let len = u32::from(*self.range.end() - start) + 1;
        let offset = rand::thread_rng().gen_range(0..len);
        let mut reserved = self.reserved.lock();
        for step in 0..len {
            let port = start + ((offset + step) % len) as u16;
            if !reserved.contains(&port) && !tried.contains(&port) {
                reserved.insert(port);
                return Some(port);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    fn os_port() -> (std::net::TcpListener, u16) {
        let listener = std::net::TcpListener::bind((LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[tokio::test]
    async fn acquires_within_range_and_releases_on_drop() {
        let allocator = PortAllocator::new(LOCALHOST, 47100..=47199, 20);
        let (lease, listener) = allocator.acquire().await.unwrap();
        assert!((47100..=47199).contains(&lease.port()));
        assert_eq!(listener.local_addr().unwrap().port(), lease.port());
        assert_eq!(allocator.reserved_count(), 1);

        drop(listener);
        drop(lease);
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_leases_never_share_a_port() {
        let allocator = PortAllocator::new(LOCALHOST, 47200..=47299, 20);
        let (a, _la) = allocator.acquire().await.unwrap();
        let (b, _lb) = allocator.acquire().await.unwrap();
        assert_ne!(a.port(), b.port());
        assert_eq!(allocator.reserved_count(), 2);
    }

    #[tokio::test]
    async fn occupied_range_reports_no_free_port() {
        let (_held, port) = os_port();
        let allocator = PortAllocator::new(LOCALHOST, port..=port, 5);
        let err = allocator.acquire().await.unwrap_err();
        assert!(matches!(err, SandboxError::NoFreePort { attempts: 5 }));
        assert_eq!(allocator.reserved_count(), 0);
    }

    #[tokio::test]
    async fn reserved_port_is_skipped() {
        let allocator = PortAllocator::new(LOCALHOST, 47300..=47300, 3);
        let (_lease, _listener) = allocator.acquire().await.unwrap();
        assert!(matches!(
            allocator.acquire().await,
            Err(SandboxError::NoFreePort { .. })
        ));
    }

    #[tokio::test]
    async fn reversed_range_is_normalized() {
        let allocator = PortAllocator::new(LOCALHOST, 47350..=47340, 5);
        let (lease, _listener) = allocator.acquire().await.unwrap();
        assert!((47340..=47350).contains(&lease.port()));

        let single = PortAllocator::new(LOCALHOST, 47360..=47360, 1);
        assert_eq!(single.range, 47360..=47360);
    }

    #[tokio::test]
    async fn busy_port_falls_through_to_next() {
        let (_held, port) = os_port();
        let Some(next) = port.checked_add(1) else {
            return;
        };
        let allocator = PortAllocator::new(LOCALHOST, port..=next, 5);
        match allocator.acquire().await {
            Ok((lease, _listener)) => assert_eq!(lease.port(), next),
            // the neighbour happened to be taken by someone else
            Err(e) => assert!(matches!(e, SandboxError::NoFreePort { .. })),
        }
    }
}
