use std::net::SocketAddr;

use dashmap::DashMap;
use tracing::debug;

/// Route prefix to worker address, read by the reverse proxy.
#[derive(Default)]
pub struct RouteTable {
    routes: DashMap<String, SocketAddr>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, prefix: &str, addr: SocketAddr) {
        debug!(prefix, %addr, "route registered");
        self.routes.insert(prefix.to_string(), addr);
    }

    /// Remove the route, but only if it still points at `addr`.
    pub fn unregister(&self, prefix: &str, addr: SocketAddr) -> bool {
        let removed = self.routes.remove_if(prefix, |_, current| *current == addr).is_some();
        if removed {
            debug!(prefix, %addr, "route unregistered");
        }
        removed
    }

    pub fn resolve(&self, prefix: &str) -> Option<SocketAddr> {
        self.routes.get(prefix).map(|entry| *entry.value())
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
