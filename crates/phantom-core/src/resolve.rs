use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Mutex;

use crate::error::ResolveError;

/// Out-of-band lookup of a connection's original, pre-redirect destination,
/// keyed by the accepted connection's source tuple. The real implementation
/// (iptables `SO_ORIGINAL_DST`, or an eBPF-supplied tuple) is out of scope —
/// this crate only depends on the trait.
pub trait DestinationResolver: Send + Sync {
    fn resolve(&self, source: SocketAddr) -> Result<SocketAddr, ResolveError>;
}

/// Resolves every source to one fixed destination. Useful for tests and for
/// the non-NAT demo path (a single well-known upstream, e.g. a local
/// Postgres/MySQL instance started for a test fixture).
pub struct StaticDestinationResolver {
    destination: SocketAddr,
}

impl StaticDestinationResolver {
    pub fn new(destination: SocketAddr) -> Self {
        Self { destination }
    }
}

impl DestinationResolver for StaticDestinationResolver {
    fn resolve(&self, _source: SocketAddr) -> Result<SocketAddr, ResolveError> {
        Ok(self.destination)
    }
}

/// Resolves from a fixed source→destination table, failing with `NotFound`
/// for any source not present. Used in dispatcher tests that need distinct
/// connections to resolve to distinct upstreams.
pub struct TableDestinationResolver {
    table: Mutex<HashMap<SocketAddr, SocketAddr>>,
}

impl TableDestinationResolver {
    pub fn new(table: HashMap<SocketAddr, SocketAddr>) -> Self {
        Self {
            table: Mutex::new(table),
        }
    }
}

impl DestinationResolver for TableDestinationResolver {
    fn resolve(&self, source: SocketAddr) -> Result<SocketAddr, ResolveError> {
        self.table
            .lock()
            .expect("resolver table mutex poisoned")
            .get(&source)
            .copied()
            .ok_or(ResolveError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_resolver_always_returns_same_destination() {
        let dest: SocketAddr = "127.0.0.1:5432".parse().unwrap();
        let resolver = StaticDestinationResolver::new(dest);
        let src_a: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        let src_b: SocketAddr = "127.0.0.1:40002".parse().unwrap();
        assert_eq!(resolver.resolve(src_a).unwrap(), dest);
        assert_eq!(resolver.resolve(src_b).unwrap(), dest);
    }

    #[test]
    fn table_resolver_reports_not_found_for_unknown_source() {
        let resolver = TableDestinationResolver::new(HashMap::new());
        let src: SocketAddr = "127.0.0.1:40001".parse().unwrap();
        assert_eq!(resolver.resolve(src), Err(ResolveError::NotFound));
    }
}
