//! The `ServerContext` holds the common state across the server
//!
//! Everything in here is either immutable after startup (configuration, the
//! dispatch and key tables) or atomic (the counters), so the context can be
//! shared freely between the two listeners without locking.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::dns::handler::HandlerTable;
use crate::dns::memory_pool::{BufferPool, MemoryPoolConfig};
use crate::dns::tsig::TsigKeyTable;

/// Zone the reflection handler is registered for by default
pub const REFLECT_ZONE: &str = "example.org";

/// Owner name used on all self describing reflection records
pub const REFLECT_DOMAIN: &str = "whoami.example.org";

/// Queries for exactly this name get a deliberately truncated reply
pub const TRUNCATION_TEST_DOMAIN: &str = "tc.example.org";

/// Zone delegated to the record store handler by default
pub const STORE_ZONE: &str = "db.example.org";

pub struct ServerStatistics {
    pub tcp_query_count: AtomicUsize,
    pub udp_query_count: AtomicUsize,
    /// Reflection queries served; incremented atomically so concurrent
    /// queries on both listeners never lose an update
    pub reflect_count: AtomicUsize,
}

impl ServerStatistics {
    pub fn get_tcp_query_count(&self) -> usize {
        self.tcp_query_count.load(Ordering::Acquire)
    }

    pub fn get_udp_query_count(&self) -> usize {
        self.udp_query_count.load(Ordering::Acquire)
    }

    pub fn get_reflect_count(&self) -> usize {
        self.reflect_count.load(Ordering::Acquire)
    }

    /// Count one served reflection and return the new total
    pub fn count_reflection(&self) -> usize {
        self.reflect_count.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// Main server context containing configuration and shared state
pub struct ServerContext {
    pub dns_port: u16,
    /// Dump every reply to the log before sending it
    pub print_replies: bool,
    /// Use label compression when serializing replies
    pub compress_replies: bool,
    /// Serve UDP receives out of the pre-allocated buffer pool
    pub enable_pooling: bool,
    pub reflect_domain: String,
    pub truncation_test_domain: String,
    pub tsig_keys: TsigKeyTable,
    pub handlers: HandlerTable,
    pub buffer_pool: BufferPool,
    pub statistics: ServerStatistics,
}

impl Default for ServerContext {
    fn default() -> Self {
        ServerContext::new()
    }
}

impl ServerContext {
    pub fn new() -> ServerContext {
        ServerContext {
            dns_port: 8053,
            print_replies: false,
            compress_replies: false,
            enable_pooling: false,
            reflect_domain: REFLECT_DOMAIN.to_string(),
            truncation_test_domain: TRUNCATION_TEST_DOMAIN.to_string(),
            tsig_keys: TsigKeyTable::new(),
            handlers: HandlerTable::new(),
            buffer_pool: BufferPool::new(MemoryPoolConfig::default()),
            statistics: ServerStatistics {
                tcp_query_count: AtomicUsize::new(0),
                udp_query_count: AtomicUsize::new(0),
                reflect_count: AtomicUsize::new(0),
            },
        }
    }
}

#[cfg(test)]
pub mod tests {

    use std::sync::Arc;

    use super::*;

    pub fn create_test_context() -> Arc<ServerContext> {
        Arc::new(ServerContext::new())
    }

    #[test]
    fn test_counters_start_at_zero() {
        let context = create_test_context();
        assert_eq!(0, context.statistics.get_udp_query_count());
        assert_eq!(0, context.statistics.get_tcp_query_count());
        assert_eq!(0, context.statistics.get_reflect_count());
    }

    #[test]
    fn test_count_reflection_returns_new_total() {
        let context = create_test_context();
        assert_eq!(1, context.statistics.count_reflection());
        assert_eq!(2, context.statistics.count_reflection());
        assert_eq!(2, context.statistics.get_reflect_count());
    }
}
