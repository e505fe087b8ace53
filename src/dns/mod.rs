//! DNS Reflection Server
//!
//! This module provides the full server implementation:
//! * DNS packet parsing and serialization
//! * Address/port reflection responder
//! * Zone transfer (AXFR/IXFR) streaming over TCP
//! * TSIG signing and verification
//! * Record-store backed answers for a delegated zone
//! * Both UDP and TCP transport protocols
//!
//! # Module Structure
//!
//! * `protocol` - DNS protocol definitions and packet handling
//! * `server` - UDP and TCP server implementations
//! * `reflect` - the reflection responder
//! * `transfer` - zone transfer streaming
//! * `tsig` - transaction signatures
//! * `store` - record store boundary and handler
//! * `handler` - query dispatch and handler contract
//! * `context` - server configuration and shared state
//! * `buffer` - low-level packet buffer operations

/// Low-level buffer operations for DNS packet handling
pub mod buffer;

/// Server configuration and shared context
pub mod context;

/// Query dispatch table and handler contract
pub mod handler;

/// Pre-allocated receive buffers for the UDP listener
pub mod memory_pool;

/// DNS protocol definitions and packet structures
pub mod protocol;

/// Address and transport reflection responder
pub mod reflect;

/// UDP and TCP DNS server implementations
pub mod server;

/// Record store boundary and the store-backed handler
pub mod store;

/// Zone transfer (AXFR/IXFR) streaming
pub mod transfer;

/// TSIG transaction signatures (RFC 2845 style)
pub mod tsig;

/// Internal network utilities
mod netutil;
