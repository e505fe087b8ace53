//! mirrordns
//!
//! A small DNS server whose main trick is reflection: it answers every query
//! with the address and port the query arrived from, as seen by the server.
//! Queried for A (resp. AAAA) it returns the client's IPv4 (resp. IPv6)
//! address, with the port and transport in the additional section.
//!
//! Basic use pattern:
//!
//! ```text
//! dig @localhost -p 8053 whoami.example.org A
//! ```
//!
//! On top of reflection the server speaks AXFR/IXFR over TCP for a minimal
//! synthetic zone, signs and verifies TSIG when a shared key is configured,
//! and can serve A records for a second zone out of a pluggable record store.

/// DNS server implementation and protocol handling
pub mod dns;
