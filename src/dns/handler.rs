//! Query dispatch: the handler contract and the zone suffix table
//!
//! Listeners decode a query, build its `Session`, and look the queried name
//! up in the `HandlerTable`. The matched handler returns a `ReplyAction`
//! telling the listener what to put on the wire; handlers never touch the
//! socket themselves, except for zone transfers which take the connection
//! over explicitly (see `transfer`).

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::dns::context::ServerContext;
use crate::dns::protocol::DnsPacket;

/// Transport a query arrived over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Udp,
    Tcp,
}

impl TransportKind {
    /// The label used in the reflected TXT record
    pub fn label(&self) -> &'static str {
        match *self {
            TransportKind::Udp => "udp",
            TransportKind::Tcp => "tcp",
        }
    }
}

/// Where a query came from, derived once per inbound message and immutable
/// while the query is being handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Session {
    pub transport: TransportKind,
    pub remote: SocketAddr,
}

impl Session {
    pub fn new(transport: TransportKind, remote: SocketAddr) -> Session {
        Session { transport, remote }
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.remote.ip()
    }

    pub fn remote_port(&self) -> u16 {
        self.remote.port()
    }
}

/// What the listener should do with the handler's result
#[derive(Debug)]
pub enum ReplyAction {
    /// Serialize and send the packet
    Respond(DnsPacket),
    /// Serialize the packet in full but transmit only the first half of the
    /// bytes, for clients testing their truncation handling
    RespondHalf(DnsPacket),
    /// Stream the packets as a zone transfer; TCP only. The streamer takes
    /// ownership of the connection and the listener must not close it.
    Transfer(Vec<DnsPacket>),
    /// Send nothing; the client sees a timeout
    Drop,
}

/// Common trait for everything that can answer a dispatched query
pub trait QueryHandler: Send + Sync {
    fn handle(
        &self,
        context: &Arc<ServerContext>,
        request: &DnsPacket,
        session: &Session,
    ) -> ReplyAction;
}

/// Maps zone suffixes to handlers
///
/// Registration happens during startup; afterwards the table is shared
/// read-only between both listeners, so no locking is needed.
#[derive(Default)]
pub struct HandlerTable {
    entries: Vec<(String, Arc<dyn QueryHandler>)>,
}

impl HandlerTable {
    pub fn new() -> HandlerTable {
        HandlerTable::default()
    }

    pub fn register(&mut self, zone: &str, handler: Arc<dyn QueryHandler>) {
        let zone = zone.trim_end_matches('.').to_lowercase();
        self.entries.push((zone, handler));
    }

    /// Find the handler whose zone is the longest suffix of `qname`
    pub fn find(&self, qname: &str) -> Option<&Arc<dyn QueryHandler>> {
        let qname = qname.trim_end_matches('.').to_lowercase();

        self.entries
            .iter()
            .filter(|(zone, _)| {
                qname == *zone || qname.ends_with(&format!(".{}", zone))
            })
            .max_by_key(|(zone, _)| zone.len())
            .map(|(_, handler)| handler)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
