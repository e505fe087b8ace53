//! Record store boundary and the store-backed query handler
//!
//! The store itself is somebody else's problem: anything that can answer
//! `lookup(name, type) -> ttl + rdata` can be plugged in behind the
//! `RecordStore` trait. Lookups are synchronous and may block the handling
//! thread, which is fine since every query runs on its own worker.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use derive_more::{Display, Error, From};

use crate::dns::context::ServerContext;
use crate::dns::handler::{QueryHandler, ReplyAction, Session};
use crate::dns::protocol::{DnsPacket, DnsRecord, QueryType, TransientTtl};

#[derive(Debug, Display, From, Error)]
pub enum StoreError {
    Io(std::io::Error),
    #[display(fmt = "backing store unavailable")]
    Unavailable,
}

type Result<T> = std::result::Result<T, StoreError>;

/// TTL on the empty record answering a lookup miss
const MISS_TTL: u32 = 60;

/// Synchronous name+type lookup against some backing record storage
///
/// The backing schema is rows of (name, type, ttl, rdata); `Ok(None)`
/// signals "no such row".
pub trait RecordStore: Send + Sync {
    fn lookup(&self, name: &str, rrtype: &str) -> Result<Option<(u32, String)>>;
}

/// In-process `RecordStore`, used by the binary and in tests
#[derive(Default)]
pub struct MemoryRecordStore {
    rows: HashMap<(String, String), (u32, String)>,
}

impl MemoryRecordStore {
    pub fn new() -> MemoryRecordStore {
        MemoryRecordStore::default()
    }

    pub fn insert(&mut self, name: &str, rrtype: &str, ttl: u32, rdata: &str) {
        self.rows.insert(
            (name.to_lowercase(), rrtype.to_string()),
            (ttl, rdata.to_string()),
        );
    }
}

impl RecordStore for MemoryRecordStore {
    fn lookup(&self, name: &str, rrtype: &str) -> Result<Option<(u32, String)>> {
        Ok(self
            .rows
            .get(&(name.to_lowercase(), rrtype.to_string()))
            .cloned())
    }
}

/// Answers A queries for a delegated zone out of a `RecordStore`
///
/// Only A lookups are supported; anything else, any miss, and any row whose
/// rdata fails strict address parsing is answered with a single empty
/// ANY-typed record carrying a short TTL. A corrupt row must not take the
/// server down, so malformed rdata is logged and treated as a miss.
pub struct StoreHandler {
    store: Arc<dyn RecordStore>,
}

impl StoreHandler {
    pub fn new(store: Arc<dyn RecordStore>) -> StoreHandler {
        StoreHandler { store }
    }

    fn miss_record(name: &str) -> DnsRecord {
        DnsRecord::Any {
            domain: name.to_string(),
            ttl: TransientTtl(MISS_TTL),
        }
    }

    fn lookup_a(&self, name: &str) -> Option<DnsRecord> {
        let (ttl, rdata) = match self.store.lookup(name, "A") {
            Ok(Some(row)) => row,
            Ok(None) => return None,
            Err(e) => {
                log::error!("Record store lookup for {} failed: {}", name, e);
                return None;
            }
        };

        match rdata.parse::<Ipv4Addr>() {
            Ok(addr) => Some(DnsRecord::A {
                domain: name.to_string(),
                addr,
                ttl: TransientTtl(ttl),
            }),
            Err(_) => {
                log::warn!(
                    "Record store has malformed A rdata {:?} for {}, treating as miss",
                    rdata,
                    name
                );
                None
            }
        }
    }
}

impl QueryHandler for StoreHandler {
    fn handle(
        &self,
        _context: &Arc<ServerContext>,
        request: &DnsPacket,
        _session: &Session,
    ) -> ReplyAction {
        let question = match request.questions.first() {
            Some(question) => question,
            None => return ReplyAction::Drop,
        };

        let mut packet = DnsPacket::reply_to(request);

        let record = match question.qtype {
            QueryType::A => self.lookup_a(&question.name),
            _ => None,
        };

        packet
            .answers
            .push(record.unwrap_or_else(|| Self::miss_record(&question.name)));

        ReplyAction::Respond(packet)
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::context::tests::create_test_context;
    use crate::dns::handler::TransportKind;
    use crate::dns::protocol::DnsQuestion;

    fn query(qname: &str, qtype: QueryType) -> DnsPacket {
        let mut packet = DnsPacket::new();
        packet.header.id = 7;
        packet
            .questions
            .push(DnsQuestion::new(qname.to_string(), qtype));
        packet
    }

    fn session() -> Session {
        Session::new(TransportKind::Udp, "203.0.113.7:40000".parse().unwrap())
    }

    fn handler_with(rows: &[(&str, &str, u32, &str)]) -> StoreHandler {
        let mut store = MemoryRecordStore::new();
        for (name, rrtype, ttl, rdata) in rows {
            store.insert(name, rrtype, *ttl, rdata);
        }
        StoreHandler::new(Arc::new(store))
    }

    fn answer_of(action: ReplyAction) -> DnsRecord {
        match action {
            ReplyAction::Respond(packet) => {
                assert_eq!(1, packet.answers.len());
                packet.answers[0].clone()
            }
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_hit_builds_a_record() {
        let handler = handler_with(&[("host.db.example.org", "A", 3600, "192.0.2.55")]);
        let context = create_test_context();

        let rec = answer_of(handler.handle(
            &context,
            &query("host.db.example.org", QueryType::A),
            &session(),
        ));

        assert_eq!(
            DnsRecord::A {
                domain: "host.db.example.org".to_string(),
                addr: Ipv4Addr::new(192, 0, 2, 55),
                ttl: TransientTtl(3600),
            },
            rec
        );
    }

    #[test]
    fn test_miss_answers_empty_any() {
        let handler = handler_with(&[]);
        let context = create_test_context();

        let rec = answer_of(handler.handle(
            &context,
            &query("nosuch.db.example.org", QueryType::A),
            &session(),
        ));

        assert_eq!(
            DnsRecord::Any {
                domain: "nosuch.db.example.org".to_string(),
                ttl: TransientTtl(MISS_TTL),
            },
            rec
        );
    }

    #[test]
    fn test_malformed_rdata_is_a_miss_not_a_crash() {
        for bad in &["300.1.2.3", "1.2.3", "1.2.3.4.5", "a.b.c.d", ""] {
            let handler = handler_with(&[("host.db.example.org", "A", 60, bad)]);
            let context = create_test_context();

            let rec = answer_of(handler.handle(
                &context,
                &query("host.db.example.org", QueryType::A),
                &session(),
            ));

            assert_eq!(QueryType::Any, rec.get_querytype(), "rdata {:?}", bad);
        }
    }

    #[test]
    fn test_unsupported_types_fall_back_to_miss() {
        let handler = handler_with(&[("host.db.example.org", "A", 3600, "192.0.2.55")]);
        let context = create_test_context();

        for qtype in &[QueryType::Aaaa, QueryType::Txt, QueryType::Axfr] {
            let rec = answer_of(handler.handle(
                &context,
                &query("host.db.example.org", *qtype),
                &session(),
            ));
            assert_eq!(QueryType::Any, rec.get_querytype());
        }
    }

    #[test]
    fn test_reply_mirrors_question() {
        let handler = handler_with(&[]);
        let context = create_test_context();
        let request = query("x.db.example.org", QueryType::A);

        match handler.handle(&context, &request, &session()) {
            ReplyAction::Respond(packet) => {
                assert_eq!(request.questions, packet.questions);
                assert_eq!(request.header.id, packet.header.id);
                assert!(packet.header.response);
            }
            other => panic!("expected a response, got {:?}", other),
        }
    }
}
