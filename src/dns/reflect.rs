//! The reflection responder
//!
//! Answers every query with the address the query came from, as seen by the
//! server. The session's address family, not the query type, decides whether
//! the self record is an A or an AAAA; the port and transport go into a TXT
//! record. Queried for TXT the two records swap sections. All reflected
//! records carry TTL 0 since the answer is only true for this one client
//! right now.

use std::net::IpAddr;
use std::sync::Arc;

use crate::dns::context::ServerContext;
use crate::dns::handler::{QueryHandler, ReplyAction, Session, TransportKind};
use crate::dns::protocol::{DnsPacket, DnsRecord, QueryType, TransientTtl};
use crate::dns::transfer::build_transfer_envelope;
use crate::dns::tsig;

/// A progress line is logged every this many reflections
const PROGRESS_INTERVAL: usize = 1000;

/// Handler for the reflection zone
#[derive(Default)]
pub struct ReflectHandler;

impl ReflectHandler {
    pub fn new() -> ReflectHandler {
        ReflectHandler
    }

    /// The self record: exactly one of A or AAAA, picked by the session's
    /// address family
    fn address_record(domain: &str, ip: IpAddr) -> DnsRecord {
        match ip {
            IpAddr::V4(addr) => DnsRecord::A {
                domain: domain.to_string(),
                addr,
                ttl: TransientTtl(0),
            },
            IpAddr::V6(addr) => DnsRecord::Aaaa {
                domain: domain.to_string(),
                addr,
                ttl: TransientTtl(0),
            },
        }
    }

    fn txt_record(domain: &str, session: &Session) -> DnsRecord {
        DnsRecord::Txt {
            domain: domain.to_string(),
            data: format!(
                "Port: {} ({})",
                session.remote_port(),
                session.transport.label()
            ),
            ttl: TransientTtl(0),
        }
    }

    /// Verify the request signature if there is one, then sign the reply.
    /// Verification failure is logged and leaves the reply unsigned; it
    /// never blocks the reply itself.
    fn apply_tsig(context: &Arc<ServerContext>, request: &DnsPacket, packet: &mut DnsPacket) {
        if context.tsig_keys.is_empty() {
            return;
        }

        let now = tsig::unix_now();

        if request.tsig_record().is_some() {
            if let Err(status) = tsig::verify_packet(request, &context.tsig_keys, now) {
                log::warn!("Tsig status: {}", status);
                return;
            }
        }

        if let Some((name, secret)) = context.tsig_keys.signing_key() {
            let (name, secret) = (name.to_string(), secret.to_vec());
            if let Err(e) = tsig::sign_packet(packet, &name, &secret, now) {
                log::warn!("Failed to sign reply: {}", e);
            }
        }
    }
}

impl QueryHandler for ReflectHandler {
    fn handle(
        &self,
        context: &Arc<ServerContext>,
        request: &DnsPacket,
        session: &Session,
    ) -> ReplyAction {
        let question = match request.questions.first() {
            Some(question) => question,
            None => return ReplyAction::Drop,
        };

        let served = context.statistics.count_reflection();
        if served % PROGRESS_INTERVAL == 0 {
            log::info!("Served {} reflections", served);
        }

        let addr_rr = Self::address_record(&context.reflect_domain, session.remote_ip());
        let txt_rr = Self::txt_record(&context.reflect_domain, session);

        if question.qtype.is_transfer() {
            if session.transport != TransportKind::Tcp {
                log::info!(
                    "Ignoring {:?} from {} over udp",
                    question.qtype,
                    session.remote
                );
                return ReplyAction::Drop;
            }

            return ReplyAction::Transfer(build_transfer_envelope(
                request,
                &context.reflect_domain,
                txt_rr,
                addr_rr,
            ));
        }

        let mut packet = DnsPacket::reply_to(request);

        match question.qtype {
            QueryType::Txt => {
                packet.answers.push(txt_rr);
                packet.resources.push(addr_rr);
            }
            // A, AAAA and anything we don't recognize all get the address
            // up front; the client asked where it is, not what we support
            _ => {
                packet.answers.push(addr_rr);
                packet.resources.push(txt_rr);
            }
        }

        Self::apply_tsig(context, request, &mut packet);

        if context.print_replies {
            log::info!("{}", packet);
        }

        if question.name == context.truncation_test_domain {
            packet.header.truncated_message = true;
            return ReplyAction::RespondHalf(packet);
        }

        ReplyAction::Respond(packet)
    }
}
