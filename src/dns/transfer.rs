//! Zone transfer (AXFR/IXFR) streaming for the reflection zone
//!
//! The served "zone" is minimal and synthetic: one envelope of
//! [SOA, TXT self description, address record, SOA], the doubled SOA marking
//! transfer start and end. Transfers only run over TCP; the streamer takes
//! ownership of the connection for the duration and keeps it afterwards, so
//! the listener must not close it. The client hangs up when it has read the
//! closing SOA.

use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use derive_more::{Display, Error, From};

use crate::dns::netutil::write_packet_length;
use crate::dns::protocol::{DnsPacket, DnsRecord, TransientTtl};

#[derive(Debug, Display, From, Error)]
pub enum TransferError {
    Protocol(crate::dns::protocol::ProtocolError),
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, TransferError>;

/// How long to wait for the client to hang up before giving up on it
const CLIENT_CLOSE_TIMEOUT: Duration = Duration::from_secs(30);

/// The fixed SOA bracketing every transfer of the reflection zone
pub fn synthetic_soa(domain: &str) -> DnsRecord {
    DnsRecord::Soa {
        domain: domain.to_string(),
        m_name: "ns1.example.org".to_string(),
        r_name: "hostmaster.example.org".to_string(),
        serial: 2009032802,
        refresh: 21600,
        retry: 7200,
        expire: 604800,
        minimum: 3600,
        ttl: TransientTtl(0),
    }
}

/// Build the single envelope answering an AXFR or IXFR request
///
/// `txt` and `addr` are the same self describing records a reflection reply
/// would carry.
pub fn build_transfer_envelope(
    request: &DnsPacket,
    domain: &str,
    txt: DnsRecord,
    addr: DnsRecord,
) -> Vec<DnsPacket> {
    let soa = synthetic_soa(domain);

    let mut packet = DnsPacket::reply_to(request);
    packet.header.authoritative_answer = true;
    packet.answers.push(soa.clone());
    packet.answers.push(txt);
    packet.answers.push(addr);
    packet.answers.push(soa);

    vec![packet]
}

/// Marker for a connection whose ownership has moved from the listener to
/// the zone transfer streamer
///
/// Holding this value is holding the socket: the listener got nothing back
/// and must not touch the connection again. The streamer closes it once the
/// client is done reading, by dropping the wrapped stream.
pub struct StreamerOwned {
    stream: TcpStream,
}

impl StreamerOwned {
    /// Block until the client hangs up (or a generous timeout expires),
    /// then let the socket close on drop
    pub fn close_when_client_done(mut self) {
        let _ = self.stream.set_read_timeout(Some(CLIENT_CLOSE_TIMEOUT));

        let mut scratch = [0; 64];
        loop {
            match self.stream.read(&mut scratch) {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}

/// Stream a transfer over `stream`, taking ownership of the connection
///
/// All packets are serialized before anything is written: if any of them
/// fails to build, the transfer is aborted silently and the untouched
/// connection is handed back for normal handling. On success the connection
/// stays with the streamer.
pub fn stream_transfer(
    mut stream: TcpStream,
    packets: Vec<DnsPacket>,
    compress: bool,
) -> std::result::Result<StreamerOwned, (TcpStream, TransferError)> {
    let mut frames = Vec::with_capacity(packets.len());
    for mut packet in packets {
        match packet.to_bytes(compress, 0xFFFF) {
            Ok(frame) => frames.push(frame),
            Err(e) => return Err((stream, e.into())),
        }
    }

    for frame in &frames {
        if let Err(e) = write_frame(&mut stream, frame) {
            return Err((stream, e));
        }
    }

    Ok(StreamerOwned { stream })
}

fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<()> {
    write_packet_length(stream, frame.len())?;
    stream.write_all(frame)?;

    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::dns::buffer::{PacketBuffer, VectorPacketBuffer};
    use crate::dns::netutil::read_packet_length;
    use crate::dns::protocol::{DnsQuestion, QueryType};
    use std::net::{Ipv4Addr, TcpListener};
    use std::thread;

    fn test_records() -> (DnsRecord, DnsRecord) {
        let txt = DnsRecord::Txt {
            domain: "whoami.example.org".to_string(),
            data: "Port: 40000 (tcp)".to_string(),
            ttl: TransientTtl(0),
        };
        let addr = DnsRecord::A {
            domain: "whoami.example.org".to_string(),
            addr: Ipv4Addr::new(203, 0, 113, 7),
            ttl: TransientTtl(0),
        };
        (txt, addr)
    }

    fn axfr_request() -> DnsPacket {
        let mut request = DnsPacket::new();
        request.header.id = 77;
        request
            .questions
            .push(DnsQuestion::new("whoami.example.org".to_string(), QueryType::Axfr));
        request
    }

    #[test]
    fn test_envelope_is_soa_bracketed() {
        let (txt, addr) = test_records();
        let packets = build_transfer_envelope(&axfr_request(), "whoami.example.org", txt, addr);

        assert_eq!(1, packets.len());
        let answers = &packets[0].answers;
        assert_eq!(4, answers.len());

        // identical SOA front and back, exactly TXT and address in between
        assert_eq!(answers[0], answers[3]);
        assert_eq!(QueryType::Soa, answers[0].get_querytype());
        assert_eq!(QueryType::Txt, answers[1].get_querytype());
        assert_eq!(QueryType::A, answers[2].get_querytype());

        assert_eq!(77, packets[0].header.id);
        assert!(packets[0].header.response);
    }

    #[test]
    fn test_stream_transfer_over_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let (txt, a) = test_records();
            let packets = build_transfer_envelope(&axfr_request(), "whoami.example.org", txt, a);

            let owned = match stream_transfer(stream, packets, false) {
                Ok(owned) => owned,
                Err((_, e)) => panic!("transfer failed: {}", e),
            };
            owned.close_when_client_done();
        });

        let mut client = TcpStream::connect(addr).unwrap();

        let len = read_packet_length(&mut client).unwrap() as usize;
        let mut raw = vec![0; len];
        client.read_exact(&mut raw).unwrap();

        let mut buffer = VectorPacketBuffer::from_bytes(&raw);
        buffer.seek(0).unwrap();
        let packet = DnsPacket::from_buffer(&mut buffer).unwrap();

        assert_eq!(4, packet.answers.len());
        assert_eq!(packet.answers[0], packet.answers[3]);

        // client closes first; the streamer then lets go of the socket
        drop(client);
        server.join().unwrap();
    }

    #[test]
    fn test_failed_transfer_releases_the_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();

        // client is gone before we stream; writing enough data eventually
        // errors and the connection comes back for normal handling
        drop(client);
        stream.shutdown(std::net::Shutdown::Both).unwrap();

        let (txt, a) = test_records();
        let packets = build_transfer_envelope(&axfr_request(), "whoami.example.org", txt, a);

        // the write fails and the connection comes back for normal handling
        assert!(stream_transfer(stream, packets, false).is_err());
    }
}
