//! UDP and TCP server implementations
//!
//! Both listeners share the same shape: decode the query, look up a handler
//! for the queried name, and put the returned `ReplyAction` on the wire. UDP
//! reads on a single thread and hands parsed queries to a worker pool; TCP
//! spreads accepted connections over a fixed set of worker threads.

use std::collections::VecDeque;
use std::io::Write;
use std::net::SocketAddr;
use std::net::{Shutdown, TcpListener, TcpStream, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::mpsc::{channel, Sender};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::Builder;

use derive_more::{Display, Error, From};
use rand::random;

use crate::dns::buffer::{BytePacketBuffer, StreamPacketBuffer, VectorPacketBuffer};
use crate::dns::context::ServerContext;
use crate::dns::handler::{ReplyAction, Session, TransportKind};
use crate::dns::netutil::{read_packet_length, write_packet_length};
use crate::dns::protocol::{DnsPacket, ResultCode};
use crate::dns::transfer::stream_transfer;

#[derive(Debug, Display, From, Error)]
pub enum ServerError {
    Io(std::io::Error),
}

type Result<T> = std::result::Result<T, ServerError>;

/// Datagram replies never exceed the plain DNS message size
const UDP_REPLY_LIMIT: usize = 512;

macro_rules! return_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(res) => res,
            Err(_) => {
                log::info!($message);
                return;
            }
        }
    };
}

macro_rules! ignore_or_report {
    ( $x:expr, $message:expr ) => {
        match $x {
            Ok(_) => {}
            Err(_) => {
                log::info!($message);
                return;
            }
        };
    };
}

/// Common trait for DNS servers
pub trait DnsServer {
    /// Initialize the server and start listenening
    ///
    /// This method should _NOT_ block. Rather, servers are expected to spawn a new
    /// thread to handle requests and return immediately.
    fn run_server(self) -> Result<()>;
}

/// Route a query to the handler registered for its zone
///
/// Queries without a question get FORMERR, queries for names outside every
/// registered zone get REFUSED. Everything else is the matched handler's
/// decision.
pub fn dispatch_query(
    context: &Arc<ServerContext>,
    request: &DnsPacket,
    session: &Session,
) -> ReplyAction {
    let question = match request.questions.first() {
        Some(question) => question,
        None => {
            let mut packet = DnsPacket::reply_to(request);
            packet.header.rescode = ResultCode::FORMERR;
            return ReplyAction::Respond(packet);
        }
    };

    match context.handlers.find(&question.name) {
        Some(handler) => handler.handle(context, request, session),
        None => {
            log::info!("No zone matches {}, refusing", question.name);
            let mut packet = DnsPacket::reply_to(request);
            packet.header.rescode = ResultCode::REFUSED;
            ReplyAction::Respond(packet)
        }
    }
}

/// The UDP server
///
/// Accepts DNS queries through UDP, and uses the `ServerContext` to determine
/// how to service the request. Packets are read on a single thread, after which
/// a new thread is spawned to service the request asynchronously.
pub struct DnsUdpServer {
    context: Arc<ServerContext>,
    request_queue: Arc<Mutex<VecDeque<(SocketAddr, DnsPacket)>>>,
    request_cond: Arc<Condvar>,
    thread_count: usize,
}

impl DnsUdpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DnsUdpServer {
        DnsUdpServer {
            context,
            request_queue: Arc::new(Mutex::new(VecDeque::new())),
            request_cond: Arc::new(Condvar::new()),
            thread_count,
        }
    }

    /// Handle a single parsed query and send whatever the handler decided on
    fn process_request(
        socket: &UdpSocket,
        context: Arc<ServerContext>,
        src: SocketAddr,
        request: &DnsPacket,
    ) {
        let session = Session::new(TransportKind::Udp, src);

        match dispatch_query(&context, request, &session) {
            ReplyAction::Respond(mut packet) => {
                let data = return_or_report!(
                    packet.to_bytes(context.compress_replies, UDP_REPLY_LIMIT),
                    "Failed to write response packet"
                );
                ignore_or_report!(socket.send_to(&data, src), "Failed to send response packet");
            }
            ReplyAction::RespondHalf(mut packet) => {
                // serialize in full, transmit only the front half
                let data = return_or_report!(
                    packet.to_bytes(context.compress_replies, UDP_REPLY_LIMIT),
                    "Failed to write response packet"
                );
                ignore_or_report!(
                    socket.send_to(&data[..data.len() / 2], src),
                    "Failed to send response packet"
                );
            }
            ReplyAction::Transfer(_) => {
                log::info!("Ignoring zone transfer over udp from {}", src);
            }
            ReplyAction::Drop => {}
        }
    }

    /// Spawn a worker thread to handle DNS requests
    fn spawn_request_handler(&self, thread_id: usize, socket: UdpSocket) -> std::io::Result<()> {
        let context = self.context.clone();
        let request_cond = self.request_cond.clone();
        let request_queue = self.request_queue.clone();

        let name = format!("DnsUdpServer-request-{}", thread_id);

        Builder::new().name(name).spawn(move || {
            loop {
                // Acquire lock, and wait on the condition until data is available
                let (src, request) = match request_queue
                    .lock()
                    .ok()
                    .and_then(|x| request_cond.wait(x).ok())
                    .and_then(|mut x| x.pop_front())
                {
                    Some(x) => x,
                    None => continue,
                };

                Self::process_request(&socket, context.clone(), src, &request);
            }
        })?;

        Ok(())
    }

    /// Read one datagram off the socket and parse it, going through the
    /// buffer pool when pooling is enabled
    fn receive_query(&self, socket: &UdpSocket) -> Option<(SocketAddr, DnsPacket)> {
        if self.context.enable_pooling {
            let mut buf = self.context.buffer_pool.acquire();
            let received = socket.recv_from(&mut buf);

            let parsed = received.map(|(_, src)| {
                let mut req_buffer = VectorPacketBuffer::from_bytes(&buf);
                (src, DnsPacket::from_buffer(&mut req_buffer))
            });

            // The receive buffer is done either way
            self.context.buffer_pool.release(buf);

            match parsed {
                Ok((src, Ok(request))) => Some((src, request)),
                Ok((_, Err(e))) => {
                    log::info!("Failed to parse UDP query packet: {:?}", e);
                    None
                }
                Err(e) => {
                    log::info!("Failed to read from UDP socket: {:?}", e);
                    None
                }
            }
        } else {
            let mut req_buffer = BytePacketBuffer::new();
            let src = match socket.recv_from(&mut req_buffer.buf) {
                Ok((_, src)) => src,
                Err(e) => {
                    log::info!("Failed to read from UDP socket: {:?}", e);
                    return None;
                }
            };

            match DnsPacket::from_buffer(&mut req_buffer) {
                Ok(request) => Some((src, request)),
                Err(e) => {
                    log::info!("Failed to parse UDP query packet: {:?}", e);
                    None
                }
            }
        }
    }

    /// Spawn the main incoming request handler thread
    fn spawn_incoming_handler(self, socket: UdpSocket) -> std::io::Result<()> {
        Builder::new()
            .name("DnsUdpServer-incoming".into())
            .spawn(move || loop {
                let (src, request) = match self.receive_query(&socket) {
                    Some(x) => x,
                    None => continue,
                };

                let _ = self
                    .context
                    .statistics
                    .udp_query_count
                    .fetch_add(1, Ordering::Release);

                // Add request to queue and notify waiting threads
                self.enqueue_request(src, request);
            })?;

        Ok(())
    }

    /// Add a request to the queue and notify waiting threads
    fn enqueue_request(&self, src: SocketAddr, request: DnsPacket) {
        match self.request_queue.lock() {
            Ok(mut queue) => {
                queue.push_back((src, request));
                self.request_cond.notify_one();
            }
            Err(e) => {
                log::info!("Failed to send UDP request for processing: {}", e);
            }
        }
    }
}

impl DnsServer for DnsUdpServer {
    /// Launch the server
    ///
    /// This method takes ownership of the server, preventing the method from
    /// being called multiple times.
    fn run_server(self) -> Result<()> {
        // Bind the socket
        let socket = UdpSocket::bind(("0.0.0.0", self.context.dns_port))?;

        // Spawn worker threads for handling requests
        for thread_id in 0..self.thread_count {
            let socket_clone = match socket.try_clone() {
                Ok(x) => x,
                Err(e) => {
                    log::info!("Failed to clone socket when starting UDP server: {:?}", e);
                    continue;
                }
            };

            self.spawn_request_handler(thread_id, socket_clone)?;
        }

        // Start servicing incoming requests
        self.spawn_incoming_handler(socket)?;

        Ok(())
    }
}

/// TCP DNS server
pub struct DnsTcpServer {
    context: Arc<ServerContext>,
    senders: Vec<Sender<TcpStream>>,
    thread_count: usize,
}

impl DnsTcpServer {
    pub fn new(context: Arc<ServerContext>, thread_count: usize) -> DnsTcpServer {
        DnsTcpServer {
            context,
            senders: Vec::new(),
            thread_count,
        }
    }

    /// Handle one accepted connection: a single framed query, then whatever
    /// the handler's verdict calls for
    fn handle_connection(context: Arc<ServerContext>, mut stream: TcpStream) {
        let _ = context
            .statistics
            .tcp_query_count
            .fetch_add(1, Ordering::Release);

        let peer = return_or_report!(stream.peer_addr(), "Failed to read peer address");
        let session = Session::new(TransportKind::Tcp, peer);

        // When DNS packets are sent over TCP, they're prefixed with a two byte
        // length. We don't really need to know the length in advance, so we
        // just move past it and continue reading as usual
        ignore_or_report!(
            read_packet_length(&mut stream),
            "Failed to read query packet length"
        );

        let request = {
            let mut stream_buffer = StreamPacketBuffer::new(&mut stream);
            return_or_report!(
                DnsPacket::from_buffer(&mut stream_buffer),
                "Failed to read query packet"
            )
        };

        match dispatch_query(&context, &request, &session) {
            ReplyAction::Respond(mut packet) => {
                let data = return_or_report!(
                    packet.to_bytes(context.compress_replies, 0xFFFF),
                    "Failed to write packet to buffer"
                );
                Self::send_frame(&mut stream, &data);
                ignore_or_report!(stream.shutdown(Shutdown::Both), "Failed to shutdown socket");
            }
            ReplyAction::RespondHalf(mut packet) => {
                let data = return_or_report!(
                    packet.to_bytes(context.compress_replies, 0xFFFF),
                    "Failed to write packet to buffer"
                );
                Self::send_frame(&mut stream, &data[..data.len() / 2]);
                ignore_or_report!(stream.shutdown(Shutdown::Both), "Failed to shutdown socket");
            }
            ReplyAction::Transfer(packets) => {
                // ownership of the connection moves to the streamer; it is
                // not ours to shut down any more
                match stream_transfer(stream, packets, context.compress_replies) {
                    Ok(owned) => owned.close_when_client_done(),
                    Err((stream, e)) => {
                        log::info!("Zone transfer to {} failed: {}", peer, e);
                        let _ = stream.shutdown(Shutdown::Both);
                    }
                }
            }
            ReplyAction::Drop => {
                ignore_or_report!(stream.shutdown(Shutdown::Both), "Failed to shutdown socket");
            }
        }
    }

    fn send_frame(stream: &mut TcpStream, data: &[u8]) {
        ignore_or_report!(
            write_packet_length(stream, data.len()),
            "Failed to write packet size"
        );
        ignore_or_report!(stream.write_all(data), "Failed to write response packet");
    }
}

impl DnsServer for DnsTcpServer {
    fn run_server(mut self) -> Result<()> {
        let socket = TcpListener::bind(("0.0.0.0", self.context.dns_port))?;

        // Spawn threads for handling requests, and create the channels
        for thread_id in 0..self.thread_count {
            let (tx, rx) = channel();
            self.senders.push(tx);

            let context = self.context.clone();

            let name = "DnsTcpServer-request-".to_string() + &thread_id.to_string();
            Builder::new().name(name).spawn(move || loop {
                let stream = match rx.recv() {
                    Ok(x) => x,
                    Err(_) => continue,
                };

                Self::handle_connection(context.clone(), stream);
            })?;
        }

        Builder::new()
            .name("DnsTcpServer-incoming".into())
            .spawn(move || {
                for wrap_stream in socket.incoming() {
                    let stream = match wrap_stream {
                        Ok(stream) => stream,
                        Err(err) => {
                            log::info!("Failed to accept TCP connection: {:?}", err);
                            continue;
                        }
                    };

                    // Hand it off to a worker thread
                    let thread_no = random::<usize>() % self.thread_count;
                    match self.senders[thread_no].send(stream) {
                        Ok(_) => {}
                        Err(e) => {
                            log::info!(
                                "Failed to send TCP request for processing on thread {}: {}",
                                thread_no,
                                e
                            );
                        }
                    }
                }
            })?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use std::io::Read;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    use crate::dns::context::tests::create_test_context;
    use crate::dns::context::{ServerContext, REFLECT_ZONE};
    use crate::dns::protocol::{DnsQuestion, DnsRecord, QueryType};
    use crate::dns::reflect::ReflectHandler;

    fn build_query(qname: &str, qtype: QueryType) -> DnsPacket {
        let mut query_packet = DnsPacket::new();
        query_packet.header.id = 1337;
        query_packet.header.recursion_desired = true;

        query_packet
            .questions
            .push(DnsQuestion::new(qname.into(), qtype));

        query_packet
    }

    fn session() -> Session {
        Session::new(TransportKind::Udp, "203.0.113.7:40000".parse().unwrap())
    }

    fn reflect_context(port: u16) -> Arc<ServerContext> {
        let mut context = ServerContext::new();
        context.dns_port = port;
        context
            .handlers
            .register(REFLECT_ZONE, Arc::new(ReflectHandler::new()));
        Arc::new(context)
    }

    // grabbing an ephemeral port and releasing it before the server binds
    // leaves a small race window, which is fine for a test
    fn free_port() -> u16 {
        UdpSocket::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap()
            .port()
    }

    #[test]
    fn test_dispatch_without_question_is_formerr() {
        let context = create_test_context();
        let request = DnsPacket::new();

        match dispatch_query(&context, &request, &session()) {
            ReplyAction::Respond(packet) => {
                assert_eq!(ResultCode::FORMERR, packet.header.rescode)
            }
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_outside_every_zone_is_refused() {
        let context = reflect_context(0);
        let request = build_query("example.com", QueryType::A);

        match dispatch_query(&context, &request, &session()) {
            ReplyAction::Respond(packet) => {
                assert_eq!(ResultCode::REFUSED, packet.header.rescode);
                assert_eq!(1337, packet.header.id);
            }
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_dispatch_routes_to_registered_handler() {
        let context = reflect_context(0);
        let request = build_query("whoami.example.org", QueryType::A);

        match dispatch_query(&context, &request, &session()) {
            ReplyAction::Respond(packet) => {
                assert_eq!(1, packet.answers.len());
                assert_eq!(1, context.statistics.get_reflect_count());
            }
            other => panic!("expected a response, got {:?}", other),
        }
    }

    #[test]
    fn test_udp_server_end_to_end() {
        let context = reflect_context(free_port());
        let port = context.dns_port;

        DnsUdpServer::new(context, 2).run_server().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let client_port = client.local_addr().unwrap().port();

        let mut query = build_query("whoami.example.org", QueryType::A);
        let data = query.to_bytes(false, UDP_REPLY_LIMIT).unwrap();
        client.send_to(&data, ("127.0.0.1", port)).unwrap();

        let mut response = [0; 512];
        let (len, _) = client.recv_from(&mut response).unwrap();

        let mut buffer = VectorPacketBuffer::from_bytes(&response[..len]);
        let packet = DnsPacket::from_buffer(&mut buffer).unwrap();

        assert_eq!(1337, packet.header.id);
        assert_eq!(
            vec![DnsRecord::A {
                domain: "whoami.example.org".to_string(),
                addr: Ipv4Addr::new(127, 0, 0, 1),
                ttl: crate::dns::protocol::TransientTtl(0),
            }],
            packet.answers
        );
        match &packet.resources[0] {
            DnsRecord::Txt { data, .. } => {
                assert_eq!(&format!("Port: {} (udp)", client_port), data)
            }
            other => panic!("expected TXT, got {:?}", other),
        }
    }

    #[test]
    fn test_tcp_server_end_to_end() {
        let context = reflect_context(free_port());
        let port = context.dns_port;

        DnsTcpServer::new(context, 2).run_server().unwrap();

        let mut client = loop {
            match TcpStream::connect(("127.0.0.1", port)) {
                Ok(stream) => break stream,
                Err(_) => std::thread::sleep(Duration::from_millis(10)),
            }
        };
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let client_port = client.local_addr().unwrap().port();

        let mut query = build_query("whoami.example.org", QueryType::Txt);
        let data = query.to_bytes(false, 0xFFFF).unwrap();
        write_packet_length(&mut client, data.len()).unwrap();
        client.write_all(&data).unwrap();

        let len = read_packet_length(&mut client).unwrap() as usize;
        let mut raw = vec![0; len];
        client.read_exact(&mut raw).unwrap();

        let mut buffer = VectorPacketBuffer::from_bytes(&raw);
        let packet = DnsPacket::from_buffer(&mut buffer).unwrap();

        // TXT query, so the sections are swapped
        match &packet.answers[0] {
            DnsRecord::Txt { data, .. } => {
                assert_eq!(&format!("Port: {} (tcp)", client_port), data)
            }
            other => panic!("expected TXT, got {:?}", other),
        }
        match &packet.resources[0] {
            DnsRecord::A { addr, .. } => assert_eq!(Ipv4Addr::new(127, 0, 0, 1), *addr),
            other => panic!("expected A, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_reply_is_half_the_serialized_length() {
        let context = reflect_context(free_port());
        let port = context.dns_port;

        DnsUdpServer::new(context.clone(), 2).run_server().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();

        let mut query = build_query("tc.example.org", QueryType::A);
        let data = query.to_bytes(false, UDP_REPLY_LIMIT).unwrap();
        client.send_to(&data, ("127.0.0.1", port)).unwrap();

        let mut response = [0; 512];
        let (len, _) = client.recv_from(&mut response).unwrap();

        // rebuild what the full reply would have been and compare lengths
        let session = Session::new(
            TransportKind::Udp,
            client.local_addr().unwrap(),
        );
        let request = build_query("tc.example.org", QueryType::A);
        let full = match dispatch_query(&context, &request, &session) {
            ReplyAction::RespondHalf(mut packet) => {
                packet.to_bytes(false, UDP_REPLY_LIMIT).unwrap()
            }
            other => panic!("expected a half response, got {:?}", other),
        };

        assert_eq!(full.len() / 2, len);

        // the TC bit survives even in the front half
        assert_eq!(0x02, response[2] & 0x02);
    }
}
