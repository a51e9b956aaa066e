//! Shared test infrastructure for routing and forwarding integration tests.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse};
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, UdpSocket};

use meridian_dns::config::{EdgeConfig, SiteConfig};
use meridian_dns::engine::EdgeEngine;
use meridian_dns::geo::{self, Point};
use meridian_dns::handler::EdgeHandler;
use meridian_dns::policy::PolicyKind;
use meridian_dns::proxy::{Proxy, ProxyOptions};
use meridian_dns::table::{LocalServices, ServiceTable, Site};

// --- Constants ---

pub const OWN_IP: &str = "10.1.2.3";
pub const OWN_POINT: Point = Point { lat: 55.0, lon: 13.0 };
pub const CLIENT_SRC: &str = "192.168.7.9:41953";

// --- TestResponseHandler ---

/// Single-shot capture of the DNS response a handler call emits.
///
/// Every test here drives `RequestHandler::handle_request()` exactly once
/// per request, so the handler stores at most one response; a second
/// `send_response` through the same capture panics. The response is
/// serialized with `MessageResponse::destructive_emit()` and parsed back
/// from wire format for assertions.
#[derive(Clone, Default)]
pub struct TestResponseHandler {
    wire: Arc<OnceLock<Vec<u8>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the captured wire bytes into a `Message` for assertions.
    pub fn into_message(self) -> Message {
        let wire = self.wire.get().expect("no response was captured");
        Message::from_vec(wire).expect("failed to parse captured DNS response")
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut wire = Vec::new();
        let mut encoder = BinEncoder::new(&mut wire);
        encoder.set_max_size(u16::MAX);
        let info = response
            .destructive_emit(&mut encoder)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.wire
            .set(wire)
            .expect("handler emitted more than one response");
        Ok(info)
    }
}

// --- Config / engine builders ---

pub fn test_config() -> EdgeConfig {
    EdgeConfig {
        listen_addr: "127.0.0.1:5353".parse().unwrap(),
        base_domain: ".".to_string(),
        site: SiteConfig {
            ip: OWN_IP.parse().unwrap(),
            coords: OWN_POINT,
        },
        upstreams: Vec::new(),
        policy: PolicyKind::Random,
        except: Vec::new(),
        max_fails: 2,
        expire: 10,
        force_tcp: false,
        timeout: 1,
        dial_timeout: 1,
        health_interval_ms: 60_000,
        tls: None,
        tls_servername: None,
        push_addr: None,
        dns_debug: false,
        service_debug: false,
    }
}

/// Fast timeouts for tests that exercise failing upstreams.
pub fn fast_proxy_opts() -> ProxyOptions {
    ProxyOptions {
        timeout: Duration::from_millis(400),
        dial_timeout: Duration::from_millis(400),
        expire: Duration::from_secs(10),
    }
}

pub fn build_proxy(addr: SocketAddr) -> Arc<Proxy> {
    Proxy::new(addr, None, fast_proxy_opts())
}

pub fn build_handler(
    config: EdgeConfig,
    table: ServiceTable,
    local: LocalServices,
    proxies: Vec<Arc<Proxy>>,
) -> EdgeHandler {
    let engine = EdgeEngine::new(&config, table, local, proxies).expect("failed to build engine");
    EdgeHandler::new(Arc::new(engine))
}

pub fn site(ip: &str, lat: f64, lon: f64) -> Site {
    Site {
        ip: ip.parse().unwrap(),
        coords: Point::new(lat, lon),
    }
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query, optionally tagged with a
/// location marker in the additional section.
pub fn build_query_bytes(
    name: &str,
    record_type: RecordType,
    id: u16,
    marker: Option<Point>,
) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    if let Some(point) = marker {
        msg.add_additional(geo::encode_marker(point));
    }
    msg.to_vec().unwrap()
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` with a crafted source address.
pub fn build_request(bytes: &[u8], src: SocketAddr) -> Request {
    let msg = parse_message_request(bytes);
    Request::new(msg, src, Protocol::Udp)
}

/// Execute a query through the handler and return the parsed response.
pub async fn execute_query(
    handler: &EdgeHandler,
    name: &str,
    record_type: RecordType,
    marker: Option<Point>,
) -> Message {
    let bytes = build_query_bytes(name, record_type, 7321, marker);
    let request = build_request(&bytes, CLIENT_SRC.parse().unwrap());
    let capture = TestResponseHandler::new();
    handler.handle_request(&request, capture.clone()).await;
    capture.into_message()
}

// --- Response helpers ---

/// Extract A addresses from a response.
pub fn extract_a_ips(msg: &Message) -> Vec<std::net::Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(std::net::Ipv4Addr::from(*a)),
            _ => None,
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

/// Assert an authoritative single-answer A response with the expected IP.
pub fn assert_authoritative_a(msg: &Message, expected_ip: &str) {
    assert_response_code(msg, ResponseCode::NoError);
    assert!(msg.authoritative(), "AA flag not set");
    let ips = extract_a_ips(msg);
    assert_eq!(ips.len(), 1, "expected exactly one A answer: {:?}", ips);
    assert_eq!(ips[0], expected_ip.parse::<std::net::Ipv4Addr>().unwrap());
}

// --- Mock upstream servers ---

/// Queries received by a mock upstream, as parsed messages.
pub type ReceivedQueries = Arc<Mutex<Vec<Message>>>;

fn answer_for(query: &Message, answer_ip: std::net::Ipv4Addr) -> Message {
    let mut reply = Message::new();
    reply.set_id(query.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(query.op_code());
    reply.set_recursion_desired(query.recursion_desired());
    reply.set_recursion_available(true);
    reply.set_response_code(ResponseCode::NoError);
    for q in query.queries() {
        reply.add_query(q.clone());

        let mut record = Record::from_rdata(q.name().clone(), 30, RData::A(answer_ip.into()));
        record.set_dns_class(DNSClass::IN);
        reply.add_answer(record);
    }
    reply
}

/// Spawn a UDP upstream that answers every query with one A record and
/// records the queries it received.
pub async fn spawn_answering_upstream(
    answer_ip: std::net::Ipv4Addr,
) -> (SocketAddr, ReceivedQueries) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let received: ReceivedQueries = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&received);
    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((n, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = Message::from_vec(&buf[..n]) else {
                continue;
            };
            let reply = answer_for(&query, answer_ip);
            seen.lock().unwrap().push(query);
            let _ = socket.send_to(&reply.to_vec().unwrap(), src).await;
        }
    });

    (addr, received)
}

/// Spawn a UDP upstream that answers with the wrong question name, to
/// exercise reply validation.
pub async fn spawn_mismatching_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((n, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let Ok(query) = Message::from_vec(&buf[..n]) else {
                continue;
            };
            let mut reply = Message::new();
            reply.set_id(query.id());
            reply.set_message_type(MessageType::Response);
            reply.set_response_code(ResponseCode::NoError);
            reply.add_query(Query::query(
                Name::from_ascii("unrelated.example.").unwrap(),
                RecordType::A,
            ));
            let _ = socket.send_to(&reply.to_vec().unwrap(), src).await;
        }
    });

    addr
}

/// Spawn a UDP upstream that answers probes with garbage bytes, driving the
/// failure counter up.
pub async fn spawn_garbage_upstream() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();

    tokio::spawn(async move {
        let mut buf = [0u8; 4096];
        loop {
            let Ok((_, src)) = socket.recv_from(&mut buf).await else {
                return;
            };
            let _ = socket.send_to(&[0xba, 0xad], src).await;
        }
    });

    addr
}

/// Spawn a TCP upstream that closes its first connection without replying
/// (EOF for the client) and answers correctly on every later connection.
pub async fn spawn_eof_then_answering_tcp_upstream(
    answer_ip: std::net::Ipv4Addr,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        let mut first = true;
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            if first {
                first = false;
                // Read the request, then slam the connection shut.
                let mut len_buf = [0u8; 2];
                let _ = stream.read_exact(&mut len_buf).await;
                let len = u16::from_be_bytes(len_buf) as usize;
                let mut body = vec![0u8; len];
                let _ = stream.read_exact(&mut body).await;
                drop(stream);
                continue;
            }

            tokio::spawn(async move {
                loop {
                    let mut len_buf = [0u8; 2];
                    if stream.read_exact(&mut len_buf).await.is_err() {
                        return;
                    }
                    let len = u16::from_be_bytes(len_buf) as usize;
                    let mut body = vec![0u8; len];
                    if stream.read_exact(&mut body).await.is_err() {
                        return;
                    }
                    let Ok(query) = Message::from_vec(&body) else {
                        return;
                    };
                    let reply = answer_for(&query, answer_ip).to_vec().unwrap();
                    let frame_len = (reply.len() as u16).to_be_bytes();
                    if stream.write_all(&frame_len).await.is_err() {
                        return;
                    }
                    if stream.write_all(&reply).await.is_err() {
                        return;
                    }
                    let _ = stream.flush().await;
                }
            });
        }
    });

    addr
}
