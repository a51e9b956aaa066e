//! One upstream DNS resolver: pooled transports, failure tracking, and the
//! liveness probe loop.
//!
//! A proxy starts in `idle`, moves to `probing` on [`Proxy::start`] (probe
//! loop and pool reaper running, dials accepted) and to `stopped` on
//! [`Proxy::stop`] (pool drained, all operations refused).

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use rand::Rng;
use rustls::pki_types::ServerName;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TlsConfig;
use crate::error::EdgeError;
use crate::metrics;
use crate::pool::{Conn, ConnPool, Proto};

/// Hard floor on the UDP receive buffer.
const MIN_UDP_SIZE: u16 = 512;

/// Timeouts and pool settings shared by all proxies.
#[derive(Debug, Clone, Copy)]
pub struct ProxyOptions {
    /// Per-call read and write deadline.
    pub timeout: Duration,
    /// Deadline for establishing a fresh connection.
    pub dial_timeout: Duration,
    /// Idle-pool eviction window.
    pub expire: Duration,
}

/// TLS client material shared by all `tls://` upstreams.
#[derive(Clone)]
pub struct TlsSettings {
    connector: TlsConnector,
    server_name: ServerName<'static>,
}

impl TlsSettings {
    /// Build the TLS client state. With no [`TlsConfig`] the webpki root set
    /// is trusted and no client certificate is presented.
    pub fn new(config: Option<&TlsConfig>, server_name: &str) -> Result<Self, EdgeError> {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut root_store = rustls::RootCertStore::empty();
        match config {
            Some(tls) => {
                let ca_pem = std::fs::read(&tls.ca)?;
                for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
                    let cert = cert.map_err(|e| EdgeError::Tls(format!("bad CA bundle: {e}")))?;
                    root_store
                        .add(cert)
                        .map_err(|e| EdgeError::Tls(format!("bad CA certificate: {e}")))?;
                }
            }
            None => {
                root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            }
        }

        let builder = rustls::ClientConfig::builder().with_root_certificates(root_store);
        let client_config = match config {
            Some(tls) => {
                let cert_pem = std::fs::read(&tls.cert)?;
                let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| EdgeError::Tls(format!("bad client certificate: {e}")))?;
                let key_pem = std::fs::read(&tls.key)?;
                let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                    .map_err(|e| EdgeError::Tls(format!("bad client key: {e}")))?
                    .ok_or_else(|| EdgeError::Tls("no private key found".to_string()))?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| EdgeError::Tls(e.to_string()))?
            }
            None => builder.with_no_client_auth(),
        };

        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| EdgeError::Tls(format!("invalid TLS server name: {e}")))?;

        Ok(Self {
            connector: TlsConnector::from(Arc::new(client_config)),
            server_name,
        })
    }
}

/// One upstream DNS endpoint plus its pool, failure counter, and probe loop.
pub struct Proxy {
    addr: SocketAddr,
    tls: Option<TlsSettings>,
    pool: ConnPool,
    fails: AtomicU32,
    probing: AtomicBool,
    opts: ProxyOptions,
    stop: CancellationToken,
}

impl Proxy {
    /// Create a proxy for `addr`. `tls` selects DNS over TLS for every
    /// stream connection to this upstream.
    pub fn new(addr: SocketAddr, tls: Option<TlsSettings>, opts: ProxyOptions) -> Arc<Self> {
        Arc::new(Self {
            addr,
            tls,
            pool: ConnPool::new(opts.expire),
            fails: AtomicU32::new(0),
            probing: AtomicBool::new(false),
            opts,
            stop: CancellationToken::new(),
        })
    }

    /// Socket address of this upstream.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether this upstream speaks DNS over TLS.
    pub fn is_tls(&self) -> bool {
        self.tls.is_some()
    }

    /// Current consecutive-failure count.
    pub fn fails(&self) -> u32 {
        self.fails.load(Ordering::Relaxed)
    }

    /// True when the failure counter has reached `threshold`. A threshold of
    /// zero disables gating: the proxy is always considered up.
    pub fn down(&self, threshold: u32) -> bool {
        threshold != 0 && self.fails() >= threshold
    }

    /// Transport to use for a forwarded query that arrived over
    /// `client_proto`.
    pub fn transport_for(&self, client_proto: Proto, force_tcp: bool) -> Proto {
        if self.tls.is_some() {
            Proto::Tls
        } else if force_tcp || client_proto == Proto::Tcp {
            Proto::Tcp
        } else {
            Proto::Udp
        }
    }

    /// Start the pool reaper and, unless probes are disabled, the liveness
    /// probe loop. The probe interval is jittered per tick so a fleet of
    /// proxies does not fire in lockstep.
    pub fn start(self: Arc<Self>, probe_interval: Option<Duration>) {
        if let Some(interval) = probe_interval {
            let proxy = Arc::clone(&self);
            tokio::spawn(async move {
                loop {
                    let jitter = rand::thread_rng().gen_range(0.5..1.5);
                    tokio::select! {
                        _ = tokio::time::sleep(interval.mul_f64(jitter)) => {
                            let _ = proxy.check().await;
                        }
                        _ = proxy.stop.cancelled() => {
                            debug!(upstream = %proxy.addr, "probe loop stopping");
                            return;
                        }
                    }
                }
            });
        }

        let proxy = self;
        let period = (proxy.opts.expire / 2).max(Duration::from_secs(1));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {
                        let evicted = proxy.pool.reap();
                        if evicted > 0 {
                            debug!(upstream = %proxy.addr, evicted, "evicted idle connections");
                        }
                    }
                    _ = proxy.stop.cancelled() => return,
                }
            }
        });
    }

    /// Stop the probe loop and drain the pool. Further dials are refused.
    pub fn stop(&self) {
        self.stop.cancel();
        self.pool.drain();
    }

    /// Trigger a single probe unless one is already in flight. Never blocks
    /// the caller.
    pub fn healthcheck(self: Arc<Self>) {
        if self.probing.swap(true, Ordering::AcqRel) {
            return;
        }
        tokio::spawn(async move {
            let _ = self.check().await;
            self.probing.store(false, Ordering::Release);
        });
    }

    /// Probe the upstream with `. IN NS`, recursion disabled. Any parseable
    /// DNS reply counts as healthy, error rcodes included; dial timeouts and
    /// empty replies count as failures.
    pub async fn check(&self) -> io::Result<()> {
        match self.send_probe().await {
            Ok(()) => {
                self.fails.store(0, Ordering::Relaxed);
                metrics::record_probe(&self.addr.to_string(), true);
                Ok(())
            }
            Err(e) => {
                let fails = self.fails.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::record_probe(&self.addr.to_string(), false);
                debug!(upstream = %self.addr, fails, error = %e, "health probe failed");
                Err(e)
            }
        }
    }

    async fn send_probe(&self) -> io::Result<()> {
        let mut probe = Message::new();
        probe.set_id(rand::random());
        probe.set_message_type(MessageType::Query);
        probe.set_op_code(OpCode::Query);
        probe.set_recursion_desired(false);
        probe.add_query(Query::query(Name::root(), RecordType::NS));
        let bytes = probe.to_vec().map_err(invalid_data)?;

        let proto = if self.tls.is_some() { Proto::Tls } else { Proto::Udp };
        let mut conn = self.dial_fresh(proto).await?;
        let reply = self.exchange(&mut conn, &bytes, MIN_UDP_SIZE).await?;
        Message::from_vec(&reply).map(|_| ()).map_err(invalid_data)
    }

    /// Take a warm connection for `proto`, or open a fresh one under the
    /// dial timeout. `fresh` bypasses the pool entirely.
    pub async fn dial(&self, proto: Proto, fresh: bool) -> io::Result<Conn> {
        if self.stop.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "proxy stopped",
            ));
        }
        if !fresh {
            if let Some(conn) = self.pool.checkout(proto) {
                return Ok(conn);
            }
        }
        self.dial_fresh(proto).await
    }

    /// Return a connection to the pool for reuse.
    pub fn yield_conn(&self, conn: Conn) {
        if !self.stop.is_cancelled() {
            self.pool.yield_conn(conn);
        }
    }

    /// Number of idle pooled connections.
    pub fn idle_conns(&self) -> usize {
        self.pool.idle_count()
    }

    /// Send one query and read one reply over a pooled or fresh connection.
    /// The connection is returned to the pool only after a full round trip.
    pub async fn connect(
        &self,
        req: &Message,
        proto: Proto,
        udp_size: u16,
        fresh: bool,
    ) -> io::Result<Message> {
        let bytes = req.to_vec().map_err(invalid_data)?;
        let mut conn = self.dial(proto, fresh).await?;
        let reply_bytes = self.exchange(&mut conn, &bytes, udp_size).await?;
        let reply = Message::from_vec(&reply_bytes).map_err(invalid_data)?;
        self.yield_conn(conn);
        Ok(reply)
    }

    async fn dial_fresh(&self, proto: Proto) -> io::Result<Conn> {
        match proto {
            Proto::Udp => {
                let bind: SocketAddr = if self.addr.is_ipv4() {
                    "0.0.0.0:0".parse().unwrap()
                } else {
                    "[::]:0".parse().unwrap()
                };
                let socket = UdpSocket::bind(bind).await?;
                socket.connect(self.addr).await?;
                Ok(Conn::Udp(socket))
            }
            Proto::Tcp => {
                let stream = deadline(
                    self.opts.dial_timeout,
                    "dial",
                    TcpStream::connect(self.addr),
                )
                .await?;
                Ok(Conn::Tcp(stream))
            }
            Proto::Tls => {
                let tls = self.tls.as_ref().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "tls not configured")
                })?;
                let stream = deadline(
                    self.opts.dial_timeout,
                    "dial",
                    TcpStream::connect(self.addr),
                )
                .await?;
                let stream = deadline(
                    self.opts.dial_timeout,
                    "tls handshake",
                    tls.connector.connect(tls.server_name.clone(), stream),
                )
                .await?;
                Ok(Conn::Tls(Box::new(stream)))
            }
        }
    }

    async fn exchange(
        &self,
        conn: &mut Conn,
        request: &[u8],
        udp_size: u16,
    ) -> io::Result<Vec<u8>> {
        match conn {
            Conn::Udp(socket) => {
                deadline(self.opts.timeout, "write", socket.send(request)).await?;
                let mut buf = vec![0u8; udp_size.max(MIN_UDP_SIZE) as usize];
                let n = deadline(self.opts.timeout, "read", socket.recv(&mut buf)).await?;
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "empty reply",
                    ));
                }
                buf.truncate(n);
                Ok(buf)
            }
            Conn::Tcp(stream) => {
                deadline(self.opts.timeout, "write", write_framed(stream, request)).await?;
                deadline(self.opts.timeout, "read", read_framed(stream)).await
            }
            Conn::Tls(stream) => {
                deadline(
                    self.opts.timeout,
                    "write",
                    write_framed(stream.as_mut(), request),
                )
                .await?;
                deadline(self.opts.timeout, "read", read_framed(stream.as_mut())).await
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn force_fails(&self, fails: u32) {
        self.fails.store(fails, Ordering::Relaxed);
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("addr", &self.addr)
            .field("tls", &self.tls.is_some())
            .field("fails", &self.fails())
            .finish()
    }
}

async fn deadline<T, F>(dur: Duration, what: &str, fut: F) -> io::Result<T>
where
    F: std::future::Future<Output = io::Result<T>>,
{
    match tokio::time::timeout(dur, fut).await {
        Ok(result) => result,
        Err(_) => {
            warn!(what, timeout = ?dur, "upstream operation timed out");
            Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{what} timed out after {dur:?}"),
            ))
        }
    }
}

async fn write_framed<S>(stream: &mut S, message: &[u8]) -> io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let len = u16::try_from(message.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "message too large"))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(message).await?;
    stream.flush().await
}

async fn read_framed<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

fn invalid_data(e: hickory_proto::ProtoError) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, e)
}
