//! Warm upstream connection pool.
//!
//! Connections handed out by [`ConnPool::checkout`] are exclusively owned by
//! the caller until returned with [`ConnPool::yield_conn`] or dropped. The
//! pool mutex is never held across I/O.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;

/// Upstream transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    /// Plain DNS over UDP.
    Udp,
    /// Plain DNS over TCP.
    Tcp,
    /// DNS over TLS.
    Tls,
}

impl Proto {
    /// Wire-protocol label used in logs and metrics.
    pub fn name(self) -> &'static str {
        match self {
            Proto::Udp => "udp",
            Proto::Tcp => "tcp",
            Proto::Tls => "tcp-tls",
        }
    }
}

/// One upstream connection. UDP sockets are connected to the upstream and may
/// be reused indefinitely; stream connections can be closed remotely, which
/// the caller observes as EOF on read.
#[derive(Debug)]
pub enum Conn {
    /// A connected UDP socket.
    Udp(UdpSocket),
    /// A TCP stream.
    Tcp(TcpStream),
    /// A TLS stream over TCP.
    Tls(Box<TlsStream<TcpStream>>),
}

impl Conn {
    /// The protocol this connection speaks.
    pub fn proto(&self) -> Proto {
        match self {
            Conn::Udp(_) => Proto::Udp,
            Conn::Tcp(_) => Proto::Tcp,
            Conn::Tls(_) => Proto::Tls,
        }
    }
}

struct Idle {
    conn: Conn,
    since: Instant,
}

/// Per-protocol pool of warm connections with idle expiry.
pub struct ConnPool {
    idle: Mutex<HashMap<Proto, Vec<Idle>>>,
    expire: Duration,
}

impl ConnPool {
    /// Create a pool evicting connections idle longer than `expire`.
    pub fn new(expire: Duration) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            expire,
        }
    }

    /// Take a warm connection for `proto`, discarding any expired ones found
    /// along the way. Returns `None` when nothing usable is pooled.
    pub fn checkout(&self, proto: Proto) -> Option<Conn> {
        let mut idle = self.idle.lock();
        let list = idle.get_mut(&proto)?;
        while let Some(entry) = list.pop() {
            if entry.since.elapsed() < self.expire {
                return Some(entry.conn);
            }
        }
        None
    }

    /// Return a connection to the pool, timestamped now.
    pub fn yield_conn(&self, conn: Conn) {
        let proto = conn.proto();
        let mut idle = self.idle.lock();
        idle.entry(proto).or_default().push(Idle {
            conn,
            since: Instant::now(),
        });
    }

    /// Drop every idle connection past the expire window. Returns how many
    /// were evicted.
    pub fn reap(&self) -> usize {
        let mut idle = self.idle.lock();
        let mut evicted = 0;
        for list in idle.values_mut() {
            let before = list.len();
            list.retain(|entry| entry.since.elapsed() < self.expire);
            evicted += before - list.len();
        }
        evicted
    }

    /// Drop every idle connection.
    pub fn drain(&self) {
        self.idle.lock().clear();
    }

    /// Number of idle connections currently pooled.
    pub fn idle_count(&self) -> usize {
        self.idle.lock().values().map(|l| l.len()).sum()
    }
}
