//! Configuration types for meridian-dns.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use crate::error::EdgeError;
use crate::geo::Point;
use crate::policy::PolicyKind;

/// Upper bound on configured upstream proxies.
pub const MAX_UPSTREAMS: usize = 15;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Edge DNS configuration.
    pub dns: EdgeConfig,

    /// Telemetry configuration.
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Edge DNS configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeConfig {
    /// Address for the DNS server to listen on (UDP and TCP).
    pub listen_addr: SocketAddr,

    /// Required DNS suffix for handled queries. Everything else falls
    /// through. `.` matches all names.
    #[serde(default = "default_base_domain")]
    pub base_domain: String,

    /// Identity of this edge site (public IP and geographic point).
    pub site: SiteConfig,

    /// Upstream resolver addresses. A `tls://` prefix selects DNS over TLS
    /// for that upstream. At most 15 entries.
    #[serde(default)]
    pub upstreams: Vec<String>,

    /// Upstream selection policy.
    #[serde(default)]
    pub policy: PolicyKind,

    /// Name suffixes to ignore even when they fall under the base domain.
    #[serde(default)]
    pub except: Vec<String>,

    /// Consecutive probe failures after which an upstream is skipped.
    /// Zero disables health-gating entirely.
    #[serde(default = "default_max_fails")]
    pub max_fails: u32,

    /// Seconds before an idle pooled connection is evicted.
    #[serde(default = "default_expire")]
    pub expire: u64,

    /// Forward over TCP even when the client query arrived over UDP.
    #[serde(default)]
    pub force_tcp: bool,

    /// Per-call read and write deadline in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Deadline for dialing a fresh upstream connection, in seconds.
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout: u64,

    /// Base interval between upstream liveness probes, in milliseconds.
    /// The actual interval is jittered around this value.
    #[serde(default = "default_health_interval_ms")]
    pub health_interval_ms: u64,

    /// TLS material for `tls://` upstreams. Absent means system/webpki roots
    /// and no client certificate.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Server name presented during the TLS handshake. Falls back to the
    /// upstream host IP when unset.
    #[serde(default)]
    pub tls_servername: Option<String>,

    /// Address for the service-table push endpoint. Absent disables it.
    #[serde(default)]
    pub push_addr: Option<SocketAddr>,

    /// Log every request and decision at debug level.
    #[serde(default)]
    pub dns_debug: bool,

    /// Log service-table mutations at debug level.
    #[serde(default)]
    pub service_debug: bool,
}

/// Identity of this edge site.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Public IP address answered for locally running services.
    pub ip: IpAddr,
    /// Geographic point of this cluster.
    pub coords: Point,
}

/// TLS material for upstream connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Client certificate chain (PEM).
    pub cert: PathBuf,
    /// Client private key (PEM).
    pub key: PathBuf,
    /// Trusted CA bundle (PEM).
    pub ca: PathBuf,
}

/// Telemetry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level filter (e.g., "info", "meridian_dns=debug,warn").
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Prometheus metrics exporter address.
    #[serde(default)]
    pub prometheus_addr: Option<SocketAddr>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            prometheus_addr: None,
        }
    }
}

/// One parsed upstream target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpstreamAddr {
    /// Socket address of the upstream resolver.
    pub addr: SocketAddr,
    /// Whether this upstream speaks DNS over TLS.
    pub tls: bool,
}

impl EdgeConfig {
    /// Parse and validate the configured upstream list.
    pub fn parse_upstreams(&self) -> Result<Vec<UpstreamAddr>, EdgeError> {
        if self.upstreams.len() > MAX_UPSTREAMS {
            return Err(EdgeError::Config(format!(
                "too many upstreams: {} (max {})",
                self.upstreams.len(),
                MAX_UPSTREAMS
            )));
        }
        self.upstreams.iter().map(|s| parse_upstream(s)).collect()
    }

    /// The base domain lower-cased with a trailing dot.
    pub fn normalized_base_domain(&self) -> String {
        normalize_zone(&self.base_domain)
    }

    /// The ignored suffixes lower-cased with trailing dots.
    pub fn normalized_except(&self) -> Vec<String> {
        self.except.iter().map(|n| normalize_zone(n)).collect()
    }
}

/// Lower-case a zone name and ensure it carries a trailing dot.
pub fn normalize_zone(name: &str) -> String {
    let mut zone = name.trim().to_ascii_lowercase();
    if !zone.ends_with('.') {
        zone.push('.');
    }
    zone
}

fn parse_upstream(raw: &str) -> Result<UpstreamAddr, EdgeError> {
    let (tls, host) = match raw.strip_prefix("tls://") {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let default_port = if tls { 853 } else { 53 };

    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Ok(UpstreamAddr { addr, tls });
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(UpstreamAddr {
            addr: SocketAddr::new(ip, default_port),
            tls,
        });
    }
    Err(EdgeError::InvalidAddress(raw.to_string()))
}

fn default_base_domain() -> String {
    ".".to_string()
}

fn default_max_fails() -> u32 {
    2
}

fn default_expire() -> u64 {
    10
}

fn default_timeout() -> u64 {
    2
}

fn default_dial_timeout() -> u64 {
    4
}

fn default_health_interval_ms() -> u64 {
    500
}

fn default_log_level() -> String {
    "info".to_string()
}
