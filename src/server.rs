//! DNS server setup and lifecycle management.

use hickory_server::ServerFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::EdgeConfig;
use crate::engine::{EdgeEngine, Forwarder};
use crate::error::EdgeError;
use crate::handler::EdgeHandler;
use crate::metrics;
use crate::proxy::{Proxy, ProxyOptions, TlsSettings};
use crate::push::{self, PushState};
use crate::table::{LocalServices, ServiceTable};

/// TCP session timeout for the client-facing listener.
const TCP_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval for emitting state metrics.
const METRICS_INTERVAL: Duration = Duration::from_secs(10);

/// Periodically emit table, local-set, and proxy gauges.
async fn metrics_loop(
    table: ServiceTable,
    local: LocalServices,
    proxies: Vec<Arc<Proxy>>,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                table.emit_metrics();
                metrics::record_local_services(local.len());
                for proxy in &proxies {
                    metrics::record_proxy_fails(&proxy.addr().to_string(), proxy.fails());
                }
                debug!(
                    services = table.services_count(),
                    sites = table.sites_count(),
                    local = local.len(),
                    "emitted state metrics"
                );
            }
            _ = shutdown.cancelled() => {
                debug!("metrics loop shutting down");
                return;
            }
        }
    }
}

/// Geo-aware edge DNS server.
pub struct EdgeServer {
    config: EdgeConfig,
    table: ServiceTable,
    local: LocalServices,
    forwarder: Forwarder,
}

impl EdgeServer {
    /// Create a new server with the given configuration.
    pub fn new(config: EdgeConfig) -> Self {
        Self {
            config,
            table: ServiceTable::new(),
            local: LocalServices::new(),
            forwarder: Forwarder::new(),
        }
    }

    /// The service table, for the synchronizer and tests.
    pub fn table(&self) -> &ServiceTable {
        &self.table
    }

    /// The local service set, for the cluster watcher.
    pub fn local_services(&self) -> &LocalServices {
        &self.local
    }

    /// A forward helper handle for co-located components. Usable once the
    /// server is running; earlier calls report the engine as missing.
    pub fn forwarder(&self) -> Forwarder {
        self.forwarder.clone()
    }

    /// Run the server until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), EdgeError> {
        info!(
            listen_addr = %self.config.listen_addr,
            base_domain = %self.config.normalized_base_domain(),
            upstreams = self.config.upstreams.len(),
            policy = ?self.config.policy,
            "Starting meridian-dns server"
        );

        let proxies = self.build_proxies()?;
        // max_fails 0 means probe-disabled mode; the pool reaper runs
        // either way.
        let probe_interval = (self.config.max_fails != 0)
            .then(|| Duration::from_millis(self.config.health_interval_ms));
        for proxy in &proxies {
            Arc::clone(proxy).start(probe_interval);
        }

        let engine = Arc::new(EdgeEngine::new(
            &self.config,
            self.table.clone(),
            self.local.clone(),
            proxies.clone(),
        )?);
        self.forwarder.bind(Arc::clone(&engine));

        // Table push endpoint for downstream edge sites.
        let push_handle = match self.config.push_addr {
            Some(addr) => Some(spawn_push_server(addr, self.push_state(), shutdown.clone()).await?),
            None => None,
        };

        let mut server = ServerFuture::new(EdgeHandler::new(engine));

        let udp_socket = UdpSocket::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "DNS UDP listening");
        server.register_socket(udp_socket);

        let tcp_listener = TcpListener::bind(self.config.listen_addr).await?;
        info!(addr = %self.config.listen_addr, "DNS TCP listening");
        server.register_listener(tcp_listener, TCP_TIMEOUT);

        let metrics_handle = tokio::spawn(metrics_loop(
            self.table.clone(),
            self.local.clone(),
            proxies.clone(),
            shutdown.clone(),
        ));

        info!("DNS server ready to serve queries");

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("DNS server shutdown requested");
            }
            result = server.block_until_done() => {
                if let Err(e) = result {
                    error!("DNS server error: {}", e);
                }
            }
        }

        // Stop probe loops and drain pools; in-flight requests finish under
        // their own deadlines.
        for proxy in &proxies {
            proxy.stop();
        }

        let _ = metrics_handle.await;
        if let Some(handle) = push_handle {
            let _ = handle.await;
        }

        info!("DNS server stopped");
        Ok(())
    }

    fn build_proxies(&self) -> Result<Vec<Arc<Proxy>>, EdgeError> {
        let upstreams = self.config.parse_upstreams()?;
        if upstreams.is_empty() {
            return Ok(Vec::new());
        }

        let opts = ProxyOptions {
            timeout: Duration::from_secs(self.config.timeout),
            dial_timeout: Duration::from_secs(self.config.dial_timeout),
            expire: Duration::from_secs(self.config.expire),
        };

        let mut proxies = Vec::with_capacity(upstreams.len());
        for upstream in upstreams {
            let tls = if upstream.tls {
                let server_name = self
                    .config
                    .tls_servername
                    .clone()
                    .unwrap_or_else(|| upstream.addr.ip().to_string());
                Some(TlsSettings::new(self.config.tls.as_ref(), &server_name)?)
            } else {
                None
            };
            proxies.push(Proxy::new(upstream.addr, tls, opts));
        }
        Ok(proxies)
    }

    fn push_state(&self) -> PushState {
        PushState {
            table: self.table.clone(),
            service_debug: self.config.service_debug,
        }
    }
}

async fn spawn_push_server(
    addr: std::net::SocketAddr,
    state: PushState,
    shutdown: CancellationToken,
) -> Result<JoinHandle<()>, EdgeError> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "table push endpoint listening");
    let app = push::router(state);

    Ok(tokio::spawn(async move {
        let serve = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await });
        if let Err(e) = serve.await {
            error!("push endpoint error: {}", e);
        }
    }))
}
