//! Meridian DNS - geo-aware service routing across a federation of edge
//! clusters.
//!
//! Each edge cluster runs an instance; together they form a tree, with edge
//! sites pointing at upstream edge sites. When a client asks for a service
//! name, the resolver answers with the IP of the cluster best suited to
//! serve it: this one if the service runs locally, otherwise the known peer
//! site closest by great-circle distance, otherwise whatever the upstream
//! federation says.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                         meridian-dns                           │
//! │                                                                │
//! │  ┌───────────────┐   ┌───────────────┐   ┌─────────────────┐  │
//! │  │ Push endpoint │──▶│ Service table │   │ Local services  │  │
//! │  │ (HTTP, peers) │   │ (in-memory)   │   │ (watcher-fed)   │  │
//! │  └───────────────┘   └───────┬───────┘   └────────┬────────┘  │
//! │                              │                    │           │
//! │                              ▼                    ▼           │
//! │  UDP/TCP :53 ──▶ handler ──▶ ┌────────────────────────┐       │
//! │                              │      EdgeEngine        │       │
//! │                              │ local / redirect /     │       │
//! │                              │ forward decision       │       │
//! │                              └───────────┬────────────┘       │
//! │                                          │                    │
//! │                              ┌───────────▼────────────┐       │
//! │                              │ Proxy pool (UDP/TCP/   │       │
//! │                              │ TLS, probes, failover) │──▶ upstream
//! │                              └────────────────────────┘       │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Resolution
//!
//! ```text
//! svc.edge.example A?
//!   → outside base domain / ignored   → fall through
//!   → no relay marker + runs locally  → own IP, authoritative
//!   → known peer sites in the table   → closest site's IP, authoritative
//!   → otherwise                       → tag with own location, forward up
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use meridian_dns::{EdgeConfig, EdgeServer};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config: EdgeConfig = load_config();
//!
//!     let shutdown = CancellationToken::new();
//!     let server = EdgeServer::new(config);
//!     server.run(shutdown).await.unwrap();
//! }
//! ```

#![warn(missing_docs)]

pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod handler;
pub mod metrics;
pub mod policy;
pub mod pool;
pub mod proxy;
pub mod push;
pub mod server;
pub mod table;
pub mod telemetry;

// Re-export main types
pub use config::{Config, EdgeConfig, SiteConfig, TelemetryConfig};
pub use engine::{ClientInfo, EdgeEngine, Forwarder, ReplySource, RouteDecision};
pub use error::{EdgeError, ForwardError};
pub use geo::Point;
pub use server::EdgeServer;
pub use table::{LocalServices, ServiceTable, Site};
