//! HTTP push endpoint for service-table updates.
//!
//! Downstream edge sites publish their aggregated service maps here. A valid
//! payload replaces the whole table atomically; malformed input is rejected
//! with 400 and the table is left untouched.
//!
//! Payload shape:
//!
//! ```json
//! {
//!   "svc.edge.example": [
//!     {"ip": "1.2.3.4", "coords": {"lat": 55.0, "lon": 13.0}}
//!   ]
//! }
//! ```

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::put;
use axum::Router;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::metrics;
use crate::table::{ServiceTable, Site};

/// Shared state for the push routes.
#[derive(Clone)]
pub struct PushState {
    /// The table updated by pushes.
    pub table: ServiceTable,
    /// Log accepted payloads in full at debug level.
    pub service_debug: bool,
}

/// Build the push router.
pub fn router(state: PushState) -> Router {
    Router::new()
        .route("/table", put(replace_table))
        .with_state(state)
}

async fn replace_table(State(state): State<PushState>, body: String) -> StatusCode {
    let payload: HashMap<String, Vec<Site>> = match serde_json::from_str(&body) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "rejecting malformed table push");
            metrics::record_table_push(false);
            return StatusCode::BAD_REQUEST;
        }
    };

    for (service, sites) in &payload {
        if service.trim_end_matches('.').is_empty() {
            warn!("rejecting table push with empty service name");
            metrics::record_table_push(false);
            return StatusCode::BAD_REQUEST;
        }
        if let Some(bad) = sites.iter().find(|site| !site.coords.is_valid()) {
            warn!(
                service = %service,
                ip = %bad.ip,
                "rejecting table push with out-of-range coordinates"
            );
            metrics::record_table_push(false);
            return StatusCode::BAD_REQUEST;
        }
    }

    if state.service_debug {
        debug!(payload = %body, "accepted table push");
    }

    let services = payload.len();
    state.table.bulk_replace(payload);
    state.table.emit_metrics();
    metrics::record_table_push(true);
    info!(services, "service table replaced by push");
    StatusCode::OK
}
