//! The per-request routing engine.
//!
//! For every incoming query the engine decides between three outcomes:
//! answer authoritatively (the service runs here, or a peer site runs it and
//! we know where), forward upstream through the proxy pool, or yield the
//! request back to the host. Queries relayed by peer sites carry a location
//! marker in the additional section; its presence distinguishes them from
//! client-originated queries and supplies the origin point for closest-site
//! selection.

use hickory_proto::op::{Edns, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use rand::Rng;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

use crate::config::EdgeConfig;
use crate::error::{EdgeError, ForwardError};
use crate::geo::{self, Point};
use crate::metrics;
use crate::policy::Policy;
use crate::pool::Proto;
use crate::proxy::Proxy;
use crate::table::{LocalServices, ServiceTable, Site};

/// Per-request client facts the engine needs for answer synthesis and
/// transport selection.
#[derive(Debug, Clone, Copy)]
pub struct ClientInfo {
    /// Source address of the query.
    pub src: SocketAddr,
    /// Transport the query arrived on.
    pub proto: Proto,
    /// The client's advertised UDP payload size (EDNS), floored at 512.
    pub udp_size: u16,
}

/// Outcome of routing one request.
#[derive(Debug)]
pub enum RouteDecision {
    /// Name outside the base domain, explicitly ignored, or nothing left to
    /// try; the host decides what happens next.
    Fallthrough,
    /// A reply ready to send, tagged with where it came from.
    Reply(Message, ReplySource),
    /// The upstream reply did not answer our question; terminal for the
    /// request.
    FormError(Message),
    /// Every candidate upstream produced a transport error.
    Fail(io::Error),
}

/// Where a reply came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplySource {
    /// Synthesized: the service runs at this cluster.
    Local,
    /// Synthesized: redirected to the closest peer edge site.
    Peer,
    /// Relayed from an upstream resolver.
    Upstream,
}

/// The routing engine. One instance per process; shared across requests.
pub struct EdgeEngine {
    ip: IpAddr,
    coords: Point,
    base_domain: String,
    except: Vec<String>,
    max_fails: u32,
    force_tcp: bool,
    dns_debug: bool,
    loc_rr: Record,
    table: ServiceTable,
    local: LocalServices,
    proxies: Vec<Arc<Proxy>>,
    policy: Policy,
}

impl EdgeEngine {
    /// Build an engine from a configuration snapshot and its collaborator
    /// state.
    pub fn new(
        config: &EdgeConfig,
        table: ServiceTable,
        local: LocalServices,
        proxies: Vec<Arc<Proxy>>,
    ) -> Result<Self, EdgeError> {
        if !config.site.coords.is_valid() {
            return Err(EdgeError::Config(format!(
                "site coordinates out of range: ({}, {})",
                config.site.coords.lat, config.site.coords.lon
            )));
        }

        Ok(Self {
            ip: config.site.ip,
            coords: config.site.coords,
            base_domain: config.normalized_base_domain(),
            except: config.normalized_except(),
            max_fails: config.max_fails,
            force_tcp: config.force_tcp,
            dns_debug: config.dns_debug,
            loc_rr: geo::encode_marker(config.site.coords),
            table,
            local,
            proxies,
            policy: Policy::new(config.policy),
        })
    }

    /// Number of configured upstream proxies.
    pub fn num_upstreams(&self) -> usize {
        self.proxies.len()
    }

    /// The configured upstream proxies.
    pub fn proxies(&self) -> &[Arc<Proxy>] {
        &self.proxies
    }

    /// This cluster's own geographic point.
    pub fn coords(&self) -> Point {
        self.coords
    }

    /// Route one request. The message is this request's private copy; the
    /// only rewrite applied before forwarding is the location-marker
    /// extraction and insertion.
    pub async fn route(&self, mut req: Message, client: ClientInfo) -> RouteDecision {
        let Some(query) = req.queries().first() else {
            return RouteDecision::Fallthrough;
        };
        let qname = fqdn(&query.name().to_string());

        if !self.matches(&qname) {
            if self.dns_debug {
                debug!(name = %qname, "query outside base domain, falling through");
            }
            return RouteDecision::Fallthrough;
        }

        let marker = geo::extract_marker(&mut req);
        let service = qname.trim_end_matches('.').to_string();

        // No marker means the query came straight from a client; answer with
        // our own address when the service runs here.
        if marker.is_none() && self.local.contains(&service) {
            if self.dns_debug {
                debug!(service = %service, "service running locally, answering with own ip");
            }
            return RouteDecision::Reply(
                self.authoritative_answer(&req, client, self.ip),
                ReplySource::Local,
            );
        }

        let (sites, found) = self.table.lookup(&service);
        if found && !sites.is_empty() {
            let origin = marker.unwrap_or(self.coords);
            let closest = closest_site(&sites, origin);
            if self.dns_debug {
                debug!(service = %service, closest = %closest.ip, "redirecting to closest peer site");
            }
            return RouteDecision::Reply(
                self.authoritative_answer(&req, client, closest.ip),
                ReplySource::Peer,
            );
        }

        if self.proxies.is_empty() {
            if self.dns_debug {
                debug!(service = %service, "no upstream proxies, falling through");
            }
            return RouteDecision::Fallthrough;
        }

        // Tag the query with our own location so the upstream treats us as a
        // peer site and knows where the request came from.
        geo::insert_marker(&mut req, &self.loc_rr);
        if self.dns_debug {
            debug!(service = %service, upstreams = self.proxies.len(), "forwarding upstream");
        }
        self.forward_upstream(&req, client).await
    }

    /// Send a prepared request through the proxy pool without touching its
    /// payload. Same skip-down / last-resort / retry semantics as routing.
    pub async fn forward(
        &self,
        req: &Message,
        client: ClientInfo,
    ) -> Result<Message, ForwardError> {
        match self.forward_upstream(req, client).await {
            RouteDecision::Reply(reply, _) => Ok(reply),
            RouteDecision::FormError(reply) => Ok(reply),
            RouteDecision::Fail(err) => Err(ForwardError::Transport(err)),
            RouteDecision::Fallthrough => Err(ForwardError::NoHealthy),
        }
    }

    async fn forward_upstream(&self, req: &Message, client: ClientInfo) -> RouteDecision {
        let ordered = self.policy.order(&self.proxies);
        let total = ordered.len();
        let mut down_count = 0usize;
        let mut last_err: Option<io::Error> = None;

        for proxy in ordered {
            let mut target = proxy;
            if target.down(self.max_fails) {
                down_count += 1;
                if down_count < total {
                    continue;
                }
                // Every upstream is past the failure threshold; the probes
                // may themselves be broken, so try one at random anyway.
                let pick = rand::thread_rng().gen_range(0..self.proxies.len());
                target = Arc::clone(&self.proxies[pick]);
                warn!(
                    upstream = %target.addr(),
                    "all upstreams marked down, picking one at random"
                );
            }

            match self.try_proxy(&target, req, client).await {
                Ok(reply) => {
                    metrics::record_forward(&target.addr().to_string(), true);
                    if !question_matches(req, &reply) {
                        return RouteDecision::FormError(error_message(
                            req,
                            ResponseCode::FormErr,
                        ));
                    }
                    return RouteDecision::Reply(reply, ReplySource::Upstream);
                }
                Err(err) => {
                    metrics::record_forward(&target.addr().to_string(), false);
                    // A failed exchange is a hint the upstream is unwell.
                    if self.max_fails != 0 {
                        Arc::clone(&target).healthcheck();
                    }
                    if self.dns_debug {
                        debug!(upstream = %target.addr(), error = %err, "upstream attempt failed");
                    }
                    last_err = Some(err);
                    if down_count >= total {
                        break;
                    }
                }
            }
        }

        match last_err {
            Some(err) => RouteDecision::Fail(err),
            None => RouteDecision::Fallthrough,
        }
    }

    async fn try_proxy(
        &self,
        proxy: &Arc<Proxy>,
        req: &Message,
        client: ClientInfo,
    ) -> io::Result<Message> {
        let proto = proxy.transport_for(client.proto, self.force_tcp);
        let reply = match proxy.connect(req, proto, client.udp_size, false).await {
            // Remote side closed a pooled stream; redial once, fresh.
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof && proto != Proto::Udp => {
                proxy.connect(req, proto, client.udp_size, true).await?
            }
            other => other?,
        };

        if reply.truncated() && proto == Proto::Udp {
            // The reply does not fit UDP; ask again over a stream transport.
            let stream_proto = proxy.transport_for(Proto::Tcp, true);
            return proxy
                .connect(req, stream_proto, client.udp_size, false)
                .await;
        }
        Ok(reply)
    }

    /// True when the query name falls under the base domain and is not
    /// excluded by an `except` suffix.
    fn matches(&self, qname: &str) -> bool {
        if !name_matches(qname, &self.base_domain) {
            return false;
        }
        if qname == self.base_domain {
            return true;
        }
        !self.except.iter().any(|suffix| name_matches(qname, suffix))
    }

    /// Synthesize an authoritative single-answer reply carrying `ip`.
    /// TTL stays zero so clients re-resolve across membership changes.
    fn authoritative_answer(&self, req: &Message, client: ClientInfo, ip: IpAddr) -> Message {
        let mut res = Message::new();
        res.set_id(req.id());
        res.set_message_type(MessageType::Response);
        res.set_op_code(req.op_code());
        res.set_recursion_desired(req.recursion_desired());
        res.set_authoritative(true);
        for query in req.queries() {
            res.add_query(query.clone());
        }

        let query = &req.queries()[0];
        let rdata = match (client.src.is_ipv4(), ip) {
            (true, IpAddr::V4(v4)) => RData::A(v4.into()),
            (false, IpAddr::V4(v4)) => RData::AAAA(v4.to_ipv6_mapped().into()),
            (_, IpAddr::V6(v6)) => RData::AAAA(v6.into()),
        };
        let mut record = Record::from_rdata(query.name().clone(), 0, rdata);
        record.set_dns_class(query.query_class());
        res.add_answer(record);
        res
    }
}

/// A callable entry for co-located components to send queries through the
/// engine's proxy pool. Usable before the engine exists; calls made in that
/// window fail with [`ForwardError::NoEdge`].
#[derive(Clone, Default)]
pub struct Forwarder {
    inner: Arc<OnceLock<Arc<EdgeEngine>>>,
}

impl Forwarder {
    /// Create an unbound forwarder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind the engine. Returns false if one was already bound.
    pub fn bind(&self, engine: Arc<EdgeEngine>) -> bool {
        self.inner.set(engine).is_ok()
    }

    /// Forward a prepared request as-is through the proxy pool.
    pub async fn forward(
        &self,
        req: &Message,
        client: ClientInfo,
    ) -> Result<Message, ForwardError> {
        self.engine()?.forward(req, client).await
    }

    /// Forge a recursion-desired query for `name`/`rtype`, carry the
    /// caller's EDNS payload size, and forward it upstream.
    pub async fn lookup(
        &self,
        name: &str,
        rtype: RecordType,
        client: ClientInfo,
    ) -> Result<Message, ForwardError> {
        let engine = self.engine()?;

        let qname = Name::from_ascii(name).map_err(|e| {
            ForwardError::Transport(io::Error::new(io::ErrorKind::InvalidInput, e))
        })?;
        let mut req = Message::new();
        req.set_id(rand::random());
        req.set_message_type(MessageType::Query);
        req.set_op_code(OpCode::Query);
        req.set_recursion_desired(true);
        req.add_query(Query::query(qname, rtype));

        let mut edns = Edns::new();
        edns.set_max_payload(client.udp_size.max(512));
        edns.set_version(0);
        *req.extensions_mut() = Some(edns);

        engine.forward(&req, client).await
    }

    fn engine(&self) -> Result<&Arc<EdgeEngine>, ForwardError> {
        self.inner.get().ok_or(ForwardError::NoEdge)
    }
}

/// The site closest to `from` by great-circle distance. Ties keep the first
/// site encountered.
pub(crate) fn closest_site(sites: &[Site], from: Point) -> Site {
    let mut best = sites[0];
    let mut best_dist = from.distance(&best.coords);
    for site in &sites[1..] {
        let dist = from.distance(&site.coords);
        if dist < best_dist {
            best = *site;
            best_dist = dist;
        }
    }
    best
}

/// DNS suffix match with label boundaries. Both names must be lower-cased
/// and dot-terminated; the root zone matches everything.
pub(crate) fn name_matches(name: &str, zone: &str) -> bool {
    if zone == "." || name == zone {
        return true;
    }
    name.len() > zone.len()
        && name.ends_with(zone)
        && name.as_bytes()[name.len() - zone.len() - 1] == b'.'
}

/// Whether `reply` answers the question in `req`.
pub(crate) fn question_matches(req: &Message, reply: &Message) -> bool {
    if reply.message_type() != MessageType::Response {
        return false;
    }
    match (req.queries().first(), reply.queries().first()) {
        (Some(q), Some(r)) => {
            q.name() == r.name()
                && q.query_type() == r.query_type()
                && q.query_class() == r.query_class()
        }
        (None, None) => true,
        _ => false,
    }
}

/// Build an error reply echoing the request's question.
pub(crate) fn error_message(req: &Message, rcode: ResponseCode) -> Message {
    let mut res = Message::new();
    res.set_id(req.id());
    res.set_message_type(MessageType::Response);
    res.set_op_code(req.op_code());
    res.set_recursion_desired(req.recursion_desired());
    res.set_response_code(rcode);
    for query in req.queries() {
        res.add_query(query.clone());
    }
    res
}

/// Truncate a reply to fit `max_size` bytes on the wire: drop the additional
/// section first, then answers from the tail, and set the TC bit.
pub(crate) fn scrub(reply: &mut Message, max_size: usize) {
    if fits(reply, max_size) {
        return;
    }
    reply.set_truncated(true);
    let _ = reply.take_additionals();
    while !fits(reply, max_size) {
        let mut answers = reply.take_answers();
        if answers.is_empty() {
            break;
        }
        answers.pop();
        for answer in answers {
            reply.add_answer(answer);
        }
    }
}

fn fits(msg: &Message, max_size: usize) -> bool {
    msg.to_vec().map(|b| b.len() <= max_size).unwrap_or(true)
}

fn fqdn(name: &str) -> String {
    let mut out = name.to_ascii_lowercase();
    if !out.ends_with('.') {
        out.push('.');
    }
    out
}
