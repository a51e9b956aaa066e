//! Hickory request handler bridging the routing engine to client replies.
//!
//! The incoming request is rebuilt into an owned `Message` (the engine's
//! rewrite works on a private copy, never the server's parse buffers) and
//! the engine's decision is mapped back onto the wire.

use hickory_proto::op::{Header, Message, ResponseCode};
use hickory_proto::rr::Record;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::sync::Arc;
use tracing::error;

use crate::engine::{scrub, ClientInfo, EdgeEngine, ReplySource, RouteDecision};
use crate::metrics::{self, QueryOutcome, Timer};
use crate::pool::Proto;

/// Maximum reply size over stream transports.
const MAX_STREAM_SIZE: usize = u16::MAX as usize;

/// [`RequestHandler`] serving the edge routing engine.
pub struct EdgeHandler {
    engine: Arc<EdgeEngine>,
}

impl EdgeHandler {
    /// Wrap an engine for serving.
    pub fn new(engine: Arc<EdgeEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait::async_trait]
impl RequestHandler for EdgeHandler {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let timer = Timer::start();
        let client = ClientInfo {
            src: request.src(),
            proto: if request.protocol() == Protocol::Tcp {
                Proto::Tcp
            } else {
                Proto::Udp
            },
            udp_size: request
                .edns()
                .map(|edns| edns.max_payload())
                .unwrap_or(512)
                .max(512),
        };

        let msg = rebuild_message(request);
        match self.engine.route(msg, client).await {
            RouteDecision::Reply(reply, source) => {
                let outcome = match source {
                    ReplySource::Local => QueryOutcome::LocalHit,
                    ReplySource::Peer => QueryOutcome::Redirect,
                    ReplySource::Upstream => QueryOutcome::Forwarded,
                };
                metrics::record_query(outcome, timer.elapsed());
                send_reply(request, reply, client, &mut response_handle).await
            }
            RouteDecision::FormError(reply) => {
                metrics::record_query(QueryOutcome::FormErr, timer.elapsed());
                send_reply(request, reply, client, &mut response_handle).await
            }
            RouteDecision::Fallthrough => {
                // No plugin chain behind us; refuse so the client looks
                // elsewhere.
                metrics::record_query(QueryOutcome::Fallthrough, timer.elapsed());
                send_error(request, ResponseCode::Refused, &mut response_handle).await
            }
            RouteDecision::Fail(err) => {
                error!(error = %err, src = %request.src(), "all upstreams failed");
                metrics::record_query(QueryOutcome::ServFail, timer.elapsed());
                send_error(request, ResponseCode::ServFail, &mut response_handle).await
            }
        }
    }
}

/// Rebuild the parsed request into an owned message the engine may rewrite.
fn rebuild_message(request: &Request) -> Message {
    let mut msg = Message::new();
    let header = request.header();
    msg.set_id(header.id());
    msg.set_message_type(header.message_type());
    msg.set_op_code(header.op_code());
    msg.set_recursion_desired(header.recursion_desired());

    for query in request.queries() {
        msg.add_query(query.original().clone());
    }
    for record in request.answers() {
        msg.add_answer(record.clone());
    }
    for record in request.name_servers() {
        msg.add_name_server(record.clone());
    }
    for record in request.additionals() {
        msg.add_additional(record.clone());
    }
    if let Some(edns) = request.edns() {
        *msg.extensions_mut() = Some(edns.clone());
    }
    msg
}

async fn send_reply<R: ResponseHandler>(
    request: &Request,
    mut reply: Message,
    client: ClientInfo,
    response_handle: &mut R,
) -> ResponseInfo {
    let max_size = match client.proto {
        Proto::Udp => client.udp_size as usize,
        _ => MAX_STREAM_SIZE,
    };
    scrub(&mut reply, max_size);

    let mut header = Header::response_from_request(request.header());
    header.set_authoritative(reply.authoritative());
    header.set_recursion_available(reply.recursion_available());
    header.set_truncated(reply.truncated());
    header.set_response_code(reply.response_code());

    let builder = MessageResponseBuilder::from_message_request(request);
    let response = builder.build(
        header,
        reply.answers(),
        reply.name_servers(),
        &[] as &[Record],
        reply.additionals(),
    );
    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(err) => {
            error!(error = %err, "failed to send DNS response");
            ResponseInfo::from(*request.header())
        }
    }
}

async fn send_error<R: ResponseHandler>(
    request: &Request,
    rcode: ResponseCode,
    response_handle: &mut R,
) -> ResponseInfo {
    let builder = MessageResponseBuilder::from_message_request(request);
    let response = builder.error_msg(request.header(), rcode);
    match response_handle.send_response(response).await {
        Ok(info) => info,
        Err(err) => {
            error!(error = %err, "failed to send DNS error response");
            ResponseInfo::from(*request.header())
        }
    }
}
