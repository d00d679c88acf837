//! Client-facing HTTPS listener.
//!
//! Behaves as a transparent reverse proxy toward the chosen agent: the
//! caller authenticates with a client certificate, the first label of its
//! common name selects the target identity, and the response is relayed
//! frame by frame as the agent produces it.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, ACCEPT_ENCODING, TRANSFER_ENCODING};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_rustls::TlsAcceptor;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use burrow_common::{core_metrics, AgentIdentity, RequestId, RequestIdMinter};
use burrow_tunnel_protocol::defaults::{CHANNEL_BOUND, PROTOCOL_KUBERNETES};
use burrow_tunnel_protocol::{CancelRequest, ControllerToAgent, HttpRequest};

use crate::registry::AgentRegistry;
use crate::session::{AgentSession, ResponseEvent};
use crate::tls::peer_identity;

type ApiBody = BoxBody<Bytes, std::io::Error>;

/// Shared state of the API listener.
pub struct ApiContext {
    pub registry: Arc<AgentRegistry>,
    pub minter: RequestIdMinter,
}

/// Accept loop for the client-facing HTTPS port.
pub async fn run_api_server(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    ctx: Arc<ApiContext>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "HTTPS listener started");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    debug!(peer = %peer_addr, error = %e, "TLS accept failed");
                    return;
                }
            };

            // Identity is a property of the connection, not the request.
            let identity = {
                let (_, connection) = tls_stream.get_ref();
                let certs = connection.peer_certificates().unwrap_or_default();
                match peer_identity(certs) {
                    Ok(identity) => identity,
                    Err(e) => {
                        warn!(peer = %peer_addr, error = %e, "Rejecting client without verified certificate");
                        return;
                    }
                }
            };

            let service = service_fn(move |req| {
                handle_request(req, identity.clone(), Arc::clone(&ctx))
            });
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                debug!(peer = %peer_addr, error = %e, "API connection ended");
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
    identity: AgentIdentity,
    ctx: Arc<ApiContext>,
) -> Result<Response<ApiBody>, Infallible> {
    core_metrics()
        .api_requests
        .with_label_values(&[identity.as_str()])
        .inc();

    let Some(session) = ctx.registry.pick(&identity) else {
        warn!(identity = %identity, "No agents connected");
        return Ok(bad_gateway());
    };

    let method = req.method().to_string();
    let uri = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let headers = request_headers(req.headers());

    // Request bodies are buffered whole; only responses stream.
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(identity = %identity, error = %e, "Failed to read request body");
            return Ok(bad_gateway());
        }
    };

    let id = ctx.minter.next_id();
    let frame = HttpRequest {
        id: id.to_string(),
        target: identity.to_string(),
        protocol: PROTOCOL_KUBERNETES.to_string(),
        method,
        uri,
        headers,
        body: body.to_vec(),
    };

    let (sink, mut events) = mpsc::channel::<ResponseEvent>(CHANNEL_BOUND);
    if let Err(e) = session.enqueue(frame, sink) {
        warn!(identity = %identity, request_id = %id, error = %e, "Failed to enqueue request");
        return Ok(bad_gateway());
    }

    // Fires a cancel frame toward the agent unless the response ran to a
    // clean close first.
    let mut guard = CancelGuard::new(id.clone(), Arc::clone(&session));

    // The first frame must be the response header.
    match events.recv().await {
        None => {
            guard.disarm();
            session.finish_request(&id);
            warn!(identity = %identity, request_id = %id, "Request timed out sending to agent");
            Ok(bad_gateway())
        }
        Some(ResponseEvent::Chunk(_)) => {
            session.finish_request(&id);
            warn!(identity = %identity, request_id = %id, "Got chunked response before header");
            Ok(bad_gateway())
        }
        Some(ResponseEvent::Header(header)) => {
            let mut builder = Response::builder().status(
                StatusCode::from_u16(header.status).unwrap_or(StatusCode::BAD_GATEWAY),
            );
            for (name, values) in &header.headers {
                let Ok(name) = name.parse::<HeaderName>() else {
                    continue;
                };
                // The local server frames the body itself.
                if name == TRANSFER_ENCODING {
                    continue;
                }
                for value in values {
                    builder = builder.header(name.clone(), value.as_str());
                }
            }

            if header.content_length == 0 {
                guard.disarm();
                session.finish_request(&id);
                return Ok(builder
                    .body(full_body(Bytes::new()))
                    .unwrap_or_else(|_| bad_gateway()));
            }

            let (body_tx, body_rx) =
                mpsc::channel::<Result<Frame<Bytes>, std::io::Error>>(CHANNEL_BOUND);
            tokio::spawn(pump_response(events, body_tx, guard, session, id));

            let stream_body = StreamBody::new(ReceiverStream::new(body_rx));
            Ok(builder
                .body(BodyExt::boxed(stream_body))
                .unwrap_or_else(|_| bad_gateway()))
        }
    }
}

/// Relay chunk frames into the client response body. Ends on the
/// terminating empty chunk (clean), on session close (stop writing), or
/// when the client goes away (the guard then cancels the request).
async fn pump_response(
    mut events: mpsc::Receiver<ResponseEvent>,
    body_tx: mpsc::Sender<Result<Frame<Bytes>, std::io::Error>>,
    mut guard: CancelGuard,
    session: Arc<AgentSession>,
    id: RequestId,
) {
    loop {
        let event = tokio::select! {
            // Client hung up; the guard sends the cancel.
            _ = body_tx.closed() => break,
            event = events.recv() => event,
        };
        match event {
            None => break,
            Some(ResponseEvent::Header(_)) => {
                warn!(request_id = %id, "Dropping duplicate header frame");
            }
            Some(ResponseEvent::Chunk(chunk)) => {
                if chunk.is_terminator() {
                    guard.disarm();
                    break;
                }
                if body_tx
                    .send(Ok(Frame::data(Bytes::from(chunk.body))))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    session.finish_request(&id);
}

/// Sends `CancelRequest{id}` into the session on drop unless disarmed by
/// a clean close. Dropping happens either on an explicit early return or
/// when hyper abandons the response because the client disconnected.
struct CancelGuard {
    id: RequestId,
    session: Arc<AgentSession>,
    armed: bool,
}

impl CancelGuard {
    fn new(id: RequestId, session: Arc<AgentSession>) -> Self {
        Self {
            id,
            session,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        debug!(request_id = %self.id, "Client disconnected, cancelling request");
        let frame = ControllerToAgent::Cancel(CancelRequest {
            id: self.id.to_string(),
        });
        if let Err(mpsc::error::TrySendError::Full(frame)) = self.session.sender().try_send(frame)
        {
            let sender = self.session.sender();
            tokio::spawn(async move {
                let _ = sender.send(frame).await;
            });
        }
    }
}

/// Forwarded request headers: everything except `Accept-Encoding` (the
/// tunnel does not handle compressed responses transparently).
fn request_headers(
    header_map: &hyper::HeaderMap,
) -> std::collections::HashMap<String, Vec<String>> {
    let mut headers: std::collections::HashMap<String, Vec<String>> =
        std::collections::HashMap::new();
    for (name, value) in header_map {
        if name == ACCEPT_ENCODING {
            continue;
        }
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).to_string());
    }
    headers
}

fn full_body(bytes: Bytes) -> ApiBody {
    Full::new(bytes).map_err(|never| match never {}).boxed()
}

fn bad_gateway() -> Response<ApiBody> {
    let mut response = Response::new(full_body(Bytes::new()));
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}
