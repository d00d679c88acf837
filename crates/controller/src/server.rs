//! The tunnel listener.
//!
//! Accepts mutually authenticated streams on the tunnel port. An agent's
//! first frame must be its hello, which is validated before the session
//! is admitted to the registry; an operator's first frame may instead be
//! a statistics request, answered immediately. Anything else is a
//! protocol error and the stream is closed.

use std::sync::Arc;

use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

use burrow_common::{now_millis, AgentIdentity};
use burrow_tunnel_protocol::defaults::{DIAL_TIMEOUT, PROTOCOL_VERSION};
use burrow_tunnel_protocol::{
    read_frame, write_frame, AgentToController, ControllerToAgent, PingResponse,
    StatisticsResponse, TunnelError,
};

use crate::registry::AgentRegistry;
use crate::session::{AgentSession, ResponseEvent};
use crate::tls::peer_identity;

/// Accept loop for the tunnel port. Runs until the listener fails.
pub async fn run_tunnel_server(
    listener: TcpListener,
    acceptor: TlsAcceptor,
    registry: Arc<AgentRegistry>,
) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "Tunnel listener started");
    loop {
        let (stream, peer_addr) = listener.accept().await?;
        let acceptor = acceptor.clone();
        let registry = Arc::clone(&registry);
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, acceptor, registry).await {
                warn!(peer = %peer_addr, error = %e, "Tunnel connection ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    acceptor: TlsAcceptor,
    registry: Arc<AgentRegistry>,
) -> Result<(), TunnelError> {
    let tls_stream = acceptor
        .accept(stream)
        .await
        .map_err(|e| TunnelError::ConnectionFailed(format!("TLS accept: {}", e)))?;

    let identity = {
        let (_, connection) = tls_stream.get_ref();
        let certs = connection.peer_certificates().unwrap_or_default();
        peer_identity(certs)
            .map_err(|e| TunnelError::ConnectionFailed(format!("peer identity: {}", e)))?
    };

    let (mut reader, mut writer) = tokio::io::split(tls_stream);

    // The first frame gates everything that follows.
    let first = timeout(DIAL_TIMEOUT, read_frame::<_, AgentToController>(&mut reader))
        .await
        .map_err(|_| TunnelError::Timeout(DIAL_TIMEOUT))??;

    match first {
        Some(AgentToController::Hello(hello)) => {
            if hello.protocol_version != PROTOCOL_VERSION {
                warn!(
                    identity = %identity,
                    agent_version = hello.protocol_version,
                    controller_version = PROTOCOL_VERSION,
                    "Closing stream: protocol version mismatch"
                );
                return Err(TunnelError::VersionMismatch {
                    expected: PROTOCOL_VERSION,
                    actual: hello.protocol_version,
                });
            }
            info!(
                identity = %identity,
                protocols = ?hello.protocols,
                namespaces = ?hello.kubernetes_namespaces,
                "Agent connected"
            );
            serve_agent_session(identity, reader, writer, registry).await;
            Ok(())
        }
        Some(AgentToController::Statistics(_)) => {
            debug!(identity = %identity, "Serving statistics request");
            let response = ControllerToAgent::Statistics(StatisticsResponse {
                agents: registry.statistics(),
            });
            write_frame(&mut writer, &response).await?;
            let _ = writer.shutdown().await;
            Ok(())
        }
        Some(other) => Err(TunnelError::ProtocolViolation(format!(
            "first frame must be a hello, got {:?}",
            other.frame_type()
        ))),
        None => Err(TunnelError::ConnectionFailed(
            "stream closed before hello".to_string(),
        )),
    }
}

/// Run one admitted agent session to completion: writer task, liveness
/// watchdog, and the receive loop. On any exit the session leaves the
/// registry and every outstanding request sink is flushed.
async fn serve_agent_session(
    identity: AgentIdentity,
    mut reader: ReadHalf<TlsStream<TcpStream>>,
    writer: WriteHalf<TlsStream<TcpStream>>,
    registry: Arc<AgentRegistry>,
) {
    let (session, outbound_rx) = AgentSession::new(identity);
    session.mark_live();
    registry.register(Arc::clone(&session));

    let writer_task = tokio::spawn(run_session_writer(
        outbound_rx,
        writer,
        Arc::clone(&session),
    ));
    let watchdog = tokio::spawn(Arc::clone(&session).run_watchdog());

    run_session_receiver(&mut reader, &session).await;

    registry.unregister(&session);
    session.close();
    let _ = tokio::join!(writer_task, watchdog);
    info!(
        identity = %session.identity(),
        session_id = %session.session_id(),
        "Agent session ended"
    );
}

/// Drain the session's outbound channel into the stream. A write error
/// faults the session.
async fn run_session_writer(
    mut outbound_rx: mpsc::Receiver<ControllerToAgent>,
    mut writer: WriteHalf<TlsStream<TcpStream>>,
    session: Arc<AgentSession>,
) {
    let closed = session.closed();
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            frame = outbound_rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = write_frame(&mut writer, &frame).await {
                        warn!(
                            identity = %session.identity(),
                            error = %e,
                            "Stream write failed, faulting session"
                        );
                        session.close();
                        break;
                    }
                }
                None => break,
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Read frames from the agent until the stream ends or faults.
async fn run_session_receiver(
    reader: &mut ReadHalf<TlsStream<TcpStream>>,
    session: &Arc<AgentSession>,
) {
    let closed = session.closed();
    loop {
        let frame = tokio::select! {
            _ = closed.cancelled() => return,
            frame = read_frame::<_, AgentToController>(reader) => frame,
        };

        match frame {
            Ok(Some(AgentToController::Ping(ping))) => {
                session.record_ping();
                let pong = ControllerToAgent::Pong(PingResponse {
                    ts: now_millis(),
                    echoed_ts: ping.ts,
                });
                if session.sender().send(pong).await.is_err() {
                    return;
                }
            }
            Ok(Some(AgentToController::HttpResponse(header))) => {
                session.route_response(ResponseEvent::Header(header)).await;
            }
            Ok(Some(AgentToController::HttpChunk(chunk))) => {
                session.route_response(ResponseEvent::Chunk(chunk)).await;
            }
            Ok(Some(other)) => {
                warn!(
                    identity = %session.identity(),
                    frame_type = ?other.frame_type(),
                    "Protocol violation on live session, closing"
                );
                return;
            }
            Ok(None) => {
                debug!(identity = %session.identity(), "Agent closed the stream");
                return;
            }
            Err(e) => {
                warn!(
                    identity = %session.identity(),
                    error = %e,
                    "Stream read failed, faulting session"
                );
                return;
            }
        }
    }
}
