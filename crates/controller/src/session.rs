//! Controller-side agent session.
//!
//! One [`AgentSession`] owns a connected agent stream end to end: the send
//! side (a bounded channel drained by the writer task), the table of
//! outstanding requests, and the liveness bookkeeping. Sharing with the
//! rest of the controller happens only through the registry, which hands
//! out the session as an opaque reference whose operations are internally
//! synchronised.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use burrow_common::{now_millis, AgentIdentity, RequestId, SessionId};
use burrow_tunnel_protocol::defaults::{CHANNEL_BOUND, KEEPALIVE_MISS_BUDGET, KEEPALIVE_PERIOD};
use burrow_tunnel_protocol::{
    ControllerToAgent, HttpChunkedResponse, HttpRequest, HttpResponse, SessionStatistics,
};

/// Session lifecycle. Only `Live` sessions are visible in the registry;
/// a faulted session goes straight to `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Live,
    Draining,
    Closed,
}

/// One frame of a relayed response, delivered to the inbound HTTP
/// handler through its per-request channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseEvent {
    Header(HttpResponse),
    Chunk(HttpChunkedResponse),
}

impl ResponseEvent {
    fn request_id(&self) -> &str {
        match self {
            ResponseEvent::Header(h) => &h.id,
            ResponseEvent::Chunk(c) => &c.id,
        }
    }

    fn is_terminator(&self) -> bool {
        matches!(self, ResponseEvent::Chunk(c) if c.is_terminator())
    }
}

/// Why an enqueue was refused.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EnqueueError {
    /// The session is shutting down or already closed.
    #[error("agent session is gone")]
    AgentGone,
    /// The outbound channel is full beyond its fixed bound.
    #[error("agent session is backpressured")]
    Backpressured,
}

/// One connected agent stream.
pub struct AgentSession {
    identity: AgentIdentity,
    session_id: SessionId,
    connected_at: u64,
    last_ping: AtomicU64,
    last_use: AtomicU64,
    state: Mutex<SessionState>,
    outbound: mpsc::Sender<ControllerToAgent>,
    requests: Mutex<HashMap<RequestId, mpsc::Sender<ResponseEvent>>>,
    shutdown: CancellationToken,
}

impl AgentSession {
    /// Create a session in the `Handshaking` state. The returned receiver
    /// is the drain side of the outbound channel; the caller hands it to
    /// the writer task together with the write half of the stream.
    pub fn new(identity: AgentIdentity) -> (Arc<Self>, mpsc::Receiver<ControllerToAgent>) {
        let (outbound, outbound_rx) = mpsc::channel(CHANNEL_BOUND);
        let now = now_millis();
        let session = Arc::new(Self {
            identity,
            session_id: SessionId::new(),
            connected_at: now,
            last_ping: AtomicU64::new(now),
            last_use: AtomicU64::new(now),
            state: Mutex::new(SessionState::Handshaking),
            outbound,
            requests: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
        });
        (session, outbound_rx)
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn session_id(&self) -> &SessionId {
        &self.session_id
    }

    /// Admit the session after its hello has been validated.
    pub fn mark_live(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Handshaking {
            *state = SessionState::Live;
        }
    }

    pub fn is_live(&self) -> bool {
        *self.state.lock() == SessionState::Live
    }

    /// Stop accepting new requests while in-flight ones run to
    /// completion. Used during controller shutdown.
    pub fn start_draining(&self) {
        let mut state = self.state.lock();
        if *state == SessionState::Live {
            *state = SessionState::Draining;
        }
    }

    /// Cancelled once the session is closed; the writer task and the
    /// watchdog key their shutdown off it.
    pub fn closed(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// A handle onto the outbound channel, for cancel frames and pongs.
    pub fn sender(&self) -> mpsc::Sender<ControllerToAgent> {
        self.outbound.clone()
    }

    pub fn record_ping(&self) {
        self.last_ping.store(now_millis(), Ordering::Relaxed);
    }

    fn touch_last_use(&self) {
        self.last_use.store(now_millis(), Ordering::Relaxed);
    }

    /// Register `sink` for the request id and hand the request frame to
    /// the writer. The id is removed again if the frame cannot be queued.
    pub fn enqueue(
        &self,
        request: HttpRequest,
        sink: mpsc::Sender<ResponseEvent>,
    ) -> Result<(), EnqueueError> {
        if !self.is_live() {
            return Err(EnqueueError::AgentGone);
        }

        let id = RequestId::from_string(request.id.clone());
        self.requests.lock().insert(id.clone(), sink);

        match self
            .outbound
            .try_send(ControllerToAgent::HttpRequest(request))
        {
            Ok(()) => {
                self.touch_last_use();
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.requests.lock().remove(&id);
                Err(EnqueueError::Backpressured)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.requests.lock().remove(&id);
                Err(EnqueueError::AgentGone)
            }
        }
    }

    /// Route a response frame from the stream to its request sink.
    /// Frames bearing unknown ids are logged and dropped. A terminating
    /// empty chunk removes the id from the table and closes its sink.
    pub async fn route_response(&self, event: ResponseEvent) {
        let id = RequestId::from_string(event.request_id().to_string());
        let terminal = event.is_terminator();

        let sink = {
            let mut requests = self.requests.lock();
            if terminal {
                requests.remove(&id)
            } else {
                requests.get(&id).cloned()
            }
        };

        match sink {
            Some(sink) => {
                self.touch_last_use();
                // Blocks when the handler is slow to drain; the stream
                // receive loop shares fate with the client connection.
                let _ = sink.send(event).await;
            }
            None => {
                debug!(
                    identity = %self.identity,
                    request_id = %id,
                    "Dropping response frame for unknown request id"
                );
            }
        }
    }

    /// Remove a finished request from the table.
    pub fn finish_request(&self, id: &RequestId) {
        self.requests.lock().remove(id);
    }

    /// Number of outstanding requests (test and statistics aid).
    pub fn outstanding_requests(&self) -> usize {
        self.requests.lock().len()
    }

    /// Snapshot for the operator statistics exchange.
    pub fn statistics(&self) -> SessionStatistics {
        SessionStatistics {
            identity: self.identity.to_string(),
            session_id: self.session_id.to_string(),
            connected_at: self.connected_at,
            last_ping: self.last_ping.load(Ordering::Relaxed),
            last_use: self.last_use.load(Ordering::Relaxed),
        }
    }

    /// Close the session. Idempotent. Every still-open request sink is
    /// sent a terminating empty chunk (best effort) so the inbound
    /// handler returns cleanly, then dropped.
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if *state == SessionState::Closed {
                return;
            }
            *state = SessionState::Closed;
        }
        self.shutdown.cancel();

        let outstanding: Vec<(RequestId, mpsc::Sender<ResponseEvent>)> =
            self.requests.lock().drain().collect();
        if !outstanding.is_empty() {
            warn!(
                identity = %self.identity,
                session_id = %self.session_id,
                outstanding = outstanding.len(),
                "Closing session with outstanding requests"
            );
        }
        for (id, sink) in outstanding {
            let terminator = HttpChunkedResponse::terminator(
                id.into_string(),
                self.identity.to_string(),
            );
            let _ = sink.try_send(ResponseEvent::Chunk(terminator));
        }
    }

    /// Watch `last_ping` and close the session when the agent has been
    /// silent for the miss budget. Runs until the session closes.
    pub async fn run_watchdog(self: Arc<Self>) {
        let allowance = KEEPALIVE_PERIOD.as_millis() as u64 * KEEPALIVE_MISS_BUDGET as u64;
        let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // immediate first tick

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                _ = ticker.tick() => {
                    let silent_for = now_millis().saturating_sub(self.last_ping.load(Ordering::Relaxed));
                    if silent_for > allowance {
                        warn!(
                            identity = %self.identity,
                            session_id = %self.session_id,
                            silent_ms = silent_for,
                            "No ping from agent, faulting session"
                        );
                        self.close();
                        return;
                    }
                }
            }
        }
    }
}
