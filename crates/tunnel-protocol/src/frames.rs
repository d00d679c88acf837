//! Frame payload types and the per-direction tagged unions.
//!
//! Each frame on the stream carries exactly one arm. The agent originates
//! [`AgentHello`], [`PingRequest`], [`HttpResponse`] and
//! [`HttpChunkedResponse`]; the controller originates [`PingResponse`],
//! [`HttpRequest`] and [`CancelRequest`]. The statistics pair is spoken by
//! operator clients on the same port in place of the agent hello.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::TunnelError;

/// Serde helper: raw bytes carried as base64 inside the JSON payload.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Frame type identifiers on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameType {
    // Agent -> controller
    AgentHello = 0x01,
    PingRequest = 0x02,
    HttpResponse = 0x03,
    HttpChunkedResponse = 0x04,

    // Controller -> agent
    PingResponse = 0x10,
    HttpRequest = 0x11,
    CancelRequest = 0x12,

    // Operator statistics exchange
    StatisticsRequest = 0x20,
    StatisticsResponse = 0x21,
}

impl TryFrom<u8> for FrameType {
    type Error = TunnelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameType::AgentHello),
            0x02 => Ok(FrameType::PingRequest),
            0x03 => Ok(FrameType::HttpResponse),
            0x04 => Ok(FrameType::HttpChunkedResponse),
            0x10 => Ok(FrameType::PingResponse),
            0x11 => Ok(FrameType::HttpRequest),
            0x12 => Ok(FrameType::CancelRequest),
            0x20 => Ok(FrameType::StatisticsRequest),
            0x21 => Ok(FrameType::StatisticsResponse),
            other => Err(TunnelError::UnknownFrameType(other)),
        }
    }
}

/// First frame from an agent: advertised protocols and protocol version.
///
/// The session is not admitted to the registry until this frame has been
/// accepted and the version matched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHello {
    /// Protocols the agent can serve (e.g. `"kubernetes"`).
    pub protocols: Vec<String>,
    /// Namespaces the agent's backend credentials are scoped to.
    #[serde(default)]
    pub kubernetes_namespaces: Vec<String>,
    /// Must equal [`crate::defaults::PROTOCOL_VERSION`] on the controller.
    pub protocol_version: u32,
}

/// Keepalive probe from the agent; `ts` is the sender's epoch-millisecond
/// clock, echoed back for RTT measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingRequest {
    pub ts: u64,
}

/// Keepalive reply from the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PingResponse {
    pub ts: u64,
    pub echoed_ts: u64,
}

/// A tunnelled HTTP request. The body is fully buffered; request-body
/// streaming is not part of this protocol revision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    /// Correlation key for every frame of this request.
    pub id: String,
    /// Agent identity the request was routed to.
    pub target: String,
    /// Tunnelling protocol the request belongs to.
    pub protocol: String,
    pub method: String,
    pub uri: String,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

/// Response header frame. At most one per request id; always precedes any
/// chunk frame. `content_length < 0` marks the body as chunked/unknown,
/// `0` means the response is complete at the header.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub id: String,
    pub target: String,
    pub status: u16,
    pub content_length: i64,
    #[serde(default)]
    pub headers: HashMap<String, Vec<String>>,
}

/// One slice of a response body. An empty body terminates the response;
/// no further frames bearing the id are accepted afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpChunkedResponse {
    pub id: String,
    pub target: String,
    #[serde(with = "base64_bytes", default)]
    pub body: Vec<u8>,
}

impl HttpChunkedResponse {
    /// The terminating frame for a request id.
    pub fn terminator(id: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            body: Vec::new(),
        }
    }

    /// Whether this chunk terminates the response.
    pub fn is_terminator(&self) -> bool {
        self.body.is_empty()
    }
}

/// Sent by the controller when the client disconnects before the response
/// has fully arrived.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub id: String,
}

/// Snapshot of one live session, as reported to operators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatistics {
    pub identity: String,
    pub session_id: String,
    /// Epoch milliseconds.
    pub connected_at: u64,
    pub last_ping: u64,
    pub last_use: u64,
}

/// Operator request for the controller's session snapshot. Sent as the
/// first frame on a fresh stream in place of [`AgentHello`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsRequest {}

/// The controller's answer to [`StatisticsRequest`]; the stream is closed
/// after it is written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatisticsResponse {
    pub agents: Vec<SessionStatistics>,
}

/// Frames flowing toward the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentToController {
    Hello(AgentHello),
    Ping(PingRequest),
    HttpResponse(HttpResponse),
    HttpChunk(HttpChunkedResponse),
    Statistics(StatisticsRequest),
}

/// Frames flowing away from the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerToAgent {
    Pong(PingResponse),
    HttpRequest(HttpRequest),
    Cancel(CancelRequest),
    Statistics(StatisticsResponse),
}

fn to_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, TunnelError> {
    serde_json::to_vec(value).map_err(|e| TunnelError::Serialization(e.to_string()))
}

fn from_payload<'a, T: Deserialize<'a>>(payload: &'a [u8]) -> Result<T, TunnelError> {
    serde_json::from_slice(payload).map_err(|e| TunnelError::InvalidFrame(e.to_string()))
}

impl AgentToController {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Hello(_) => FrameType::AgentHello,
            Self::Ping(_) => FrameType::PingRequest,
            Self::HttpResponse(_) => FrameType::HttpResponse,
            Self::HttpChunk(_) => FrameType::HttpChunkedResponse,
            Self::Statistics(_) => FrameType::StatisticsRequest,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, TunnelError> {
        match self {
            Self::Hello(f) => to_payload(f),
            Self::Ping(f) => to_payload(f),
            Self::HttpResponse(f) => to_payload(f),
            Self::HttpChunk(f) => to_payload(f),
            Self::Statistics(f) => to_payload(f),
        }
    }

    pub fn decode(frame_type: FrameType, payload: &[u8]) -> Result<Self, TunnelError> {
        match frame_type {
            FrameType::AgentHello => Ok(Self::Hello(from_payload(payload)?)),
            FrameType::PingRequest => Ok(Self::Ping(from_payload(payload)?)),
            FrameType::HttpResponse => Ok(Self::HttpResponse(from_payload(payload)?)),
            FrameType::HttpChunkedResponse => Ok(Self::HttpChunk(from_payload(payload)?)),
            FrameType::StatisticsRequest => Ok(Self::Statistics(from_payload(payload)?)),
            other => Err(TunnelError::ProtocolViolation(format!(
                "frame type {:?} is not valid toward the controller",
                other
            ))),
        }
    }
}

impl ControllerToAgent {
    pub fn frame_type(&self) -> FrameType {
        match self {
            Self::Pong(_) => FrameType::PingResponse,
            Self::HttpRequest(_) => FrameType::HttpRequest,
            Self::Cancel(_) => FrameType::CancelRequest,
            Self::Statistics(_) => FrameType::StatisticsResponse,
        }
    }

    pub fn encode_payload(&self) -> Result<Vec<u8>, TunnelError> {
        match self {
            Self::Pong(f) => to_payload(f),
            Self::HttpRequest(f) => to_payload(f),
            Self::Cancel(f) => to_payload(f),
            Self::Statistics(f) => to_payload(f),
        }
    }

    pub fn decode(frame_type: FrameType, payload: &[u8]) -> Result<Self, TunnelError> {
        match frame_type {
            FrameType::PingResponse => Ok(Self::Pong(from_payload(payload)?)),
            FrameType::HttpRequest => Ok(Self::HttpRequest(from_payload(payload)?)),
            FrameType::CancelRequest => Ok(Self::Cancel(from_payload(payload)?)),
            FrameType::StatisticsResponse => Ok(Self::Statistics(from_payload(payload)?)),
            other => Err(TunnelError::ProtocolViolation(format!(
                "frame type {:?} is not valid toward the agent",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::defaults::PROTOCOL_VERSION;

    fn roundtrip_a2c(frame: AgentToController) -> AgentToController {
        let payload = frame.encode_payload().unwrap();
        AgentToController::decode(frame.frame_type(), &payload).unwrap()
    }

    fn roundtrip_c2a(frame: ControllerToAgent) -> ControllerToAgent {
        let payload = frame.encode_payload().unwrap();
        ControllerToAgent::decode(frame.frame_type(), &payload).unwrap()
    }

    #[test]
    fn test_hello_roundtrip() {
        let frame = AgentToController::Hello(AgentHello {
            protocols: vec!["kubernetes".to_string()],
            kubernetes_namespaces: vec!["default".to_string(), "kube-system".to_string()],
            protocol_version: PROTOCOL_VERSION,
        });
        assert_eq!(roundtrip_a2c(frame.clone()), frame);
    }

    #[test]
    fn test_request_roundtrip_preserves_body_bytes() {
        let mut headers = HashMap::new();
        headers.insert(
            "Content-Type".to_string(),
            vec!["application/json".to_string()],
        );

        let frame = ControllerToAgent::HttpRequest(HttpRequest {
            id: "01ARZ3NDEKTSV4RRFFQ69G5FAV".to_string(),
            target: "a1".to_string(),
            protocol: "kubernetes".to_string(),
            method: "POST".to_string(),
            uri: "/api/v1/namespaces".to_string(),
            headers,
            body: vec![0x00, 0x01, 0xfe, 0xff, b'{', b'}'],
        });
        assert_eq!(roundtrip_c2a(frame.clone()), frame);
    }

    #[test]
    fn test_chunk_roundtrip_and_terminator() {
        let chunk = HttpChunkedResponse {
            id: "id-1".to_string(),
            target: "a1".to_string(),
            body: vec![1, 2, 3],
        };
        assert!(!chunk.is_terminator());

        let frame = AgentToController::HttpChunk(chunk);
        assert_eq!(roundtrip_a2c(frame.clone()), frame);

        let term = HttpChunkedResponse::terminator("id-1", "a1");
        assert!(term.is_terminator());
    }

    #[test]
    fn test_response_header_roundtrip() {
        let frame = AgentToController::HttpResponse(HttpResponse {
            id: "id-2".to_string(),
            target: "a1".to_string(),
            status: 200,
            content_length: -1,
            headers: HashMap::new(),
        });
        assert_eq!(roundtrip_a2c(frame.clone()), frame);
    }

    #[test]
    fn test_ping_pong_roundtrip() {
        let ping = AgentToController::Ping(PingRequest { ts: 123456 });
        assert_eq!(roundtrip_a2c(ping.clone()), ping);

        let pong = ControllerToAgent::Pong(PingResponse {
            ts: 123460,
            echoed_ts: 123456,
        });
        assert_eq!(roundtrip_c2a(pong.clone()), pong);
    }

    #[test]
    fn test_statistics_roundtrip() {
        let req = AgentToController::Statistics(StatisticsRequest::default());
        assert_eq!(roundtrip_a2c(req.clone()), req);

        let resp = ControllerToAgent::Statistics(StatisticsResponse {
            agents: vec![SessionStatistics {
                identity: "a1".to_string(),
                session_id: "s-1".to_string(),
                connected_at: 1,
                last_ping: 2,
                last_use: 3,
            }],
        });
        assert_eq!(roundtrip_c2a(resp.clone()), resp);
    }

    #[test]
    fn test_wrong_direction_rejected() {
        let pong = ControllerToAgent::Pong(PingResponse {
            ts: 1,
            echoed_ts: 0,
        });
        let payload = pong.encode_payload().unwrap();

        let err = AgentToController::decode(pong.frame_type(), &payload).unwrap_err();
        assert!(matches!(err, TunnelError::ProtocolViolation(_)));
    }

    #[test]
    fn test_unknown_frame_type_byte() {
        let err = FrameType::try_from(0x7f).unwrap_err();
        assert!(matches!(err, TunnelError::UnknownFrameType(0x7f)));
    }
}
