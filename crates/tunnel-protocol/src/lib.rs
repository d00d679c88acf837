//! Wire protocol for the burrow tunnel.
//!
//! This crate defines the frames exchanged between the controller and its
//! agents over a single long-lived, mutually authenticated stream: the
//! handshake hello, keepalive pings, tunnelled HTTP requests, chunked
//! responses, cancellation, and the operator statistics exchange.
//!
//! The on-wire encoding is length-prefixed framing: a big-endian u32
//! length, one frame-type byte, and a JSON payload. Exactly one arm of the
//! per-direction union is populated per frame; unknown frame types are
//! skipped for forward compatibility.

use std::time::Duration;
use thiserror::Error;

pub mod defaults;
pub mod frames;
pub mod wire;

pub use frames::{
    AgentHello, AgentToController, CancelRequest, ControllerToAgent, FrameType,
    HttpChunkedResponse, HttpRequest, HttpResponse, PingRequest, PingResponse,
    SessionStatistics, StatisticsRequest, StatisticsResponse,
};
pub use wire::{read_frame, write_frame, FrameUnion};

/// Tunnel protocol errors.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Unknown frame type: 0x{0:02x}")]
    UnknownFrameType(u8),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
