//! Protocol constants and deployment defaults.

use std::time::Duration;

/// Version of the protocol the agent and controller speak. Increased only
/// for incompatible frame changes. If an agent connects to a controller
/// and the versions do not match, the controller closes the stream.
pub const PROTOCOL_VERSION: u32 = 10;

/// Default port agents dial for the tunnel stream.
pub const DEFAULT_TUNNEL_PORT: u16 = 9001;

/// Default port the controller serves client-facing HTTPS on.
pub const DEFAULT_API_PORT: u16 = 9002;

/// Default port for the Prometheus text endpoint.
pub const DEFAULT_PROMETHEUS_PORT: u16 = 9102;

/// Maximum encoded frame size (type byte + payload).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Keepalive tick period. A session with no ping for three ticks is
/// considered dead.
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(30);

/// Missed keepalive ticks tolerated before a session is faulted.
pub const KEEPALIVE_MISS_BUDGET: u32 = 3;

/// Timeout for dialing the controller and for the hello handshake.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Bound of the per-session outbound channel and the agent's dataflow
/// channel. A full channel backpressures the producer.
pub const CHANNEL_BOUND: usize = 20;

/// Response bodies are relayed in chunks of at most this many bytes.
pub const RESPONSE_CHUNK_SIZE: usize = 10 * 1024;

/// Period between backend credential reloads on the agent.
pub const CREDENTIAL_REFRESH_PERIOD: Duration = Duration::from_secs(600);

/// The HTTP tunnelling protocol advertised in the agent hello and named
/// in each forwarded request.
pub const PROTOCOL_KUBERNETES: &str = "kubernetes";
