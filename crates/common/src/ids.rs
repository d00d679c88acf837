//! Type-safe identifier newtypes for the burrow tunnel.
//!
//! These types provide compile-time safety for identifiers, preventing
//! accidental mixing of different ID types (e.g., passing a SessionId
//! where a RequestId is expected).
//!
//! # Request identifiers
//!
//! Request ids correlate every frame belonging to one in-flight request, so
//! they must be unique for the controller process lifetime and sort in mint
//! order. [`RequestIdMinter`] produces monotonic ULIDs, whose canonical
//! 26-character form is lexicographically sortable.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::{Generator, Ulid};
use uuid::Uuid;

/// Short name of an agent, derived from the first dot-separated label of
/// the common name in its verified client certificate.
///
/// Several concurrent sessions may share one identity; they are
/// interchangeable targets for request routing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AgentIdentity(String);

impl AgentIdentity {
    /// Create from an already-extracted label.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Derive the identity from a certificate common name: the first
    /// dot-separated label (`"a1.agents.example"` becomes `"a1"`).
    pub fn from_common_name(common_name: &str) -> Self {
        let label = common_name.split('.').next().unwrap_or(common_name);
        Self(label.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for AgentIdentity {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Correlation key for one in-flight tunnelled request.
///
/// Minted by [`RequestIdMinter`]; lexicographically sortable and strictly
/// increasing within a controller process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(String);

impl RequestId {
    /// Wrap an id received on the wire.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for RequestId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Mints monotonically increasing request ids.
///
/// ULIDs embed a millisecond timestamp followed by randomness; the
/// generator bumps the random component for ids minted within the same
/// millisecond, so successive ids always sort after earlier ones.
pub struct RequestIdMinter {
    generator: Mutex<Generator>,
}

impl RequestIdMinter {
    pub fn new() -> Self {
        Self {
            generator: Mutex::new(Generator::new()),
        }
    }

    /// Mint the next request id.
    pub fn next_id(&self) -> RequestId {
        let mut generator = self.generator.lock();
        // Generation only fails when the random component overflows within
        // a single millisecond; a fresh ULID keeps the timestamp ordering.
        let ulid = generator.generate().unwrap_or_else(|_| Ulid::new());
        RequestId(ulid.to_string())
    }
}

impl Default for RequestIdMinter {
    fn default() -> Self {
        Self::new()
    }
}

/// Unique identifier for one live agent stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionId(String);

impl SessionId {
    /// Create a new random session id.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
