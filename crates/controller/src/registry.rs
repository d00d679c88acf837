//! Registry of connected agent sessions.
//!
//! Maps an agent identity to the set of currently live sessions for it.
//! Sessions enter after their hello has been accepted and leave when the
//! stream closes or faults; the `agents_connected` gauge tracks
//! membership per identity.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use tracing::info;

use burrow_common::{core_metrics, AgentIdentity};
use burrow_tunnel_protocol::SessionStatistics;

use crate::session::AgentSession;

/// Identity -> live sessions. Lock hold times are map operations only;
/// `pick` hands out a session reference without blocking for the
/// request's duration.
#[derive(Default)]
pub struct AgentRegistry {
    sessions: RwLock<HashMap<String, Vec<Arc<AgentSession>>>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session after its handshake.
    pub fn register(&self, session: Arc<AgentSession>) {
        let identity = session.identity().to_string();
        self.sessions
            .write()
            .entry(identity.clone())
            .or_default()
            .push(session.clone());
        core_metrics()
            .agents_connected
            .with_label_values(&[&identity])
            .inc();
        info!(
            identity = %identity,
            session_id = %session.session_id(),
            "Agent session registered"
        );
    }

    /// Remove a session. Safe to call for sessions that were never (or
    /// are no longer) registered.
    pub fn unregister(&self, session: &AgentSession) {
        let identity = session.identity().to_string();
        let removed = {
            let mut sessions = self.sessions.write();
            let Some(list) = sessions.get_mut(&identity) else {
                return;
            };
            let before = list.len();
            list.retain(|s| s.session_id() != session.session_id());
            let removed = before != list.len();
            if list.is_empty() {
                sessions.remove(&identity);
            }
            removed
        };
        if removed {
            core_metrics()
                .agents_connected
                .with_label_values(&[&identity])
                .dec();
            info!(
                identity = %identity,
                session_id = %session.session_id(),
                "Agent session unregistered"
            );
        }
    }

    /// Choose uniformly at random among the live sessions for an
    /// identity.
    pub fn pick(&self, identity: &AgentIdentity) -> Option<Arc<AgentSession>> {
        let sessions = self.sessions.read();
        let live: Vec<&Arc<AgentSession>> = sessions
            .get(identity.as_str())?
            .iter()
            .filter(|s| s.is_live())
            .collect();
        live.choose(&mut rand::thread_rng())
            .map(|s| Arc::clone(*s))
    }

    /// Put every session into draining for controller shutdown: new
    /// requests are refused, responses keep flowing.
    pub fn drain_all(&self) {
        for session in self.sessions.read().values().flatten() {
            session.start_draining();
        }
    }

    /// Requests still outstanding across all sessions.
    pub fn outstanding_total(&self) -> usize {
        self.sessions
            .read()
            .values()
            .flatten()
            .map(|s| s.outstanding_requests())
            .sum()
    }

    /// Snapshot of every registered session, for the statistics exchange.
    pub fn statistics(&self) -> Vec<SessionStatistics> {
        self.sessions
            .read()
            .values()
            .flatten()
            .map(|s| s.statistics())
            .collect()
    }

    /// Number of registered sessions for an identity (test aid).
    pub fn session_count(&self, identity: &AgentIdentity) -> usize {
        self.sessions
            .read()
            .get(identity.as_str())
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn live_session(identity: &str) -> Arc<AgentSession> {
        let (session, _rx) = AgentSession::new(AgentIdentity::new(identity));
        session.mark_live();
        session
    }

    #[test]
    fn test_register_unregister_tracks_gauge() {
        let registry = AgentRegistry::new();
        let gauge = core_metrics()
            .agents_connected
            .with_label_values(&["reg-gauge"]);
        let base = gauge.get();

        let s1 = live_session("reg-gauge");
        let s2 = live_session("reg-gauge");
        registry.register(s1.clone());
        registry.register(s2.clone());
        assert_eq!(gauge.get(), base + 2);
        assert_eq!(registry.session_count(s1.identity()), 2);

        registry.unregister(&s1);
        assert_eq!(gauge.get(), base + 1);

        // Double unregister must not double-decrement.
        registry.unregister(&s1);
        assert_eq!(gauge.get(), base + 1);

        registry.unregister(&s2);
        assert_eq!(gauge.get(), base);
        assert_eq!(registry.session_count(s2.identity()), 0);
    }

    #[test]
    fn test_pick_missing_identity() {
        let registry = AgentRegistry::new();
        assert!(registry.pick(&AgentIdentity::new("absent")).is_none());
    }

    #[test]
    fn test_pick_skips_closed_sessions() {
        let registry = AgentRegistry::new();
        let session = live_session("reg-closed");
        registry.register(session.clone());
        session.close();
        assert!(registry.pick(session.identity()).is_none());
    }

    #[test]
    fn test_pick_is_uniform() {
        let registry = AgentRegistry::new();
        let sessions: Vec<_> = (0..3).map(|_| live_session("reg-uniform")).collect();
        for s in &sessions {
            registry.register(s.clone());
        }

        let mut counts: HashMap<String, u32> = HashMap::new();
        let picks = 10_000;
        for _ in 0..picks {
            let chosen = registry
                .pick(&AgentIdentity::new("reg-uniform"))
                .expect("sessions registered");
            *counts.entry(chosen.session_id().to_string()).or_default() += 1;
        }

        assert_eq!(counts.len(), 3);
        // Chi-squared against the uniform expectation; 2 degrees of
        // freedom, threshold comfortably above the p=0.001 critical value.
        let expected = picks as f64 / 3.0;
        let chi_squared: f64 = counts
            .values()
            .map(|&observed| {
                let diff = observed as f64 - expected;
                diff * diff / expected
            })
            .sum();
        assert!(
            chi_squared < 20.0,
            "pick distribution too skewed: chi^2 = {chi_squared}, counts = {counts:?}"
        );
    }

    #[test]
    fn test_statistics_lists_every_session() {
        let registry = AgentRegistry::new();
        registry.register(live_session("reg-stats-a"));
        registry.register(live_session("reg-stats-a"));
        registry.register(live_session("reg-stats-b"));

        let stats = registry.statistics();
        let for_a = stats.iter().filter(|s| s.identity == "reg-stats-a").count();
        let for_b = stats.iter().filter(|s| s.identity == "reg-stats-b").count();
        assert_eq!(for_a, 2);
        assert_eq!(for_b, 1);
    }
}
