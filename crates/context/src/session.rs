//! Session context
//!
//! A session owns the route-decision cache for its caller. Sessions live in
//! a [`SessionRegistry`] held by the application state, so nothing is cached
//! process-wide and a request without a session id gets a throwaway context.

use crate::router::RouteDecision;
use graphforge_common::config::RouterConfig;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use uuid::Uuid;

/// Route decisions in insertion order, capped at `capacity`
#[derive(Debug)]
struct RouteCache {
    decisions: HashMap<String, RouteDecision>,
    order: VecDeque<String>,
    capacity: usize,
}

impl RouteCache {
    fn new(capacity: usize) -> Self {
        Self {
            decisions: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn insert_first(&mut self, key: String, decision: RouteDecision) -> RouteDecision {
        if let Some(existing) = self.decisions.get(&key) {
            return existing.clone();
        }

        while self.decisions.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.decisions.remove(&oldest);
                }
                None => break,
            }
        }

        self.order.push_back(key.clone());
        self.decisions.insert(key, decision.clone());
        decision
    }
}

/// Per-caller state passed through the answer path
#[derive(Debug)]
pub struct SessionContext {
    id: String,
    created_at: DateTime<Utc>,
    routes: Mutex<RouteCache>,
}

impl SessionContext {
    pub fn new(id: impl Into<String>) -> Self {
        Self::with_route_capacity(id, RouterConfig::default().max_cached_routes)
    }

    /// Session caching at most `max_cached_routes` decisions
    pub fn with_route_capacity(id: impl Into<String>, max_cached_routes: usize) -> Self {
        Self {
            id: id.into(),
            created_at: Utc::now(),
            routes: Mutex::new(RouteCache::new(max_cached_routes)),
        }
    }

    /// Context for a single request that names no session
    pub fn ephemeral() -> Self {
        Self::new(format!("ephemeral-{}", Uuid::new_v4()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn cached_route(&self, key: &str) -> Option<RouteDecision> {
        self.lock_routes().decisions.get(key).cloned()
    }

    /// Keep the first decision stored under `key`; later ones are ignored.
    /// A full cache drops its oldest entry.
    pub fn cache_route(&self, key: String, decision: RouteDecision) -> RouteDecision {
        self.lock_routes().insert_first(key, decision)
    }

    pub fn cached_routes(&self) -> usize {
        self.lock_routes().decisions.len()
    }

    // The cache stays consistent even if a holder panicked mid-insert
    fn lock_routes(&self) -> MutexGuard<'_, RouteCache> {
        self.routes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Live sessions keyed by caller-supplied id
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: Mutex<HashMap<String, Arc<SessionContext>>>,
    max_sessions: usize,
    max_cached_routes: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize, max_cached_routes: usize) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            max_sessions: max_sessions.max(1),
            max_cached_routes,
        }
    }

    pub fn from_config(config: &RouterConfig) -> Self {
        Self::new(config.max_sessions, config.max_cached_routes)
    }

    /// Existing session for `id`, or a fresh one. The oldest session is
    /// evicted when the registry is full.
    pub fn get_or_create(&self, id: &str) -> Arc<SessionContext> {
        let mut sessions = self.sessions.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(session) = sessions.get(id) {
            return session.clone();
        }

        if sessions.len() >= self.max_sessions {
            let oldest = sessions
                .values()
                .min_by_key(|s| s.created_at)
                .map(|s| s.id.clone());
            if let Some(oldest) = oldest {
                tracing::debug!(session_id = %oldest, "Evicting session");
                sessions.remove(&oldest);
            }
        }

        let session = Arc::new(SessionContext::with_route_capacity(id, self.max_cached_routes));
        sessions.insert(id.to_string(), session.clone());
        session
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().map(|s| s.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::from_config(&RouterConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::DecisionSource;
    use graphforge_common::models::Route;

    fn decision(route: Route) -> RouteDecision {
        RouteDecision {
            route,
            confidence: 0.9,
            source: DecisionSource::Heuristic,
            explanation: "test".to_string(),
        }
    }

    #[test]
    fn test_first_cached_decision_wins() {
        let session = SessionContext::new("s1");
        session.cache_route("k".to_string(), decision(Route::FastLookup));
        let kept = session.cache_route("k".to_string(), decision(Route::MultiHop));

        assert_eq!(kept.route, Route::FastLookup);
        assert_eq!(session.cached_route("k").map(|d| d.route), Some(Route::FastLookup));
        assert_eq!(session.cached_routes(), 1);
    }

    #[test]
    fn test_registry_reuses_and_evicts() {
        let registry = SessionRegistry::new(2, 8);
        let a = registry.get_or_create("a");
        let again = registry.get_or_create("a");
        assert!(Arc::ptr_eq(&a, &again));

        registry.get_or_create("b");
        registry.get_or_create("c");
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_route_cache_evicts_oldest_decision() {
        let registry = SessionRegistry::new(4, 2);
        let session = registry.get_or_create("long-lived");

        session.cache_route("first".to_string(), decision(Route::FastLookup));
        session.cache_route("second".to_string(), decision(Route::EntityFocused));
        // Re-caching an existing key neither grows nor reorders the cache
        session.cache_route("first".to_string(), decision(Route::MultiHop));
        session.cache_route("third".to_string(), decision(Route::MultiHop));

        assert_eq!(session.cached_routes(), 2);
        assert!(session.cached_route("first").is_none());
        assert_eq!(session.cached_route("second").map(|d| d.route), Some(Route::EntityFocused));
        assert_eq!(session.cached_route("third").map(|d| d.route), Some(Route::MultiHop));
    }

    #[test]
    fn test_ephemeral_sessions_are_distinct() {
        assert_ne!(SessionContext::ephemeral().id(), SessionContext::ephemeral().id());
    }
}
