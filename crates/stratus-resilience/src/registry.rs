//! Process-wide registry of named circuit breakers

use dashmap::DashMap;
use std::sync::Arc;

use crate::breaker::{BreakerSettings, BreakerStatus, CircuitBreaker};

/// Get-or-create registry keyed by downstream target name.
///
/// Breakers live for the process lifetime; the first caller of a name fixes
/// its settings.
pub struct BreakerRegistry {
    defaults: BreakerSettings,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerSettings) -> Self {
        Self { defaults, breakers: DashMap::new() }
    }

    /// Fetch the breaker for `name`, creating it with default settings on
    /// first use
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.defaults.clone())))
            .clone()
    }

    /// Register a breaker with explicit settings, replacing any default one
    pub fn insert(&self, name: &str, settings: BreakerSettings) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(name, settings));
        self.breakers.insert(name.to_string(), breaker.clone());
        breaker
    }

    /// Look up without creating
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|entry| entry.clone())
    }

    /// Status snapshots of every registered breaker
    pub fn statuses(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> =
            self.breakers.iter().map(|entry| entry.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Names of breakers currently in a given state
    pub fn names_in_state(&self, state: crate::breaker::CircuitState) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .iter()
            .filter(|entry| entry.state() == state)
            .map(|entry| entry.key().clone())
            .collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::CircuitState;

    #[tokio::test]
    async fn get_returns_the_same_instance() {
        let registry = BreakerRegistry::new(BreakerSettings::default());
        let a = registry.get("database");
        let b = registry.get("database");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn statuses_cover_all_breakers() {
        let registry = BreakerRegistry::new(BreakerSettings::default());
        registry.get("database");
        registry.get("origin");
        let statuses = registry.statuses();
        let names: Vec<&str> = statuses.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["database", "origin"]);
    }

    #[tokio::test]
    async fn names_in_state_tracks_transitions() {
        let registry = BreakerRegistry::new(BreakerSettings::default());
        registry.get("healthy");
        registry.get("broken").force_open();

        assert_eq!(registry.names_in_state(CircuitState::Open), vec!["broken"]);
        assert_eq!(registry.names_in_state(CircuitState::Closed), vec!["healthy"]);
    }
}
