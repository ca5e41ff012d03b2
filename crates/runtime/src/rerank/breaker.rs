//! Per-endpoint circuit breaker for reranker backends.
//!
//! Standard Closed → Open → Half-Open state machine. An open circuit is
//! treated like a reranker timeout upstream: the engine falls back to the
//! fused ordering instead of failing the query.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Circuit breaker state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation. Requests flow through.
    Closed,
    /// Failures exceeded threshold. Requests are immediately rejected.
    Open { opened_at: Instant },
    /// Recovery testing. A limited number of requests are allowed through.
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            half_open_max_calls: 2,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    state: CircuitState,
    failure_count: u32,
    half_open_calls: u32,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            state: CircuitState::Closed,
            failure_count: 0,
            half_open_calls: 0,
        }
    }

    /// Whether a request may proceed right now.
    pub fn check(&mut self, endpoint: &str) -> bool {
        match &self.state {
            CircuitState::Closed => true,
            CircuitState::Open { opened_at } => {
                if opened_at.elapsed() >= self.config.recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    self.half_open_calls = 1;
                    tracing::info!(endpoint, "Reranker circuit transitioning to HalfOpen");
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self, endpoint: &str) {
        match self.state {
            CircuitState::HalfOpen => {
                self.state = CircuitState::Closed;
                self.failure_count = 0;
                self.half_open_calls = 0;
                tracing::info!(endpoint, "Reranker circuit recovered, now Closed");
            }
            _ => {
                self.failure_count = 0;
                self.state = CircuitState::Closed;
            }
        }
    }

    pub fn record_failure(&mut self, endpoint: &str) {
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.config.failure_threshold {
                    self.state = CircuitState::Open {
                        opened_at: Instant::now(),
                    };
                    tracing::warn!(
                        endpoint,
                        failures = self.failure_count,
                        "Reranker circuit tripped OPEN"
                    );
                }
            }
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open {
                    opened_at: Instant::now(),
                };
                self.half_open_calls = 0;
                tracing::warn!(endpoint, "Reranker circuit recovery failed, back to OPEN");
            }
            CircuitState::Open { .. } => {
                self.failure_count += 1;
            }
        }
    }

    pub fn state(&self) -> &CircuitState {
        &self.state
    }
}

/// Registry of breakers for all reranker endpoints.
pub struct CircuitBreakerRegistry {
    breakers: Arc<RwLock<HashMap<String, CircuitBreaker>>>,
    default_config: CircuitBreakerConfig,
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            breakers: Arc::new(RwLock::new(HashMap::new())),
            default_config,
        }
    }

    pub async fn check(&self, endpoint: &str) -> bool {
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()))
            .check(endpoint)
    }

    pub async fn record_success(&self, endpoint: &str) {
        let mut breakers = self.breakers.write().await;
        if let Some(breaker) = breakers.get_mut(endpoint) {
            breaker.record_success(endpoint);
        }
    }

    pub async fn record_failure(&self, endpoint: &str) {
        let mut breakers = self.breakers.write().await;
        breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| CircuitBreaker::new(self.default_config.clone()))
            .record_failure(endpoint);
    }
}
