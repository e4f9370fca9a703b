//! C4: ConnectionPool / CircuitBreaker — managed outbound endpoints with
//! keep-alive, a connection cap, and failure isolation (`spec.md` §4.4).

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorRateLimiter};
use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};

use crate::clock::Clock;

type EndpointLimiter = GovernorRateLimiter<NotKeyed, InMemoryState, DefaultClock>;

#[derive(Debug, Clone)]
pub struct PoolDefaults {
    pub max_conn: usize,
    pub keepalive: StdDuration,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub health_interval: StdDuration,
    pub requests_per_sec: NonZeroU32,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            max_conn: 10,
            keepalive: StdDuration::from_secs(90),
            failure_threshold: 5,
            recovery_timeout: Duration::seconds(60),
            health_interval: StdDuration::from_secs(30),
            requests_per_sec: NonZeroU32::new(50).unwrap(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<DateTime<Utc>>,
}

impl Breaker {
    fn new() -> Self {
        Self { state: CircuitState::Closed, consecutive_failures: 0, opened_at: None }
    }

    fn allows(&mut self, now: DateTime<Utc>, recovery_timeout: Duration) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let Some(opened_at) = self.opened_at else { return true };
                if now > opened_at + recovery_timeout {
                    self.state = CircuitState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.opened_at = None;
    }

    fn record_failure(&mut self, now: DateTime<Utc>, failure_threshold: u32) {
        self.consecutive_failures += 1;
        if self.state == CircuitState::HalfOpen || self.consecutive_failures >= failure_threshold {
            self.state = CircuitState::Open;
            self.opened_at = Some(now);
        }
    }
}

/// An outbound endpoint's pool: a connection-count cap, a breaker, and a
/// token-bucket rate limiter.
struct Endpoint {
    breaker: Breaker,
    permits: Arc<Semaphore>,
    limiter: EndpointLimiter,
    last_used: DateTime<Utc>,
}

/// Held while a caller is using a permit; releases it on drop.
pub struct EndpointLease {
    _permit: tokio::sync::OwnedSemaphorePermit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireError {
    CircuitOpen,
    RateLimited,
}

/// Process-wide registry of named pools keyed by target endpoint
/// (`spec.md` §4.4; generalizes the teacher's per-scope breaker to also
/// cap in-flight connections per endpoint).
pub struct ConnectionPool {
    defaults: PoolDefaults,
    endpoints: RwLock<HashMap<String, Endpoint>>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolHealth {
    pub endpoint: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    pub in_flight: usize,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(defaults: PoolDefaults, clock: Arc<dyn Clock>) -> Self {
        Self { defaults, endpoints: RwLock::new(HashMap::new()), clock }
    }

    /// Acquires a connection permit for `endpoint` if its breaker allows
    /// requests and it is within its rate quota, blocking only on the
    /// semaphore (never on the breaker or the limiter).
    pub async fn acquire(&self, endpoint: &str) -> Result<EndpointLease, AcquireError> {
        let now = self.clock.now();
        let permits = {
            let mut endpoints = self.endpoints.write().await;
            let entry = endpoints.entry(endpoint.to_string()).or_insert_with(|| Endpoint {
                breaker: Breaker::new(),
                permits: Arc::new(Semaphore::new(self.defaults.max_conn)),
                limiter: GovernorRateLimiter::direct(Quota::per_second(self.defaults.requests_per_sec)),
                last_used: now,
            });
            if !entry.breaker.allows(now, self.defaults.recovery_timeout) {
                return Err(AcquireError::CircuitOpen);
            }
            if entry.limiter.check().is_err() {
                return Err(AcquireError::RateLimited);
            }
            entry.last_used = now;
            entry.permits.clone()
        };

        let permit = permits.acquire_owned().await.expect("semaphore never closed");
        Ok(EndpointLease { _permit: permit })
    }

    pub async fn record_success(&self, endpoint: &str) {
        let mut endpoints = self.endpoints.write().await;
        if let Some(entry) = endpoints.get_mut(endpoint) {
            entry.breaker.record_success();
        }
    }

    pub async fn record_failure(&self, endpoint: &str) {
        let now = self.clock.now();
        let mut endpoints = self.endpoints.write().await;
        if let Some(entry) = endpoints.get_mut(endpoint) {
            entry.breaker.record_failure(now, self.defaults.failure_threshold);
        }
    }

    pub async fn state(&self, endpoint: &str) -> Option<CircuitState> {
        self.endpoints.read().await.get(endpoint).map(|e| e.breaker.state)
    }

    /// Drops idle endpoint pools whose last use exceeds `keepalive`
    /// (`spec.md` §4.4 "idle expiry"). Intended to be called periodically
    /// by a background sweep task owned by the lifecycle object.
    pub async fn sweep_idle(&self) {
        let now = self.clock.now();
        let keepalive = Duration::from_std(self.defaults.keepalive).unwrap_or_default();
        self.endpoints.write().await.retain(|_, e| now - e.last_used < keepalive);
    }

    /// Health snapshot for `GET /health` (`spec.md` §6).
    pub async fn health(&self) -> Vec<PoolHealth> {
        self.endpoints
            .read()
            .await
            .iter()
            .map(|(name, e)| PoolHealth {
                endpoint: name.clone(),
                state: e.breaker.state.as_str(),
                consecutive_failures: e.breaker.consecutive_failures,
                in_flight: self.defaults.max_conn - e.permits.available_permits(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;

    fn pool() -> ConnectionPool {
        ConnectionPool::new(
            PoolDefaults { failure_threshold: 2, recovery_timeout: Duration::seconds(0), max_conn: 2, ..Default::default() },
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn opens_after_threshold_and_half_opens_immediately_on_zero_timeout() {
        let p = pool();
        p.record_failure("search").await;
        p.record_failure("search").await;
        assert_eq!(p.state("search").await, Some(CircuitState::Open));

        // recovery_timeout = 0 means the very next acquire flips to half-open.
        let lease = p.acquire("search").await;
        assert!(lease.is_ok());
        assert_eq!(p.state("search").await, Some(CircuitState::HalfOpen));
    }

    #[tokio::test]
    async fn success_closes_circuit() {
        let p = pool();
        p.record_failure("search").await;
        p.record_failure("search").await;
        p.record_success("search").await;
        assert_eq!(p.state("search").await, Some(CircuitState::Closed));
    }

    #[tokio::test]
    async fn connection_cap_limits_in_flight() {
        let p = pool();
        let _l1 = p.acquire("search").await.unwrap();
        let _l2 = p.acquire("search").await.unwrap();
        let health = p.health().await;
        assert_eq!(health[0].in_flight, 2);
    }
}
