//! External capability interfaces used by task handlers (`spec.md` §6).
//!
//! Each is a narrow `async_trait` so handlers can be tested against a
//! `Simulated*` implementation without a network dependency, in the same
//! spirit as `resource_manager::HostMetrics`.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::connection_pool::ConnectionPool;
use crate::domain::money::Usd;
use crate::domain::{OpsError, OpsResult};

#[async_trait]
pub trait Search: Send + Sync {
    async fn search(&self, query: &str) -> OpsResult<Vec<String>>;
}

#[async_trait]
pub trait Synthesize: Send + Sync {
    async fn synthesize(&self, sources: &[String]) -> OpsResult<String>;
}

/// Read-side usage counters for a knowledge-base entry over some window.
#[derive(Debug, Clone, Copy, Default)]
pub struct UsageStats {
    pub views: u64,
    pub refs: u64,
}

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    async fn write(&self, key: &str, content: &str) -> OpsResult<()>;

    /// Whether a knowledge entry for `category`/`slug` already exists.
    async fn exists(&self, category: &str, slug: &str) -> OpsResult<bool>;

    /// View/reference counters for `path` since `since`.
    async fn usage_stats(&self, path: &str, since: DateTime<Utc>) -> OpsResult<UsageStats>;
}

#[async_trait]
pub trait Vcs: Send + Sync {
    async fn commit(&self, message: &str, payload: &Value) -> OpsResult<String>;
}

/// The routing tier a capability call was dispatched to, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingTier {
    Local,
    Mcp,
    Frontier,
}

/// One operational event recorded by the fleet: a task failure or a
/// routed capability call, depending on `kind` at the call site.
#[derive(Debug, Clone)]
pub struct OperationalEvent {
    pub reason: String,
    pub tier: Option<RoutingTier>,
    pub cost_usd: Usd,
    pub occurred_at: DateTime<Utc>,
}

#[async_trait]
pub trait Telemetry: Send + Sync {
    fn record_task_outcome(&self, kind: &str, succeeded: bool);

    /// Raw operational events of `kind` (e.g. `"task_failure"`,
    /// `"routing_spend"`) recorded since `since`.
    async fn operational_history(&self, kind: &str, since: DateTime<Utc>) -> OpsResult<Vec<OperationalEvent>>;
}

/// Deterministic stand-ins used when no capability endpoint is configured
/// (`spec.md` §6 Non-goals: no real search/VCS integration in this system).
pub struct SimulatedSearch;
#[async_trait]
impl Search for SimulatedSearch {
    async fn search(&self, query: &str) -> OpsResult<Vec<String>> {
        Ok(vec![format!("simulated-result-for:{query}")])
    }
}

pub struct SimulatedSynthesize;
#[async_trait]
impl Synthesize for SimulatedSynthesize {
    async fn synthesize(&self, sources: &[String]) -> OpsResult<String> {
        Ok(format!("synthesis of {} sources", sources.len()))
    }
}

pub struct SimulatedKnowledgeStore;
#[async_trait]
impl KnowledgeStore for SimulatedKnowledgeStore {
    async fn write(&self, _key: &str, _content: &str) -> OpsResult<()> {
        Ok(())
    }

    async fn exists(&self, _category: &str, _slug: &str) -> OpsResult<bool> {
        Ok(false)
    }

    async fn usage_stats(&self, _path: &str, _since: DateTime<Utc>) -> OpsResult<UsageStats> {
        Ok(UsageStats::default())
    }
}

pub struct SimulatedVcs;
#[async_trait]
impl Vcs for SimulatedVcs {
    async fn commit(&self, message: &str, _payload: &Value) -> OpsResult<String> {
        Ok(format!("simulated-commit:{message}"))
    }
}

pub struct SimulatedTelemetry;
#[async_trait]
impl Telemetry for SimulatedTelemetry {
    fn record_task_outcome(&self, _kind: &str, _succeeded: bool) {}

    async fn operational_history(&self, _kind: &str, _since: DateTime<Utc>) -> OpsResult<Vec<OperationalEvent>> {
        Ok(vec![])
    }
}

/// `reqwest`-backed `Search` client routed through the connection pool so
/// a real search/synthesis endpoint shares the same circuit breaker and
/// connection cap as every other outbound call. No such endpoint is
/// configured by default (`spec.md` §6 Non-goals); this exists to show
/// the shape of a real integration without committing to a vendor.
pub struct HttpSearchClient {
    http: reqwest::Client,
    pool: Arc<ConnectionPool>,
    endpoint: String,
}

impl HttpSearchClient {
    #[must_use]
    pub fn new(endpoint: String, pool: Arc<ConnectionPool>) -> Self {
        Self { http: reqwest::Client::new(), pool, endpoint }
    }
}

#[async_trait]
impl Search for HttpSearchClient {
    async fn search(&self, query: &str) -> OpsResult<Vec<String>> {
        let _lease = self.pool.acquire(&self.endpoint).await.map_err(|_| OpsError::UpstreamUnavailable("circuit open".into()))?;

        let result = self.http.get(&self.endpoint).query(&[("q", query)]).send().await;
        match result {
            Ok(resp) if resp.status().is_success() => {
                self.pool.record_success(&self.endpoint).await;
                let body: Vec<String> = resp.json().await.map_err(|e| OpsError::Internal(e.to_string()))?;
                Ok(body)
            }
            Ok(resp) => {
                self.pool.record_failure(&self.endpoint).await;
                Err(OpsError::UpstreamUnavailable(format!("search endpoint returned {}", resp.status())))
            }
            Err(e) => {
                self.pool.record_failure(&self.endpoint).await;
                Err(OpsError::UpstreamUnavailable(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::connection_pool::PoolDefaults;

    #[tokio::test]
    async fn simulated_search_echoes_query() {
        let results = SimulatedSearch.search("rust async").await.unwrap();
        assert_eq!(results, vec!["simulated-result-for:rust async".to_string()]);
    }

    #[tokio::test]
    async fn http_search_client_parses_successful_response() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::UrlEncoded("q".into(), "rust async".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"["hit-one", "hit-two"]"#)
            .create_async()
            .await;

        let pool = Arc::new(ConnectionPool::new(PoolDefaults::default(), Arc::new(SystemClock)));
        let client = HttpSearchClient::new(format!("{}/search", server.url()), pool);

        let results = client.search("rust async").await.unwrap();
        assert_eq!(results, vec!["hit-one".to_string(), "hit-two".to_string()]);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn http_search_client_maps_server_error_to_upstream_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server.mock("GET", "/search").with_status(503).create_async().await;

        let pool = Arc::new(ConnectionPool::new(PoolDefaults::default(), Arc::new(SystemClock)));
        let client = HttpSearchClient::new(format!("{}/search", server.url()), pool);

        let err = client.search("anything").await.unwrap_err();
        assert!(matches!(err, OpsError::UpstreamUnavailable(_)));
    }
}
