//! Transport abstraction for inter-agent requests.
//!
//! Decouples the election and notification paths from any concrete network.
//! Production uses [`HttpTransport`]; tests and simulation harnesses use the
//! in-memory [`LoopbackNetwork`], which can partition links to exercise
//! minority-isolation scenarios.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Error type for transport operations.
///
/// During elections a failed request counts as a vote denied, never as a
/// grant; during observer notification failures are logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("endpoint {0} is unreachable")]
    Unreachable(String),
    #[error("request timed out")]
    Timeout,
    #[error("request failed: {0}")]
    Request(String),
}

/// HTTP-ish request methods carried by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMethod {
    Get,
    Post,
}

/// A unary request transport.
///
/// `unary` blocks the caller until the peer answers (or the deadline
/// passes); `notify` is fire-and-forget and must never block a commit path.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request and returns the response body.
    async fn unary(
        &self,
        method: RequestMethod,
        endpoint: &str,
        path_and_query: &str,
        body: Vec<u8>,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError>;

    /// Fire-and-forget delivery; the outcome is logged and dropped.
    async fn notify(&self, endpoint: &str, path_and_query: &str, body: Vec<u8>) {
        if let Err(e) = self
            .unary(RequestMethod::Post, endpoint, path_and_query, body, Some(NOTIFY_DEADLINE))
            .await
        {
            debug!(endpoint, path_and_query, error = %e, "notification dropped");
        }
    }
}

const NOTIFY_DEADLINE: Duration = Duration::from_secs(5);

/// Splits an observer-style URI into `(endpoint, path)`.
///
/// `http://host:port/some/path` becomes `("http://host:port", "/some/path")`.
/// Returns `None` when there is no path component after the authority.
pub fn split_url(url: &str) -> Option<(String, String)> {
    let scheme_end = url.find("://")? + 3;
    let path_start = url[scheme_end..].find('/')? + scheme_end;
    Some((url[..path_start].to_string(), url[path_start..].to_string()))
}

/// Parses the query part of a `path?key=value&...` string.
pub fn split_query(path_and_query: &str) -> (&str, HashMap<String, String>) {
    let Some((path, query)) = path_and_query.split_once('?') else {
        return (path_and_query, HashMap::new());
    };
    let params = query
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    (path, params)
}

// =============================================================================
// HTTP transport
// =============================================================================

/// Production transport over HTTP.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Self {
        Self { client: reqwest::Client::new() }
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn unary(
        &self,
        method: RequestMethod,
        endpoint: &str,
        path_and_query: &str,
        body: Vec<u8>,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let url = format!("{endpoint}{path_and_query}");
        let mut req = match method {
            RequestMethod::Get => self.client.get(&url),
            RequestMethod::Post => self.client.post(&url).body(body),
        };
        if let Some(deadline) = deadline {
            req = req.timeout(deadline);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Request(e.to_string())
            }
        })?;
        let bytes = resp.bytes().await.map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

// =============================================================================
// In-memory loopback network
// =============================================================================

/// Handles requests addressed to one loopback endpoint.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(&self, path_and_query: &str, body: &[u8]) -> Result<Vec<u8>, TransportError>;
}

/// Shared broker routing requests between [`LoopbackTransport`] instances.
///
/// Links can be cut per ordered pair to simulate partitions.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<LoopbackInner>>,
}

#[derive(Default)]
struct LoopbackInner {
    handlers: HashMap<String, Arc<dyn RequestHandler>>,
    cut: HashSet<(String, String)>,
    latency: HashMap<(String, String), Duration>,
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler reachable at `endpoint`.
    pub fn register(&self, endpoint: &str, handler: Arc<dyn RequestHandler>) {
        self.lock().handlers.insert(endpoint.to_string(), handler);
    }

    /// Creates a transport whose outgoing requests originate at `origin`.
    pub fn transport(&self, origin: &str) -> LoopbackTransport {
        LoopbackTransport { origin: origin.to_string(), network: self.clone() }
    }

    /// Cuts both directions between two endpoints.
    pub fn partition(&self, a: &str, b: &str) {
        let mut inner = self.lock();
        inner.cut.insert((a.to_string(), b.to_string()));
        inner.cut.insert((b.to_string(), a.to_string()));
    }

    /// Restores both directions between two endpoints.
    pub fn heal(&self, a: &str, b: &str) {
        let mut inner = self.lock();
        inner.cut.remove(&(a.to_string(), b.to_string()));
        inner.cut.remove(&(b.to_string(), a.to_string()));
    }

    /// Injects one-way delivery latency from `from` to `to`. The delay
    /// counts against the request's deadline, like time on the wire.
    pub fn set_latency(&self, from: &str, to: &str, delay: Duration) {
        self.lock().latency.insert((from.to_string(), to.to_string()), delay);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LoopbackInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// In-memory [`Transport`] implementation over a [`LoopbackNetwork`].
#[derive(Clone)]
pub struct LoopbackTransport {
    origin: String,
    network: LoopbackNetwork,
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn unary(
        &self,
        _method: RequestMethod,
        endpoint: &str,
        path_and_query: &str,
        body: Vec<u8>,
        deadline: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        let (handler, delay) = {
            let inner = self.network.lock();
            let link = (self.origin.clone(), endpoint.to_string());
            if inner.cut.contains(&link) {
                return Err(TransportError::Unreachable(endpoint.to_string()));
            }
            let handler = inner
                .handlers
                .get(endpoint)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(endpoint.to_string()))?;
            (handler, inner.latency.get(&link).copied())
        };
        let fut = async {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            handler.handle(path_and_query, &body).await
        };
        match deadline {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .map_err(|_| TransportError::Timeout)?,
            None => fut.await,
        }
    }
}

/// A transport that drops everything. Used where notification delivery is
/// irrelevant (single-node stores, unit tests).
#[derive(Debug, Clone, Copy, Default)]
pub struct NullTransport;

#[async_trait]
impl Transport for NullTransport {
    async fn unary(
        &self,
        _method: RequestMethod,
        endpoint: &str,
        _path_and_query: &str,
        _body: Vec<u8>,
        _deadline: Option<Duration>,
    ) -> Result<Vec<u8>, TransportError> {
        Err(TransportError::Unreachable(endpoint.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_url() {
        assert_eq!(
            split_url("http://x:4001/cb"),
            Some(("http://x:4001".to_string(), "/cb".to_string()))
        );
        assert_eq!(split_url("http://x"), None);
        assert_eq!(split_url("no-scheme/cb"), None);
    }

    #[test]
    fn test_split_query() {
        let (path, params) = split_query("/_api/agency_priv/requestVote?term=3&candidateId=1");
        assert_eq!(path, "/_api/agency_priv/requestVote");
        assert_eq!(params.get("term").map(String::as_str), Some("3"));
        assert_eq!(params.get("candidateId").map(String::as_str), Some("1"));
        let (path, params) = split_query("/plain");
        assert_eq!(path, "/plain");
        assert!(params.is_empty());
    }

    struct Echo;

    #[async_trait]
    impl RequestHandler for Echo {
        async fn handle(&self, _path: &str, body: &[u8]) -> Result<Vec<u8>, TransportError> {
            Ok(body.to_vec())
        }
    }

    #[tokio::test]
    async fn test_loopback_roundtrip() {
        let net = LoopbackNetwork::new();
        net.register("http://b", Arc::new(Echo));
        let t = net.transport("http://a");
        let out = t
            .unary(RequestMethod::Post, "http://b", "/x", b"hi".to_vec(), None)
            .await
            .unwrap();
        assert_eq!(out, b"hi");
    }

    #[tokio::test]
    async fn test_loopback_partition_and_heal() {
        let net = LoopbackNetwork::new();
        net.register("http://b", Arc::new(Echo));
        let t = net.transport("http://a");
        net.partition("http://a", "http://b");
        let err = t
            .unary(RequestMethod::Post, "http://b", "/x", vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
        net.heal("http://a", "http://b");
        assert!(t.unary(RequestMethod::Post, "http://b", "/x", vec![], None).await.is_ok());
    }

    #[tokio::test]
    async fn test_latency_delays_but_delivers_within_deadline() {
        let net = LoopbackNetwork::new();
        net.register("http://b", Arc::new(Echo));
        net.set_latency("http://a", "http://b", Duration::from_millis(50));
        let t = net.transport("http://a");

        let started = tokio::time::Instant::now();
        let out = t
            .unary(
                RequestMethod::Post,
                "http://b",
                "/x",
                b"hi".to_vec(),
                Some(Duration::from_millis(200)),
            )
            .await
            .unwrap();
        assert_eq!(out, b"hi");
        assert!(started.elapsed() >= Duration::from_millis(50));

        // The delay counts against the deadline.
        let err = t
            .unary(
                RequestMethod::Post,
                "http://b",
                "/x",
                vec![],
                Some(Duration::from_millis(10)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Timeout));
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_unreachable() {
        let net = LoopbackNetwork::new();
        let t = net.transport("http://a");
        let err = t
            .unary(RequestMethod::Get, "http://nowhere", "/x", vec![], None)
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
