//! Pooled HTTP client that relays buffered requests to a backend port
//!
//! Requests arrive fully buffered, so the body is re-framed with an accurate
//! content-length. Responses are streamed back without buffering.

use crate::config::SHARED_SECRET_HEADER;
use crate::error::ForwardError;
use http::request::Parts;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderValue, CONTENT_LENGTH, HOST, TRANSFER_ENCODING};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Statistics for forwarded traffic
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Requests handed to the backend
    pub total_requests: AtomicU64,
    /// Requests that failed at the network level
    pub failures: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

/// Configuration for the connection pool
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections per target port
    pub max_idle_per_host: usize,
    /// Idle connection timeout
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Relays requests to backend ports over pooled connections
pub struct Forwarder {
    client: Client<HttpConnector, Full<Bytes>>,
    shared_secret: Option<HeaderValue>,
    stats: Arc<ForwardStats>,
    config: PoolConfig,
}

impl Forwarder {
    pub fn new(config: PoolConfig, shared_secret: Option<&str>) -> anyhow::Result<Self> {
        let shared_secret = shared_secret
            .filter(|s| !s.is_empty())
            .map(HeaderValue::from_str)
            .transpose()
            .map_err(|e| anyhow::anyhow!("Shared secret is not a valid header value: {}", e))?;

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "Connection pool initialized"
        );

        Ok(Self {
            client,
            shared_secret,
            stats: Arc::new(ForwardStats::default()),
            config,
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Send a buffered request to `target_port` and return the streamed response
    pub async fn forward(
        &self,
        parts: Parts,
        body: Bytes,
        target_port: u16,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri: Uri = format!("http://127.0.0.1:{}{}", target_port, path)
            .parse()
            .map_err(|e: http::uri::InvalidUri| ForwardError::RequestBuild(e.to_string()))?;

        let headers = rewrite_headers(
            &parts.headers,
            target_port,
            body.len(),
            self.shared_secret.as_ref(),
        );

        let mut backend_req = Request::new(Full::new(body));
        *backend_req.method_mut() = parts.method;
        *backend_req.uri_mut() = uri;
        *backend_req.headers_mut() = headers;

        self.stats.record_request();

        let response = match self.client.request(backend_req).await {
            Ok(response) => response,
            Err(e) => {
                self.stats.record_failure();
                return Err(e.into());
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

/// Headers for the backend request: `host` points at the target, `content-length`
/// matches the buffered body, and the shared secret is added unless the caller sent one.
pub fn rewrite_headers(
    original: &HeaderMap,
    target_port: u16,
    body_len: usize,
    shared_secret: Option<&HeaderValue>,
) -> HeaderMap {
    let mut headers = original.clone();

    // The body is re-framed with an explicit length
    headers.remove(TRANSFER_ENCODING);

    if let Ok(host) = HeaderValue::from_str(&format!("127.0.0.1:{}", target_port)) {
        headers.insert(HOST, host);
    }
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));

    if let Some(secret) = shared_secret {
        if !headers.contains_key(SHARED_SECRET_HEADER) {
            headers.insert(SHARED_SECRET_HEADER, secret.clone());
        }
    }

    headers
}
