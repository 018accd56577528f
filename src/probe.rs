//! Health probe for the backend cluster
//!
//! A probe is a single side-effect-free JSON-RPC call (`eth_blockNumber`) sent
//! to a target port. Any 2xx response counts as healthy; the body is ignored.

use crate::config::SHARED_SECRET_HEADER;
use crate::error::{describe, ProbeError};
use futures::future::BoxFuture;
use futures::FutureExt;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tracing::debug;

/// Request body sent by every probe
pub const PROBE_PAYLOAD: &str = r#"{"jsonrpc":"2.0","method":"eth_blockNumber","params":[],"id":1}"#;

/// Something that can tell whether the cluster is ready to serve traffic
pub trait HealthCheck: Send + Sync {
    /// Run one check attempt
    fn check(&self) -> BoxFuture<'_, Result<(), ProbeError>>;
}

/// Stateless JSON-RPC prober, cheap to clone
#[derive(Clone)]
pub struct HealthProbe {
    client: Client<HttpConnector, Full<Bytes>>,
    shared_secret: Option<String>,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(shared_secret: Option<String>, timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.set_connect_timeout(Some(timeout));

        // Probes are rare; don't keep connections to a cluster that may be torn down.
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Self {
            client,
            shared_secret: shared_secret.filter(|s| !s.is_empty()),
            timeout,
        }
    }

    /// Probe `target_port` once, returning the (opaque) response body on success
    pub async fn probe(&self, target_port: u16) -> Result<Bytes, ProbeError> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(format!("http://127.0.0.1:{}/", target_port))
            .header(hyper::header::CONTENT_TYPE, "application/json");
        if let Some(ref secret) = self.shared_secret {
            builder = builder.header(SHARED_SECRET_HEADER, secret);
        }

        let req = builder
            .body(Full::new(Bytes::from_static(PROBE_PAYLOAD.as_bytes())))
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        let attempt = async {
            let response = self
                .client
                .request(req)
                .await
                .map_err(|e| ProbeError::Request(describe(&e)))?;

            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| ProbeError::Request(describe(&e)))?
                .to_bytes();

            if !status.is_success() {
                return Err(ProbeError::Status(status.as_u16()));
            }
            Ok(body)
        };

        match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => {
                if let Err(ref e) = result {
                    debug!(port = target_port, error = %e, "Probe failed");
                }
                result
            }
            Err(_) => {
                debug!(port = target_port, timeout_ms = self.timeout.as_millis(), "Probe timed out");
                Err(ProbeError::Timeout(self.timeout))
            }
        }
    }

    /// Bind this prober to one target port
    pub fn for_port(self, target_port: u16) -> TargetProbe {
        TargetProbe {
            probe: self,
            target_port,
        }
    }
}

/// A [`HealthProbe`] aimed at a fixed port
#[derive(Clone)]
pub struct TargetProbe {
    probe: HealthProbe,
    target_port: u16,
}

impl TargetProbe {
    pub fn target_port(&self) -> u16 {
        self.target_port
    }
}

impl HealthCheck for TargetProbe {
    fn check(&self) -> BoxFuture<'_, Result<(), ProbeError>> {
        async move { self.probe.probe(self.target_port).await.map(|_| ()) }.boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Incoming;
    use hyper::service::service_fn;
    use hyper::{Response, StatusCode};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Serve every request with `status`, recording the last secret header seen
    async fn spawn_backend(status: StatusCode) -> (u16, Arc<parking_lot::Mutex<Option<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let seen = Arc::new(parking_lot::Mutex::new(None));
        let seen_clone = Arc::clone(&seen);

        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let seen = Arc::clone(&seen_clone);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let seen = Arc::clone(&seen);
                        async move {
                            *seen.lock() = req
                                .headers()
                                .get(SHARED_SECRET_HEADER)
                                .and_then(|v| v.to_str().ok())
                                .map(String::from);
                            Ok::<_, Infallible>(
                                Response::builder()
                                    .status(status)
                                    .body(Full::new(Bytes::from(r#"{"result":"0x10"}"#)))
                                    .unwrap(),
                            )
                        }
                    });
                    let _ = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        (port, seen)
    }

    async fn unused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_probe_success_on_2xx() {
        let (port, _) = spawn_backend(StatusCode::OK).await;
        let probe = HealthProbe::new(None, Duration::from_secs(2));

        let body = probe.probe(port).await.unwrap();
        assert_eq!(&body[..], br#"{"result":"0x10"}"#);
    }

    #[tokio::test]
    async fn test_probe_failure_on_non_2xx() {
        let (port, _) = spawn_backend(StatusCode::INTERNAL_SERVER_ERROR).await;
        let probe = HealthProbe::new(None, Duration::from_secs(2));

        match probe.probe(port).await {
            Err(ProbeError::Status(500)) => {}
            other => panic!("expected status failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_probe_failure_on_connection_refused() {
        let port = unused_port().await;
        let probe = HealthProbe::new(None, Duration::from_secs(2));

        assert!(matches!(probe.probe(port).await, Err(ProbeError::Request(_))));
    }

    #[tokio::test]
    async fn test_probe_times_out_on_silent_backend() {
        // Accepts connections but never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let probe = HealthProbe::new(None, Duration::from_millis(200));
        assert!(matches!(probe.probe(port).await, Err(ProbeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_probe_sends_shared_secret() {
        let (port, seen) = spawn_backend(StatusCode::OK).await;
        let probe = HealthProbe::new(Some("hunter2".to_string()), Duration::from_secs(2));

        probe.probe(port).await.unwrap();
        assert_eq!(seen.lock().as_deref(), Some("hunter2"));
    }

    #[tokio::test]
    async fn test_target_probe_health_check() {
        let (port, _) = spawn_backend(StatusCode::NO_CONTENT).await;
        let target = HealthProbe::new(None, Duration::from_secs(2)).for_port(port);

        assert_eq!(target.target_port(), port);
        assert!(target.check().await.is_ok());
    }
}
