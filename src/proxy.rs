use crate::error::{describe, json_error_response, ProxyErrorCode};
use crate::forward::Forwarder;
use crate::lifecycle::LifecycleController;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Per-route state shared by every connection the route accepts
struct RouteContext {
    name: String,
    target_port: u16,
    lifecycle: Arc<LifecycleController>,
    forwarder: Arc<Forwarder>,
}

/// One listener forwarding to one backend port.
///
/// Every request counts as cluster activity and waits for the shared
/// lifecycle controller to report the cluster up before it is relayed.
pub struct ProxyRoute {
    bind_addr: SocketAddr,
    context: Arc<RouteContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyRoute {
    pub fn new(
        name: impl Into<String>,
        bind_addr: SocketAddr,
        target_port: u16,
        lifecycle: Arc<LifecycleController>,
        forwarder: Arc<Forwarder>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context: Arc::new(RouteContext {
                name: name.into(),
                target_port,
                lifecycle,
                forwarder,
            }),
            shutdown_rx,
        }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await.map_err(|e| {
            anyhow::anyhow!(
                "Route '{}' failed to bind {}: {}",
                self.context.name,
                self.bind_addr,
                e
            )
        })?;
        self.serve(listener).await
    }

    /// Serve on an already-bound listener until shutdown
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(
            route = %self.context.name,
            addr = %addr,
            target_port = self.context.target_port,
            "Proxy route listening"
        );

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, addr, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(route = %self.context.name, error = %e, "Failed to accept connection");
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!(route = %self.context.name, "Proxy route shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(
    stream: S,
    addr: SocketAddr,
    context: Arc<RouteContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context, addr).await }
    });

    // HTTP/1.1 and h2c
    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<RouteContext>,
    client_addr: SocketAddr,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, hyper::Error> {
    let request_id = Uuid::new_v4().to_string();
    let route = context.name.as_str();
    let (parts, body) = req.into_parts();

    // Buffer the whole body before acting so content-length can be recomputed
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(route, request_id, error = %e, "Failed to read request body");
            return Ok(json_error_response(
                ProxyErrorCode::BadRequest,
                "Failed to read request body",
            ));
        }
    };

    context.lifecycle.record_activity();

    debug!(
        route,
        request_id,
        client = %client_addr,
        method = %parts.method,
        uri = %parts.uri,
        body_len = body.len(),
        "Incoming request"
    );

    // CORS preflight never touches the cluster
    if parts.method == Method::OPTIONS {
        return Ok(no_content());
    }

    if let Err(e) = context.lifecycle.ensure_up().await {
        warn!(route, request_id, error = %e, "Cluster unavailable");
        return Ok(json_error_response(
            ProxyErrorCode::ClusterUnavailable,
            e.to_string(),
        ));
    }

    match context
        .forwarder
        .forward(parts, body, context.target_port)
        .await
    {
        Ok(response) => {
            debug!(route, request_id, status = %response.status(), "Forwarded request");
            Ok(response)
        }
        Err(e) => {
            let message = describe(&e);
            error!(
                route,
                request_id,
                port = context.target_port,
                error = %message,
                "Failed to forward request"
            );
            Ok(json_error_response(ProxyErrorCode::ForwardFailed, message))
        }
    }
}

fn no_content() -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::cluster::ShellCommandControl;
    use crate::forward::PoolConfig;
    use crate::lifecycle::LifecycleSettings;
    use crate::probe::HealthProbe;
    use std::time::Duration;

    #[test]
    fn test_no_content_response() {
        let response = no_content();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(response.headers().is_empty());
    }

    #[tokio::test]
    async fn test_serve_exits_when_shutdown_sender_dropped() {
        let lifecycle = LifecycleController::new(
            Arc::new(ShellCommandControl::new(vec!["true".into()], vec!["true".into()])),
            Arc::new(HealthProbe::new(None, Duration::from_millis(100)).for_port(1)),
            LifecycleSettings {
                startup_timeout: Duration::from_secs(1),
                probe_interval: Duration::from_millis(100),
                idle_timeout: None,
            },
        );
        let forwarder = Arc::new(Forwarder::new(PoolConfig::default(), None).unwrap());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let route = ProxyRoute::new("write", addr, 1, lifecycle, forwarder, shutdown_rx);

        drop(shutdown_tx);
        let result = tokio::time::timeout(Duration::from_secs(1), route.serve(listener))
            .await
            .expect("route stops serving");
        assert!(result.is_ok());
    }
}
