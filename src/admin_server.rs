//! Admin HTTP listener
//!
//! # Endpoints
//! - `GET /health` - control terminal health (200 healthy/degraded, 503 unhealthy)
//! - `GET /metrics` - Prometheus metrics, when enabled
//! - `GET /adv-varnish/esi/<type>` - edge-include fragment rendering
//! - `PURGE <path>` - ban by URL or tag, see [`PurgeHandler`]

use crate::error::{Result, VarnishError};
use crate::esi::{self, FragmentRegistry, FragmentResponse, ESI_PATH_PREFIX};
use crate::health_check::HealthCheckService;
use crate::purge_handler::PurgeHandler;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{Encoder, TextEncoder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Routes admin requests to health, metrics, fragment and purge handling
pub struct AdminServer {
    health: HealthCheckService,
    purge: PurgeHandler,
    fragments: FragmentRegistry,
    esi_max_age: u64,
    enable_metrics: bool,
}

impl AdminServer {
    pub fn new(health: HealthCheckService, purge: PurgeHandler) -> Self {
        Self {
            health,
            purge,
            fragments: FragmentRegistry::new(),
            esi_max_age: esi::DEFAULT_ESI_TTL,
            enable_metrics: true,
        }
    }

    pub fn with_fragments(mut self, fragments: FragmentRegistry, esi_max_age: u64) -> Self {
        self.fragments = fragments;
        self.esi_max_age = esi_max_age;
        self
    }

    pub fn with_metrics_enabled(mut self, enabled: bool) -> Self {
        self.enable_metrics = enabled;
        self
    }

    /// Bind `addr` and serve until the listener fails
    pub async fn serve(self: Arc<Self>, addr: SocketAddr) -> Result<()> {
        info!("Starting admin server on http://{}", addr);
        let listener = TcpListener::bind(addr).await?;
        self.serve_listener(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        info!("Admin server listening on http://{}", addr);
        info!("  GET   /health");
        if self.enable_metrics {
            info!("  GET   /metrics");
        }
        info!("  GET   {}<type>", ESI_PATH_PREFIX);
        info!("  PURGE <path>");

        loop {
            let (stream, _) = listener.accept().await?;
            let io = TokioIo::new(stream);
            let server = self.clone();

            tokio::task::spawn(async move {
                let result = http1::Builder::new()
                    .serve_connection(
                        io,
                        service_fn(move |req| {
                            let server = server.clone();
                            async move { Ok::<_, hyper::Error>(server.respond(req).await) }
                        }),
                    )
                    .await;

                if let Err(err) = result {
                    error!("Error serving admin connection: {:?}", err);
                }
            });
        }
    }

    /// Handle a request, turning handler errors into a 500
    pub async fn respond<B>(&self, req: Request<B>) -> Response<Full<Bytes>> {
        match self.handle(req).await {
            Ok(response) => response,
            Err(e) => {
                warn!("Admin request failed: {}", e);
                let mut response = Response::new(Full::new(Bytes::from(format!(
                    r#"{{"error":"{}"}}"#,
                    e.to_string().replace('"', "'")
                ))));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }

    async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>> {
        if req.method().as_str() == "PURGE" {
            return self.purge.handle_purge(req).await;
        }

        let path = req.uri().path().to_string();
        match (req.method(), path.as_str()) {
            (&Method::GET, "/health") => self.health_response().await,
            (&Method::GET, "/metrics") if self.enable_metrics => metrics_response(),
            (&Method::GET, p) if p.starts_with(ESI_PATH_PREFIX) => {
                self.fragment_response(p, req.uri().query()).await
            }
            _ => json(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.to_string()),
        }
    }

    async fn health_response(&self) -> Result<Response<Full<Bytes>>> {
        let report = self.health.check().await;
        let body = serde_json::to_string(&report)
            .map_err(|e| VarnishError::InternalError(format!("Failed to serialize health: {}", e)))?;
        json(report.status.to_status_code(), body)
    }

    async fn fragment_response(&self, path: &str, query: Option<&str>) -> Result<Response<Full<Bytes>>> {
        let Some((fragment_type, params)) = esi::parse_request(path, query) else {
            return json(StatusCode::NOT_FOUND, r#"{"error":"not found"}"#.to_string());
        };

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "text/html; charset=utf-8");

        // An unresolved fragment renders as nothing
        let body = match self.fragments.resolve(&fragment_type, &params).await {
            Some(fragment) => {
                let fragment = FragmentResponse::new(fragment, self.esi_max_age);
                for (name, value) in fragment.headers.iter() {
                    builder = builder.header(name, value);
                }
                fragment.body
            }
            None => String::new(),
        };

        builder
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| VarnishError::InternalError(format!("Failed to build response: {}", e)))
    }
}

fn metrics_response() -> Result<Response<Full<Bytes>>> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder
        .encode(&prometheus::gather(), &mut buffer)
        .map_err(|e| VarnishError::InternalError(format!("Failed to encode metrics: {}", e)))?;

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", encoder.format_type())
        .body(Full::new(Bytes::from(buffer)))
        .map_err(|e| VarnishError::InternalError(format!("Failed to build response: {}", e)))
}

fn json(status: StatusCode, body: String) -> Result<Response<Full<Bytes>>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .map_err(|e| VarnishError::InternalError(format!("Failed to build response: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VarnishConfig;
    use crate::cacheability::X_TAG;
    use crate::esi::{Fragment, FragmentHandler};
    use crate::fanout::FanoutCoordinator;
    use crate::invalidator::Invalidator;
    use async_trait::async_trait;
    use http_body_util::BodyExt;

    struct UserName;

    #[async_trait]
    impl FragmentHandler for UserName {
        async fn render(&self, _fragment_type: &str, _params: &[(String, String)]) -> Option<Fragment> {
            Some(Fragment::new("alice").with_tags(["user:1"]))
        }
    }

    fn server() -> AdminServer {
        let mut config = VarnishConfig::default();
        config.connection.control_terminal = "not-a-terminal".to_string();
        let coordinator = Arc::new(FanoutCoordinator::from_config(&config));
        let invalidator = Arc::new(Invalidator::new(coordinator.clone(), &config).unwrap());

        let mut fragments = FragmentRegistry::new();
        fragments.register("user-name", Arc::new(UserName));

        AdminServer::new(HealthCheckService::new(coordinator), PurgeHandler::new(invalidator))
            .with_fragments(fragments, 600)
    }

    fn get(uri: &str) -> Request<()> {
        Request::builder().method(Method::GET).uri(uri).body(()).unwrap()
    }

    async fn text(response: Response<Full<Bytes>>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_health_unhealthy_without_terminals() {
        let response = server().respond(get("/health")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert!(text(response).await.contains(r#""status":"unhealthy""#));
    }

    #[tokio::test]
    async fn test_fragment_route() {
        let response = server().respond(get("/adv-varnish/esi/user-name?x=1")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[X_TAG], "user:1");
        assert_eq!(response.headers()["x-ttl"], "600");
        assert_eq!(text(response).await, "alice");

        let response = server().respond(get("/adv-varnish/esi/unknown")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(text(response).await, "");
    }

    #[tokio::test]
    async fn test_metrics_can_be_disabled() {
        let response = server().with_metrics_enabled(false).respond(get("/metrics")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = server().respond(get("/metrics")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_purge_is_routed() {
        let req = Request::builder()
            .method(Method::from_bytes(b"PURGE").unwrap())
            .uri("/node/1")
            .body(())
            .unwrap();
        let response = server().respond(req).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = server().respond(get("/nope")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
