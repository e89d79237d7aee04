use axum::{
    extract::{DefaultBodyLimit, Request, State as AxumState},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use governor::middleware::NoOpMiddleware;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::Backend;

mod http;

pub struct Api {
    backend: Arc<Backend>,
}

type IpGovernorConfig =
    tower_governor::governor::GovernorConfig<SmartIpKeyExtractor, NoOpMiddleware>;

/// Sliding-window limit on score submission: `burst` requests per `window`
/// per client IP, expressed as GCRA replenish period + burst size.
fn submit_governor_config(window: Duration, burst: u32) -> Option<IpGovernorConfig> {
    if window.is_zero() || burst == 0 {
        return None;
    }
    let nanos_per_request = (window.as_nanos() as u64 / burst as u64).max(1);
    GovernorConfigBuilder::default()
        .period(Duration::from_nanos(nanos_per_request))
        .burst_size(burst)
        .key_extractor(SmartIpKeyExtractor)
        .finish()
}

impl Api {
    pub fn new(backend: Arc<Backend>) -> Self {
        Self { backend }
    }

    pub fn router(&self) -> Router {
        let cors = CorsLayer::new()
            .allow_origin(AllowOrigin::any())
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::CONTENT_TYPE,
                header::HeaderName::from_static("x-admin-token"),
                header::HeaderName::from_static("x-request-id"),
            ])
            .expose_headers([header::HeaderName::from_static("x-request-id")]);

        let window = Duration::from_secs(self.backend.config.submit_window_secs);
        let submit_route = match submit_governor_config(window, self.backend.config.submit_burst)
        {
            Some(config) => {
                tracing::info!(
                    window_secs = window.as_secs(),
                    burst = self.backend.config.submit_burst,
                    "submission rate limit configured"
                );
                Router::new()
                    .route("/api/score", post(http::submit_score))
                    .layer(GovernorLayer {
                        config: Arc::new(config),
                    })
            }
            None => {
                tracing::warn!("submission rate limiting disabled");
                Router::new().route("/api/score", post(http::submit_score))
            }
        };

        let router = Router::new()
            .route("/healthz", get(http::healthz))
            .route("/api/leaderboard", get(http::leaderboard))
            .route("/api/issue-code", post(http::issue_code))
            .route("/api/verify-code", post(http::verify_code))
            .route("/api/use-code", post(http::use_code))
            .route("/api/finalize", post(http::finalize))
            .route("/api/winners", get(http::winners))
            .route("/metrics/ops", get(http::ops_metrics))
            .route("/metrics/prometheus", get(http::prometheus_metrics));

        let router = router.merge(submit_route);
        let router = router.layer(cors);
        let router = match self.backend.config.http_body_limit_bytes {
            Some(limit) if limit > 0 => router.layer(DefaultBodyLimit::max(limit)),
            _ => router,
        };
        let router = router.layer(middleware::from_fn_with_state(
            self.backend.clone(),
            request_id_middleware,
        ));
        let router = router.layer(TraceLayer::new_for_http());

        router.with_state(self.backend.clone())
    }
}

async fn request_id_middleware(
    AxumState(backend): AxumState<Arc<Backend>>,
    req: Request,
    next: Next,
) -> Response {
    let request_id = req
        .headers()
        .get(header::HeaderName::from_static("x-request-id"))
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();
    let mut response = next.run(req).await;
    if response.status() == StatusCode::TOO_MANY_REQUESTS {
        backend.metrics().inc_rate_limited();
    }
    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(
            header::HeaderName::from_static("x-request-id"),
            header_value,
        );
    }
    tracing::info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "http.request"
    );
    response
}
