use std::time::Instant;

use axum::body::Body;
use axum::extract::MatchedPath;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::future::ready;
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

use crate::health::HealthRegistry;

pub async fn index() -> &'static str {
    "classification alerter"
}

/// Index, readiness and liveness routes. Liveness reflects the registered
/// components of `liveness`.
pub fn router(liveness: HealthRegistry) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route(
            "/_liveness",
            get(move || ready(liveness.get_status())),
        )
}

/// Bind `bind` and serve `router` until the listener fails.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Add the prometheus endpoint and the request metrics middleware. Call last,
/// after every other route is in place.
pub fn setup_metrics_routes(router: Router, recorder_handle: PrometheusHandle) -> Router {
    router
        .route(
            "/metrics",
            get(move || ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics))
}

/// Install the process-wide prometheus recorder. Fails if one is already installed.
pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    metrics_builder()?.install_recorder()
}

/// Seconds buckets for everything, millisecond buckets for `*_ms` histograms.
fn metrics_builder() -> Result<PrometheusBuilder, BuildError> {
    const BUCKETS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 100.0, 250.0,
    ];
    const MS_BUCKETS: &[f64] = &[
        1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 2500.0, 5000.0, 10000.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(BUCKETS)?
        .set_buckets_for_metric(Matcher::Suffix("_ms".to_string()), MS_BUCKETS)
}

pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = match req.extensions().get::<MatchedPath>() {
        Some(matched_path) => matched_path.as_str().to_owned(),
        None => req.uri().path().to_owned(),
    };
    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", response.status().as_u16().to_string()),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
