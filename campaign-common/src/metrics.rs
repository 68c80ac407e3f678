use std::time::Instant;

use axum::{
    body::Body, extract::MatchedPath, http::Request, middleware::Next, response::IntoResponse,
    routing::get, Router,
};
use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

pub const IDENTIFIERS_ALLOCATED: &str = "campaign_identifiers_allocated_total";
pub const IDENTIFIER_FALLBACKS: &str = "campaign_identifier_fallbacks_total";
pub const FILTER_ROWS_REMOVED: &str = "campaign_filter_rows_removed_total";
pub const TARGET_WRITES: &str = "campaign_target_writes_total";
pub const TARGET_WRITE_DURATION: &str = "campaign_target_write_duration_seconds";

/// Bind a `TcpListener` on the provided bind address and serve a `Router` on it.
pub async fn serve(router: Router, bind: &str) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, router).await?;

    Ok(())
}

/// Install the Prometheus recorder and mount its `/metrics` endpoint on `router`.
pub fn setup_metrics_routes(router: Router) -> Result<Router, BuildError> {
    let recorder_handle = setup_metrics_recorder()?;
    describe_campaign_metrics();

    Ok(router
        .route(
            "/metrics",
            get(move || std::future::ready(recorder_handle.render())),
        )
        .layer(axum::middleware::from_fn(track_metrics)))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

fn describe_campaign_metrics() {
    describe_counter!(
        IDENTIFIERS_ALLOCATED,
        "Campaign and bonus identifiers handed out, by family"
    );
    describe_counter!(
        IDENTIFIER_FALLBACKS,
        "Identifiers derived from the clock because the max scan failed"
    );
    describe_counter!(
        FILTER_ROWS_REMOVED,
        "Population rows removed by each filter stage"
    );
    describe_counter!(TARGET_WRITES, "Deployment target writes, by table and outcome");
    describe_histogram!(
        TARGET_WRITE_DURATION,
        Unit::Seconds,
        "Time spent writing one deployment target"
    );
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}
