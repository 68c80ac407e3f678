use std::convert::Infallible;

use axum::{extract::DefaultBodyLimit, routing, Router};
use tower::limit::ConcurrencyLimitLayer;

use campaign_engine::engine::CampaignEngine;

use super::campaigns;

pub fn add_routes(
    router: Router,
    engine: CampaignEngine,
    max_body_size: usize,
    concurrency_limit: usize,
) -> Router {
    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(index))
        .route("/_liveness", routing::get(index))
        .route(
            "/campaigns/identifiers",
            routing::post(campaigns::post_identifiers).with_state(engine.clone()),
        )
        .route(
            "/campaigns/filter",
            routing::post(campaigns::post_filter)
                .with_state(engine.clone())
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
        .route(
            "/campaigns",
            routing::post(campaigns::post_campaign)
                .with_state(engine)
                .layer::<_, Infallible>(ConcurrencyLimitLayer::new(concurrency_limit))
                .layer(DefaultBodyLimit::max(max_body_size)),
        )
}

pub async fn index() -> &'static str {
    "campaign api"
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use campaign_common::datasets::InMemoryDatasets;
    use campaign_engine::test_utils::{engine, InMemoryIdentifierStore, RecordingWriter};
    use http_body_util::BodyExt; // for `collect`
    use std::sync::Arc;
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    #[tokio::test]
    async fn index() {
        let engine = engine(
            InMemoryIdentifierStore::new(),
            InMemoryDatasets::new(),
            Arc::new(RecordingWriter::new()),
        );
        let app = add_routes(Router::new(), engine, 1_000_000, 10);

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"campaign api");
    }
}
