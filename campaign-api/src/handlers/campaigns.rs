use std::time::Instant;

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use serde_derive::Deserialize;
use serde_json::Value;
use tracing::{debug, error};

use campaign_common::deployment::DeploymentOptions;
use campaign_common::filter_spec::FilterSpecification;
use campaign_common::metadata::{CampaignKind, CampaignMetadata};
use campaign_common::population::PopulationBatch;
use campaign_engine::engine::{CampaignEngine, CampaignOutcome};
use campaign_engine::filters::PipelineStats;
use campaign_engine::identifiers::AllocatedIdentifiers;

type HandlerError = (StatusCode, Json<ErrorResponse>);

#[derive(Serialize, Deserialize, Debug)]
pub struct ErrorResponse {
    error: String,
}

#[derive(Deserialize, Debug)]
pub struct IdentifierRequestBody {
    campaign_type: String,
}

pub async fn post_identifiers(
    State(engine): State<CampaignEngine>,
    Json(payload): Json<IdentifierRequestBody>,
) -> Result<Json<AllocatedIdentifiers>, HandlerError> {
    let kind = parse_kind(&payload.campaign_type)?;

    Ok(Json(engine.allocate_identifier(kind).await))
}

#[derive(Deserialize, Debug)]
pub struct FilterRequestBody {
    population: PopulationBatch,
    #[serde(default)]
    filters: FilterSpecification,
}

#[derive(Serialize, Debug)]
pub struct FilterResponse {
    population: PopulationBatch,
    stats: PipelineStats,
}

pub async fn post_filter(
    State(engine): State<CampaignEngine>,
    Json(payload): Json<FilterRequestBody>,
) -> Json<FilterResponse> {
    debug!(
        rows = payload.population.len(),
        "received filter request: {:?}", payload.filters
    );

    let (population, stats) = engine
        .run_filter_pipeline(&payload.population, &payload.filters)
        .await;

    Json(FilterResponse { population, stats })
}

/// The body of a request to create and deploy a campaign.
#[derive(Deserialize, Debug)]
pub struct CampaignRequestBody {
    campaign_type: String,
    metadata: Value,
    population: PopulationBatch,
    #[serde(default)]
    filters: Option<FilterSpecification>,
    #[serde(default)]
    deploy_options: Option<DeploymentOptions>,
}

/// Partial deployments are still a 200: the body says which targets failed.
pub async fn post_campaign(
    State(engine): State<CampaignEngine>,
    Json(payload): Json<CampaignRequestBody>,
) -> Result<Json<CampaignOutcome>, HandlerError> {
    let kind = parse_kind(&payload.campaign_type)?;
    let metadata = CampaignMetadata::from_value(kind, payload.metadata)
        .map_err(|e| bad_request(&e.to_string()))?;

    let start_time = Instant::now();

    let outcome = engine
        .create_campaign(
            kind,
            metadata,
            &payload.population,
            payload.filters.as_ref(),
            payload.deploy_options.as_ref(),
        )
        .await
        .map_err(|e| bad_request(&e.to_string()))?;

    metrics::histogram!("campaign_api_create_duration_seconds")
        .record(start_time.elapsed().as_secs_f64());

    Ok(Json(outcome))
}

fn parse_kind(raw: &str) -> Result<CampaignKind, HandlerError> {
    raw.parse::<CampaignKind>()
        .map_err(|e| bad_request(&e.to_string()))
}

fn bad_request(msg: &str) -> HandlerError {
    error!(msg);
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: msg.to_owned(),
        }),
    )
}
