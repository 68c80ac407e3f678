use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument};

use campaign_common::deployment::{DeploymentOptions, DeploymentPlan, DeploymentResult};
use campaign_common::filter_spec::FilterSpecification;
use campaign_common::identifier::CampaignIdentifier;
use campaign_common::metadata::{CampaignKind, CampaignMetadata, ValidationError};
use campaign_common::population::PopulationBatch;

use crate::deploy::DeploymentOrchestrator;
use crate::error::EngineError;
use crate::filters::{FilterPipeline, PipelineStats};
use crate::identifiers::{AllocatedIdentifiers, IdentifierAllocator};

/// Everything a campaign creation produced. Returned even when some targets failed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignOutcome {
    pub identifier: CampaignIdentifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonus_identifier: Option<CampaignIdentifier>,
    pub kind: CampaignKind,
    pub stats: PipelineStats,
    pub deployment: DeploymentResult,
    pub success: bool,
}

/// Allocates, filters and deploys campaigns.
#[derive(Clone)]
pub struct CampaignEngine {
    allocator: Arc<dyn IdentifierAllocator>,
    pipeline: FilterPipeline,
    orchestrator: DeploymentOrchestrator,
}

impl CampaignEngine {
    pub fn new(
        allocator: Arc<dyn IdentifierAllocator>,
        pipeline: FilterPipeline,
        orchestrator: DeploymentOrchestrator,
    ) -> Self {
        Self {
            allocator,
            pipeline,
            orchestrator,
        }
    }

    pub async fn allocate_identifier(&self, kind: CampaignKind) -> AllocatedIdentifiers {
        self.allocator.allocate(kind).await
    }

    pub async fn run_filter_pipeline(
        &self,
        batch: &PopulationBatch,
        spec: &FilterSpecification,
    ) -> (PopulationBatch, PipelineStats) {
        self.pipeline.run(batch, spec).await
    }

    /// Re-run a deployment under an existing identifier, e.g. with a plan enabling only the
    /// targets that failed before.
    pub async fn deploy(
        &self,
        identifier: &CampaignIdentifier,
        metadata: &CampaignMetadata,
        batch: &PopulationBatch,
        plan: &DeploymentPlan,
    ) -> Result<DeploymentResult, EngineError> {
        Ok(self
            .orchestrator
            .deploy(identifier, metadata, batch, plan)
            .await?)
    }

    /// Validate, allocate identifiers, filter the population and deploy it.
    ///
    /// Only validation failures are returned as errors. Filtering problems end up in
    /// `stats.issues` and target failures in `deployment.errors`.
    #[instrument(skip_all, fields(kind = %kind, population = population.len()))]
    pub async fn create_campaign(
        &self,
        kind: CampaignKind,
        mut metadata: CampaignMetadata,
        population: &PopulationBatch,
        spec: Option<&FilterSpecification>,
        options: Option<&DeploymentOptions>,
    ) -> Result<CampaignOutcome, EngineError> {
        if metadata.kind() != kind {
            return Err(ValidationError::KindMismatch {
                metadata: metadata.kind(),
                requested: kind,
            }
            .into());
        }
        metadata.validate()?;

        let allocated = self.allocator.allocate(kind).await;
        if let CampaignMetadata::Rb3(bonus) = &mut metadata {
            bonus.bonus_identifier = allocated.bonus.clone();
        }

        let default_spec = FilterSpecification::default();
        let (filtered, stats) = self
            .pipeline
            .run(population, spec.unwrap_or(&default_spec))
            .await;

        let plan = DeploymentPlan::resolve(kind, options);
        let deployment = self
            .orchestrator
            .deploy(&allocated.campaign, &metadata, &filtered, &plan)
            .await?;

        info!(
            campaign = %allocated.campaign,
            success = deployment.success,
            users = deployment.total_users,
            "campaign created"
        );

        Ok(CampaignOutcome {
            success: deployment.success,
            identifier: allocated.campaign,
            bonus_identifier: allocated.bonus,
            kind,
            stats,
            deployment,
        })
    }
}
