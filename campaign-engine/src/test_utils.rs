//! In-memory doubles for the engine's storage seams, for tests that should not need a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use campaign_common::customer::CustomerIdentifier;
use campaign_common::datasets::{CachedDatasets, InMemoryDatasets};
use campaign_common::deployment::DeploymentTarget;
use campaign_common::identifier::{CampaignIdentifier, IdentifierFamily};
use campaign_common::metadata::{CampaignKind, CampaignMetadata};
use campaign_common::population::PopulationBatch;

use crate::deploy::{DeploymentOrchestrator, TargetRows, TargetWriter};
use crate::engine::CampaignEngine;
use crate::error::{StoreError, WriteError};
use crate::filters::{FilterPipeline, ReferenceDatasets};
use crate::identifiers::{IdentifierStore, MaxScanAllocator};

fn refused() -> sqlx::Error {
    sqlx::Error::Io(std::io::Error::new(
        std::io::ErrorKind::ConnectionRefused,
        "connection refused",
    ))
}

/// An identifier store holding one maximum per family.
#[derive(Debug, Clone, Default)]
pub struct InMemoryIdentifierStore {
    maxima: HashMap<IdentifierFamily, CampaignIdentifier>,
    unreachable: bool,
}

impl InMemoryIdentifierStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose every lookup fails as if the database were down.
    pub fn unreachable() -> Self {
        Self {
            maxima: HashMap::new(),
            unreachable: true,
        }
    }

    pub fn with_max(mut self, identifier: CampaignIdentifier) -> Self {
        self.maxima.insert(identifier.family(), identifier);
        self
    }
}

#[async_trait]
impl IdentifierStore for InMemoryIdentifierStore {
    async fn current_max(
        &self,
        family: IdentifierFamily,
    ) -> Result<Option<CampaignIdentifier>, StoreError> {
        if self.unreachable {
            return Err(StoreError::ConnectionError(refused()));
        }
        Ok(self.maxima.get(&family).cloned())
    }
}

/// A target writer that records what it was asked to write and fails chosen targets.
#[derive(Default)]
pub struct RecordingWriter {
    failing: HashSet<DeploymentTarget>,
    written: Mutex<Vec<(DeploymentTarget, TargetRows)>>,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing(mut self, target: DeploymentTarget) -> Self {
        self.failing.insert(target);
        self
    }

    /// Targets written successfully, in order.
    pub fn written_targets(&self) -> Vec<DeploymentTarget> {
        self.written
            .lock()
            .expect("poisoned lock")
            .iter()
            .map(|(target, _)| *target)
            .collect()
    }

    pub fn rows_for(&self, target: DeploymentTarget) -> Option<TargetRows> {
        self.written
            .lock()
            .expect("poisoned lock")
            .iter()
            .find(|(written, _)| *written == target)
            .map(|(_, rows)| rows.clone())
    }
}

#[async_trait]
impl TargetWriter for RecordingWriter {
    fn table_name(&self, target: DeploymentTarget) -> String {
        target.table().to_owned()
    }

    async fn write(&self, target: DeploymentTarget, rows: &TargetRows) -> Result<u64, WriteError> {
        if self.failing.contains(&target) {
            return Err(WriteError::ConnectivityError {
                cluster: target.cluster(),
                error: refused(),
            });
        }
        self.written
            .lock()
            .expect("poisoned lock")
            .push((target, rows.clone()));
        Ok(rows.len() as u64)
    }
}

pub fn customer(n: u64) -> CustomerIdentifier {
    CustomerIdentifier::new(n).expect("customer identifier out of range")
}

pub fn population(ids: &[u64]) -> PopulationBatch {
    PopulationBatch::from_customers(ids.iter().map(|n| customer(*n)))
}

pub fn metadata_json() -> serde_json::Value {
    json!({
        "campaign_name": "Spring cashback",
        "campaign_desc": "Cashback on groceries",
        "stream": "Cashback",
        "sub_stream": "Groceries",
        "target_action": "Purchase",
        "channel": "Push",
        "campaign_type": "Promo",
        "campaign_text": "Get 5% back",
        "short_desc": "spring_cb",
        "date_start": "2024-04-01",
        "date_end": "2024-04-30",
        "out_date": "2024-05-15"
    })
}

pub fn rb1_metadata() -> CampaignMetadata {
    CampaignMetadata::from_value(CampaignKind::Rb1, metadata_json()).expect("valid RB1 metadata")
}

/// RB3 metadata, with `bonus_identifier` already assigned when given.
pub fn rb3_metadata(bonus_identifier: Option<&str>) -> CampaignMetadata {
    let mut value = metadata_json();
    value["bonus"] = json!("500 points");
    value["characteristic_json"] = json!({"segment": "gold"});

    let mut metadata =
        CampaignMetadata::from_value(CampaignKind::Rb3, value).expect("valid RB3 metadata");
    if let CampaignMetadata::Rb3(bonus) = &mut metadata {
        bonus.bonus_identifier = bonus_identifier.map(|raw| {
            CampaignIdentifier::parse(IdentifierFamily::Bonus, raw).expect("valid bonus identifier")
        });
    }
    metadata
}

/// An engine wired to in-memory doubles.
pub fn engine(
    store: InMemoryIdentifierStore,
    datasets: InMemoryDatasets,
    writer: Arc<RecordingWriter>,
) -> CampaignEngine {
    let cache = CachedDatasets::new(Arc::new(datasets), Duration::from_secs(3600), 64);
    CampaignEngine::new(
        Arc::new(MaxScanAllocator::new(store)),
        FilterPipeline::new(Arc::new(cache), ReferenceDatasets::default()),
        DeploymentOrchestrator::new(writer),
    )
}
