//! Population narrowing: the aggregation stage and the reference-dataset stages.
//!
//! Every stage returns a new batch that is a subset of its input. A stage whose input is absent
//! from the [`FilterSpecification`] is skipped and leaves no statistic behind.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use campaign_common::customer::CustomerIdentifier;
use campaign_common::datasets::DatasetCache;
use campaign_common::filter_spec::FilterSpecification;
use campaign_common::metrics::FILTER_ROWS_REMOVED;
use campaign_common::population::{AttributeValue, PopulationBatch, AGGREGATE_COLUMN};

/// A dataset looked up by attribute value rather than plain membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeDataset {
    pub dataset: String,
    pub attribute: String,
}

impl AttributeDataset {
    pub fn new(dataset: &str, attribute: &str) -> Self {
        Self {
            dataset: dataset.to_owned(),
            attribute: attribute.to_owned(),
        }
    }
}

/// Names of the reference datasets backing the inclusion and opt-out stages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceDatasets {
    pub devices: AttributeDataset,
    pub channel_opt_outs: AttributeDataset,
    pub active_users: String,
    pub products: AttributeDataset,
}

impl Default for ReferenceDatasets {
    fn default() -> Self {
        Self {
            devices: AttributeDataset::new("dssb_dm.hb_sessions_fl", "operationsystem"),
            channel_opt_outs: AttributeDataset::new("dssb_de.ucs_push_off", "eventdescription"),
            active_users: "mau".to_owned(),
            products: AttributeDataset::new("final", "sku_level1"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterStage {
    Exclusion,
    Device,
    Channel,
    ActiveUsers,
    Product,
}

impl FilterStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterStage::Exclusion => "exclusion",
            FilterStage::Device => "device",
            FilterStage::Channel => "channel",
            FilterStage::ActiveUsers => "active_users",
            FilterStage::Product => "product",
        }
    }

    /// Exclusion-type stages remove members; the rest keep only members.
    fn excludes(&self) -> bool {
        matches!(self, FilterStage::Exclusion | FilterStage::Channel)
    }
}

impl fmt::Display for FilterStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How an executed stage treated the batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    /// The reference set was non-empty and was applied.
    Applied,
    /// Exclusion against an empty set: nothing to remove.
    NoOp,
    /// Inclusion against an empty set: nobody can qualify.
    RejectedAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageStats {
    pub stage: FilterStage,
    pub outcome: StageOutcome,
    pub before: usize,
    pub after: usize,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterStats {
    pub initial_count: usize,
    pub final_count: usize,
    pub total_removed: usize,
    pub stages: Vec<StageStats>,
}

impl FilterStats {
    fn new(initial_count: usize) -> Self {
        Self {
            initial_count,
            final_count: initial_count,
            total_removed: 0,
            stages: Vec::new(),
        }
    }

    pub fn stage(&self, stage: FilterStage) -> Option<&StageStats> {
        self.stages.iter().find(|stats| stats.stage == stage)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SumRange {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregationStats {
    pub columns_used: Vec<String>,
    pub missing_columns: Vec<String>,
    pub initial_count: usize,
    pub final_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_sum: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub removed_by_threshold: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sum_range: Option<SumRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Non-fatal data problems found while filtering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum DataIssue {
    NoAggregationColumns { requested: Vec<String> },
    EmptyPopulation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub initial_count: usize,
    pub final_count: usize,
    pub total_removed: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub issues: Vec<DataIssue>,
}

/// Sum `sum_columns` into the `aggregate` attribute and drop rows below `minimum_sum`.
///
/// Columns the batch does not have are left out of the sum. If none of them are present the batch
/// is returned untouched with an error statistic.
pub fn apply_aggregation_filter(
    batch: &PopulationBatch,
    sum_columns: &[String],
    minimum_sum: Option<f64>,
) -> (PopulationBatch, AggregationStats) {
    let mut columns_used: Vec<String> = Vec::new();
    let mut missing_columns: Vec<String> = Vec::new();
    for column in sum_columns {
        let seen = columns_used.contains(column) || missing_columns.contains(column);
        if seen {
            continue;
        }
        if batch.has_column(column) {
            columns_used.push(column.clone());
        } else {
            missing_columns.push(column.clone());
        }
    }

    let mut stats = AggregationStats {
        columns_used,
        missing_columns,
        initial_count: batch.len(),
        final_count: batch.len(),
        minimum_sum,
        removed_by_threshold: None,
        sum_range: None,
        error: None,
    };

    if !stats.missing_columns.is_empty() {
        warn!(missing = ?stats.missing_columns, "aggregation columns absent from population");
    }
    if stats.columns_used.is_empty() {
        stats.error = Some("no valid sum columns found".to_owned());
        return (batch.clone(), stats);
    }

    let columns = stats.columns_used.clone();
    let summed = batch.derive_column(AGGREGATE_COLUMN, |row| {
        let total: f64 = columns
            .iter()
            .map(|column| {
                row.attribute(column)
                    .and_then(AttributeValue::as_number)
                    .unwrap_or(0.0)
            })
            .sum();
        AttributeValue::Number(total)
    });

    let aggregates: Vec<f64> = summed
        .rows()
        .iter()
        .map(|row| aggregate_of(row.attribute(AGGREGATE_COLUMN)))
        .collect();
    if !aggregates.is_empty() {
        let total: f64 = aggregates.iter().sum();
        stats.sum_range = Some(SumRange {
            min: aggregates.iter().copied().fold(f64::INFINITY, f64::min),
            max: aggregates.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            mean: total / aggregates.len() as f64,
        });
    }

    let result = match minimum_sum {
        Some(minimum) => {
            let kept = summed.narrow(|row| aggregate_of(row.attribute(AGGREGATE_COLUMN)) >= minimum);
            stats.removed_by_threshold = Some(summed.len() - kept.len());
            info!(
                minimum,
                kept = kept.len(),
                of = summed.len(),
                "applied aggregate threshold"
            );
            kept
        }
        None => summed,
    };
    stats.final_count = result.len();

    (result, stats)
}

fn aggregate_of(value: Option<&AttributeValue>) -> f64 {
    value.and_then(AttributeValue::as_number).unwrap_or(0.0)
}

/// Runs the reference-dataset stages against a [`DatasetCache`].
#[derive(Clone)]
pub struct FilterPipeline {
    cache: Arc<dyn DatasetCache>,
    datasets: ReferenceDatasets,
}

impl FilterPipeline {
    pub fn new(cache: Arc<dyn DatasetCache>, datasets: ReferenceDatasets) -> Self {
        Self { cache, datasets }
    }

    /// Apply the exclusion, device, channel, active-user and product stages, in that order.
    pub async fn apply_reference_filters(
        &self,
        batch: &PopulationBatch,
        spec: &FilterSpecification,
    ) -> (PopulationBatch, FilterStats) {
        let mut stats = FilterStats::new(batch.len());
        let mut current = batch.clone();

        if let Some(sources) = spec.exclusion_sources() {
            let mut excluded = HashSet::new();
            for source in sources {
                excluded.extend(self.cache.lookup_membership(source).await);
            }
            current = apply_stage(FilterStage::Exclusion, &current, &excluded, &mut stats);
        }

        if let Some(devices) = spec.devices() {
            let set = self.by_attribute(&self.datasets.devices, devices).await;
            current = apply_stage(FilterStage::Device, &current, &set, &mut stats);
        }

        if let Some(channels) = spec.channels() {
            let set = self
                .by_attribute(&self.datasets.channel_opt_outs, channels)
                .await;
            current = apply_stage(FilterStage::Channel, &current, &set, &mut stats);
        }

        if spec.active_users_only {
            let set = self
                .cache
                .lookup_membership(&self.datasets.active_users)
                .await;
            current = apply_stage(FilterStage::ActiveUsers, &current, &set, &mut stats);
        }

        if let Some(products) = spec.products() {
            let set = self.by_attribute(&self.datasets.products, products).await;
            current = apply_stage(FilterStage::Product, &current, &set, &mut stats);
        }

        stats.final_count = current.len();
        stats.total_removed = stats.initial_count - stats.final_count;

        (current, stats)
    }

    /// Aggregation first, then the reference stages.
    #[instrument(skip_all, fields(initial_count = batch.len()))]
    pub async fn run(
        &self,
        batch: &PopulationBatch,
        spec: &FilterSpecification,
    ) -> (PopulationBatch, PipelineStats) {
        let mut stats = PipelineStats {
            initial_count: batch.len(),
            final_count: batch.len(),
            total_removed: 0,
            aggregation: None,
            filters: None,
            issues: Vec::new(),
        };
        let mut current = batch.clone();

        if let Some(sum_columns) = spec.sum_columns() {
            let (aggregated, aggregation) =
                apply_aggregation_filter(&current, sum_columns, spec.minimum_sum);
            if aggregation.error.is_some() {
                stats.issues.push(DataIssue::NoAggregationColumns {
                    requested: sum_columns.to_vec(),
                });
            }
            current = aggregated;
            stats.aggregation = Some(aggregation);
        }

        if spec.has_reference_stages() {
            let (filtered, filters) = self.apply_reference_filters(&current, spec).await;
            current = filtered;
            stats.filters = Some(filters);
        }

        stats.final_count = current.len();
        stats.total_removed = stats.initial_count - stats.final_count;
        if current.is_empty() {
            warn!("no customers left after filtering");
            stats.issues.push(DataIssue::EmptyPopulation);
        }
        info!(
            final_count = stats.final_count,
            total_removed = stats.total_removed,
            "filter pipeline complete"
        );

        (current, stats)
    }

    async fn by_attribute(
        &self,
        source: &AttributeDataset,
        values: &[String],
    ) -> HashSet<CustomerIdentifier> {
        self.cache
            .lookup_membership_by_attribute(&source.dataset, &source.attribute, values)
            .await
    }
}

fn apply_stage(
    stage: FilterStage,
    batch: &PopulationBatch,
    set: &HashSet<CustomerIdentifier>,
    stats: &mut FilterStats,
) -> PopulationBatch {
    let (outcome, result) = match (stage.excludes(), set.is_empty()) {
        (true, true) => (StageOutcome::NoOp, batch.clone()),
        (true, false) => (StageOutcome::Applied, batch.remove_members(set)),
        (false, true) => (StageOutcome::RejectedAll, batch.narrow(|_| false)),
        (false, false) => (StageOutcome::Applied, batch.retain_members(set)),
    };

    let removed = batch.len() - result.len();
    match outcome {
        StageOutcome::Applied => info!(stage = stage.as_str(), removed, "filter stage applied"),
        StageOutcome::NoOp => info!(stage = stage.as_str(), "exclusion set empty, nothing removed"),
        StageOutcome::RejectedAll => warn!(
            stage = stage.as_str(),
            removed, "inclusion set empty, every row rejected"
        ),
    }
    metrics::counter!(FILTER_ROWS_REMOVED, "stage" => stage.as_str()).increment(removed as u64);

    stats.stages.push(StageStats {
        stage,
        outcome,
        before: batch.len(),
        after: result.len(),
        removed,
    });
    result
}
