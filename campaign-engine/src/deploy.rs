//! Writing a campaign to its deployment targets.
//!
//! Targets live on independent clusters with no distributed transaction between them. Each
//! target is written on its own connection inside its own transaction, outcomes are recorded
//! independently, and the returned [`DeploymentResult`] is the only record of what was written.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::postgres::{PgConnectOptions, PgConnection, Postgres};
use sqlx::query_builder::Separated;
use sqlx::types::Json;
use sqlx::{Connection, QueryBuilder};
use tracing::{error, info, instrument, warn};

use campaign_common::database::{connect, InvalidIdentifier, QualifiedTable};
use campaign_common::deployment::{Cluster, DeploymentPlan, DeploymentResult, DeploymentTarget};
use campaign_common::identifier::CampaignIdentifier;
use campaign_common::metadata::{BaseMetadata, BonusMetadata, CampaignMetadata, ValidationError};
use campaign_common::metrics::{TARGET_WRITES, TARGET_WRITE_DURATION};
use campaign_common::population::PopulationBatch;

use crate::error::WriteError;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignDictionaryRow {
    pub campaigncode: String,
    pub stream: String,
    pub sub_stream: String,
    pub target_action: String,
    pub channel: String,
    pub campaign_type: String,
    pub campaign_name: String,
    pub campaign_desc: String,
    pub campaign_text: String,
    pub campaign_model: Option<String>,
    pub cds_launcher: Option<String>,
    pub campaign_text_kz: Option<String>,
    pub out_date: NaiveDate,
    pub camp_cnt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BonusDictionaryRow {
    pub campaigncode: String,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub xls_ow_id: String,
    pub target_action: String,
    pub bonus: Option<String>,
    pub characteristic_json: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LocalTargetRow {
    pub campaigncode: String,
    /// Zero-padded 12-digit customer identifier.
    pub iin: String,
    pub p_sid: i64,
    pub stream: String,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
}

/// Shape shared by the operational user lists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserListRow {
    pub campaigncode: String,
    /// Zero-padded 12-digit customer identifier.
    pub iin: String,
    pub p_sid: i64,
    pub upload_date: NaiveDate,
    pub short_desc: String,
}

/// The projection of a campaign that one target receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", content = "rows", rename_all = "snake_case")]
pub enum TargetRows {
    CampaignDictionary(CampaignDictionaryRow),
    BonusDictionary(BonusDictionaryRow),
    LocalTarget(Vec<LocalTargetRow>),
    UserList(Vec<UserListRow>),
}

impl TargetRows {
    pub fn len(&self) -> usize {
        match self {
            TargetRows::CampaignDictionary(_) | TargetRows::BonusDictionary(_) => 1,
            TargetRows::LocalTarget(rows) => rows.len(),
            TargetRows::UserList(rows) => rows.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub fn campaign_dictionary_row(
    identifier: &CampaignIdentifier,
    base: &BaseMetadata,
) -> CampaignDictionaryRow {
    CampaignDictionaryRow {
        campaigncode: identifier.to_string(),
        stream: base.stream.clone(),
        sub_stream: base.sub_stream.clone(),
        target_action: base.target_action.clone(),
        channel: base.channel.clone(),
        campaign_type: base.campaign_type.clone(),
        campaign_name: base.campaign_name.clone(),
        campaign_desc: base.campaign_desc.clone(),
        campaign_text: base.campaign_text.clone(),
        campaign_model: base.campaign_model.clone(),
        cds_launcher: base.cds_launcher.clone(),
        campaign_text_kz: base.campaign_text_kz.clone(),
        out_date: base.out_date,
        camp_cnt: base.camp_cnt.clone(),
    }
}

pub fn bonus_dictionary_row(
    identifier: &CampaignIdentifier,
    bonus: &BonusMetadata,
) -> Result<BonusDictionaryRow, ValidationError> {
    let xls_ow_id = bonus
        .bonus_identifier
        .as_ref()
        .ok_or(ValidationError::MissingBonusIdentifier)?;

    Ok(BonusDictionaryRow {
        campaigncode: identifier.to_string(),
        date_start: bonus.base.date_start,
        date_end: bonus.base.date_end,
        xls_ow_id: xls_ow_id.to_string(),
        target_action: bonus.base.target_action.clone(),
        bonus: bonus.bonus.clone(),
        characteristic_json: bonus.characteristic_json.clone(),
    })
}

pub fn local_target_rows(
    identifier: &CampaignIdentifier,
    base: &BaseMetadata,
    batch: &PopulationBatch,
) -> Vec<LocalTargetRow> {
    let campaigncode = identifier.to_string();
    batch
        .rows()
        .iter()
        .map(|row| LocalTargetRow {
            campaigncode: campaigncode.clone(),
            iin: row.customer.padded(),
            p_sid: row.secondary_id(),
            stream: base.stream.clone(),
            date_start: base.date_start,
            date_end: base.date_end,
        })
        .collect()
}

pub fn user_list_rows(
    identifier: &CampaignIdentifier,
    base: &BaseMetadata,
    batch: &PopulationBatch,
) -> Vec<UserListRow> {
    let campaigncode = identifier.to_string();
    batch
        .rows()
        .iter()
        .map(|row| UserListRow {
            campaigncode: campaigncode.clone(),
            iin: row.customer.padded(),
            p_sid: row.secondary_id(),
            upload_date: base.date_start,
            short_desc: base.short_desc.clone(),
        })
        .collect()
}

/// Build the rows `target` receives for this campaign.
pub fn project(
    target: DeploymentTarget,
    identifier: &CampaignIdentifier,
    metadata: &CampaignMetadata,
    batch: &PopulationBatch,
) -> Result<TargetRows, WriteError> {
    let base = metadata.base();
    match (target, metadata) {
        (DeploymentTarget::CampaignDictionary, CampaignMetadata::Rb1(base)) => Ok(
            TargetRows::CampaignDictionary(campaign_dictionary_row(identifier, base)),
        ),
        (DeploymentTarget::BonusCampaignDictionary, CampaignMetadata::Rb3(bonus)) => {
            bonus_dictionary_row(identifier, bonus)
                .map(TargetRows::BonusDictionary)
                .map_err(|e| WriteError::ConfigurationError(e.to_string()))
        }
        (DeploymentTarget::CampaignDictionary, _) | (DeploymentTarget::BonusCampaignDictionary, _) => {
            Err(WriteError::ConfigurationError(format!(
                "{} does not hold {} campaigns",
                target,
                metadata.kind()
            )))
        }
        (DeploymentTarget::LocalTarget, _) => Ok(TargetRows::LocalTarget(local_target_rows(
            identifier, base, batch,
        ))),
        (DeploymentTarget::CampaignUsers, _) | (DeploymentTarget::OffLimitUsers, _) => Ok(
            TargetRows::UserList(user_list_rows(identifier, base, batch)),
        ),
    }
}

/// Persists one target's rows. Implementations own connection handling for the target.
#[async_trait]
pub trait TargetWriter: Send + Sync {
    /// Name of the table `target` is written to, as reported in results.
    fn table_name(&self, target: DeploymentTarget) -> String;

    /// Write `rows` to `target`, returning the number of rows written.
    async fn write(&self, target: DeploymentTarget, rows: &TargetRows) -> Result<u64, WriteError>;
}

/// Connection settings for the two clusters a deployment spans.
#[derive(Debug, Clone)]
pub struct TargetDatabases {
    pub campaign: PgConnectOptions,
    pub campaign_schema: Option<String>,
    pub user_lists: PgConnectOptions,
    pub user_lists_schema: Option<String>,
    pub batch_size: usize,
}

/// Writes targets to Postgres with a dedicated connection and transaction per target.
pub struct PgTargetWriter {
    campaign: PgConnectOptions,
    user_lists: PgConnectOptions,
    tables: HashMap<DeploymentTarget, QualifiedTable>,
    batch_size: usize,
}

/// Postgres accepts at most 65535 bind parameters per statement.
const MAX_BIND_PARAMETERS: usize = 65535;

/// Bind parameters per local target row, the widest batched insert.
const LOCAL_TARGET_BINDS: usize = 7;

/// Largest batch that keeps every chunked insert under the bind parameter limit.
pub const MAX_BATCH_ROWS: usize = MAX_BIND_PARAMETERS / LOCAL_TARGET_BINDS;

const ALL_TARGETS: &[DeploymentTarget] = &[
    DeploymentTarget::CampaignDictionary,
    DeploymentTarget::BonusCampaignDictionary,
    DeploymentTarget::LocalTarget,
    DeploymentTarget::CampaignUsers,
    DeploymentTarget::OffLimitUsers,
];

impl PgTargetWriter {
    pub fn new(databases: TargetDatabases) -> Result<Self, InvalidIdentifier> {
        let mut tables = HashMap::new();
        for target in ALL_TARGETS {
            let schema = match target.cluster() {
                Cluster::Campaign => databases.campaign_schema.as_deref(),
                Cluster::UserLists => databases.user_lists_schema.as_deref(),
            };
            tables.insert(*target, QualifiedTable::new(schema, target.table())?);
        }

        Ok(Self {
            campaign: databases.campaign,
            user_lists: databases.user_lists,
            tables,
            batch_size: databases.batch_size.clamp(1, MAX_BATCH_ROWS),
        })
    }

    fn options(&self, cluster: Cluster) -> &PgConnectOptions {
        match cluster {
            Cluster::Campaign => &self.campaign,
            Cluster::UserLists => &self.user_lists,
        }
    }

    fn table(&self, target: DeploymentTarget) -> Result<&QualifiedTable, WriteError> {
        self.tables.get(&target).ok_or_else(|| {
            WriteError::ConfigurationError(format!("no table configured for {}", target))
        })
    }

    async fn insert(
        &self,
        conn: &mut PgConnection,
        table: &QualifiedTable,
        rows: &TargetRows,
    ) -> Result<u64, sqlx::Error> {
        let mut tx = conn.begin().await?;
        let inserted_at = Utc::now();

        let written = match rows {
            TargetRows::CampaignDictionary(row) => {
                let prefix = format!(
                    "INSERT INTO {} (campaigncode, stream, sub_stream, target_action, channel, \
                     campaign_type, campaign_name, campaign_desc, campaign_text, campaign_model, \
                     cds_launcher, campaign_text_kz, out_date, camp_cnt, inserted_at) ",
                    table.quoted()
                );
                insert_chunked(&mut *tx, &prefix, std::slice::from_ref(row), 1, |mut b, row| {
                    b.push_bind(row.campaigncode.clone())
                        .push_bind(row.stream.clone())
                        .push_bind(row.sub_stream.clone())
                        .push_bind(row.target_action.clone())
                        .push_bind(row.channel.clone())
                        .push_bind(row.campaign_type.clone())
                        .push_bind(row.campaign_name.clone())
                        .push_bind(row.campaign_desc.clone())
                        .push_bind(row.campaign_text.clone())
                        .push_bind(row.campaign_model.clone())
                        .push_bind(row.cds_launcher.clone())
                        .push_bind(row.campaign_text_kz.clone())
                        .push_bind(row.out_date)
                        .push_bind(row.camp_cnt.clone())
                        .push_bind(inserted_at);
                })
                .await?
            }
            TargetRows::BonusDictionary(row) => {
                let prefix = format!(
                    "INSERT INTO {} (campaigncode, date_start, date_end, xls_ow_id, target_action, \
                     bonus, characteristic_json, inserted_at) ",
                    table.quoted()
                );
                insert_chunked(&mut *tx, &prefix, std::slice::from_ref(row), 1, |mut b, row| {
                    b.push_bind(row.campaigncode.clone())
                        .push_bind(row.date_start)
                        .push_bind(row.date_end)
                        .push_bind(row.xls_ow_id.clone())
                        .push_bind(row.target_action.clone())
                        .push_bind(row.bonus.clone())
                        .push_bind(row.characteristic_json.clone().map(Json))
                        .push_bind(inserted_at);
                })
                .await?
            }
            TargetRows::LocalTarget(rows) => {
                let prefix = format!(
                    "INSERT INTO {} (campaigncode, iin, p_sid, stream, date_start, date_end, \
                     inserted_at) ",
                    table.quoted()
                );
                insert_chunked(&mut *tx, &prefix, rows, self.batch_size, |mut b, row| {
                    b.push_bind(row.campaigncode.clone())
                        .push_bind(row.iin.clone())
                        .push_bind(row.p_sid)
                        .push_bind(row.stream.clone())
                        .push_bind(row.date_start)
                        .push_bind(row.date_end)
                        .push_bind(inserted_at);
                })
                .await?
            }
            TargetRows::UserList(rows) => {
                let prefix = format!(
                    "INSERT INTO {} (campaigncode, iin, p_sid, upload_date, short_desc, \
                     inserted_at) ",
                    table.quoted()
                );
                insert_chunked(&mut *tx, &prefix, rows, self.batch_size, |mut b, row| {
                    b.push_bind(row.campaigncode.clone())
                        .push_bind(row.iin.clone())
                        .push_bind(row.p_sid)
                        .push_bind(row.upload_date)
                        .push_bind(row.short_desc.clone())
                        .push_bind(inserted_at);
                })
                .await?
            }
        };

        tx.commit().await?;
        Ok(written)
    }
}

/// Multi-row inserts of `rows`, `batch_size` rows per statement.
async fn insert_chunked<T, F>(
    conn: &mut PgConnection,
    prefix: &str,
    rows: &[T],
    batch_size: usize,
    mut push_row: F,
) -> Result<u64, sqlx::Error>
where
    F: FnMut(Separated<'_, 'static, Postgres, &'static str>, &T),
{
    let mut written = 0;
    for chunk in rows.chunks(batch_size.max(1)) {
        let mut builder: QueryBuilder<'static, Postgres> = QueryBuilder::new(prefix);
        builder.push_values(chunk, &mut push_row);
        written += builder.build().execute(&mut *conn).await?.rows_affected();
    }
    Ok(written)
}

#[async_trait]
impl TargetWriter for PgTargetWriter {
    fn table_name(&self, target: DeploymentTarget) -> String {
        self.tables
            .get(&target)
            .map(ToString::to_string)
            .unwrap_or_else(|| target.table().to_owned())
    }

    async fn write(&self, target: DeploymentTarget, rows: &TargetRows) -> Result<u64, WriteError> {
        let cluster = target.cluster();
        let table = self.table(target)?;

        let mut conn = connect(self.options(cluster))
            .await
            .map_err(|error| WriteError::from_sqlx(cluster, error))?;

        let result = self
            .insert(&mut conn, table, rows)
            .await
            .map_err(|error| WriteError::from_sqlx(cluster, error));

        if let Err(error) = conn.close().await {
            warn!(table = %table, "failed to close target connection: {}", error);
        }

        result
    }
}

/// Writes a campaign to every target its plan enables, one target at a time.
#[derive(Clone)]
pub struct DeploymentOrchestrator {
    writer: Arc<dyn TargetWriter>,
}

impl DeploymentOrchestrator {
    pub fn new(writer: Arc<dyn TargetWriter>) -> Self {
        Self { writer }
    }

    /// Deploy `batch` under `identifier`.
    ///
    /// Only an invalid `metadata` fails the call; target failures are reported in the result and
    /// never stop the remaining targets.
    #[instrument(skip_all, fields(campaign = %identifier, kind = %metadata.kind()))]
    pub async fn deploy(
        &self,
        identifier: &CampaignIdentifier,
        metadata: &CampaignMetadata,
        batch: &PopulationBatch,
        plan: &DeploymentPlan,
    ) -> Result<DeploymentResult, ValidationError> {
        metadata.validate_for_deployment()?;

        let targets = plan.targets(metadata.kind());
        let mut result = DeploymentResult::new(identifier.clone(), batch.len());
        result.begin(
            targets
                .iter()
                .map(|target| (*target, self.writer.table_name(*target))),
        );

        for target in targets {
            let start = Instant::now();
            let written = match project(target, identifier, metadata, batch) {
                Ok(rows) => self.writer.write(target, &rows).await,
                Err(error) => Err(error),
            };
            metrics::histogram!(TARGET_WRITE_DURATION, "table" => target.table())
                .record(start.elapsed().as_secs_f64());

            match written {
                Ok(rows_written) => {
                    info!(table = target.table(), rows_written, "target written");
                    metrics::counter!(TARGET_WRITES, "table" => target.table(), "outcome" => "success")
                        .increment(1);
                    result.record_success(target, rows_written);
                }
                Err(error) => {
                    error!(table = target.table(), "target write failed: {}", error);
                    metrics::counter!(TARGET_WRITES, "table" => target.table(), "outcome" => "failure")
                        .increment(1);
                    result.record_failure(target, error);
                }
            }
        }

        result.complete();
        info!(
            success = result.success,
            tables_updated = result.tables_updated.len(),
            errors = result.errors.len(),
            "deployment complete"
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{rb1_metadata, rb3_metadata, RecordingWriter};
    use campaign_common::customer::CustomerIdentifier;
    use campaign_common::deployment::{DeploymentState, TargetStatus};
    use campaign_common::identifier::IdentifierFamily;
    use campaign_common::metadata::CampaignKind;
    use campaign_common::population::{AttributeValue, PopulationRow};
    use sqlx::PgPool;

    fn identifier() -> CampaignIdentifier {
        CampaignIdentifier::parse(IdentifierFamily::Campaign, "C000012346").unwrap()
    }

    fn batch() -> PopulationBatch {
        PopulationBatch::from_rows(vec![
            PopulationRow::new(CustomerIdentifier::new(123456789).unwrap()),
            PopulationRow::new(CustomerIdentifier::new(42).unwrap())
                .with_attribute("P_SID", AttributeValue::Number(777.0)),
        ])
    }

    #[test]
    fn test_user_list_projection_pads_and_defaults_secondary_id() {
        let metadata = rb1_metadata();

        let rows = user_list_rows(&identifier(), metadata.base(), &batch());

        assert_eq!(rows[0].iin, "000123456789");
        assert_eq!(rows[0].p_sid, 123456789);
        assert_eq!(rows[1].iin, "000000000042");
        assert_eq!(rows[1].p_sid, 777);
        assert_eq!(rows[0].campaigncode, "C000012346");
        assert_eq!(rows[0].upload_date, metadata.base().date_start);
    }

    #[test]
    fn test_dictionary_projection_matches_kind() {
        let rb1 = rb1_metadata();
        assert!(matches!(
            project(DeploymentTarget::CampaignDictionary, &identifier(), &rb1, &batch()),
            Ok(TargetRows::CampaignDictionary(_))
        ));
        assert!(matches!(
            project(DeploymentTarget::BonusCampaignDictionary, &identifier(), &rb1, &batch()),
            Err(WriteError::ConfigurationError(_))
        ));

        let rb3 = rb3_metadata(Some("KKB_0124"));
        match project(DeploymentTarget::BonusCampaignDictionary, &identifier(), &rb3, &batch()) {
            Ok(TargetRows::BonusDictionary(row)) => {
                assert_eq!(row.xls_ow_id, "KKB_0124");
                assert_eq!(row.campaigncode, "C000012346");
            }
            other => panic!("unexpected projection: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported_not_raised() {
        let writer = Arc::new(RecordingWriter::new().failing(DeploymentTarget::CampaignDictionary));
        let orchestrator = DeploymentOrchestrator::new(writer.clone());

        let result = orchestrator
            .deploy(
                &identifier(),
                &rb1_metadata(),
                &batch(),
                &DeploymentPlan::for_kind(CampaignKind::Rb1),
            )
            .await
            .unwrap();

        assert!(!result.success);
        assert_eq!(result.state, DeploymentState::Completed);
        assert_eq!(result.tables_updated.len(), 3);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].contains("mb01_camp_dict"));
        assert_eq!(result.total_users, 2);
        assert_eq!(
            writer.written_targets(),
            vec![
                DeploymentTarget::LocalTarget,
                DeploymentTarget::CampaignUsers,
                DeploymentTarget::OffLimitUsers,
            ]
        );
        assert_eq!(
            result.failed_targets(),
            vec![DeploymentTarget::CampaignDictionary]
        );
    }

    #[tokio::test]
    async fn test_rb3_defaults_skip_off_limit_list() {
        let writer = Arc::new(RecordingWriter::new());
        let orchestrator = DeploymentOrchestrator::new(writer.clone());

        let result = orchestrator
            .deploy(
                &identifier(),
                &rb3_metadata(Some("KKB_0001")),
                &batch(),
                &DeploymentPlan::for_kind(CampaignKind::Rb3),
            )
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(
            result.tables_updated,
            vec![
                "rb3_tr_campaign_dict".to_owned(),
                "mb22_local_target".to_owned(),
                "fd_rb2_campaigns_users".to_owned(),
            ]
        );
        assert!(matches!(
            result.outcomes[1].status,
            TargetStatus::Succeeded { rows_written: 2 }
        ));
    }

    #[tokio::test]
    async fn test_rb3_without_bonus_identifier_is_rejected_before_writing() {
        let writer = Arc::new(RecordingWriter::new());
        let orchestrator = DeploymentOrchestrator::new(writer.clone());

        let result = orchestrator
            .deploy(
                &identifier(),
                &rb3_metadata(None),
                &batch(),
                &DeploymentPlan::for_kind(CampaignKind::Rb3),
            )
            .await;

        assert_eq!(result, Err(ValidationError::MissingBonusIdentifier));
        assert!(writer.written_targets().is_empty());
    }

    #[tokio::test]
    async fn test_empty_plan_succeeds_vacuously() {
        let orchestrator = DeploymentOrchestrator::new(Arc::new(RecordingWriter::new()));

        let result = orchestrator
            .deploy(&identifier(), &rb1_metadata(), &batch(), &DeploymentPlan::none())
            .await
            .unwrap();

        assert!(result.success);
        assert!(result.outcomes.is_empty());
    }

    fn databases(options: PgConnectOptions, batch_size: usize) -> TargetDatabases {
        TargetDatabases {
            campaign: options.clone(),
            campaign_schema: Some("dssb_ocds".to_owned()),
            user_lists: options,
            user_lists_schema: Some("spss".to_owned()),
            batch_size,
        }
    }

    #[test]
    fn test_pg_writer_table_names() {
        let writer = PgTargetWriter::new(databases(PgConnectOptions::new(), 0)).unwrap();

        assert_eq!(
            writer.table_name(DeploymentTarget::CampaignDictionary),
            "dssb_ocds.mb01_camp_dict"
        );
        assert_eq!(
            writer.table_name(DeploymentTarget::OffLimitUsers),
            "spss.off_limit_campaigns_users"
        );
        assert_eq!(writer.batch_size, 1);
    }

    #[test]
    fn test_pg_writer_batch_stays_under_bind_limit() {
        let writer = PgTargetWriter::new(databases(PgConnectOptions::new(), 50_000)).unwrap();

        assert_eq!(writer.batch_size, MAX_BATCH_ROWS);
        assert!(writer.batch_size * LOCAL_TARGET_BINDS <= 65535);
    }

    async fn count_rows(db: &PgPool, table: &str, campaign: &str) -> i64 {
        let query = format!("SELECT COUNT(*) FROM {} WHERE campaigncode = $1", table);
        sqlx::query_scalar(&query)
            .bind(campaign)
            .fetch_one(db)
            .await
            .unwrap()
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pg_writer_deploys_rb1(db: PgPool) {
        let options = (*db.connect_options()).clone();
        // One row per statement, so the population is written in two chunks.
        let writer = Arc::new(PgTargetWriter::new(databases(options, 1)).unwrap());
        let orchestrator = DeploymentOrchestrator::new(writer);

        let result = orchestrator
            .deploy(
                &identifier(),
                &rb1_metadata(),
                &batch(),
                &DeploymentPlan::for_kind(CampaignKind::Rb1),
            )
            .await
            .unwrap();

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(
            result.tables_updated,
            vec![
                "dssb_ocds.mb01_camp_dict".to_owned(),
                "dssb_ocds.mb22_local_target".to_owned(),
                "spss.fd_rb2_campaigns_users".to_owned(),
                "spss.off_limit_campaigns_users".to_owned(),
            ]
        );
        assert_eq!(count_rows(&db, "dssb_ocds.mb01_camp_dict", "C000012346").await, 1);
        assert_eq!(count_rows(&db, "dssb_ocds.mb22_local_target", "C000012346").await, 2);
        assert_eq!(count_rows(&db, "spss.fd_rb2_campaigns_users", "C000012346").await, 2);

        let (iin, p_sid): (String, i64) = sqlx::query_as(
            "SELECT iin, p_sid FROM spss.fd_rb2_campaigns_users WHERE campaigncode = $1 AND p_sid = 777",
        )
        .bind("C000012346")
        .fetch_one(&db)
        .await
        .unwrap();
        assert_eq!(iin, "000000000042");
        assert_eq!(p_sid, 777);
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pg_writer_naive_retry_hits_integrity_errors(db: PgPool) {
        let options = (*db.connect_options()).clone();
        let writer = Arc::new(PgTargetWriter::new(databases(options, 1000)).unwrap());
        let orchestrator = DeploymentOrchestrator::new(writer.clone());
        let plan = DeploymentPlan::for_kind(CampaignKind::Rb1);

        let first = orchestrator
            .deploy(&identifier(), &rb1_metadata(), &batch(), &plan)
            .await
            .unwrap();
        assert!(first.success, "errors: {:?}", first.errors);

        let retry = orchestrator
            .deploy(&identifier(), &rb1_metadata(), &batch(), &plan)
            .await
            .unwrap();
        assert!(!retry.success);
        assert!(retry.tables_updated.is_empty());
        assert_eq!(retry.errors.len(), 4);
        assert!(retry.errors[0].starts_with("dssb_ocds.mb01_camp_dict: "));

        for target in plan.targets(CampaignKind::Rb1) {
            let rows = project(target, &identifier(), &rb1_metadata(), &batch()).unwrap();
            assert!(matches!(
                writer.write(target, &rows).await,
                Err(WriteError::IntegrityError(_))
            ));
        }

        // The failed statements rolled back; nothing was written twice.
        assert_eq!(count_rows(&db, "dssb_ocds.mb22_local_target", "C000012346").await, 2);
    }

    #[tokio::test]
    async fn test_pg_writer_unreachable_cluster_is_connectivity_error() {
        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(1)
            .username("nobody");
        let writer = PgTargetWriter::new(databases(options, 10)).unwrap();
        let rows = project(
            DeploymentTarget::LocalTarget,
            &identifier(),
            &rb1_metadata(),
            &batch(),
        )
        .unwrap();

        let error = writer
            .write(DeploymentTarget::LocalTarget, &rows)
            .await
            .unwrap_err();
        assert!(error.is_connectivity());
    }
}
