//! Lookup contract for cached reference datasets.
//!
//! The filter pipeline only ever asks two questions: "who is in dataset X" and "who in dataset X
//! has attribute A equal to one of V". Both answers are sets of customers, and both degrade to an
//! empty set when the dataset cannot be found or loaded.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::future::Cache;
use serde_json::Value;
use sqlx::postgres::PgPool;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::customer::CustomerIdentifier;
use crate::database::QualifiedTable;

/// Columns tried, in order, as the customer key of a dataset table.
const CUSTOMER_COLUMNS: &[&str] = &["iin", "client_iin"];

#[derive(Error, Debug)]
pub enum DatasetLoadError {
    #[error("dataset {0} is not known to the loader")]
    Unknown(String),
    #[error("dataset {name} is behind database link {link} and has no local table mapped")]
    RemoteLink { name: String, link: String },
    #[error("dataset {name} has no customer identifier column")]
    NoCustomerColumn { name: String },
    #[error("failed to load dataset {name}: {error}")]
    QueryError { name: String, error: sqlx::Error },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRow {
    pub customer: CustomerIdentifier,
    /// Attribute values keyed by lower-cased column name.
    pub attributes: HashMap<String, String>,
}

impl DatasetRow {
    pub fn new(customer: CustomerIdentifier) -> Self {
        Self {
            customer,
            attributes: HashMap::new(),
        }
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.attributes
            .insert(name.to_ascii_lowercase(), value.to_owned());
        self
    }
}

/// A loaded reference population.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    rows: Vec<DatasetRow>,
}

impl Dataset {
    pub fn new(rows: Vec<DatasetRow>) -> Self {
        Self { rows }
    }

    pub fn from_customers<I>(customers: I) -> Self
    where
        I: IntoIterator<Item = CustomerIdentifier>,
    {
        Self::new(customers.into_iter().map(DatasetRow::new).collect())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn members(&self) -> HashSet<CustomerIdentifier> {
        self.rows.iter().map(|row| row.customer).collect()
    }

    /// Customers having `attribute` equal to any of `values`.
    pub fn members_where(&self, attribute: &str, values: &[String]) -> HashSet<CustomerIdentifier> {
        let attribute = attribute.to_ascii_lowercase();
        self.rows
            .iter()
            .filter(|row| {
                row.attributes
                    .get(&attribute)
                    .is_some_and(|value| values.iter().any(|wanted| wanted == value))
            })
            .map(|row| row.customer)
            .collect()
    }
}

/// Loads a dataset from wherever it lives. Refresh policy belongs to the cache, not the loader.
#[async_trait]
pub trait DatasetLoader: Send + Sync {
    async fn load(&self, name: &str) -> Result<Dataset, DatasetLoadError>;
}

/// Membership lookups used by the filter pipeline. Never fails: an unavailable dataset is empty.
#[async_trait]
pub trait DatasetCache: Send + Sync {
    async fn lookup_membership(&self, dataset: &str) -> HashSet<CustomerIdentifier>;

    async fn lookup_membership_by_attribute(
        &self,
        dataset: &str,
        attribute: &str,
        values: &[String],
    ) -> HashSet<CustomerIdentifier>;
}

/// A [`DatasetCache`] keeping loaded datasets in memory for a fixed time-to-live.
///
/// Failed loads are not cached, so the next lookup tries the loader again.
pub struct CachedDatasets {
    loader: Arc<dyn DatasetLoader>,
    cache: Cache<String, Arc<Dataset>>,
}

impl CachedDatasets {
    pub fn new(loader: Arc<dyn DatasetLoader>, ttl: Duration, capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self { loader, cache }
    }

    async fn dataset(&self, name: &str) -> Option<Arc<Dataset>> {
        let loader = self.loader.clone();
        let owned_name = name.to_owned();
        let result = self
            .cache
            .try_get_with(name.to_owned(), async move {
                let dataset = loader.load(&owned_name).await?;
                info!(
                    dataset = owned_name.as_str(),
                    rows = dataset.len(),
                    "loaded reference dataset"
                );
                Ok::<_, DatasetLoadError>(Arc::new(dataset))
            })
            .await;

        match result {
            Ok(dataset) => Some(dataset),
            Err(error) => {
                match error.as_ref() {
                    DatasetLoadError::RemoteLink { link, .. } => warn!(
                        dataset = name,
                        link = link.as_str(),
                        "reference dataset skipped, it needs a local table mapping: {}",
                        error
                    ),
                    _ => warn!(dataset = name, "reference dataset unavailable: {}", error),
                }
                metrics::counter!("campaign_dataset_load_failures_total", "dataset" => name.to_owned())
                    .increment(1);
                None
            }
        }
    }

    /// Drop a cached dataset so the next lookup reloads it.
    pub async fn invalidate(&self, name: &str) {
        self.cache.invalidate(name).await;
    }
}

#[async_trait]
impl DatasetCache for CachedDatasets {
    async fn lookup_membership(&self, dataset: &str) -> HashSet<CustomerIdentifier> {
        self.dataset(dataset)
            .await
            .map(|d| d.members())
            .unwrap_or_default()
    }

    async fn lookup_membership_by_attribute(
        &self,
        dataset: &str,
        attribute: &str,
        values: &[String],
    ) -> HashSet<CustomerIdentifier> {
        self.dataset(dataset)
            .await
            .map(|d| d.members_where(attribute, values))
            .unwrap_or_default()
    }
}

/// Datasets held in memory, keyed by name. Unknown names fail to load.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatasets {
    datasets: HashMap<String, Dataset>,
}

impl InMemoryDatasets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(mut self, name: &str, dataset: Dataset) -> Self {
        self.datasets.insert(name.to_owned(), dataset);
        self
    }
}

#[async_trait]
impl DatasetLoader for InMemoryDatasets {
    async fn load(&self, name: &str) -> Result<Dataset, DatasetLoadError> {
        self.datasets
            .get(name)
            .cloned()
            .ok_or_else(|| DatasetLoadError::Unknown(name.to_owned()))
    }
}

/// Loads a dataset from the Postgres table of the same name, e.g. `dssb_dm.hb_sessions_fl`.
///
/// Names can be mapped to another table with [`PgDatasetLoader::with_aliases`], which is how
/// datasets named after a database link (`SCHEMA.TABLE@LINK`) are made loadable.
///
/// Every column becomes a string attribute; the customer key is taken from `iin`, falling back
/// to `client_iin`. Rows without a valid customer identifier are skipped.
pub struct PgDatasetLoader {
    pool: PgPool,
    aliases: HashMap<String, String>,
}

impl PgDatasetLoader {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            aliases: HashMap::new(),
        }
    }

    /// Map dataset names to the tables holding them. Names are matched case-insensitively.
    pub fn with_aliases(mut self, aliases: HashMap<String, String>) -> Self {
        self.aliases = aliases
            .into_iter()
            .map(|(name, table)| (name.to_ascii_lowercase(), table))
            .collect();
        self
    }

    fn table(&self, name: &str) -> Result<QualifiedTable, DatasetLoadError> {
        match self.aliases.get(&name.to_ascii_lowercase()) {
            Some(table) => {
                table_for(table).map_err(|_| DatasetLoadError::Unknown(name.to_owned()))
            }
            None => table_for(name),
        }
    }
}

fn table_for(name: &str) -> Result<QualifiedTable, DatasetLoadError> {
    if let Some((_, link)) = name.split_once('@') {
        return Err(DatasetLoadError::RemoteLink {
            name: name.to_owned(),
            link: link.to_owned(),
        });
    }

    let unknown = || DatasetLoadError::Unknown(name.to_owned());
    match name.split_once('.') {
        Some((schema, table)) => QualifiedTable::new(Some(schema), table).map_err(|_| unknown()),
        None => QualifiedTable::new(None, name).map_err(|_| unknown()),
    }
}

fn attribute_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

fn dataset_row(
    name: &str,
    mut columns: serde_json::Map<String, Value>,
) -> Result<Option<DatasetRow>, DatasetLoadError> {
    let key = CUSTOMER_COLUMNS
        .iter()
        .find(|column| columns.contains_key(**column))
        .ok_or_else(|| DatasetLoadError::NoCustomerColumn {
            name: name.to_owned(),
        })?;

    let customer = columns
        .remove(*key)
        .as_ref()
        .and_then(attribute_text)
        .and_then(|raw| raw.parse::<CustomerIdentifier>().ok());

    Ok(customer.map(|customer| DatasetRow {
        customer,
        attributes: columns
            .iter()
            .filter_map(|(column, value)| {
                attribute_text(value).map(|text| (column.to_ascii_lowercase(), text))
            })
            .collect(),
    }))
}

#[async_trait]
impl DatasetLoader for PgDatasetLoader {
    async fn load(&self, name: &str) -> Result<Dataset, DatasetLoadError> {
        let table = self.table(name)?;
        let query = format!("SELECT to_jsonb(t) FROM {} t", table.quoted());

        let records: Vec<(sqlx::types::Json<serde_json::Map<String, Value>>,)> =
            sqlx::query_as(&query)
                .fetch_all(&self.pool)
                .await
                .map_err(|error| DatasetLoadError::QueryError {
                    name: name.to_owned(),
                    error,
                })?;

        let total = records.len();
        let mut rows = Vec::with_capacity(total);
        for (record,) in records {
            if let Some(row) = dataset_row(name, record.0)? {
                rows.push(row);
            }
        }
        if rows.len() < total {
            debug!(
                dataset = name,
                skipped = total - rows.len(),
                "skipped rows without a valid customer identifier"
            );
        }

        Ok(Dataset::new(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn customer(n: u64) -> CustomerIdentifier {
        CustomerIdentifier::new(n).unwrap()
    }

    struct CountingLoader {
        inner: InMemoryDatasets,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl DatasetLoader for CountingLoader {
        async fn load(&self, name: &str) -> Result<Dataset, DatasetLoadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.load(name).await
        }
    }

    fn sessions() -> Dataset {
        Dataset::new(vec![
            DatasetRow::new(customer(1)).with_attribute("OPERATIONSYSTEM", "iOS"),
            DatasetRow::new(customer(2)).with_attribute("OPERATIONSYSTEM", "Android"),
            DatasetRow::new(customer(3)).with_attribute("OPERATIONSYSTEM", "iOS"),
        ])
    }

    #[tokio::test]
    async fn test_lookup_by_attribute() {
        let loader = InMemoryDatasets::new().with_dataset("dssb_dm.hb_sessions_fl", sessions());
        let cache = CachedDatasets::new(Arc::new(loader), Duration::from_secs(60), 16);

        let ios = cache
            .lookup_membership_by_attribute(
                "dssb_dm.hb_sessions_fl",
                "operationsystem",
                &["iOS".to_owned()],
            )
            .await;

        assert_eq!(ios, [customer(1), customer(3)].into_iter().collect());
    }

    #[tokio::test]
    async fn test_unknown_dataset_is_empty() {
        let cache = CachedDatasets::new(
            Arc::new(InMemoryDatasets::new()),
            Duration::from_secs(60),
            16,
        );

        assert!(cache.lookup_membership("missing").await.is_empty());
        assert!(cache
            .lookup_membership_by_attribute("missing", "a", &["b".to_owned()])
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_loaded_datasets_are_cached_and_failures_are_not() {
        let loader = Arc::new(CountingLoader {
            inner: InMemoryDatasets::new().with_dataset("MAU", Dataset::from_customers([customer(9)])),
            calls: AtomicUsize::new(0),
        });
        let cache = CachedDatasets::new(loader.clone(), Duration::from_secs(60), 16);

        assert_eq!(cache.lookup_membership("MAU").await.len(), 1);
        assert_eq!(cache.lookup_membership("MAU").await.len(), 1);
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        cache.lookup_membership("nope").await;
        cache.lookup_membership("nope").await;
        assert_eq!(loader.calls.load(Ordering::SeqCst), 3);

        cache.invalidate("MAU").await;
        cache.lookup_membership("MAU").await;
        assert_eq!(loader.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_table_for_dataset_names() {
        assert_eq!(
            table_for("dssb_dm.hb_sessions_fl").unwrap().to_string(),
            "dssb_dm.hb_sessions_fl"
        );
        assert_eq!(table_for("MAU").unwrap().to_string(), "mau");
        assert!(matches!(
            table_for("ACRM_DW.RB_BLACK_LIST@ACRM"),
            Err(DatasetLoadError::RemoteLink { link, .. }) if link == "ACRM"
        ));
        assert!(matches!(table_for("bad name"), Err(DatasetLoadError::Unknown(_))));
    }

    #[test]
    fn test_dataset_row_from_json() {
        let columns = json!({"client_iin": 42, "operationsystem": "iOS", "extra": null})
            .as_object()
            .cloned()
            .unwrap();

        let row = dataset_row("sessions", columns).unwrap().unwrap();
        assert_eq!(row.customer, customer(42));
        assert_eq!(row.attributes.get("operationsystem").map(String::as_str), Some("iOS"));
        assert!(!row.attributes.contains_key("extra"));

        let bad = json!({"iin": "not-an-id"}).as_object().cloned().unwrap();
        assert_eq!(dataset_row("sessions", bad).unwrap(), None);

        let keyless = json!({"name": "x"}).as_object().cloned().unwrap();
        assert!(matches!(
            dataset_row("sessions", keyless),
            Err(DatasetLoadError::NoCustomerColumn { .. })
        ));
    }

    async fn seed(db: &PgPool) {
        for statement in [
            "CREATE SCHEMA dssb_de",
            "CREATE TABLE dssb_de.ucs_push_off (client_iin TEXT, eventdescription TEXT)",
            "INSERT INTO dssb_de.ucs_push_off VALUES \
             ('000000000001', 'Promo'), ('2', 'Promo'), ('3', 'Service'), ('bogus', 'Promo')",
            "INSERT INTO mau (iin) VALUES ('000000000001'), ('000000000002')",
            "CREATE TABLE dssb_dm.black_list (iin BIGINT)",
            "INSERT INTO dssb_dm.black_list VALUES (5), (6)",
        ] {
            sqlx::query(statement).execute(db).await.unwrap();
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pg_loader_reads_client_iin_tables(db: PgPool) {
        seed(&db).await;
        let cache = CachedDatasets::new(
            Arc::new(PgDatasetLoader::new(db)),
            Duration::from_secs(60),
            16,
        );

        let promo = cache
            .lookup_membership_by_attribute(
                "dssb_de.ucs_push_off",
                "EVENTDESCRIPTION",
                &["Promo".to_owned()],
            )
            .await;
        assert_eq!(promo, [customer(1), customer(2)].into_iter().collect());

        assert_eq!(
            cache.lookup_membership("MAU").await,
            [customer(1), customer(2)].into_iter().collect()
        );
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_pg_loader_resolves_linked_names_through_aliases(db: PgPool) {
        seed(&db).await;
        let linked = "ACRM_DW.RB_BLACK_LIST@ACRM";

        let unmapped = PgDatasetLoader::new(db.clone());
        assert!(matches!(
            unmapped.load(linked).await,
            Err(DatasetLoadError::RemoteLink { .. })
        ));

        let mapped = PgDatasetLoader::new(db).with_aliases(HashMap::from([(
            linked.to_owned(),
            "dssb_dm.black_list".to_owned(),
        )]));
        let dataset = mapped.load("acrm_dw.rb_black_list@acrm").await.unwrap();
        assert_eq!(dataset.members(), [customer(5), customer(6)].into_iter().collect());
    }
}
