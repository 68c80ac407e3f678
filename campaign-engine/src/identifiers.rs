//! Campaign and bonus identifier allocation.
//!
//! Allocation is a read of the current maximum followed, much later, by the caller writing the
//! new identifier into a dictionary table. Nothing is reserved in between, so two concurrent
//! callers can be handed the same value: allocation is at-least-once, not exactly-once. Callers
//! that need stronger guarantees substitute their own [`IdentifierAllocator`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use tracing::{info, warn};

use campaign_common::database::{connect, InvalidIdentifier, QualifiedTable};
use campaign_common::deployment::DeploymentTarget;
use campaign_common::identifier::{CampaignIdentifier, IdentifierFamily};
use campaign_common::metadata::CampaignKind;
use campaign_common::metrics::{IDENTIFIERS_ALLOCATED, IDENTIFIER_FALLBACKS};

use crate::error::StoreError;

/// Identifiers handed out for one campaign. RB3 campaigns get a bonus identifier as well.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedIdentifiers {
    pub campaign: CampaignIdentifier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bonus: Option<CampaignIdentifier>,
}

/// Read access to the identifiers already in use.
#[async_trait]
pub trait IdentifierStore: Send + Sync {
    /// Greatest well-formed identifier of `family` currently stored, if any.
    async fn current_max(
        &self,
        family: IdentifierFamily,
    ) -> Result<Option<CampaignIdentifier>, StoreError>;
}

#[async_trait]
pub trait IdentifierAllocator: Send + Sync {
    /// Next identifier of `family`. Never fails: a degraded value is returned instead.
    async fn next_identifier(&self, family: IdentifierFamily) -> CampaignIdentifier;

    async fn next_rb1_identifier(&self) -> CampaignIdentifier {
        self.next_identifier(IdentifierFamily::Campaign).await
    }

    async fn next_rb3_bonus_identifier(&self) -> CampaignIdentifier {
        self.next_identifier(IdentifierFamily::Bonus).await
    }

    /// Every identifier a campaign of `kind` needs. Both kinds share the campaign code space.
    async fn allocate(&self, kind: CampaignKind) -> AllocatedIdentifiers {
        let campaign = self.next_rb1_identifier().await;
        let bonus = match kind {
            CampaignKind::Rb1 => None,
            CampaignKind::Rb3 => Some(self.next_rb3_bonus_identifier().await),
        };
        AllocatedIdentifiers { campaign, bonus }
    }
}

/// Allocates by incrementing the stored maximum, falling back to a clock-derived value when the
/// store cannot be read.
pub struct MaxScanAllocator<S> {
    store: S,
    clock: fn() -> DateTime<Utc>,
}

impl<S: IdentifierStore> MaxScanAllocator<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Utc::now,
        }
    }

    /// Replace the wall clock used for fallback identifiers.
    pub fn with_clock(mut self, clock: fn() -> DateTime<Utc>) -> Self {
        self.clock = clock;
        self
    }

    fn fallback(&self, family: IdentifierFamily, reason: &dyn std::fmt::Display) -> CampaignIdentifier {
        let identifier = CampaignIdentifier::fallback(family, &(self.clock)());
        warn!(
            family = family.as_str(),
            identifier = %identifier,
            "falling back to clock-derived identifier: {}",
            reason
        );
        metrics::counter!(IDENTIFIER_FALLBACKS, "family" => family.as_str()).increment(1);
        identifier
    }
}

#[async_trait]
impl<S: IdentifierStore> IdentifierAllocator for MaxScanAllocator<S> {
    async fn next_identifier(&self, family: IdentifierFamily) -> CampaignIdentifier {
        let identifier = match self.store.current_max(family).await {
            Ok(Some(current)) => match current.next() {
                Ok(next) => next,
                Err(error) => self.fallback(family, &error),
            },
            Ok(None) => CampaignIdentifier::first(family),
            Err(error) => self.fallback(family, &error),
        };

        info!(family = family.as_str(), identifier = %identifier, "allocated identifier");
        metrics::counter!(IDENTIFIERS_ALLOCATED, "family" => family.as_str()).increment(1);

        identifier
    }
}

/// Reads identifier maxima from the campaign dictionaries, using a dedicated connection per
/// lookup.
pub struct PgIdentifierStore {
    options: PgConnectOptions,
    campaign_dictionary: QualifiedTable,
    bonus_dictionary: QualifiedTable,
}

impl PgIdentifierStore {
    pub fn new(
        options: PgConnectOptions,
        schema: Option<&str>,
    ) -> Result<Self, InvalidIdentifier> {
        Ok(Self {
            options,
            campaign_dictionary: QualifiedTable::new(
                schema,
                DeploymentTarget::CampaignDictionary.table(),
            )?,
            bonus_dictionary: QualifiedTable::new(
                schema,
                DeploymentTarget::BonusCampaignDictionary.table(),
            )?,
        })
    }

    fn source(&self, family: IdentifierFamily) -> (&QualifiedTable, &'static str) {
        match family {
            IdentifierFamily::Campaign => (&self.campaign_dictionary, "campaigncode"),
            IdentifierFamily::Bonus => (&self.bonus_dictionary, "xls_ow_id"),
        }
    }
}

#[async_trait]
impl IdentifierStore for PgIdentifierStore {
    async fn current_max(
        &self,
        family: IdentifierFamily,
    ) -> Result<Option<CampaignIdentifier>, StoreError> {
        let (table, column) = self.source(family);
        // Identifiers are fixed width, so the lexical maximum is the numeric one.
        let query = format!(
            "SELECT MAX({column}) FROM {table} WHERE {column} ~ $1",
            column = column,
            table = table.quoted()
        );

        let mut conn = connect(&self.options)
            .await
            .map_err(StoreError::ConnectionError)?;

        let max: Option<String> = sqlx::query_scalar(&query)
            .bind(family.pattern())
            .fetch_one(&mut conn)
            .await
            .map_err(StoreError::QueryError)?;

        if let Err(error) = sqlx::Connection::close(conn).await {
            warn!("failed to close identifier store connection: {}", error);
        }

        Ok(max
            .map(|value| CampaignIdentifier::parse(family, &value))
            .transpose()?)
    }
}
