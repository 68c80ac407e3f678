use campaign_common::database::{is_connectivity_error, is_integrity_error};
use campaign_common::deployment::Cluster;
use campaign_common::identifier::IdentifierError;
use campaign_common::metadata::ValidationError;
use thiserror::Error;

/// Enumeration of errors that can occur while writing one deployment target.
#[derive(Error, Debug)]
pub enum WriteError {
    #[error("could not reach the {cluster} cluster: {error}")]
    ConnectivityError {
        cluster: Cluster,
        error: sqlx::Error,
    },
    #[error("constraint violation: {0}")]
    IntegrityError(sqlx::Error),
    #[error("write failed: {0}")]
    QueryError(sqlx::Error),
    #[error("target is misconfigured: {0}")]
    ConfigurationError(String),
}

impl WriteError {
    /// Classify a sqlx error raised while talking to `cluster`.
    pub fn from_sqlx(cluster: Cluster, error: sqlx::Error) -> Self {
        if is_connectivity_error(&error) {
            WriteError::ConnectivityError { cluster, error }
        } else if is_integrity_error(&error) {
            WriteError::IntegrityError(error)
        } else {
            WriteError::QueryError(error)
        }
    }

    pub fn is_connectivity(&self) -> bool {
        matches!(self, WriteError::ConnectivityError { .. })
    }
}

/// Enumeration of errors raised while reading identifiers from the store.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection to identifier store failed: {0}")]
    ConnectionError(sqlx::Error),
    #[error("identifier query failed: {0}")]
    QueryError(sqlx::Error),
    #[error("stored identifier could not be used: {0}")]
    IdentifierError(#[from] IdentifierError),
}

/// The only errors that fail a campaign creation outright. Everything after validation is
/// reported in the result instead.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("campaign rejected: {0}")]
    ValidationError(#[from] ValidationError),
}
