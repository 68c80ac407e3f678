use std::fmt;

use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{Connection, Error as SqlxError};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0:?} is not a valid SQL identifier")]
pub struct InvalidIdentifier(pub String);

/// A schema-qualified table name, checked to be safe for interpolation into SQL text.
///
/// sqlx cannot bind identifiers, so table names are validated once at construction and then
/// rendered double-quoted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualifiedTable {
    schema: Option<String>,
    table: String,
}

fn check_identifier(value: &str) -> Result<String, InvalidIdentifier> {
    let valid = !value.is_empty()
        && value.len() <= 63
        && value
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');
    if valid {
        Ok(value.to_ascii_lowercase())
    } else {
        Err(InvalidIdentifier(value.to_owned()))
    }
}

impl QualifiedTable {
    pub fn new(schema: Option<&str>, table: &str) -> Result<Self, InvalidIdentifier> {
        let schema = match schema.map(str::trim).filter(|s| !s.is_empty()) {
            Some(schema) => Some(check_identifier(schema)?),
            None => None,
        };
        Ok(Self {
            schema,
            table: check_identifier(table)?,
        })
    }

    /// Quoted form for SQL text, e.g. `"spss"."fd_rb2_campaigns_users"`.
    pub fn quoted(&self) -> String {
        match &self.schema {
            Some(schema) => format!(r#""{}"."{}""#, schema, self.table),
            None => format!(r#""{}""#, self.table),
        }
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

impl fmt::Display for QualifiedTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.schema {
            Some(schema) => write!(f, "{}.{}", schema, self.table),
            None => f.write_str(&self.table),
        }
    }
}

/// Open a dedicated, unpooled connection. It is closed when dropped.
pub async fn connect(options: &PgConnectOptions) -> Result<PgConnection, SqlxError> {
    PgConnection::connect_with(options).await
}

/// Determines if a sqlx::Error is an integrity constraint violation, e.g. a duplicate key.
pub fn is_integrity_error(error: &SqlxError) -> bool {
    match error {
        SqlxError::Database(db_error) => {
            // Class 23 — Integrity Constraint Violation
            // See: https://www.postgresql.org/docs/current/errcodes-appendix.html
            if let Some(code) = db_error.code() {
                code.starts_with("23")
            } else {
                let msg = db_error.message().to_lowercase();
                msg.contains("duplicate key") || msg.contains("violates")
            }
        }
        _ => false,
    }
}

/// Determines if a sqlx::Error means the database could not be reached at all.
pub fn is_connectivity_error(error: &SqlxError) -> bool {
    match error {
        SqlxError::Io(_)
        | SqlxError::Tls(_)
        | SqlxError::PoolTimedOut
        | SqlxError::PoolClosed
        | SqlxError::Configuration(_) => true,

        // 08*** Connection Exception, 57P0* server shutting down
        SqlxError::Database(db_error) => db_error
            .code()
            .is_some_and(|code| code.starts_with("08") || code.starts_with("57P0")),

        SqlxError::Protocol(msg) => {
            let m = msg.to_lowercase();
            m.contains("connection") || m.contains("timeout")
        }

        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qualified_table_rendering() {
        let table = QualifiedTable::new(Some("DSSB_OCDS"), "mb01_camp_dict").unwrap();
        assert_eq!(table.to_string(), "dssb_ocds.mb01_camp_dict");
        assert_eq!(table.quoted(), r#""dssb_ocds"."mb01_camp_dict""#);

        let bare = QualifiedTable::new(Some(" "), "off_limit_campaigns_users").unwrap();
        assert_eq!(bare.to_string(), "off_limit_campaigns_users");
    }

    #[test]
    fn test_qualified_table_rejects_injection() {
        assert!(QualifiedTable::new(None, "users; drop table x").is_err());
        assert!(QualifiedTable::new(Some("a\"b"), "users").is_err());
        assert!(QualifiedTable::new(None, "1users").is_err());
        assert!(QualifiedTable::new(None, "").is_err());
    }

    #[test]
    fn test_connectivity_errors() {
        let io_error = SqlxError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
        ));
        assert!(is_connectivity_error(&io_error));
        assert!(is_connectivity_error(&SqlxError::PoolTimedOut));
        assert!(!is_connectivity_error(&SqlxError::RowNotFound));

        assert!(!is_integrity_error(&io_error));
        assert!(!is_integrity_error(&SqlxError::RowNotFound));
    }
}
