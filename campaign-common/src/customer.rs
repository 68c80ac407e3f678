use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Number of digits in the persisted, zero-padded form of a customer identifier.
pub const CUSTOMER_ID_WIDTH: usize = 12;

const MAX_CUSTOMER_ID: u64 = 999_999_999_999;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CustomerIdError {
    #[error("customer identifier is empty")]
    Empty,
    #[error("customer identifier {0:?} contains non-digit characters")]
    NotNumeric(String),
    #[error("customer identifier {0:?} is longer than 12 digits")]
    TooLong(String),
}

/// A 12-digit national-identifier-equivalent key.
///
/// Upstream sources are inconsistent about leading zeros (numeric columns drop them), so the
/// value is held as an integer and rendered zero-padded wherever a fixed-width string is needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CustomerIdentifier(u64);

impl CustomerIdentifier {
    pub fn new(value: u64) -> Result<Self, CustomerIdError> {
        if value > MAX_CUSTOMER_ID {
            return Err(CustomerIdError::TooLong(value.to_string()));
        }
        Ok(Self(value))
    }

    /// Fixed-width, zero-padded form, e.g. `000123456789`.
    pub fn padded(&self) -> String {
        format!("{:0width$}", self.0, width = CUSTOMER_ID_WIDTH)
    }

    /// Integer form, for targets keyed by a numeric surrogate id.
    pub fn as_i64(&self) -> i64 {
        // MAX_CUSTOMER_ID fits comfortably in i64.
        i64::try_from(self.0).unwrap_or(i64::MAX)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl FromStr for CustomerIdentifier {
    type Err = CustomerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(CustomerIdError::Empty);
        }
        if !trimmed.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CustomerIdError::NotNumeric(trimmed.to_owned()));
        }
        if trimmed.len() > CUSTOMER_ID_WIDTH {
            return Err(CustomerIdError::TooLong(trimmed.to_owned()));
        }
        let value = trimmed
            .parse::<u64>()
            .map_err(|_| CustomerIdError::NotNumeric(trimmed.to_owned()))?;
        Ok(Self(value))
    }
}

impl fmt::Display for CustomerIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.padded())
    }
}

impl Serialize for CustomerIdentifier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.padded())
    }
}

/// Accepts both `"000123456789"` and `123456789`, since uploads and query results disagree.
impl<'de> Deserialize<'de> for CustomerIdentifier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Text(String),
            Number(u64),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Text(s) => s.parse().map_err(de::Error::custom),
            Raw::Number(n) => CustomerIdentifier::new(n).map_err(de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pads_short_identifiers() {
        let id: CustomerIdentifier = "123456789".parse().unwrap();
        assert_eq!(id.padded(), "000123456789");
        assert_eq!(id.as_i64(), 123456789);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!("".parse::<CustomerIdentifier>(), Err(CustomerIdError::Empty));
        assert!(matches!(
            "12345a".parse::<CustomerIdentifier>(),
            Err(CustomerIdError::NotNumeric(_))
        ));
        assert!(matches!(
            "1234567890123".parse::<CustomerIdentifier>(),
            Err(CustomerIdError::TooLong(_))
        ));
        assert!(CustomerIdentifier::new(1_000_000_000_000).is_err());
    }

    #[test]
    fn test_deserialize_from_string_or_number() {
        let ids: Vec<CustomerIdentifier> =
            serde_json::from_str(r#"["000000000042", 42, " 42 "]"#).unwrap();
        assert!(ids.iter().all(|id| id.value() == 42));

        let json = serde_json::to_string(&ids[0]).unwrap();
        assert_eq!(json, r#""000000000042""#);
    }
}
