use std::fmt;

use chrono::{DateTime, TimeZone};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IdentifierError {
    #[error("{value:?} is not a valid {family} identifier")]
    Malformed {
        family: IdentifierFamily,
        value: String,
    },
    #[error("{family} identifier space is exhausted after {last}")]
    Exhausted {
        family: IdentifierFamily,
        last: String,
    },
}

/// The two identifier families in use.
///
/// Campaign: `C` followed by 9 zero-padded digits, e.g. `C000012345`.
/// Bonus: `KKB_` followed by 4 zero-padded digits, e.g. `KKB_0123`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentifierFamily {
    Campaign,
    Bonus,
}

impl IdentifierFamily {
    pub fn prefix(&self) -> &'static str {
        match self {
            IdentifierFamily::Campaign => "C",
            IdentifierFamily::Bonus => "KKB_",
        }
    }

    pub fn digits(&self) -> usize {
        match self {
            IdentifierFamily::Campaign => 9,
            IdentifierFamily::Bonus => 4,
        }
    }

    /// Total width of a well-formed identifier.
    pub fn width(&self) -> usize {
        self.prefix().len() + self.digits()
    }

    /// POSIX regular expression matching exactly the well-formed identifiers of this family.
    pub fn pattern(&self) -> String {
        format!("^{}[0-9]{{{}}}$", self.prefix(), self.digits())
    }

    fn max_suffix(&self) -> u64 {
        10u64.pow(u32::try_from(self.digits()).unwrap_or(u32::MAX)) - 1
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdentifierFamily::Campaign => "campaign",
            IdentifierFamily::Bonus => "bonus",
        }
    }
}

impl fmt::Display for IdentifierFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed-width campaign or bonus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(into = "String")]
pub struct CampaignIdentifier {
    family: IdentifierFamily,
    suffix: u64,
}

impl CampaignIdentifier {
    /// The canonical first identifier of a family: `C000000001` or `KKB_0001`.
    pub fn first(family: IdentifierFamily) -> Self {
        Self { family, suffix: 1 }
    }

    pub fn from_suffix(family: IdentifierFamily, suffix: u64) -> Result<Self, IdentifierError> {
        if suffix > family.max_suffix() {
            return Err(IdentifierError::Malformed {
                family,
                value: format!("{}{}", family.prefix(), suffix),
            });
        }
        Ok(Self { family, suffix })
    }

    /// Parse a stored identifier, requiring the exact prefix and width of `family`.
    pub fn parse(family: IdentifierFamily, value: &str) -> Result<Self, IdentifierError> {
        let malformed = || IdentifierError::Malformed {
            family,
            value: value.to_owned(),
        };

        let digits = value.strip_prefix(family.prefix()).ok_or_else(malformed)?;
        if digits.len() != family.digits() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        let suffix = digits.parse::<u64>().map_err(|_| malformed())?;

        Ok(Self { family, suffix })
    }

    /// The identifier following this one. Fails rather than widening past the fixed width.
    pub fn next(&self) -> Result<Self, IdentifierError> {
        if self.suffix >= self.family.max_suffix() {
            return Err(IdentifierError::Exhausted {
                family: self.family,
                last: self.to_string(),
            });
        }
        Ok(Self {
            family: self.family,
            suffix: self.suffix + 1,
        })
    }

    /// Clock-derived identifier used when the store cannot be consulted.
    ///
    /// Campaign identifiers take `%m%d%H%M%S` clipped to 9 digits, bonus identifiers take `%H%M`.
    /// Neither is guaranteed unique nor ordered relative to earlier allocations.
    pub fn fallback<Tz>(family: IdentifierFamily, now: &DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        let stamp = match family {
            IdentifierFamily::Campaign => now.format("%m%d%H%M%S").to_string(),
            IdentifierFamily::Bonus => now.format("%H%M").to_string(),
        };
        let clipped: String = stamp.chars().take(family.digits()).collect();
        let suffix = clipped.parse::<u64>().unwrap_or(0);

        Self { family, suffix }
    }

    pub fn family(&self) -> IdentifierFamily {
        self.family
    }

    pub fn suffix(&self) -> u64 {
        self.suffix
    }
}

impl fmt::Display for CampaignIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:0width$}",
            self.family.prefix(),
            self.suffix,
            width = self.family.digits()
        )
    }
}

impl From<CampaignIdentifier> for String {
    fn from(value: CampaignIdentifier) -> Self {
        value.to_string()
    }
}

impl<'de> Deserialize<'de> for CampaignIdentifier {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let family = if raw.starts_with(IdentifierFamily::Bonus.prefix()) {
            IdentifierFamily::Bonus
        } else {
            IdentifierFamily::Campaign
        };
        CampaignIdentifier::parse(family, &raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, Utc};

    #[test]
    fn test_next_campaign_identifier() {
        let current = CampaignIdentifier::parse(IdentifierFamily::Campaign, "C000012345").unwrap();
        assert_eq!(current.next().unwrap().to_string(), "C000012346");
    }

    #[test]
    fn test_next_bonus_identifier() {
        let current = CampaignIdentifier::parse(IdentifierFamily::Bonus, "KKB_0123").unwrap();
        assert_eq!(current.next().unwrap().to_string(), "KKB_0124");
    }

    #[test]
    fn test_first_identifiers() {
        assert_eq!(
            CampaignIdentifier::first(IdentifierFamily::Campaign).to_string(),
            "C000000001"
        );
        assert_eq!(
            CampaignIdentifier::first(IdentifierFamily::Bonus).to_string(),
            "KKB_0001"
        );
    }

    #[test]
    fn test_parse_rejects_wrong_shape() {
        for value in ["C12345", "C0000123456", "X000012345", "C00001234a", "KKB_12345"] {
            let family = if value.starts_with("KKB_") {
                IdentifierFamily::Bonus
            } else {
                IdentifierFamily::Campaign
            };
            assert!(
                CampaignIdentifier::parse(family, value).is_err(),
                "{value} should not parse"
            );
        }
    }

    #[test]
    fn test_next_never_widens() {
        let last = CampaignIdentifier::parse(IdentifierFamily::Bonus, "KKB_9999").unwrap();
        assert!(matches!(
            last.next(),
            Err(IdentifierError::Exhausted { .. })
        ));
    }

    #[test]
    fn test_fallback_has_fixed_width() {
        let now = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 42)
            .unwrap()
            .and_utc();

        let campaign = CampaignIdentifier::fallback(IdentifierFamily::Campaign, &now);
        assert_eq!(campaign.to_string(), "C030709054");

        let bonus = CampaignIdentifier::fallback(IdentifierFamily::Bonus, &now);
        assert_eq!(bonus.to_string(), "KKB_0905");

        let today = CampaignIdentifier::fallback(IdentifierFamily::Campaign, &Utc::now());
        assert_eq!(today.to_string().len(), IdentifierFamily::Campaign.width());
    }

    #[test]
    fn test_pattern() {
        assert_eq!(IdentifierFamily::Campaign.pattern(), "^C[0-9]{9}$");
        assert_eq!(IdentifierFamily::Bonus.pattern(), "^KKB_[0-9]{4}$");
    }

    #[test]
    fn test_serde_as_string() {
        let id = CampaignIdentifier::parse(IdentifierFamily::Bonus, "KKB_0042").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, r#""KKB_0042""#);
        let back: CampaignIdentifier = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
