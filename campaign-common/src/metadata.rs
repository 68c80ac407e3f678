use std::fmt;
use std::str::FromStr;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::identifier::CampaignIdentifier;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is not a valid campaign type, expected RB1 or RB3")]
    UnknownCampaignKind(String),
    #[error("required metadata field '{0}' is missing or blank")]
    MissingField(&'static str),
    #[error("campaign ends on {date_end} before it starts on {date_start}")]
    InvertedDateRange {
        date_start: NaiveDate,
        date_end: NaiveDate,
    },
    #[error("RB3 campaign has no bonus identifier assigned")]
    MissingBonusIdentifier,
    #[error("metadata is for a {metadata} campaign but deployment was requested as {requested}")]
    KindMismatch {
        metadata: CampaignKind,
        requested: CampaignKind,
    },
    #[error("invalid metadata: {0}")]
    Malformed(String),
}

/// Campaign variant discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CampaignKind {
    #[serde(rename = "RB1")]
    Rb1,
    #[serde(rename = "RB3")]
    Rb3,
}

impl CampaignKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignKind::Rb1 => "RB1",
            CampaignKind::Rb3 => "RB3",
        }
    }
}

impl fmt::Display for CampaignKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CampaignKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "RB1" => Ok(CampaignKind::Rb1),
            "RB3" => Ok(CampaignKind::Rb3),
            other => Err(ValidationError::UnknownCampaignKind(other.to_owned())),
        }
    }
}

/// Fields shared by every campaign variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseMetadata {
    pub campaign_name: String,
    pub campaign_desc: String,
    pub stream: String,
    pub sub_stream: String,
    pub target_action: String,
    /// Delivery channel, e.g. `Push`, `POP-UP` or `SMS`.
    pub channel: String,
    /// Free-form marketing classification, unrelated to [`CampaignKind`].
    pub campaign_type: String,
    pub campaign_text: String,
    #[serde(default)]
    pub campaign_text_kz: Option<String>,
    #[serde(default)]
    pub campaign_model: Option<String>,
    #[serde(default)]
    pub cds_launcher: Option<String>,
    pub short_desc: String,
    pub date_start: NaiveDate,
    pub date_end: NaiveDate,
    pub out_date: NaiveDate,
    #[serde(default)]
    pub camp_cnt: Option<String>,
}

impl BaseMetadata {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let required = [
            ("campaign_name", &self.campaign_name),
            ("campaign_desc", &self.campaign_desc),
            ("stream", &self.stream),
            ("sub_stream", &self.sub_stream),
            ("target_action", &self.target_action),
            ("channel", &self.channel),
            ("campaign_type", &self.campaign_type),
            ("campaign_text", &self.campaign_text),
            ("short_desc", &self.short_desc),
        ];
        if let Some((name, _)) = required.iter().find(|(_, value)| value.trim().is_empty()) {
            return Err(ValidationError::MissingField(*name));
        }

        if self.date_end < self.date_start {
            return Err(ValidationError::InvertedDateRange {
                date_start: self.date_start,
                date_end: self.date_end,
            });
        }

        Ok(())
    }
}

/// RB3 campaigns carry a bonus on top of the shared fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BonusMetadata {
    #[serde(flatten)]
    pub base: BaseMetadata,
    #[serde(default)]
    pub bonus: Option<String>,
    #[serde(default)]
    pub characteristic_json: Option<serde_json::Value>,
    /// Assigned by the engine at allocation time, never supplied by callers.
    #[serde(default, skip_deserializing)]
    pub bonus_identifier: Option<CampaignIdentifier>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "campaign_kind")]
pub enum CampaignMetadata {
    #[serde(rename = "RB1")]
    Rb1(BaseMetadata),
    #[serde(rename = "RB3")]
    Rb3(BonusMetadata),
}

impl CampaignMetadata {
    /// Interpret an untyped metadata payload according to the requested campaign kind.
    pub fn from_value(kind: CampaignKind, value: serde_json::Value) -> Result<Self, ValidationError> {
        let malformed = |e: serde_json::Error| ValidationError::Malformed(e.to_string());
        match kind {
            CampaignKind::Rb1 => Ok(CampaignMetadata::Rb1(
                serde_json::from_value(value).map_err(malformed)?,
            )),
            CampaignKind::Rb3 => Ok(CampaignMetadata::Rb3(
                serde_json::from_value(value).map_err(malformed)?,
            )),
        }
    }

    pub fn kind(&self) -> CampaignKind {
        match self {
            CampaignMetadata::Rb1(_) => CampaignKind::Rb1,
            CampaignMetadata::Rb3(_) => CampaignKind::Rb3,
        }
    }

    pub fn base(&self) -> &BaseMetadata {
        match self {
            CampaignMetadata::Rb1(base) => base,
            CampaignMetadata::Rb3(bonus) => &bonus.base,
        }
    }

    pub fn bonus_identifier(&self) -> Option<&CampaignIdentifier> {
        match self {
            CampaignMetadata::Rb1(_) => None,
            CampaignMetadata::Rb3(bonus) => bonus.bonus_identifier.as_ref(),
        }
    }

    /// Validate the caller-supplied fields. Identifier assignment is checked separately since it
    /// happens after this point.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.base().validate()
    }

    /// Full pre-deployment check, including that RB3 metadata has its bonus identifier.
    pub fn validate_for_deployment(&self) -> Result<(), ValidationError> {
        self.validate()?;
        if let CampaignMetadata::Rb3(bonus) = self {
            if bonus.bonus_identifier.is_none() {
                return Err(ValidationError::MissingBonusIdentifier);
            }
        }
        Ok(())
    }
}
