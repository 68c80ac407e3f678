use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identifier::CampaignIdentifier;
use crate::metadata::CampaignKind;

/// The independently administered database clusters a deployment spans.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cluster {
    /// Holds campaign dictionaries and targeting rows.
    Campaign,
    /// Holds the operational user lists consumed by delivery channels.
    UserLists,
}

impl fmt::Display for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cluster::Campaign => f.write_str("campaign"),
            Cluster::UserLists => f.write_str("user-lists"),
        }
    }
}

/// One table that receives a write when a campaign is deployed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentTarget {
    CampaignDictionary,
    BonusCampaignDictionary,
    LocalTarget,
    CampaignUsers,
    OffLimitUsers,
}

const RB1_TARGETS: &[DeploymentTarget] = &[
    DeploymentTarget::CampaignDictionary,
    DeploymentTarget::LocalTarget,
    DeploymentTarget::CampaignUsers,
    DeploymentTarget::OffLimitUsers,
];

const RB3_TARGETS: &[DeploymentTarget] = &[
    DeploymentTarget::BonusCampaignDictionary,
    DeploymentTarget::LocalTarget,
    DeploymentTarget::CampaignUsers,
    DeploymentTarget::OffLimitUsers,
];

impl DeploymentTarget {
    /// Fixed write order for a campaign kind.
    pub fn ordered_for(kind: CampaignKind) -> &'static [DeploymentTarget] {
        match kind {
            CampaignKind::Rb1 => RB1_TARGETS,
            CampaignKind::Rb3 => RB3_TARGETS,
        }
    }

    /// Unqualified table name.
    pub fn table(&self) -> &'static str {
        match self {
            DeploymentTarget::CampaignDictionary => "mb01_camp_dict",
            DeploymentTarget::BonusCampaignDictionary => "rb3_tr_campaign_dict",
            DeploymentTarget::LocalTarget => "mb22_local_target",
            DeploymentTarget::CampaignUsers => "fd_rb2_campaigns_users",
            DeploymentTarget::OffLimitUsers => "off_limit_campaigns_users",
        }
    }

    pub fn cluster(&self) -> Cluster {
        match self {
            DeploymentTarget::CampaignDictionary
            | DeploymentTarget::BonusCampaignDictionary
            | DeploymentTarget::LocalTarget => Cluster::Campaign,
            DeploymentTarget::CampaignUsers | DeploymentTarget::OffLimitUsers => Cluster::UserLists,
        }
    }

    /// Whether the target holds one row per campaign rather than one row per customer.
    pub fn is_dictionary(&self) -> bool {
        matches!(
            self,
            DeploymentTarget::CampaignDictionary | DeploymentTarget::BonusCampaignDictionary
        )
    }
}

impl fmt::Display for DeploymentTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table())
    }
}

/// Caller overrides for a [`DeploymentPlan`]; unset flags keep the per-kind default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentOptions {
    #[serde(default)]
    pub deploy_metadata: Option<bool>,
    #[serde(default)]
    pub deploy_targeting: Option<bool>,
    #[serde(default)]
    pub deploy_users: Option<bool>,
    #[serde(default)]
    pub deploy_offlimit: Option<bool>,
}

/// Which targets a deployment call writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub deploy_metadata: bool,
    pub deploy_targeting: bool,
    pub deploy_users: bool,
    pub deploy_offlimit: bool,
}

impl DeploymentPlan {
    /// Every target of the kind, except the off-limit list for RB3.
    pub fn for_kind(kind: CampaignKind) -> Self {
        Self {
            deploy_metadata: true,
            deploy_targeting: true,
            deploy_users: true,
            deploy_offlimit: kind == CampaignKind::Rb1,
        }
    }

    pub fn none() -> Self {
        Self {
            deploy_metadata: false,
            deploy_targeting: false,
            deploy_users: false,
            deploy_offlimit: false,
        }
    }

    /// Plan enabling exactly `targets`, e.g. to re-run only the targets that failed.
    pub fn only(targets: &[DeploymentTarget]) -> Self {
        let mut plan = Self::none();
        for target in targets {
            match target {
                DeploymentTarget::CampaignDictionary | DeploymentTarget::BonusCampaignDictionary => {
                    plan.deploy_metadata = true
                }
                DeploymentTarget::LocalTarget => plan.deploy_targeting = true,
                DeploymentTarget::CampaignUsers => plan.deploy_users = true,
                DeploymentTarget::OffLimitUsers => plan.deploy_offlimit = true,
            }
        }
        plan
    }

    pub fn resolve(kind: CampaignKind, options: Option<&DeploymentOptions>) -> Self {
        let defaults = Self::for_kind(kind);
        match options {
            None => defaults,
            Some(options) => Self {
                deploy_metadata: options.deploy_metadata.unwrap_or(defaults.deploy_metadata),
                deploy_targeting: options.deploy_targeting.unwrap_or(defaults.deploy_targeting),
                deploy_users: options.deploy_users.unwrap_or(defaults.deploy_users),
                deploy_offlimit: options.deploy_offlimit.unwrap_or(defaults.deploy_offlimit),
            },
        }
    }

    pub fn enables(&self, target: DeploymentTarget) -> bool {
        match target {
            DeploymentTarget::CampaignDictionary | DeploymentTarget::BonusCampaignDictionary => {
                self.deploy_metadata
            }
            DeploymentTarget::LocalTarget => self.deploy_targeting,
            DeploymentTarget::CampaignUsers => self.deploy_users,
            DeploymentTarget::OffLimitUsers => self.deploy_offlimit,
        }
    }

    /// Enabled targets of `kind`, in write order.
    pub fn targets(&self, kind: CampaignKind) -> Vec<DeploymentTarget> {
        DeploymentTarget::ordered_for(kind)
            .iter()
            .copied()
            .filter(|target| self.enables(*target))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TargetStatus {
    Pending,
    Succeeded { rows_written: u64 },
    Failed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetOutcome {
    pub target: DeploymentTarget,
    /// Qualified table name as written to.
    pub table: String,
    #[serde(flatten)]
    pub status: TargetStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentState {
    NotStarted,
    InProgress,
    Completed,
}

/// What a deployment call actually wrote. This is the only record of a partial deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub campaign_identifier: CampaignIdentifier,
    pub total_users: usize,
    pub state: DeploymentState,
    pub outcomes: Vec<TargetOutcome>,
    /// Qualified names of the targets that succeeded, in write order.
    pub tables_updated: Vec<String>,
    /// One `"<table>: <error>"` entry per failed target.
    pub errors: Vec<String>,
    pub success: bool,
}

impl DeploymentResult {
    pub fn new(campaign_identifier: CampaignIdentifier, total_users: usize) -> Self {
        Self {
            campaign_identifier,
            total_users,
            state: DeploymentState::NotStarted,
            outcomes: Vec::new(),
            tables_updated: Vec::new(),
            errors: Vec::new(),
            success: false,
        }
    }

    /// Register the planned targets as pending.
    pub fn begin<I>(&mut self, targets: I)
    where
        I: IntoIterator<Item = (DeploymentTarget, String)>,
    {
        self.outcomes = targets
            .into_iter()
            .map(|(target, table)| TargetOutcome {
                target,
                table,
                status: TargetStatus::Pending,
            })
            .collect();
        self.state = DeploymentState::InProgress;
    }

    pub fn record_success(&mut self, target: DeploymentTarget, rows_written: u64) {
        if let Some(outcome) = pending_mut(&mut self.outcomes, target) {
            outcome.status = TargetStatus::Succeeded { rows_written };
            self.tables_updated.push(outcome.table.clone());
        }
    }

    pub fn record_failure(&mut self, target: DeploymentTarget, error: impl fmt::Display) {
        if let Some(outcome) = pending_mut(&mut self.outcomes, target) {
            let error = error.to_string();
            self.errors.push(format!("{}: {}", outcome.table, error));
            outcome.status = TargetStatus::Failed { error };
        }
    }

    /// Close the deployment. Success holds only if every attempted target succeeded.
    pub fn complete(&mut self) {
        self.success = self
            .outcomes
            .iter()
            .all(|outcome| matches!(outcome.status, TargetStatus::Succeeded { .. }));
        self.state = DeploymentState::Completed;
    }

    /// Targets that did not succeed, to build a follow-up plan with [`DeploymentPlan::only`].
    pub fn failed_targets(&self) -> Vec<DeploymentTarget> {
        self.outcomes
            .iter()
            .filter(|outcome| !matches!(outcome.status, TargetStatus::Succeeded { .. }))
            .map(|outcome| outcome.target)
            .collect()
    }
}

fn pending_mut(
    outcomes: &mut [TargetOutcome],
    target: DeploymentTarget,
) -> Option<&mut TargetOutcome> {
    outcomes
        .iter_mut()
        .find(|outcome| outcome.target == target && outcome.status == TargetStatus::Pending)
}
