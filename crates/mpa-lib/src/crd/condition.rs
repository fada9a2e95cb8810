use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type names written to the MPA status
pub mod condition_types {
    pub const RECOMMENDATION_PROVIDED: &str = "RecommendationProvided";
    pub const LOW_CONFIDENCE: &str = "LowConfidence";
    pub const NO_PODS_MATCHED: &str = "NoPodsMatched";
    pub const FETCHING_HISTORY: &str = "FetchingHistory";
    pub const CONFIG_DEPRECATED: &str = "ConfigDeprecated";
    pub const CONFIG_UNSUPPORTED: &str = "ConfigUnsupported";
    pub const ABLE_TO_SCALE: &str = "AbleToScale";
    pub const SCALING_ACTIVE: &str = "ScalingActive";
    pub const SCALING_LIMITED: &str = "ScalingLimited";
}

/// Status of a condition
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

impl From<bool> for ConditionStatus {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

/// Kubernetes-style condition on the MPA status
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MpaCondition {
    #[serde(rename = "type")]
    pub type_: String,

    pub status: ConditionStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl MpaCondition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let reason = reason.into();
        let message = message.into();
        Self {
            type_: type_.into(),
            status,
            last_transition_time: Some(Utc::now()),
            reason: (!reason.is_empty()).then_some(reason),
            message: (!message.is_empty()).then_some(message),
        }
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Sets a condition in `conditions`, keeping its transition time unless the
/// status flips
pub fn set_condition(
    conditions: &mut Vec<MpaCondition>,
    type_: &str,
    status: ConditionStatus,
    reason: &str,
    message: &str,
) {
    let mut updated = MpaCondition::new(type_, status, reason, message);
    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        if existing.status == status {
            updated.last_transition_time = existing.last_transition_time;
        }
        *existing = updated;
    } else {
        conditions.push(updated);
    }
}
