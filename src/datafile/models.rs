//! Raw datafile entities as they appear on the wire.
//!
//! These structs mirror the datafile JSON. Unknown fields are tolerated so
//! newer datafiles keep parsing on older SDKs; collections that may be
//! absent default to empty.
use std::collections::HashMap;

use serde::Deserialize;

use crate::conditions::{ConditionTree, LeafCondition};

/// Datafile versions this SDK understands.
pub const SUPPORTED_VERSIONS: [&str; 3] = ["2", "3", "4"];

/// Error produced while parsing or indexing a datafile.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum DatafileError {
    /// The datafile `version` is absent or not one of [`SUPPORTED_VERSIONS`].
    #[error("unsupported datafile version {found:?}, supported versions: 2, 3, 4")]
    UnsupportedVersion { found: Option<String> },

    /// The datafile text is not valid JSON for the expected shape.
    #[error("malformed datafile: {0}")]
    Parse(String),

    /// An audience or rule carries a condition tree that cannot be parsed.
    #[error("malformed conditions in {owner}: {source}")]
    MalformedConditions {
        owner: String,
        source: crate::conditions::ConditionParseError,
    },
}

/// The top-level datafile document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Datafile {
    #[serde(default)]
    pub version: Option<String>,
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    #[serde(rename = "anonymizeIP", default)]
    pub anonymize_ip: bool,
    #[serde(default)]
    pub bot_filtering: Option<bool>,
    #[serde(default)]
    pub send_flag_decisions: bool,
    #[serde(default)]
    pub sdk_key: Option<String>,
    #[serde(default)]
    pub environment_key: Option<String>,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    #[serde(default)]
    pub audiences: Vec<RawAudience>,
    /// Takes precedence over `audiences` entries with the same id.
    #[serde(default)]
    pub typed_audiences: Vec<RawAudience>,
    #[serde(default)]
    pub events: Vec<EventDefinition>,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub feature_flags: Vec<FeatureFlag>,
    #[serde(default)]
    pub rollouts: Vec<Rollout>,
    #[serde(default)]
    pub holdouts: Vec<Holdout>,
}

impl Datafile {
    /// Parse datafile text, rejecting unsupported versions.
    pub fn parse(text: &str) -> Result<Datafile, DatafileError> {
        let datafile: Datafile =
            serde_json::from_str(text).map_err(|err| DatafileError::Parse(err.to_string()))?;
        match &datafile.version {
            Some(version) if SUPPORTED_VERSIONS.contains(&version.as_str()) => Ok(datafile),
            found => Err(DatafileError::UnsupportedVersion {
                found: found.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attribute {
    pub id: String,
    pub key: String,
}

/// An audience before its condition tree has been parsed.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawAudience {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub conditions: serde_json::Value,
}

/// An audience with its parsed condition tree, as held by the indexed
/// configuration.
#[derive(Debug, Clone)]
pub struct Audience {
    pub id: String,
    pub name: String,
    pub conditions: ConditionTree<LeafCondition>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDefinition {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub experiment_ids: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum ExperimentStatus {
    Running,
    NotStarted,
    Paused,
    Archived,
    Launched,
    /// Any status this SDK does not recognize. Treated as not running.
    Unknown,
}

impl From<String> for ExperimentStatus {
    fn from(status: String) -> Self {
        match status.as_str() {
            "Running" => ExperimentStatus::Running,
            "Not started" => ExperimentStatus::NotStarted,
            "Paused" => ExperimentStatus::Paused,
            "Archived" => ExperimentStatus::Archived,
            "Launched" => ExperimentStatus::Launched,
            _ => ExperimentStatus::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum GroupPolicy {
    /// Members are mutually exclusive: a user is first bucketed to at most
    /// one experiment via the group-level traffic allocation.
    Random,
    Overlapping,
    Unknown,
}

impl From<String> for GroupPolicy {
    fn from(policy: String) -> Self {
        match policy.as_str() {
            "random" => GroupPolicy::Random,
            "overlapping" => GroupPolicy::Overlapping,
            _ => GroupPolicy::Unknown,
        }
    }
}

/// One entry of a traffic allocation table. Entries are sorted ascending by
/// `end_of_range`; an absent or empty entity id is an empty slot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficAllocation {
    #[serde(default)]
    pub entity_id: Option<String>,
    pub end_of_range: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VariableUsage {
    pub id: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variation {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub feature_enabled: bool,
    /// Per-variation variable overrides, applied only when the variation has
    /// `feature_enabled`.
    #[serde(default)]
    pub variables: Vec<VariableUsage>,
}

/// CMAB marker on an experiment: bucketing is replaced by a call to the
/// contextual-bandit decision service, gated by its own traffic allocation.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CmabConfig {
    #[serde(default)]
    pub attribute_ids: Vec<String>,
    pub traffic_allocation: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub key: String,
    pub status: ExperimentStatus,
    #[serde(default)]
    pub layer_id: String,
    #[serde(default)]
    pub audience_ids: Vec<String>,
    /// When present, overrides the legacy `audience_ids` list semantics.
    #[serde(default)]
    pub audience_conditions: Option<serde_json::Value>,
    #[serde(default)]
    pub variations: Vec<Variation>,
    /// Whitelist: user id to variation key.
    #[serde(default)]
    pub forced_variations: HashMap<String, String>,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
    #[serde(default)]
    pub cmab: Option<CmabConfig>,
    // Filled while indexing for experiments that live inside a group.
    #[serde(skip)]
    pub group_id: Option<String>,
    #[serde(skip)]
    pub group_policy: Option<GroupPolicy>,
    // Audience gate resolved at index time: the parsed `audience_conditions`
    // tree, or an implicit `or` over `audience_ids`. `None` means everyone.
    #[serde(skip)]
    pub(crate) audience_gate: Option<ConditionTree<String>>,
}

impl Experiment {
    pub fn is_running(&self) -> bool {
        self.status == ExperimentStatus::Running
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    pub policy: GroupPolicy,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
    #[serde(default)]
    pub traffic_allocation: Vec<TrafficAllocation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(from = "String")]
pub enum VariableType {
    String,
    Integer,
    Double,
    Boolean,
    Json,
    Unknown,
}

impl From<String> for VariableType {
    fn from(variable_type: String) -> Self {
        match variable_type.as_str() {
            "string" => VariableType::String,
            "integer" => VariableType::Integer,
            "double" => VariableType::Double,
            "boolean" => VariableType::Boolean,
            "json" => VariableType::Json,
            _ => VariableType::Unknown,
        }
    }
}

impl VariableType {
    pub fn as_str(&self) -> &'static str {
        match self {
            VariableType::String => "string",
            VariableType::Integer => "integer",
            VariableType::Double => "double",
            VariableType::Boolean => "boolean",
            VariableType::Json => "json",
            VariableType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub variable_type: VariableType,
    /// Older datafiles ship JSON variables as type "string" with subType
    /// "json"; indexing folds this into [`VariableType::Json`].
    #[serde(default)]
    pub sub_type: Option<String>,
    pub default_value: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub id: String,
    pub key: String,
    #[serde(default)]
    pub rollout_id: String,
    /// Feature tests attached to this flag, in priority order.
    #[serde(default)]
    pub experiment_ids: Vec<String>,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

/// A rollout: an ordered list of gated single-variation rules, terminated by
/// an "everyone else" rule. Each rule is an experiment structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    pub id: String,
    #[serde(default)]
    pub experiments: Vec<Experiment>,
}

/// A holdout: a population set aside from all feature-test traffic,
/// evaluated before feature tests for the flags it covers.
///
/// Structurally a holdout is an experiment with flag-coverage lists; an
/// empty `included_flags` means the holdout is global (it covers every flag
/// not in `excluded_flags`).
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holdout {
    #[serde(flatten)]
    pub experiment: Experiment,
    #[serde(default)]
    pub included_flags: Vec<String>,
    #[serde(default)]
    pub excluded_flags: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_missing_version() {
        let err = Datafile::parse(
            r#"{"accountId": "1", "projectId": "2", "revision": "42"}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DatafileError::UnsupportedVersion { found: None }
        ));
    }

    #[test]
    fn rejects_unsupported_version() {
        let err = Datafile::parse(
            r#"{"version": "5", "accountId": "1", "projectId": "2", "revision": "42"}"#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DatafileError::UnsupportedVersion { found: Some(v) } if v == "5"
        ));
    }

    #[test]
    fn rejects_malformed_json() {
        let err = Datafile::parse("{not json").unwrap_err();
        assert!(matches!(err, DatafileError::Parse(_)));
    }

    #[test]
    fn parses_minimal_datafile_with_unknown_fields() {
        let datafile = Datafile::parse(
            r#"{
                "version": "4",
                "accountId": "1",
                "projectId": "2",
                "revision": "42",
                "anonymizeIP": true,
                "botFiltering": false,
                "sendFlagDecisions": true,
                "someFutureField": {"nested": []}
            }"#,
        )
        .unwrap();
        assert!(datafile.anonymize_ip);
        assert_eq!(datafile.bot_filtering, Some(false));
        assert!(datafile.send_flag_decisions);
        assert!(datafile.experiments.is_empty());
    }

    #[test]
    fn unknown_experiment_status_is_not_running() {
        let status = ExperimentStatus::from("Brand New Status".to_owned());
        assert_eq!(status, ExperimentStatus::Unknown);
    }
}
