//! Wire payload for the event collector endpoint.
//!
//! Serialization names follow the collector's JSON contract exactly; these
//! structs exist to separate SDK-internal events from the API used to
//! record them.
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EventBatch {
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    pub client_name: String,
    pub client_version: String,
    pub anonymize_ip: bool,
    pub enrich_decisions: bool,
    pub visitors: Vec<Visitor>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Visitor {
    pub visitor_id: String,
    pub attributes: Vec<VisitorAttribute>,
    pub snapshots: Vec<Snapshot>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VisitorAttribute {
    pub entity_id: String,
    pub key: String,
    #[serde(rename = "type")]
    pub attribute_type: String,
    /// Kept typed: string, boolean, or finite number.
    pub value: serde_json::Value,
}

impl VisitorAttribute {
    pub fn custom(
        entity_id: impl Into<String>,
        key: impl Into<String>,
        value: serde_json::Value,
    ) -> VisitorAttribute {
        VisitorAttribute {
            entity_id: entity_id.into(),
            key: key.into(),
            attribute_type: "custom".to_owned(),
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub decisions: Vec<DecisionPayload>,
    pub events: Vec<SnapshotEvent>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionPayload {
    pub campaign_id: Option<String>,
    pub experiment_id: Option<String>,
    pub variation_id: Option<String>,
    pub metadata: DecisionMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionMetadata {
    pub flag_key: String,
    pub rule_key: String,
    pub rule_type: String,
    pub variation_key: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotEvent {
    pub entity_id: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub uuid: String,
    pub key: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub revenue: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<serde_json::Map<String, serde_json::Value>>,
}
