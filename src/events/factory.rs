//! Factories turning decisions and conversions into user events, and user
//! events into the wire payload.
use crate::attributes::{AttributeValue, Attributes, BOT_FILTERING_ATTRIBUTE};
use crate::datafile::{Experiment, ProjectConfig, Variation};

use super::payload::{
    DecisionMetadata, DecisionPayload, EventBatch, Snapshot, SnapshotEvent, Visitor,
    VisitorAttribute,
};
use super::{
    ConversionEvent, EventContext, ImpressionEvent, LogEvent, UserEvent, CLIENT_NAME,
    CLIENT_VERSION, EVENTS_URL,
};

const ACTIVATE_EVENT_KEY: &str = "campaign_activated";
const REVENUE_METRIC: &str = "revenue";
const VALUE_METRIC: &str = "value";

/// Builds impression and conversion [`UserEvent`]s from decision outcomes.
pub struct UserEventFactory;

impl UserEventFactory {
    /// Create an impression event for a decision.
    ///
    /// Decisions without a backing rule produce an impression only for
    /// rollout sources (where the datafile's send-flag-decisions toggle
    /// asked for them).
    #[allow(clippy::too_many_arguments)]
    pub fn create_impression_event(
        config: &ProjectConfig,
        experiment: Option<&Experiment>,
        variation: Option<&Variation>,
        flag_key: &str,
        rule_type: &str,
        enabled: bool,
        user_id: &str,
        attributes: &Attributes,
    ) -> Option<UserEvent> {
        if experiment.is_none() && rule_type != "rollout" {
            return None;
        }

        Some(UserEvent::Impression(ImpressionEvent {
            context: EventContext::new(config),
            user_id: user_id.to_owned(),
            uuid: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            attributes: build_attribute_list(config, attributes),
            campaign_id: experiment
                .map(|e| e.layer_id.clone())
                .filter(|layer_id| !layer_id.is_empty()),
            experiment_id: experiment.map(|e| e.id.clone()),
            variation_id: variation.map(|v| v.id.clone()),
            variation_key: variation.map(|v| v.key.clone()),
            flag_key: flag_key.to_owned(),
            rule_key: experiment.map(|e| e.key.clone()),
            rule_type: rule_type.to_owned(),
            enabled,
        }))
    }

    /// Create a conversion event for a tracked event key. Unknown event
    /// keys produce nothing.
    pub fn create_conversion_event(
        config: &ProjectConfig,
        event_key: &str,
        user_id: &str,
        attributes: &Attributes,
        tags: serde_json::Map<String, serde_json::Value>,
    ) -> Option<UserEvent> {
        let event = config.event(event_key)?;

        Some(UserEvent::Conversion(ConversionEvent {
            context: EventContext::new(config),
            user_id: user_id.to_owned(),
            uuid: uuid::Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            attributes: build_attribute_list(config, attributes),
            event_id: event.id.clone(),
            event_key: event.key.clone(),
            tags,
        }))
    }
}

/// Renders batched user events into the collector's wire payload.
pub struct EventFactory;

impl EventFactory {
    pub fn create_log_event(user_events: Vec<UserEvent>) -> Option<LogEvent> {
        let context = user_events.first()?.context().clone();
        let visitors = user_events.into_iter().map(create_visitor).collect();

        Some(LogEvent {
            url: EVENTS_URL.to_owned(),
            params: EventBatch {
                account_id: context.account_id,
                project_id: context.project_id,
                revision: context.revision,
                client_name: CLIENT_NAME.to_owned(),
                client_version: CLIENT_VERSION.to_owned(),
                anonymize_ip: context.anonymize_ip,
                enrich_decisions: true,
                visitors,
            },
        })
    }
}

fn create_visitor(user_event: UserEvent) -> Visitor {
    match user_event {
        UserEvent::Impression(event) => {
            let decision = DecisionPayload {
                campaign_id: event.campaign_id.clone(),
                experiment_id: event.experiment_id,
                variation_id: event.variation_id,
                metadata: DecisionMetadata {
                    flag_key: event.flag_key,
                    rule_key: event.rule_key.unwrap_or_default(),
                    rule_type: event.rule_type,
                    variation_key: event.variation_key.unwrap_or_default(),
                    enabled: event.enabled,
                },
            };
            let snapshot_event = SnapshotEvent {
                entity_id: event.campaign_id,
                timestamp: event.timestamp,
                uuid: event.uuid,
                key: ACTIVATE_EVENT_KEY.to_owned(),
                event_type: ACTIVATE_EVENT_KEY.to_owned(),
                revenue: None,
                value: None,
                tags: None,
            };
            Visitor {
                visitor_id: event.user_id,
                attributes: event.attributes,
                snapshots: vec![Snapshot {
                    decisions: vec![decision],
                    events: vec![snapshot_event],
                }],
            }
        }
        UserEvent::Conversion(event) => {
            let snapshot_event = SnapshotEvent {
                entity_id: Some(event.event_id),
                timestamp: event.timestamp,
                uuid: event.uuid,
                key: event.event_key.clone(),
                event_type: event.event_key,
                revenue: revenue_value(&event.tags),
                value: numeric_value(&event.tags),
                tags: (!event.tags.is_empty()).then_some(event.tags),
            };
            Visitor {
                visitor_id: event.user_id,
                attributes: event.attributes,
                snapshots: vec![Snapshot {
                    decisions: vec![],
                    events: vec![snapshot_event],
                }],
            }
        }
    }
}

/// Encode user attributes for the collector, keeping values typed.
///
/// Attributes unknown to the datafile are still forwarded, with the key
/// standing in for the entity id. Attribute order is made deterministic by
/// sorting on key. The synthetic bot-filtering attribute is appended when
/// the datafile carries the flag.
pub(crate) fn build_attribute_list(
    config: &ProjectConfig,
    attributes: &Attributes,
) -> Vec<VisitorAttribute> {
    let mut keys: Vec<&String> = attributes.keys().collect();
    keys.sort();

    let mut encoded = Vec::with_capacity(keys.len() + 1);
    for key in keys {
        let value = &attributes[key];
        if !is_attribute_value_valid(value) {
            log::warn!(target: "splitstream",
                "attribute \"{key}\" has a value not supported by the event endpoint, omitting");
            continue;
        }
        let entity_id = config
            .attribute(key)
            .map(|attribute| attribute.id.clone())
            .unwrap_or_else(|| key.clone());
        encoded.push(VisitorAttribute::custom(entity_id, key.clone(), value.to_json()));
    }

    if let Some(bot_filtering) = config.bot_filtering {
        encoded.push(VisitorAttribute::custom(
            BOT_FILTERING_ATTRIBUTE,
            BOT_FILTERING_ATTRIBUTE,
            serde_json::Value::Bool(bot_filtering),
        ));
    }
    encoded
}

fn is_attribute_value_valid(value: &AttributeValue) -> bool {
    match value {
        AttributeValue::String(_) | AttributeValue::Boolean(_) => true,
        AttributeValue::Number(n) => n.is_finite(),
        AttributeValue::Null => false,
    }
}

/// Top-level `revenue` tag, forwarded when it is an integer.
fn revenue_value(tags: &serde_json::Map<String, serde_json::Value>) -> Option<i64> {
    tags.get(REVENUE_METRIC)?.as_i64()
}

/// Top-level `value` tag, forwarded when it is a finite number.
fn numeric_value(tags: &serde_json::Map<String, serde_json::Value>) -> Option<f64> {
    tags.get(VALUE_METRIC)?.as_f64().filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::datafile::ProjectConfig;
    use crate::Attributes;

    use super::*;

    const DATAFILE: &str = r#"{
        "version": "4",
        "accountId": "acc",
        "projectId": "proj",
        "revision": "9",
        "botFiltering": true,
        "attributes": [{"id": "attr-1", "key": "age"}],
        "events": [{"id": "ev-1", "key": "purchase", "experimentIds": []}],
        "experiments": [
            {"id": "e1", "key": "exp_1", "status": "Running", "layerId": "layer-1",
             "audienceIds": [],
             "variations": [{"id": "v1", "key": "a", "featureEnabled": true}],
             "trafficAllocation": [{"entityId": "v1", "endOfRange": 10000}]}
        ]
    }"#;

    fn config() -> ProjectConfig {
        ProjectConfig::parse(DATAFILE).unwrap()
    }

    #[test]
    fn impression_payload_shape() {
        let config = config();
        let experiment = config.experiment_by_key("exp_1").unwrap().clone();
        let variation = config.variation_by_id("e1", "v1").unwrap().clone();
        let attributes = Attributes::from([
            ("age".to_owned(), 29.0.into()),
            ("unknown_attr".to_owned(), "forwarded".into()),
        ]);

        let event = UserEventFactory::create_impression_event(
            &config,
            Some(&*experiment),
            Some(&*variation),
            "feature_1",
            "feature-test",
            true,
            "u1",
            &attributes,
        )
        .unwrap();
        let log_event = EventFactory::create_log_event(vec![event]).unwrap();

        assert_eq!(log_event.url, EVENTS_URL);
        let batch = &log_event.params;
        assert_eq!(batch.account_id, "acc");
        assert_eq!(batch.revision, "9");
        assert!(batch.enrich_decisions);
        assert_eq!(batch.client_name, CLIENT_NAME);

        let visitor = &batch.visitors[0];
        assert_eq!(visitor.visitor_id, "u1");
        // sorted attributes, unknown key forwarded, bot filtering appended
        assert_eq!(visitor.attributes[0].entity_id, "attr-1");
        assert_eq!(visitor.attributes[1].key, "unknown_attr");
        assert_eq!(visitor.attributes[1].entity_id, "unknown_attr");
        assert_eq!(visitor.attributes[2].key, "$opt_bot_filtering");
        assert_eq!(visitor.attributes[2].value, json!(true));

        let snapshot = &visitor.snapshots[0];
        let decision = &snapshot.decisions[0];
        assert_eq!(decision.campaign_id.as_deref(), Some("layer-1"));
        assert_eq!(decision.experiment_id.as_deref(), Some("e1"));
        assert_eq!(decision.variation_id.as_deref(), Some("v1"));
        assert_eq!(decision.metadata.flag_key, "feature_1");
        assert_eq!(decision.metadata.rule_type, "feature-test");
        assert!(decision.metadata.enabled);

        let snapshot_event = &snapshot.events[0];
        assert_eq!(snapshot_event.key, "campaign_activated");
        assert_eq!(snapshot_event.entity_id.as_deref(), Some("layer-1"));
        assert!(snapshot_event.timestamp > 0);
        // uuid v4 shape: 8-4-4-4-12 hex
        assert_eq!(snapshot_event.uuid.len(), 36);
        assert_eq!(snapshot_event.uuid.matches('-').count(), 4);
    }

    #[test]
    fn impression_without_rule_is_only_built_for_rollouts() {
        let config = config();
        assert!(UserEventFactory::create_impression_event(
            &config,
            None,
            None,
            "feature_1",
            "feature-test",
            false,
            "u1",
            &Attributes::new(),
        )
        .is_none());

        assert!(UserEventFactory::create_impression_event(
            &config,
            None,
            None,
            "feature_1",
            "rollout",
            false,
            "u1",
            &Attributes::new(),
        )
        .is_some());
    }

    #[test]
    fn conversion_payload_carries_typed_metrics() {
        let config = config();
        let tags = serde_json::json!({
            "revenue": 1200,
            "value": 3.5,
            "category": "shoes"
        });
        let serde_json::Value::Object(tags) = tags else {
            unreachable!()
        };

        let event = UserEventFactory::create_conversion_event(
            &config,
            "purchase",
            "u1",
            &Attributes::new(),
            tags,
        )
        .unwrap();
        let log_event = EventFactory::create_log_event(vec![event]).unwrap();

        let snapshot_event = &log_event.params.visitors[0].snapshots[0].events[0];
        assert_eq!(snapshot_event.entity_id.as_deref(), Some("ev-1"));
        assert_eq!(snapshot_event.key, "purchase");
        assert_eq!(snapshot_event.event_type, "purchase");
        assert_eq!(snapshot_event.revenue, Some(1200));
        assert_eq!(snapshot_event.value, Some(3.5));
        assert_eq!(
            snapshot_event.tags.as_ref().unwrap()["category"],
            json!("shoes")
        );
    }

    #[test]
    fn non_integral_revenue_is_not_promoted() {
        let config = config();
        let serde_json::Value::Object(tags) = serde_json::json!({"revenue": "1200"}) else {
            unreachable!()
        };
        let event = UserEventFactory::create_conversion_event(
            &config,
            "purchase",
            "u1",
            &Attributes::new(),
            tags,
        )
        .unwrap();
        let log_event = EventFactory::create_log_event(vec![event]).unwrap();
        let snapshot_event = &log_event.params.visitors[0].snapshots[0].events[0];
        assert_eq!(snapshot_event.revenue, None);
    }

    #[test]
    fn unknown_event_key_builds_nothing() {
        let config = config();
        assert!(UserEventFactory::create_conversion_event(
            &config,
            "nope",
            "u1",
            &Attributes::new(),
            serde_json::Map::new(),
        )
        .is_none());
    }
}
