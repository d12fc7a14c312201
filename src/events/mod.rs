//! User events and the pipeline that turns them into wire payloads.
//!
//! Decisions and conversions become [`UserEvent`]s, which the batch
//! processor accumulates and the event factory renders into the wire
//! payload handed to the dispatcher.
mod dispatcher;
mod factory;
mod payload;
mod processor;

pub use dispatcher::{
    DispatchError, EventDispatcher, HttpEventDispatcher, LogEvent, EVENTS_URL,
};
pub use factory::{EventFactory, UserEventFactory};
pub use payload::{
    DecisionMetadata, DecisionPayload, EventBatch, Snapshot, SnapshotEvent, Visitor,
    VisitorAttribute,
};
pub use processor::{
    BatchEventProcessor, BatchEventProcessorConfig, EventProcessor, ForwardingEventProcessor,
};

use crate::datafile::ProjectConfig;

/// Client identifier stamped on every payload.
pub const CLIENT_NAME: &str = "rust-sdk";
/// Client version stamped on every payload.
pub const CLIENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The datafile-derived header shared by every event of one batch.
///
/// Events with differing contexts never share a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventContext {
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    pub anonymize_ip: bool,
}

impl EventContext {
    pub fn new(config: &ProjectConfig) -> EventContext {
        EventContext {
            account_id: config.account_id.clone(),
            project_id: config.project_id.clone(),
            revision: config.revision.clone(),
            anonymize_ip: config.anonymize_ip,
        }
    }
}

/// An event recording one decision shown to a user.
#[derive(Debug, Clone)]
pub struct ImpressionEvent {
    pub context: EventContext,
    pub user_id: String,
    pub uuid: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub attributes: Vec<VisitorAttribute>,
    /// Layer id of the activated experiment, when any.
    pub campaign_id: Option<String>,
    pub experiment_id: Option<String>,
    pub variation_id: Option<String>,
    pub variation_key: Option<String>,
    pub flag_key: String,
    pub rule_key: Option<String>,
    pub rule_type: String,
    pub enabled: bool,
}

/// An event recording a tracked conversion.
#[derive(Debug, Clone)]
pub struct ConversionEvent {
    pub context: EventContext,
    pub user_id: String,
    pub uuid: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
    pub attributes: Vec<VisitorAttribute>,
    pub event_id: String,
    pub event_key: String,
    pub tags: serde_json::Map<String, serde_json::Value>,
}

/// Either kind of user event, as accepted by the event processor.
#[derive(Debug, Clone)]
pub enum UserEvent {
    Impression(ImpressionEvent),
    Conversion(ConversionEvent),
}

impl UserEvent {
    pub fn context(&self) -> &EventContext {
        match self {
            UserEvent::Impression(event) => &event.context,
            UserEvent::Conversion(event) => &event.context,
        }
    }

    pub fn uuid(&self) -> &str {
        match self {
            UserEvent::Impression(event) => &event.uuid,
            UserEvent::Conversion(event) => &event.uuid,
        }
    }
}
