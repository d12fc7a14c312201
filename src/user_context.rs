//! Mutable per-user state and the `decide` surface bound to it.
use std::collections::HashMap;
use std::sync::Mutex;

use crate::attributes::{AttributeValue, Attributes};
use crate::client::Client;
use crate::decision::{DecideOption, Decision, ForcedDecisionKey, UserSnapshot};
use crate::segments::SegmentEvent;

#[derive(Debug, Clone, Default)]
struct UserContextState {
    attributes: Attributes,
    qualified_segments: Vec<String>,
    forced_decisions: HashMap<ForcedDecisionKey, String>,
}

/// A mutable holder of one user's state: attributes, qualified segments,
/// and forced decisions.
///
/// Contexts are independent: no state is shared between contexts, even for
/// the same user id. Each `decide` call takes an immutable snapshot of the
/// context, so concurrent mutation never tears a decision.
pub struct UserContext {
    client: Client,
    user_id: String,
    state: Mutex<UserContextState>,
}

impl UserContext {
    pub(crate) fn new(client: Client, user_id: String, attributes: Attributes) -> UserContext {
        UserContext {
            client,
            user_id,
            state: Mutex::new(UserContextState {
                attributes,
                ..UserContextState::default()
            }),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn get_attributes(&self) -> Attributes {
        self.lock_state().attributes.clone()
    }

    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<AttributeValue>) {
        self.lock_state().attributes.insert(key.into(), value.into());
    }

    /// Decide the given flag for this user.
    pub fn decide(&self, flag_key: &str, options: &[DecideOption]) -> Decision {
        let snapshot = self.snapshot();
        self.client.decide_internal(&snapshot, flag_key, options)
    }

    /// Decide several flags at once. With `ENABLED_FLAGS_ONLY`, disabled
    /// flags are omitted from the result.
    pub fn decide_for_keys(
        &self,
        flag_keys: &[&str],
        options: &[DecideOption],
    ) -> HashMap<String, Decision> {
        let snapshot = self.snapshot();
        self.client
            .decide_for_keys_internal(&snapshot, flag_keys, options)
    }

    /// Decide every flag in the datafile.
    pub fn decide_all(&self, options: &[DecideOption]) -> HashMap<String, Decision> {
        let snapshot = self.snapshot();
        self.client.decide_all_internal(&snapshot, options)
    }

    /// Track a conversion event with this context's attributes.
    pub fn track_event(
        &self,
        event_key: &str,
        event_tags: Option<serde_json::Map<String, serde_json::Value>>,
    ) {
        let attributes = self.get_attributes();
        self.client
            .track(event_key, &self.user_id, &attributes, event_tags);
    }

    /// Force a variation for a flag, optionally narrowed to one rule of the
    /// flag. Resolved before whitelists and bucketing.
    pub fn set_forced_decision(
        &self,
        flag_key: impl Into<String>,
        rule_key: Option<&str>,
        variation_key: impl Into<String>,
    ) -> bool {
        self.lock_state().forced_decisions.insert(
            ForcedDecisionKey {
                flag_key: flag_key.into(),
                rule_key: rule_key.map(str::to_owned),
            },
            variation_key.into(),
        );
        true
    }

    pub fn get_forced_decision(&self, flag_key: &str, rule_key: Option<&str>) -> Option<String> {
        self.lock_state()
            .forced_decisions
            .get(&ForcedDecisionKey {
                flag_key: flag_key.to_owned(),
                rule_key: rule_key.map(str::to_owned),
            })
            .cloned()
    }

    pub fn remove_forced_decision(&self, flag_key: &str, rule_key: Option<&str>) -> bool {
        self.lock_state()
            .forced_decisions
            .remove(&ForcedDecisionKey {
                flag_key: flag_key.to_owned(),
                rule_key: rule_key.map(str::to_owned),
            })
            .is_some()
    }

    pub fn remove_all_forced_decisions(&self) -> bool {
        self.lock_state().forced_decisions.clear();
        true
    }

    pub fn get_qualified_segments(&self) -> Vec<String> {
        self.lock_state().qualified_segments.clone()
    }

    pub fn set_qualified_segments(&self, segments: Vec<String>) {
        self.lock_state().qualified_segments = segments;
    }

    pub fn is_qualified_for(&self, segment: &str) -> bool {
        self.lock_state()
            .qualified_segments
            .iter()
            .any(|s| s == segment)
    }

    /// Fetch qualified segments from the configured segment source and
    /// store them on this context. Returns whether the fetch succeeded; on
    /// failure the context keeps its previous segments.
    pub fn fetch_qualified_segments(&self) -> bool {
        match self.client.fetch_qualified_segments(&self.user_id) {
            Some(segments) => {
                self.set_qualified_segments(segments);
                true
            }
            None => false,
        }
    }

    /// Forward an event to the segment platform, identifying this user.
    pub fn send_segment_event(
        &self,
        event_type: impl Into<String>,
        action: impl Into<String>,
        mut identifiers: HashMap<String, String>,
        data: serde_json::Map<String, serde_json::Value>,
    ) {
        identifiers
            .entry("fs_user_id".to_owned())
            .or_insert_with(|| self.user_id.clone());
        self.client.send_segment_event(&SegmentEvent {
            event_type: event_type.into(),
            action: action.into(),
            identifiers,
            data,
        });
    }

    pub(crate) fn snapshot(&self) -> UserSnapshot {
        let state = self.lock_state();
        UserSnapshot {
            user_id: self.user_id.clone(),
            attributes: state.attributes.clone(),
            qualified_segments: state.qualified_segments.clone(),
            forced_decisions: state.forced_decisions.clone(),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, UserContextState> {
        // Err() is possible only if a thread panicked while holding the
        // lock, which should never happen.
        self.state
            .lock()
            .expect("thread holding user context lock should not panic")
    }
}
