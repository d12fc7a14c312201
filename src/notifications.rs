//! Typed notification topics.
//!
//! Rather than one untyped listener signature, each topic has a dedicated
//! payload struct and its own registration method, so listeners are checked
//! at compile time.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::events::LogEvent;
use crate::Attributes;

/// Payload for the decision topic.
#[derive(Debug, Clone)]
pub struct DecisionNotification {
    /// What kind of decision was taken: "flag", "ab-test", "feature",
    /// "feature-variable", or "all-feature-variables".
    pub decision_type: &'static str,
    pub user_id: String,
    pub attributes: Attributes,
    pub info: DecisionInfo,
}

/// Decision details, shaped per decision type.
#[derive(Debug, Clone)]
pub enum DecisionInfo {
    /// A `decide` call on a user context.
    Flag {
        flag_key: String,
        enabled: bool,
        variation_key: Option<String>,
        rule_key: Option<String>,
        reasons: Vec<String>,
        decision_event_dispatched: bool,
    },
    /// A direct experiment activation or variation lookup.
    ExperimentVariation {
        experiment_key: String,
        variation_key: Option<String>,
    },
    /// An `is_feature_enabled` call.
    Feature {
        flag_key: String,
        enabled: bool,
        source: &'static str,
        source_experiment_key: Option<String>,
        source_variation_key: Option<String>,
    },
    /// A typed variable getter.
    FeatureVariable {
        flag_key: String,
        variable_key: String,
        variable_type: &'static str,
        variable_value: serde_json::Value,
        enabled: bool,
    },
    /// A `get_all_feature_variables` call.
    AllFeatureVariables {
        flag_key: String,
        enabled: bool,
        variable_values: serde_json::Map<String, serde_json::Value>,
    },
}

/// Payload for the track topic.
#[derive(Debug, Clone)]
pub struct TrackNotification {
    pub event_key: String,
    pub user_id: String,
    pub attributes: Attributes,
    pub event_tags: serde_json::Map<String, serde_json::Value>,
}

/// Payload for the log-event topic, sent right before a batch is handed to
/// the dispatcher.
#[derive(Debug, Clone)]
pub struct LogEventNotification {
    pub url: String,
    pub payload: serde_json::Value,
}

/// Payload for the configuration-update topic.
#[derive(Debug, Clone)]
pub struct ConfigUpdateNotification {
    pub revision: String,
}

type Listener<T> = Box<dyn Fn(&T) + Send + Sync>;

struct Topic<T> {
    listeners: Mutex<Vec<(u64, Listener<T>)>>,
}

impl<T> Topic<T> {
    fn new() -> Topic<T> {
        Topic {
            listeners: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, id: u64, listener: Listener<T>) {
        self.lock().push((id, listener));
    }

    fn remove(&self, id: u64) -> bool {
        let mut listeners = self.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    fn notify(&self, payload: &T) {
        for (_, listener) in self.lock().iter() {
            listener(payload);
        }
    }

    fn clear(&self) {
        self.lock().clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(u64, Listener<T>)>> {
        // Err() is possible only if a listener panicked while being
        // registered or notified, which we treat as a bug in the host app.
        self.listeners
            .lock()
            .expect("thread holding listener lock should not panic")
    }
}

/// Registry of typed notification listeners.
///
/// Listener callbacks run synchronously on the thread that produced the
/// notification (the decision caller, or the event processor thread for
/// log events); keep them fast.
pub struct NotificationCenter {
    next_id: AtomicU64,
    decision: Topic<DecisionNotification>,
    track: Topic<TrackNotification>,
    log_event: Topic<LogEventNotification>,
    config_update: Topic<ConfigUpdateNotification>,
}

impl NotificationCenter {
    pub fn new() -> NotificationCenter {
        NotificationCenter {
            next_id: AtomicU64::new(1),
            decision: Topic::new(),
            track: Topic::new(),
            log_event: Topic::new(),
            config_update: Topic::new(),
        }
    }

    pub fn add_decision_listener(
        &self,
        listener: impl Fn(&DecisionNotification) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_listener_id();
        self.decision.add(id, Box::new(listener));
        id
    }

    pub fn add_track_listener(
        &self,
        listener: impl Fn(&TrackNotification) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_listener_id();
        self.track.add(id, Box::new(listener));
        id
    }

    pub fn add_log_event_listener(
        &self,
        listener: impl Fn(&LogEventNotification) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_listener_id();
        self.log_event.add(id, Box::new(listener));
        id
    }

    pub fn add_config_update_listener(
        &self,
        listener: impl Fn(&ConfigUpdateNotification) + Send + Sync + 'static,
    ) -> u64 {
        let id = self.next_listener_id();
        self.config_update.add(id, Box::new(listener));
        id
    }

    /// Remove a listener by the id returned at registration, whatever its
    /// topic. Returns whether anything was removed.
    pub fn remove_listener(&self, id: u64) -> bool {
        self.decision.remove(id)
            || self.track.remove(id)
            || self.log_event.remove(id)
            || self.config_update.remove(id)
    }

    pub fn clear_all_listeners(&self) {
        self.decision.clear();
        self.track.clear();
        self.log_event.clear();
        self.config_update.clear();
    }

    pub(crate) fn send_decision(&self, notification: &DecisionNotification) {
        self.decision.notify(notification);
    }

    pub(crate) fn send_track(&self, notification: &TrackNotification) {
        self.track.notify(notification);
    }

    pub(crate) fn send_log_event(&self, log_event: &LogEvent) {
        let payload = serde_json::to_value(&log_event.params).unwrap_or(serde_json::Value::Null);
        self.log_event.notify(&LogEventNotification {
            url: log_event.url.clone(),
            payload,
        });
    }

    pub(crate) fn send_config_update(&self, notification: &ConfigUpdateNotification) {
        self.config_update.notify(notification);
    }

    fn next_listener_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for NotificationCenter {
    fn default() -> NotificationCenter {
        NotificationCenter::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn listeners_receive_their_topic_only() {
        let center = NotificationCenter::new();
        let decisions = Arc::new(AtomicUsize::new(0));
        let tracks = Arc::new(AtomicUsize::new(0));

        {
            let decisions = decisions.clone();
            center.add_decision_listener(move |_| {
                decisions.fetch_add(1, Ordering::SeqCst);
            });
        }
        {
            let tracks = tracks.clone();
            center.add_track_listener(move |_| {
                tracks.fetch_add(1, Ordering::SeqCst);
            });
        }

        center.send_track(&TrackNotification {
            event_key: "purchase".to_owned(),
            user_id: "u1".to_owned(),
            attributes: Attributes::new(),
            event_tags: serde_json::Map::new(),
        });

        assert_eq!(decisions.load(Ordering::SeqCst), 0);
        assert_eq!(tracks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn removed_listeners_stop_firing() {
        let center = NotificationCenter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let id = {
            let count = count.clone();
            center.add_config_update_listener(move |_| {
                count.fetch_add(1, Ordering::SeqCst);
            })
        };

        let notification = ConfigUpdateNotification {
            revision: "7".to_owned(),
        };
        center.send_config_update(&notification);
        assert!(center.remove_listener(id));
        assert!(!center.remove_listener(id));
        center.send_config_update(&notification);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
