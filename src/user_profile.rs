//! Sticky-bucketing user profiles and the storage seam they are persisted
//! through.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// A stored decision for one experiment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct ExperimentBucket {
    #[serde(default)]
    pub variation_id: Option<String>,
}

/// A user's persisted profile: which variation they saw per experiment.
///
/// An absent entry means no sticky decision; the decision service falls
/// through to audience evaluation and bucketing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    #[serde(default)]
    pub experiment_bucket_map: HashMap<String, ExperimentBucket>,
}

impl UserProfile {
    pub fn new(user_id: impl Into<String>) -> UserProfile {
        UserProfile {
            user_id: user_id.into(),
            experiment_bucket_map: HashMap::new(),
        }
    }

    pub fn variation_for_experiment(&self, experiment_id: &str) -> Option<&str> {
        self.experiment_bucket_map
            .get(experiment_id)?
            .variation_id
            .as_deref()
    }

    pub fn save_variation_for_experiment(
        &mut self,
        experiment_id: impl Into<String>,
        variation_id: impl Into<String>,
    ) {
        self.experiment_bucket_map.insert(
            experiment_id.into(),
            ExperimentBucket {
                variation_id: Some(variation_id.into()),
            },
        );
    }
}

/// Error raised by a user-profile service implementation.
///
/// Lookup failures degrade to "no profile"; save failures are swallowed
/// after logging. Neither aborts the decision.
#[derive(thiserror::Error, Debug, Clone)]
#[error("{0}")]
pub struct UserProfileError(pub String);

/// Storage seam for sticky bucketing. Implementations are expected to be
/// safe for concurrent use across distinct user ids.
pub trait UserProfileService: Send + Sync {
    fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>, UserProfileError>;
    fn save(&self, profile: &UserProfile) -> Result<(), UserProfileError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_round_trip() {
        let mut profile = UserProfile::new("u1");
        assert_eq!(profile.variation_for_experiment("exp"), None);

        profile.save_variation_for_experiment("exp", "var");
        assert_eq!(profile.variation_for_experiment("exp"), Some("var"));
    }

    #[test]
    fn profile_wire_shape() {
        let json = r#"{
            "user_id": "u1",
            "experiment_bucket_map": {"111": {"variation_id": "222"}}
        }"#;
        let profile: UserProfile = serde_json::from_str(json).unwrap();
        assert_eq!(profile.variation_for_experiment("111"), Some("222"));
    }
}
