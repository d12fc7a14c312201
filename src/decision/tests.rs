use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cmab::{CmabClient, CmabError, CmabService};
use crate::datafile::ProjectConfig;
use crate::user_profile::{UserProfile, UserProfileError, UserProfileService};
use crate::Attributes;

use super::*;

const DATAFILE: &str = r#"{
    "version": "4",
    "accountId": "1",
    "projectId": "2",
    "revision": "7",
    "sendFlagDecisions": true,
    "attributes": [{"id": "a-age", "key": "age"}],
    "typedAudiences": [
        {"id": "adults", "name": "adults",
         "conditions": ["and", {"name": "age", "type": "custom_attribute", "value": 18, "match": "ge"}]},
        {"id": "premium", "name": "premium users",
         "conditions": ["and", {"name": "premium", "type": "custom_attribute", "value": true, "match": "exact"}]}
    ],
    "experiments": [
        {"id": "e1", "key": "exp_1", "status": "Running", "layerId": "l1",
         "audienceIds": ["adults"],
         "variations": [
            {"id": "v-a", "key": "a", "featureEnabled": true},
            {"id": "v-b", "key": "b", "featureEnabled": false}
         ],
         "forcedVariations": {"whitelisted_user": "b"},
         "trafficAllocation": [
            {"entityId": "v-a", "endOfRange": 5000},
            {"entityId": "v-b", "endOfRange": 10000}
         ]},
        {"id": "e2", "key": "paused_exp", "status": "Paused", "layerId": "l2",
         "audienceIds": [],
         "variations": [{"id": "v-p", "key": "p", "featureEnabled": true}],
         "trafficAllocation": [{"entityId": "v-p", "endOfRange": 10000}]},
        {"id": "e3", "key": "cmab_exp", "status": "Running", "layerId": "l3",
         "audienceIds": [],
         "variations": [
            {"id": "v-c1", "key": "arm_1", "featureEnabled": true},
            {"id": "v-c2", "key": "arm_2", "featureEnabled": true}
         ],
         "trafficAllocation": [],
         "cmab": {"attributeIds": ["a-age"], "trafficAllocation": 10000}}
    ],
    "featureFlags": [
        {"id": "f1", "key": "feature_1", "rolloutId": "r1",
         "experimentIds": ["e1"],
         "variables": [{"id": "var-x", "key": "x", "type": "string", "defaultValue": "default"}]},
        {"id": "f2", "key": "cmab_feature", "rolloutId": "",
         "experimentIds": ["e3"], "variables": []},
        {"id": "f3", "key": "held_out_feature", "rolloutId": "",
         "experimentIds": [], "variables": []}
    ],
    "rollouts": [
        {"id": "r1", "experiments": [
            {"id": "rr1", "key": "premium_rule", "status": "Running", "layerId": "r1",
             "audienceIds": ["premium"],
             "variations": [{"id": "v-c", "key": "c", "featureEnabled": true}],
             "trafficAllocation": []},
            {"id": "rr2", "key": "skipped_rule", "status": "Running", "layerId": "r1",
             "audienceIds": [],
             "variations": [{"id": "v-m", "key": "m", "featureEnabled": true}],
             "trafficAllocation": [{"entityId": "v-m", "endOfRange": 10000}]},
            {"id": "rr3", "key": "everyone_else", "status": "Running", "layerId": "r1",
             "audienceIds": [],
             "variations": [{"id": "v-d", "key": "d", "featureEnabled": true}],
             "trafficAllocation": [{"entityId": "v-d", "endOfRange": 10000}]}
        ]}
    ],
    "holdouts": [
        {"id": "h1", "key": "measurement_holdout", "status": "Running", "layerId": "hl1",
         "audienceIds": [],
         "variations": [{"id": "v-h", "key": "holdout_off", "featureEnabled": false}],
         "trafficAllocation": [{"entityId": "v-h", "endOfRange": 10000}],
         "includedFlags": ["f3"], "excludedFlags": []}
    ]
}"#;

#[derive(Default)]
struct MemoryProfileService {
    profiles: Mutex<HashMap<String, UserProfile>>,
    fail_lookup: bool,
}

impl UserProfileService for MemoryProfileService {
    fn lookup(&self, user_id: &str) -> Result<Option<UserProfile>, UserProfileError> {
        if self.fail_lookup {
            return Err(UserProfileError("storage unavailable".to_owned()));
        }
        Ok(self.profiles.lock().unwrap().get(user_id).cloned())
    }

    fn save(&self, profile: &UserProfile) -> Result<(), UserProfileError> {
        self.profiles
            .lock()
            .unwrap()
            .insert(profile.user_id.clone(), profile.clone());
        Ok(())
    }
}

struct FixedCmabClient {
    variation_id: String,
}

impl CmabClient for FixedCmabClient {
    fn fetch_decision(
        &self,
        _rule_id: &str,
        _user_id: &str,
        _attributes: &serde_json::Map<String, serde_json::Value>,
        _cmab_uuid: &str,
    ) -> Result<String, CmabError> {
        Ok(self.variation_id.clone())
    }
}

fn config() -> ProjectConfig {
    ProjectConfig::parse(DATAFILE).unwrap()
}

fn adult(user_id: &str) -> UserSnapshot {
    UserSnapshot::new(
        user_id,
        Attributes::from([("age".to_owned(), 30.0.into())]),
    )
}

fn service() -> DecisionService {
    DecisionService::new(None, None)
}

#[test]
fn paused_experiment_yields_no_decision() {
    let config = config();
    let service = service();
    let experiment = config.experiment_by_key("paused_exp").unwrap().clone();
    let mut reasons = DecisionReasons::off();
    let variation = service.get_variation(&config, &experiment, &adult("u1"), &[], &mut reasons);
    assert!(variation.is_none());
}

#[test]
fn whitelist_wins_over_bucketing_and_skips_audiences() {
    let config = config();
    let service = service();
    let experiment = config.experiment_by_key("exp_1").unwrap().clone();
    // The whitelisted user does not even satisfy the audience.
    let user = UserSnapshot::new("whitelisted_user", Attributes::new());
    let mut reasons = DecisionReasons::off();
    let variation = service
        .get_variation(&config, &experiment, &user, &[], &mut reasons)
        .unwrap();
    assert_eq!(variation.key, "b");
}

#[test]
fn audience_failure_yields_no_decision() {
    let config = config();
    let service = service();
    let experiment = config.experiment_by_key("exp_1").unwrap().clone();
    let minor = UserSnapshot::new(
        "u1",
        Attributes::from([("age".to_owned(), 12.0.into())]),
    );
    let mut reasons = DecisionReasons::off();
    assert!(service
        .get_variation(&config, &experiment, &minor, &[], &mut reasons)
        .is_none());
}

#[test]
fn qualifying_user_with_full_allocation_gets_a_variation() {
    let config = config();
    let service = service();
    let experiment = config.experiment_by_key("exp_1").unwrap().clone();
    let mut reasons = DecisionReasons::off();
    let variation = service
        .get_variation(&config, &experiment, &adult("u1"), &[], &mut reasons)
        .unwrap();
    assert!(variation.key == "a" || variation.key == "b");

    // determinism: the same inputs always produce the same variation
    for _ in 0..5 {
        let mut reasons = DecisionReasons::off();
        let again = service
            .get_variation(&config, &experiment, &adult("u1"), &[], &mut reasons)
            .unwrap();
        assert_eq!(again.key, variation.key);
    }
}

#[test]
fn sticky_profile_overrides_allocation() {
    let config = config();
    let profiles = Arc::new(MemoryProfileService::default());
    let mut stored = UserProfile::new("sticky_user");
    // force the stored decision to the enabled variation regardless of hash
    stored.save_variation_for_experiment("e1", "v-a");
    profiles.save(&stored).unwrap();

    let service = DecisionService::new(Some(profiles), None);
    let experiment = config.experiment_by_key("exp_1").unwrap().clone();
    let mut reasons = DecisionReasons::off();
    let variation = service
        .get_variation(&config, &experiment, &adult("sticky_user"), &[], &mut reasons)
        .unwrap();
    assert_eq!(variation.key, "a");
}

#[test]
fn fresh_decision_is_persisted_to_the_profile() {
    let config = config();
    let profiles = Arc::new(MemoryProfileService::default());
    let service = DecisionService::new(Some(profiles.clone()), None);
    let experiment = config.experiment_by_key("exp_1").unwrap().clone();
    let mut reasons = DecisionReasons::off();
    let variation = service
        .get_variation(&config, &experiment, &adult("u1"), &[], &mut reasons)
        .unwrap();

    let saved = profiles.lookup("u1").unwrap().unwrap();
    assert_eq!(saved.variation_for_experiment("e1"), Some(&*variation.id));
}

#[test]
fn profile_lookup_failure_degrades_to_bucketing() {
    let config = config();
    let profiles = Arc::new(MemoryProfileService {
        fail_lookup: true,
        ..MemoryProfileService::default()
    });
    let service = DecisionService::new(Some(profiles), None);
    let experiment = config.experiment_by_key("exp_1").unwrap().clone();
    let mut reasons = DecisionReasons::off();
    let variation =
        service.get_variation(&config, &experiment, &adult("u1"), &[], &mut reasons);
    assert!(variation.is_some());
}

#[test]
fn ignore_user_profile_service_option_skips_lookup_and_save() {
    let config = config();
    let profiles = Arc::new(MemoryProfileService::default());
    let service = DecisionService::new(Some(profiles.clone()), None);
    let experiment = config.experiment_by_key("exp_1").unwrap().clone();
    let mut reasons = DecisionReasons::off();
    service
        .get_variation(
            &config,
            &experiment,
            &adult("u1"),
            &[DecideOption::IgnoreUserProfileService],
            &mut reasons,
        )
        .unwrap();
    assert!(profiles.profiles.lock().unwrap().is_empty());
}

#[test]
fn rollout_miss_on_targeted_rule_jumps_to_everyone_else() {
    let config = config();
    let service = service();
    let flag = config.feature_flag("feature_1").unwrap().clone();
    // A premium minor: fails the feature test audience, qualifies for the
    // targeted rule, but its allocation is empty so bucketing always
    // misses. The middle rule ("skipped_rule", full allocation) must NOT
    // catch the user; only the everyone-else rule remains.
    let user = UserSnapshot::new(
        "u1",
        Attributes::from([
            ("age".to_owned(), 12.0.into()),
            ("premium".to_owned(), true.into()),
        ]),
    );
    let mut reasons = DecisionReasons::off();
    let decision = service.get_variation_for_feature(&config, &flag, &user, &[], &mut reasons);
    assert_eq!(decision.source, DecisionSource::Rollout);
    assert_eq!(decision.variation.unwrap().key, "d");
}

#[test]
fn rollout_audience_miss_tries_next_rule() {
    let config = config();
    let service = service();
    let flag = config.feature_flag("feature_1").unwrap().clone();
    // Not premium: the targeted rule's audience fails, so the next rule in
    // order (full allocation) catches the user.
    let user = UserSnapshot::new(
        "u1",
        Attributes::from([("age".to_owned(), 12.0.into())]),
    );
    let mut reasons = DecisionReasons::off();
    let decision = service.get_variation_for_feature(&config, &flag, &user, &[], &mut reasons);
    assert_eq!(decision.source, DecisionSource::Rollout);
    assert_eq!(decision.variation.unwrap().key, "m");
}

#[test]
fn holdout_wins_before_feature_tests() {
    let config = config();
    let service = service();
    let flag = config.feature_flag("held_out_feature").unwrap().clone();
    let mut reasons = DecisionReasons::off();
    let decision =
        service.get_variation_for_feature(&config, &flag, &adult("u1"), &[], &mut reasons);
    assert_eq!(decision.source, DecisionSource::Holdout);
    let variation = decision.variation.unwrap();
    assert_eq!(variation.key, "holdout_off");
    assert!(!variation.feature_enabled);
}

#[test]
fn holdout_only_covers_its_flags() {
    let config = config();
    let service = service();
    let flag = config.feature_flag("feature_1").unwrap().clone();
    let mut reasons = DecisionReasons::off();
    let decision =
        service.get_variation_for_feature(&config, &flag, &adult("u1"), &[], &mut reasons);
    assert_ne!(decision.source, DecisionSource::Holdout);
}

#[test]
fn cmab_experiment_delegates_to_the_decision_service() {
    let config = config();
    let cmab = Arc::new(CmabService::new(Arc::new(FixedCmabClient {
        variation_id: "v-c2".to_owned(),
    })));
    let service = DecisionService::new(None, Some(cmab));
    let flag = config.feature_flag("cmab_feature").unwrap().clone();
    let mut reasons = DecisionReasons::off();
    let decision =
        service.get_variation_for_feature(&config, &flag, &adult("u1"), &[], &mut reasons);
    assert_eq!(decision.source, DecisionSource::FeatureTest);
    assert_eq!(decision.variation.unwrap().key, "arm_2");
}

#[test]
fn cmab_experiment_without_service_yields_no_decision() {
    let config = config();
    let service = service();
    let flag = config.feature_flag("cmab_feature").unwrap().clone();
    let mut reasons = DecisionReasons::new(&[DecideOption::IncludeReasons]);
    let decision =
        service.get_variation_for_feature(&config, &flag, &adult("u1"), &[], &mut reasons);
    assert!(decision.variation.is_none());
    let reasons = reasons.into_vec();
    assert!(reasons.iter().any(|r| r.contains("CMAB")));
}

#[test]
fn forced_decision_on_rule_wins_over_bucketing() {
    let config = config();
    let service = service();
    let flag = config.feature_flag("feature_1").unwrap().clone();
    let mut user = adult("u1");
    user.forced_decisions.insert(
        ForcedDecisionKey {
            flag_key: "feature_1".to_owned(),
            rule_key: Some("exp_1".to_owned()),
        },
        "b".to_owned(),
    );
    let mut reasons = DecisionReasons::new(&[DecideOption::IncludeReasons]);
    let decision = service.get_variation_for_feature(&config, &flag, &user, &[], &mut reasons);
    assert_eq!(decision.source, DecisionSource::FeatureTest);
    assert_eq!(decision.variation.unwrap().key, "b");
    assert!(reasons
        .into_vec()
        .iter()
        .any(|r| r.contains("forced decision")));
}

#[test]
fn invalid_forced_decision_is_reported_and_ignored() {
    let config = config();
    let service = service();
    let mut user = adult("u1");
    user.forced_decisions.insert(
        ForcedDecisionKey {
            flag_key: "feature_1".to_owned(),
            rule_key: None,
        },
        "no_such_variation".to_owned(),
    );
    let mut reasons = DecisionReasons::off();
    let variation =
        service.validated_forced_decision(&config, &user, "feature_1", None, &mut reasons);
    assert!(variation.is_none());
    assert!(reasons
        .into_vec()
        .iter()
        .any(|r| r.contains("Invalid variation")));
}

#[test]
fn reasons_are_suppressed_without_include_reasons() {
    let config = config();
    let service = service();
    let experiment = config.experiment_by_key("exp_1").unwrap().clone();

    let mut quiet = DecisionReasons::off();
    service.get_variation(&config, &experiment, &adult("u1"), &[], &mut quiet);
    assert!(quiet.into_vec().is_empty());

    let options = [DecideOption::IncludeReasons];
    let mut verbose = DecisionReasons::new(&options);
    service.get_variation(&config, &experiment, &adult("u1"), &options, &mut verbose);
    assert!(!verbose.into_vec().is_empty());
}
