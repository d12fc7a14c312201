//! The layered decision pipeline.
//!
//! For an experiment, the first layer to produce a variation wins: context
//! forced decision, whitelist, sticky profile, then audience gate plus
//! bucketing. For a feature flag, holdouts are evaluated first, then
//! feature tests in priority order, then the rollout.
use std::collections::HashMap;
use std::sync::Arc;

use crate::attributes::{self, Attributes};
use crate::audience;
use crate::bucketer::Bucketer;
use crate::cmab::CmabService;
use crate::conditions::ConditionUser;
use crate::datafile::{Experiment, FeatureFlag, ProjectConfig, TrafficAllocation, Variation};
use crate::user_profile::{UserProfile, UserProfileService};

/// Options accepted by the `decide` family of operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecideOption {
    /// Do not send an impression event for this decision.
    DisableDecisionEvent,
    /// `decide_all`/`decide_for_keys` only return enabled flags.
    EnabledFlagsOnly,
    /// Skip sticky-profile lookup and save for this decision.
    IgnoreUserProfileService,
    /// Populate `Decision::reasons` with informational messages (errors are
    /// always included).
    IncludeReasons,
    /// Do not resolve variable values for this decision.
    ExcludeVariables,
    /// Bypass the CMAB cache for this decision.
    IgnoreCmabCache,
    /// Drop the whole CMAB cache before deciding.
    ResetCmabCache,
    /// Drop this user's CMAB cache entry before deciding.
    InvalidateUserCmabCache,
}

/// Where a decision came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    /// A directly activated A/B experiment.
    Experiment,
    /// An experiment attached to a feature flag.
    FeatureTest,
    /// A rollout rule.
    Rollout,
    /// A holdout set aside from feature-test traffic.
    Holdout,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Experiment => "experiment",
            DecisionSource::FeatureTest => "feature-test",
            DecisionSource::Rollout => "rollout",
            DecisionSource::Holdout => "holdout",
        }
    }
}

/// Collector for human-readable decision reasons.
///
/// Error-grade messages are always collected; informational messages are
/// only kept when `INCLUDE_REASONS` was requested, so the hot path does not
/// pay for formatting nobody reads.
#[derive(Debug, Default)]
pub struct DecisionReasons {
    include_infos: bool,
    errors: Vec<String>,
    infos: Vec<String>,
}

impl DecisionReasons {
    pub fn new(options: &[DecideOption]) -> DecisionReasons {
        DecisionReasons {
            include_infos: options.contains(&DecideOption::IncludeReasons),
            ..DecisionReasons::default()
        }
    }

    /// A collector that keeps errors only.
    pub fn off() -> DecisionReasons {
        DecisionReasons::default()
    }

    pub fn error(&mut self, message: String) {
        self.errors.push(message);
    }

    pub fn info(&mut self, message: String) {
        if self.include_infos {
            self.infos.push(message);
        }
    }

    pub fn into_vec(self) -> Vec<String> {
        let mut all = self.errors;
        all.extend(self.infos);
        all
    }
}

/// Key identifying a forced decision on a user context: a flag, optionally
/// narrowed to one rule of that flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct ForcedDecisionKey {
    pub flag_key: String,
    pub rule_key: Option<String>,
}

/// An immutable snapshot of a user's state, taken once per decision call.
#[derive(Debug, Clone, Default)]
pub(crate) struct UserSnapshot {
    pub user_id: String,
    pub attributes: Attributes,
    pub qualified_segments: Vec<String>,
    pub forced_decisions: HashMap<ForcedDecisionKey, String>,
}

impl UserSnapshot {
    pub fn new(user_id: impl Into<String>, attributes: Attributes) -> UserSnapshot {
        UserSnapshot {
            user_id: user_id.into(),
            attributes,
            ..UserSnapshot::default()
        }
    }

    pub fn condition_user(&self) -> ConditionUser<'_> {
        ConditionUser {
            attributes: &self.attributes,
            qualified_segments: &self.qualified_segments,
        }
    }
}

/// A resolved decision for a user and a feature flag.
#[derive(Debug, Clone)]
pub struct FeatureDecision {
    pub experiment: Option<Arc<Experiment>>,
    pub variation: Option<Arc<Variation>>,
    pub source: DecisionSource,
}

impl FeatureDecision {
    fn none(source: DecisionSource) -> FeatureDecision {
        FeatureDecision {
            experiment: None,
            variation: None,
            source,
        }
    }
}

/// The final decision returned by the `decide` operations.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub flag_key: String,
    pub enabled: bool,
    pub variation_key: Option<String>,
    pub rule_key: Option<String>,
    pub variables: serde_json::Map<String, serde_json::Value>,
    pub reasons: Vec<String>,
}

impl Decision {
    pub(crate) fn off(flag_key: impl Into<String>, reasons: Vec<String>) -> Decision {
        Decision {
            flag_key: flag_key.into(),
            enabled: false,
            variation_key: None,
            rule_key: None,
            variables: serde_json::Map::new(),
            reasons,
        }
    }
}

/// Service encapsulating all decision capabilities: forced decisions,
/// whitelists, sticky profiles, audience gating, bucketing, and rollout
/// traversal.
pub struct DecisionService {
    bucketer: Bucketer,
    user_profile_service: Option<Arc<dyn UserProfileService>>,
    cmab_service: Option<Arc<CmabService>>,
}

impl DecisionService {
    pub fn new(
        user_profile_service: Option<Arc<dyn UserProfileService>>,
        cmab_service: Option<Arc<CmabService>>,
    ) -> DecisionService {
        DecisionService {
            bucketer: Bucketer::new(),
            user_profile_service,
            cmab_service,
        }
    }

    /// Determine the variation a user sees for one experiment.
    pub(crate) fn get_variation(
        &self,
        config: &ProjectConfig,
        experiment: &Arc<Experiment>,
        user: &UserSnapshot,
        options: &[DecideOption],
        reasons: &mut DecisionReasons,
    ) -> Option<Arc<Variation>> {
        if !experiment.is_running() {
            let message = format!("Experiment \"{}\" is not running.", experiment.key);
            log::info!(target: "splitstream", "{message}");
            reasons.info(message);
            return None;
        }

        if let Some(variation) = self.whitelisted_variation(config, experiment, &user.user_id, reasons)
        {
            return Some(variation);
        }

        let ignore_profile = options.contains(&DecideOption::IgnoreUserProfileService);
        let mut profile = None;
        if !ignore_profile {
            if let Some(service) = &self.user_profile_service {
                match service.lookup(&user.user_id) {
                    Ok(Some(stored)) => {
                        if let Some(variation) =
                            self.stored_variation(config, experiment, &stored, reasons)
                        {
                            return Some(variation);
                        }
                        profile = Some(stored);
                    }
                    Ok(None) => {}
                    Err(err) => {
                        let message = format!(
                            "Unable to retrieve user profile for user \"{}\": {err}",
                            user.user_id
                        );
                        log::warn!(target: "splitstream", "{message}");
                        reasons.error(message);
                    }
                }
            }
        }

        if !audience::user_meets_audience_conditions(
            config,
            experiment,
            &user.condition_user(),
            "experiment",
            &experiment.key,
            reasons,
        ) {
            let message = format!(
                "User \"{}\" does not meet conditions to be in experiment \"{}\".",
                user.user_id, experiment.key
            );
            log::info!(target: "splitstream", "{message}");
            reasons.info(message);
            return None;
        }

        let bucketing_id = attributes::bucketing_id(&user.user_id, &user.attributes);
        let variation = if experiment.cmab.is_some() {
            self.cmab_variation(config, experiment, user, bucketing_id, options, reasons)
        } else {
            self.bucketer
                .bucket(config, experiment, &user.user_id, bucketing_id, reasons)
        };
        let variation = variation?;

        let message = format!(
            "User \"{}\" is in variation \"{}\" of experiment \"{}\".",
            user.user_id, variation.key, experiment.key
        );
        log::info!(target: "splitstream", "{message}");
        reasons.info(message);

        if !ignore_profile {
            if let Some(service) = &self.user_profile_service {
                let mut profile =
                    profile.unwrap_or_else(|| UserProfile::new(user.user_id.clone()));
                profile.save_variation_for_experiment(experiment.id.clone(), variation.id.clone());
                if let Err(err) = service.save(&profile) {
                    log::warn!(target: "splitstream",
                        "unable to save user profile for user \"{}\": {err}", user.user_id);
                }
            }
        }

        Some(variation)
    }

    /// Determine the decision for a feature flag: holdouts, then feature
    /// tests in priority order, then the rollout.
    pub(crate) fn get_variation_for_feature(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &UserSnapshot,
        options: &[DecideOption],
        reasons: &mut DecisionReasons,
    ) -> FeatureDecision {
        if let Some(decision) = self.get_variation_for_holdouts(config, flag, user, reasons) {
            return decision;
        }

        for experiment_id in &flag.experiment_ids {
            let Some(experiment) = config.experiment_by_id(experiment_id) else {
                log::warn!(target: "splitstream",
                    "feature test \"{experiment_id}\" of flag \"{}\" is not in the datafile", flag.key);
                continue;
            };

            if let Some(variation) = self.validated_forced_decision(
                config,
                user,
                &flag.key,
                Some(&experiment.key),
                reasons,
            ) {
                return FeatureDecision {
                    experiment: Some(experiment.clone()),
                    variation: Some(variation),
                    source: DecisionSource::FeatureTest,
                };
            }

            if let Some(variation) = self.get_variation(config, experiment, user, options, reasons)
            {
                return FeatureDecision {
                    experiment: Some(experiment.clone()),
                    variation: Some(variation),
                    source: DecisionSource::FeatureTest,
                };
            }
        }

        self.get_variation_for_rollout(config, flag, user, reasons)
    }

    fn get_variation_for_holdouts(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &UserSnapshot,
        reasons: &mut DecisionReasons,
    ) -> Option<FeatureDecision> {
        let bucketing_id = attributes::bucketing_id(&user.user_id, &user.attributes);

        for holdout in config.holdouts_for_flag(&flag.id) {
            if !holdout.is_running() {
                continue;
            }
            if !audience::user_meets_audience_conditions(
                config,
                holdout,
                &user.condition_user(),
                "holdout",
                &holdout.key,
                reasons,
            ) {
                continue;
            }
            // A holdout only wins if it actually allocates the user.
            if let Some(variation) =
                self.bucketer
                    .bucket(config, holdout, &user.user_id, bucketing_id, reasons)
            {
                let message = format!(
                    "User \"{}\" is held out of flag \"{}\" in holdout \"{}\".",
                    user.user_id, flag.key, holdout.key
                );
                log::info!(target: "splitstream", "{message}");
                reasons.info(message);
                return Some(FeatureDecision {
                    experiment: Some(holdout.clone()),
                    variation: Some(variation),
                    source: DecisionSource::Holdout,
                });
            }
        }
        None
    }

    fn get_variation_for_rollout(
        &self,
        config: &ProjectConfig,
        flag: &FeatureFlag,
        user: &UserSnapshot,
        reasons: &mut DecisionReasons,
    ) -> FeatureDecision {
        if flag.rollout_id.is_empty() {
            let message = format!("Feature flag \"{}\" is not used in a rollout.", flag.key);
            log::debug!(target: "splitstream", "{message}");
            reasons.info(message);
            return FeatureDecision::none(DecisionSource::Rollout);
        }
        let Some(rules) = config.rollout(&flag.rollout_id) else {
            let message = format!(
                "Rollout with id \"{}\" is not in the datafile.",
                flag.rollout_id
            );
            log::warn!(target: "splitstream", "{message}");
            reasons.error(message);
            return FeatureDecision::none(DecisionSource::Rollout);
        };
        if rules.is_empty() {
            return FeatureDecision::none(DecisionSource::Rollout);
        }

        let bucketing_id = attributes::bucketing_id(&user.user_id, &user.attributes);
        let everyone_else_index = rules.len() - 1;
        let mut index = 0;

        while index < rules.len() {
            let rule = &rules[index];
            let rule_label = if index == everyone_else_index {
                "\"Everyone Else\" rule".to_owned()
            } else {
                format!("targeting rule \"{}\"", rule.key)
            };

            if let Some(variation) =
                self.validated_forced_decision(config, user, &flag.key, Some(&rule.key), reasons)
            {
                return FeatureDecision {
                    experiment: Some(rule.clone()),
                    variation: Some(variation),
                    source: DecisionSource::Rollout,
                };
            }

            if !audience::user_meets_audience_conditions(
                config,
                rule,
                &user.condition_user(),
                "rollout rule",
                &rule.key,
                reasons,
            ) {
                let message = format!(
                    "User \"{}\" does not meet conditions for {rule_label}.",
                    user.user_id
                );
                log::debug!(target: "splitstream", "{message}");
                reasons.info(message);
                index += 1;
                continue;
            }

            match self
                .bucketer
                .bucket(config, rule, &user.user_id, bucketing_id, reasons)
            {
                Some(variation) => {
                    let message =
                        format!("User \"{}\" is bucketed into {rule_label}.", user.user_id);
                    log::info!(target: "splitstream", "{message}");
                    reasons.info(message);
                    return FeatureDecision {
                        experiment: Some(rule.clone()),
                        variation: Some(variation),
                        source: DecisionSource::Rollout,
                    };
                }
                None if index == everyone_else_index => break,
                None => {
                    // A user who qualifies for a targeting rule but misses
                    // its allocation skips straight to the everyone-else
                    // rule; later targeting rules are not tried.
                    let message = format!(
                        "User \"{}\" is not bucketed into {rule_label}. Checking \"Everyone Else\" rule now.",
                        user.user_id
                    );
                    log::debug!(target: "splitstream", "{message}");
                    reasons.info(message);
                    index = everyone_else_index;
                }
            }
        }

        FeatureDecision::none(DecisionSource::Rollout)
    }

    /// Resolve a forced decision set on the user context for (flag, rule),
    /// validating the variation against the flag's reachable variations.
    pub(crate) fn validated_forced_decision(
        &self,
        config: &ProjectConfig,
        user: &UserSnapshot,
        flag_key: &str,
        rule_key: Option<&str>,
        reasons: &mut DecisionReasons,
    ) -> Option<Arc<Variation>> {
        let key = ForcedDecisionKey {
            flag_key: flag_key.to_owned(),
            rule_key: rule_key.map(str::to_owned),
        };
        let variation_key = user.forced_decisions.get(&key)?;

        let target = match rule_key {
            Some(rule_key) => format!("flag \"{flag_key}\", rule \"{rule_key}\""),
            None => format!("flag \"{flag_key}\""),
        };
        match config.flag_variation(flag_key, variation_key) {
            Some(variation) => {
                let message = format!(
                    "Variation \"{variation_key}\" is mapped to {target} and user \"{}\" in the forced decision map.",
                    user.user_id
                );
                log::info!(target: "splitstream", "{message}");
                reasons.info(message);
                Some(variation.clone())
            }
            None => {
                let message = format!(
                    "Invalid variation is mapped to {target} and user \"{}\" in the forced decision map.",
                    user.user_id
                );
                log::warn!(target: "splitstream", "{message}");
                reasons.error(message);
                None
            }
        }
    }

    fn whitelisted_variation(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        user_id: &str,
        reasons: &mut DecisionReasons,
    ) -> Option<Arc<Variation>> {
        let variation_key = experiment.forced_variations.get(user_id)?;
        match config.variation_by_key(&experiment.id, variation_key) {
            Some(variation) => {
                let message =
                    format!("User \"{user_id}\" is forced in variation \"{variation_key}\".");
                log::info!(target: "splitstream", "{message}");
                reasons.info(message);
                Some(variation.clone())
            }
            None => {
                let message = format!(
                    "Whitelisted variation \"{variation_key}\" of experiment \"{}\" is not in the datafile.",
                    experiment.key
                );
                log::warn!(target: "splitstream", "{message}");
                reasons.error(message);
                None
            }
        }
    }

    fn stored_variation(
        &self,
        config: &ProjectConfig,
        experiment: &Experiment,
        profile: &UserProfile,
        reasons: &mut DecisionReasons,
    ) -> Option<Arc<Variation>> {
        let variation_id = profile.variation_for_experiment(&experiment.id)?;
        match config.variation_by_id(&experiment.id, variation_id) {
            Some(variation) => {
                let message = format!(
                    "Found a stored decision. User \"{}\" is in variation \"{}\" of experiment \"{}\".",
                    profile.user_id, variation.key, experiment.key
                );
                log::info!(target: "splitstream", "{message}");
                reasons.info(message);
                Some(variation.clone())
            }
            None => {
                let message = format!(
                    "Stored variation \"{variation_id}\" of experiment \"{}\" is no longer in the datafile.",
                    experiment.key
                );
                log::info!(target: "splitstream", "{message}");
                reasons.info(message);
                None
            }
        }
    }

    fn cmab_variation(
        &self,
        config: &ProjectConfig,
        experiment: &Arc<Experiment>,
        user: &UserSnapshot,
        bucketing_id: &str,
        options: &[DecideOption],
        reasons: &mut DecisionReasons,
    ) -> Option<Arc<Variation>> {
        let cmab = experiment.cmab.as_ref()?;

        // CMAB experiments gate traffic exposure with their own allocation
        // before the decision service is consulted.
        let exposure = [TrafficAllocation {
            entity_id: Some("$".to_owned()),
            end_of_range: cmab.traffic_allocation,
        }];
        if self
            .bucketer
            .bucket_to_entity_id(bucketing_id, &experiment.id, &exposure)
            .is_none()
        {
            let message = format!(
                "User \"{}\" is not in CMAB experiment \"{}\" due to traffic allocation.",
                user.user_id, experiment.key
            );
            log::info!(target: "splitstream", "{message}");
            reasons.info(message);
            return None;
        }

        let Some(service) = &self.cmab_service else {
            let message = format!(
                "Experiment \"{}\" requires a CMAB decision service, but none is configured.",
                experiment.key
            );
            log::warn!(target: "splitstream", "{message}");
            reasons.error(message);
            return None;
        };

        match service.get_decision(config, user, &experiment.id, options) {
            Ok(decision) => match config.variation_by_id(&experiment.id, &decision.variation_id) {
                Some(variation) => Some(variation.clone()),
                None => {
                    let message = format!(
                        "CMAB returned unknown variation \"{}\" for experiment \"{}\".",
                        decision.variation_id, experiment.key
                    );
                    log::warn!(target: "splitstream", "{message}");
                    reasons.error(message);
                    None
                }
            },
            Err(err) => {
                let message = format!(
                    "CMAB decision failed for experiment \"{}\": {err}",
                    experiment.key
                );
                log::warn!(target: "splitstream", "{message}");
                reasons.error(message);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests;
