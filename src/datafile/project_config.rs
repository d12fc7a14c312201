//! The indexed, immutable project configuration built from a parsed
//! datafile.
//!
//! All lookups the decision path needs are O(1) hash-map reads. The config
//! is never mutated after construction; updates replace the whole value
//! behind an `Arc` swap in the config store.
use std::collections::HashMap;
use std::sync::Arc;

use crate::conditions::{self, ConditionTree};

use super::models::{
    Attribute, Audience, Datafile, DatafileError, EventDefinition, Experiment, FeatureFlag,
    Group, Variable, VariableType, Variation,
};

/// A holdout rule prepared for evaluation, with the flags it covers
/// resolved at construction time.
#[derive(Debug, Clone)]
struct PreparedHoldout {
    rule: Arc<Experiment>,
    included_flags: Vec<String>,
    excluded_flags: Vec<String>,
}

#[derive(Debug)]
pub struct ProjectConfig {
    pub version: String,
    pub account_id: String,
    pub project_id: String,
    pub revision: String,
    pub anonymize_ip: bool,
    pub bot_filtering: Option<bool>,
    pub send_flag_decisions: bool,
    pub sdk_key: Option<String>,
    pub environment_key: Option<String>,

    attributes_by_key: HashMap<String, Attribute>,
    attributes_by_id: HashMap<String, Attribute>,
    audiences_by_id: HashMap<String, Arc<Audience>>,
    events_by_key: HashMap<String, EventDefinition>,
    experiments_by_id: HashMap<String, Arc<Experiment>>,
    experiments_by_key: HashMap<String, Arc<Experiment>>,
    groups_by_id: HashMap<String, Arc<Group>>,
    flags_by_key: HashMap<String, Arc<FeatureFlag>>,
    /// Rollout id to its ordered rule list.
    rollouts_by_id: HashMap<String, Vec<Arc<Experiment>>>,
    /// Flag id to the holdout rules covering it, in datafile order.
    holdouts_by_flag: HashMap<String, Vec<Arc<Experiment>>>,
    /// Experiment (or rollout rule, or holdout) id to its variations by id.
    variations_by_id: HashMap<String, HashMap<String, Arc<Variation>>>,
    /// Experiment (or rollout rule, or holdout) id to its variations by key.
    variations_by_key: HashMap<String, HashMap<String, Arc<Variation>>>,
    /// Flag key to every variation reachable through its rules, for
    /// validating forced decisions.
    variations_by_flag: HashMap<String, Vec<Arc<Variation>>>,
    /// Flag key to its variables by key.
    variables_by_flag: HashMap<String, HashMap<String, Variable>>,
}

impl ProjectConfig {
    /// Parse datafile text and build the indexed configuration.
    pub fn parse(text: &str) -> Result<ProjectConfig, DatafileError> {
        ProjectConfig::new(Datafile::parse(text)?)
    }

    pub fn new(datafile: Datafile) -> Result<ProjectConfig, DatafileError> {
        let version = datafile
            .version
            .clone()
            .unwrap_or_default();

        let mut audiences_by_id = HashMap::new();
        // Typed audiences take precedence over legacy audiences sharing an
        // id, so they are inserted second.
        for raw in datafile.audiences.iter().chain(&datafile.typed_audiences) {
            let conditions =
                conditions::parse_attribute_conditions(&raw.conditions).map_err(|source| {
                    DatafileError::MalformedConditions {
                        owner: format!("audience \"{}\"", raw.id),
                        source,
                    }
                })?;
            audiences_by_id.insert(
                raw.id.clone(),
                Arc::new(Audience {
                    id: raw.id.clone(),
                    name: raw.name.clone(),
                    conditions,
                }),
            );
        }

        let mut config = ProjectConfig {
            version,
            account_id: datafile.account_id.clone(),
            project_id: datafile.project_id.clone(),
            revision: datafile.revision.clone(),
            anonymize_ip: datafile.anonymize_ip,
            bot_filtering: datafile.bot_filtering,
            send_flag_decisions: datafile.send_flag_decisions,
            sdk_key: datafile.sdk_key.clone(),
            environment_key: datafile.environment_key.clone(),
            attributes_by_key: datafile
                .attributes
                .iter()
                .map(|a| (a.key.clone(), a.clone()))
                .collect(),
            attributes_by_id: datafile
                .attributes
                .iter()
                .map(|a| (a.id.clone(), a.clone()))
                .collect(),
            audiences_by_id,
            events_by_key: datafile
                .events
                .iter()
                .map(|e| (e.key.clone(), e.clone()))
                .collect(),
            experiments_by_id: HashMap::new(),
            experiments_by_key: HashMap::new(),
            groups_by_id: HashMap::new(),
            flags_by_key: HashMap::new(),
            rollouts_by_id: HashMap::new(),
            holdouts_by_flag: HashMap::new(),
            variations_by_id: HashMap::new(),
            variations_by_key: HashMap::new(),
            variations_by_flag: HashMap::new(),
            variables_by_flag: HashMap::new(),
        };

        for experiment in &datafile.experiments {
            let experiment = Arc::new(prepare_experiment(experiment.clone(), None)?);
            config.index_experiment(&experiment);
        }

        for group in &datafile.groups {
            for experiment in &group.experiments {
                let experiment = Arc::new(prepare_experiment(experiment.clone(), Some(group))?);
                config.index_experiment(&experiment);
            }
            config
                .groups_by_id
                .insert(group.id.clone(), Arc::new(group.clone()));
        }

        for rollout in &datafile.rollouts {
            let rules = rollout
                .experiments
                .iter()
                .map(|rule| {
                    let rule = Arc::new(prepare_experiment(rule.clone(), None)?);
                    config.index_experiment(&rule);
                    Ok(rule)
                })
                .collect::<Result<Vec<_>, DatafileError>>()?;
            config.rollouts_by_id.insert(rollout.id.clone(), rules);
        }

        let holdouts = datafile
            .holdouts
            .iter()
            .map(|holdout| {
                let rule = Arc::new(prepare_experiment(holdout.experiment.clone(), None)?);
                config.index_variations(&rule);
                Ok(PreparedHoldout {
                    rule,
                    included_flags: holdout.included_flags.clone(),
                    excluded_flags: holdout.excluded_flags.clone(),
                })
            })
            .collect::<Result<Vec<_>, DatafileError>>()?;

        for flag in &datafile.feature_flags {
            let flag = Arc::new(fold_variable_sub_types(flag.clone()));

            let covering: Vec<Arc<Experiment>> = holdouts
                .iter()
                .filter(|holdout| {
                    if holdout.included_flags.is_empty() {
                        !holdout.excluded_flags.contains(&flag.id)
                    } else {
                        holdout.included_flags.contains(&flag.id)
                    }
                })
                .map(|holdout| holdout.rule.clone())
                .collect();
            if !covering.is_empty() {
                config.holdouts_by_flag.insert(flag.id.clone(), covering);
            }

            config.variables_by_flag.insert(
                flag.key.clone(),
                flag.variables
                    .iter()
                    .map(|v| (v.key.clone(), v.clone()))
                    .collect(),
            );
            let flag_variations = config.collect_flag_variations(&flag);
            config
                .variations_by_flag
                .insert(flag.key.clone(), flag_variations);
            config.flags_by_key.insert(flag.key.clone(), flag);
        }

        Ok(config)
    }

    fn index_experiment(&mut self, experiment: &Arc<Experiment>) {
        self.experiments_by_id
            .insert(experiment.id.clone(), experiment.clone());
        self.experiments_by_key
            .insert(experiment.key.clone(), experiment.clone());
        self.index_variations(experiment);
    }

    fn index_variations(&mut self, experiment: &Arc<Experiment>) {
        let by_id = self
            .variations_by_id
            .entry(experiment.id.clone())
            .or_default();
        let by_key = self
            .variations_by_key
            .entry(experiment.id.clone())
            .or_default();
        for variation in &experiment.variations {
            let variation = Arc::new(variation.clone());
            by_id.insert(variation.id.clone(), variation.clone());
            by_key.insert(variation.key.clone(), variation);
        }
    }

    /// Every variation reachable through the flag's feature tests and
    /// rollout rules, deduplicated by id in rule order.
    fn collect_flag_variations(&self, flag: &FeatureFlag) -> Vec<Arc<Variation>> {
        let mut seen = HashMap::new();
        let mut variations = Vec::new();

        let rollout_rules = self
            .rollouts_by_id
            .get(&flag.rollout_id)
            .map(Vec::as_slice)
            .unwrap_or_default();
        let experiments = flag
            .experiment_ids
            .iter()
            .filter_map(|id| self.experiments_by_id.get(id))
            .chain(rollout_rules.iter());

        for experiment in experiments {
            for variation in &experiment.variations {
                if let Some(variation) = self
                    .variations_by_id
                    .get(&experiment.id)
                    .and_then(|m| m.get(&variation.id))
                {
                    if seen.insert(variation.id.clone(), ()).is_none() {
                        variations.push(variation.clone());
                    }
                }
            }
        }
        variations
    }

    pub fn experiment_by_key(&self, key: &str) -> Option<&Arc<Experiment>> {
        self.experiments_by_key.get(key)
    }

    pub fn experiment_by_id(&self, id: &str) -> Option<&Arc<Experiment>> {
        self.experiments_by_id.get(id)
    }

    pub fn group(&self, id: &str) -> Option<&Arc<Group>> {
        self.groups_by_id.get(id)
    }

    pub fn audience(&self, id: &str) -> Option<&Arc<Audience>> {
        self.audiences_by_id.get(id)
    }

    pub fn event(&self, key: &str) -> Option<&EventDefinition> {
        self.events_by_key.get(key)
    }

    pub fn attribute(&self, key: &str) -> Option<&Attribute> {
        self.attributes_by_key.get(key)
    }

    pub fn attribute_by_id(&self, id: &str) -> Option<&Attribute> {
        self.attributes_by_id.get(id)
    }

    pub fn feature_flag(&self, key: &str) -> Option<&Arc<FeatureFlag>> {
        self.flags_by_key.get(key)
    }

    pub fn feature_flags(&self) -> impl Iterator<Item = &Arc<FeatureFlag>> {
        self.flags_by_key.values()
    }

    pub fn rollout(&self, id: &str) -> Option<&[Arc<Experiment>]> {
        self.rollouts_by_id.get(id).map(Vec::as_slice)
    }

    pub fn holdouts_for_flag(&self, flag_id: &str) -> &[Arc<Experiment>] {
        self.holdouts_by_flag
            .get(flag_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn variation_by_id(&self, experiment_id: &str, variation_id: &str) -> Option<&Arc<Variation>> {
        self.variations_by_id.get(experiment_id)?.get(variation_id)
    }

    pub fn variation_by_key(
        &self,
        experiment_id: &str,
        variation_key: &str,
    ) -> Option<&Arc<Variation>> {
        self.variations_by_key.get(experiment_id)?.get(variation_key)
    }

    /// Look up a variation by key across every rule of a flag. Used to
    /// validate forced decisions.
    pub fn flag_variation(&self, flag_key: &str, variation_key: &str) -> Option<&Arc<Variation>> {
        self.variations_by_flag
            .get(flag_key)?
            .iter()
            .find(|v| v.key == variation_key)
    }

    /// Look up a flag variable, with variation-specific overrides already
    /// merged at read time by the decision layer.
    pub fn variable(&self, flag_key: &str, variable_key: &str) -> Option<&Variable> {
        self.variables_by_flag.get(flag_key)?.get(variable_key)
    }

    pub fn variables_for_flag(&self, flag_key: &str) -> Option<&HashMap<String, Variable>> {
        self.variables_by_flag.get(flag_key)
    }
}

fn prepare_experiment(
    mut experiment: Experiment,
    group: Option<&Group>,
) -> Result<Experiment, DatafileError> {
    if let Some(group) = group {
        experiment.group_id = Some(group.id.clone());
        experiment.group_policy = Some(group.policy);
    }
    experiment.audience_gate = match &experiment.audience_conditions {
        // An explicitly empty tree gates nobody out.
        Some(serde_json::Value::Array(items)) if items.is_empty() => None,
        Some(value) => Some(conditions::parse_audience_conditions(value).map_err(|source| {
            DatafileError::MalformedConditions {
                owner: format!("experiment \"{}\"", experiment.key),
                source,
            }
        })?),
        None if experiment.audience_ids.is_empty() => None,
        // The legacy audience-id list means "any of these audiences".
        None => Some(ConditionTree::Or(
            experiment
                .audience_ids
                .iter()
                .cloned()
                .map(ConditionTree::Leaf)
                .collect(),
        )),
    };
    Ok(experiment)
}

/// Fold the legacy `{"type": "string", "subType": "json"}` variable shape
/// into [`VariableType::Json`].
fn fold_variable_sub_types(mut flag: FeatureFlag) -> FeatureFlag {
    for variable in &mut flag.variables {
        if variable.variable_type == VariableType::String
            && variable.sub_type.as_deref() == Some("json")
        {
            variable.variable_type = VariableType::Json;
        }
    }
    flag
}

#[cfg(test)]
mod tests {
    use super::*;

    const DATAFILE: &str = r#"{
        "version": "4",
        "accountId": "10367498574",
        "projectId": "10431130345",
        "revision": "241",
        "anonymizeIP": true,
        "botFiltering": false,
        "sendFlagDecisions": true,
        "attributes": [{"id": "a1", "key": "age"}],
        "events": [{"id": "e1", "key": "purchase", "experimentIds": ["10390977673"]}],
        "audiences": [
            {"id": "100", "name": "legacy adults",
             "conditions": "[\"and\", {\"name\": \"age\", \"type\": \"custom_attribute\", \"value\": 18, \"match\": \"ge\"}]"}
        ],
        "typedAudiences": [
            {"id": "100", "name": "adults",
             "conditions": ["and", {"name": "age", "type": "custom_attribute", "value": 21, "match": "ge"}]}
        ],
        "groups": [
            {"id": "g1", "policy": "random",
             "trafficAllocation": [{"entityId": "10390977673", "endOfRange": 5000}],
             "experiments": [
                {"id": "10390977673", "key": "group_exp", "status": "Running", "layerId": "l1",
                 "audienceIds": [], "variations": [{"id": "v1", "key": "on", "featureEnabled": true}],
                 "forcedVariations": {}, "trafficAllocation": [{"entityId": "v1", "endOfRange": 10000}]}
             ]}
        ],
        "experiments": [
            {"id": "10420810910", "key": "exp_1", "status": "Running", "layerId": "l2",
             "audienceIds": ["100"],
             "variations": [
                {"id": "v2", "key": "a", "featureEnabled": true,
                 "variables": [{"id": "var1", "value": "A"}]},
                {"id": "v3", "key": "b", "featureEnabled": false}
             ],
             "forcedVariations": {"forced_user": "b"},
             "trafficAllocation": [
                {"entityId": "v2", "endOfRange": 5000},
                {"entityId": "v3", "endOfRange": 10000}
             ]}
        ],
        "featureFlags": [
            {"id": "f1", "key": "feature_1", "rolloutId": "r1",
             "experimentIds": ["10420810910"],
             "variables": [
                {"id": "var1", "key": "x", "type": "string", "defaultValue": "default"},
                {"id": "var2", "key": "j", "type": "string", "subType": "json", "defaultValue": "{}"}
             ]}
        ],
        "rollouts": [
            {"id": "r1", "experiments": [
                {"id": "rr1", "key": "targeted_rule", "status": "Running", "layerId": "r1",
                 "audienceIds": ["100"],
                 "variations": [{"id": "v4", "key": "c", "featureEnabled": true}],
                 "forcedVariations": {},
                 "trafficAllocation": [{"entityId": "v4", "endOfRange": 5000}]},
                {"id": "rr2", "key": "everyone_else", "status": "Running", "layerId": "r1",
                 "audienceIds": [],
                 "variations": [{"id": "v5", "key": "d", "featureEnabled": true}],
                 "forcedVariations": {},
                 "trafficAllocation": [{"entityId": "v5", "endOfRange": 10000}]}
            ]}
        ],
        "holdouts": [
            {"id": "h1", "key": "global_holdout", "status": "Running", "layerId": "hl1",
             "audienceIds": [],
             "variations": [{"id": "v6", "key": "holdout_off", "featureEnabled": false}],
             "trafficAllocation": [{"entityId": "v6", "endOfRange": 200}],
             "includedFlags": [], "excludedFlags": []}
        ]
    }"#;

    #[test]
    fn builds_lookup_maps() {
        let config = ProjectConfig::parse(DATAFILE).unwrap();

        assert_eq!(config.revision, "241");
        assert!(config.send_flag_decisions);

        let experiment = config.experiment_by_key("exp_1").unwrap();
        assert_eq!(experiment.id, "10420810910");
        assert!(config.experiment_by_id("10420810910").is_some());

        let variation = config.variation_by_key("10420810910", "a").unwrap();
        assert_eq!(variation.id, "v2");
        assert_eq!(
            config.variation_by_id("10420810910", "v3").unwrap().key,
            "b"
        );

        assert!(config.event("purchase").is_some());
        assert_eq!(config.attribute("age").unwrap().id, "a1");
        assert!(config.feature_flag("feature_1").is_some());
    }

    #[test]
    fn group_experiments_carry_group_metadata() {
        let config = ProjectConfig::parse(DATAFILE).unwrap();
        let experiment = config.experiment_by_key("group_exp").unwrap();
        assert_eq!(experiment.group_id.as_deref(), Some("g1"));
        assert_eq!(
            experiment.group_policy,
            Some(crate::datafile::GroupPolicy::Random)
        );
    }

    #[test]
    fn typed_audiences_take_precedence() {
        let config = ProjectConfig::parse(DATAFILE).unwrap();
        let audience = config.audience("100").unwrap();
        assert_eq!(audience.name, "adults");
    }

    #[test]
    fn rollout_rules_are_ordered_and_indexed() {
        let config = ProjectConfig::parse(DATAFILE).unwrap();
        let rules = config.rollout("r1").unwrap();
        assert_eq!(rules.len(), 2);
        assert_eq!(rules[0].key, "targeted_rule");
        assert_eq!(rules[1].key, "everyone_else");
        // rollout rule variations are reachable through the variation index
        assert!(config.variation_by_id("rr1", "v4").is_some());
    }

    #[test]
    fn global_holdout_covers_every_flag() {
        let config = ProjectConfig::parse(DATAFILE).unwrap();
        let holdouts = config.holdouts_for_flag("f1");
        assert_eq!(holdouts.len(), 1);
        assert_eq!(holdouts[0].key, "global_holdout");
        assert!(config.variation_by_id("h1", "v6").is_some());
    }

    #[test]
    fn flag_variations_span_experiments_and_rollout() {
        let config = ProjectConfig::parse(DATAFILE).unwrap();
        assert!(config.flag_variation("feature_1", "a").is_some());
        assert!(config.flag_variation("feature_1", "c").is_some());
        assert!(config.flag_variation("feature_1", "d").is_some());
        assert!(config.flag_variation("feature_1", "nope").is_none());
    }

    #[test]
    fn json_sub_type_is_folded() {
        let config = ProjectConfig::parse(DATAFILE).unwrap();
        let variable = config.variable("feature_1", "j").unwrap();
        assert_eq!(variable.variable_type, VariableType::Json);
        assert_eq!(
            config.variable("feature_1", "x").unwrap().variable_type,
            VariableType::String
        );
    }
}
