//! Audience gating for experiments, rollout rules, and holdouts.
use crate::conditions::{ConditionUser, LeafCondition};
use crate::datafile::{Experiment, ProjectConfig};
use crate::decision::DecisionReasons;

/// Evaluate whether a user meets the audience conditions attached to an
/// experiment-like rule.
///
/// The rule's `audienceConditions` tree wins over the legacy audience-id
/// list; both were resolved into a single audience gate at datafile index
/// time. No gate means everyone qualifies. An unknown top-level result
/// gates the user out.
pub(crate) fn user_meets_audience_conditions(
    config: &ProjectConfig,
    experiment: &Experiment,
    user: &ConditionUser<'_>,
    rule_kind: &str,
    rule_key: &str,
    reasons: &mut DecisionReasons,
) -> bool {
    let Some(gate) = &experiment.audience_gate else {
        let message =
            format!("Audiences for {rule_kind} \"{rule_key}\" collectively evaluated to TRUE.");
        log::debug!(target: "splitstream", "{message}");
        reasons.info(message);
        return true;
    };

    let result = gate.evaluate(&|audience_id: &String| {
        let Some(audience) = config.audience(audience_id) else {
            log::warn!(target: "splitstream",
                "audience \"{audience_id}\" referenced by {rule_kind} \"{rule_key}\" is not in the datafile");
            return None;
        };
        let result = audience
            .conditions
            .evaluate(&|leaf: &LeafCondition| leaf.evaluate(user));
        log::debug!(target: "splitstream",
            "audience \"{audience_id}\" evaluated to {}",
            tri_state_label(result));
        result
    });

    let message = format!(
        "Audiences for {rule_kind} \"{rule_key}\" collectively evaluated to {}.",
        tri_state_label(result)
    );
    log::info!(target: "splitstream", "{message}");
    reasons.info(message);

    result.unwrap_or(false)
}

fn tri_state_label(result: Option<bool>) -> &'static str {
    match result {
        Some(true) => "TRUE",
        Some(false) => "FALSE",
        None => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use crate::conditions::ConditionUser;
    use crate::datafile::ProjectConfig;
    use crate::decision::DecisionReasons;
    use crate::Attributes;

    use super::user_meets_audience_conditions;

    const DATAFILE: &str = r#"{
        "version": "4",
        "accountId": "1",
        "projectId": "2",
        "revision": "1",
        "typedAudiences": [
            {"id": "adults", "name": "adults",
             "conditions": ["and", {"name": "age", "type": "custom_attribute", "value": 18, "match": "ge"}]},
            {"id": "not_bots", "name": "not bots",
             "conditions": ["not", {"name": "bot", "type": "custom_attribute", "value": true, "match": "exact"}]}
        ],
        "experiments": [
            {"id": "e1", "key": "with_ids", "status": "Running", "layerId": "l",
             "audienceIds": ["adults"], "variations": [], "trafficAllocation": []},
            {"id": "e2", "key": "with_tree", "status": "Running", "layerId": "l",
             "audienceIds": ["ignored"],
             "audienceConditions": ["and", "adults", "not_bots"],
             "variations": [], "trafficAllocation": []},
            {"id": "e3", "key": "no_audiences", "status": "Running", "layerId": "l",
             "audienceIds": [], "variations": [], "trafficAllocation": []},
            {"id": "e4", "key": "unknown_audience", "status": "Running", "layerId": "l",
             "audienceIds": ["missing"], "variations": [], "trafficAllocation": []}
        ]
    }"#;

    fn check(experiment_key: &str, attributes: Attributes) -> bool {
        let config = ProjectConfig::parse(DATAFILE).unwrap();
        let experiment = config.experiment_by_key(experiment_key).unwrap().clone();
        let user = ConditionUser {
            attributes: &attributes,
            qualified_segments: &[],
        };
        let mut reasons = DecisionReasons::off();
        user_meets_audience_conditions(&config, &experiment, &user, "experiment", experiment_key, &mut reasons)
    }

    #[test]
    fn audience_id_list_is_implicit_or() {
        assert!(check("with_ids", Attributes::from([("age".to_owned(), 21.0.into())])));
        assert!(!check("with_ids", Attributes::from([("age".to_owned(), 12.0.into())])));
    }

    #[test]
    fn conditions_tree_overrides_id_list() {
        let qualifying = Attributes::from([
            ("age".to_owned(), 21.0.into()),
            ("bot".to_owned(), false.into()),
        ]);
        assert!(check("with_tree", qualifying));

        let bot = Attributes::from([
            ("age".to_owned(), 21.0.into()),
            ("bot".to_owned(), true.into()),
        ]);
        assert!(!check("with_tree", bot));
    }

    #[test]
    fn unknown_gates_to_false() {
        // `not` over an absent attribute is unknown, which must not qualify
        let unknown = Attributes::from([("age".to_owned(), 21.0.into())]);
        assert!(!check("with_tree", unknown));

        // an audience id that is not in the datafile is unknown as well
        assert!(!check("unknown_audience", Attributes::new()));
    }

    #[test]
    fn no_audiences_means_everyone() {
        assert!(check("no_audiences", Attributes::new()));
    }
}
