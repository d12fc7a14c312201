//! Audience condition trees and their tri-valued evaluation.
//!
//! Conditions evaluate to `Some(true)`, `Some(false)`, or `None` (unknown).
//! The distinction between unknown and false matters inside nested `not`
//! operators, so unknown is modeled explicitly rather than collapsed to
//! false at the leaves.
use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use crate::{AttributeValue, Attributes};

const CUSTOM_ATTRIBUTE_TYPE: &str = "custom_attribute";
const THIRD_PARTY_DIMENSION_TYPE: &str = "third_party_dimension";

/// Numbers outside ±2^53 lose integer precision and are rejected by the
/// numeric match operators.
const MAX_NUMBER_LIMIT: f64 = 9_007_199_254_740_992.0;

/// A condition tree over leaves of type `L`.
///
/// Audience definitions carry trees of [`LeafCondition`]; experiments and
/// rollout rules carry trees of audience-id strings.
#[derive(Debug, Clone)]
pub enum ConditionTree<L> {
    And(Vec<ConditionTree<L>>),
    Or(Vec<ConditionTree<L>>),
    Not(Vec<ConditionTree<L>>),
    Leaf(L),
}

impl<L> ConditionTree<L> {
    /// Evaluate the tree with the given leaf evaluator.
    ///
    /// Operator semantics over the tri-valued domain:
    /// - `and`: false if any operand is false; unknown if any operand is
    ///   unknown and none is false; else true.
    /// - `or`: true if any operand is true; unknown if any operand is
    ///   unknown and none is true; else false.
    /// - `not`: negates its first operand; unknown stays unknown; an empty
    ///   operand list is unknown.
    pub fn evaluate<F>(&self, leaf_evaluator: &F) -> Option<bool>
    where
        F: Fn(&L) -> Option<bool>,
    {
        match self {
            ConditionTree::And(children) => {
                let mut saw_unknown = false;
                for child in children {
                    match child.evaluate(leaf_evaluator) {
                        Some(false) => return Some(false),
                        None => saw_unknown = true,
                        Some(true) => {}
                    }
                }
                if saw_unknown {
                    None
                } else {
                    Some(true)
                }
            }
            ConditionTree::Or(children) => {
                let mut saw_unknown = false;
                for child in children {
                    match child.evaluate(leaf_evaluator) {
                        Some(true) => return Some(true),
                        None => saw_unknown = true,
                        Some(false) => {}
                    }
                }
                if saw_unknown {
                    None
                } else {
                    Some(false)
                }
            }
            ConditionTree::Not(children) => children
                .first()
                .and_then(|child| child.evaluate(leaf_evaluator))
                .map(|result| !result),
            ConditionTree::Leaf(leaf) => leaf_evaluator(leaf),
        }
    }
}

/// A single targeting condition over one user attribute (or one qualified
/// segment).
///
/// Unrecognized `type` or `match` tags evaluate to unknown rather than
/// failing, so newer datafiles degrade gracefully on older SDKs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeafCondition {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub condition_type: String,
    /// Absent `match` means `exact` (the oldest datafile format had no
    /// match tag).
    #[serde(rename = "match", default)]
    pub match_type: Option<String>,
    #[serde(default)]
    pub value: serde_json::Value,
}

/// The user state a leaf condition is evaluated against.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ConditionUser<'a> {
    pub attributes: &'a Attributes,
    pub qualified_segments: &'a [String],
}

impl LeafCondition {
    pub(crate) fn evaluate(&self, user: &ConditionUser<'_>) -> Option<bool> {
        if self.condition_type != CUSTOM_ATTRIBUTE_TYPE
            && self.condition_type != THIRD_PARTY_DIMENSION_TYPE
        {
            log::debug!(target: "splitstream",
                "condition for attribute \"{}\" has unknown type \"{}\", skipping",
                self.name, self.condition_type);
            return None;
        }

        let attribute = user.attributes.get(&self.name);
        match self.match_type.as_deref().unwrap_or("exact") {
            "exact" => self.exact(attribute),
            "exists" => Some(attribute.is_some_and(|value| !value.is_null())),
            "substring" => self.substring(attribute),
            "gt" => self.numeric(attribute, |user, condition| user > condition),
            "ge" => self.numeric(attribute, |user, condition| user >= condition),
            "lt" => self.numeric(attribute, |user, condition| user < condition),
            "le" => self.numeric(attribute, |user, condition| user <= condition),
            "semver_eq" => self.semver(attribute, |ord| ord == Ordering::Equal),
            "semver_gt" => self.semver(attribute, |ord| ord == Ordering::Greater),
            "semver_ge" => self.semver(attribute, |ord| ord != Ordering::Less),
            "semver_lt" => self.semver(attribute, |ord| ord == Ordering::Less),
            "semver_le" => self.semver(attribute, |ord| ord != Ordering::Greater),
            "qualified" => self.qualified(user.qualified_segments),
            unknown => {
                log::debug!(target: "splitstream",
                    "condition for attribute \"{}\" has unknown match \"{unknown}\", skipping",
                    self.name);
                None
            }
        }
    }

    /// Structural equality requiring both sides to be the same value class
    /// (string, boolean, or valid number). Integers and floats are one
    /// numeric class.
    fn exact(&self, attribute: Option<&AttributeValue>) -> Option<bool> {
        match (&self.value, attribute?) {
            (serde_json::Value::String(condition), AttributeValue::String(user)) => {
                Some(condition == user)
            }
            (serde_json::Value::Bool(condition), AttributeValue::Boolean(user)) => {
                Some(condition == user)
            }
            (serde_json::Value::Number(condition), AttributeValue::Number(user)) => {
                let condition = condition.as_f64()?;
                (is_valid_number(condition) && is_valid_number(*user))
                    .then(|| condition == *user)
            }
            _ => None,
        }
    }

    fn substring(&self, attribute: Option<&AttributeValue>) -> Option<bool> {
        let condition = self.value.as_str()?;
        let user = attribute?.as_str()?;
        Some(user.contains(condition))
    }

    fn numeric(
        &self,
        attribute: Option<&AttributeValue>,
        compare: impl Fn(f64, f64) -> bool,
    ) -> Option<bool> {
        let condition = self.value.as_f64().filter(|n| is_valid_number(*n))?;
        let user = attribute?.as_number().filter(|n| is_valid_number(*n))?;
        Some(compare(user, condition))
    }

    fn semver(
        &self,
        attribute: Option<&AttributeValue>,
        accept: impl Fn(Ordering) -> bool,
    ) -> Option<bool> {
        let target = self.value.as_str()?;
        let user = attribute?.as_str()?;
        compare_versions(user, target).map(accept)
    }

    fn qualified(&self, qualified_segments: &[String]) -> Option<bool> {
        let segment = self.value.as_str()?;
        Some(qualified_segments.iter().any(|s| s == segment))
    }
}

fn is_valid_number(value: f64) -> bool {
    value.is_finite() && value.abs() <= MAX_NUMBER_LIMIT
}

fn is_pre_release(version: &str) -> bool {
    match (version.find('-'), version.find('+')) {
        (Some(dash), Some(plus)) => dash < plus,
        (Some(_), None) => true,
        _ => false,
    }
}

fn is_build(version: &str) -> bool {
    match (version.find('-'), version.find('+')) {
        (Some(dash), Some(plus)) => plus < dash,
        (None, Some(_)) => true,
        _ => false,
    }
}

/// Split a version into comparable components: up to three numeric dotted
/// components plus an optional pre-release/build suffix as the final
/// component. Returns `None` for versions that cannot be compared.
fn split_version(version: &str) -> Option<Vec<&str>> {
    if version.contains(' ') {
        return None;
    }

    let (prefix, suffix) = if is_pre_release(version) {
        version.split_once('-').map(|(p, s)| (p, Some(s)))?
    } else if is_build(version) {
        version.split_once('+').map(|(p, s)| (p, Some(s)))?
    } else {
        (version, None)
    };

    if prefix.matches('.').count() > 2 {
        return None;
    }
    let mut parts: Vec<&str> = prefix.split('.').collect();
    if parts
        .iter()
        .any(|part| part.is_empty() || !part.chars().all(|c| c.is_ascii_digit()))
    {
        return None;
    }
    match suffix {
        Some("") => return None,
        Some(suffix) => parts.push(suffix),
        None => {}
    }
    Some(parts)
}

/// Compare a user-reported version against a target version, component by
/// component.
///
/// Targets may be partial ("1.2" matches any "1.2.x"); a pre-release sorts
/// before its release at the same core version. Returns `None` when either
/// side fails to parse.
pub(crate) fn compare_versions(user: &str, target: &str) -> Option<Ordering> {
    let target_parts = split_version(target)?;
    let user_parts = split_version(user)?;

    for (idx, target_part) in target_parts.iter().enumerate() {
        let Some(user_part) = user_parts.get(idx) else {
            // The user version has fewer components than the target. A
            // partial user version outranks a pre-release target ("1.2.3" vs
            // "1.2.3-beta") and underranks a longer release target.
            return Some(if is_pre_release(target) {
                Ordering::Greater
            } else {
                Ordering::Less
            });
        };
        let ordering = match (user_part.parse::<u64>(), target_part.parse::<u64>()) {
            (Ok(user), Ok(target)) => user.cmp(&target),
            // Pre-release/build suffixes compare lexically.
            _ => user_part.cmp(target_part),
        };
        if ordering != Ordering::Equal {
            return Some(ordering);
        }
    }

    if is_pre_release(user) && !is_pre_release(target) {
        return Some(Ordering::Less);
    }
    Some(Ordering::Equal)
}

/// Error produced while parsing a condition tree out of a datafile.
#[derive(thiserror::Error, Debug, Clone)]
pub enum ConditionParseError {
    #[error("empty condition list")]
    EmptyConditionList,

    #[error("invalid condition leaf: {0}")]
    InvalidLeaf(String),

    #[error("malformed condition JSON: {0}")]
    Json(String),
}

impl From<serde_json::Error> for ConditionParseError {
    fn from(err: serde_json::Error) -> Self {
        ConditionParseError::Json(err.to_string())
    }
}

fn parse_tree<L, P>(
    value: &serde_json::Value,
    parse_leaf: &P,
) -> Result<ConditionTree<L>, ConditionParseError>
where
    P: Fn(&serde_json::Value) -> Result<L, ConditionParseError>,
{
    let serde_json::Value::Array(items) = value else {
        return parse_leaf(value).map(ConditionTree::Leaf);
    };

    let (operator, operands) = match items.first() {
        Some(serde_json::Value::String(op)) if op == "and" || op == "or" || op == "not" => {
            (op.as_str(), &items[1..])
        }
        // The operator may be left implicit; it means "or".
        Some(_) => ("or", &items[..]),
        None => return Err(ConditionParseError::EmptyConditionList),
    };

    let children = operands
        .iter()
        .map(|operand| parse_tree(operand, parse_leaf))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(match operator {
        "and" => ConditionTree::And(children),
        "not" => ConditionTree::Not(children),
        _ => ConditionTree::Or(children),
    })
}

/// Parse an audience's condition tree. Legacy datafiles carry the tree as a
/// JSON-encoded string; newer ones embed the array directly.
pub(crate) fn parse_attribute_conditions(
    value: &serde_json::Value,
) -> Result<ConditionTree<LeafCondition>, ConditionParseError> {
    let parsed;
    let value = match value {
        serde_json::Value::String(text) => {
            parsed = serde_json::from_str(text)?;
            &parsed
        }
        other => other,
    };
    parse_tree(value, &|leaf| match leaf {
        leaf @ serde_json::Value::Object(_) => {
            serde_json::from_value(leaf.clone()).map_err(ConditionParseError::from)
        }
        other => Err(ConditionParseError::InvalidLeaf(other.to_string())),
    })
}

/// Parse an experiment's `audienceConditions` tree, whose leaves are
/// audience ids.
pub(crate) fn parse_audience_conditions(
    value: &serde_json::Value,
) -> Result<ConditionTree<String>, ConditionParseError> {
    parse_tree(value, &|leaf| match leaf {
        serde_json::Value::String(id) => Ok(id.clone()),
        serde_json::Value::Number(id) => Ok(id.to_string()),
        other => Err(ConditionParseError::InvalidLeaf(other.to_string())),
    })
}
