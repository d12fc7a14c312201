use std::collections::HashMap;

use derive_more::From;
use serde::{Deserialize, Serialize};

/// Reserved attribute carrying an explicit bucketing id. When present (and a
/// string), its value is hashed instead of the user id.
pub const BUCKETING_ID_ATTRIBUTE: &str = "$opt_bucketing_id";

/// Reserved attribute appended to event payloads when the datafile carries a
/// bot-filtering flag.
pub const BOT_FILTERING_ATTRIBUTE: &str = "$opt_bot_filtering";

/// Type alias for a map of user attributes.
///
/// Keys are attribute names as they appear in the datafile.
///
/// # Examples
/// ```
/// # use splitstream::{Attributes, AttributeValue};
/// let attributes = [
///     ("age".to_owned(), 30.0.into()),
///     ("is_premium_member".to_owned(), true.into()),
///     ("username".to_owned(), "john_doe".into()),
/// ].into_iter().collect::<Attributes>();
/// ```
pub type Attributes = HashMap<String, AttributeValue>;

/// Value of a single user attribute.
///
/// Conveniently implements `From` conversions for `String`, `&str`, `f64`,
/// and `bool`.
#[derive(Debug, Serialize, Deserialize, PartialEq, PartialOrd, From, Clone)]
#[serde(untagged)]
pub enum AttributeValue {
    /// A string value.
    #[from(ignore)]
    String(String),
    /// A numeric value. Integers and floats are one class here; condition
    /// evaluation only accepts finite values with magnitude at most 2^53.
    Number(f64),
    /// A boolean value.
    Boolean(bool),
    /// A null value or absence of value.
    Null,
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> AttributeValue {
        AttributeValue::String(value.to_owned())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> AttributeValue {
        AttributeValue::String(value)
    }
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            AttributeValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            AttributeValue::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }

    pub(crate) fn to_json(&self) -> serde_json::Value {
        match self {
            AttributeValue::String(s) => serde_json::Value::String(s.clone()),
            AttributeValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            AttributeValue::Boolean(b) => serde_json::Value::Bool(*b),
            AttributeValue::Null => serde_json::Value::Null,
        }
    }
}

/// Extract the bucketing id for a user: the value of `$opt_bucketing_id`
/// when present and a string, else the user id. A non-string value for the
/// reserved attribute is ignored.
pub(crate) fn bucketing_id<'a>(user_id: &'a str, attributes: &'a Attributes) -> &'a str {
    match attributes.get(BUCKETING_ID_ATTRIBUTE) {
        None => user_id,
        Some(AttributeValue::String(s)) => s,
        Some(_) => {
            log::warn!(target: "splitstream", "bucketing id attribute is not a string, falling back to user id");
            user_id
        }
    }
}
