// Automation Conditions - Guard predicates evaluated before a rule's actions run

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    #[serde(alias = "eq")]
    Equals,
    #[serde(alias = "ne")]
    NotEquals,
    #[serde(alias = "greater_than")]
    Gt,
    #[serde(alias = "less_than")]
    Lt,
    Contains,
    NotContains,
    Exists,
    NotExists,
    In,
    NotIn,
}

impl ConditionOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Equals => "equals",
            Self::NotEquals => "not_equals",
            Self::Gt => "gt",
            Self::Lt => "lt",
            Self::Contains => "contains",
            Self::NotContains => "not_contains",
            Self::Exists => "exists",
            Self::NotExists => "not_exists",
            Self::In => "in",
            Self::NotIn => "not_in",
        }
    }

    fn takes_value(&self) -> bool {
        !matches!(self, Self::Exists | Self::NotExists)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum LogicalOperator {
    #[default]
    #[serde(rename = "AND", alias = "and")]
    And,
    #[serde(rename = "OR", alias = "or")]
    Or,
}

impl LogicalOperator {
    fn combine(self, left: bool, right: bool) -> bool {
        match self {
            Self::And => left && right,
            Self::Or => left || right,
        }
    }
}

/// Values computed at evaluation time, never cached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "fn", rename_all = "snake_case")]
pub enum DynamicValue {
    Now,
    Today,
    DaysAgo { days: i64 },
    DaysFromNow { days: i64 },
}

impl DynamicValue {
    pub fn resolve(&self, now: DateTime<Utc>) -> Value {
        match self {
            Self::Now => Value::String(now.to_rfc3339()),
            Self::Today => Value::String(now.date_naive().to_string()),
            Self::DaysAgo { days } => Value::String((now - Duration::days(*days)).to_rfc3339()),
            Self::DaysFromNow { days } => Value::String((now + Duration::days(*days)).to_rfc3339()),
        }
    }
}

/// Where the comparison value comes from
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "source", content = "value", rename_all = "snake_case")]
pub enum ConditionValue {
    Static(Value),
    /// Another field of the same context.
    Field(String),
    Function(DynamicValue),
}

/// A single guard on a context field
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Condition {
    /// Dot-separated path into the execution context
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Option<ConditionValue>,
    /// How this condition joins the previous one in its group
    #[serde(default)]
    pub logical_operator: LogicalOperator,
    #[serde(default)]
    pub group: Option<String>,
}

#[derive(Error, Debug, PartialEq)]
pub enum ConditionError {
    #[error("field '{0}' is missing from the context")]
    MissingField(String),
    #[error("condition on '{field}' with operator {operator} has no comparison value")]
    MissingValue { field: String, operator: &'static str },
    #[error("referenced field '{0}' is missing from the context")]
    UnresolvedReference(String),
    #[error("cannot apply {operator} to '{field}': {detail}")]
    TypeMismatch {
        field: String,
        operator: &'static str,
        detail: String,
    },
}

impl Condition {
    pub fn new(field: &str, operator: ConditionOperator, value: Option<ConditionValue>) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value,
            logical_operator: LogicalOperator::And,
            group: None,
        }
    }

    pub fn equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::Equals, Some(ConditionValue::Static(value)))
    }

    pub fn not_equals(field: &str, value: Value) -> Self {
        Self::new(field, ConditionOperator::NotEquals, Some(ConditionValue::Static(value)))
    }

    pub fn greater_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::Gt, Some(ConditionValue::Static(serde_json::json!(value))))
    }

    pub fn less_than(field: &str, value: f64) -> Self {
        Self::new(field, ConditionOperator::Lt, Some(ConditionValue::Static(serde_json::json!(value))))
    }

    pub fn contains(field: &str, value: &str) -> Self {
        Self::new(field, ConditionOperator::Contains, Some(ConditionValue::Static(Value::String(value.to_string()))))
    }

    pub fn exists(field: &str) -> Self {
        Self::new(field, ConditionOperator::Exists, None)
    }

    pub fn not_exists(field: &str) -> Self {
        Self::new(field, ConditionOperator::NotExists, None)
    }

    pub fn in_list(field: &str, values: Vec<Value>) -> Self {
        Self::new(field, ConditionOperator::In, Some(ConditionValue::Static(Value::Array(values))))
    }

    pub fn before(field: &str, value: DynamicValue) -> Self {
        Self::new(field, ConditionOperator::Lt, Some(ConditionValue::Function(value)))
    }

    pub fn after(field: &str, value: DynamicValue) -> Self {
        Self::new(field, ConditionOperator::Gt, Some(ConditionValue::Function(value)))
    }

    pub fn against_field(field: &str, operator: ConditionOperator, other: &str) -> Self {
        Self::new(field, operator, Some(ConditionValue::Field(other.to_string())))
    }

    /// Join this condition to the previous one with OR.
    pub fn or(mut self) -> Self {
        self.logical_operator = LogicalOperator::Or;
        self
    }

    pub fn in_group(mut self, group: &str) -> Self {
        self.group = Some(group.to_string());
        self
    }

    /// Static shape check run when a rule is created.
    pub fn validate(&self) -> Result<(), String> {
        if self.field.trim().is_empty() {
            return Err("condition field path is empty".to_string());
        }

        match (&self.value, self.operator.takes_value()) {
            (Some(_), false) => {
                return Err(format!(
                    "operator {} on '{}' does not take a value",
                    self.operator.as_str(),
                    self.field
                ));
            }
            (None, true) => {
                return Err(format!(
                    "operator {} on '{}' needs a value",
                    self.operator.as_str(),
                    self.field
                ));
            }
            _ => {}
        }

        match (&self.operator, &self.value) {
            (_, Some(ConditionValue::Field(path))) if path.trim().is_empty() => {
                Err(format!("condition on '{}' references an empty field path", self.field))
            }
            (ConditionOperator::In | ConditionOperator::NotIn, Some(ConditionValue::Static(v)))
                if !v.is_array() =>
            {
                Err(format!("operator {} on '{}' needs an array value", self.operator.as_str(), self.field))
            }
            (ConditionOperator::In | ConditionOperator::NotIn, Some(ConditionValue::Function(_))) => {
                Err(format!("operator {} on '{}' cannot use a dynamic function", self.operator.as_str(), self.field))
            }
            (ConditionOperator::Gt | ConditionOperator::Lt, Some(ConditionValue::Static(v)))
                if as_number(v).is_none() && as_datetime(v).is_none() =>
            {
                Err(format!(
                    "operator {} on '{}' needs a number or date, got {}",
                    self.operator.as_str(),
                    self.field,
                    v
                ))
            }
            (ConditionOperator::Contains | ConditionOperator::NotContains, Some(ConditionValue::Static(v)))
                if v.is_null() || v.is_array() || v.is_object() =>
            {
                Err(format!("operator {} on '{}' needs a scalar value", self.operator.as_str(), self.field))
            }
            _ => Ok(()),
        }
    }
}

/// Evaluate `conditions` against `context` at the current wall-clock time.
///
/// Conditions are grouped by `group` (ungrouped conditions form one group).
/// Inside a group each condition joins the running result with its own
/// `logical_operator`; the group results are then joined with `group_logic`.
/// Every condition is evaluated, so one broken condition fails the whole set
/// even when the others would already decide the outcome.
pub fn evaluate(
    conditions: &[Condition],
    group_logic: LogicalOperator,
    context: &Value,
) -> Result<bool, ConditionError> {
    evaluate_at(conditions, group_logic, context, Utc::now())
}

pub fn evaluate_at(
    conditions: &[Condition],
    group_logic: LogicalOperator,
    context: &Value,
    now: DateTime<Utc>,
) -> Result<bool, ConditionError> {
    let mut groups: Vec<(Option<&str>, Vec<&Condition>)> = Vec::new();
    for condition in conditions {
        let key = condition.group.as_deref();
        match groups.iter_mut().find(|(g, _)| *g == key) {
            Some((_, members)) => members.push(condition),
            None => groups.push((key, vec![condition])),
        }
    }

    let mut outcome: Option<bool> = None;
    for (_, members) in groups {
        let mut group_result: Option<bool> = None;
        for condition in members {
            let value = evaluate_condition(condition, context, now)?;
            group_result = Some(match group_result {
                Some(acc) => condition.logical_operator.combine(acc, value),
                None => value,
            });
        }

        let group_result = group_result.unwrap_or(true);
        outcome = Some(match outcome {
            Some(acc) => group_logic.combine(acc, group_result),
            None => group_result,
        });
    }

    Ok(outcome.unwrap_or(true))
}

pub fn evaluate_condition(
    condition: &Condition,
    context: &Value,
    now: DateTime<Utc>,
) -> Result<bool, ConditionError> {
    let actual = lookup(context, &condition.field).filter(|v| !v.is_null());
    let operator = condition.operator.as_str();

    match condition.operator {
        ConditionOperator::Exists => return Ok(actual.is_some()),
        ConditionOperator::NotExists => return Ok(actual.is_none()),
        _ => {}
    }

    let actual = actual.ok_or_else(|| ConditionError::MissingField(condition.field.clone()))?;
    let expected = match &condition.value {
        Some(ConditionValue::Static(v)) => v.clone(),
        Some(ConditionValue::Field(path)) => lookup(context, path)
            .filter(|v| !v.is_null())
            .cloned()
            .ok_or_else(|| ConditionError::UnresolvedReference(path.clone()))?,
        Some(ConditionValue::Function(f)) => f.resolve(now),
        None => {
            return Err(ConditionError::MissingValue {
                field: condition.field.clone(),
                operator,
            });
        }
    };

    let mismatch = |detail: String| ConditionError::TypeMismatch {
        field: condition.field.clone(),
        operator,
        detail,
    };

    match condition.operator {
        ConditionOperator::Equals => Ok(loosely_equal(actual, &expected)),
        ConditionOperator::NotEquals => Ok(!loosely_equal(actual, &expected)),
        ConditionOperator::Gt => compare(actual, &expected)
            .map(|o| o == Ordering::Greater)
            .ok_or_else(|| mismatch(format!("{} and {} are not comparable", actual, expected))),
        ConditionOperator::Lt => compare(actual, &expected)
            .map(|o| o == Ordering::Less)
            .ok_or_else(|| mismatch(format!("{} and {} are not comparable", actual, expected))),
        ConditionOperator::Contains => contains(actual, &expected).ok_or_else(|| {
            mismatch(format!("{} cannot contain {}", actual, expected))
        }),
        ConditionOperator::NotContains => contains(actual, &expected)
            .map(|found| !found)
            .ok_or_else(|| mismatch(format!("{} cannot contain {}", actual, expected))),
        ConditionOperator::In => expected
            .as_array()
            .map(|list| list.iter().any(|v| loosely_equal(actual, v)))
            .ok_or_else(|| mismatch("comparison value is not a list".to_string())),
        ConditionOperator::NotIn => expected
            .as_array()
            .map(|list| !list.iter().any(|v| loosely_equal(actual, v)))
            .ok_or_else(|| mismatch("comparison value is not a list".to_string())),
        ConditionOperator::Exists | ConditionOperator::NotExists => unreachable!("handled above"),
    }
}

/// Resolve a dot-separated path; numeric segments index into arrays.
pub fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| match current {
        Value::Object(map) => map.get(part),
        Value::Array(items) => part.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn as_datetime(value: &Value) -> Option<DateTime<Utc>> {
    let s = value.as_str()?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    if actual == expected {
        return true;
    }
    match (as_number(actual), as_number(expected)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Some(a), Some(b)) = (as_number(actual), as_number(expected)) {
        return a.partial_cmp(&b);
    }
    match (as_datetime(actual), as_datetime(expected)) {
        (Some(a), Some(b)) => Some(a.cmp(&b)),
        _ => None,
    }
}

fn contains(actual: &Value, expected: &Value) -> Option<bool> {
    match actual {
        Value::String(haystack) => {
            let needle = match expected {
                Value::String(s) => s.clone(),
                Value::Number(n) => n.to_string(),
                Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some(haystack.to_lowercase().contains(&needle.to_lowercase()))
        }
        Value::Array(items) => Some(items.iter().any(|item| loosely_equal(item, expected))),
        _ => None,
    }
}
