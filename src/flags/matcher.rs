//! Deterministic local evaluation of flag definitions.
//!
//! [`evaluate`] is a pure function: the same definition, identifier, and
//! property bags always produce the same result, and the rollout hash is
//! stable across SDK implementations. When a definition references data the
//! caller did not supply (a missing property, a cohort), the result is
//! [`Match::Undecidable`] and the caller falls back to remote evaluation.

use std::collections::{HashMap, HashSet};

use log::debug;
use regex::Regex;
use serde_json::Value;
use sha1::{Digest, Sha1};

use super::{
    FeatureFlag, FlagCache, FlagCondition, FlagProperty, FlagValue, FlagVariant, Operator,
    PropertyKind,
};
use crate::event::Properties;

/// Result of a local evaluation attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Match {
    Decided(FlagValue),
    /// The definition cannot be resolved from the supplied data alone.
    Undecidable,
}

/// Denominator mapping the first 60 bits of the rollout hash onto [0, 1].
const LONG_SCALE: f64 = 0xFFF_FFFF_FFFF_FFFF_u64 as f64;

enum ConditionOutcome {
    Matched,
    Missed,
    Inconclusive,
}

enum PropertyOutcome {
    Pass,
    Fail,
    Missing,
}

/// Evaluate one flag against the supplied identifier and property bags.
pub fn evaluate(
    flag: &FeatureFlag,
    distinct_id: &str,
    groups: &HashMap<String, String>,
    person_properties: &Properties,
    group_properties: &HashMap<String, Properties>,
) -> Match {
    if !flag.active {
        return Match::Decided(FlagValue::Bool(false));
    }

    // Group-scoped flags roll out by group key, not distinct id.
    let hash_key = match &flag.filters.aggregation_group_type {
        Some(group_type) => match groups.get(group_type) {
            Some(group_key) => group_key.as_str(),
            None => {
                debug!(
                    "flag {} is scoped to group type {group_type} but no such group was supplied",
                    flag.key
                );
                return Match::Decided(FlagValue::Bool(false));
            }
        },
        None => distinct_id,
    };

    let simple_condition;
    let conditions: &[FlagCondition] = if flag.filters.groups.is_empty() {
        simple_condition = [FlagCondition {
            properties: Vec::new(),
            rollout_percentage: flag.rollout_percentage,
            variant: None,
        }];
        &simple_condition
    } else {
        &flag.filters.groups
    };

    let mut inconclusive = false;
    for condition in conditions {
        match match_condition(flag, condition, hash_key, person_properties, group_properties) {
            ConditionOutcome::Matched => {
                return Match::Decided(select_value(flag, condition, hash_key));
            }
            ConditionOutcome::Missed => {}
            ConditionOutcome::Inconclusive => inconclusive = true,
        }
    }
    if inconclusive {
        Match::Undecidable
    } else {
        Match::Decided(FlagValue::Bool(false))
    }
}

/// Evaluate every cached flag; undecidable keys are returned separately so
/// the caller can resolve them remotely.
pub fn evaluate_all(
    cache: &FlagCache,
    distinct_id: &str,
    groups: &HashMap<String, String>,
    person_properties: &Properties,
    group_properties: &HashMap<String, Properties>,
) -> (HashMap<String, FlagValue>, HashSet<String>) {
    let mut decided = HashMap::new();
    let mut undecidable = HashSet::new();
    for flag in cache.iter() {
        match evaluate(flag, distinct_id, groups, person_properties, group_properties) {
            Match::Decided(value) => {
                decided.insert(flag.key.clone(), value);
            }
            Match::Undecidable => {
                undecidable.insert(flag.key.clone());
            }
        }
    }
    (decided, undecidable)
}

fn match_condition(
    flag: &FeatureFlag,
    condition: &FlagCondition,
    hash_key: &str,
    person_properties: &Properties,
    group_properties: &HashMap<String, Properties>,
) -> ConditionOutcome {
    // A matcher that is definitely false decides the condition no matter
    // what order the matchers are declared in; missing data only makes the
    // condition inconclusive when nothing failed outright.
    let mut missing = false;
    for property in &condition.properties {
        let bag = match property.kind {
            PropertyKind::Person => person_properties,
            PropertyKind::Group => {
                let Some(bag) = property
                    .group_type
                    .as_deref()
                    .and_then(|group_type| group_properties.get(group_type))
                else {
                    missing = true;
                    continue;
                };
                bag
            }
            PropertyKind::Cohort => {
                missing = true;
                continue;
            }
        };
        match match_property(property, bag) {
            PropertyOutcome::Pass => {}
            PropertyOutcome::Fail => return ConditionOutcome::Missed,
            PropertyOutcome::Missing => missing = true,
        }
    }
    if missing {
        return ConditionOutcome::Inconclusive;
    }
    let in_rollout = match condition.rollout_percentage {
        None => true,
        Some(percentage) => hash(&flag.key, hash_key, "") <= percentage / 100.0,
    };
    if in_rollout {
        ConditionOutcome::Matched
    } else {
        ConditionOutcome::Missed
    }
}

fn match_property(property: &FlagProperty, bag: &Properties) -> PropertyOutcome {
    let actual = bag.get(&property.key);
    let expected = &property.value;
    let pass = match (property.operator, actual) {
        (Operator::IsSet, actual) => actual.is_some(),
        (Operator::IsNotSet, actual) => actual.is_none(),
        (_, None) => return PropertyOutcome::Missing,
        (Operator::Exact, Some(actual)) => any_of(expected, actual),
        (Operator::IsNot, Some(actual)) => !any_of(expected, actual),
        (Operator::Icontains, Some(actual)) => icontains(expected, actual),
        (Operator::NotIcontains, Some(actual)) => !icontains(expected, actual),
        // An invalid pattern makes the matcher false, negated or not.
        (Operator::Regex, Some(actual)) => regex_match(expected, actual).unwrap_or(false),
        (Operator::NotRegex, Some(actual)) => {
            regex_match(expected, actual).map(|hit| !hit).unwrap_or(false)
        }
        (Operator::Gt, Some(actual)) => numeric(actual, expected, |lhs, rhs| lhs > rhs),
        (Operator::Gte, Some(actual)) => numeric(actual, expected, |lhs, rhs| lhs >= rhs),
        (Operator::Lt, Some(actual)) => numeric(actual, expected, |lhs, rhs| lhs < rhs),
        (Operator::Lte, Some(actual)) => numeric(actual, expected, |lhs, rhs| lhs <= rhs),
    };
    if pass {
        PropertyOutcome::Pass
    } else {
        PropertyOutcome::Fail
    }
}

fn select_value(flag: &FeatureFlag, condition: &FlagCondition, hash_key: &str) -> FlagValue {
    let variants = flag
        .filters
        .multivariate
        .as_ref()
        .map(|multivariate| multivariate.variants.as_slice())
        .unwrap_or_default();
    if variants.is_empty() {
        return FlagValue::Bool(true);
    }
    if let Some(forced) = &condition.variant {
        if variants.iter().any(|variant| &variant.key == forced) {
            return FlagValue::Variant(forced.clone());
        }
    }
    match select_variant(variants, &flag.key, hash_key) {
        Some(variant) => FlagValue::Variant(variant),
        None => FlagValue::Bool(true),
    }
}

fn select_variant(variants: &[FlagVariant], flag_key: &str, hash_key: &str) -> Option<String> {
    let position = hash(flag_key, hash_key, "variant") * 100.0;
    let mut cumulative = 0.0;
    for variant in variants {
        cumulative += variant.rollout_percentage;
        if position < cumulative {
            return Some(variant.key.clone());
        }
    }
    None
}

/// Stable position of `hash_key` in the unit interval for this flag.
fn hash(flag_key: &str, hash_key: &str, salt: &str) -> f64 {
    let mut hasher = Sha1::new();
    hasher.update(format!("{flag_key}.{hash_key}.{salt}").as_bytes());
    let digest = hasher.finalize();
    let mut hex = String::with_capacity(16);
    for byte in digest.iter().take(8) {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(15);
    let value = u64::from_str_radix(&hex, 16).unwrap_or(0);
    value as f64 / LONG_SCALE
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

/// Scalar expectations compare by canonical string; lists mean "any of".
fn any_of(expected: &Value, actual: &Value) -> bool {
    match expected {
        Value::Array(values) => values
            .iter()
            .any(|value| stringify(value) == stringify(actual)),
        value => stringify(value) == stringify(actual),
    }
}

fn icontains(expected: &Value, actual: &Value) -> bool {
    stringify(actual)
        .to_lowercase()
        .contains(&stringify(expected).to_lowercase())
}

/// Full-match semantics; `None` when the pattern does not compile.
fn regex_match(expected: &Value, actual: &Value) -> Option<bool> {
    let pattern = stringify(expected);
    let regex = Regex::new(&format!("^(?:{pattern})$")).ok()?;
    Some(regex.is_match(&stringify(actual)))
}

fn numeric(actual: &Value, expected: &Value, compare: impl Fn(f64, f64) -> bool) -> bool {
    match (as_float(actual), as_float(expected)) {
        (Some(lhs), Some(rhs)) => compare(lhs, rhs),
        _ => false,
    }
}

fn as_float(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}
