//! Feature-flag definitions, wire shapes, and cached snapshots.
//!
//! Definitions arrive from `/api/feature_flag/local_evaluation` and are held
//! in an immutable [`FlagCache`] snapshot that readers clone cheaply. The
//! polymorphism of a flag (boolean vs multivariate, person- vs group-scoped)
//! is modelled with explicit typed fields rather than raw JSON maps.

pub mod matcher;
pub(crate) mod poller;

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Outcome of a flag evaluation: a plain boolean or a variant key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Variant(String),
}

impl FlagValue {
    /// Truthiness used for `$active_feature_flags` and
    /// [`feature_enabled`](crate::Client::feature_enabled): `false` and the
    /// empty string are not active.
    pub fn is_active(&self) -> bool {
        match self {
            FlagValue::Bool(enabled) => *enabled,
            FlagValue::Variant(variant) => !variant.is_empty(),
        }
    }

    pub(crate) fn as_property(&self) -> Value {
        match self {
            FlagValue::Bool(enabled) => Value::Bool(*enabled),
            FlagValue::Variant(variant) => Value::String(variant.clone()),
        }
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlagValue::Bool(enabled) => write!(f, "{enabled}"),
            FlagValue::Variant(variant) => f.write_str(variant),
        }
    }
}

/// Comparison applied by a single property matcher.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    #[default]
    Exact,
    IsNot,
    Icontains,
    NotIcontains,
    Regex,
    NotRegex,
    Gt,
    Gte,
    Lt,
    Lte,
    IsSet,
    IsNotSet,
}

/// Which property bag a matcher reads from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyKind {
    #[default]
    Person,
    Group,
    Cohort,
}

/// One property matcher inside a condition.
#[derive(Clone, Debug, Deserialize)]
pub struct FlagProperty {
    pub key: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
    #[serde(rename = "type", default)]
    pub kind: PropertyKind,
    /// Group type whose properties a `group`-kind matcher reads.
    #[serde(default)]
    pub group_type: Option<String>,
}

/// One OR'd condition: every property matcher must pass, then the optional
/// rollout gate applies.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct FlagCondition {
    #[serde(default)]
    pub properties: Vec<FlagProperty>,
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    /// Variant forced for users matched by this condition; must name a
    /// declared variant to take effect.
    #[serde(default)]
    pub variant: Option<String>,
}

/// A declared variant of a multivariate flag.
#[derive(Clone, Debug, Deserialize)]
pub struct FlagVariant {
    pub key: String,
    #[serde(default)]
    pub rollout_percentage: f64,
}

/// Variant set of a multivariate flag; percentages sum to 100.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct Multivariate {
    #[serde(default)]
    pub variants: Vec<FlagVariant>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct FlagFilters {
    /// When set, the flag is scoped to this group type and rolls out by
    /// group key instead of distinct id.
    #[serde(default)]
    pub aggregation_group_type: Option<String>,
    #[serde(default)]
    pub groups: Vec<FlagCondition>,
    #[serde(default)]
    pub multivariate: Option<Multivariate>,
}

/// A single flag definition as served by the flag API.
#[derive(Clone, Debug, Deserialize)]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default = "default_active")]
    pub active: bool,
    /// Flag-level rollout used when no conditions are declared.
    #[serde(default)]
    pub rollout_percentage: Option<f64>,
    #[serde(default)]
    pub filters: FlagFilters,
}

fn default_active() -> bool {
    true
}

/// Immutable snapshot of flag definitions plus a monotonic version.
#[derive(Clone, Debug, Default)]
pub struct FlagCache {
    flags: HashMap<String, FeatureFlag>,
    version: u64,
}

impl FlagCache {
    pub(crate) fn new(flags: Vec<FeatureFlag>, version: u64) -> Self {
        let flags = flags
            .into_iter()
            .map(|flag| (flag.key.clone(), flag))
            .collect();
        Self { flags, version }
    }

    pub fn get(&self, key: &str) -> Option<&FeatureFlag> {
        self.flags.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FeatureFlag> {
        self.flags.values()
    }

    pub fn len(&self) -> usize {
        self.flags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flags.is_empty()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}

/// Wire shape of `GET /api/feature_flag/local_evaluation`.
#[derive(Debug, Deserialize)]
pub struct LocalEvaluationResponse {
    #[serde(default)]
    pub flags: Vec<FeatureFlag>,
}

/// Wire shape of `POST /decide/?v=2`.
#[derive(Debug, Deserialize)]
pub struct DecideResponse {
    #[serde(rename = "featureFlags", default)]
    pub feature_flags: HashMap<String, FlagValue>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn definition_document_parses() {
        let document = json!({
            "flags": [
                {
                    "key": "beta-feature",
                    "active": true,
                    "filters": {
                        "groups": [
                            {
                                "properties": [
                                    {
                                        "key": "email",
                                        "operator": "icontains",
                                        "value": "@posthog.com",
                                        "type": "person"
                                    }
                                ],
                                "rollout_percentage": 100
                            }
                        ],
                        "multivariate": null
                    }
                },
                {
                    "key": "simple-flag",
                    "rollout_percentage": 50
                }
            ]
        });
        let parsed: LocalEvaluationResponse =
            serde_json::from_value(document).expect("document parses");
        assert_eq!(parsed.flags.len(), 2);

        let beta = &parsed.flags[0];
        assert!(beta.active);
        let condition = &beta.filters.groups[0];
        assert_eq!(condition.rollout_percentage, Some(100.0));
        let matcher = &condition.properties[0];
        assert_eq!(matcher.operator, Operator::Icontains);
        assert_eq!(matcher.kind, PropertyKind::Person);

        let simple = &parsed.flags[1];
        assert!(simple.active, "active defaults to true");
        assert_eq!(simple.rollout_percentage, Some(50.0));
        assert!(simple.filters.groups.is_empty());
    }

    #[test]
    fn decide_response_mixes_booleans_and_variants() {
        let parsed: DecideResponse = serde_json::from_value(json!({
            "featureFlags": {"a": true, "b": "second-variant", "c": false}
        }))
        .expect("response parses");
        assert_eq!(parsed.feature_flags["a"], FlagValue::Bool(true));
        assert_eq!(
            parsed.feature_flags["b"],
            FlagValue::Variant("second-variant".to_owned())
        );
        assert_eq!(parsed.feature_flags["c"], FlagValue::Bool(false));
    }

    #[test]
    fn empty_string_and_false_are_not_active() {
        assert!(FlagValue::Variant("control".to_owned()).is_active());
        assert!(FlagValue::Bool(true).is_active());
        assert!(!FlagValue::Bool(false).is_active());
        assert!(!FlagValue::Variant(String::new()).is_active());
    }

    #[test]
    fn cache_snapshot_indexes_by_key() {
        let flags = vec![
            FeatureFlag {
                key: "one".to_owned(),
                active: true,
                rollout_percentage: None,
                filters: FlagFilters::default(),
            },
            FeatureFlag {
                key: "two".to_owned(),
                active: false,
                rollout_percentage: None,
                filters: FlagFilters::default(),
            },
        ];
        let cache = FlagCache::new(flags, 7);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.version(), 7);
        assert!(cache.get("one").is_some());
        assert!(cache.get("missing").is_none());
    }
}
