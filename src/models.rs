//! Data model for flag and segment configuration documents.
//!
//! These mirror the JSON schema delivered by the streaming and polling
//! endpoints. Fields the evaluator cannot trust at the type level (variation
//! indices, rollout contents) stay loosely typed here and are validated
//! during evaluation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// A full feature flag document.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureFlag {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub on: bool,
    #[serde(default)]
    pub salt: String,
    #[serde(default)]
    pub variations: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub off_variation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallthrough: Option<VariationOrRollout>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<Target>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<FlagRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prerequisites: Vec<Prerequisite>,
    #[serde(default)]
    pub track_events: bool,
    #[serde(default)]
    pub track_events_fallthrough: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_events_until_date: Option<f64>,
    #[serde(flatten)]
    pub visibility: ClientVisibility,
}

impl FeatureFlag {
    /// True when the flag currently wants debug events, judged against the
    /// given unix-millisecond clock value.
    pub fn debugging_until(&self, now: f64) -> bool {
        match self.debug_events_until_date {
            Some(until) => until > now,
            None => false,
        }
    }
}

/// Client-side availability, which exists in two JSON schemas.
///
/// The legacy schema is a single `clientSide` bool; the explicit schema is a
/// `clientSideAvailability` object. Which one was present is recorded by
/// which field is populated, so re-serialization round-trips the original
/// shape.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ClientVisibility {
    #[serde(
        rename = "clientSide",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_side: Option<bool>,
    #[serde(
        rename = "clientSideAvailability",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub client_side_availability: Option<ClientSideAvailability>,
}

impl ClientVisibility {
    pub fn using_environment_id(&self) -> bool {
        match &self.client_side_availability {
            Some(explicit) => explicit.using_environment_id,
            None => self.client_side.unwrap_or(false),
        }
    }

    pub fn using_mobile_key(&self) -> bool {
        match &self.client_side_availability {
            Some(explicit) => explicit.using_mobile_key,
            // the old schema always assumed mobile availability
            None => true,
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientSideAvailability {
    #[serde(default)]
    pub using_environment_id: bool,
    #[serde(default)]
    pub using_mobile_key: bool,
}

/// Individual user targeting: any of `values` selects `variation`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub values: Vec<String>,
    pub variation: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Prerequisite {
    pub key: String,
    pub variation: i64,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(flatten)]
    pub variation_or_rollout: VariationOrRollout,
    #[serde(default)]
    pub track_events: bool,
}

/// One predicate inside a rule. The operator is kept as a plain string so an
/// operator this SDK does not know about degrades to a non-match instead of
/// a parse failure.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Clause {
    #[serde(default)]
    pub attribute: String,
    #[serde(default)]
    pub op: String,
    #[serde(default)]
    pub values: Vec<Value>,
    #[serde(default)]
    pub negate: bool,
}

/// Either a fixed variation index or a weighted rollout.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VariationOrRollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollout: Option<Rollout>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Rollout {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
    #[serde(default)]
    pub variations: Vec<WeightedVariation>,
}

impl Rollout {
    pub fn is_experiment(&self) -> bool {
        self.kind.as_deref() == Some("experiment")
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WeightedVariation {
    pub variation: i64,
    #[serde(default)]
    pub weight: f64,
    #[serde(default)]
    pub untracked: bool,
}

/// A user segment: explicit inclusion/exclusion plus rules.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub key: String,
    #[serde(default)]
    pub version: u64,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub salt: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub included: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub excluded: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<SegmentRule>,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SegmentRule {
    #[serde(default)]
    pub clauses: Vec<Clause>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_by: Option<String>,
}

/// The full data set delivered by a `put` message or a poll response.
///
/// Older store payloads use `features` where the wire uses `flags`; both
/// spellings are accepted.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AllData {
    #[serde(default, alias = "features")]
    pub flags: HashMap<String, FeatureFlag>,
    #[serde(default)]
    pub segments: HashMap<String, Segment>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_minimal_flag() {
        let flag: FeatureFlag = serde_json::from_value(json!({
            "key": "flag",
            "version": 2,
            "on": true,
            "salt": "abc",
            "variations": [true, false],
            "fallthrough": {"variation": 0},
            "offVariation": 1
        }))
        .expect("flag should parse");

        assert_eq!(flag.key, "flag");
        assert_eq!(flag.version, 2);
        assert_eq!(flag.off_variation, Some(1));
        assert_eq!(
            flag.fallthrough.as_ref().and_then(|f| f.variation),
            Some(0)
        );
        assert!(!flag.deleted);
    }

    #[test]
    fn null_off_variation_parses_as_absent() {
        let flag: FeatureFlag = serde_json::from_value(json!({
            "key": "flag",
            "offVariation": null,
            "variations": ["a", "b"]
        }))
        .expect("flag should parse");

        assert_eq!(flag.off_variation, None);
    }

    #[test]
    fn client_side_schema_round_trips() {
        let legacy: FeatureFlag = serde_json::from_value(json!({
            "key": "legacy",
            "clientSide": true
        }))
        .expect("legacy flag should parse");
        assert!(legacy.visibility.using_environment_id());
        assert!(legacy.visibility.using_mobile_key());
        let out = serde_json::to_value(&legacy).expect("serialize");
        assert_eq!(out.get("clientSide"), Some(&json!(true)));
        assert!(out.get("clientSideAvailability").is_none());

        let explicit: FeatureFlag = serde_json::from_value(json!({
            "key": "explicit",
            "clientSideAvailability": {"usingEnvironmentId": false, "usingMobileKey": true}
        }))
        .expect("explicit flag should parse");
        assert!(!explicit.visibility.using_environment_id());
        assert!(explicit.visibility.using_mobile_key());
        let out = serde_json::to_value(&explicit).expect("serialize");
        assert!(out.get("clientSide").is_none());
        assert_eq!(
            out.pointer("/clientSideAvailability/usingMobileKey"),
            Some(&json!(true))
        );
    }

    #[test]
    fn rule_reads_inline_variation_or_rollout() {
        let rule: FlagRule = serde_json::from_value(json!({
            "id": "rule-1",
            "clauses": [{"attribute": "email", "op": "in", "values": ["x@y.z"]}],
            "rollout": {
                "kind": "experiment",
                "seed": 42,
                "variations": [{"variation": 0, "weight": 100000}]
            }
        }))
        .expect("rule should parse");

        let rollout = rule.variation_or_rollout.rollout.expect("rollout");
        assert!(rollout.is_experiment());
        assert_eq!(rollout.seed, Some(42));
        assert_eq!(rollout.variations.len(), 1);
    }

    #[test]
    fn all_data_accepts_both_flag_spellings() {
        let wire: AllData = serde_json::from_value(json!({
            "flags": {"f": {"key": "f"}},
            "segments": {"s": {"key": "s"}}
        }))
        .expect("wire payload");
        assert!(wire.flags.contains_key("f"));
        assert!(wire.segments.contains_key("s"));

        let store: AllData = serde_json::from_value(json!({
            "features": {"f": {"key": "f"}}
        }))
        .expect("store payload");
        assert!(store.flags.contains_key("f"));
        assert!(store.segments.is_empty());
    }
}
