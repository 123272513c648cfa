//! Flag evaluation.
//!
//! Interprets one flag document against a user, resolving prerequisite flags
//! and segments through a [DataStore], and produces the selected value, the
//! variation index, a reason, and one side record per prerequisite
//! evaluation.

use crate::{
    models::{Clause, FeatureFlag, Rollout, Segment, SegmentRule, VariationOrRollout},
    operators,
    store::{DataKind, DataStore, StoreError, StoreItem},
    user::User,
};
use hex::ToHex;
use serde::Serialize;
use serde_json::Value;
use sha1::{Digest, Sha1};
use std::sync::Arc;
use tracing::warn;

/// 2^60 - 1, the divisor turning a 15-hex-digit hash prefix into a fraction.
/// Part of the cross-SDK bucketing contract; never change it.
const BUCKET_SCALE: f64 = 1_152_921_504_606_846_975.0;

/// Why an evaluation produced its result.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Reason {
    Off,
    #[serde(rename_all = "camelCase")]
    Fallthrough {
        #[serde(skip_serializing_if = "is_false")]
        in_experiment: bool,
    },
    TargetMatch,
    #[serde(rename_all = "camelCase")]
    RuleMatch {
        rule_index: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        rule_id: Option<String>,
        #[serde(skip_serializing_if = "is_false")]
        in_experiment: bool,
    },
    #[serde(rename_all = "camelCase")]
    PrerequisiteFailed { prerequisite_key: String },
    #[serde(rename_all = "camelCase")]
    Error { error_kind: ErrorKind },
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Reason {
    pub fn is_error(&self) -> bool {
        matches!(self, Reason::Error { .. })
    }

    pub(crate) fn error(kind: ErrorKind) -> Self {
        Reason::Error { error_kind: kind }
    }
}

/// The error taxonomy surfaced through [Reason::Error].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    ClientNotReady,
    FlagNotFound,
    MalformedFlag,
    UserNotSpecified,
    WrongType,
    Exception,
}

/// The full result of one evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct Detail {
    /// The selected variation value; absent when the flag is off with no off
    /// variation, or on any error.
    pub value: Option<Value>,
    pub variation_index: Option<usize>,
    pub reason: Reason,
}

impl Detail {
    pub(crate) fn error(kind: ErrorKind) -> Self {
        Detail {
            value: None,
            variation_index: None,
            reason: Reason::error(kind),
        }
    }
}

/// A record of one prerequisite evaluation, handed to the event processor
/// alongside the top-level result.
#[derive(Clone, Debug)]
pub struct PrerequisiteEvent {
    /// Key of the flag that required the prerequisite.
    pub prereq_of: String,
    /// The prerequisite flag that was evaluated.
    pub flag: Arc<FeatureFlag>,
    pub detail: Detail,
}

enum EvalError {
    /// A schema violation reached during evaluation.
    Malformed,
    Store(StoreError),
}

impl From<StoreError> for EvalError {
    fn from(error: StoreError) -> Self {
        EvalError::Store(error)
    }
}

type EvalResult<T> = Result<T, EvalError>;

/// Evaluates flags against a [DataStore].
pub struct Evaluator<S> {
    store: S,
}

impl<S: DataStore> Evaluator<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Run the evaluation algorithm for one flag.
    ///
    /// Schema problems in the document surface as a
    /// [MalformedFlag](ErrorKind::MalformedFlag) detail; only store failures
    /// are hard errors. Prerequisite records produced before a failure are
    /// returned either way.
    pub fn evaluate(
        &self,
        flag: &FeatureFlag,
        user: &User,
    ) -> Result<(Detail, Vec<PrerequisiteEvent>), StoreError> {
        let mut scope = EvalScope {
            store: &self.store,
            user,
            events: Vec::new(),
            pending: Vec::new(),
        };
        match scope.evaluate_flag(flag) {
            Ok(detail) => Ok((detail, scope.events)),
            Err(EvalError::Malformed) => {
                Ok((Detail::error(ErrorKind::MalformedFlag), scope.events))
            }
            Err(EvalError::Store(error)) => Err(error),
        }
    }
}

/// One evaluation in flight: the user, the store, the side records collected
/// so far, and the chain of flag keys currently being resolved (used to
/// refuse prerequisite cycles).
struct EvalScope<'a, S> {
    store: &'a S,
    user: &'a User,
    events: Vec<PrerequisiteEvent>,
    pending: Vec<String>,
}

impl<'a, S: DataStore> EvalScope<'a, S> {
    fn evaluate_flag(&mut self, flag: &FeatureFlag) -> EvalResult<Detail> {
        if !flag.on {
            return self.off_value(flag, Reason::Off);
        }

        if let Some(failed_key) = self.check_prerequisites(flag)? {
            return self.off_value(
                flag,
                Reason::PrerequisiteFailed {
                    prerequisite_key: failed_key,
                },
            );
        }

        for target in &flag.targets {
            if target.values.iter().any(|v| v == self.user.key()) {
                return self.index_value(flag, target.variation, Reason::TargetMatch);
            }
        }

        for (rule_index, rule) in flag.rules.iter().enumerate() {
            if self.rule_matches(rule.clauses.as_slice())? {
                let (index, in_experiment) =
                    self.resolve_variation_or_rollout(flag, &rule.variation_or_rollout)?;
                return self.index_value(
                    flag,
                    index,
                    Reason::RuleMatch {
                        rule_index,
                        rule_id: rule.id.clone(),
                        in_experiment,
                    },
                );
            }
        }

        let fallthrough = flag.fallthrough.as_ref().ok_or(EvalError::Malformed)?;
        let (index, in_experiment) = self.resolve_variation_or_rollout(flag, fallthrough)?;
        self.index_value(flag, index, Reason::Fallthrough { in_experiment })
    }

    /// The off outcome: the off variation when one is set, otherwise an
    /// absent value. An unset off variation is not an error.
    fn off_value(&self, flag: &FeatureFlag, reason: Reason) -> EvalResult<Detail> {
        match flag.off_variation {
            Some(index) => self.index_value(flag, index, reason),
            None => Ok(Detail {
                value: None,
                variation_index: None,
                reason,
            }),
        }
    }

    /// Validate a variation index and pick the value.
    fn index_value(&self, flag: &FeatureFlag, index: i64, reason: Reason) -> EvalResult<Detail> {
        if index < 0 {
            warn!(flag = %flag.key, index, "negative variation index");
            return Err(EvalError::Malformed);
        }
        let index = index as usize;
        let value = flag.variations.get(index).ok_or_else(|| {
            warn!(flag = %flag.key, index, "variation index out of range");
            EvalError::Malformed
        })?;
        Ok(Detail {
            value: Some(value.clone()),
            variation_index: Some(index),
            reason,
        })
    }

    /// Walk the prerequisite list. Returns the key of the first unsatisfied
    /// prerequisite, or `None` when all hold. Each prerequisite found in the
    /// store is evaluated recursively and produces one side record.
    fn check_prerequisites(&mut self, flag: &FeatureFlag) -> EvalResult<Option<String>> {
        if flag.prerequisites.is_empty() {
            return Ok(None);
        }

        self.pending.push(flag.key.clone());
        let outcome = self.check_prerequisites_inner(flag);
        self.pending.pop();
        outcome
    }

    fn check_prerequisites_inner(&mut self, flag: &FeatureFlag) -> EvalResult<Option<String>> {
        for prereq in &flag.prerequisites {
            if self.pending.iter().any(|key| key == &prereq.key) {
                warn!(flag = %flag.key, prerequisite = %prereq.key, "prerequisite cycle");
                return Err(EvalError::Malformed);
            }

            let prereq_flag = match self.store.get(DataKind::Flag, &prereq.key)? {
                Some(StoreItem::Flag(prereq_flag)) => prereq_flag,
                _ => {
                    warn!(prerequisite = %prereq.key, "prerequisite flag not in store");
                    return Ok(Some(prereq.key.clone()));
                }
            };

            let detail = self.evaluate_flag(&prereq_flag)?;
            let missed = matches!(
                detail.reason,
                Reason::Off | Reason::PrerequisiteFailed { .. }
            );
            let satisfied = !missed
                && prereq_flag.on
                && prereq.variation >= 0
                && detail.variation_index == Some(prereq.variation as usize);

            self.events.push(PrerequisiteEvent {
                prereq_of: flag.key.clone(),
                flag: Arc::clone(&prereq_flag),
                detail,
            });

            if !satisfied {
                return Ok(Some(prereq.key.clone()));
            }
        }
        Ok(None)
    }

    /// A rule matches when every clause matches.
    fn rule_matches(&mut self, clauses: &[Clause]) -> EvalResult<bool> {
        for clause in clauses {
            if !self.clause_matches(clause)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn clause_matches(&mut self, clause: &Clause) -> EvalResult<bool> {
        if clause.op == "segmentMatch" {
            let mut matched = false;
            for value in &clause.values {
                let segment_key = match value.as_str() {
                    Some(key) => key,
                    None => continue,
                };
                match self.store.get(DataKind::Segment, segment_key)? {
                    Some(StoreItem::Segment(segment)) => {
                        if segment_matches(&segment, self.user) {
                            matched = true;
                            break;
                        }
                    }
                    _ => {
                        warn!(segment = %segment_key, "segment not found in store");
                    }
                }
            }
            return Ok(clause.negate != matched);
        }

        Ok(clause_matches_no_segments(clause, self.user))
    }

    /// Resolve a variation-or-rollout structure against the flag's key and
    /// salt, yielding the chosen index and whether it is an experiment.
    fn resolve_variation_or_rollout(
        &self,
        flag: &FeatureFlag,
        vor: &VariationOrRollout,
    ) -> EvalResult<(i64, bool)> {
        if let Some(index) = vor.variation {
            return Ok((index, false));
        }

        let rollout = vor.rollout.as_ref().ok_or(EvalError::Malformed)?;
        if rollout.variations.is_empty() {
            warn!(flag = %flag.key, "rollout variations must not be empty");
            return Err(EvalError::Malformed);
        }

        let mut in_experiment = rollout.is_experiment();
        let bucket = rollout_bucket(self.user, flag, rollout);

        let mut sum = 0.0;
        let mut chosen = None;
        for weighted in &rollout.variations {
            sum += weighted.weight / 100_000.0;
            chosen = Some(weighted);
            if bucket < sum {
                break;
            }
        }

        // The bucket can land past the final sum when the weights do not
        // reach 100000 or through rounding; the user then goes in the last
        // bucket rather than erroring, which would shift every other user.
        let weighted = chosen.ok_or(EvalError::Malformed)?;
        if in_experiment && weighted.untracked {
            in_experiment = false;
        }
        Ok((weighted.variation, in_experiment))
    }
}

/// Check one segment: explicit inclusion, explicit exclusion, then rules in
/// order.
fn segment_matches(segment: &Segment, user: &User) -> bool {
    let user_key = user.key();
    if segment.included.iter().any(|k| k == user_key) {
        return true;
    }
    if segment.excluded.iter().any(|k| k == user_key) {
        return false;
    }
    segment
        .rules
        .iter()
        .any(|rule| segment_rule_matches(rule, segment, user))
}

/// A segment rule matches when all clauses match and the user falls under
/// the rule's weight. An absent weight is an unconditional match.
fn segment_rule_matches(rule: &SegmentRule, segment: &Segment, user: &User) -> bool {
    if !rule
        .clauses
        .iter()
        .all(|clause| clause_matches_no_segments(clause, user))
    {
        return false;
    }

    let weight = match rule.weight {
        Some(weight) => weight,
        None => return true,
    };

    let bucket_by = rule.bucket_by.as_deref().unwrap_or("key");
    let bucket = bucket(user, &segment.key, bucket_by, &segment.salt, None).unwrap_or(0.0);
    bucket < weight / 100_000.0
}

/// Evaluate one non-segment clause against the user.
///
/// A missing or null attribute never matches. A sequence attribute matches
/// when any scalar element matches; nested objects and arrays inside it are
/// skipped. Negation applies last. An unknown operator is a quiet miss.
fn clause_matches_no_segments(clause: &Clause, user: &User) -> bool {
    let op = match operators::lookup(&clause.op) {
        Some(op) => op,
        None => {
            operators::warn_unknown(&clause.op);
            return false;
        }
    };

    let attribute = match user.attribute(&clause.attribute) {
        Some(value) => value,
        None => return false,
    };

    let matched = match &attribute {
        Value::Null => return false,
        Value::Array(elements) => elements
            .iter()
            .filter(|element| !element.is_array() && !element.is_object())
            .any(|element| match_any(op, element, &clause.values)),
        single => match_any(op, single, &clause.values),
    };

    clause.negate != matched
}

fn match_any(op: operators::OpFn, uvalue: &Value, cvalues: &[Value]) -> bool {
    cvalues.iter().any(|cvalue| op(uvalue, cvalue))
}

/// Compute the bucket for a rollout, honoring its seed and bucket-by
/// attribute. An unbucketable user lands at 0.
fn rollout_bucket(user: &User, flag: &FeatureFlag, rollout: &Rollout) -> f64 {
    let bucket_by = rollout.bucket_by.as_deref().unwrap_or("key");
    bucket(user, &flag.key, bucket_by, &flag.salt, rollout.seed).unwrap_or(0.0)
}

/// Map a user to a stable fraction in [0, 1).
///
/// The hash input is `{seed}.{attribute}` when a seed is given, otherwise
/// `{key}.{salt}.{attribute}`, either form suffixed with `.{secondary}` when
/// the user has a secondary key. The fraction is the first 15 hex digits of
/// the SHA-1 digest scaled by 2^60 - 1. All of this is observable across
/// SDKs and must not drift.
///
/// Returns `None` when the attribute is missing or neither a string nor a
/// number.
pub fn bucket(
    user: &User,
    context_key: &str,
    attribute: &str,
    salt: &str,
    seed: Option<i64>,
) -> Option<f64> {
    let value = user.attribute(attribute)?;
    let bucketable = match &value {
        Value::String(text) => text.clone(),
        // six fractional digits, matching the C formatting contract
        Value::Number(n) => format!("{:.6}", n.as_f64()?),
        _ => return None,
    };

    let mut input = match seed {
        Some(seed) => format!("{}.{}", seed, bucketable),
        None => format!("{}.{}.{}", context_key, salt, bucketable),
    };
    if let Some(secondary) = user.secondary() {
        input.push('.');
        input.push_str(secondary);
    }

    let digest = Sha1::digest(input.as_bytes());
    let mut hexed: String = digest.encode_hex();
    hexed.truncate(15);
    let scaled = u64::from_str_radix(&hexed, 16).unwrap_or(0) as f64;

    Some(scaled / BUCKET_SCALE)
}
