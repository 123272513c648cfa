use crate::{
    message::Message,
    models::{
        Clause, FeatureFlag, FlagRule, Prerequisite, Rollout, Segment, SegmentRule, Target,
        VariationOrRollout, WeightedVariation,
    },
    source::Source,
    store::StoreItem,
};
use serde_json::Value;
use std::convert::Infallible;

/// A [Source] that never produces anything.
pub struct NullSource;

impl Source for NullSource {
    type Error = Infallible;
    type Stream = futures::stream::Pending<Result<Message, Self::Error>>;

    fn stream(&self) -> Self::Stream {
        futures::stream::pending()
    }
}

pub struct FlagBuilder(FeatureFlag);

impl Default for FlagBuilder {
    fn default() -> Self {
        Self(FeatureFlag {
            key: "my_test_flag".into(),
            version: 1,
            on: true,
            salt: "test-salt".into(),
            variations: vec![false.into(), true.into()],
            fallthrough: Some(VariationOrRollout {
                variation: Some(0),
                rollout: None,
            }),
            ..FeatureFlag::default()
        })
    }
}

#[allow(dead_code)]
impl FlagBuilder {
    pub fn off(mut self) -> Self {
        self.0.on = false;
        self
    }

    pub fn on(mut self) -> Self {
        self.0.on = true;
        self
    }

    pub fn with_key<K: Into<String>>(mut self, key: K) -> Self {
        self.0.key = key.into();
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.0.version = version;
        self
    }

    pub fn with_salt<S: Into<String>>(mut self, salt: S) -> Self {
        self.0.salt = salt.into();
        self
    }

    pub fn with_variations<I: IntoIterator<Item = V>, V: Into<Value>>(
        mut self,
        iter: I,
    ) -> Self {
        self.0.variations = iter.into_iter().map(|v| v.into()).collect();
        self
    }

    pub fn with_off_variation(mut self, index: i64) -> Self {
        self.0.off_variation = Some(index);
        self
    }

    pub fn with_fallthrough_variation(mut self, index: i64) -> Self {
        self.0.fallthrough = Some(VariationOrRollout {
            variation: Some(index),
            rollout: None,
        });
        self
    }

    pub fn with_fallthrough_rollout<I: IntoIterator<Item = (i64, f64)>>(
        mut self,
        variations: I,
    ) -> Self {
        self.0.fallthrough = Some(VariationOrRollout {
            variation: None,
            rollout: Some(Rollout {
                variations: variations
                    .into_iter()
                    .map(|(variation, weight)| WeightedVariation {
                        variation,
                        weight,
                        untracked: false,
                    })
                    .collect(),
                ..Rollout::default()
            }),
        });
        self
    }

    pub fn add_target<V: Into<String>>(mut self, variation: i64, value: V) -> Self {
        if let Some(target) = self
            .0
            .targets
            .iter_mut()
            .find(|t| t.variation == variation)
        {
            target.values.push(value.into());
        } else {
            self.0.targets.push(Target {
                variation,
                values: vec![value.into()],
            });
        }
        self
    }

    pub fn add_rule<I: Into<String>, A: Into<String>, O: Into<String>>(
        mut self,
        id: I,
        attribute: A,
        op: O,
        values: Vec<Value>,
        negate: bool,
        variation: i64,
    ) -> Self {
        self.0.rules.push(FlagRule {
            id: Some(id.into()),
            clauses: vec![Clause {
                attribute: attribute.into(),
                op: op.into(),
                values,
                negate,
            }],
            variation_or_rollout: VariationOrRollout {
                variation: Some(variation),
                rollout: None,
            },
            track_events: false,
        });
        self
    }

    pub fn add_prerequisite<K: Into<String>>(mut self, key: K, variation: i64) -> Self {
        self.0.prerequisites.push(Prerequisite {
            key: key.into(),
            variation,
        });
        self
    }

    pub fn track_events(mut self) -> Self {
        self.0.track_events = true;
        self
    }

    pub fn track_events_fallthrough(mut self) -> Self {
        self.0.track_events_fallthrough = true;
        self
    }

    pub fn track_rule_events(mut self, rule_index: usize) -> Self {
        self.0.rules[rule_index].track_events = true;
        self
    }

    pub fn debug_until(mut self, date: f64) -> Self {
        self.0.debug_events_until_date = Some(date);
        self
    }

    pub fn into_inner(self) -> FeatureFlag {
        self.0
    }

    pub fn into_item(self) -> StoreItem {
        StoreItem::from(self.0)
    }
}

pub struct SegmentBuilder(Segment);

#[allow(dead_code)]
impl SegmentBuilder {
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self(Segment {
            key: key.into(),
            version: 1,
            salt: "test-salt".into(),
            ..Segment::default()
        })
    }

    pub fn include<K: Into<String>>(mut self, user_key: K) -> Self {
        self.0.included.push(user_key.into());
        self
    }

    pub fn exclude<K: Into<String>>(mut self, user_key: K) -> Self {
        self.0.excluded.push(user_key.into());
        self
    }

    pub fn add_rule<A: Into<String>, O: Into<String>>(
        mut self,
        attribute: A,
        op: O,
        values: Vec<Value>,
        weight: Option<f64>,
    ) -> Self {
        self.0.rules.push(SegmentRule {
            clauses: vec![Clause {
                attribute: attribute.into(),
                op: op.into(),
                values,
                negate: false,
            }],
            weight,
            bucket_by: None,
        });
        self
    }

    pub fn into_inner(self) -> Segment {
        self.0
    }

    pub fn into_item(self) -> StoreItem {
        StoreItem::from(self.0)
    }
}
