//! Programmatic data source for tests.
//!
//! A [TestData] instance holds the current version of every flag it knows.
//! Each [Source] stream created from it starts with a `put` of the current
//! data; every [TestData::update] pushes a version-incremented patch to all
//! streams that are still listening.

use crate::message::Message;
use crate::models::{
    Clause, FeatureFlag, FlagRule, Target, VariationOrRollout,
};
use crate::source::Source;
use crate::store::StoreItem;
use futures::channel::mpsc;
use serde_json::Value;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::{Arc, Mutex};

struct TestDataInner {
    builders: HashMap<String, FlagBuilder>,
    versions: HashMap<String, u64>,
    listeners: Vec<mpsc::UnboundedSender<Result<Message, Infallible>>>,
}

/// Shared handle to the test flag universe. Cloning shares state.
#[derive(Clone)]
pub struct TestData {
    inner: Arc<Mutex<TestDataInner>>,
}

impl Default for TestData {
    fn default() -> Self {
        Self::new()
    }
}

impl TestData {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(TestDataInner {
                builders: HashMap::new(),
                versions: HashMap::new(),
                listeners: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TestDataInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Get a builder for the named flag: a copy of its current configuration
    /// when known, otherwise a fresh boolean flag that is on and serves
    /// `true` to everyone.
    pub fn flag(&self, key: &str) -> FlagBuilder {
        let inner = self.lock();
        inner
            .builders
            .get(key)
            .cloned()
            .unwrap_or_else(|| FlagBuilder::boolean(key))
    }

    /// Commit a builder: bump the flag's version and push the new document
    /// to every listening store.
    pub fn update(&self, builder: FlagBuilder) {
        let mut inner = self.lock();

        let version = inner
            .versions
            .entry(builder.key.clone())
            .and_modify(|v| *v += 1)
            .or_insert(1);
        let flag = builder.build(*version);
        inner.builders.insert(builder.key.clone(), builder);

        let message = |flag: &FeatureFlag| Message::Patch {
            kind: crate::store::DataKind::Flag,
            key: flag.key.clone(),
            item: StoreItem::from(flag.clone()),
        };
        inner
            .listeners
            .retain(|listener| listener.unbounded_send(Ok(message(&flag))).is_ok());
    }

    fn current_data(&self) -> HashMap<String, FeatureFlag> {
        let inner = self.lock();
        inner
            .builders
            .iter()
            .map(|(key, builder)| {
                let version = inner.versions.get(key).copied().unwrap_or(1);
                (key.clone(), builder.build(version))
            })
            .collect()
    }
}

impl Source for TestData {
    type Error = Infallible;
    type Stream = mpsc::UnboundedReceiver<Result<Message, Infallible>>;

    fn stream(&self) -> Self::Stream {
        let (tx, rx) = mpsc::unbounded();
        let put = Message::Put(crate::models::AllData {
            flags: self.current_data(),
            segments: HashMap::new(),
        });
        let _ = tx.unbounded_send(Ok(put));
        self.lock().listeners.push(tx);
        rx
    }
}

/// Fluent single-flag configuration.
#[derive(Clone, Debug)]
pub struct FlagBuilder {
    key: String,
    on: bool,
    variations: Vec<Value>,
    off_variation: Option<i64>,
    fallthrough_variation: i64,
    /// variation index -> user keys
    targets: HashMap<i64, Vec<String>>,
    rules: Vec<BuiltRule>,
}

#[derive(Clone, Debug)]
struct BuiltRule {
    clauses: Vec<Clause>,
    variation: i64,
}

impl FlagBuilder {
    /// A boolean flag: variations `[true, false]`, on, serving `true` by
    /// fallthrough and `false` when off.
    fn boolean(key: &str) -> Self {
        Self {
            key: key.to_string(),
            on: true,
            variations: vec![Value::Bool(true), Value::Bool(false)],
            off_variation: Some(1),
            fallthrough_variation: 0,
            targets: HashMap::new(),
            rules: Vec::new(),
        }
    }

    pub fn on(mut self, on: bool) -> Self {
        self.on = on;
        self
    }

    pub fn variations<I: IntoIterator<Item = Value>>(mut self, variations: I) -> Self {
        self.variations = variations.into_iter().collect();
        self
    }

    pub fn off_variation(mut self, index: i64) -> Self {
        self.off_variation = Some(index);
        self
    }

    pub fn fallthrough_variation(mut self, index: i64) -> Self {
        self.fallthrough_variation = index;
        self
    }

    /// Serve one variation to every user.
    pub fn variation_for_all_users(mut self, index: i64) -> Self {
        self.targets.clear();
        self.rules.clear();
        self.on = true;
        self.fallthrough_variation = index;
        self
    }

    /// Serve one constant value to every user.
    pub fn value_for_all_users(mut self, value: Value) -> Self {
        self.variations = vec![value];
        self.variation_for_all_users(0)
    }

    /// Pin one user to a variation.
    pub fn variation_for_user<K: Into<String>>(mut self, user_key: K, index: i64) -> Self {
        let user_key = user_key.into();
        // a user belongs to at most one target list
        for values in self.targets.values_mut() {
            values.retain(|existing| existing != &user_key);
        }
        self.targets.entry(index).or_default().push(user_key);
        self
    }

    /// Start a rule matching `attribute` against `values`.
    pub fn if_match<A: Into<String>>(self, attribute: A, values: Vec<Value>) -> RuleBuilder {
        RuleBuilder::new(self).and_match(attribute, values)
    }

    /// Start a rule requiring `attribute` to miss all of `values`.
    pub fn if_not_match<A: Into<String>>(
        self,
        attribute: A,
        values: Vec<Value>,
    ) -> RuleBuilder {
        RuleBuilder::new(self).and_not_match(attribute, values)
    }

    fn build(&self, version: u64) -> FeatureFlag {
        FeatureFlag {
            key: self.key.clone(),
            version,
            on: self.on,
            salt: "salt".to_string(),
            variations: self.variations.clone(),
            off_variation: self.off_variation,
            fallthrough: Some(VariationOrRollout {
                variation: Some(self.fallthrough_variation),
                rollout: None,
            }),
            targets: {
                let mut targets: Vec<_> = self
                    .targets
                    .iter()
                    .filter(|(_, values)| !values.is_empty())
                    .map(|(&variation, values)| Target {
                        variation,
                        values: values.clone(),
                    })
                    .collect();
                targets.sort_by_key(|target| target.variation);
                targets
            },
            rules: self
                .rules
                .iter()
                .enumerate()
                .map(|(index, rule)| FlagRule {
                    id: Some(format!("rule{}", index)),
                    clauses: rule.clauses.clone(),
                    variation_or_rollout: VariationOrRollout {
                        variation: Some(rule.variation),
                        rollout: None,
                    },
                    track_events: false,
                })
                .collect(),
            ..FeatureFlag::default()
        }
    }
}

/// Builds one rule inside a [FlagBuilder].
#[derive(Clone, Debug)]
pub struct RuleBuilder {
    flag: Box<FlagBuilder>,
    clauses: Vec<Clause>,
}

impl RuleBuilder {
    fn new(flag: FlagBuilder) -> Self {
        Self {
            flag: Box::new(flag),
            clauses: Vec::new(),
        }
    }

    pub fn and_match<A: Into<String>>(mut self, attribute: A, values: Vec<Value>) -> Self {
        self.clauses.push(Clause {
            attribute: attribute.into(),
            op: "in".to_string(),
            values,
            negate: false,
        });
        self
    }

    pub fn and_not_match<A: Into<String>>(mut self, attribute: A, values: Vec<Value>) -> Self {
        self.clauses.push(Clause {
            attribute: attribute.into(),
            op: "in".to_string(),
            values,
            negate: true,
        });
        self
    }

    /// Finish the rule, selecting `variation` on match.
    pub fn then_return(self, variation: i64) -> FlagBuilder {
        let mut flag = *self.flag;
        flag.rules.push(BuiltRule {
            clauses: self.clauses,
            variation,
        });
        flag
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::Consumer;
    use crate::store::{DataKind, DataStore, MemoryStore};
    use futures::StreamExt;
    use serde_json::json;

    async fn attach(data: &TestData) -> (MemoryStore, <TestData as Source>::Stream) {
        let store = MemoryStore::new();
        let mut stream = data.stream();
        let put = stream.next().await.expect("initial put").expect("ok");
        store.consume(put).await.expect("consume");
        (store, stream)
    }

    fn flag_version(store: &MemoryStore, key: &str) -> Option<u64> {
        store
            .get(DataKind::Flag, key)
            .expect("get")
            .map(|item| item.version())
    }

    #[tokio::test]
    async fn initial_put_contains_known_flags() {
        let data = TestData::new();
        data.update(data.flag("flag1").value_for_all_users(json!("x")));

        let (store, _stream) = attach(&data).await;
        assert!(store.initialized());
        assert_eq!(flag_version(&store, "flag1"), Some(1));
    }

    #[tokio::test]
    async fn updates_flow_to_attached_stores_with_bumped_versions() {
        let data = TestData::new();
        let (store, mut stream) = attach(&data).await;

        data.update(data.flag("flag1").variation_for_all_users(0));
        let patch = stream.next().await.expect("patch").expect("ok");
        store.consume(patch).await.expect("consume");
        assert_eq!(flag_version(&store, "flag1"), Some(1));

        data.update(data.flag("flag1").on(false));
        let patch = stream.next().await.expect("patch").expect("ok");
        store.consume(patch).await.expect("consume");
        assert_eq!(flag_version(&store, "flag1"), Some(2));
    }

    #[tokio::test]
    async fn builders_preserve_earlier_configuration() {
        let data = TestData::new();
        data.update(data.flag("flag1").variation_for_user("u1", 1));
        // a second edit starts from the stored builder, keeping the target
        data.update(data.flag("flag1").on(false));

        let (store, _stream) = attach(&data).await;
        match store
            .get(DataKind::Flag, "flag1")
            .expect("get")
            .expect("item")
        {
            StoreItem::Flag(flag) => {
                assert!(!flag.on);
                assert_eq!(flag.targets.len(), 1);
                assert_eq!(flag.targets[0].values, vec!["u1".to_string()]);
            }
            other => panic!("expected flag, got {:?}", other),
        }
    }

    #[test]
    fn boolean_flag_defaults() {
        let data = TestData::new();
        let flag = data.flag("b").build(1);
        assert!(flag.on);
        assert_eq!(flag.variations, vec![json!(true), json!(false)]);
        assert_eq!(flag.off_variation, Some(1));
        assert_eq!(
            flag.fallthrough.as_ref().and_then(|f| f.variation),
            Some(0)
        );
    }

    #[test]
    fn rules_build_with_clauses() {
        let data = TestData::new();
        let flag = data
            .flag("ruled")
            .if_match("country", vec![json!("de")])
            .and_not_match("plan", vec![json!("free")])
            .then_return(1)
            .build(1);

        assert_eq!(flag.rules.len(), 1);
        let rule = &flag.rules[0];
        assert_eq!(rule.clauses.len(), 2);
        assert_eq!(rule.clauses[0].attribute, "country");
        assert!(!rule.clauses[0].negate);
        assert_eq!(rule.clauses[1].attribute, "plan");
        assert!(rule.clauses[1].negate);
        assert_eq!(rule.variation_or_rollout.variation, Some(1));
    }

    #[test]
    fn moving_a_user_between_variations_keeps_one_target() {
        let data = TestData::new();
        let flag = data
            .flag("t")
            .variation_for_user("u", 0)
            .variation_for_user("u", 1)
            .build(1);

        assert_eq!(flag.targets.len(), 1);
        assert_eq!(flag.targets[0].variation, 1);
    }
}
