//! Analytics event processing.
//!
//! Ingests evaluation, identify, custom and alias records; deduplicates
//! user-index events through a bounded LRU; aggregates evaluation counts per
//! (flag, variation, version); and hands bundled payloads to whatever
//! transport drains it. Everything lives behind one mutex.

use crate::{
    evaluator::{Detail, PrerequisiteEvent, Reason},
    lru::{Insertion, LruSet},
    models::FeatureFlag,
    user::User,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Current wall time as unix milliseconds.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

/// The slice of configuration the processor needs.
#[derive(Clone, Debug)]
pub struct EventsConfig {
    pub capacity: usize,
    pub inline_users_in_events: bool,
    pub all_attributes_private: bool,
    pub private_attribute_names: HashSet<String>,
    pub user_keys_capacity: usize,
    pub user_keys_flush_interval: Duration,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            inline_users_in_events: false,
            all_attributes_private: false,
            private_attribute_names: HashSet::new(),
            user_keys_capacity: 1_000,
            user_keys_flush_interval: Duration::from_secs(300),
        }
    }
}

/// A fully-shaped event ready for the wire.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "kind")]
pub enum OutputEvent {
    #[serde(rename = "feature")]
    Feature(FeatureRequestEvent),
    #[serde(rename = "debug")]
    Debug(FeatureRequestEvent),
    #[serde(rename = "identify")]
    Identify(IdentifyEvent),
    #[serde(rename = "index")]
    Index(IndexEvent),
    #[serde(rename = "custom")]
    Custom(CustomEvent),
    #[serde(rename = "alias")]
    Alias(AliasEvent),
    #[serde(rename = "summary")]
    Summary(SummaryEvent),
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureRequestEvent {
    pub creation_date: u64,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prereq_of: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<Reason>,
    // routing state, never serialized
    #[serde(skip)]
    track: bool,
    #[serde(skip)]
    always_track_details: bool,
    #[serde(skip)]
    debug_until: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyEvent {
    pub creation_date: u64,
    pub key: String,
    pub user: Value,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexEvent {
    pub creation_date: u64,
    pub user: Value,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomEvent {
    pub creation_date: u64,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AliasEvent {
    pub creation_date: u64,
    pub key: String,
    pub context_kind: &'static str,
    pub previous_key: String,
    pub previous_context_kind: &'static str,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryEvent {
    pub start_date: u64,
    pub end_date: u64,
    pub features: HashMap<String, FeatureSummary>,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct FeatureSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    pub counters: Vec<SummaryCounter>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryCounter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variation: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    pub count: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub unknown: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct CounterKey {
    variation: Option<usize>,
    version: Option<u64>,
}

#[derive(Clone, Debug)]
struct Counter {
    count: u64,
    value: Option<Value>,
    unknown: bool,
}

#[derive(Default)]
struct FlagCounters {
    default: Option<Value>,
    counters: HashMap<CounterKey, Counter>,
}

struct EventState {
    events: Vec<OutputEvent>,
    summary: HashMap<String, FlagCounters>,
    summary_start: Option<u64>,
    user_keys: LruSet,
    last_user_key_flush: Instant,
    last_server_time: f64,
}

/// Collects and summarizes events until a transport drains them.
pub struct EventProcessor {
    config: EventsConfig,
    state: Mutex<EventState>,
}

impl EventProcessor {
    pub fn new(config: EventsConfig) -> Self {
        let state = EventState {
            events: Vec::new(),
            summary: HashMap::new(),
            summary_start: None,
            user_keys: LruSet::with_capacity(config.user_keys_capacity),
            last_user_key_flush: Instant::now(),
            last_server_time: 0.0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, EventState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn user_json(&self, user: &User) -> Value {
        user.event_json(
            self.config.all_attributes_private,
            &self.config.private_attribute_names,
        )
    }

    /// Fill in the user identity per the inlining configuration.
    fn identity(&self, user: &User) -> (Option<Value>, Option<String>) {
        if self.config.inline_users_in_events {
            (Some(self.user_json(user)), None)
        } else {
            (None, Some(user.key().to_string()))
        }
    }

    /// Record one top-level evaluation plus any prerequisite records it
    /// produced.
    #[allow(clippy::too_many_arguments)]
    pub fn process_evaluation(
        &self,
        user: &User,
        flag: Option<&FeatureFlag>,
        key: &str,
        value: Option<&Value>,
        default: Option<&Value>,
        detail: &Detail,
        prerequisites: Vec<PrerequisiteEvent>,
        detailed: bool,
    ) {
        let now = now_millis();
        let evaluated = value.or(default).cloned();

        let feature = self.feature_event(
            now,
            key,
            user,
            flag,
            detail,
            evaluated,
            default.cloned(),
            None,
        );

        let mut state = self.lock();
        let index = self.maybe_index_event(&mut state, user, now);

        summarize(&mut state, now, &feature, flag.is_none());
        if let Some(index) = index {
            push_event(&mut state, self.config.capacity, OutputEvent::Index(index));
        }
        if flag.is_some() {
            self.possibly_queue(&mut state, feature, now as f64, detailed);
        }

        for prereq in prerequisites {
            let event = self.feature_event(
                now,
                &prereq.flag.key,
                user,
                Some(prereq.flag.as_ref()),
                &prereq.detail,
                prereq.detail.value.clone(),
                None,
                Some(prereq.prereq_of.clone()),
            );
            summarize(&mut state, now, &event, false);
            self.possibly_queue(&mut state, event, now as f64, detailed);
        }
    }

    /// Enqueue one identify event. Identify never consults the LRU.
    pub fn identify(&self, user: &User) {
        let event = IdentifyEvent {
            creation_date: now_millis(),
            key: user.key().to_string(),
            user: self.user_json(user),
        };
        let mut state = self.lock();
        push_event(
            &mut state,
            self.config.capacity,
            OutputEvent::Identify(event),
        );
    }

    /// Enqueue one custom event, with an index event when the user is new.
    pub fn track(&self, user: &User, key: &str, data: Option<Value>, metric: Option<f64>) {
        let now = now_millis();
        let (user_json, user_key) = self.identity(user);
        let event = CustomEvent {
            creation_date: now,
            key: key.to_string(),
            user: user_json,
            user_key,
            data,
            metric_value: metric,
        };

        let mut state = self.lock();
        let index = self.maybe_index_event(&mut state, user, now);
        push_event(&mut state, self.config.capacity, OutputEvent::Custom(event));
        if let Some(index) = index {
            push_event(&mut state, self.config.capacity, OutputEvent::Index(index));
        }
    }

    /// Enqueue one alias event connecting two users.
    pub fn alias(&self, user: &User, previous: &User) {
        let context_kind = |u: &User| {
            if u.anonymous() {
                "anonymousUser"
            } else {
                "user"
            }
        };
        let event = AliasEvent {
            creation_date: now_millis(),
            key: user.key().to_string(),
            context_kind: context_kind(user),
            previous_key: previous.key().to_string(),
            previous_context_kind: context_kind(previous),
        };
        let mut state = self.lock();
        push_event(&mut state, self.config.capacity, OutputEvent::Alias(event));
    }

    /// Feed the server clock from an event transport's response.
    pub fn set_server_time(&self, unix_millis: f64) {
        self.lock().last_server_time = unix_millis;
    }

    /// Atomically swap out the pending events and summary counters,
    /// appending one summary event. `None` when there is nothing to send.
    pub fn bundle(&self) -> Option<Vec<OutputEvent>> {
        let now = now_millis();
        let mut state = self.lock();

        if state.events.is_empty() && state.summary.is_empty() {
            return None;
        }

        let mut events = std::mem::take(&mut state.events);
        let summary = std::mem::take(&mut state.summary);
        let start_date = state.summary_start.take().unwrap_or(now);

        let features = summary
            .into_iter()
            .map(|(key, flag_counters)| {
                let counters = flag_counters
                    .counters
                    .into_iter()
                    .map(|(counter_key, counter)| SummaryCounter {
                        variation: counter_key.variation,
                        version: counter_key.version,
                        value: counter.value,
                        count: counter.count,
                        unknown: counter.unknown,
                    })
                    .collect();
                (
                    key,
                    FeatureSummary {
                        default: flag_counters.default,
                        counters,
                    },
                )
            })
            .collect();

        events.push(OutputEvent::Summary(SummaryEvent {
            start_date,
            end_date: now,
            features,
        }));
        Some(events)
    }

    #[allow(clippy::too_many_arguments)]
    fn feature_event(
        &self,
        now: u64,
        key: &str,
        user: &User,
        flag: Option<&FeatureFlag>,
        detail: &Detail,
        value: Option<Value>,
        default: Option<Value>,
        prereq_of: Option<String>,
    ) -> FeatureRequestEvent {
        let (user_json, user_key) = self.identity(user);

        let mut track = false;
        let mut always_track_details = false;
        if let Some(flag) = flag {
            if flag.track_events {
                track = true;
            }
            if flag.track_events_fallthrough
                && matches!(detail.reason, Reason::Fallthrough { .. })
            {
                track = true;
                always_track_details = true;
            }
            if let Reason::RuleMatch { rule_index, .. } = detail.reason {
                if flag
                    .rules
                    .get(rule_index)
                    .map_or(false, |rule| rule.track_events)
                {
                    track = true;
                    always_track_details = true;
                }
            }
        }

        FeatureRequestEvent {
            creation_date: now,
            key: key.to_string(),
            user: user_json,
            user_key,
            variation: detail.variation_index,
            value,
            default,
            version: flag.map(|f| f.version),
            prereq_of,
            reason: Some(detail.reason.clone()),
            track,
            always_track_details,
            debug_until: flag.and_then(|f| f.debug_events_until_date),
        }
    }

    /// Produce an index event when this user's key has not been seen within
    /// the current LRU window. Inlined users never need one.
    fn maybe_index_event(
        &self,
        state: &mut EventState,
        user: &User,
        now: u64,
    ) -> Option<IndexEvent> {
        if self.config.inline_users_in_events {
            return None;
        }

        if state.last_user_key_flush.elapsed() > self.config.user_keys_flush_interval {
            state.user_keys.clear();
            state.last_user_key_flush = Instant::now();
        }

        match state.user_keys.insert(user.key()) {
            Insertion::Existed => None,
            Insertion::New => Some(IndexEvent {
                creation_date: now,
                user: self.user_json(user),
            }),
        }
    }

    /// Apply the track/debug decision to a finished feature event.
    fn possibly_queue(
        &self,
        state: &mut EventState,
        mut event: FeatureRequestEvent,
        now: f64,
        detailed: bool,
    ) {
        if !event.always_track_details && !detailed {
            event.reason = None;
        }

        if let Some(until) = event.debug_until {
            if now < until && state.last_server_time < until {
                push_event(
                    &mut *state,
                    self.config.capacity,
                    OutputEvent::Debug(event.clone()),
                );
            }
        }

        if event.track {
            push_event(&mut *state, self.config.capacity, OutputEvent::Feature(event));
        }
    }
}

/// Append to the outgoing buffer, dropping with a warning at capacity.
fn push_event(state: &mut EventState, capacity: usize, event: OutputEvent) {
    if state.events.len() >= capacity {
        warn!("event capacity exceeded, dropping event");
        return;
    }
    state.events.push(event);
}

/// Fold one feature event into the summary counters.
fn summarize(state: &mut EventState, now: u64, event: &FeatureRequestEvent, unknown: bool) {
    if state.summary_start.is_none() {
        state.summary_start = Some(now);
    }

    let flag_counters = state
        .summary
        .entry(event.key.clone())
        .or_insert_with(|| FlagCounters {
            default: event.default.clone(),
            counters: HashMap::new(),
        });

    let counter_key = CounterKey {
        variation: event.variation,
        version: event.version,
    };
    flag_counters
        .counters
        .entry(counter_key)
        .and_modify(|counter| counter.count += 1)
        .or_insert_with(|| Counter {
            count: 1,
            value: event.value.clone(),
            unknown,
        });
}
