//! Snapshot of every flag's value and metadata for one user.
//!
//! Front-ends bootstrap from this so they never re-run evaluation. The
//! serialized shape is `{"$valid": …, "<key>": <value>, …, "$flagsState":
//! {"<key>": {…metadata…}}}`.

use crate::evaluator::{Detail, Reason};
use crate::models::FeatureFlag;
use serde::ser::{Serialize, SerializeMap, Serializer};
use serde_json::Value;
use std::collections::HashMap;

/// Options controlling what an all-flags snapshot includes.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllFlagsOptions {
    /// Restrict to flags available to environment-ID (browser) clients.
    pub client_side_only: bool,
    /// Keep evaluation reasons in the per-flag metadata.
    pub include_reasons: bool,
    /// Omit version and reason for flags with neither event tracking nor an
    /// active debugging window.
    pub details_only_for_tracked_flags: bool,
}

#[derive(Clone, Debug)]
struct FlagState {
    value: Option<Value>,
    variation: Option<usize>,
    version: u64,
    reason: Option<Reason>,
    track_events: bool,
    debug_events_until_date: Option<f64>,
    omit_details: bool,
}

/// The finished snapshot.
#[derive(Clone, Debug)]
pub struct AllFlagsState {
    valid: bool,
    flags: HashMap<String, FlagState>,
}

impl AllFlagsState {
    /// The invalid snapshot, returned when the engine cannot evaluate.
    pub fn invalid() -> Self {
        Self {
            valid: false,
            flags: HashMap::new(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// The evaluated value of one flag, if present in the snapshot.
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.flags.get(key).and_then(|state| state.value.as_ref())
    }

    pub fn variation_index(&self, key: &str) -> Option<usize> {
        self.flags.get(key).and_then(|state| state.variation)
    }

    pub fn reason(&self, key: &str) -> Option<&Reason> {
        self.flags.get(key).and_then(|state| state.reason.as_ref())
    }

    /// Projection to a plain key/value map; flags that evaluated to nothing
    /// map to null.
    pub fn values_map(&self) -> HashMap<String, Value> {
        self.flags
            .iter()
            .map(|(key, state)| {
                (
                    key.clone(),
                    state.value.clone().unwrap_or(Value::Null),
                )
            })
            .collect()
    }
}

impl Serialize for AllFlagsState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("$valid", &self.valid)?;

        for (key, state) in &self.flags {
            match &state.value {
                Some(value) => map.serialize_entry(key, value)?,
                None => map.serialize_entry(key, &Value::Null)?,
            }
        }

        let metadata: HashMap<&String, FlagMetadata<'_>> = self
            .flags
            .iter()
            .map(|(key, state)| (key, FlagMetadata { state }))
            .collect();
        map.serialize_entry("$flagsState", &metadata)?;
        map.end()
    }
}

/// Serialization adapter for the `$flagsState` member.
struct FlagMetadata<'a> {
    state: &'a FlagState,
}

impl<'a> Serialize for FlagMetadata<'a> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let state = self.state;
        let mut map = serializer.serialize_map(None)?;
        if let Some(variation) = state.variation {
            map.serialize_entry("variation", &variation)?;
        }
        if !state.omit_details {
            map.serialize_entry("version", &state.version)?;
            if let Some(reason) = &state.reason {
                map.serialize_entry("reason", reason)?;
            }
        }
        if state.track_events {
            map.serialize_entry("trackEvents", &true)?;
        }
        if let Some(until) = state.debug_events_until_date {
            map.serialize_entry("debugEventsUntilDate", &until)?;
        }
        map.end()
    }
}

/// Accumulates per-flag results into an [AllFlagsState].
pub struct AllFlagsStateBuilder {
    options: AllFlagsOptions,
    now: f64,
    state: AllFlagsState,
}

impl AllFlagsStateBuilder {
    pub fn new(options: AllFlagsOptions, now: f64) -> Self {
        Self {
            options,
            now,
            state: AllFlagsState {
                valid: true,
                flags: HashMap::new(),
            },
        }
    }

    pub fn add(&mut self, flag: &FeatureFlag, detail: Detail) {
        let debugging = flag.debugging_until(self.now);
        let omit_details = self.options.details_only_for_tracked_flags
            && !flag.track_events
            && !debugging;

        let reason = if self.options.include_reasons {
            Some(detail.reason)
        } else {
            None
        };

        self.state.flags.insert(
            flag.key.clone(),
            FlagState {
                value: detail.value,
                variation: detail.variation_index,
                version: flag.version,
                reason,
                track_events: flag.track_events,
                debug_events_until_date: flag.debug_events_until_date,
                omit_details,
            },
        );
    }

    pub fn build(self) -> AllFlagsState {
        self.state
    }
}
