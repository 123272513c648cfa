//! Server-side feature flag evaluation.
//!
//! The client glues the building blocks together: a [store](store) fed by a
//! [source](source), an [evaluator](evaluator) interpreting flag documents,
//! and an [event processor](events) summarizing every decision for delivery
//! by an [event sender](sender).

use self::{
    backend::CachingStore,
    config::Config,
    consumer::{Consumer, ReadError},
    evaluator::{Detail, ErrorKind, Evaluator, PrerequisiteEvent},
    events::EventProcessor,
    flags_state::{AllFlagsOptions, AllFlagsState, AllFlagsStateBuilder},
    models::FeatureFlag,
    sender::{EventSender, SendError},
    source::{DefaultSource, PollingSource, Source, SseCreateError, SseSource},
    store::{DataKind, DataStore, MemoryStore, StoreError, StoreItem},
    user::User,
};
use serde_json::Value;
use std::{error::Error as StdError, fmt, sync::Arc};
use tracing::{error, warn};

pub mod backend;
pub mod config;
pub mod consumer;
pub mod evaluator;
pub mod events;
pub mod file_data;
pub mod flags_state;
pub mod lru;
pub mod message;
pub mod models;
pub mod operators;
pub mod sender;
pub mod source;
pub mod store;
pub mod test_data;
pub mod user;
#[cfg(test)]
mod test_utils;

#[derive(Debug, thiserror::Error)]
pub enum StartError<CE>
where
    CE: fmt::Debug + Clone + StdError + 'static,
{
    #[error("Already started, can't start multiple times")]
    AlreadyStarted,

    #[error("Failed to start reading from source: {0}")]
    Start(#[from] ReadError<CE>),
}

#[derive(Debug, thiserror::Error)]
pub enum CreateError {
    #[error("Invalid SDK token or endpoint: {0}")]
    InvalidToken(#[from] SseCreateError),

    #[error("Invalid polling endpoint: {0}")]
    InvalidPollEndpoint(#[from] source::PollError),
}

/// A store type erased behind a trait object, used when the store choice is
/// made at runtime from configuration.
pub type BoxedStore = Box<dyn DataStore>;

/// Client providing the idiomatic way of retrieving
/// variation values for flags.
///
/// Glue code on top of the smaller building blocks.
pub struct DefaultClient<ST, SRC> {
    config: Config,
    store: Arc<ST>,
    evaluator: Evaluator<Arc<ST>>,
    events: Arc<EventProcessor>,
    source: Option<SRC>,
}

impl DefaultClient<MemoryStore, SseSource> {
    /// Create a feature flagging client based on an SDK token.
    pub fn with_token<T: AsRef<str>>(token: T) -> Result<Self, CreateError> {
        let source = SseSource::new(token)?;
        let store = Arc::new(MemoryStore::new());
        Ok(Self::new(store, source, Config::default()))
    }
}

impl DefaultClient<BoxedStore, DefaultSource> {
    /// Create a client from full configuration: streaming or polling per the
    /// config, and a caching store when a backend is configured.
    pub fn with_config<T: AsRef<str>>(
        token: T,
        mut config: Config,
    ) -> Result<Self, CreateError> {
        let source = if config.stream {
            let stream_url = format!("{}/all", config.stream_uri.trim_end_matches('/'));
            DefaultSource::Stream(SseSource::for_url(
                &stream_url,
                token,
                config.wrapper.as_deref(),
            )?)
        } else {
            let poll_url = format!(
                "{}/sdk/latest-all",
                config.base_uri.trim_end_matches('/')
            );
            DefaultSource::Poll(PollingSource::for_url(
                &poll_url,
                token.as_ref(),
                config.wrapper.as_deref(),
                config.poll_interval,
            )?)
        };
        let store: BoxedStore = match config.store_backend.take() {
            Some(backend) => Box::new(CachingStore::new(backend, config.store_cache_ttl)),
            None => Box::new(MemoryStore::new()),
        };
        Ok(Self::new(Arc::new(store), source, config))
    }
}

impl<ST, SRC> DefaultClient<ST, SRC>
where
    ST: DataStore,
{
    /// Make a client with custom components
    pub fn new<STA: Into<Arc<ST>>>(store: STA, source: SRC, config: Config) -> Self {
        let store = store.into();
        let evaluator = Evaluator::new(Arc::clone(&store));
        let events = Arc::new(EventProcessor::new(config.events_config()));
        Self {
            config,
            evaluator,
            store,
            events,
            source: Some(source),
        }
    }

    /// Start consuming data in the client
    ///
    /// Future resolves once the initial data has been read.
    /// Drop the future to ignore the startup. It will still
    /// happen in the background.
    pub async fn start(&mut self) -> Result<(), StartError<StoreError>>
    where
        ST: Send + Sync + 'static,
        SRC: Source + Send + 'static,
        SRC::Stream: Unpin + Send,
        SRC::Error: StdError + Send,
    {
        let source = self.source.take().ok_or(StartError::AlreadyStarted)?;
        let store = Arc::clone(&self.store);
        store.read_from(source).await.map_err(Into::into)
    }

    /// True once the store has received its initial data.
    pub fn initialized(&self) -> bool {
        self.store.initialized()
    }

    /// The event processor, for wiring up delivery.
    pub fn events(&self) -> &Arc<EventProcessor> {
        &self.events
    }

    /// Bundle pending events and deliver them through the given sender.
    pub async fn flush(&self, sender: &EventSender) -> Result<(), SendError> {
        if self.config.offline || !self.config.send_events {
            return Ok(());
        }
        sender.flush(&self.events).await
    }

    pub fn bool_variation(&self, key: &str, user: &User, default: bool) -> bool {
        self.typed_variation(key, user, default, false, Value::as_bool)
            .0
    }

    pub fn bool_variation_detail(
        &self,
        key: &str,
        user: &User,
        default: bool,
    ) -> (bool, Detail) {
        self.typed_variation(key, user, default, true, Value::as_bool)
    }

    pub fn int_variation(&self, key: &str, user: &User, default: i64) -> i64 {
        self.typed_variation(key, user, default, false, Value::as_i64)
            .0
    }

    pub fn int_variation_detail(
        &self,
        key: &str,
        user: &User,
        default: i64,
    ) -> (i64, Detail) {
        self.typed_variation(key, user, default, true, Value::as_i64)
    }

    pub fn double_variation(&self, key: &str, user: &User, default: f64) -> f64 {
        self.typed_variation(key, user, default, false, Value::as_f64)
            .0
    }

    pub fn double_variation_detail(
        &self,
        key: &str,
        user: &User,
        default: f64,
    ) -> (f64, Detail) {
        self.typed_variation(key, user, default, true, Value::as_f64)
    }

    pub fn string_variation(&self, key: &str, user: &User, default: &str) -> String {
        self.typed_variation(key, user, default.to_string(), false, |value| {
            value.as_str().map(str::to_string)
        })
        .0
    }

    pub fn string_variation_detail(
        &self,
        key: &str,
        user: &User,
        default: &str,
    ) -> (String, Detail) {
        self.typed_variation(key, user, default.to_string(), true, |value| {
            value.as_str().map(str::to_string)
        })
    }

    /// Evaluate to an arbitrary JSON value. Every value is acceptable, so
    /// the default only applies when evaluation yields nothing.
    pub fn json_variation(&self, key: &str, user: &User, default: Value) -> Value {
        self.typed_variation(key, user, default, false, |value| Some(value.clone()))
            .0
    }

    pub fn json_variation_detail(
        &self,
        key: &str,
        user: &User,
        default: Value,
    ) -> (Value, Detail) {
        self.typed_variation(key, user, default, true, |value| Some(value.clone()))
    }

    /// Evaluate every flag for one user into a serializable snapshot.
    pub fn all_flags_state(&self, user: &User, options: AllFlagsOptions) -> AllFlagsState {
        if !self.store.initialized() {
            warn!("all_flags_state called before client initialization");
            return AllFlagsState::invalid();
        }
        if user.key().is_empty() {
            warn!("all_flags_state requires a user with a key");
            return AllFlagsState::invalid();
        }

        let all = match self.store.all(DataKind::Flag) {
            Ok(all) => all,
            Err(error) => {
                error!(%error, "store failure listing flags");
                return AllFlagsState::invalid();
            }
        };

        let mut builder =
            AllFlagsStateBuilder::new(options, events::now_millis() as f64);
        for item in all.values() {
            let flag = match item {
                StoreItem::Flag(flag) => flag,
                _ => continue,
            };
            if options.client_side_only && !flag.visibility.using_environment_id() {
                continue;
            }
            match self.evaluator.evaluate(flag, user) {
                Ok((detail, _)) if !detail.reason.is_error() => {
                    builder.add(flag, detail);
                }
                Ok((detail, _)) => {
                    warn!(flag = %flag.key, reason = ?detail.reason, "flag omitted from state");
                }
                Err(error) => {
                    error!(flag = %flag.key, %error, "flag omitted from state");
                }
            }
        }
        builder.build()
    }

    /// Enqueue an identify event for the user.
    pub fn identify(&self, user: &User) {
        if self.events_disabled() {
            return;
        }
        if user.key().is_empty() {
            warn!("identify requires a user with a key");
            return;
        }
        self.events.identify(user);
    }

    /// Enqueue a custom event.
    pub fn track(&self, user: &User, key: &str, data: Option<Value>, metric: Option<f64>) {
        if self.events_disabled() {
            return;
        }
        self.events.track(user, key, data, metric);
    }

    /// Associate two users, typically an anonymous one with a known one.
    pub fn alias(&self, user: &User, previous: &User) {
        if self.events_disabled() {
            return;
        }
        self.events.alias(user, previous);
    }

    fn events_disabled(&self) -> bool {
        self.config.offline || !self.config.send_events
    }

    fn typed_variation<T, G>(
        &self,
        key: &str,
        user: &User,
        default: T,
        detailed: bool,
        from_json: G,
    ) -> (T, Detail)
    where
        T: Clone + Into<Value>,
        G: Fn(&Value) -> Option<T>,
    {
        let default_json: Value = default.clone().into();
        let (flag, mut detail, prerequisites) = self.evaluate_internal(key, user);

        let result = match &detail.value {
            Some(value) => match from_json(value) {
                Some(typed) => typed,
                None => {
                    detail = Detail::error(ErrorKind::WrongType);
                    default.clone()
                }
            },
            None => default.clone(),
        };

        if !self.events_disabled() {
            self.events.process_evaluation(
                user,
                flag.as_deref(),
                key,
                detail.value.as_ref(),
                Some(&default_json),
                &detail,
                prerequisites,
                detailed,
            );
        }

        (result, detail)
    }

    /// The core lookup-and-evaluate step shared by every variation call.
    fn evaluate_internal(
        &self,
        key: &str,
        user: &User,
    ) -> (Option<Arc<FeatureFlag>>, Detail, Vec<PrerequisiteEvent>) {
        if user.key().is_empty() {
            warn!("variation requires a user with a key");
            return (None, Detail::error(ErrorKind::UserNotSpecified), vec![]);
        }
        if !self.store.initialized() {
            warn!(%key, "variation called before client initialization");
            return (None, Detail::error(ErrorKind::ClientNotReady), vec![]);
        }

        let flag = match self.store.get(DataKind::Flag, key) {
            Ok(Some(StoreItem::Flag(flag))) => flag,
            Ok(_) => {
                warn!(%key, "flag not found");
                return (None, Detail::error(ErrorKind::FlagNotFound), vec![]);
            }
            Err(err) => {
                error!(%key, error = %err, "store failure during variation");
                return (None, Detail::error(ErrorKind::Exception), vec![]);
            }
        };

        match self.evaluator.evaluate(&flag, user) {
            Ok((detail, prerequisites)) => (Some(flag), detail, prerequisites),
            Err(err) => {
                error!(%key, error = %err, "store failure during evaluation");
                (Some(flag), Detail::error(ErrorKind::Exception), vec![])
            }
        }
    }
}
