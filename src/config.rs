//! Client configuration.

use crate::backend::PersistentStore;
use crate::events::EventsConfig;
use std::collections::HashSet;
use std::time::Duration;

/// All construction-time options. Build one with [Config::builder]; the
/// defaults match the hosted service.
pub struct Config {
    pub base_uri: String,
    pub stream_uri: String,
    pub events_uri: String,
    /// Stream updates when true, poll when false.
    pub stream: bool,
    pub send_events: bool,
    pub events_capacity: usize,
    pub flush_interval: Duration,
    pub poll_interval: Duration,
    /// Offline clients evaluate from whatever data they are given and never
    /// touch the network.
    pub offline: bool,
    pub all_attributes_private: bool,
    pub private_attribute_names: HashSet<String>,
    pub user_keys_capacity: usize,
    pub user_keys_flush_interval: Duration,
    pub inline_users_in_events: bool,
    /// Optional persistent backend behind the store.
    pub store_backend: Option<Box<dyn PersistentStore>>,
    pub store_cache_ttl: Duration,
    /// Identifies a wrapping SDK to the service (`name` or `name/version`).
    pub wrapper: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_uri: "https://app.launchdarkly.com".to_string(),
            stream_uri: "https://stream.launchdarkly.com".to_string(),
            events_uri: "https://events.launchdarkly.com".to_string(),
            stream: true,
            send_events: true,
            events_capacity: 10_000,
            flush_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(30),
            offline: false,
            all_attributes_private: false,
            private_attribute_names: HashSet::new(),
            user_keys_capacity: 1_000,
            user_keys_flush_interval: Duration::from_secs(300),
            inline_users_in_events: false,
            store_backend: None,
            store_cache_ttl: Duration::from_secs(30),
            wrapper: None,
        }
    }
}

impl Config {
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    pub(crate) fn events_config(&self) -> EventsConfig {
        EventsConfig {
            capacity: self.events_capacity,
            inline_users_in_events: self.inline_users_in_events,
            all_attributes_private: self.all_attributes_private,
            private_attribute_names: self.private_attribute_names.clone(),
            user_keys_capacity: self.user_keys_capacity,
            user_keys_flush_interval: self.user_keys_flush_interval,
        }
    }
}

pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn base_uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.config.base_uri = uri.into();
        self
    }

    pub fn stream_uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.config.stream_uri = uri.into();
        self
    }

    pub fn events_uri<S: Into<String>>(mut self, uri: S) -> Self {
        self.config.events_uri = uri.into();
        self
    }

    pub fn stream(mut self, stream: bool) -> Self {
        self.config.stream = stream;
        self
    }

    pub fn send_events(mut self, send_events: bool) -> Self {
        self.config.send_events = send_events;
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.config.events_capacity = capacity;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.flush_interval = interval;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    pub fn offline(mut self, offline: bool) -> Self {
        self.config.offline = offline;
        self
    }

    pub fn all_attributes_private(mut self, private: bool) -> Self {
        self.config.all_attributes_private = private;
        self
    }

    pub fn private_attribute<S: Into<String>>(mut self, name: S) -> Self {
        self.config.private_attribute_names.insert(name.into());
        self
    }

    pub fn user_keys_capacity(mut self, capacity: usize) -> Self {
        self.config.user_keys_capacity = capacity;
        self
    }

    pub fn user_keys_flush_interval(mut self, interval: Duration) -> Self {
        self.config.user_keys_flush_interval = interval;
        self
    }

    pub fn inline_users_in_events(mut self, inline: bool) -> Self {
        self.config.inline_users_in_events = inline;
        self
    }

    pub fn store_backend(mut self, backend: Box<dyn PersistentStore>) -> Self {
        self.config.store_backend = Some(backend);
        self
    }

    pub fn store_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.store_cache_ttl = ttl;
        self
    }

    pub fn wrapper<S: Into<String>>(mut self, wrapper: S) -> Self {
        self.config.wrapper = Some(wrapper.into());
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
