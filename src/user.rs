//! Users and the attribute model evaluation runs against.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

/// A single end user, constructed per call and read-only inside the engine.
///
/// Built-in attributes live in typed slots; anything else lives in `custom`.
#[derive(Clone, Debug, Default)]
pub struct User {
    key: String,
    secondary: Option<String>,
    ip: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    email: Option<String>,
    name: Option<String>,
    avatar: Option<String>,
    country: Option<String>,
    anonymous: Option<bool>,
    custom: HashMap<String, Value>,
    private_attributes: HashSet<String>,
}

impl User {
    /// Start building a user from its key.
    pub fn with_key<K: Into<String>>(key: K) -> UserBuilder {
        UserBuilder::new(key)
    }

    /// Shorthand for a user carrying only a key.
    pub fn new<K: Into<String>>(key: K) -> Self {
        Self::with_key(key).build()
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn secondary(&self) -> Option<&str> {
        self.secondary.as_deref()
    }

    pub fn anonymous(&self) -> bool {
        self.anonymous.unwrap_or(false)
    }

    /// Resolve an attribute name the way clauses and bucketing do: built-in
    /// names from their slots, everything else from `custom`, missing is
    /// `None`.
    pub fn attribute(&self, name: &str) -> Option<Value> {
        let text = |v: &Option<String>| v.as_ref().map(|s| Value::String(s.clone()));

        match name {
            "key" => Some(Value::String(self.key.clone())),
            "secondary" => text(&self.secondary),
            "ip" => text(&self.ip),
            "firstName" => text(&self.first_name),
            "lastName" => text(&self.last_name),
            "email" => text(&self.email),
            "name" => text(&self.name),
            "avatar" => text(&self.avatar),
            "country" => text(&self.country),
            "anonymous" => self.anonymous.map(Value::Bool),
            _ => self.custom.get(name).cloned(),
        }
    }

    /// Serialize for inclusion in an event, redacting private attributes.
    ///
    /// An attribute is private when named on the user, named in the global
    /// set, or when `all_private` is set. Redacted names are reported under
    /// `privateAttrs`. The key is never private.
    pub(crate) fn event_json(
        &self,
        all_private: bool,
        global_private: &HashSet<String>,
    ) -> Value {
        let mut out = Map::new();
        let mut redacted: Vec<String> = Vec::new();

        let is_private = |name: &str| {
            all_private
                || global_private.contains(name)
                || self.private_attributes.contains(name)
        };

        out.insert("key".into(), Value::String(self.key.clone()));

        let slots: [(&str, Option<&String>); 8] = [
            ("secondary", self.secondary.as_ref()),
            ("ip", self.ip.as_ref()),
            ("firstName", self.first_name.as_ref()),
            ("lastName", self.last_name.as_ref()),
            ("email", self.email.as_ref()),
            ("name", self.name.as_ref()),
            ("avatar", self.avatar.as_ref()),
            ("country", self.country.as_ref()),
        ];
        for (name, value) in slots.iter() {
            if let Some(value) = value {
                if is_private(name) {
                    redacted.push((*name).into());
                } else {
                    out.insert((*name).into(), Value::String((*value).clone()));
                }
            }
        }

        if let Some(anonymous) = self.anonymous {
            out.insert("anonymous".into(), Value::Bool(anonymous));
        }

        if !self.custom.is_empty() {
            let mut custom = Map::new();
            for (name, value) in &self.custom {
                if is_private(name) {
                    redacted.push(name.clone());
                } else {
                    custom.insert(name.clone(), value.clone());
                }
            }
            if !custom.is_empty() {
                out.insert("custom".into(), Value::Object(custom));
            }
        }

        if !redacted.is_empty() {
            redacted.sort();
            out.insert(
                "privateAttrs".into(),
                Value::Array(redacted.into_iter().map(Value::String).collect()),
            );
        }

        Value::Object(out)
    }
}

/// Builder for [User]; construct via [User::with_key].
#[derive(Clone, Debug)]
pub struct UserBuilder {
    user: User,
}

impl UserBuilder {
    fn new<K: Into<String>>(key: K) -> Self {
        Self {
            user: User {
                key: key.into(),
                ..User::default()
            },
        }
    }

    pub fn secondary<S: Into<String>>(mut self, value: S) -> Self {
        self.user.secondary = Some(value.into());
        self
    }

    pub fn ip<S: Into<String>>(mut self, value: S) -> Self {
        self.user.ip = Some(value.into());
        self
    }

    pub fn first_name<S: Into<String>>(mut self, value: S) -> Self {
        self.user.first_name = Some(value.into());
        self
    }

    pub fn last_name<S: Into<String>>(mut self, value: S) -> Self {
        self.user.last_name = Some(value.into());
        self
    }

    pub fn email<S: Into<String>>(mut self, value: S) -> Self {
        self.user.email = Some(value.into());
        self
    }

    pub fn name<S: Into<String>>(mut self, value: S) -> Self {
        self.user.name = Some(value.into());
        self
    }

    pub fn avatar<S: Into<String>>(mut self, value: S) -> Self {
        self.user.avatar = Some(value.into());
        self
    }

    pub fn country<S: Into<String>>(mut self, value: S) -> Self {
        self.user.country = Some(value.into());
        self
    }

    pub fn anonymous(mut self, value: bool) -> Self {
        self.user.anonymous = Some(value);
        self
    }

    /// Set an arbitrary attribute, looked up by clauses when the name is not
    /// one of the built-ins.
    pub fn custom<K: Into<String>, V: Into<Value>>(mut self, name: K, value: V) -> Self {
        self.user.custom.insert(name.into(), value.into());
        self
    }

    /// Mark an attribute private for this user only.
    pub fn private_attribute<S: Into<String>>(mut self, name: S) -> Self {
        self.user.private_attributes.insert(name.into());
        self
    }

    pub fn build(self) -> User {
        self.user
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn built_in_and_custom_lookup() {
        let user = User::with_key("u")
            .email("u@example.com")
            .custom("plan", "pro")
            .build();

        assert_eq!(user.attribute("key"), Some(json!("u")));
        assert_eq!(user.attribute("email"), Some(json!("u@example.com")));
        assert_eq!(user.attribute("plan"), Some(json!("pro")));
        assert_eq!(user.attribute("missing"), None);
    }

    #[test]
    fn custom_never_shadows_built_in() {
        let user = User::with_key("u").custom("email", "spoof").build();
        assert_eq!(user.attribute("email"), None);
    }

    #[test]
    fn event_json_redacts_private_attributes() {
        let user = User::with_key("u")
            .email("u@example.com")
            .name("U")
            .custom("plan", "pro")
            .private_attribute("email")
            .build();

        let mut global = HashSet::new();
        global.insert("plan".to_string());

        let json = user.event_json(false, &global);
        assert_eq!(json.get("key"), Some(&json!("u")));
        assert_eq!(json.get("name"), Some(&json!("U")));
        assert!(json.get("email").is_none());
        assert!(json.get("custom").is_none());
        assert_eq!(json.get("privateAttrs"), Some(&json!(["email", "plan"])));
    }

    #[test]
    fn event_json_all_private_keeps_key() {
        let user = User::with_key("u").email("u@example.com").build();
        let json = user.event_json(true, &HashSet::new());
        assert_eq!(json.get("key"), Some(&json!("u")));
        assert!(json.get("email").is_none());
        assert_eq!(json.get("privateAttrs"), Some(&json!(["email"])));
    }
}
