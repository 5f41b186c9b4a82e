//! The structured message header.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::keys;

/// String-keyed header of a message.
///
/// Insertion order is irrelevant to the protocol; two metas compare equal
/// when they hold the same keys and values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Meta(Map<String, Value>);

impl Meta {
    /// Create an empty meta.
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Create a meta with its `type` set.
    pub fn typed(kind: &str) -> Self {
        Self::new().with(keys::TYPE, kind)
    }

    /// Builder-style insert.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.0.insert(key.into(), value.into())
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// The message type, if present and a string.
    pub fn kind(&self) -> Option<&str> {
        self.0.get(keys::TYPE).and_then(Value::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn into_value(self) -> Value {
        Value::Object(self.0)
    }
}

impl From<Map<String, Value>> for Meta {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
