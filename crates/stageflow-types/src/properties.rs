//! Typed key-value configuration attached to stages and interface states.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

/// How a connector combines the properties of the two states it bridges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeMode {
    /// Order-independent merge; keys present on both sides with differing
    /// values are dropped.
    #[default]
    Unordered,
    /// States are treated as ordered events; the later (`to`) side wins.
    Sequential,
}

/// Free-form typed configuration map.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Properties {
    values: HashMap<String, Value>,
}

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite a key.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    /// String accessor that falls back to `default` when the key is absent
    /// or not a JSON string.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.values
            .get(key)
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| default.to_owned())
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(|v| v.as_f64())
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.values.get(key).and_then(|v| v.as_bool())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Merge the property maps of a bridged state pair.
    ///
    /// `Unordered` keeps only keys that are unambiguous between the two
    /// sides; `Sequential` treats `to` as the later event and lets it win.
    pub fn merged(from: &Properties, to: &Properties, mode: MergeMode) -> Properties {
        let mut out = from.clone();
        for (key, value) in to.values.iter() {
            match out.values.get(key) {
                Some(existing) if existing != value => match mode {
                    MergeMode::Unordered => {
                        warn!(key = %key, "conflicting property dropped in unordered merge");
                        out.values.remove(key);
                    }
                    MergeMode::Sequential => {
                        out.values.insert(key.clone(), value.clone());
                    }
                },
                _ => {
                    out.values.insert(key.clone(), value.clone());
                }
            }
        }
        out
    }
}
