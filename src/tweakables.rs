//! X2: a registry mapping string keys to typed, range-clamped config values
//! (§4.9). Values set before their key is registered are held as pending and
//! applied at registration time.

use std::collections::HashMap;
use std::sync::Mutex;

use serde_json::Value as Json;

use crate::error::{Error, Result};

/// A tweakable's runtime value. Numeric variants carry an optional
/// `[min, max]` clamp declared at registration.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
}

impl Value {
    fn clamp_to(&self, min: &Option<Value>, max: &Option<Value>) -> Value {
        match self {
            Value::Int(v) => {
                let mut v = *v;
                if let Some(Value::Int(lo)) = min {
                    v = v.max(*lo);
                }
                if let Some(Value::Int(hi)) = max {
                    v = v.min(*hi);
                }
                Value::Int(v)
            }
            Value::Float(v) => {
                let mut v = *v;
                if let Some(Value::Float(lo)) = min {
                    v = v.max(*lo);
                }
                if let Some(Value::Float(hi)) = max {
                    v = v.min(*hi);
                }
                Value::Float(v)
            }
            other => other.clone(),
        }
    }

    fn to_json(&self) -> Json {
        match self {
            Value::Int(v) => Json::from(*v),
            Value::Float(v) => Json::from(*v),
            Value::Bool(v) => Json::from(*v),
            Value::Str(v) => Json::from(v.clone()),
        }
    }

    fn from_json(json: &Json) -> Option<Value> {
        match json {
            Json::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Value::Int(i))
                } else {
                    n.as_f64().map(Value::Float)
                }
            }
            Json::Bool(b) => Some(Value::Bool(*b)),
            Json::String(s) => Some(Value::Str(s.clone())),
            _ => None,
        }
    }
}

struct Entry {
    value: Value,
    default: Value,
    min: Option<Value>,
    max: Option<Value>,
    persistent: bool,
    serializable: bool,
}

struct Pending {
    value: Value,
    from_command_line: bool,
}

/// A process-wide (or scoped) tweakable registry. Keys are opaque strings
/// chosen by callers, e.g. `"physics.gravity"`.
#[derive(Default)]
pub struct Tweakables {
    entries: Mutex<HashMap<String, Entry>>,
    pending: Mutex<HashMap<String, Pending>>,
}

impl Tweakables {
    pub fn new() -> Self {
        Tweakables { entries: Mutex::new(HashMap::new()), pending: Mutex::new(HashMap::new()) }
    }

    /// Registers `key` with `default`, an optional numeric clamp range, and
    /// persistence/serializability flags. If a value was `set` before this
    /// key existed, that pending value is applied now; it is then discarded
    /// unless `persistent` (§4.9: "retained for persistent").
    pub fn register(&self, key: &str, default: Value, min: Option<Value>, max: Option<Value>, persistent: bool, serializable: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());

        let value = match pending.get(key) {
            Some(p) => p.value.clamp_to(&min, &max),
            None => default.clone(),
        };
        if !persistent {
            pending.remove(key);
        }
        entries.insert(key.to_string(), Entry { value, default, min, max, persistent, serializable });
    }

    /// Sets `key`'s value, clamping numerics to its declared range. If `key`
    /// isn't registered yet, the value is held pending until it is.
    pub fn set(&self, key: &str, value: Value, from_command_line: bool) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(entry) = entries.get_mut(key) {
            entry.value = value.clamp_to(&entry.min, &entry.max);
            return;
        }
        drop(entries);
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).insert(key.to_string(), Pending { value, from_command_line });
    }

    pub fn get(&self, key: &str) -> Result<Value> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|e| e.value.clone())
            .ok_or_else(|| Error::not_found(key))
    }

    pub fn reset_to_default(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let entry = entries.get_mut(key).ok_or_else(|| Error::not_found(key))?;
        entry.value = entry.default.clone();
        Ok(())
    }

    /// Every registered value that differs from its default and is not
    /// flagged non-serializable, as a flat JSON object (§4.9, §6).
    pub fn save(&self) -> Json {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut map = serde_json::Map::new();
        for (key, entry) in entries.iter() {
            if entry.serializable && entry.value != entry.default {
                map.insert(key.clone(), entry.value.to_json());
            }
        }
        Json::Object(map)
    }

    /// Applies a previously-`save`d JSON object back. Keys not yet
    /// registered are held pending.
    pub fn load(&self, json: &str) -> Result<()> {
        let parsed: Json = serde_json::from_str(json).map_err(|_| Error::invalid_argument("not valid JSON"))?;
        let Json::Object(map) = parsed else {
            return Err(Error::invalid_argument("expected a JSON object"));
        };
        for (key, value) in map {
            if let Some(v) = Value::from_json(&value) {
                self.set(&key, v, false);
            }
        }
        Ok(())
    }
}

/// Adapts already-parsed `(key, value)` pairs from the command line into
/// `set(key, value, true)` calls (§4.12). No argument parsing is done here.
pub fn apply_args(tweakables: &Tweakables, args: impl IntoIterator<Item = (String, String)>) {
    for (key, raw) in args {
        tweakables.set(&key, parse_scalar(&raw), true);
    }
}

/// Adapts already-parsed `(key, value)` pairs drawn from environment
/// variables with the given prefix stripped (§4.12).
pub fn apply_env_prefix(tweakables: &Tweakables, prefix: &str, vars: impl IntoIterator<Item = (String, String)>) {
    for (name, raw) in vars {
        if let Some(key) = name.strip_prefix(prefix) {
            tweakables.set(key, parse_scalar(&raw), false);
        }
    }
}

fn parse_scalar(raw: &str) -> Value {
    if let Ok(i) = raw.parse::<i64>() {
        Value::Int(i)
    } else if let Ok(f) = raw.parse::<f64>() {
        Value::Float(f)
    } else if let Ok(b) = raw.parse::<bool>() {
        Value::Bool(b)
    } else {
        Value::Str(raw.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_before_register_is_applied_as_pending() {
        let t = Tweakables::new();
        t.set("gravity", Value::Float(12.0), false);
        t.register("gravity", Value::Float(9.8), Some(Value::Float(0.0)), Some(Value::Float(20.0)), false, true);
        assert_eq!(t.get("gravity").unwrap(), Value::Float(12.0));
    }

    #[test]
    fn set_clamps_to_declared_range() {
        let t = Tweakables::new();
        t.register("volume", Value::Int(50), Some(Value::Int(0)), Some(Value::Int(100)), false, true);
        t.set("volume", Value::Int(500), false);
        assert_eq!(t.get("volume").unwrap(), Value::Int(100));
    }

    #[test]
    fn save_omits_defaults_and_non_serializable_entries() {
        let t = Tweakables::new();
        t.register("a", Value::Int(1), None, None, false, true);
        t.register("b", Value::Int(1), None, None, false, true);
        t.register("secret", Value::Int(1), None, None, false, false);
        t.set("b", Value::Int(2), false);
        t.set("secret", Value::Int(2), false);

        let saved = t.save();
        let obj = saved.as_object().unwrap();
        assert!(!obj.contains_key("a"));
        assert_eq!(obj.get("b").unwrap(), &Json::from(2));
        assert!(!obj.contains_key("secret"));
    }

    #[test]
    fn load_round_trips_through_save() {
        let t = Tweakables::new();
        t.register("b", Value::Int(1), None, None, false, true);
        t.set("b", Value::Int(7), false);
        let saved = t.save().to_string();

        let t2 = Tweakables::new();
        t2.register("b", Value::Int(1), None, None, false, true);
        t2.load(&saved).unwrap();
        assert_eq!(t2.get("b").unwrap(), Value::Int(7));
    }

    #[test]
    fn non_persistent_pending_is_discarded_once_registered() {
        let t = Tweakables::new();
        t.set("x", Value::Int(5), false);
        t.register("x", Value::Int(0), None, None, false, true);
        t.reset_to_default("x").unwrap();
        assert_eq!(t.get("x").unwrap(), Value::Int(0));
    }
}
