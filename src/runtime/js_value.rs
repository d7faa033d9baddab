//! Transferable JavaScript values.
//!
//! [`JsValue`] is how results leave a host: a plain tree that can cross
//! threads. Unlike `serde_json::Value` it represents `undefined`, NaN and
//! ±Infinity, and conversion out of the engine rejects cycles and enforces
//! depth/size limits.

use deno_core::v8;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Maximum depth for JavaScript value conversion
pub const MAX_JS_DEPTH: usize = 100;
/// Maximum size in bytes for JavaScript value conversion
pub const MAX_JS_BYTES: usize = 10 * 1024 * 1024; // 10MB

#[derive(Clone, Debug, PartialEq, Default)]
pub enum JsValue {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    /// Integral number within i64 range
    Int(i64),
    /// Any other number, including NaN and ±Infinity
    Float(f64),
    String(String),
    Array(Vec<JsValue>),
    /// Plain object; insertion order preserved
    Object(IndexMap<String, JsValue>),
}

impl JsValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JsValue::Int(i) => Some(*i as f64),
            JsValue::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            JsValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Property lookup on objects; `None` for everything else.
    pub fn get(&self, key: &str) -> Option<&JsValue> {
        match self {
            JsValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Convert an engine value with circular reference detection and limits
    /// enforced.
    pub fn from_v8<'s>(
        scope: &mut v8::HandleScope<'s>,
        value: v8::Local<'s, v8::Value>,
    ) -> Result<Self, String> {
        let mut seen = HashSet::new();
        let mut tracker = LimitTracker::new(MAX_JS_DEPTH, MAX_JS_BYTES);
        from_v8_internal(scope, value, &mut seen, &mut tracker)
    }

    /// Materialize this value in `scope`.
    pub fn to_v8<'s>(&self, scope: &mut v8::HandleScope<'s>) -> Result<v8::Local<'s, v8::Value>, String> {
        let value: v8::Local<v8::Value> = match self {
            JsValue::Undefined => v8::undefined(scope).into(),
            JsValue::Null => v8::null(scope).into(),
            JsValue::Bool(b) => v8::Boolean::new(scope, *b).into(),
            JsValue::Int(i) => v8::Number::new(scope, *i as f64).into(),
            JsValue::Float(f) => v8::Number::new(scope, *f).into(),
            JsValue::String(s) => v8::String::new(scope, s)
                .ok_or_else(|| "String too large for the engine".to_string())?
                .into(),
            JsValue::Array(items) => {
                let mut elements = Vec::with_capacity(items.len());
                for item in items {
                    elements.push(item.to_v8(scope)?);
                }
                v8::Array::new_with_elements(scope, &elements).into()
            }
            JsValue::Object(map) => {
                let object = v8::Object::new(scope);
                for (key, value) in map {
                    let key = v8::String::new(scope, key)
                        .ok_or_else(|| format!("Property name '{}' too large", key))?;
                    let value = value.to_v8(scope)?;
                    object
                        .set(scope, key.into(), value)
                        .ok_or_else(|| "Failed to set property".to_string())?;
                }
                object.into()
            }
        };
        Ok(value)
    }
}

// `undefined` has no serde counterpart and serializes as null.
impl Serialize for JsValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            JsValue::Undefined | JsValue::Null => serializer.serialize_none(),
            JsValue::Bool(b) => serializer.serialize_bool(*b),
            JsValue::Int(i) => serializer.serialize_i64(*i),
            JsValue::Float(f) => serializer.serialize_f64(*f),
            JsValue::String(s) => serializer.serialize_str(s),
            JsValue::Array(arr) => arr.serialize(serializer),
            JsValue::Object(obj) => obj.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for JsValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::{self, Visitor};

        struct JsValueVisitor;

        impl<'de> Visitor<'de> for JsValueVisitor {
            type Value = JsValue;

            fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
                formatter
                    .write_str("a JavaScript value (null, bool, number, string, array, or object)")
            }

            fn visit_bool<E>(self, value: bool) -> Result<Self::Value, E> {
                Ok(JsValue::Bool(value))
            }

            fn visit_i64<E>(self, value: i64) -> Result<Self::Value, E> {
                Ok(JsValue::Int(value))
            }

            fn visit_u64<E>(self, value: u64) -> Result<Self::Value, E> {
                match i64::try_from(value) {
                    Ok(value) => Ok(JsValue::Int(value)),
                    Err(_) => Ok(JsValue::Float(value as f64)),
                }
            }

            fn visit_f64<E>(self, value: f64) -> Result<Self::Value, E> {
                Ok(JsValue::Float(value))
            }

            fn visit_str<E>(self, value: &str) -> Result<Self::Value, E> {
                Ok(JsValue::String(value.to_owned()))
            }

            fn visit_string<E>(self, value: String) -> Result<Self::Value, E> {
                Ok(JsValue::String(value))
            }

            fn visit_none<E>(self) -> Result<Self::Value, E> {
                Ok(JsValue::Null)
            }

            fn visit_unit<E>(self) -> Result<Self::Value, E> {
                Ok(JsValue::Null)
            }

            fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
            where
                A: de::SeqAccess<'de>,
            {
                let mut vec = Vec::new();
                while let Some(elem) = seq.next_element()? {
                    vec.push(elem);
                }
                Ok(JsValue::Array(vec))
            }

            fn visit_map<A>(self, mut map: A) -> Result<Self::Value, A::Error>
            where
                A: de::MapAccess<'de>,
            {
                let mut obj = IndexMap::new();
                while let Some((key, value)) = map.next_entry()? {
                    obj.insert(key, value);
                }
                Ok(JsValue::Object(obj))
            }
        }

        deserializer.deserialize_any(JsValueVisitor)
    }
}

/// Tracks depth and size limits during JavaScript value conversion.
pub struct LimitTracker {
    max_depth: usize,
    max_bytes: usize,
    current_depth: usize,
    current_bytes: usize,
}

impl LimitTracker {
    pub fn new(max_depth: usize, max_bytes: usize) -> Self {
        Self {
            max_depth,
            max_bytes,
            current_depth: 0,
            current_bytes: 0,
        }
    }

    /// Enter a new depth level.
    ///
    /// Returns an error if the depth limit is exceeded.
    pub fn enter(&mut self) -> Result<(), String> {
        self.current_depth += 1;
        if self.current_depth > self.max_depth {
            return Err(format!(
                "Depth exceeded maximum limit of {}",
                self.max_depth
            ));
        }
        Ok(())
    }

    pub fn exit(&mut self) {
        self.current_depth = self.current_depth.saturating_sub(1);
    }

    /// Add to the byte count.
    ///
    /// Returns an error if the size limit is exceeded.
    pub fn add_bytes(&mut self, bytes: usize) -> Result<(), String> {
        self.current_bytes += bytes;
        if self.current_bytes > self.max_bytes {
            return Err(format!(
                "Size ({} bytes) exceeded maximum limit of {} bytes",
                self.current_bytes, self.max_bytes
            ));
        }
        Ok(())
    }
}

fn from_v8_internal<'s>(
    scope: &mut v8::HandleScope<'s>,
    value: v8::Local<'s, v8::Value>,
    seen: &mut HashSet<i32>,
    tracker: &mut LimitTracker,
) -> Result<JsValue, String> {
    tracker.enter()?;

    let result = if value.is_undefined() {
        tracker.add_bytes(9)?;
        Ok(JsValue::Undefined)
    } else if value.is_null() {
        tracker.add_bytes(4)?;
        Ok(JsValue::Null)
    } else if value.is_boolean() {
        tracker.add_bytes(5)?; // "false" (worst case)
        Ok(JsValue::Bool(value.boolean_value(scope)))
    } else if value.is_number() {
        let num_val = value
            .number_value(scope)
            .ok_or_else(|| "Failed to convert value to number".to_string())?;
        if num_val.is_finite() && num_val.fract() == 0.0 && !(num_val == 0.0 && num_val.is_sign_negative()) {
            let as_int = num_val as i64;
            if as_int as f64 == num_val {
                tracker.add_bytes(20)?;
                Ok(JsValue::Int(as_int))
            } else {
                tracker.add_bytes(24)?;
                Ok(JsValue::Float(num_val))
            }
        } else {
            tracker.add_bytes(24)?;
            Ok(JsValue::Float(num_val))
        }
    } else if value.is_string() {
        let rust_str = value.to_rust_string_lossy(scope);
        tracker.add_bytes(rust_str.len())?;
        Ok(JsValue::String(rust_str))
    } else if value.is_big_int() {
        let bigint = v8::Local::<v8::BigInt>::try_from(value)
            .map_err(|_| "Failed to cast to BigInt".to_string())?;
        let (val, lossless) = bigint.i64_value();
        if lossless {
            tracker.add_bytes(20)?;
            Ok(JsValue::Int(val))
        } else {
            Err("BigInt value too large to represent as i64".to_string())
        }
    } else if value.is_function() {
        Err("Cannot transfer a function out of the engine".to_string())
    } else if value.is_symbol() {
        Err("Cannot transfer a symbol out of the engine".to_string())
    } else if value.is_array() {
        let array = v8::Local::<v8::Array>::try_from(value)
            .map_err(|_| "Failed to cast to array".to_string())?;
        let hash = array.get_identity_hash().get();
        if !seen.insert(hash) {
            return Err("Cannot transfer circular reference".to_string());
        }

        let len = array.length();
        let mut items = Vec::with_capacity(len as usize);
        for i in 0..len {
            let item = array
                .get_index(scope, i)
                .ok_or_else(|| format!("Failed to get array index {}", i))?;
            items.push(from_v8_internal(scope, item, seen, tracker)?);
        }

        seen.remove(&hash);
        Ok(JsValue::Array(items))
    } else if value.is_object() {
        let obj = v8::Local::<v8::Object>::try_from(value)
            .map_err(|_| "Failed to cast to object".to_string())?;
        let hash = obj.get_identity_hash().get();
        if !seen.insert(hash) {
            return Err("Cannot transfer circular reference".to_string());
        }

        let prop_names = obj
            .get_own_property_names(scope, v8::GetPropertyNamesArgs::default())
            .ok_or_else(|| "Failed to get property names".to_string())?;

        let mut map = IndexMap::new();
        for i in 0..prop_names.length() {
            let key = prop_names
                .get_index(scope, i)
                .ok_or_else(|| "Failed to get property name".to_string())?;
            let key_str = key.to_rust_string_lossy(scope);
            let val = obj
                .get(scope, key)
                .ok_or_else(|| format!("Failed to get property '{}'", key_str))?;

            tracker.add_bytes(key_str.len())?;
            map.insert(key_str, from_v8_internal(scope, val, seen, tracker)?);
        }

        seen.remove(&hash);
        Ok(JsValue::Object(map))
    } else {
        // Fallback: convert to string
        let rust_str = value.to_rust_string_lossy(scope);
        tracker.add_bytes(rust_str.len())?;
        Ok(JsValue::String(rust_str))
    };

    tracker.exit();
    result
}
