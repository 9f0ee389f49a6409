use std::collections::BTreeMap;
use std::fmt;

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, RpcError};

/// Named call parameters. Keys are unique and matched case-insensitively.
///
/// The spelling of the most recent insert is kept for serialization, and a
/// later duplicate (differing only in case) replaces the earlier value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Parameters {
    entries: BTreeMap<String, (String, Value)>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build parameters from any value that serializes to a JSON object.
    /// `null` and `()` give an empty set.
    pub fn from_serializable(params: impl Serialize) -> Result<Self> {
        match serde_json::to_value(params)? {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self::from(map)),
            other => Err(RpcError::InvalidArgument(format!(
                "named parameters must serialize to a JSON object, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Insert a parameter, replacing any existing one with the same name in any case
    pub fn insert(&mut self, name: impl Into<String>, value: Value) -> Option<Value> {
        let name = name.into();
        self.entries
            .insert(name.to_lowercase(), (name, value))
            .map(|(_, previous)| previous)
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.get(&name.to_lowercase()).map(|(_, value)| value)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_lowercase())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate as `(name, value)` using the stored spelling of each name
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries
            .values()
            .map(|(name, value)| (name.as_str(), value))
    }

    /// Apply [`normalize_number`] to every value
    pub fn normalized(self) -> Self {
        let entries = self
            .entries
            .into_iter()
            .map(|(key, (name, value))| (key, (name, normalize_number(value))))
            .collect();
        Self { entries }
    }

    pub fn into_map(self) -> Map<String, Value> {
        self.entries.into_values().collect()
    }
}

impl From<Map<String, Value>> for Parameters {
    fn from(map: Map<String, Value>) -> Self {
        let mut params = Self::new();
        for (name, value) in map {
            params.insert(name, value);
        }
        params
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for Parameters {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        let mut params = Self::new();
        for (name, value) in iter {
            params.insert(name, value);
        }
        params
    }
}

impl Serialize for Parameters {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (name, value) in self.iter() {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Parameters {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct ParametersVisitor;

        impl<'de> Visitor<'de> for ParametersVisitor {
            type Value = Parameters;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of parameter names to JSON values, or null")
            }

            fn visit_unit<E: serde::de::Error>(self) -> std::result::Result<Parameters, E> {
                Ok(Parameters::new())
            }

            fn visit_none<E: serde::de::Error>(self) -> std::result::Result<Parameters, E> {
                Ok(Parameters::new())
            }

            fn visit_some<D: Deserializer<'de>>(
                self,
                deserializer: D,
            ) -> std::result::Result<Parameters, D::Error> {
                deserializer.deserialize_any(self)
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Parameters, A::Error> {
                let mut params = Parameters::new();
                while let Some((name, value)) = access.next_entry::<String, Value>()? {
                    params.insert(name, value);
                }
                Ok(params)
            }
        }

        deserializer.deserialize_option(ParametersVisitor)
    }
}

/// Arguments for one call: leading positional values plus named values.
///
/// The native protocol only carries named arguments; the compatibility
/// protocol carries both.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallArguments {
    pub positional: Vec<Value>,
    pub named: Parameters,
}

impl CallArguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// Interpret a serializable value: objects become named arguments,
    /// arrays become positional arguments, `null` means no arguments.
    pub fn from_serializable(params: impl Serialize) -> Result<Self> {
        match serde_json::to_value(params)? {
            Value::Null => Ok(Self::new()),
            Value::Object(map) => Ok(Self::from(Parameters::from(map))),
            Value::Array(values) => Ok(Self {
                positional: values,
                named: Parameters::new(),
            }),
            other => Err(RpcError::InvalidArgument(format!(
                "call arguments must serialize to an object or array, got {}",
                json_kind(&other)
            ))),
        }
    }

    /// Append a positional argument
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// Add a named argument
    pub fn named(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.named.insert(name, value.into());
        self
    }
}

impl From<Parameters> for CallArguments {
    fn from(named: Parameters) -> Self {
        Self {
            positional: Vec::new(),
            named,
        }
    }
}

/// Decoded inbound request, independent of the wire protocol that carried it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(rename = "Method", alias = "method", default)]
    pub method: String,
    #[serde(rename = "Parameters", alias = "parameters", default)]
    pub parameters: Parameters,
    /// Positional arguments; only the compatibility protocol fills this
    #[serde(skip)]
    pub positional: Vec<Value>,
}

impl RpcRequest {
    pub fn new(method: impl Into<String>, parameters: Parameters) -> Self {
        Self {
            method: method.into(),
            parameters,
            positional: Vec::new(),
        }
    }

    pub fn with_positional(mut self, positional: Vec<Value>) -> Self {
        self.positional = positional;
        self
    }
}

/// Error reported by the serving side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(rename = "Message", alias = "message", default)]
    pub message: String,
    #[serde(rename = "ErrorType", alias = "errorType", alias = "error_type", default)]
    pub error_type: Option<String>,
    #[serde(
        rename = "StackTrace",
        alias = "stackTrace",
        alias = "stack_trace",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stack_trace: Option<String>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>, error_type: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error_type: Some(error_type.into()),
            stack_trace: None,
        }
    }

    pub fn with_stack_trace(mut self, stack_trace: impl Into<String>) -> Self {
        self.stack_trace = Some(stack_trace.into());
        self
    }

    /// The reported error type, `RpcError` when the server sent none
    pub fn kind(&self) -> &str {
        self.error_type.as_deref().unwrap_or(error_types::RPC_ERROR)
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind(), self.message)
    }
}

/// Response envelope. Success iff `error` is absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    #[serde(rename = "Result", alias = "result", default)]
    pub result: Option<Value>,
    #[serde(rename = "Error", alias = "error", default)]
    pub error: Option<RemoteError>,
}

impl RpcResponse {
    pub fn success(result: Option<Value>) -> Self {
        Self {
            result: result.filter(|value| !value.is_null()),
            error: None,
        }
    }

    pub fn failure(error: RemoteError) -> Self {
        Self {
            result: None,
            error: Some(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Error type names used in response envelopes produced by this crate
pub mod error_types {
    pub const PROTOCOL_ERROR: &str = "ProtocolError";
    pub const METHOD_NOT_FOUND: &str = "MethodNotFound";
    pub const ARGUMENT_ERROR: &str = "ArgumentError";
    pub const ACTIVATION_ERROR: &str = "ActivationError";
    pub const SERIALIZATION_ERROR: &str = "SerializationError";
    pub const PANIC: &str = "Panic";
    pub const RPC_ERROR: &str = "RpcError";
}

/// Prefer an integer representation for whole-valued floats, recursively
pub fn normalize_number(value: Value) -> Value {
    match value {
        Value::Number(number) if number.is_f64() => match number.as_f64() {
            Some(float)
                if float.fract() == 0.0 && float >= i64::MIN as f64 && float < i64::MAX as f64 =>
            {
                Value::from(float as i64)
            }
            _ => Value::Number(number),
        },
        Value::Array(values) => Value::Array(values.into_iter().map(normalize_number).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key, normalize_number(value)))
                .collect(),
        ),
        other => other,
    }
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
