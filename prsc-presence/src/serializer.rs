//! Event payload serialization.
//!
//! Broadcast payloads are arbitrary application data, so this layer never
//! fails: a value that cannot be represented as JSON degrades to a raw
//! MessagePack encoding, and text that does not parse as JSON is handed
//! back unchanged.

use std::fmt;

use bytes::Bytes;
use serde::de::{self, DeserializeOwned, Deserializer, Visitor};
use serde::ser::{self, Serializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::logger::Logger;

/// Wire form of an event's data.
///
/// Encoded inside a [`DataEnvelope`](crate::protocol::DataEnvelope) as a
/// MessagePack string (`Text`) or `bin` (`Raw`).
#[derive(Debug, Clone, PartialEq)]
pub enum Serialized {
    /// Canonical JSON text
    Text(String),
    /// The value MessagePack-encoded as-is, because JSON refused it
    Raw(Bytes),
    /// Neither encoding accepted the value. Placing this in a frame fails.
    Unencodable(String),
}

impl Serialized {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }
}

impl Serialize for Serialized {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Text(text) => serializer.serialize_str(text),
            Self::Raw(raw) => serializer.serialize_bytes(raw),
            Self::Unencodable(reason) => Err(ser::Error::custom(format!(
                "data must be serializable: {reason}"
            ))),
        }
    }
}

struct SerializedVisitor;

impl<'de> Visitor<'de> for SerializedVisitor {
    type Value = Serialized;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a string or byte array")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Serialized, E> {
        Ok(Serialized::Text(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Serialized, E> {
        Ok(Serialized::Text(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Serialized, E> {
        Ok(Serialized::Raw(Bytes::copy_from_slice(v)))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Serialized, E> {
        Ok(Serialized::Raw(Bytes::from(v)))
    }
}

impl<'de> Deserialize<'de> for Serialized {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_any(SerializedVisitor)
    }
}

/// JSON serializer for event data.
pub struct JsonSerializer;

impl JsonSerializer {
    /// Serialize any value. Never fails; see [`Serialized`].
    ///
    /// Degradations are reported through `logger`.
    pub fn serialize<T: Serialize + ?Sized>(value: &T, logger: &Logger) -> Serialized {
        match serde_json::to_string(value) {
            Ok(text) => Serialized::Text(text),
            Err(e) => {
                logger.warn(format_args!("Failed to serialize the value to JSON: {e}"));
                match rmp_serde::to_vec_named(value) {
                    Ok(raw) => Serialized::Raw(Bytes::from(raw)),
                    Err(e) => {
                        logger.warn(format_args!("Failed to serialize the value at all: {e}"));
                        Serialized::Unencodable(e.to_string())
                    }
                }
            }
        }
    }

    /// Deserialize event data into a JSON value.
    ///
    /// Text that is not valid JSON comes back as `Value::String` unchanged.
    pub fn deserialize(data: &Serialized, logger: &Logger) -> Value {
        match data {
            Serialized::Text(text) => Self::deserialize_str(text, logger),
            Serialized::Raw(raw) => rmp_serde::from_slice(raw).unwrap_or_else(|e| {
                logger.warn(format_args!("Failed to deserialize raw payload: {e}"));
                Value::Null
            }),
            Serialized::Unencodable(_) => Value::Null,
        }
    }

    pub fn deserialize_str(text: &str, logger: &Logger) -> Value {
        serde_json::from_str(text).unwrap_or_else(|e| {
            logger.warn(format_args!("Failed to deserialize the JSON string: {e}"));
            Value::String(text.to_string())
        })
    }

    /// Decode event data straight into `T`.
    ///
    /// Unlike [`JsonSerializer::deserialize`] this also recovers `Raw`
    /// payloads whose shape JSON cannot express (e.g. integer map keys).
    pub fn deserialize_as<T: DeserializeOwned>(data: &Serialized) -> Option<T> {
        match data {
            Serialized::Text(text) => serde_json::from_str(text).ok(),
            Serialized::Raw(raw) => rmp_serde::from_slice(raw).ok(),
            Serialized::Unencodable(_) => None,
        }
    }
}
