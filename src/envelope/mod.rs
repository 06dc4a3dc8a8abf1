//! CloudEvents-style event envelopes.
//!
//! An [`Envelope`] is immutable once built. New envelopes come from the
//! [`EnvelopeFactory`]; envelopes received from a backend are decoded with
//! [`Envelope::from_slice`]. The attribute names written on the wire depend
//! on the envelope's [`SpecVersion`]:
//!
//! | attribute        | 0.2           | 0.3                   | 1.0               |
//! |------------------|---------------|-----------------------|-------------------|
//! | content type     | `contenttype` | `datacontenttype`     | `datacontenttype` |
//! | schema           | `schemaurl`   | `schemaurl`           | `dataschema`      |
//! | subject          | -             | `subject`             | `subject`         |
//! | content encoding | -             | `datacontentencoding` | -                 |
//!
//! Optional attributes that are absent are omitted from the wire form.

pub mod factory;

pub use factory::{EnvelopeFactory, EnvelopeOptions};

use crate::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
const BASE64_ENCODING: &str = "base64";

/// CloudEvents specification version an envelope is written with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SpecVersion {
    #[serde(rename = "0.2")]
    V0_2,
    #[serde(rename = "0.3")]
    V0_3,
    #[default]
    #[serde(rename = "1.0")]
    V1_0,
}

impl SpecVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecVersion::V0_2 => "0.2",
            SpecVersion::V0_3 => "0.3",
            SpecVersion::V1_0 => "1.0",
        }
    }

    pub fn supports_subject(&self) -> bool {
        !matches!(self, SpecVersion::V0_2)
    }

    pub fn supports_content_encoding(&self) -> bool {
        matches!(self, SpecVersion::V0_3)
    }

    fn content_type_key(&self) -> &'static str {
        match self {
            SpecVersion::V0_2 => "contenttype",
            _ => "datacontenttype",
        }
    }

    fn schema_key(&self) -> &'static str {
        match self {
            SpecVersion::V1_0 => "dataschema",
            _ => "schemaurl",
        }
    }
}

impl fmt::Display for SpecVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SpecVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "0.2" => Ok(SpecVersion::V0_2),
            "0.3" => Ok(SpecVersion::V0_3),
            "1.0" => Ok(SpecVersion::V1_0),
            other => Err(Error::invalid_message(format!(
                "unsupported specversion '{}'",
                other
            ))),
        }
    }
}

/// Event payload carried by an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum EnvelopeData {
    Json(Value),
    Binary(Vec<u8>),
}

/// An immutable event record.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    id: Uuid,
    event_type: String,
    source: String,
    time: DateTime<Utc>,
    spec_version: SpecVersion,
    content_type: String,
    schema: Option<String>,
    subject: Option<String>,
    content_encoding: Option<String>,
    data: EnvelopeData,
}

impl Envelope {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    pub fn spec_version(&self) -> SpecVersion {
        self.spec_version
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    pub fn content_encoding(&self) -> Option<&str> {
        self.content_encoding.as_deref()
    }

    pub fn data(&self) -> &EnvelopeData {
        &self.data
    }

    /// Deserializes a JSON payload into `T`.
    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        match &self.data {
            EnvelopeData::Json(value) => Ok(T::deserialize(value)?),
            EnvelopeData::Binary(bytes) => Ok(serde_json::from_slice(bytes)?),
        }
    }

    /// Builds the wire representation for this envelope's spec version.
    pub fn to_json(&self) -> Value {
        let version = self.spec_version;
        let mut map = Map::new();

        map.insert("specversion".into(), Value::from(version.as_str()));
        map.insert("id".into(), Value::from(self.id.to_string()));
        map.insert("type".into(), Value::from(self.event_type.clone()));
        map.insert("source".into(), Value::from(self.source.clone()));
        map.insert(
            "time".into(),
            Value::from(self.time.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        map.insert(
            version.content_type_key().into(),
            Value::from(self.content_type.clone()),
        );

        if let Some(schema) = &self.schema {
            map.insert(version.schema_key().into(), Value::from(schema.clone()));
        }
        if let Some(subject) = self.subject.as_ref().filter(|_| version.supports_subject()) {
            map.insert("subject".into(), Value::from(subject.clone()));
        }
        if let Some(encoding) = self
            .content_encoding
            .as_ref()
            .filter(|_| version.supports_content_encoding())
        {
            map.insert("datacontentencoding".into(), Value::from(encoding.clone()));
        }

        match (&self.data, version) {
            (EnvelopeData::Json(value), _) => {
                map.insert("data".into(), value.clone());
            }
            (EnvelopeData::Binary(bytes), SpecVersion::V1_0) => {
                map.insert("data_base64".into(), Value::from(BASE64.encode(bytes)));
            }
            (EnvelopeData::Binary(bytes), _) => {
                map.insert("data".into(), Value::from(BASE64.encode(bytes)));
            }
        }

        Value::Object(map)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.to_json())?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.to_json())?)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: Value = serde_json::from_slice(bytes)?;
        Self::from_json(value)
    }

    /// Parses a wire representation, detecting the spec version from
    /// `specversion`.
    pub fn from_json(value: Value) -> Result<Self> {
        let mut map = match value {
            Value::Object(map) => map,
            other => {
                return Err(Error::invalid_message(format!(
                    "envelope must be a JSON object, got {}",
                    other
                )))
            }
        };

        let spec_version: SpecVersion = required_str(&map, "specversion")?.parse()?;
        let id = Uuid::parse_str(required_str(&map, "id")?)
            .map_err(|e| Error::invalid_message(format!("invalid envelope id: {}", e)))?;
        let event_type = required_str(&map, "type")?.to_string();
        let source = required_str(&map, "source")?.to_string();
        let time = DateTime::parse_from_rfc3339(required_str(&map, "time")?)
            .map_err(|e| Error::invalid_message(format!("invalid envelope time: {}", e)))?
            .with_timezone(&Utc);

        let content_type = optional_str(&map, spec_version.content_type_key())?
            .unwrap_or(DEFAULT_CONTENT_TYPE)
            .to_string();
        let schema = optional_str(&map, spec_version.schema_key())?.map(str::to_string);
        let subject = if spec_version.supports_subject() {
            optional_str(&map, "subject")?.map(str::to_string)
        } else {
            None
        };
        let content_encoding = if spec_version.supports_content_encoding() {
            optional_str(&map, "datacontentencoding")?.map(str::to_string)
        } else {
            None
        };

        let data_base64 = optional_str(&map, "data_base64")?
            .map(decode_base64)
            .transpose()?;
        let data = match data_base64 {
            Some(bytes) => EnvelopeData::Binary(bytes),
            None => match (content_encoding.as_deref(), map.remove("data")) {
                (Some(BASE64_ENCODING), Some(Value::String(encoded))) => {
                    EnvelopeData::Binary(decode_base64(&encoded)?)
                }
                // 0.2 has no encoding attribute; binary data travels as a
                // base64 string under a non-JSON content type
                (None, Some(Value::String(encoded)))
                    if spec_version == SpecVersion::V0_2 && !is_json_content_type(&content_type) =>
                {
                    EnvelopeData::Binary(decode_base64(&encoded)?)
                }
                (_, value) => EnvelopeData::Json(value.unwrap_or(Value::Null)),
            },
        };

        Ok(Self {
            id,
            event_type,
            source,
            time,
            spec_version,
            content_type,
            schema,
            subject,
            content_encoding,
            data,
        })
    }
}

impl Serialize for Envelope {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Envelope {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Envelope::from_json(value).map_err(D::Error::custom)
    }
}

fn required_str<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a str> {
    optional_str(map, key)?
        .ok_or_else(|| Error::invalid_message(format!("missing required attribute '{}'", key)))
}

fn optional_str<'a>(map: &'a Map<String, Value>, key: &str) -> Result<Option<&'a str>> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(Error::invalid_message(format!(
            "attribute '{}' must be a string, got {}",
            key, other
        ))),
    }
}

fn is_json_content_type(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    essence.eq_ignore_ascii_case("application/json")
        || essence.eq_ignore_ascii_case("text/json")
        || essence.to_ascii_lowercase().ends_with("+json")
}

fn decode_base64(encoded: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(encoded)
        .map_err(|e| Error::invalid_message(format!("invalid base64 data: {}", e)))
}
