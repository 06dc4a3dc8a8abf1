use super::{Envelope, EnvelopeData, SpecVersion, BASE64_ENCODING, DEFAULT_CONTENT_TYPE};
use crate::config::EventsConfig;
use crate::Result;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

/// Per-call attributes for [`EnvelopeFactory::create`].
///
/// Attributes the factory's spec version does not define are dropped.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeOptions {
    pub content_type: Option<String>,
    pub schema: Option<String>,
    pub subject: Option<String>,
    pub content_encoding: Option<String>,
}

impl EnvelopeOptions {
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn content_encoding(mut self, encoding: impl Into<String>) -> Self {
        self.content_encoding = Some(encoding.into());
        self
    }
}

/// Builds envelopes for one spec version.
///
/// Each envelope gets a fresh UUIDv7 and the current time; neither can be
/// supplied by the caller.
///
/// ```rust
/// use broker_adapter::envelope::{EnvelopeFactory, EnvelopeOptions, SpecVersion};
/// use serde_json::json;
///
/// let factory = EnvelopeFactory::new(SpecVersion::V1_0).with_type_prefix("com.example");
/// let envelope = factory
///     .create("user", "UserCreated", "/users", &json!({"email": "a@b.com"}), EnvelopeOptions::default())
///     .unwrap();
///
/// assert_eq!(envelope.event_type(), "com.example.user.UserCreated");
/// assert_eq!(envelope.content_type(), "application/json");
/// ```
#[derive(Debug, Clone)]
pub struct EnvelopeFactory {
    spec_version: SpecVersion,
    type_prefix: Option<String>,
    default_content_type: String,
}

impl Default for EnvelopeFactory {
    fn default() -> Self {
        Self::new(SpecVersion::default())
    }
}

impl EnvelopeFactory {
    pub fn new(spec_version: SpecVersion) -> Self {
        Self {
            spec_version,
            type_prefix: None,
            default_content_type: DEFAULT_CONTENT_TYPE.to_string(),
        }
    }

    pub fn from_config(config: &EventsConfig) -> Self {
        let mut factory = Self::new(config.spec_version)
            .with_default_content_type(config.content_type.clone());
        if let Some(prefix) = &config.type_prefix {
            factory = factory.with_type_prefix(prefix.clone());
        }
        factory
    }

    /// Sets the reverse-DNS prefix of every event type. An empty prefix
    /// means no prefix.
    pub fn with_type_prefix(mut self, prefix: impl Into<String>) -> Self {
        let prefix = prefix.into();
        self.type_prefix = if prefix.is_empty() { None } else { Some(prefix) };
        self
    }

    pub fn with_default_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.default_content_type = content_type.into();
        self
    }

    pub fn spec_version(&self) -> SpecVersion {
        self.spec_version
    }

    pub fn event_type(&self, aggregate: &str, event_type: &str) -> String {
        match &self.type_prefix {
            Some(prefix) => format!("{}.{}.{}", prefix, aggregate, event_type),
            None => format!("{}.{}", aggregate, event_type),
        }
    }

    pub fn create<T: Serialize + ?Sized>(
        &self,
        aggregate: &str,
        event_type: &str,
        source: &str,
        data: &T,
        options: EnvelopeOptions,
    ) -> Result<Envelope> {
        let data = EnvelopeData::Json(serde_json::to_value(data)?);
        Ok(self.build(aggregate, event_type, source, data, options))
    }

    pub fn create_binary(
        &self,
        aggregate: &str,
        event_type: &str,
        source: &str,
        data: Vec<u8>,
        mut options: EnvelopeOptions,
    ) -> Envelope {
        if self.spec_version.supports_content_encoding() {
            options.content_encoding = Some(BASE64_ENCODING.to_string());
        }
        if options.content_type.is_none() {
            options.content_type = Some("application/octet-stream".to_string());
        }
        self.build(aggregate, event_type, source, EnvelopeData::Binary(data), options)
    }

    fn build(
        &self,
        aggregate: &str,
        event_type: &str,
        source: &str,
        data: EnvelopeData,
        options: EnvelopeOptions,
    ) -> Envelope {
        let version = self.spec_version;

        Envelope {
            id: Uuid::now_v7(),
            event_type: self.event_type(aggregate, event_type),
            source: source.to_string(),
            time: Utc::now(),
            spec_version: version,
            content_type: options
                .content_type
                .unwrap_or_else(|| self.default_content_type.clone()),
            schema: options.schema,
            subject: options.subject.filter(|_| version.supports_subject()),
            content_encoding: options
                .content_encoding
                .filter(|_| version.supports_content_encoding()),
            data,
        }
    }
}
