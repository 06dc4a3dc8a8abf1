//! Aggregate to topic mapping and topic provisioning.
//!
//! Every adapter owns one [`TopicRegistry`]. Its descriptors are built from
//! configuration and only mutated during `init`, when backend ids (topic
//! names for Kafka, ARNs for SNS) are bound.

use crate::config::Config;
use crate::error::TopicFailure;
use crate::{Error, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, info, warn};

/// How a descriptor's backend id was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Given in configuration, or the topic name itself for Kafka.
    Static,
    /// Built from region and account id without a network call.
    Templated,
    /// Found in a listing of the backend's topics.
    Listed,
    /// Returned by a creation call during provisioning.
    Provisioned,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResolutionStrategy::Static => "static",
            ResolutionStrategy::Templated => "templated",
            ResolutionStrategy::Listed => "listed",
            ResolutionStrategy::Provisioned => "provisioned",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescriptor {
    pub aggregate: String,
    pub name: String,
    pub partitions: Option<i32>,
    pub replication_factor: Option<i32>,
    pub config_entries: BTreeMap<String, String>,
    backend_id: Option<String>,
    resolution: Option<ResolutionStrategy>,
}

impl TopicDescriptor {
    pub fn new(aggregate: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            aggregate: aggregate.into(),
            name: name.into(),
            partitions: None,
            replication_factor: None,
            config_entries: BTreeMap::new(),
            backend_id: None,
            resolution: None,
        }
    }

    pub fn backend_id(&self) -> Option<&str> {
        self.backend_id.as_deref()
    }

    pub fn resolution(&self) -> Option<ResolutionStrategy> {
        self.resolution
    }

    pub fn is_resolved(&self) -> bool {
        self.backend_id.is_some()
    }

    /// True when `existing` names this topic, either exactly or as an ARN
    /// whose last segment is the topic name.
    pub fn matches(&self, existing: &str) -> bool {
        existing == self.name
            || existing
                .strip_suffix(self.name.as_str())
                .map_or(false, |prefix| prefix.ends_with(':'))
    }
}

#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    descriptors: BTreeMap<String, TopicDescriptor>,
}

impl TopicRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds descriptors from the `[topics]` table. ARNs given in
    /// configuration are bound immediately with [`ResolutionStrategy::Static`].
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::new();
        for (aggregate, topic) in &config.topics {
            let mut descriptor = TopicDescriptor::new(aggregate.clone(), topic.topic.clone());
            descriptor.partitions = topic.partitions;
            descriptor.replication_factor = topic.replication_factor;
            descriptor.config_entries = topic.config_entries.clone();
            if let Some(arn) = &topic.arn {
                descriptor.backend_id = Some(arn.clone());
                descriptor.resolution = Some(ResolutionStrategy::Static);
            }
            registry.insert(descriptor);
        }
        registry
    }

    pub fn insert(&mut self, descriptor: TopicDescriptor) {
        self.descriptors
            .insert(descriptor.aggregate.clone(), descriptor);
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &TopicDescriptor> {
        self.descriptors.values()
    }

    pub fn descriptor(&self, aggregate: &str) -> Option<&TopicDescriptor> {
        self.descriptors.get(aggregate)
    }

    /// Backend id of the aggregate's topic.
    pub fn resolve(&self, aggregate: &str) -> Result<&str> {
        self.descriptors
            .get(aggregate)
            .and_then(TopicDescriptor::backend_id)
            .ok_or_else(|| Error::UnknownAggregate {
                aggregate: aggregate.to_string(),
            })
    }

    pub fn resolution(&self, aggregate: &str) -> Option<ResolutionStrategy> {
        self.descriptors.get(aggregate).and_then(|d| d.resolution)
    }

    /// Binds a backend id. Unknown aggregates are ignored.
    pub fn bind(&mut self, aggregate: &str, backend_id: impl Into<String>, strategy: ResolutionStrategy) {
        if let Some(descriptor) = self.descriptors.get_mut(aggregate) {
            let backend_id = backend_id.into();
            info!(
                aggregate = %aggregate,
                topic = %backend_id,
                strategy = %strategy,
                "Resolved topic"
            );
            descriptor.backend_id = Some(backend_id);
            descriptor.resolution = Some(strategy);
        }
    }

    /// Uses each topic name as its backend id.
    pub fn bind_names(&mut self) {
        let unresolved: Vec<(String, String)> = self
            .unresolved()
            .map(|d| (d.aggregate.clone(), d.name.clone()))
            .collect();
        for (aggregate, name) in unresolved {
            self.bind(&aggregate, name, ResolutionStrategy::Static);
        }
    }

    /// Binds every unresolved descriptor to `arn:aws:sns:{region}:{account}:{name}`.
    pub fn template_arns(&mut self, region: &str, account_id: &str) {
        let unresolved: Vec<(String, String)> = self
            .unresolved()
            .map(|d| (d.aggregate.clone(), d.name.clone()))
            .collect();
        for (aggregate, name) in unresolved {
            let arn = format!("arn:aws:sns:{}:{}:{}", region, account_id, name);
            self.bind(&aggregate, arn, ResolutionStrategy::Templated);
        }
    }

    /// Binds unresolved descriptors found in `existing`. Returns how many
    /// were bound.
    pub fn match_listing(&mut self, existing: &[String]) -> usize {
        let matched: Vec<(String, String)> = self
            .unresolved()
            .filter_map(|d| {
                existing
                    .iter()
                    .find(|candidate| d.matches(candidate))
                    .map(|found| (d.aggregate.clone(), found.clone()))
            })
            .collect();
        let count = matched.len();
        for (aggregate, backend_id) in matched {
            self.bind(&aggregate, backend_id, ResolutionStrategy::Listed);
        }
        count
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &TopicDescriptor> {
        self.descriptors.values().filter(|d| !d.is_resolved())
    }

    /// Reverse lookup from a backend id or topic name to its aggregate.
    pub fn aggregate_for_topic(&self, topic: &str) -> Option<&str> {
        self.descriptors
            .values()
            .find(|d| d.backend_id() == Some(topic) || d.name == topic)
            .map(|d| d.aggregate.as_str())
    }
}

/// Result of creating one topic.
#[derive(Debug, Clone)]
pub struct TopicOutcome {
    pub topic: String,
    /// Backend id on success, when the backend returns one.
    pub result: std::result::Result<Option<String>, String>,
}

/// Topic listing and creation on one backend.
#[async_trait]
pub trait TopicAdmin: Send + Sync {
    /// Names or ARNs of every topic the backend knows.
    async fn list_topics(&self) -> Result<Vec<String>>;

    /// Creates topics, reporting one outcome per descriptor. An
    /// already-existing topic is a success.
    async fn create_topics(&self, topics: &[TopicDescriptor]) -> Result<Vec<TopicOutcome>>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionReport {
    pub existing: Vec<String>,
    pub created: Vec<String>,
}

/// Lists the backend once, binds topics that already exist and creates the
/// rest. Every failed creation is collected before returning
/// [`Error::ProvisioningFailure`].
pub async fn provision<A>(registry: &mut TopicRegistry, admin: &A) -> Result<ProvisionReport>
where
    A: TopicAdmin + ?Sized,
{
    let listing = admin.list_topics().await?;
    debug!("Backend lists {} topic(s)", listing.len());

    let mut report = ProvisionReport::default();
    let mut missing = Vec::new();
    let mut listed = Vec::new();
    for descriptor in registry.descriptors() {
        match listing.iter().find(|existing| descriptor.matches(existing)) {
            Some(existing) => {
                info!("Topic '{}' already exists", descriptor.name);
                report.existing.push(existing.clone());
                if !descriptor.is_resolved() {
                    listed.push((descriptor.aggregate.clone(), existing.clone()));
                }
            }
            None => missing.push(descriptor.clone()),
        }
    }
    for (aggregate, backend_id) in listed {
        registry.bind(&aggregate, backend_id, ResolutionStrategy::Listed);
    }

    if missing.is_empty() {
        return Ok(report);
    }

    info!("Creating {} missing topic(s)", missing.len());
    let outcomes = admin.create_topics(&missing).await?;

    let mut failures = Vec::new();
    for outcome in outcomes {
        match outcome.result {
            Ok(backend_id) => {
                info!("Successfully created topic: {}", outcome.topic);
                if let Some(descriptor) = missing
                    .iter()
                    .find(|d| d.name == outcome.topic && !d.is_resolved())
                {
                    let backend_id = backend_id.unwrap_or_else(|| descriptor.name.clone());
                    registry.bind(&descriptor.aggregate, backend_id, ResolutionStrategy::Provisioned);
                }
                report.created.push(outcome.topic);
            }
            Err(reason) => {
                warn!("Failed to create topic '{}': {}", outcome.topic, reason);
                failures.push(TopicFailure {
                    topic: outcome.topic,
                    reason,
                });
            }
        }
    }

    if failures.is_empty() {
        Ok(report)
    } else {
        Err(Error::ProvisioningFailure { failures })
    }
}

/// Binds topics that already exist without creating any. Aggregates left
/// unresolved fail with [`Error::UnknownAggregate`] on first use.
pub async fn resolve_existing<A>(registry: &mut TopicRegistry, admin: &A) -> Result<usize>
where
    A: TopicAdmin + ?Sized,
{
    let listing = admin.list_topics().await?;
    let bound = registry.match_listing(&listing);
    for descriptor in registry.unresolved() {
        warn!(
            aggregate = %descriptor.aggregate,
            topic = %descriptor.name,
            "Topic not found on backend, aggregate left unresolved"
        );
    }
    Ok(bound)
}
