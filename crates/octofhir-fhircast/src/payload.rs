//! FHIRcast message payloads.
//!
//! Builds and validates the event messages a publisher sends to the hub, and
//! defines the wire types shared with the receiving side of a connection.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use crate::error::{FhircastError, FhircastResult};
use crate::schema::{self, EventName, FhircastResourceType};

/// A single resource reference inside an event context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventContext {
    pub key: String,
    /// FHIR resource, carrying at least `resourceType` and `id`.
    pub resource: Value,
}

impl EventContext {
    pub fn new(key: impl Into<String>, resource: Value) -> Self {
        Self {
            key: key.into(),
            resource,
        }
    }
}

/// One context or many, as accepted by the payload builder.
#[derive(Debug, Clone, PartialEq)]
pub enum EventContexts {
    Single(EventContext),
    Many(Vec<EventContext>),
}

impl EventContexts {
    pub fn into_vec(self) -> Vec<EventContext> {
        match self {
            EventContexts::Single(context) => vec![context],
            EventContexts::Many(contexts) => contexts,
        }
    }
}

impl From<EventContext> for EventContexts {
    fn from(context: EventContext) -> Self {
        EventContexts::Single(context)
    }
}

impl From<Vec<EventContext>> for EventContexts {
    fn from(contexts: Vec<EventContext>) -> Self {
        EventContexts::Many(contexts)
    }
}

impl<const N: usize> From<[EventContext; N]> for EventContexts {
    fn from(contexts: [EventContext; N]) -> Self {
        EventContexts::Many(contexts.into())
    }
}

/// The `event` section of a FHIRcast message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPayload {
    #[serde(rename = "hub.topic")]
    pub topic: String,
    #[serde(rename = "hub.event")]
    pub event: EventName,
    pub context: Vec<EventContext>,
    #[serde(
        rename = "context.versionId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub context_version_id: Option<String>,
}

/// A complete FHIRcast message as exchanged over the hub.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub id: String,
    pub event: EventPayload,
}

impl MessagePayload {
    /// Attach the context version this message was produced against.
    pub fn with_version_id(mut self, version_id: impl Into<String>) -> Self {
        self.event.context_version_id = Some(version_id.into());
        self
    }

    /// Serialize for transmission.
    pub fn to_json(&self) -> FhircastResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Acknowledgment frame a subscriber echoes back for every event message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckFrame {
    pub id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl AckFrame {
    pub fn for_message(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            timestamp: OffsetDateTime::now_utc(),
        }
    }

    pub fn to_json(&self) -> FhircastResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Source of message ids. Messages from independent publishers share one
/// topic, so implementations must be collision resistant.
pub trait IdGenerator: Send + Sync {
    fn generate_id(&self) -> String;
}

/// Random (v4) UUID ids.
#[derive(Debug, Default, Clone, Copy)]
pub struct UuidIdGenerator;

impl IdGenerator for UuidIdGenerator {
    fn generate_id(&self) -> String {
        uuid::Uuid::new_v4().to_string()
    }
}

/// Builds validated FHIRcast message payloads.
#[derive(Clone)]
pub struct MessageBuilder {
    id_generator: Arc<dyn IdGenerator>,
}

impl MessageBuilder {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UuidIdGenerator))
    }

    pub fn with_id_generator(id_generator: Arc<dyn IdGenerator>) -> Self {
        Self { id_generator }
    }

    /// Validate `contexts` against the schema of `event` and wrap them in a
    /// fresh message with a new id and the current timestamp.
    pub fn build(
        &self,
        topic: &str,
        event: EventName,
        contexts: impl Into<EventContexts>,
    ) -> FhircastResult<MessagePayload> {
        if topic.is_empty() {
            return Err(FhircastError::validation("Must provide a topic."));
        }

        let contexts = contexts.into().into_vec();
        validate_contexts(event, &contexts)?;

        let payload = MessagePayload {
            timestamp: OffsetDateTime::now_utc(),
            id: self.id_generator.generate_id(),
            event: EventPayload {
                topic: topic.to_string(),
                event,
                context: contexts,
                context_version_id: None,
            },
        };

        tracing::debug!(
            topic = topic,
            event = %event,
            message_id = %payload.id,
            contexts = payload.event.context.len(),
            "Built FHIRcast message payload"
        );
        Ok(payload)
    }

    /// Same as [`MessageBuilder::build`] for untyped input, such as an event
    /// name and contexts taken from a JSON request body.
    pub fn build_from_value(
        &self,
        topic: &str,
        event: &str,
        contexts: &Value,
    ) -> FhircastResult<MessagePayload> {
        if topic.is_empty() {
            return Err(FhircastError::validation("Must provide a topic."));
        }
        let event: EventName = event.parse()?;

        let items: Vec<&Value> = match contexts {
            Value::Object(_) => vec![contexts],
            Value::Array(items) if items.iter().all(Value::is_object) => items.iter().collect(),
            _ => {
                return Err(FhircastError::validation(
                    "context must be a context object or array of context objects.",
                ));
            }
        };

        let mut normalized = Vec::with_capacity(items.len());
        for (i, item) in items.into_iter().enumerate() {
            let key = item
                .get("key")
                .and_then(Value::as_str)
                .filter(|key| !key.is_empty())
                .ok_or_else(|| {
                    FhircastError::validation(format!(
                        "context[{i}] is invalid. Context must contain a key."
                    ))
                })?;
            let resource = item.get("resource").cloned().unwrap_or(Value::Null);
            normalized.push(EventContext::new(key, resource));
        }

        self.build(topic, event, normalized)
    }
}

impl Default for MessageBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MessageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBuilder").finish_non_exhaustive()
    }
}

/// Build a message payload with the default id generator.
pub fn create_message_payload(
    topic: &str,
    event: EventName,
    contexts: impl Into<EventContexts>,
) -> FhircastResult<MessagePayload> {
    MessageBuilder::new().build(topic, event, contexts)
}

/// Build a message payload from untyped input with the default id generator.
pub fn create_message_payload_from_value(
    topic: &str,
    event: &str,
    contexts: &Value,
) -> FhircastResult<MessagePayload> {
    MessageBuilder::new().build_from_value(topic, event, contexts)
}

/// Check a list of contexts against the schema of `event`.
///
/// Fails fast on the first violation: per-context checks run in list order,
/// then cardinality is checked for every key in schema order.
pub fn validate_contexts(event: EventName, contexts: &[EventContext]) -> FhircastResult<()> {
    let schema = schema::schema_for(event);
    let mut seen = vec![0usize; schema.len()];

    for (i, context) in contexts.iter().enumerate() {
        let Some(position) = schema.iter().position(|entry| entry.key == context.key) else {
            return Err(FhircastError::validation(format!(
                "Key '{}' not found for event '{event}'. Make sure to add only valid keys.",
                context.key
            )));
        };
        seen[position] += 1;
        validate_context(event, context, i, schema[position].resource_type)?;
    }

    for (entry, count) in schema.iter().zip(&seen) {
        if !entry.optional && *count == 0 {
            return Err(FhircastError::validation(format!(
                "Missing required key '{}' on context for '{event}' event.",
                entry.key
            )));
        }
        if !entry.many_allowed && *count > 1 {
            return Err(FhircastError::validation(format!(
                "{count} context entries with key '{}' found for the '{event}' event when schema only allows for 1.",
                entry.key
            )));
        }
    }

    Ok(())
}

fn validate_context(
    event: EventName,
    context: &EventContext,
    i: usize,
    expected: FhircastResourceType,
) -> FhircastResult<()> {
    let invalid = |reason: String| FhircastError::validation(format!("context[{i}] is invalid. {reason}"));

    let Some(resource) = context.resource.as_object() else {
        return Err(invalid(
            "Context must contain a single valid FHIR resource! Resource is not an object.".into(),
        ));
    };

    if !resource
        .get("id")
        .and_then(Value::as_str)
        .is_some_and(|id| !id.is_empty())
    {
        return Err(invalid("Resource must contain a valid string ID.".into()));
    }

    let resource_type = match resource.get("resourceType") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) if s.is_empty() => None,
        Some(other) => Some(other),
    };
    let Some(resource_type) = resource_type else {
        return Err(invalid(
            "Resource must contain a resource type. No resource type found.".into(),
        ));
    };

    let resource_type = resource_type
        .as_str()
        .filter(|name| schema::is_valid_resource_type(name))
        .and_then(|name| name.parse::<FhircastResourceType>().ok())
        .ok_or_else(|| {
            invalid(
                "Resource must contain a valid FHIRcast resource type. Resource type is not a known resource type."
                    .into(),
            )
        })?;

    if resource_type != expected {
        return Err(invalid(format!(
            "context[{i}] for the '{event}' event should contain resource of type {expected}."
        )));
    }

    let expected_key = schema::canonical_key_for(resource_type);
    if expected_key != context.key {
        return Err(invalid(format!(
            "Context key for type {resource_type} must be {expected_key}."
        )));
    }

    Ok(())
}
