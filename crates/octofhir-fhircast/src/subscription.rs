//! FHIRcast subscription requests.
//!
//! A request without an endpoint is pending; the hub hands back a WebSocket
//! endpoint during the HTTP handshake, which completes the request.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::form_urlencoded;

use crate::error::{FhircastError, FhircastResult};
use crate::schema::EventName;

pub const CHANNEL_TYPE_WEBSOCKET: &str = "websocket";
pub const MODE_SUBSCRIBE: &str = "subscribe";
pub const MODE_UNSUBSCRIBE: &str = "unsubscribe";

/// A FHIRcast subscription request.
///
/// Wire fields are kept as plain strings; [`SubscriptionRequest::validate`]
/// decides whether they form a request the hub will accept.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRequest {
    pub channel_type: String,
    pub mode: String,
    pub events: Vec<String>,
    pub topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

impl SubscriptionRequest {
    /// Pending subscribe request over WebSocket.
    pub fn subscribe(topic: impl Into<String>, events: &[EventName]) -> Self {
        Self::pending(MODE_SUBSCRIBE, topic, events)
    }

    /// Pending unsubscribe request over WebSocket.
    pub fn unsubscribe(topic: impl Into<String>, events: &[EventName]) -> Self {
        Self::pending(MODE_UNSUBSCRIBE, topic, events)
    }

    fn pending(mode: &str, topic: impl Into<String>, events: &[EventName]) -> Self {
        Self {
            channel_type: CHANNEL_TYPE_WEBSOCKET.to_string(),
            mode: mode.to_string(),
            events: events.iter().map(|e| e.as_str().to_string()).collect(),
            topic: topic.into(),
            endpoint: None,
        }
    }

    /// Complete the request with the endpoint returned by the hub.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Whether the hub has handed back an endpoint for this request.
    pub fn is_completed(&self) -> bool {
        self.endpoint.as_deref().is_some_and(|e| !e.is_empty())
    }

    /// Check the request against the structural rules, first failure wins.
    pub fn validate(&self) -> bool {
        if self.channel_type.is_empty()
            || self.mode.is_empty()
            || self.topic.is_empty()
            || self.events.is_empty()
        {
            return false;
        }
        if self.channel_type != CHANNEL_TYPE_WEBSOCKET {
            return false;
        }
        if self.mode != MODE_SUBSCRIBE && self.mode != MODE_UNSUBSCRIBE {
            return false;
        }
        if !self.events.iter().all(|event| EventName::is_known(event)) {
            return false;
        }
        // An empty endpoint counts as absent, matching `is_completed`.
        if self.is_completed()
            && !self
                .endpoint
                .as_deref()
                .is_some_and(|endpoint| endpoint.starts_with("ws"))
        {
            return false;
        }
        true
    }

    /// Serialize into the url-encoded form body of the hub handshake.
    pub fn serialize(&self) -> FhircastResult<String> {
        if !self.validate() {
            return Err(FhircastError::validation(
                "subscriptionRequest must be an object conforming to SubscriptionRequest type.",
            ));
        }

        let mut form = form_urlencoded::Serializer::new(String::new());
        form.append_pair("hub.channel.type", &self.channel_type)
            .append_pair("hub.mode", &self.mode)
            .append_pair("hub.topic", &self.topic)
            .append_pair("hub.events", &self.events.join(","));
        if let Some(endpoint) = self.endpoint.as_deref().filter(|e| !e.is_empty()) {
            form.append_pair("endpoint", endpoint);
        }
        Ok(form.finish())
    }
}

pub fn validate_subscription_request(request: &SubscriptionRequest) -> bool {
    request.validate()
}

pub fn serialize_subscription_request(request: &SubscriptionRequest) -> FhircastResult<String> {
    request.serialize()
}

/// Validate an untyped subscription request, e.g. one decoded from JSON.
///
/// Applies the object/presence/type checks that the typed struct cannot
/// express and then defers to [`SubscriptionRequest::validate`].
pub fn validate_subscription_value(value: &Value) -> bool {
    let Some(object) = value.as_object() else {
        return false;
    };

    let present = |field: &str| match object.get(field) {
        None | Some(Value::Null) => false,
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Bool(b)) => *b,
        Some(_) => true,
    };
    if !["channelType", "mode", "topic", "events"]
        .iter()
        .all(|field| present(field))
    {
        return false;
    }
    if !object.get("topic").is_some_and(Value::is_string) {
        return false;
    }
    if !object.get("events").is_some_and(Value::is_array) {
        return false;
    }
    if object
        .get("endpoint")
        .is_some_and(|endpoint| !endpoint.is_null() && !endpoint.is_string())
    {
        return false;
    }

    match serde_json::from_value::<SubscriptionRequest>(value.clone()) {
        Ok(request) => request.validate(),
        Err(_) => false,
    }
}
