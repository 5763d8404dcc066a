//! FHIRcast context synchronization for OctoFHIR.
//!
//! Clinical applications subscribe to a shared topic on a FHIRcast hub and
//! are notified whenever a participant opens or closes a patient, encounter,
//! imaging study or diagnostic report. This crate covers the protocol engine:
//!
//! - [`schema`]: which context keys each event carries and how they bind to
//!   resource types.
//! - [`subscription`]: subscription request validation and the url-encoded
//!   handshake body.
//! - [`payload`]: building and validating outgoing event messages.
//! - [`connection`]: the subscriber-side WebSocket state machine, including
//!   the mandatory acknowledgment of every received event.
//!
//! The HTTP handshake with the hub is left to the caller.

pub mod config;
pub mod connection;
pub mod error;
pub mod observability;
pub mod payload;
pub mod schema;
pub mod subscription;

pub use config::{ConnectionSettings, FhircastConfig, LoggingConfig};
pub use connection::{
    ConnectionState, DisconnectReason, FhircastConnection, FrameError, FrameOutcome, ListenerId,
    Transport, WebSocketConnection, WebSocketDriver, WebSocketTransport, connect_websocket,
};
pub use error::{ErrorCategory, FhircastError, FhircastResult};
pub use payload::{
    AckFrame, EventContext, EventContexts, EventPayload, IdGenerator, MessageBuilder,
    MessagePayload, UuidIdGenerator, create_message_payload, create_message_payload_from_value,
    validate_contexts,
};
pub use schema::{
    ContextKeySchema, EventName, FhircastResourceType, canonical_key_for, is_valid_resource_type,
    key_schema, resource_type_for_key, schema_for,
};
pub use subscription::{
    SubscriptionRequest, serialize_subscription_request, validate_subscription_request,
    validate_subscription_value,
};
