//! Transport seam between the connection state machine and the socket.
//!
//! A transport carries text frames to the hub. Inbound notifications flow the
//! other way: whoever owns the socket calls [`FhircastConnection::handle_open`],
//! [`FhircastConnection::handle_message`] and [`FhircastConnection::handle_close`]
//! in arrival order.
//!
//! [`FhircastConnection::handle_open`]: super::FhircastConnection::handle_open
//! [`FhircastConnection::handle_message`]: super::FhircastConnection::handle_message
//! [`FhircastConnection::handle_close`]: super::FhircastConnection::handle_close

/// Outbound half of a FHIRcast WebSocket session.
pub trait Transport: Send + Sync + 'static {
    /// Raw transport error, surfaced to callers unchanged.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Queue a text frame. Must not block.
    fn send(&self, text: String) -> Result<(), Self::Error>;

    /// Ask the transport to close. Completion is reported back through
    /// `handle_close`, never from this call.
    fn close(&self) -> Result<(), Self::Error>;
}
