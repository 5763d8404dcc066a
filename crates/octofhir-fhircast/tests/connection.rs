//! Connection state machine tests against a recording transport.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Weak};
use std::thread;
use std::time::Duration;

use octofhir_fhircast::{
    ConnectionState, DisconnectReason, EventContext, EventName, FhircastConnection, FhircastError,
    FrameOutcome, SubscriptionRequest, Transport, create_message_payload,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

/// Records every frame and close request instead of touching the network.
#[derive(Default)]
struct RecordingTransport {
    sent: Mutex<Vec<String>>,
    close_calls: AtomicUsize,
    fail_sends: AtomicBool,
}

impl RecordingTransport {
    fn sent(&self) -> Vec<Value> {
        self.sent
            .lock()
            .iter()
            .map(|frame| serde_json::from_str(frame).unwrap())
            .collect()
    }
}

impl Transport for RecordingTransport {
    type Error = std::io::Error;

    fn send(&self, text: String) -> Result<(), Self::Error> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "socket gone"));
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn close(&self) -> Result<(), Self::Error> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type TestConnection = FhircastConnection<RecordingTransport>;

#[derive(Default)]
struct Counters {
    connect: AtomicUsize,
    message: AtomicUsize,
    disconnect: AtomicUsize,
    frame_error: AtomicUsize,
}

fn completed_request() -> SubscriptionRequest {
    SubscriptionRequest::subscribe("topic-1", &[EventName::PatientOpen, EventName::PatientClose])
        .with_endpoint("wss://hub.example.org/ws/topic-1")
}

fn connection_with_counters() -> (Arc<TestConnection>, Arc<Counters>) {
    let connection =
        Arc::new(FhircastConnection::new(completed_request(), |_| RecordingTransport::default()).unwrap());
    let counters = Arc::new(Counters::default());

    let c = counters.clone();
    connection.on_connect(move || {
        c.connect.fetch_add(1, Ordering::SeqCst);
    });
    let c = counters.clone();
    connection.on_message(move |_| {
        c.message.fetch_add(1, Ordering::SeqCst);
    });
    let c = counters.clone();
    connection.on_disconnect(move |_| {
        c.disconnect.fetch_add(1, Ordering::SeqCst);
    });
    let c = counters.clone();
    connection.on_frame_error(move |_| {
        c.frame_error.fetch_add(1, Ordering::SeqCst);
    });

    (connection, counters)
}

fn event_frame(patient_id: &str) -> (String, String) {
    let payload = create_message_payload(
        "topic-1",
        EventName::PatientOpen,
        EventContext::new("patient", json!({"resourceType": "Patient", "id": patient_id})),
    )
    .unwrap();
    (payload.id.clone(), payload.to_json().unwrap())
}

fn confirmation_frame() -> String {
    json!({
        "hub.topic": "topic-1",
        "hub.events": "patient-open,patient-close",
        "hub.mode": "subscribe",
        "hub.channel.type": "websocket",
    })
    .to_string()
}

#[test]
fn test_construction_requires_endpoint() {
    let factory_called = AtomicBool::new(false);
    let request = SubscriptionRequest::subscribe("topic-1", &[EventName::PatientOpen]);

    let err = FhircastConnection::new(request, |_| {
        factory_called.store(true, Ordering::SeqCst);
        RecordingTransport::default()
    })
    .unwrap_err();

    assert!(matches!(err, FhircastError::InvalidConnection(_)));
    assert!(err.to_string().contains("should contain an endpoint"));
    assert!(!factory_called.load(Ordering::SeqCst));
}

#[test]
fn test_construction_requires_valid_request() {
    let factory_called = AtomicBool::new(false);
    let request = SubscriptionRequest::subscribe("topic-1", &[EventName::PatientOpen])
        .with_endpoint("https://hub.example.org/ws");

    let err = FhircastConnection::new(request, |_| {
        factory_called.store(true, Ordering::SeqCst);
        RecordingTransport::default()
    })
    .unwrap_err();

    assert!(err.to_string().contains("failed validation"));
    assert!(!factory_called.load(Ordering::SeqCst));
}

#[test]
fn test_transport_factory_receives_endpoint() {
    let mut seen = String::new();
    let connection = FhircastConnection::new(completed_request(), |endpoint| {
        seen = endpoint.to_string();
        RecordingTransport::default()
    })
    .unwrap();

    assert_eq!(seen, "wss://hub.example.org/ws/topic-1");
    assert_eq!(connection.state(), ConnectionState::Idle);
    assert_eq!(connection.topic(), "topic-1");
}

#[test]
fn test_open_emits_connect_once() {
    let (connection, counters) = connection_with_counters();

    connection.handle_open();
    connection.handle_open();

    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(counters.connect.load(Ordering::SeqCst), 1);
}

#[test]
fn test_event_message_is_delivered_and_acknowledged() {
    let (connection, counters) = connection_with_counters();
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    connection.on_message(move |payload| sink.lock().push(payload.clone()));

    connection.handle_open();
    let (id, frame) = event_frame("p1");
    let outcome = connection.handle_message(&frame);

    assert_eq!(outcome, FrameOutcome::Delivered(id.clone()));
    assert_eq!(counters.message.load(Ordering::SeqCst), 1);

    let received = received.lock();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, id);
    assert_eq!(received[0].event.context[0].resource["id"], "p1");

    let acks = connection.transport().sent();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["id"], id.as_str());
    assert!(acks[0]["timestamp"].is_string());
}

#[test]
fn test_confirmation_is_discarded() {
    let (connection, counters) = connection_with_counters();
    connection.handle_open();

    let outcome = connection.handle_message(&confirmation_frame());

    assert_eq!(outcome, FrameOutcome::Confirmation);
    assert_eq!(counters.message.load(Ordering::SeqCst), 0);
    assert!(connection.transport().sent().is_empty());
}

#[test]
fn test_each_message_gets_its_own_ack_in_order() {
    let (connection, counters) = connection_with_counters();
    connection.handle_open();

    let (first_id, first) = event_frame("p1");
    let (second_id, second) = event_frame("p2");
    connection.handle_message(&first);
    connection.handle_message(&confirmation_frame());
    connection.handle_message(&second);

    assert_eq!(counters.message.load(Ordering::SeqCst), 2);
    let acks: Vec<String> = connection
        .transport()
        .sent()
        .iter()
        .map(|ack| ack["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(acks, vec![first_id, second_id]);
}

#[test]
fn test_message_before_open_is_ignored() {
    let (connection, counters) = connection_with_counters();
    let (_, frame) = event_frame("p1");

    assert_eq!(connection.handle_message(&frame), FrameOutcome::Ignored);
    assert_eq!(counters.message.load(Ordering::SeqCst), 0);
    assert!(connection.transport().sent().is_empty());
}

#[test]
fn test_malformed_frame_keeps_connection_open() {
    let (connection, counters) = connection_with_counters();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    connection.on_frame_error(move |error| sink.lock().push(error.clone()));
    connection.handle_open();

    assert_eq!(connection.handle_message("{not json"), FrameOutcome::Malformed);
    assert_eq!(connection.handle_message("[1, 2"), FrameOutcome::Malformed);

    assert_eq!(connection.state(), ConnectionState::Open);
    assert_eq!(counters.frame_error.load(Ordering::SeqCst), 2);
    assert_eq!(counters.message.load(Ordering::SeqCst), 0);
    assert!(connection.transport().sent().is_empty());
    assert_eq!(errors.lock()[0].raw, "{not json");
    assert!(errors.lock()[0].reason.starts_with("Invalid JSON"));

    let (id, frame) = event_frame("p1");
    assert_eq!(connection.handle_message(&frame), FrameOutcome::Delivered(id));
}

#[test]
fn test_unknown_event_is_still_acknowledged() {
    let (connection, counters) = connection_with_counters();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = errors.clone();
    connection.on_frame_error(move |error| sink.lock().push(error.clone()));
    connection.handle_open();

    let heartbeat = json!({
        "timestamp": "2024-03-01T10:00:00.000Z",
        "id": "hb-1",
        "event": {"hub.topic": "topic-1", "hub.event": "heartbeat", "context": []},
    })
    .to_string();

    assert_eq!(
        connection.handle_message(&heartbeat),
        FrameOutcome::Unrecognized("hb-1".to_string())
    );
    assert_eq!(counters.message.load(Ordering::SeqCst), 0);
    assert_eq!(errors.lock().len(), 1);
    assert!(errors.lock()[0].reason.starts_with("Not a FHIRcast message"));

    let acks = connection.transport().sent();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0]["id"], "hb-1");
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[test]
fn test_timestamp_without_offset_is_still_acknowledged() {
    let (connection, counters) = connection_with_counters();
    connection.handle_open();

    let frame = json!({
        "timestamp": "2024-03-01T10:00:00",
        "id": "evt-2",
        "event": {
            "hub.topic": "topic-1",
            "hub.event": "patient-open",
            "context": [{"key": "patient", "resource": {"resourceType": "Patient", "id": "p1"}}],
        },
    })
    .to_string();
    let missing_timestamp = json!({"id": "evt-3", "event": {}}).to_string();

    assert_eq!(
        connection.handle_message(&frame),
        FrameOutcome::Unrecognized("evt-2".to_string())
    );
    assert_eq!(
        connection.handle_message(&missing_timestamp),
        FrameOutcome::Unrecognized("evt-3".to_string())
    );

    let acks: Vec<Value> = connection.transport().sent();
    assert_eq!(acks.len(), 2);
    assert_eq!(acks[0]["id"], "evt-2");
    assert_eq!(acks[1]["id"], "evt-3");
    assert_eq!(counters.frame_error.load(Ordering::SeqCst), 2);
    assert_eq!(counters.message.load(Ordering::SeqCst), 0);
}

#[test]
fn test_close_waits_for_frame_in_flight() {
    let connection = Arc::new(
        FhircastConnection::new(completed_request(), |_| RecordingTransport::default()).unwrap(),
    );
    let order = Arc::new(Mutex::new(Vec::new()));
    let entered = Arc::new(Barrier::new(2));

    let sink = order.clone();
    let barrier = entered.clone();
    connection.on_message(move |_| {
        barrier.wait();
        thread::sleep(Duration::from_millis(50));
        sink.lock().push("message");
    });
    let sink = order.clone();
    connection.on_disconnect(move |_| sink.lock().push("disconnect"));
    connection.handle_open();

    let closer = {
        let connection = connection.clone();
        let entered = entered.clone();
        thread::spawn(move || {
            entered.wait();
            connection.handle_close(DisconnectReason::PeerClosed);
        })
    };

    let (id, frame) = event_frame("p1");
    assert_eq!(connection.handle_message(&frame), FrameOutcome::Delivered(id));
    closer.join().unwrap();

    assert_eq!(*order.lock(), vec!["message", "disconnect"]);
    assert_eq!(connection.transport().sent().len(), 1);
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(connection.handle_message(&event_frame("p2").1), FrameOutcome::Ignored);
}

#[test]
fn test_disconnect_emits_once_regardless_of_calls() {
    let (connection, counters) = connection_with_counters();
    let reasons = Arc::new(Mutex::new(Vec::new()));
    let sink = reasons.clone();
    connection.on_disconnect(move |reason| sink.lock().push(reason.clone()));
    connection.handle_open();

    connection.disconnect().unwrap();
    connection.disconnect().unwrap();
    assert_eq!(counters.disconnect.load(Ordering::SeqCst), 0);
    assert_eq!(connection.state(), ConnectionState::Open);

    assert!(connection.handle_close(DisconnectReason::Requested));
    assert!(!connection.handle_close(DisconnectReason::PeerClosed));
    connection.disconnect().unwrap();

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(counters.disconnect.load(Ordering::SeqCst), 1);
    assert_eq!(*reasons.lock(), vec![DisconnectReason::Requested]);
    assert_eq!(connection.transport().close_calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_peer_close_emits_disconnect() {
    let (connection, counters) = connection_with_counters();
    connection.handle_open();

    connection.handle_close(DisconnectReason::PeerClosed);

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(counters.disconnect.load(Ordering::SeqCst), 1);
    assert_eq!(connection.transport().close_calls.load(Ordering::SeqCst), 0);

    let (_, frame) = event_frame("p1");
    assert_eq!(connection.handle_message(&frame), FrameOutcome::Ignored);
}

#[test]
fn test_close_before_open_still_notifies() {
    let (connection, counters) = connection_with_counters();

    connection.handle_close(DisconnectReason::ConnectFailed("refused".into()));
    connection.handle_open();

    assert_eq!(connection.state(), ConnectionState::Closed);
    assert_eq!(counters.connect.load(Ordering::SeqCst), 0);
    assert_eq!(counters.disconnect.load(Ordering::SeqCst), 1);
}

#[test]
fn test_ack_is_sent_after_listeners_even_if_one_panics() {
    let connection = Arc::new(
        FhircastConnection::new(completed_request(), |_| RecordingTransport::default()).unwrap(),
    );
    let acks_seen_by_listener = Arc::new(AtomicUsize::new(usize::MAX));

    let weak: Weak<TestConnection> = Arc::downgrade(&connection);
    let seen = acks_seen_by_listener.clone();
    connection.on_message(move |_| {
        if let Some(connection) = weak.upgrade() {
            seen.store(connection.transport().sent.lock().len(), Ordering::SeqCst);
        }
    });
    connection.on_message(|_| panic!("subscriber bug"));

    connection.handle_open();
    let (_, frame) = event_frame("p1");
    connection.handle_message(&frame);

    assert_eq!(acks_seen_by_listener.load(Ordering::SeqCst), 0);
    assert_eq!(connection.transport().sent().len(), 1);
}

#[test]
fn test_listener_may_disconnect_from_callback() {
    let connection = Arc::new(
        FhircastConnection::new(completed_request(), |_| RecordingTransport::default()).unwrap(),
    );
    let weak = Arc::downgrade(&connection);
    connection.on_message(move |_| {
        if let Some(connection) = weak.upgrade() {
            connection.disconnect().unwrap();
        }
    });

    connection.handle_open();
    let (_, frame) = event_frame("p1");
    connection.handle_message(&frame);

    assert_eq!(connection.transport().close_calls.load(Ordering::SeqCst), 1);
    assert_eq!(connection.transport().sent().len(), 1);
}

#[test]
fn test_failed_ack_does_not_close_connection() {
    let (connection, counters) = connection_with_counters();
    connection.transport().fail_sends.store(true, Ordering::SeqCst);
    connection.handle_open();

    let (id, frame) = event_frame("p1");
    assert_eq!(connection.handle_message(&frame), FrameOutcome::Delivered(id));
    assert_eq!(counters.message.load(Ordering::SeqCst), 1);
    assert_eq!(connection.state(), ConnectionState::Open);
}

#[test]
fn test_removed_listener_stops_receiving() {
    let (connection, counters) = connection_with_counters();
    let extra = Arc::new(AtomicUsize::new(0));
    let c = extra.clone();
    let id = connection.on_message(move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    });
    connection.handle_open();

    connection.handle_message(&event_frame("p1").1);
    assert!(connection.remove_listener(id));
    connection.handle_message(&event_frame("p2").1);

    assert_eq!(extra.load(Ordering::SeqCst), 1);
    assert_eq!(counters.message.load(Ordering::SeqCst), 2);
}

#[test]
fn test_concurrent_frames_each_get_one_ack() {
    let (connection, counters) = connection_with_counters();
    connection.handle_open();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let connection = connection.clone();
            thread::spawn(move || {
                for n in 0..25 {
                    let (_, frame) = event_frame(&format!("p{worker}-{n}"));
                    connection.handle_message(&frame);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(counters.message.load(Ordering::SeqCst), 200);
    assert_eq!(connection.transport().sent().len(), 200);
}
