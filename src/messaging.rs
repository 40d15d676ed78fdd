//! Verbs, message envelopes and the one-way transport seam. Request/response
//! pairing lives here: responses travel as `REQUEST_RESPONSE` messages and are
//! routed back to the callback registered under the original request id.

use crate::executor::DroppedMessageCounter;
use crate::membership::Endpoint;
use crate::telemetry::SharedMetricsRegistry;
use log::{debug, warn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

pub const VERSION_10: i32 = 3;
/// First version that understands the `forward-to` parameter.
pub const VERSION_11: i32 = 4;
/// Oldest version whose schema timestamps can be trusted for a pull.
pub const VERSION_117: i32 = 5;
/// First version that carries range tombstones on the wire.
pub const VERSION_12: i32 = 6;
pub const CURRENT_VERSION: i32 = VERSION_12;

/// Parameter listing `(address, request id)` pairs the receiver must relay to.
pub const FORWARD_TO: &str = "FWD_TO";
/// Parameter naming the coordinator a relayed message originated from.
pub const FORWARD_FROM: &str = "FWD_FRM";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Verb {
    Mutation,
    RequestResponse,
    DefinitionsUpdate,
    MigrationRequest,
}

impl Verb {
    pub const ALL: [Verb; 4] = [
        Verb::Mutation,
        Verb::RequestResponse,
        Verb::DefinitionsUpdate,
        Verb::MigrationRequest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Verb::Mutation => "MUTATION",
            Verb::RequestResponse => "REQUEST_RESPONSE",
            Verb::DefinitionsUpdate => "DEFINITIONS_UPDATE",
            Verb::MigrationRequest => "MIGRATION_REQUEST",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageOut {
    pub verb: Verb,
    pub payload: Vec<u8>,
    pub parameters: BTreeMap<String, Vec<u8>>,
}

impl MessageOut {
    pub fn new(verb: Verb, payload: Vec<u8>) -> Self {
        Self {
            verb,
            payload,
            parameters: BTreeMap::new(),
        }
    }

    pub fn with_parameter(mut self, key: &str, value: Vec<u8>) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn parameter(&self, key: &str) -> Option<&[u8]> {
        self.parameters.get(key).map(Vec::as_slice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageIn {
    pub from: Endpoint,
    pub verb: Verb,
    pub payload: Vec<u8>,
    pub parameters: BTreeMap<String, Vec<u8>>,
    /// Protocol version the payload was serialized with.
    pub version: i32,
}

impl MessageIn {
    pub fn from_out(from: Endpoint, message: &MessageOut, version: i32) -> Self {
        Self {
            from,
            verb: message.verb,
            payload: message.payload.clone(),
            parameters: message.parameters.clone(),
            version,
        }
    }

    pub fn parameter(&self, key: &str) -> Option<&[u8]> {
        self.parameters.get(key).map(Vec::as_slice)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("endpoint {0} is unreachable")]
    Unreachable(Endpoint),
    #[error("transport closed")]
    Closed,
    #[error("{0}")]
    Other(String),
}

/// One-way delivery of an envelope to a peer under a request id.
pub trait Transport: Send + Sync {
    fn send(&self, to: &Endpoint, id: &str, message: &MessageOut) -> Result<(), TransportError>;
}

type ResponseCallback = Box<dyn FnOnce(MessageIn) + Send>;

struct PendingCallback {
    registered_at: Instant,
    callback: ResponseCallback,
}

/// Outbound side of messaging for one node: id allocation, fire-and-forget
/// sends, reply routing and dropped-message accounting.
pub struct MessagingService {
    local: Endpoint,
    transport: Arc<dyn Transport>,
    next_id: AtomicU64,
    callbacks: Mutex<HashMap<String, PendingCallback>>,
    dropped: DroppedMessageCounter,
}

impl MessagingService {
    pub fn new(
        local: Endpoint,
        transport: Arc<dyn Transport>,
        metrics: SharedMetricsRegistry,
    ) -> Self {
        Self {
            local,
            transport,
            next_id: AtomicU64::new(1),
            callbacks: Mutex::new(HashMap::new()),
            dropped: DroppedMessageCounter::new(metrics),
        }
    }

    pub fn local_endpoint(&self) -> Endpoint {
        self.local
    }

    pub fn current_version(&self) -> i32 {
        CURRENT_VERSION
    }

    pub fn next_id(&self) -> String {
        self.next_id.fetch_add(1, Ordering::Relaxed).to_string()
    }

    /// Hands the message to the transport under a fresh id. Never blocks on
    /// the peer; delivery failures are logged and otherwise ignored.
    pub fn send_one_way(&self, message: &MessageOut, to: &Endpoint) -> String {
        let id = self.next_id();
        self.send_one_way_with_id(message, &id, to);
        id
    }

    pub fn send_one_way_with_id(&self, message: &MessageOut, id: &str, to: &Endpoint) {
        if let Err(err) = self.transport.send(to, id, message) {
            warn!(
                "event=message_send_failed verb={} id={} to={} error={}",
                message.verb, id, to, err
            );
        }
    }

    pub fn send_reply(&self, message: &MessageOut, id: &str, to: &Endpoint) {
        debug!("event=message_reply id={} to={}", id, to);
        self.send_one_way_with_id(message, id, to);
    }

    /// Sends a request and registers `callback` for the response carrying the
    /// same id. Returns the id so callers can expire the callback.
    pub fn send_rr<F>(&self, message: &MessageOut, to: &Endpoint, callback: F) -> String
    where
        F: FnOnce(MessageIn) + Send + 'static,
    {
        let id = self.next_id();
        self.callbacks.lock().insert(
            id.clone(),
            PendingCallback {
                registered_at: Instant::now(),
                callback: Box::new(callback),
            },
        );
        self.send_one_way_with_id(message, &id, to);
        id
    }

    /// Routes a response to its callback. Returns false when nobody is waiting
    /// (late reply or plain write ack).
    pub fn deliver_response(&self, id: &str, message: MessageIn) -> bool {
        let pending = self.callbacks.lock().remove(id);
        match pending {
            Some(pending) => {
                debug!(
                    "event=response_routed id={} from={} waited_ms={}",
                    id,
                    message.from,
                    pending.registered_at.elapsed().as_millis()
                );
                (pending.callback)(message);
                true
            }
            None => false,
        }
    }

    pub fn expire_callback(&self, id: &str) -> bool {
        self.callbacks.lock().remove(id).is_some()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.lock().len()
    }

    pub fn dropped(&self) -> &DroppedMessageCounter {
        &self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct CapturingTransport {
        sent: Mutex<Vec<(Endpoint, String, Verb)>>,
    }

    impl Transport for CapturingTransport {
        fn send(
            &self,
            to: &Endpoint,
            id: &str,
            message: &MessageOut,
        ) -> Result<(), TransportError> {
            self.sent.lock().push((*to, id.to_string(), message.verb));
            Ok(())
        }
    }

    fn service(transport: Arc<CapturingTransport>) -> MessagingService {
        MessagingService::new(
            Endpoint::v4(127, 0, 0, 1),
            transport,
            SharedMetricsRegistry::new("test"),
        )
    }

    #[test]
    fn responses_route_to_registered_callback_once() {
        let transport = Arc::new(CapturingTransport::default());
        let messaging = service(transport.clone());
        let seen = Arc::new(Mutex::new(None));
        let sink = seen.clone();
        let peer = Endpoint::v4(10, 0, 0, 2);
        let id = messaging.send_rr(
            &MessageOut::new(Verb::MigrationRequest, Vec::new()),
            &peer,
            move |response| *sink.lock() = Some(response.from),
        );
        assert_eq!(transport.sent.lock()[0].1, id);
        let reply = MessageIn::from_out(
            peer,
            &MessageOut::new(Verb::RequestResponse, Vec::new()),
            CURRENT_VERSION,
        );
        assert!(messaging.deliver_response(&id, reply.clone()));
        assert_eq!(*seen.lock(), Some(peer));
        assert!(!messaging.deliver_response(&id, reply));
        assert_eq!(messaging.pending_callbacks(), 0);
    }

    #[test]
    fn ids_are_unique_per_service() {
        let messaging = service(Arc::new(CapturingTransport::default()));
        let peer = Endpoint::v4(10, 0, 0, 2);
        let message = MessageOut::new(Verb::Mutation, Vec::new());
        let first = messaging.send_one_way(&message, &peer);
        let second = messaging.send_one_way(&message, &peer);
        assert_ne!(first, second);
    }
}
