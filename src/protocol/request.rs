//! Requests flowing from the transports into the controller, and responses flowing
//! back out to sessions.

use crate::core::packet::{PacketPriority, SessionId, TransportType};
use crate::core::serialization::DataCollection;
use crate::session::session::Session;
use crate::utils::time::current_time_millis;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

/// Dispatch priority of a request. Higher runs first when priority ordering is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum RequestPriority {
    Lowest,
    Low,
    #[default]
    Normal,
    High,
    Highest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestEvent {
    /// A stream connection was admitted and its session registered.
    SessionRequestConnection,
    /// A message arrived over a session's stream or KCP channel.
    SessionReadMessage,
    /// A message arrived over a session's datagram channel.
    DatagramReadMessage,
    /// The session is closing; no further output will be delivered.
    SessionWillBeClosed,
}

impl RequestEvent {
    pub fn name(self) -> &'static str {
        match self {
            RequestEvent::SessionRequestConnection => "session-request-connection",
            RequestEvent::SessionReadMessage => "session-read-message",
            RequestEvent::DatagramReadMessage => "datagram-read-message",
            RequestEvent::SessionWillBeClosed => "session-will-be-closed",
        }
    }
}

impl std::fmt::Display for RequestEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct Request {
    /// Sequence number stamped by the request queue; 0 until enqueued.
    id: u64,
    event: RequestEvent,
    sender: Option<Arc<Session>>,
    priority: RequestPriority,
    created_at: u64,
    message: Option<DataCollection>,
    attributes: HashMap<String, String>,
    remote_address: Option<SocketAddr>,
}

impl Request {
    pub fn new(event: RequestEvent) -> Self {
        Self {
            id: 0,
            event,
            sender: None,
            priority: RequestPriority::default(),
            created_at: current_time_millis(),
            message: None,
            attributes: HashMap::new(),
            remote_address: None,
        }
    }

    pub fn with_sender(mut self, sender: Arc<Session>) -> Self {
        if self.remote_address.is_none() {
            self.remote_address = Some(sender.client_address());
        }
        self.sender = Some(sender);
        self
    }

    pub fn with_priority(mut self, priority: RequestPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_message(mut self, message: Option<DataCollection>) -> Self {
        self.message = message;
        self
    }

    pub fn with_remote_address(mut self, address: SocketAddr) -> Self {
        self.remote_address = Some(address);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = id;
        self
    }

    /// Override the creation time (milliseconds since the epoch).
    pub fn with_timestamp(mut self, created_at: u64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn event(&self) -> RequestEvent {
        self.event
    }

    pub fn sender(&self) -> Option<&Arc<Session>> {
        self.sender.as_ref()
    }

    pub fn priority(&self) -> RequestPriority {
        self.priority
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    pub fn message(&self) -> Option<&DataCollection> {
        self.message.as_ref()
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }
}

/// Heap order: highest priority first, then oldest, then lowest id.
#[derive(Debug)]
pub(crate) struct PrioritizedRequest(pub Request);

impl PartialEq for PrioritizedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PrioritizedRequest {}

impl PartialOrd for PrioritizedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PrioritizedRequest {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .priority
            .cmp(&other.0.priority)
            .then_with(|| other.0.created_at.cmp(&self.0.created_at))
            .then_with(|| other.0.id.cmp(&self.0.id))
    }
}

/// Application output addressed to one or more sessions.
#[derive(Debug, Clone)]
pub struct Response {
    content: DataCollection,
    recipients: Vec<SessionId>,
    priority: PacketPriority,
    encrypted: bool,
    transport: TransportType,
}

impl Response {
    pub fn new(content: impl Into<DataCollection>) -> Self {
        Self {
            content: content.into(),
            recipients: Vec::new(),
            priority: PacketPriority::default(),
            encrypted: false,
            transport: TransportType::Tcp,
        }
    }

    pub fn to(mut self, recipient: SessionId) -> Self {
        self.recipients.push(recipient);
        self
    }

    pub fn to_all(mut self, recipients: impl IntoIterator<Item = SessionId>) -> Self {
        self.recipients.extend(recipients);
        self
    }

    pub fn with_priority(mut self, priority: PacketPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypted = true;
        self
    }

    /// Prefer the session's datagram channel.
    pub fn over_udp(mut self) -> Self {
        self.transport = TransportType::Udp;
        self
    }

    /// Prefer the session's KCP channel.
    pub fn over_kcp(mut self) -> Self {
        self.transport = TransportType::Kcp;
        self
    }

    pub fn content(&self) -> &DataCollection {
        &self.content
    }

    pub fn recipients(&self) -> &[SessionId] {
        &self.recipients
    }

    pub fn priority(&self) -> PacketPriority {
        self.priority
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BinaryHeap;

    #[test]
    fn heap_orders_by_priority_then_age() {
        let r1 = Request::new(RequestEvent::SessionReadMessage)
            .with_id(1)
            .with_priority(RequestPriority::Low)
            .with_timestamp(0);
        let r2 = Request::new(RequestEvent::SessionReadMessage)
            .with_id(2)
            .with_priority(RequestPriority::High)
            .with_timestamp(1);
        let r3 = Request::new(RequestEvent::SessionReadMessage)
            .with_id(3)
            .with_priority(RequestPriority::High)
            .with_timestamp(2);

        let mut heap = BinaryHeap::new();
        heap.push(PrioritizedRequest(r1));
        heap.push(PrioritizedRequest(r3));
        heap.push(PrioritizedRequest(r2));

        let order: Vec<u64> = std::iter::from_fn(|| heap.pop().map(|r| r.0.id())).collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn equal_timestamps_fall_back_to_id() {
        let a = Request::new(RequestEvent::SessionReadMessage).with_id(1).with_timestamp(5);
        let b = Request::new(RequestEvent::SessionReadMessage).with_id(2).with_timestamp(5);
        assert!(PrioritizedRequest(a) > PrioritizedRequest(b));
    }

    #[test]
    fn response_builder_collects_recipients() {
        let response = Response::new(crate::core::zero::ZeroMap::new())
            .to(1)
            .to_all([2, 3])
            .over_kcp()
            .encrypted();
        assert_eq!(response.recipients(), &[1, 2, 3]);
        assert_eq!(response.transport(), TransportType::Kcp);
        assert!(response.is_encrypted());
    }
}
