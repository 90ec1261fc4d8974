use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of a message, which also decides the handler category it is dispatched to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Expects a Response carrying the same correlation id
    Request,
    /// Reply to a Request
    Response,
    /// Informational, no reply expected
    Notification,
    /// Instruction for the receiving endpoint, e.g. "stop" or "version"
    Command,
}

/// Envelope exchanged between endpoints, locally or across hosts.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Endpoint name of the receiver
    pub to: String,
    /// Endpoint name of the sender
    pub from: String,
    /// Verb or free text
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<Value>>,
    pub kind: MessageKind,
    pub message_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<Uuid>,
    /// Creation time; informational only
    pub timestamp: DateTime<Utc>,
}

impl Message {
    /// Creates a message of the given kind. Requests get a fresh correlation id.
    pub fn new(
        to: impl Into<String>,
        from: impl Into<String>,
        body: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        let correlation_id = match kind {
            MessageKind::Request => Some(Uuid::new_v4()),
            _ => None,
        };
        Self {
            to: to.into(),
            from: from.into(),
            body: body.into(),
            payload: None,
            kind,
            message_id: Uuid::new_v4(),
            correlation_id,
            timestamp: Utc::now(),
        }
    }

    pub fn request(to: impl Into<String>, from: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(to, from, body, MessageKind::Request)
    }

    pub fn notification(
        to: impl Into<String>,
        from: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self::new(to, from, body, MessageKind::Notification)
    }

    pub fn command(to: impl Into<String>, from: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(to, from, body, MessageKind::Command)
    }

    /// Builds the Response to `request`: endpoints swapped, correlation id copied.
    pub fn reply_to(request: &Message, body: impl Into<String>) -> Self {
        Self {
            to: request.from.clone(),
            from: request.to.clone(),
            body: body.into(),
            payload: None,
            kind: MessageKind::Response,
            message_id: Uuid::new_v4(),
            correlation_id: request.correlation_id,
            timestamp: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: Vec<Value>) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Turns the message into a Request, generating a correlation id if it has none.
    pub fn into_request(mut self) -> Self {
        self.kind = MessageKind::Request;
        if self.correlation_id.is_none() {
            self.correlation_id = Some(Uuid::new_v4());
        }
        self
    }

    /// Drops correlation ids that the kind does not allow.
    pub(crate) fn normalized(mut self) -> Self {
        if matches!(self.kind, MessageKind::Command | MessageKind::Notification) {
            self.correlation_id = None;
        }
        self
    }

    pub fn is_reply_to(&self, request: &Message) -> bool {
        self.kind == MessageKind::Response
            && request.correlation_id.is_some()
            && self.correlation_id == request.correlation_id
    }
}
