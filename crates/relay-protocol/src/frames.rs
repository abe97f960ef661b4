//! Frame types for the Relay protocol.
//!
//! Requests are validated field by field from a decoded JSON value so that a
//! well-formed value with a bad field yields an error response instead of a
//! dropped connection.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Request actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Publish,
    Subscribe,
    Unsubscribe,
    Shutdown,
    CloseConnection,
}

impl Action {
    /// Wire name of the action.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Publish => "publish",
            Action::Subscribe => "subscribe",
            Action::Unsubscribe => "unsubscribe",
            Action::Shutdown => "shutdown",
            Action::CloseConnection => "close_connection",
        }
    }

    /// Parse a wire name.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "publish" => Some(Action::Publish),
            "subscribe" => Some(Action::Subscribe),
            "unsubscribe" => Some(Action::Unsubscribe),
            "shutdown" => Some(Action::Shutdown),
            "close_connection" => Some(Action::CloseConnection),
            _ => None,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors in an otherwise well-formed request.
///
/// The connection stays open; the error text is sent back as the response.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Missing, non-string or unrecognised `action`.
    #[error("unknown action")]
    UnknownAction,

    /// `message` object missing on publish.
    #[error("message is required")]
    MissingMessage,

    /// `topic` missing or not a string.
    #[error("topic is required")]
    MissingTopic,

    /// `message.content` missing or not a string.
    #[error("message content is required")]
    MissingContent,

    /// `message.priority` missing or not a number.
    #[error("priority is required")]
    MissingPriority,

    /// `message.priority` does not fit a signed 64-bit integer.
    #[error("priority is out of range")]
    PriorityOutOfRange,
}

/// The `message` object of a publish request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishMessage {
    /// Target topic.
    pub topic: String,
    /// Message payload.
    pub content: String,
    /// Ordering key; lower is delivered first.
    pub priority: i64,
}

/// A client request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Publish a message to a topic.
    Publish(PublishMessage),
    /// Subscribe this connection to a topic.
    Subscribe {
        /// Topic name.
        topic: String,
    },
    /// Unsubscribe this connection from a topic.
    Unsubscribe {
        /// Topic name.
        topic: String,
    },
    /// Shut the broker down.
    Shutdown,
    /// Close this connection.
    CloseConnection,
}

impl Request {
    /// Get the request action.
    #[must_use]
    pub fn action(&self) -> Action {
        match self {
            Request::Publish(_) => Action::Publish,
            Request::Subscribe { .. } => Action::Subscribe,
            Request::Unsubscribe { .. } => Action::Unsubscribe,
            Request::Shutdown => Action::Shutdown,
            Request::CloseConnection => Action::CloseConnection,
        }
    }

    /// Create a new publish request.
    #[must_use]
    pub fn publish(topic: impl Into<String>, content: impl Into<String>, priority: i64) -> Self {
        Request::Publish(PublishMessage {
            topic: topic.into(),
            content: content.into(),
            priority,
        })
    }

    /// Create a new subscribe request.
    #[must_use]
    pub fn subscribe(topic: impl Into<String>) -> Self {
        Request::Subscribe {
            topic: topic.into(),
        }
    }

    /// Create a new unsubscribe request.
    #[must_use]
    pub fn unsubscribe(topic: impl Into<String>) -> Self {
        Request::Unsubscribe {
            topic: topic.into(),
        }
    }
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_owned)
}

/// Integers are taken as-is; fractional numbers truncate toward zero.
fn priority_field(object: &Map<String, Value>) -> Result<i64, RequestError> {
    let Some(Value::Number(number)) = object.get("priority") else {
        return Err(RequestError::MissingPriority);
    };

    if let Some(priority) = number.as_i64() {
        return Ok(priority);
    }

    match number.as_f64() {
        Some(f) if f.is_finite() && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
            Ok(f.trunc() as i64)
        }
        _ => Err(RequestError::PriorityOutOfRange),
    }
}

impl TryFrom<Value> for Request {
    type Error = RequestError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(object) = value else {
            return Err(RequestError::UnknownAction);
        };

        let action = object
            .get("action")
            .and_then(Value::as_str)
            .and_then(Action::parse)
            .ok_or(RequestError::UnknownAction)?;

        match action {
            Action::Publish => {
                let message = object
                    .get("message")
                    .and_then(Value::as_object)
                    .ok_or(RequestError::MissingMessage)?;
                let topic = string_field(message, "topic").ok_or(RequestError::MissingTopic)?;
                let content =
                    string_field(message, "content").ok_or(RequestError::MissingContent)?;
                let priority = priority_field(message)?;
                Ok(Request::Publish(PublishMessage {
                    topic,
                    content,
                    priority,
                }))
            }
            Action::Subscribe => {
                let topic = string_field(&object, "topic").ok_or(RequestError::MissingTopic)?;
                Ok(Request::Subscribe { topic })
            }
            Action::Unsubscribe => {
                let topic = string_field(&object, "topic").ok_or(RequestError::MissingTopic)?;
                Ok(Request::Unsubscribe { topic })
            }
            Action::Shutdown => Ok(Request::Shutdown),
            Action::CloseConnection => Ok(Request::CloseConnection),
        }
    }
}

#[derive(Serialize)]
struct RequestWire<'a> {
    action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'a PublishMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    topic: Option<&'a str>,
}

impl Serialize for Request {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let (message, topic) = match self {
            Request::Publish(message) => (Some(message), None),
            Request::Subscribe { topic } | Request::Unsubscribe { topic } => {
                (None, Some(topic.as_str()))
            }
            Request::Shutdown | Request::CloseConnection => (None, None),
        };
        RequestWire {
            action: self.action(),
            message,
            topic,
        }
        .serialize(serializer)
    }
}

/// Response status marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
}

/// Response to a request. Exactly one is sent per request, in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    /// `{"status":"ok"}`
    Ok {
        /// Always `ok`.
        status: Status,
    },
    /// `{"error":"..."}`
    Error {
        /// Human-readable error message.
        error: String,
    },
}

impl Response {
    /// Create a success response.
    #[must_use]
    pub fn ok() -> Self {
        Response::Ok { status: Status::Ok }
    }

    /// Create an error response.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Response::Error {
            error: message.into(),
        }
    }

    /// Check if this is a success response.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Response::Ok { .. })
    }
}

/// Out-of-band delivery to a subscriber, discriminated by its `type` field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PushFrame {
    /// A message published to a subscribed topic.
    #[serde(rename = "message")]
    Message {
        /// Topic the message was published to.
        topic: String,
        /// Message identifier.
        id: String,
        /// Message payload.
        content: String,
        /// Message priority.
        priority: i64,
    },
}

impl PushFrame {
    /// Create a new message push frame.
    #[must_use]
    pub fn message(
        topic: impl Into<String>,
        id: impl Into<String>,
        content: impl Into<String>,
        priority: i64,
    ) -> Self {
        PushFrame::Message {
            topic: topic.into(),
            id: id.into(),
            content: content.into(),
            priority,
        }
    }
}

/// Anything the server writes to a connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServerFrame {
    /// A delivery.
    Push(PushFrame),
    /// A response to the request at the head of the line.
    Response(Response),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_publish() {
        let value = json!({
            "action": "publish",
            "message": {"topic": "t", "content": "hi", "priority": 3}
        });
        assert_eq!(
            Request::try_from(value).unwrap(),
            Request::publish("t", "hi", 3)
        );
    }

    #[test]
    fn test_parse_subscribe_and_unsubscribe() {
        let sub = json!({"action": "subscribe", "topic": "news"});
        let unsub = json!({"action": "unsubscribe", "topic": "news"});
        assert_eq!(Request::try_from(sub).unwrap(), Request::subscribe("news"));
        assert_eq!(
            Request::try_from(unsub).unwrap(),
            Request::unsubscribe("news")
        );
    }

    #[test]
    fn test_parse_bare_actions() {
        let shutdown = json!({"action": "shutdown"});
        let close = json!({"action": "close_connection"});
        assert_eq!(Request::try_from(shutdown).unwrap(), Request::Shutdown);
        assert_eq!(Request::try_from(close).unwrap(), Request::CloseConnection);
    }

    #[test]
    fn test_request_errors() {
        let cases = [
            (json!({}), RequestError::UnknownAction),
            (json!([1, 2]), RequestError::UnknownAction),
            (json!({"action": 5}), RequestError::UnknownAction),
            (json!({"action": "explode"}), RequestError::UnknownAction),
            (json!({"action": "publish"}), RequestError::MissingMessage),
            (
                json!({"action": "publish", "message": {"content": "x", "priority": 1}}),
                RequestError::MissingTopic,
            ),
            (
                json!({"action": "publish", "message": {"topic": "t", "priority": 1}}),
                RequestError::MissingContent,
            ),
            (
                json!({"action": "publish", "message": {"topic": "t", "content": "x"}}),
                RequestError::MissingPriority,
            ),
            (
                json!({"action": "publish", "message": {"topic": "t", "content": "x", "priority": "high"}}),
                RequestError::MissingPriority,
            ),
            (json!({"action": "subscribe"}), RequestError::MissingTopic),
            (
                json!({"action": "unsubscribe", "topic": 9}),
                RequestError::MissingTopic,
            ),
        ];

        for (value, expected) in cases {
            assert_eq!(Request::try_from(value), Err(expected));
        }
    }

    #[test]
    fn test_priority_conversion() {
        let fractional = json!({
            "action": "publish",
            "message": {"topic": "t", "content": "x", "priority": -2.9}
        });
        assert_eq!(
            Request::try_from(fractional).unwrap(),
            Request::publish("t", "x", -2)
        );

        let huge = json!({
            "action": "publish",
            "message": {"topic": "t", "content": "x", "priority": 1e300}
        });
        assert_eq!(
            Request::try_from(huge),
            Err(RequestError::PriorityOutOfRange)
        );
    }

    #[test]
    fn test_request_wire_shape() {
        let value = serde_json::to_value(Request::publish("t", "hi", 2)).unwrap();
        assert_eq!(
            value,
            json!({"action": "publish", "message": {"topic": "t", "content": "hi", "priority": 2}})
        );

        let value = serde_json::to_value(Request::CloseConnection).unwrap();
        assert_eq!(value, json!({"action": "close_connection"}));
    }

    #[test]
    fn test_response_wire_shape() {
        assert_eq!(
            serde_json::to_value(Response::ok()).unwrap(),
            json!({"status": "ok"})
        );
        assert_eq!(
            serde_json::to_value(Response::error("topic is required")).unwrap(),
            json!({"error": "topic is required"})
        );
    }

    #[test]
    fn test_server_frame_discrimination() {
        let push: ServerFrame = serde_json::from_value(json!({
            "type": "message", "topic": "t", "id": "abc", "content": "hi", "priority": 1
        }))
        .unwrap();
        assert_eq!(
            push,
            ServerFrame::Push(PushFrame::message("t", "abc", "hi", 1))
        );

        let ok: ServerFrame = serde_json::from_value(json!({"status": "ok"})).unwrap();
        assert_eq!(ok, ServerFrame::Response(Response::ok()));

        let err: ServerFrame = serde_json::from_value(json!({"error": "nope"})).unwrap();
        assert_eq!(err, ServerFrame::Response(Response::error("nope")));
    }
}
