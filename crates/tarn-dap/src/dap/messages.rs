use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An inbound DAP request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub seq: i64,
    #[serde(rename = "type")]
    pub type_: String,
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// An outbound response to a request.
#[derive(Debug, Clone, Serialize)]
pub struct Response {
    pub seq: i64,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub request_seq: i64,
    pub success: bool,
    pub command: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Response {
    pub fn success(seq: i64, request: &Request, body: Option<Value>) -> Self {
        Self {
            seq,
            type_: "response",
            request_seq: request.seq,
            success: true,
            command: request.command.clone(),
            message: None,
            body,
        }
    }

    pub fn error(seq: i64, request: &Request, message: impl Into<String>) -> Self {
        Self {
            seq,
            type_: "response",
            request_seq: request.seq,
            success: false,
            command: request.command.clone(),
            message: Some(message.into()),
            body: None,
        }
    }
}

/// An outbound event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub seq: i64,
    #[serde(rename = "type")]
    pub type_: &'static str,
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
}

impl Event {
    pub fn new(seq: i64, event: &'static str, body: Option<Value>) -> Self {
        Self {
            seq,
            type_: "event",
            event,
            body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn response_carries_request_identity() {
        let request: Request = serde_json::from_value(json!({
            "seq": 7,
            "type": "request",
            "command": "threads",
        }))
        .unwrap();

        let ok = serde_json::to_value(Response::success(3, &request, None)).unwrap();
        assert_eq!(ok["type"], "response");
        assert_eq!(ok["request_seq"], 7);
        assert_eq!(ok["command"], "threads");
        assert_eq!(ok["success"], true);
        assert!(ok.get("message").is_none());

        let err = serde_json::to_value(Response::error(4, &request, "nope")).unwrap();
        assert_eq!(err["success"], false);
        assert_eq!(err["message"], "nope");
    }

    #[test]
    fn event_serializes_without_empty_body() {
        let event = serde_json::to_value(Event::new(1, "initialized", None)).unwrap();
        assert_eq!(event["type"], "event");
        assert_eq!(event["event"], "initialized");
        assert!(event.get("body").is_none());
    }
}
