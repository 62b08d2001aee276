//! Wire messages exchanged over a link.
//!
//! Every frame is one JSON object whose `type` field selects the variant:
//!
//! ```json
//! { "type": "request", "seq": 4, "src": { "type": "control", "id": 2 },
//!   "dst": { "type": "host", "id": 1 }, "requestId": 9,
//!   "name": "instance.start", "data": { "instanceId": 12 } }
//! ```
//!
//! Handshake frames (`hello`, `registerHost`, `registerControl`, `resume`,
//! `ready`, `continue`, `invalidate`) and `heartbeat` are not sequenced. The
//! steady-state frames (`request`, `response`, `responseError`, `event`) carry
//! the sender's sequence number and are wrapped in [`Message`] once accepted.

use crate::address::Address;
use crate::error::{ErrorCode, RequestError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Plugin name to plugin version.
pub type PluginVersions = BTreeMap<String, String>;

/// Any frame that can travel over a raw connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Frame {
    Hello(Hello),
    RegisterHost(RegisterHost),
    RegisterControl(RegisterControl),
    Resume(Resume),
    Ready(Ready),
    Continue(Continue),
    Invalidate(Invalidate),
    Heartbeat(Heartbeat),
    Request(Request),
    Response(Response),
    ResponseError(ErrorResponse),
    Event(Event),
}

impl Frame {
    /// The wire discriminant of this frame.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Hello(_) => "hello",
            Frame::RegisterHost(_) => "registerHost",
            Frame::RegisterControl(_) => "registerControl",
            Frame::Resume(_) => "resume",
            Frame::Ready(_) => "ready",
            Frame::Continue(_) => "continue",
            Frame::Invalidate(_) => "invalidate",
            Frame::Heartbeat(_) => "heartbeat",
            Frame::Request(_) => "request",
            Frame::Response(_) => "response",
            Frame::ResponseError(_) => "responseError",
            Frame::Event(_) => "event",
        }
    }

    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Splits steady-state traffic from handshake and heartbeat frames.
    pub fn into_message(self) -> Result<Message, Frame> {
        match self {
            Frame::Request(request) => Ok(Message::Request(request)),
            Frame::Response(response) => Ok(Message::Response(response)),
            Frame::ResponseError(error) => Ok(Message::ResponseError(error)),
            Frame::Event(event) => Ok(Message::Event(event)),
            other => Err(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    pub version: String,
    pub plugins: PluginVersions,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterHost {
    pub token: String,
    pub id: u32,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub plugins: PluginVersions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterControl {
    pub token: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resume {
    pub session_token: String,
    pub last_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ready {
    pub address: Address,
    pub session_token: String,
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Continue {
    pub session_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub last_received_seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Invalidate {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Heartbeat {
    /// Highest sequence number the sender has received
    pub last_seq: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    #[serde(default)]
    pub seq: u64,
    pub src: Address,
    pub dst: Address,
    pub request_id: u64,
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    #[serde(default)]
    pub seq: u64,
    pub src: Address,
    pub dst: Address,
    pub request_id: u64,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    #[serde(default)]
    pub seq: u64,
    pub src: Address,
    pub dst: Address,
    pub request_id: u64,
    pub code: ErrorCode,
    pub message: String,
}

impl ErrorResponse {
    pub fn to_request_error(&self) -> RequestError {
        RequestError::new(self.code, self.message.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub seq: u64,
    pub src: Address,
    pub dst: Address,
    pub name: String,
    #[serde(default)]
    pub data: Value,
}

/// Which steady-state message a [`Message`] is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Request,
    Response,
    ResponseError,
    Event,
}

/// A sequenced steady-state message.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Request(Request),
    Response(Response),
    ResponseError(ErrorResponse),
    Event(Event),
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Request(_) => MessageKind::Request,
            Message::Response(_) => MessageKind::Response,
            Message::ResponseError(_) => MessageKind::ResponseError,
            Message::Event(_) => MessageKind::Event,
        }
    }

    pub fn seq(&self) -> u64 {
        match self {
            Message::Request(m) => m.seq,
            Message::Response(m) => m.seq,
            Message::ResponseError(m) => m.seq,
            Message::Event(m) => m.seq,
        }
    }

    pub fn set_seq(&mut self, seq: u64) {
        match self {
            Message::Request(m) => m.seq = seq,
            Message::Response(m) => m.seq = seq,
            Message::ResponseError(m) => m.seq = seq,
            Message::Event(m) => m.seq = seq,
        }
    }

    pub fn src(&self) -> Address {
        match self {
            Message::Request(m) => m.src,
            Message::Response(m) => m.src,
            Message::ResponseError(m) => m.src,
            Message::Event(m) => m.src,
        }
    }

    pub fn dst(&self) -> Address {
        match self {
            Message::Request(m) => m.dst,
            Message::Response(m) => m.dst,
            Message::ResponseError(m) => m.dst,
            Message::Event(m) => m.dst,
        }
    }

    /// Request or event name, if the message has one.
    pub fn name(&self) -> Option<&str> {
        match self {
            Message::Request(m) => Some(&m.name),
            Message::Event(m) => Some(&m.name),
            _ => None,
        }
    }

    pub fn into_frame(self) -> Frame {
        match self {
            Message::Request(m) => Frame::Request(m),
            Message::Response(m) => Frame::Response(m),
            Message::ResponseError(m) => Frame::ResponseError(m),
            Message::Event(m) => Frame::Event(m),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let frame = Frame::parse(
            r#"{"type":"request","seq":4,"src":{"type":"control","id":2},
                "dst":{"type":"host","id":1},"requestId":9,"name":"instance.start",
                "data":{"instanceId":12}}"#,
        )
        .unwrap();

        let message = frame.into_message().unwrap();
        assert_eq!(message.kind(), MessageKind::Request);
        assert_eq!(message.seq(), 4);
        assert_eq!(message.src(), Address::control(2));
        assert_eq!(message.dst(), Address::host(1));
        assert_eq!(message.name(), Some("instance.start"));
    }

    #[test]
    fn test_handshake_frames_are_not_messages() {
        let frame = Frame::parse(r#"{"type":"resume","sessionToken":"abc","lastSeq":3}"#).unwrap();
        assert_eq!(frame.kind(), "resume");
        assert!(frame.into_message().is_err());
    }

    #[test]
    fn test_invalidate_and_error_serialization() {
        let text = Frame::Invalidate(Invalidate {}).to_text().unwrap();
        assert_eq!(text, r#"{"type":"invalidate"}"#);

        let error = Frame::ResponseError(ErrorResponse {
            seq: 1,
            src: Address::CONTROLLER,
            dst: Address::control(1),
            request_id: 5,
            code: ErrorCode::Unroutable,
            message: "Host 2 is not connected".into(),
        });
        let value = serde_json::to_value(&error).unwrap();
        assert_eq!(value["type"], json!("responseError"));
        assert_eq!(value["code"], json!("unroutable"));
        assert_eq!(value["requestId"], json!(5));
    }

    #[test]
    fn test_ready_omits_missing_extra() {
        let ready = Frame::Ready(Ready {
            address: Address::host(1),
            session_token: "token".into(),
            session_timeout_ms: 60_000,
            heartbeat_interval_ms: 15_000,
            extra: None,
        });
        let value = serde_json::to_value(&ready).unwrap();
        assert!(value.get("extra").is_none());
        assert_eq!(value["sessionTimeoutMs"], json!(60_000));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(Frame::parse(r#"{"type":"teleport"}"#).is_err());
        assert!(Frame::parse("not json").is_err());
    }
}
