//! Wire frames, both directions.
//!
//! Outbound frames are plain serde structs with constructors; the bridge
//! supplies timestamps so frame construction stays deterministic under test.
//! Inbound traffic has no single discriminator field, so [`InboundFrame`]
//! classifies raw JSON by shape, in the priority order the backend relies on.

use serde::Serialize;
use serde_json::Value;

use crate::segment::{parse_segments, Segment};
use crate::{FrameError, VersionInfo, HEARTBEAT_INTERVAL_MS};

/// `lifecycle/connect` meta-event announcing self-identity at handshake.
#[derive(Debug, Clone, Serialize)]
pub struct LifecycleEvent {
    pub post_type: &'static str,
    pub meta_event_type: &'static str,
    pub sub_type: &'static str,
    pub self_id: String,
    pub time: i64,
    pub version: VersionInfo,
}

impl LifecycleEvent {
    pub fn connect(self_id: impl Into<String>, time: i64) -> Self {
        Self {
            post_type: "meta_event",
            meta_event_type: "lifecycle",
            sub_type: "connect",
            self_id: self_id.into(),
            time,
            version: VersionInfo::default(),
        }
    }
}

/// Periodic heartbeat meta-event. The status sub-flags are all fixed to
/// `true`; the backend only checks their presence.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatEvent {
    pub post_type: &'static str,
    pub meta_event_type: &'static str,
    pub self_id: String,
    pub time: i64,
    pub interval: u64,
    pub status: HeartbeatStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStatus {
    pub app_initialized: bool,
    pub app_enabled: bool,
    pub plugins_good: bool,
    pub app_good: bool,
    pub online: bool,
}

impl Default for HeartbeatStatus {
    fn default() -> Self {
        Self {
            app_initialized: true,
            app_enabled: true,
            plugins_good: true,
            app_good: true,
            online: true,
        }
    }
}

impl HeartbeatEvent {
    pub fn new(self_id: impl Into<String>, time: i64) -> Self {
        Self {
            post_type: "meta_event",
            meta_event_type: "heartbeat",
            self_id: self_id.into(),
            time,
            interval: HEARTBEAT_INTERVAL_MS,
            status: HeartbeatStatus::default(),
        }
    }
}

/// A user-submitted text wrapped as a private message event.
#[derive(Debug, Clone, Serialize)]
pub struct PrivateMessageEvent {
    pub post_type: &'static str,
    pub message_type: &'static str,
    pub sub_type: &'static str,
    pub message_id: i64,
    pub user_id: String,
    pub self_id: String,
    pub message: Vec<Segment>,
    pub raw_message: String,
    pub font: i64,
    pub sender: WireSender,
    pub time: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct WireSender {
    pub user_id: String,
    pub nickname: String,
    pub sex: &'static str,
    pub age: u8,
}

impl WireSender {
    pub fn new(user_id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            nickname: nickname.into(),
            sex: "unknown",
            age: 0,
        }
    }
}

impl PrivateMessageEvent {
    pub fn text(
        message_id: i64,
        text: impl Into<String>,
        sender: WireSender,
        self_id: impl Into<String>,
        time: i64,
    ) -> Self {
        let text = text.into();
        Self {
            post_type: "message",
            message_type: "private",
            sub_type: "friend",
            message_id,
            user_id: sender.user_id.clone(),
            self_id: self_id.into(),
            message: vec![Segment::text(text.clone())],
            raw_message: text,
            font: 0,
            sender,
            time,
        }
    }
}

/// Response envelope for backend API calls. The echo travels back verbatim.
#[derive(Debug, Clone, Serialize)]
pub struct ApiResponse {
    pub status: &'static str,
    pub retcode: i64,
    pub data: Value,
    pub echo: Value,
}

impl ApiResponse {
    pub fn ok(echo: Value, data: Value) -> Self {
        Self {
            status: "ok",
            retcode: 0,
            data,
            echo,
        }
    }
}

/// An API call from the backend that the bridge must answer as if it were a
/// bot runtime.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub echo: Value,
    pub action: String,
    pub params: Value,
}

/// Bot reply content carried by an action call.
#[derive(Debug, Clone)]
pub enum DeliverAction {
    /// `send_msg`: a segment array (or bare string) for the primary view.
    Message(Vec<Segment>),
    /// `send_private_forward_msg`: a list of forward nodes.
    Forward(Vec<Segment>),
}

/// A raw private message event from the backend.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub segments: Vec<Segment>,
}

/// Content carried by an inbound frame.
#[derive(Debug, Clone)]
pub enum InboundContent {
    /// Heartbeat acknowledgement; observed, never acted on.
    HeartbeatAck,
    /// Content delivery via an action call.
    Deliver(DeliverAction),
    /// Content delivery via a raw message event.
    Message(MessageEvent),
}

/// A classified inbound frame. One frame can demand two reactions: the
/// backend attaches an `echo` to its action calls, so a `send_msg` must be
/// answered like any other API call *and* have its content delivered. The
/// two halves are therefore reported independently.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    /// Set when the frame carries an echo the bridge must answer.
    pub request: Option<ApiRequest>,
    /// Set when the frame carries something the bridge models.
    pub content: Option<InboundContent>,
}

impl InboundFrame {
    /// Classify one wire frame. Parse failures are errors; a well-formed
    /// frame matching nothing yields a frame with both halves empty.
    pub fn classify(raw: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(FrameError::NotAnObject);
        }

        let request = value
            .get("echo")
            .filter(|echo| !echo.is_null())
            .map(|echo| ApiRequest {
                echo: echo.clone(),
                action: value
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                params: value.get("params").cloned().unwrap_or(Value::Null),
            });

        let content = Self::classify_content(&value);
        Ok(Self { request, content })
    }

    fn classify_content(value: &Value) -> Option<InboundContent> {
        if value.get("meta_event_type").and_then(Value::as_str) == Some("heartbeat") {
            return Some(InboundContent::HeartbeatAck);
        }

        match value.get("action").and_then(Value::as_str) {
            Some("send_msg") => {
                let segments = value
                    .get("params")
                    .and_then(|params| params.get("message"))
                    .map(parse_segments)
                    .unwrap_or_default();
                return Some(InboundContent::Deliver(DeliverAction::Message(segments)));
            }
            Some("send_private_forward_msg") => {
                let nodes = value
                    .get("params")
                    .and_then(|params| params.get("messages"))
                    .map(parse_segments)
                    .unwrap_or_default();
                return Some(InboundContent::Deliver(DeliverAction::Forward(nodes)));
            }
            _ => {}
        }

        if value.get("post_type").and_then(Value::as_str) == Some("message")
            && value.get("message_type").and_then(Value::as_str) == Some("private")
        {
            let segments = value.get("message").map(parse_segments).unwrap_or_default();
            return Some(InboundContent::Message(MessageEvent { segments }));
        }

        None
    }

    /// Neither an echo to answer nor content to deliver.
    pub fn is_empty(&self) -> bool {
        self.request.is_none() && self.content.is_none()
    }
}
