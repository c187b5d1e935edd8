//! Bidirectional mapping between UI intent and wire frames.
//!
//! Outgoing: plain text becomes a private message event carrying one text
//! segment and a locally issued monotonic id. Incoming: API calls are
//! answered as if this bridge were a bot runtime (the backend polls its
//! transport endpoint with the same surface a native bot client answers),
//! and content frames become display-ready records.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Value, json};

use skiff_proto::segment::ForwardNode;
use skiff_proto::{
    ApiRequest, ApiResponse, MESSAGE_ID_BASE, PrivateMessageEvent, Segment, VersionInfo, WireSender,
};

use crate::identity::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderKind {
    User,
    Robot,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordBody {
    Text(String),
    /// A resolved image reference: URL, path or data URL. Empty when the
    /// original reference was unusable.
    Image(String),
    /// Flattened one-line-per-sender summary of a forwarded bundle.
    ForwardPreview(String),
}

/// A display-ready message record. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisplayRecord {
    pub sender: SenderKind,
    pub body: RecordBody,
}

impl DisplayRecord {
    fn robot(body: RecordBody) -> Self {
        Self {
            sender: SenderKind::Robot,
            body,
        }
    }
}

/// Structured per-sender expansion of a forwarded bundle, for a detail view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardTranscript {
    pub entries: Vec<ForwardEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardEntry {
    pub sender_name: String,
    pub text: String,
}

pub struct Translator {
    bot_id: String,
    bot_name: String,
    next_message_id: i64,
}

impl Translator {
    pub fn new(bot_id: impl Into<String>, bot_name: impl Into<String>) -> Self {
        Self {
            bot_id: bot_id.into(),
            bot_name: bot_name.into(),
            next_message_id: MESSAGE_ID_BASE,
        }
    }

    /// Wrap user text into the outgoing wire event, issuing the next local id.
    pub fn outgoing_text(
        &mut self,
        session: &Session,
        text: &str,
        time: i64,
    ) -> (i64, PrivateMessageEvent) {
        let message_id = self.next_message_id;
        self.next_message_id += 1;
        let sender = WireSender::new(session.user_id(), session.nickname());
        let event = PrivateMessageEvent::text(message_id, text, sender, self.bot_id.clone(), time);
        (message_id, event)
    }

    /// Answer a backend API call. Unrecognized actions still get an `ok/0`
    /// envelope with the echo preserved; the backend must never lose a poll.
    pub fn answer_api(&self, request: &ApiRequest, session: Option<&Session>) -> ApiResponse {
        let data = match request.action.as_str() {
            "get_login_info" => json!({
                "user_id": self.bot_id,
                "nickname": self.bot_name,
            }),
            "get_version_info" => {
                serde_json::to_value(VersionInfo::default()).unwrap_or(Value::Null)
            }
            "get_friend_list" => {
                let (user_id, nickname) = match session {
                    Some(session) => (session.user_id().to_string(), session.nickname()),
                    None => ("anonymous".to_string(), "user"),
                };
                json!([{ "user_id": user_id, "nickname": nickname, "remark": "" }])
            }
            "get_group_list" => json!([]),
            "_set_model_show" => json!({ "result": true }),
            other => {
                tracing::debug!(target: "skiff::translate", action = other, "answering unrecognized action");
                Value::Null
            }
        };
        ApiResponse::ok(request.echo.clone(), data)
    }

    /// Translate a `send_msg` delivery: one record per text or image segment.
    pub fn deliver_message(&self, segments: &[Segment]) -> Vec<DisplayRecord> {
        segments
            .iter()
            .filter_map(|segment| match segment {
                Segment::Text { text } => {
                    Some(DisplayRecord::robot(RecordBody::Text(text.clone())))
                }
                Segment::Image { file } => Some(DisplayRecord::robot(RecordBody::Image(
                    decode_image_reference(file),
                ))),
                _ => None,
            })
            .collect()
    }

    /// Translate a raw message event: a single flattened text record.
    pub fn deliver_event(&self, segments: &[Segment]) -> DisplayRecord {
        DisplayRecord::robot(RecordBody::Text(flatten_segments(segments)))
    }

    /// Translate a forwarded bundle: a flattened preview for the primary view
    /// plus the structured transcript for a detail view.
    pub fn deliver_forward(&self, nodes: &[Segment]) -> (DisplayRecord, ForwardTranscript) {
        let entries: Vec<ForwardEntry> = nodes
            .iter()
            .filter_map(|segment| match segment {
                Segment::Node(node) => Some(forward_entry(node)),
                _ => None,
            })
            .collect();
        let preview = entries
            .iter()
            .map(|entry| format!("{}: {}", entry.sender_name, entry.text))
            .collect::<Vec<_>>()
            .join("\n");
        (
            DisplayRecord::robot(RecordBody::ForwardPreview(preview)),
            ForwardTranscript { entries },
        )
    }
}

fn forward_entry(node: &ForwardNode) -> ForwardEntry {
    ForwardEntry {
        sender_name: node
            .sender_name
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        text: flatten_segments(&node.content),
    }
}

/// Flatten mixed segments into one preview string: text verbatim, everything
/// else as a bracketed type tag, nested forwards inlined.
fn flatten_segments(segments: &[Segment]) -> String {
    segments
        .iter()
        .map(|segment| match segment {
            Segment::Text { text } => text.clone(),
            Segment::Image { .. } => "[image]".to_string(),
            Segment::Node(node) => flatten_segments(&node.content),
            Segment::Other { kind } => format!("[{kind}]"),
        })
        .collect::<Vec<_>>()
        .join("")
}

/// Resolve an image reference to something displayable. URL-ish references
/// pass through; `base64://` payloads become data URLs; anything else
/// degrades to an empty reference with a warning, never an error.
pub fn decode_image_reference(content: &str) -> String {
    const URL_PREFIXES: [&str; 5] = ["http://", "https://", "/", "./", "../"];
    if URL_PREFIXES.iter().any(|prefix| content.starts_with(prefix)) {
        return content.to_string();
    }
    if let Some(payload) = content.strip_prefix("base64://") {
        if BASE64.decode(payload).is_ok() {
            return format!("data:image/png;base64,{payload}");
        }
        tracing::warn!(target: "skiff::translate", "inline image payload is not valid base64");
        return String::new();
    }
    tracing::warn!(target: "skiff::translate", reference = content, "unrecognized image reference");
    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use skiff_proto::segment::parse_segments;

    fn session() -> Session {
        Session::anonymous("u-42".into(), None, None)
    }

    fn translator() -> Translator {
        Translator::new("10001", "Skiffy")
    }

    #[test]
    fn outgoing_text_round_trips_and_ids_increase() {
        let mut translator = translator();
        let (first_id, event) = translator.outgoing_text(&session(), "hello", 1_700_000_000);
        let frame = serde_json::to_value(&event).unwrap();
        assert_eq!(frame["message"][0]["data"]["text"], "hello");
        assert_eq!(first_id, MESSAGE_ID_BASE);

        let (second_id, _) = translator.outgoing_text(&session(), "again", 1_700_000_001);
        assert!(second_id > first_id);
    }

    #[test]
    fn outgoing_identity_follows_the_session() {
        let mut translator = translator();
        let admin = Session::admin("9000".into(), None);
        let (_, event) = translator.outgoing_text(&admin, "hi", 0);
        assert_eq!(event.sender.user_id, "9000");
        assert_eq!(event.sender.nickname, "admin");
        assert_eq!(event.user_id, "9000");
        assert_eq!(event.self_id, "10001");
    }

    #[test]
    fn known_api_actions_carry_payloads() {
        let translator = translator();
        let request = |action: &str| ApiRequest {
            echo: json!("e1"),
            action: action.to_string(),
            params: Value::Null,
        };

        let login = translator.answer_api(&request("get_login_info"), Some(&session()));
        assert_eq!(login.data["user_id"], "10001");
        assert_eq!(login.data["nickname"], "Skiffy");
        assert_eq!(login.echo, json!("e1"));

        let version = translator.answer_api(&request("get_version_info"), None);
        assert_eq!(version.data["protocol_version"], "v11");

        let friends = translator.answer_api(&request("get_friend_list"), Some(&session()));
        assert_eq!(friends.data[0]["user_id"], "u-42");
        assert_eq!(friends.data[0]["nickname"], "user");

        let groups = translator.answer_api(&request("get_group_list"), None);
        assert_eq!(groups.data, json!([]));

        let model = translator.answer_api(&request("_set_model_show"), None);
        assert_eq!(model.data["result"], true);
    }

    #[test]
    fn unknown_actions_still_get_an_ok_envelope() {
        let translator = translator();
        let response = translator.answer_api(
            &ApiRequest {
                echo: json!({ "nested": 7 }),
                action: "get_cookies".into(),
                params: Value::Null,
            },
            None,
        );
        assert_eq!(response.status, "ok");
        assert_eq!(response.retcode, 0);
        assert_eq!(response.data, Value::Null);
        assert_eq!(response.echo, json!({ "nested": 7 }));
    }

    #[test]
    fn image_references_decode_per_contract() {
        assert_eq!(
            decode_image_reference("base64://Zm9v"),
            "data:image/png;base64,Zm9v"
        );
        assert_eq!(
            decode_image_reference("https://x/y.png"),
            "https://x/y.png"
        );
        assert_eq!(decode_image_reference("./cached/y.png"), "./cached/y.png");
        assert_eq!(decode_image_reference("garbage"), "");
        assert_eq!(decode_image_reference("base64://!!!not-base64"), "");
    }

    #[test]
    fn send_msg_delivery_yields_per_segment_records() {
        let translator = translator();
        let segments = vec![
            Segment::text("line one\nline two"),
            Segment::Image {
                file: "base64://Zm9v".into(),
            },
            Segment::Other {
                kind: "face".into(),
            },
        ];
        let records = translator.deliver_message(&segments);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].body, RecordBody::Text("line one\nline two".into()));
        assert_eq!(
            records[1].body,
            RecordBody::Image("data:image/png;base64,Zm9v".into())
        );
    }

    #[test]
    fn raw_events_flatten_with_bracket_tags() {
        let translator = translator();
        let segments = parse_segments(&json!([
            { "type": "text", "data": { "text": "see " } },
            { "type": "image", "data": { "file": "https://x/y.png" } },
            { "type": "face", "data": { "id": 1 } },
        ]));
        let record = translator.deliver_event(&segments);
        assert_eq!(record.body, RecordBody::Text("see [image][face]".into()));
    }

    #[test]
    fn forwards_produce_preview_and_transcript() {
        let translator = translator();
        let nodes = parse_segments(&json!([
            { "type": "node", "data": { "name": "alice", "content": [
                { "type": "text", "data": { "text": "first" } },
            ]}},
            { "type": "node", "data": { "nickname": "bob", "content": [
                { "type": "text", "data": { "text": "second " } },
                { "type": "image", "data": { "file": "https://x/z.png" } },
            ]}},
        ]));
        let (preview, transcript) = translator.deliver_forward(&nodes);
        assert_eq!(
            preview.body,
            RecordBody::ForwardPreview("alice: first\nbob: second [image]".into())
        );
        assert_eq!(transcript.entries.len(), 2);
        assert_eq!(transcript.entries[1].sender_name, "bob");
        assert_eq!(transcript.entries[1].text, "second [image]");
    }
}
