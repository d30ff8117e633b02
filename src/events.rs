//! Socket protocol payloads.
//!
//! Frames are JSON text `{"event": <name>, "data": <payload>}` in both
//! directions. Inbound payloads are validated here; relayed payloads keep
//! their original JSON so other gateway instances see exactly what the
//! client sent.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown event `{0}`")]
    UnknownEvent(String),
    #[error("missing field `{0}`")]
    Missing(&'static str),
    #[error("{0}")]
    Invalid(String),
}

#[derive(Debug, Deserialize)]
struct Frame {
    event: String,
    #[serde(default)]
    data: Value,
}

#[derive(Serialize)]
struct OutboundFrame<'a> {
    event: &'a str,
    data: &'a Value,
}

/// A validated client event.
#[derive(Debug)]
pub enum ClientEvent {
    Auth { user_id: String },
    JoinChat(ChatMembership),
    LeaveChat(ChatMembership),
    Message { raw: Value, message: ChatMessage },
    Typing { raw: Value, event: TypingEvent },
    MessageStatus { raw: Value, update: MessageStatusEvent },
    GroupEvent(GroupEvent),
}

impl ClientEvent {
    pub fn parse(text: &str, received_at: OffsetDateTime) -> Result<Self, ValidationError> {
        let Frame { event, data } = serde_json::from_str(text)?;

        let event = match event.as_str() {
            "auth" => {
                let AuthPayload { user_id } = serde_json::from_value(data)?;
                ClientEvent::Auth { user_id }
            }
            "join_chat" => ClientEvent::JoinChat(ChatMembership::parse(data)?),
            "leave_chat" => ClientEvent::LeaveChat(ChatMembership::parse(data)?),
            "message" => {
                let draft: MessageDraft = serde_json::from_value(data.clone())?;
                let message = ChatMessage::from_draft(draft, received_at)?;
                ClientEvent::Message { raw: data, message }
            }
            "typing" => {
                let event: TypingEvent = serde_json::from_value(data.clone())?;
                require("chatId", &event.chat_id)?;
                ClientEvent::Typing { raw: data, event }
            }
            "message_status" => {
                let update: MessageStatusEvent = serde_json::from_value(data.clone())?;
                require("chatId", &update.chat_id)?;
                require("messageId", &update.message_id)?;
                ClientEvent::MessageStatus { raw: data, update }
            }
            "group_event" => {
                let event: GroupEvent = serde_json::from_value(data)?;
                require("chatId", &event.chat_id)?;
                ClientEvent::GroupEvent(event)
            }
            other => return Err(ValidationError::UnknownEvent(other.to_owned())),
        };

        Ok(event)
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Missing(field));
    }
    Ok(())
}

/// Events the gateway emits to its sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    ReceiveMessage,
    Typing,
    Presence,
    MessageStatusUpdate,
    GroupUpdate,
}

impl ServerEvent {
    pub fn name(self) -> &'static str {
        match self {
            ServerEvent::ReceiveMessage => "receive_message",
            ServerEvent::Typing => "typing",
            ServerEvent::Presence => "presence",
            ServerEvent::MessageStatusUpdate => "message_status_update",
            ServerEvent::GroupUpdate => "group_update",
        }
    }

    pub fn encode(self, data: &Value) -> Result<String, serde_json::Error> {
        serde_json::to_string(&OutboundFrame {
            event: self.name(),
            data,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthPayload {
    #[serde(default)]
    user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMembership {
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub user_id: String,
}

impl ChatMembership {
    fn parse(data: Value) -> Result<Self, ValidationError> {
        let membership: ChatMembership = serde_json::from_value(data)?;
        require("chatId", &membership.chat_id)?;
        Ok(membership)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub chat_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub is_typing: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Delivered,
    Read,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageStatusEvent {
    pub message_id: String,
    pub chat_id: String,
    pub user_id: String,
    pub status: DeliveryStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupEventKind {
    Join,
    Leave,
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupEvent {
    #[serde(rename = "type")]
    pub kind: GroupEventKind,
    pub chat_id: String,
    pub user_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresenceRecord {
    pub user_id: String,
    pub status: PresenceStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    #[serde(alias = "image")]
    File,
    System,
}

impl MessageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
            MessageKind::System => "system",
        }
    }
}

/// The sender field arrives either as a bare id or as a populated user.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SenderRef {
    Id(String),
    Profile { id: String },
}

impl SenderRef {
    fn into_id(self) -> String {
        match self {
            SenderRef::Id(id) | SenderRef::Profile { id } => id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageDraft {
    #[serde(default)]
    id: String,
    #[serde(default)]
    chat_id: String,
    #[serde(default, alias = "user")]
    sender: Option<SenderRef>,
    #[serde(default, alias = "message")]
    content: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<MessageKind>,
    #[serde(default)]
    file_url: Option<String>,
    #[serde(default)]
    file_name: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    timestamp: Option<OffsetDateTime>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MessageBody {
    Text {
        content: String,
    },
    File {
        url: String,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        caption: Option<String>,
    },
    System {
        content: String,
    },
}

impl MessageBody {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessageBody::Text { .. } => MessageKind::Text,
            MessageBody::File { .. } => MessageKind::File,
            MessageBody::System { .. } => MessageKind::System,
        }
    }

    /// Short human readable form, used for notifications.
    pub fn preview(&self) -> String {
        match self {
            MessageBody::Text { content } | MessageBody::System { content } => content.clone(),
            MessageBody::File { name, caption, .. } => name
                .clone()
                .or_else(|| caption.clone())
                .unwrap_or_else(|| "Sent a file".to_owned()),
        }
    }
}

/// A chat message as it travels through the durable queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub chat_id: String,
    pub sender_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub body: MessageBody,
}

impl ChatMessage {
    fn from_draft(draft: MessageDraft, received_at: OffsetDateTime) -> Result<Self, ValidationError> {
        require("id", &draft.id)?;
        require("chatId", &draft.chat_id)?;

        let sender_id = draft
            .sender
            .map(SenderRef::into_id)
            .filter(|id| !id.trim().is_empty())
            .ok_or(ValidationError::Missing("sender"))?;
        let kind = draft.kind.ok_or(ValidationError::Missing("type"))?;
        let content = draft.content.filter(|c| !c.is_empty());

        let body = match kind {
            MessageKind::Text => MessageBody::Text {
                content: content.ok_or(ValidationError::Missing("content"))?,
            },
            MessageKind::System => MessageBody::System {
                content: content.ok_or(ValidationError::Missing("content"))?,
            },
            MessageKind::File => MessageBody::File {
                url: draft
                    .file_url
                    .filter(|url| !url.is_empty())
                    .ok_or(ValidationError::Missing("fileUrl"))?,
                name: draft.file_name,
                caption: content,
            },
        };

        Ok(Self {
            id: draft.id,
            chat_id: draft.chat_id,
            sender_id,
            created_at: draft.timestamp.unwrap_or(received_at),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::datetime;

    fn parse(value: Value) -> Result<ClientEvent, ValidationError> {
        ClientEvent::parse(&value.to_string(), datetime!(2024-05-01 12:00 UTC))
    }

    #[test]
    fn message_accepts_legacy_field_names() {
        let event = parse(json!({
            "event": "message",
            "data": {
                "id": "m1",
                "chatId": "c1",
                "user": { "id": "alice", "name": "Alice" },
                "message": "hi",
                "type": "text",
                "timestamp": "2024-05-01T11:59:00.000Z",
            }
        }))
        .unwrap();

        let ClientEvent::Message { message, raw } = event else {
            panic!("expected a message event");
        };
        assert_eq!(message.sender_id, "alice");
        assert_eq!(message.body, MessageBody::Text { content: "hi".into() });
        assert_eq!(message.created_at, datetime!(2024-05-01 11:59 UTC));
        assert_eq!(raw["user"]["name"], "Alice");
    }

    #[test]
    fn message_without_timestamp_uses_receive_time() {
        let event = parse(json!({
            "event": "message",
            "data": { "id": "m1", "chatId": "c1", "sender": "bob", "content": "yo", "type": "text" }
        }))
        .unwrap();

        let ClientEvent::Message { message, .. } = event else {
            panic!("expected a message event");
        };
        assert_eq!(message.sender_id, "bob");
        assert_eq!(message.created_at, datetime!(2024-05-01 12:00 UTC));
    }

    #[test]
    fn image_messages_resolve_to_file_bodies() {
        let event = parse(json!({
            "event": "message",
            "data": {
                "id": "m2", "chatId": "c1", "sender": "bob", "type": "image",
                "fileUrl": "https://files/cat.png", "fileName": "cat.png"
            }
        }))
        .unwrap();

        let ClientEvent::Message { message, .. } = event else {
            panic!("expected a message event");
        };
        assert_eq!(message.body.kind(), MessageKind::File);
        assert_eq!(message.body.preview(), "cat.png");
    }

    #[test]
    fn message_missing_required_fields_is_rejected() {
        let missing_sender = parse(json!({
            "event": "message",
            "data": { "id": "m1", "chatId": "c1", "content": "hi", "type": "text" }
        }));
        assert!(matches!(missing_sender, Err(ValidationError::Missing("sender"))));

        let missing_content = parse(json!({
            "event": "message",
            "data": { "id": "m1", "chatId": "c1", "sender": "a", "type": "text" }
        }));
        assert!(matches!(missing_content, Err(ValidationError::Missing("content"))));

        let file_without_url = parse(json!({
            "event": "message",
            "data": { "id": "m1", "chatId": "c1", "sender": "a", "type": "file" }
        }));
        assert!(matches!(file_without_url, Err(ValidationError::Missing("fileUrl"))));
    }

    #[test]
    fn unknown_events_and_garbage_are_rejected() {
        assert!(matches!(
            parse(json!({ "event": "shout", "data": {} })),
            Err(ValidationError::UnknownEvent(name)) if name == "shout"
        ));
        assert!(matches!(
            ClientEvent::parse("not json", OffsetDateTime::now_utc()),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn empty_auth_is_not_an_error() {
        let event = parse(json!({ "event": "auth", "data": {} })).unwrap();
        assert!(matches!(event, ClientEvent::Auth { user_id } if user_id.is_empty()));
    }

    #[test]
    fn queue_payload_keeps_the_tagged_body() {
        let message = ChatMessage {
            id: "m1".into(),
            chat_id: "c1".into(),
            sender_id: "a".into(),
            created_at: datetime!(2024-05-01 12:00 UTC),
            body: MessageBody::File {
                url: "https://files/x".into(),
                name: None,
                caption: Some("look".into()),
            },
        };

        let encoded = serde_json::to_value(&message).unwrap();
        assert_eq!(encoded["body"]["type"], "file");
        assert_eq!(serde_json::from_value::<ChatMessage>(encoded).unwrap(), message);
    }

    #[test]
    fn file_previews_prefer_the_file_name() {
        let file = |name: Option<&str>, caption: Option<&str>| MessageBody::File {
            url: "https://files/x".into(),
            name: name.map(str::to_owned),
            caption: caption.map(str::to_owned),
        };

        assert_eq!(file(Some("x.pdf"), Some("look")).preview(), "x.pdf");
        assert_eq!(file(None, Some("look")).preview(), "look");
        assert_eq!(file(None, None).preview(), "Sent a file");
    }

    #[test]
    fn outbound_frames_carry_the_event_name() {
        let frame = ServerEvent::GroupUpdate.encode(&json!({ "chatId": "c1" })).unwrap();
        assert_eq!(frame, r#"{"event":"group_update","data":{"chatId":"c1"}}"#);
    }
}
