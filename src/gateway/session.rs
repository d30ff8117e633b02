use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use time::OffsetDateTime;

use super::{chat_room, user_room, ConnectionId, Gateway, GatewayError};
use crate::{
    events::{
        ChatMembership, ChatMessage, ClientEvent, DeliveryStatus, GroupEvent, GroupEventKind,
        MessageBody, MessageStatusEvent, TypingEvent, ValidationError,
    },
    queue::QueueName,
    relay::Topic,
};

/// Per-connection state. Events from one connection are handled in the
/// order the client sent them.
pub struct Session {
    id: ConnectionId,
    gateway: Arc<Gateway>,
    user_id: Option<String>,
    chats: HashSet<String>,
    /// Last `isTyping=true` event per chat, for stop-typing on leave.
    typing: HashMap<String, TypingEvent>,
}

impl Session {
    pub(super) fn new(id: ConnectionId, gateway: Arc<Gateway>) -> Self {
        Self {
            id,
            gateway,
            user_id: None,
            chats: HashSet::new(),
            typing: HashMap::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Handles one inbound text frame. Failures are logged; they never end
    /// the session.
    pub async fn handle_text(&mut self, text: &str) {
        let event = match ClientEvent::parse(text, OffsetDateTime::now_utc()) {
            Ok(event) => event,
            Err(err) => {
                tracing::warn!(connection = %self.id, %err, "dropping invalid frame");
                return;
            }
        };

        match self.dispatch(event).await {
            Ok(()) => {}
            Err(GatewayError::Validation(err)) => {
                tracing::warn!(connection = %self.id, %err, "event refused")
            }
            Err(err) => {
                tracing::error!(connection = %self.id, user = ?self.user_id, %err, "event failed")
            }
        }
    }

    async fn dispatch(&mut self, event: ClientEvent) -> Result<(), GatewayError> {
        match event {
            ClientEvent::Auth { user_id } => self.auth(user_id).await,
            ClientEvent::JoinChat(membership) => self.join_chat(membership).await,
            ClientEvent::LeaveChat(membership) => self.leave_chat(membership).await,
            ClientEvent::Message { raw, message } => self.message(raw, message).await,
            ClientEvent::Typing { raw, event } => {
                if event.is_typing {
                    self.typing.insert(event.chat_id.clone(), event);
                } else {
                    self.typing.remove(&event.chat_id);
                }
                self.gateway.relay.publish(Topic::Typing, raw.to_string()).await?;
                Ok(())
            }
            ClientEvent::MessageStatus { raw, .. } => {
                self.gateway
                    .relay
                    .publish(Topic::MessageStatus, raw.to_string())
                    .await?;
                Ok(())
            }
            ClientEvent::GroupEvent(event) => {
                self.gateway.relay.publish_json(Topic::GroupEvents, &event).await?;
                Ok(())
            }
        }
    }

    async fn auth(&mut self, user_id: String) -> Result<(), GatewayError> {
        if user_id.trim().is_empty() {
            tracing::warn!(connection = %self.id, "auth without user id, staying anonymous");
            return Ok(());
        }

        if let Some(previous) = self.user_id.replace(user_id.clone()) {
            if previous != user_id {
                self.gateway.rooms.leave(&user_room(&previous), self.id);
                self.release(&previous).await;
            }
        }
        self.gateway.rooms.join(&user_room(&user_id), self.id);

        tracing::info!(connection = %self.id, user = %user_id, "authenticated");
        self.gateway.presence.set_online(&user_id).await?;
        Ok(())
    }

    /// The acting user: the claimed id in the payload, else the
    /// authenticated one.
    fn actor(&self, claimed: &str) -> Option<String> {
        Some(claimed)
            .filter(|id| !id.trim().is_empty())
            .map(str::to_owned)
            .or_else(|| self.user_id.clone())
    }

    async fn join_chat(&mut self, membership: ChatMembership) -> Result<(), GatewayError> {
        let chat_id = membership.chat_id;
        let actor = self.actor(&membership.user_id);

        if self.gateway.config.verify_membership {
            let Some(user_id) = self.user_id.as_deref() else {
                return Err(ValidationError::Invalid(format!(
                    "join of chat {chat_id} before auth"
                ))
                .into());
            };
            if actor.as_deref() != Some(user_id)
                || !self.gateway.membership.is_participant(&chat_id, user_id).await?
            {
                return Err(ValidationError::Invalid(format!(
                    "{user_id} is not a participant of chat {chat_id}"
                ))
                .into());
            }
        }

        if !self.gateway.rooms.join(&chat_room(&chat_id), self.id) {
            return Ok(());
        }
        self.chats.insert(chat_id.clone());
        tracing::debug!(connection = %self.id, chat = %chat_id, "joined chat");

        if let Some(user_id) = actor {
            self.publish_group_event(GroupEventKind::Join, chat_id, user_id)
                .await?;
        }
        Ok(())
    }

    async fn leave_chat(&mut self, membership: ChatMembership) -> Result<(), GatewayError> {
        let chat_id = membership.chat_id;
        let actor = self.actor(&membership.user_id);

        if !self.gateway.rooms.leave(&chat_room(&chat_id), self.id) {
            return Ok(());
        }
        self.chats.remove(&chat_id);
        tracing::debug!(connection = %self.id, chat = %chat_id, "left chat");

        if let Some(typing) = self.typing.remove(&chat_id) {
            self.stop_typing(typing).await;
        }
        if let Some(user_id) = actor {
            self.publish_group_event(GroupEventKind::Leave, chat_id, user_id)
                .await?;
        }
        Ok(())
    }

    async fn publish_group_event(
        &self,
        kind: GroupEventKind,
        chat_id: String,
        user_id: String,
    ) -> Result<(), GatewayError> {
        let event = GroupEvent {
            kind,
            chat_id,
            user_id,
            timestamp: OffsetDateTime::now_utc(),
        };
        self.gateway.relay.publish_json(Topic::GroupEvents, &event).await?;
        Ok(())
    }

    /// Relays the message as sent, queues it for persistence and, once
    /// queued, announces it as delivered.
    async fn message(
        &mut self,
        raw: serde_json::Value,
        message: ChatMessage,
    ) -> Result<(), GatewayError> {
        if let Err(err) = self.gateway.relay.publish(Topic::Message, raw.to_string()).await {
            tracing::warn!(connection = %self.id, message = %message.id, %err, "message relay failed");
        }

        let queue = &self.gateway.queue;
        queue.enqueue_json(QueueName::Messages, &message).await?;
        if matches!(message.body, MessageBody::File { .. }) {
            if let Err(err) = queue.enqueue_json(QueueName::FileUploads, &message).await {
                tracing::warn!(message = %message.id, %err, "file upload hand-off failed");
            }
        }
        tracing::debug!(connection = %self.id, message = %message.id, chat = %message.chat_id, "message queued");

        let delivered = MessageStatusEvent {
            message_id: message.id,
            chat_id: message.chat_id,
            user_id: message.sender_id,
            status: DeliveryStatus::Delivered,
            timestamp: OffsetDateTime::now_utc(),
        };
        self.gateway
            .relay
            .publish_json(Topic::MessageStatus, &delivered)
            .await?;
        Ok(())
    }

    async fn stop_typing(&self, mut typing: TypingEvent) {
        typing.is_typing = false;
        if let Err(err) = self.gateway.relay.publish_json(Topic::Typing, &typing).await {
            tracing::warn!(connection = %self.id, chat = %typing.chat_id, %err, "stop-typing relay failed");
        }
    }

    /// Tears the connection down. The user is reported offline once no other
    /// local connection is authenticated as them.
    pub async fn close(mut self) {
        for (_, typing) in std::mem::take(&mut self.typing) {
            self.stop_typing(typing).await;
        }

        self.gateway.rooms.unregister(self.id);
        tracing::debug!(connection = %self.id, chats = self.chats.len(), "connection closed");

        if let Some(user_id) = self.user_id.take() {
            self.release(&user_id).await;
        }
    }

    /// Reports `user_id` offline unless another local connection is still
    /// authenticated as them.
    async fn release(&self, user_id: &str) {
        if self.gateway.rooms.occupancy(&user_room(user_id)) > 0 {
            return;
        }
        if let Err(err) = self.gateway.presence.set_offline(user_id).await {
            tracing::error!(user = %user_id, %err, "offline presence update failed");
        }
    }
}
