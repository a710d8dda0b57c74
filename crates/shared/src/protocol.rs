use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ConversationId, ConversationKind, MessageId, ParticipantSummary, TempId, UserId},
    error::ApiError,
};

/// Commands issued by the client over the live channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientCommand {
    Subscribe {
        conversation_id: ConversationId,
    },
    Unsubscribe {
        conversation_id: ConversationId,
    },
    SendMessage {
        conversation_id: ConversationId,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        voice_note_url: Option<String>,
        temp_id: TempId,
    },
    EditMessage {
        message_id: MessageId,
        new_content: String,
    },
    DeleteMessage {
        message_id: MessageId,
        for_all: bool,
    },
    ReadMessages {
        conversation_id: ConversationId,
        up_to_message_id: MessageId,
    },
}

/// A server-confirmed message as it travels on the wire, both in history
/// fetches and inside live events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub voice_note_url: Option<String>,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub delivered_to: Vec<UserId>,
    #[serde(default)]
    pub read_by: Vec<UserId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub participants: Vec<ParticipantSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_id: Option<UserId>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub archived: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<MessagePayload>,
    pub created_at: DateTime<Utc>,
}

/// Events delivered by the server over the live channel.
///
/// Note there is deliberately no "message hidden" event: hide-for-me is a
/// local projection on the requesting client and is never broadcast.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageNew {
        message: MessagePayload,
    },
    MessageEdited {
        conversation_id: ConversationId,
        message: MessagePayload,
    },
    MessageDeleted {
        conversation_id: ConversationId,
        message_id: MessageId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_message: Option<MessagePayload>,
    },
    MessageRead {
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to_message_id: MessageId,
    },
    MessageDelivered {
        conversation_id: ConversationId,
        message_id: MessageId,
        recipient_id: UserId,
    },
    MessageDeliveredBulk {
        conversation_id: ConversationId,
        recipient_id: UserId,
    },
    SendAck {
        ok: bool,
        temp_id: TempId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<MessagePayload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    ConversationCreated {
        conversation: ConversationSummary,
    },
    ConversationUpdated {
        conversation: ConversationSummary,
    },
    ConversationDeleted {
        conversation_id: ConversationId,
    },
    Error(ApiError),
}
