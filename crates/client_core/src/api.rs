use anyhow::Result;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationSummary, MessagePayload},
};

use crate::config::ClientSettings;

/// Request/response collaborator for everything outside the live channel:
/// roster listing, conversation CRUD, history fetches and voice-note uploads.
pub struct ChatApi {
    http: Client,
    server_url: String,
    token: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum CreateConversationRequest {
    Direct {
        user_id: UserId,
    },
    Group {
        name: String,
        member_ids: Vec<UserId>,
        admin_id: UserId,
    },
}

#[derive(Debug, Serialize)]
struct AddMembersRequest {
    member_ids: Vec<UserId>,
}

#[derive(Debug, Serialize)]
struct PreferencesRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pinned: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    archived: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct VoiceUploadResponse {
    url: String,
}

impl ChatApi {
    pub fn new(settings: &ClientSettings, token: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .build()?;
        Ok(Self {
            http,
            server_url: settings.server_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    pub async fn list_conversations(&self, archived: bool) -> Result<Vec<ConversationSummary>> {
        let conversations = self
            .http
            .get(format!("{}/chat/conversations", self.server_url))
            .query(&[("archived", archived)])
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversations)
    }

    pub async fn create_direct(&self, other: UserId) -> Result<ConversationSummary> {
        self.create_conversation(CreateConversationRequest::Direct { user_id: other })
            .await
    }

    pub async fn create_group(
        &self,
        name: &str,
        member_ids: Vec<UserId>,
        admin_id: UserId,
    ) -> Result<ConversationSummary> {
        self.create_conversation(CreateConversationRequest::Group {
            name: name.to_string(),
            member_ids,
            admin_id,
        })
        .await
    }

    async fn create_conversation(
        &self,
        request: CreateConversationRequest,
    ) -> Result<ConversationSummary> {
        let conversation = self
            .http
            .post(format!("{}/chat/conversations", self.server_url))
            .bearer_auth(&self.token)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversation)
    }

    /// Full history of a conversation, ordered oldest first, newest last.
    pub async fn conversation_messages(
        &self,
        conversation_id: ConversationId,
    ) -> Result<Vec<MessagePayload>> {
        let messages = self
            .http
            .get(format!(
                "{}/chat/conversations/{}/messages",
                self.server_url, conversation_id.0
            ))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(messages)
    }

    /// Uploads a recorded voice note and returns its playable URL.
    pub async fn upload_voice_note(&self, bytes: Vec<u8>, mime_type: &str) -> Result<String> {
        let response: VoiceUploadResponse = self
            .http
            .post(format!("{}/chat/voice/upload", self.server_url))
            .bearer_auth(&self.token)
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(bytes)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.url)
    }

    pub async fn add_members(
        &self,
        conversation_id: ConversationId,
        member_ids: Vec<UserId>,
    ) -> Result<ConversationSummary> {
        let conversation = self
            .http
            .post(format!(
                "{}/chat/conversations/{}/members",
                self.server_url, conversation_id.0
            ))
            .bearer_auth(&self.token)
            .json(&AddMembersRequest { member_ids })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversation)
    }

    pub async fn leave_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.http
            .post(format!(
                "{}/chat/conversations/{}/leave",
                self.server_url, conversation_id.0
            ))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn delete_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        self.http
            .delete(format!(
                "{}/chat/conversations/{}",
                self.server_url, conversation_id.0
            ))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    pub async fn update_preferences(
        &self,
        conversation_id: ConversationId,
        pinned: Option<bool>,
        archived: Option<bool>,
    ) -> Result<ConversationSummary> {
        let conversation = self
            .http
            .patch(format!(
                "{}/chat/conversations/{}/preferences",
                self.server_url, conversation_id.0
            ))
            .bearer_auth(&self.token)
            .json(&PreferencesRequest { pinned, archived })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(conversation)
    }
}
