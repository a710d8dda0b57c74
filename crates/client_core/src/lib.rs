use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use anyhow::Result;
use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, ParticipantSummary, TempId, UserId},
    protocol::{ClientCommand, ConversationSummary, MessagePayload, ServerEvent},
};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tracing::{debug, warn};

pub mod api;
pub mod config;
pub mod roster;
pub mod status;
pub mod transport;

pub use api::ChatApi;
pub use config::{load_settings, ClientSettings};
pub use roster::{KindFilter, MessagePreview, Roster, RosterEntry, RosterFilter};
pub use status::{message_status, DeliveryStatus};
pub use transport::{SocketEvent, SocketHandle};

/// Explicit session identity, passed in at construction instead of being read
/// from any ambient store.
#[derive(Debug, Clone)]
pub struct Session {
    pub user_id: UserId,
    pub display_name: String,
    pub token: String,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("no conversation is open")]
    NoOpenConversation,
    #[error("the open conversation changed while the operation was in flight")]
    ConversationSwitched,
    #[error("message content must not be empty")]
    EmptyMessage,
    #[error("group name must not be empty")]
    EmptyGroupName,
    #[error("a group needs at least two other members")]
    NotEnoughMembers,
    #[error("unknown conversation {0:?}")]
    UnknownConversation(ConversationId),
    #[error("message {0:?} is not in the open conversation")]
    MessageNotFound(MessageId),
    #[error("only your own messages can be modified")]
    NotMessageAuthor,
    #[error("only the group admin may {0}")]
    AdminRequired(&'static str),
    #[error("this action only applies to group conversations")]
    NotAGroup,
}

/// Identity of a locally held message: a client correlation token until the
/// server acknowledges the send, the authoritative server id afterwards. The
/// token is retired on confirmation, never kept as an alias.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageIdentity {
    Pending(TempId),
    Confirmed(MessageId),
}

#[derive(Debug, Clone)]
pub struct MessageRecord {
    pub identity: MessageIdentity,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub voice_note_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub edited_at: Option<DateTime<Utc>>,
    pub deleted: bool,
    pub delivered_to: HashSet<UserId>,
    pub read_by: HashSet<UserId>,
}

impl MessageRecord {
    fn pending(
        temp_id: TempId,
        conversation_id: ConversationId,
        session: &Session,
        content: String,
        voice_note_url: Option<String>,
    ) -> Self {
        Self {
            identity: MessageIdentity::Pending(temp_id),
            conversation_id,
            sender_id: session.user_id,
            sender_name: Some(session.display_name.clone()),
            content,
            voice_note_url,
            created_at: Utc::now(),
            edited_at: None,
            deleted: false,
            delivered_to: HashSet::new(),
            read_by: HashSet::new(),
        }
    }

    fn from_payload(payload: &MessagePayload) -> Self {
        let mut record = Self {
            identity: MessageIdentity::Confirmed(payload.message_id),
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            sender_name: payload.sender_name.clone(),
            content: payload.content.clone(),
            voice_note_url: payload.voice_note_url.clone(),
            created_at: payload.created_at,
            edited_at: payload.edited_at,
            deleted: payload.is_deleted,
            delivered_to: payload.delivered_to.iter().copied().collect(),
            read_by: payload.read_by.iter().copied().collect(),
        };
        if record.deleted {
            record.content.clear();
            record.voice_note_url = None;
        }
        record
    }

    /// Idempotent merge of a server payload into an existing record. Server
    /// fields are authoritative; receipt sets only grow.
    fn merge_payload(&mut self, payload: &MessagePayload) {
        self.identity = MessageIdentity::Confirmed(payload.message_id);
        self.sender_id = payload.sender_id;
        if payload.sender_name.is_some() {
            self.sender_name = payload.sender_name.clone();
        }
        self.content = payload.content.clone();
        self.voice_note_url = payload.voice_note_url.clone();
        self.created_at = payload.created_at;
        self.edited_at = payload.edited_at;
        self.deleted = payload.is_deleted;
        if self.deleted {
            self.content.clear();
            self.voice_note_url = None;
        }
        self.delivered_to.extend(payload.delivered_to.iter().copied());
        self.read_by.extend(payload.read_by.iter().copied());
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.identity, MessageIdentity::Pending(_))
    }

    pub fn server_id(&self) -> Option<MessageId> {
        match self.identity {
            MessageIdentity::Confirmed(id) => Some(id),
            MessageIdentity::Pending(_) => None,
        }
    }

    pub fn edited(&self) -> bool {
        self.edited_at.is_some()
    }
}

/// Notifications for the presentation layer.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    RosterChanged,
    ConversationOpened {
        conversation_id: ConversationId,
    },
    MessagesChanged {
        conversation_id: ConversationId,
    },
    ScrollToBottom {
        conversation_id: ConversationId,
    },
    UnseenChanged {
        conversation_id: ConversationId,
        unseen: u32,
        total_unread: u32,
    },
    SendFailed {
        temp_id: TempId,
        reason: String,
    },
    Notice(String),
}

/// Renderable snapshot of the open conversation.
#[derive(Debug, Clone)]
pub struct ConversationView {
    pub conversation_id: ConversationId,
    pub title: String,
    pub kind: ConversationKind,
    pub participants: Vec<ParticipantSummary>,
    pub messages: Vec<MessageRecord>,
    pub at_bottom: bool,
    pub unseen: u32,
}

struct ActiveConversation {
    conversation_id: ConversationId,
    messages: Vec<MessageRecord>,
    at_bottom: bool,
}

impl ActiveConversation {
    fn new(conversation_id: ConversationId) -> Self {
        Self {
            conversation_id,
            messages: Vec::new(),
            at_bottom: true,
        }
    }

    fn contains_server_id(&self, message_id: MessageId) -> bool {
        self.messages
            .iter()
            .any(|record| record.server_id() == Some(message_id))
    }

    fn find_confirmed_mut(&mut self, message_id: MessageId) -> Option<&mut MessageRecord> {
        self.messages
            .iter_mut()
            .find(|record| record.server_id() == Some(message_id))
    }

    fn position_of_temp(&self, temp_id: &TempId) -> Option<usize> {
        self.messages
            .iter()
            .position(|record| matches!(&record.identity, MessageIdentity::Pending(t) if t == temp_id))
    }

    /// Idempotent upsert by server id: merging an event twice yields the same
    /// state as merging it once. Returns true when a new record was appended.
    fn upsert(&mut self, payload: &MessagePayload) -> bool {
        if let Some(record) = self.find_confirmed_mut(payload.message_id) {
            record.merge_payload(payload);
            false
        } else {
            self.messages.push(MessageRecord::from_payload(payload));
            true
        }
    }

    fn newest_server_id(&self) -> Option<MessageId> {
        self.messages.iter().rev().find_map(MessageRecord::server_id)
    }
}

struct ClientState {
    roster: Roster,
    active: Option<ActiveConversation>,
    /// Bumped on every open/close; a history fetch only applies when the
    /// epoch it started under is still current.
    open_epoch: u64,
    /// Conversations removed on this client only. The server keeps listing
    /// them, so roster refreshes must not resurrect them.
    locally_removed: HashSet<ConversationId>,
}

/// The message-synchronization engine: owns the open conversation's ordered
/// message list, the optimistic-send lifecycle, receipt bookkeeping and the
/// roster, and binds the open conversation to the live channel.
pub struct ChatClient {
    api: ChatApi,
    session: Session,
    socket: SocketHandle,
    inner: Mutex<ClientState>,
    events: broadcast::Sender<ClientEvent>,
}

impl ChatClient {
    /// Connects the live channel and returns the running engine.
    pub fn start(settings: ClientSettings, session: Session) -> Result<Arc<Self>> {
        let api = ChatApi::new(&settings, &session.token)?;
        let (socket_tx, socket_rx) = mpsc::unbounded_channel();
        let socket = transport::spawn(&settings, &session.token, socket_tx)?;
        let client = Self::assemble(api, session, socket);
        client.spawn_socket_dispatch(socket_rx);
        Ok(client)
    }

    fn assemble(api: ChatApi, session: Session, socket: SocketHandle) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            api,
            session,
            socket,
            inner: Mutex::new(ClientState {
                roster: Roster::default(),
                active: None,
                open_epoch: 0,
                locally_removed: HashSet::new(),
            }),
            events,
        })
    }

    fn spawn_socket_dispatch(self: &Arc<Self>, mut socket_rx: mpsc::UnboundedReceiver<SocketEvent>) {
        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = socket_rx.recv().await {
                client.handle_socket_event(event).await;
            }
        });
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    /// Loads the roster (active and archived pages) from the server.
    pub async fn refresh_roster(&self) -> Result<()> {
        let mut conversations = self.api.list_conversations(false).await?;
        conversations.extend(self.api.list_conversations(true).await?);
        {
            let mut state = self.inner.lock().await;
            let removed = state.locally_removed.clone();
            conversations.retain(|summary| !removed.contains(&summary.conversation_id));
            state.roster.replace_all(&conversations);
        }
        self.emit(ClientEvent::RosterChanged);
        Ok(())
    }

    pub async fn roster_snapshot(&self, filter: &RosterFilter) -> Vec<RosterEntry> {
        let state = self.inner.lock().await;
        state.roster.visible(filter)
    }

    pub async fn total_unread(&self) -> u32 {
        let state = self.inner.lock().await;
        state.roster.total_unread()
    }

    pub async fn conversation_view(&self) -> Option<ConversationView> {
        let state = self.inner.lock().await;
        let active = state.active.as_ref()?;
        let entry = state.roster.get(active.conversation_id);
        Some(ConversationView {
            conversation_id: active.conversation_id,
            title: entry
                .map(|e| e.title(self.session.user_id))
                .unwrap_or_else(|| "Conversation".into()),
            kind: entry.map(|e| e.kind).unwrap_or(ConversationKind::Direct),
            participants: entry.map(|e| e.participants.clone()).unwrap_or_default(),
            messages: active.messages.clone(),
            at_bottom: active.at_bottom,
            unseen: entry.map(|e| e.unseen).unwrap_or(0),
        })
    }

    async fn active_conversation_id(&self) -> Option<ConversationId> {
        let state = self.inner.lock().await;
        state.active.as_ref().map(|active| active.conversation_id)
    }

    /// Opens a conversation: unsubscribes the previous one, subscribes the
    /// new one, then fetches history. A fetch that loses a race against a
    /// later open is discarded.
    pub async fn open_conversation(self: &Arc<Self>, conversation_id: ConversationId) -> Result<()> {
        let (previous, epoch) = {
            let mut state = self.inner.lock().await;
            if !state.roster.contains(conversation_id) {
                return Err(ChatError::UnknownConversation(conversation_id).into());
            }
            if state
                .active
                .as_ref()
                .is_some_and(|active| active.conversation_id == conversation_id)
            {
                return Ok(());
            }
            let previous = state.active.take().map(|active| active.conversation_id);
            state.open_epoch += 1;
            state.active = Some(ActiveConversation::new(conversation_id));
            (previous, state.open_epoch)
        };

        if let Some(previous) = previous {
            self.socket.send(ClientCommand::Unsubscribe {
                conversation_id: previous,
            });
        }
        self.socket.send(ClientCommand::Subscribe { conversation_id });
        self.emit(ClientEvent::ConversationOpened { conversation_id });

        let history = self.api.conversation_messages(conversation_id).await?;

        let (newest, total_unread) = {
            let mut state = self.inner.lock().await;
            if state.open_epoch != epoch {
                debug!(
                    conversation_id = conversation_id.0,
                    "discarding stale history fetch"
                );
                return Ok(());
            }
            let Some(active) = state.active.as_mut() else {
                return Ok(());
            };
            active.messages = history.iter().map(MessageRecord::from_payload).collect();
            let newest = active.newest_server_id();
            state.roster.clear_unseen(conversation_id);
            (newest, state.roster.total_unread())
        };

        if let Some(up_to_message_id) = newest {
            self.socket.send(ClientCommand::ReadMessages {
                conversation_id,
                up_to_message_id,
            });
        }
        self.emit(ClientEvent::MessagesChanged { conversation_id });
        self.emit(ClientEvent::ScrollToBottom { conversation_id });
        self.emit(ClientEvent::UnseenChanged {
            conversation_id,
            unseen: 0,
            total_unread,
        });
        Ok(())
    }

    /// Closes the chat surface: unsubscribes and drops the open state. Cached
    /// roster state is untouched.
    pub async fn close_conversation(&self) {
        let previous = {
            let mut state = self.inner.lock().await;
            state.open_epoch += 1;
            state.active.take().map(|active| active.conversation_id)
        };
        if let Some(conversation_id) = previous {
            self.socket.send(ClientCommand::Unsubscribe { conversation_id });
        }
    }

    /// Optimistic text send. Appends a Pending record immediately and issues
    /// the command best-effort; the ack later confirms or removes it.
    pub async fn send_text(&self, content: &str) -> Result<TempId> {
        let content = content.trim();
        if content.is_empty() {
            return Err(ChatError::EmptyMessage.into());
        }
        self.send_outbound(content.to_string(), None).await
    }

    /// Uploads a recorded voice note, then sends it like a text message. If
    /// the open conversation changed while the upload was in flight the send
    /// is abandoned rather than delivered to the wrong thread.
    pub async fn send_voice_note(&self, bytes: Vec<u8>, mime_type: &str) -> Result<TempId> {
        let conversation_id = self
            .active_conversation_id()
            .await
            .ok_or(ChatError::NoOpenConversation)?;
        let url = self.api.upload_voice_note(bytes, mime_type).await?;
        if self.active_conversation_id().await != Some(conversation_id) {
            self.emit(ClientEvent::Notice(
                "conversation changed during upload; voice note was not sent".into(),
            ));
            return Err(ChatError::ConversationSwitched.into());
        }
        self.send_outbound(String::new(), Some(url)).await
    }

    async fn send_outbound(&self, content: String, voice_note_url: Option<String>) -> Result<TempId> {
        let temp_id = TempId::generate();
        let conversation_id = {
            let mut state = self.inner.lock().await;
            let active = state.active.as_mut().ok_or(ChatError::NoOpenConversation)?;
            let record = MessageRecord::pending(
                temp_id.clone(),
                active.conversation_id,
                &self.session,
                content.clone(),
                voice_note_url.clone(),
            );
            active.messages.push(record);
            active.conversation_id
        };

        self.socket.send(ClientCommand::SendMessage {
            conversation_id,
            content,
            voice_note_url,
            temp_id: temp_id.clone(),
        });
        self.emit(ClientEvent::MessagesChanged { conversation_id });
        self.emit(ClientEvent::ScrollToBottom { conversation_id });
        Ok(temp_id)
    }

    /// Optimistic edit of an own, confirmed message.
    pub async fn edit_message(&self, message_id: MessageId, new_content: &str) -> Result<()> {
        let new_content = new_content.trim();
        if new_content.is_empty() {
            return Err(ChatError::EmptyMessage.into());
        }
        let conversation_id = {
            let mut state = self.inner.lock().await;
            let active = state.active.as_mut().ok_or(ChatError::NoOpenConversation)?;
            let conversation_id = active.conversation_id;
            let record = active
                .find_confirmed_mut(message_id)
                .ok_or(ChatError::MessageNotFound(message_id))?;
            if record.sender_id != self.session.user_id {
                return Err(ChatError::NotMessageAuthor.into());
            }
            record.content = new_content.to_string();
            record.edited_at = Some(Utc::now());
            conversation_id
        };

        self.socket.send(ClientCommand::EditMessage {
            message_id,
            new_content: new_content.to_string(),
        });
        self.emit(ClientEvent::MessagesChanged { conversation_id });
        Ok(())
    }

    /// "Delete for everyone": soft-deletes in place, keeping position and
    /// timestamp for ordering continuity.
    pub async fn delete_for_all(&self, message_id: MessageId) -> Result<()> {
        let conversation_id = {
            let mut state = self.inner.lock().await;
            let active = state.active.as_mut().ok_or(ChatError::NoOpenConversation)?;
            let conversation_id = active.conversation_id;
            let record = active
                .find_confirmed_mut(message_id)
                .ok_or(ChatError::MessageNotFound(message_id))?;
            if record.sender_id != self.session.user_id {
                return Err(ChatError::NotMessageAuthor.into());
            }
            record.deleted = true;
            record.content.clear();
            record.voice_note_url = None;
            conversation_id
        };

        self.socket.send(ClientCommand::DeleteMessage {
            message_id,
            for_all: true,
        });
        self.emit(ClientEvent::MessagesChanged { conversation_id });
        Ok(())
    }

    /// "Hide for me": a purely local projection. The record is removed from
    /// this client's list only; no other participant's copy is affected and
    /// no server broadcast ever re-derives it.
    pub async fn hide_for_me(&self, message_id: MessageId) -> Result<()> {
        let conversation_id = {
            let mut state = self.inner.lock().await;
            let active = state.active.as_mut().ok_or(ChatError::NoOpenConversation)?;
            let before = active.messages.len();
            active
                .messages
                .retain(|record| record.server_id() != Some(message_id));
            if active.messages.len() == before {
                return Err(ChatError::MessageNotFound(message_id).into());
            }
            active.conversation_id
        };

        self.socket.send(ClientCommand::DeleteMessage {
            message_id,
            for_all: false,
        });
        self.emit(ClientEvent::MessagesChanged { conversation_id });
        Ok(())
    }

    /// Reports the viewport position. Reaching the bottom clears the unseen
    /// counter and advances the read watermark to the newest message.
    pub async fn set_viewport_at_bottom(&self, at_bottom: bool) {
        let update = {
            let mut state = self.inner.lock().await;
            let Some(active) = state.active.as_mut() else {
                return;
            };
            active.at_bottom = at_bottom;
            if !at_bottom {
                return;
            }
            let conversation_id = active.conversation_id;
            let newest = active.newest_server_id();
            let cleared = state.roster.clear_unseen(conversation_id);
            (conversation_id, newest, cleared, state.roster.total_unread())
        };

        let (conversation_id, newest, cleared, total_unread) = update;
        if let Some(up_to_message_id) = newest {
            self.socket.send(ClientCommand::ReadMessages {
                conversation_id,
                up_to_message_id,
            });
        }
        if cleared {
            self.emit(ClientEvent::UnseenChanged {
                conversation_id,
                unseen: 0,
                total_unread,
            });
        }
    }

    pub async fn create_direct(self: &Arc<Self>, other: UserId) -> Result<ConversationId> {
        let conversation = self.api.create_direct(other).await?;
        let conversation_id = conversation.conversation_id;
        {
            let mut state = self.inner.lock().await;
            state.locally_removed.remove(&conversation_id);
            state.roster.upsert(&conversation);
        }
        self.emit(ClientEvent::RosterChanged);
        self.open_conversation(conversation_id).await?;
        Ok(conversation_id)
    }

    pub async fn create_group(
        self: &Arc<Self>,
        name: &str,
        member_ids: Vec<UserId>,
    ) -> Result<ConversationId> {
        if name.trim().is_empty() {
            return Err(ChatError::EmptyGroupName.into());
        }
        let others = member_ids
            .iter()
            .filter(|id| **id != self.session.user_id)
            .count();
        if others < 2 {
            return Err(ChatError::NotEnoughMembers.into());
        }
        let conversation = self
            .api
            .create_group(name.trim(), member_ids, self.session.user_id)
            .await?;
        let conversation_id = conversation.conversation_id;
        {
            let mut state = self.inner.lock().await;
            state.locally_removed.remove(&conversation_id);
            state.roster.upsert(&conversation);
        }
        self.emit(ClientEvent::RosterChanged);
        self.open_conversation(conversation_id).await?;
        Ok(conversation_id)
    }

    /// Adding members is a privileged action; non-admins are rejected before
    /// any request leaves the client.
    pub async fn add_members(
        &self,
        conversation_id: ConversationId,
        member_ids: Vec<UserId>,
    ) -> Result<()> {
        self.require_admin(conversation_id, "add members").await?;
        let conversation = self.api.add_members(conversation_id, member_ids).await?;
        {
            let mut state = self.inner.lock().await;
            state.roster.upsert(&conversation);
        }
        self.emit(ClientEvent::RosterChanged);
        self.emit(ClientEvent::MessagesChanged { conversation_id });
        Ok(())
    }

    pub async fn leave_group(&self, conversation_id: ConversationId) -> Result<()> {
        {
            let state = self.inner.lock().await;
            let entry = state
                .roster
                .get(conversation_id)
                .ok_or(ChatError::UnknownConversation(conversation_id))?;
            if entry.kind != ConversationKind::Group {
                return Err(ChatError::NotAGroup.into());
            }
        }
        self.api.leave_conversation(conversation_id).await?;
        self.forget_conversation(conversation_id, false).await;
        Ok(())
    }

    pub async fn delete_group(&self, conversation_id: ConversationId) -> Result<()> {
        self.require_admin(conversation_id, "delete the group").await?;
        self.api.delete_conversation(conversation_id).await?;
        self.forget_conversation(conversation_id, false).await;
        Ok(())
    }

    /// Removes a conversation from this client's roster only. Other
    /// participants, and the server, are unaffected; refreshes will not
    /// resurrect it.
    pub async fn remove_local(&self, conversation_id: ConversationId) {
        self.forget_conversation(conversation_id, true).await;
    }

    pub async fn set_pinned(&self, conversation_id: ConversationId, pinned: bool) -> Result<()> {
        let conversation = self
            .api
            .update_preferences(conversation_id, Some(pinned), None)
            .await?;
        {
            let mut state = self.inner.lock().await;
            state.roster.upsert(&conversation);
        }
        self.emit(ClientEvent::RosterChanged);
        Ok(())
    }

    pub async fn set_archived(&self, conversation_id: ConversationId, archived: bool) -> Result<()> {
        let conversation = self
            .api
            .update_preferences(conversation_id, None, Some(archived))
            .await?;
        {
            let mut state = self.inner.lock().await;
            state.roster.upsert(&conversation);
        }
        self.emit(ClientEvent::RosterChanged);
        Ok(())
    }

    async fn require_admin(&self, conversation_id: ConversationId, action: &'static str) -> Result<()> {
        let state = self.inner.lock().await;
        let entry = state
            .roster
            .get(conversation_id)
            .ok_or(ChatError::UnknownConversation(conversation_id))?;
        if entry.kind != ConversationKind::Group {
            return Err(ChatError::NotAGroup.into());
        }
        if entry.admin_id != Some(self.session.user_id) {
            return Err(ChatError::AdminRequired(action).into());
        }
        Ok(())
    }

    async fn forget_conversation(&self, conversation_id: ConversationId, local_only: bool) {
        let was_active = {
            let mut state = self.inner.lock().await;
            state.roster.remove(conversation_id);
            if local_only {
                state.locally_removed.insert(conversation_id);
            }
            let was_active = state
                .active
                .as_ref()
                .is_some_and(|active| active.conversation_id == conversation_id);
            if was_active {
                state.open_epoch += 1;
                state.active = None;
            }
            was_active
        };
        if was_active {
            self.socket.send(ClientCommand::Unsubscribe { conversation_id });
        }
        self.emit(ClientEvent::RosterChanged);
    }

    async fn handle_socket_event(self: &Arc<Self>, event: SocketEvent) {
        match event {
            SocketEvent::Connected => {
                // Re-subscription replay: the server forgets advisory
                // subscriptions across reconnects.
                if let Some(conversation_id) = self.active_conversation_id().await {
                    self.socket.send(ClientCommand::Subscribe { conversation_id });
                }
            }
            SocketEvent::Closed => {
                warn!("live channel closed; reconnecting with backoff");
                self.emit(ClientEvent::Notice("connection lost, reconnecting".into()));
            }
            SocketEvent::Event(event) => self.apply_server_event(event).await,
        }
    }

    /// Applies one server event to the latest state snapshot. Events for a
    /// single conversation arrive and are applied in channel order.
    async fn apply_server_event(self: &Arc<Self>, event: ServerEvent) {
        match event {
            ServerEvent::MessageNew { message } => self.on_message_new(message).await,
            ServerEvent::MessageEdited {
                conversation_id,
                message,
            } => self.on_message_edited(conversation_id, message).await,
            ServerEvent::MessageDeleted {
                conversation_id,
                message_id,
                last_message,
            } => {
                self.on_message_deleted(conversation_id, message_id, last_message)
                    .await
            }
            ServerEvent::MessageRead {
                conversation_id,
                reader_id,
                up_to_message_id,
            } => {
                self.on_message_read(conversation_id, reader_id, up_to_message_id)
                    .await
            }
            ServerEvent::MessageDelivered {
                conversation_id,
                message_id,
                recipient_id,
            } => {
                self.on_message_delivered(conversation_id, Some(message_id), recipient_id)
                    .await
            }
            ServerEvent::MessageDeliveredBulk {
                conversation_id,
                recipient_id,
            } => {
                self.on_message_delivered(conversation_id, None, recipient_id)
                    .await
            }
            ServerEvent::SendAck {
                ok,
                temp_id,
                message,
                error,
            } => self.on_send_ack(ok, temp_id, message, error).await,
            ServerEvent::ConversationCreated { conversation }
            | ServerEvent::ConversationUpdated { conversation } => {
                self.on_conversation_upserted(conversation).await
            }
            ServerEvent::ConversationDeleted { conversation_id } => {
                self.forget_conversation(conversation_id, false).await;
                self.emit(ClientEvent::Notice("a conversation was deleted".into()));
            }
            ServerEvent::Error(api_error) => {
                warn!(code = ?api_error.code, "server reported an error: {}", api_error.message);
                self.emit(ClientEvent::Notice(api_error.message));
            }
        }
    }

    async fn on_message_new(self: &Arc<Self>, message: MessagePayload) {
        let conversation_id = message.conversation_id;
        let own = message.sender_id == self.session.user_id;

        let (known, for_active, scroll, unseen) = {
            let mut state = self.inner.lock().await;
            let known = state.roster.apply_preview(&message);

            let mut for_active = false;
            let mut scroll = false;
            let mut at_bottom = false;
            if let Some(active) = state.active.as_mut() {
                if active.conversation_id == conversation_id {
                    for_active = true;
                    at_bottom = active.at_bottom;
                    active.upsert(&message);
                }
            }
            // Own echoes for a background conversation change the preview but
            // never the unseen counter.
            let mut unseen = None;
            if for_active && (own || at_bottom) {
                scroll = true;
            } else if for_active || !own {
                if let Some(count) = state.roster.bump_unseen(conversation_id) {
                    unseen = Some((count, state.roster.total_unread()));
                }
            }
            (known, for_active, scroll, unseen)
        };

        if known {
            self.emit(ClientEvent::RosterChanged);
        } else {
            // A message for a conversation the roster has never seen; pull a
            // fresh listing in the background.
            debug!(
                conversation_id = conversation_id.0,
                "message for unknown conversation; refreshing roster"
            );
            let client = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(err) = client.refresh_roster().await {
                    warn!("roster refresh after unknown conversation failed: {err}");
                }
            });
        }
        if for_active {
            self.emit(ClientEvent::MessagesChanged { conversation_id });
        }
        if scroll {
            self.emit(ClientEvent::ScrollToBottom { conversation_id });
        }
        if let Some((unseen, total_unread)) = unseen {
            self.emit(ClientEvent::UnseenChanged {
                conversation_id,
                unseen,
                total_unread,
            });
        }
    }

    async fn on_message_edited(&self, conversation_id: ConversationId, message: MessagePayload) {
        let (changed_active, changed_preview) = {
            let mut state = self.inner.lock().await;
            let changed_preview = state.roster.apply_edited(conversation_id, &message);
            let changed_active = match state.active.as_mut() {
                Some(active) if active.conversation_id == conversation_id => {
                    match active.find_confirmed_mut(message.message_id) {
                        Some(record) => {
                            record.merge_payload(&message);
                            true
                        }
                        None => false,
                    }
                }
                _ => false,
            };
            (changed_active, changed_preview)
        };

        if changed_active {
            self.emit(ClientEvent::MessagesChanged { conversation_id });
        }
        if changed_preview {
            self.emit(ClientEvent::RosterChanged);
        }
    }

    async fn on_message_deleted(
        &self,
        conversation_id: ConversationId,
        message_id: MessageId,
        last_message: Option<MessagePayload>,
    ) {
        let (changed_active, changed_preview) = {
            let mut state = self.inner.lock().await;
            let changed_preview =
                state
                    .roster
                    .apply_deleted(conversation_id, message_id, last_message.as_ref());
            let changed_active = match state.active.as_mut() {
                Some(active) if active.conversation_id == conversation_id => {
                    match active.find_confirmed_mut(message_id) {
                        Some(record) => {
                            record.deleted = true;
                            record.content.clear();
                            record.voice_note_url = None;
                            true
                        }
                        None => false,
                    }
                }
                _ => false,
            };
            (changed_active, changed_preview)
        };

        if changed_active {
            self.emit(ClientEvent::MessagesChanged { conversation_id });
        }
        if changed_preview {
            self.emit(ClientEvent::RosterChanged);
        }
    }

    /// Watermark semantics: every message authored by someone other than the
    /// reader, with a server id at or below the watermark, gains the reader
    /// in its read-by set.
    async fn on_message_read(
        &self,
        conversation_id: ConversationId,
        reader_id: UserId,
        up_to_message_id: MessageId,
    ) {
        let changed = {
            let mut state = self.inner.lock().await;
            match state.active.as_mut() {
                Some(active) if active.conversation_id == conversation_id => {
                    let mut changed = false;
                    for record in &mut active.messages {
                        let Some(message_id) = record.server_id() else {
                            continue;
                        };
                        if record.sender_id != reader_id && message_id <= up_to_message_id {
                            changed |= record.read_by.insert(reader_id);
                        }
                    }
                    changed
                }
                _ => false,
            }
        };
        if changed {
            self.emit(ClientEvent::MessagesChanged { conversation_id });
        }
    }

    /// Per-message and bulk delivery receipts share one path; `message_id`
    /// None means "everything in this conversation reached the recipient".
    async fn on_message_delivered(
        &self,
        conversation_id: ConversationId,
        message_id: Option<MessageId>,
        recipient_id: UserId,
    ) {
        let changed = {
            let mut state = self.inner.lock().await;
            match state.active.as_mut() {
                Some(active) if active.conversation_id == conversation_id => {
                    let mut changed = false;
                    for record in &mut active.messages {
                        if record.is_pending() || record.sender_id == recipient_id {
                            continue;
                        }
                        if message_id.is_none() || record.server_id() == message_id {
                            changed |= record.delivered_to.insert(recipient_id);
                        }
                    }
                    changed
                }
                _ => false,
            }
        };
        if changed {
            self.emit(ClientEvent::MessagesChanged { conversation_id });
        }
    }

    async fn on_send_ack(
        &self,
        ok: bool,
        temp_id: TempId,
        message: Option<MessagePayload>,
        error: Option<String>,
    ) {
        if ok {
            let Some(message) = message else {
                warn!("success ack without a message payload; ignoring");
                return;
            };
            let conversation_id = message.conversation_id;
            let (reconciled, scroll) = {
                let mut state = self.inner.lock().await;
                state.roster.apply_preview(&message);
                match state.active.as_mut() {
                    Some(active) if active.conversation_id == conversation_id => {
                        match active.position_of_temp(&temp_id) {
                            Some(position) => {
                                if active.contains_server_id(message.message_id) {
                                    // The echo beat the ack; the confirmed
                                    // record already exists, drop the pending
                                    // one instead of duplicating.
                                    active.messages.remove(position);
                                } else {
                                    // Replace in place to avoid visual jumps.
                                    active.messages[position] =
                                        MessageRecord::from_payload(&message);
                                }
                                (true, active.at_bottom)
                            }
                            None => {
                                debug!("ack for unknown temp id; ignoring");
                                (false, false)
                            }
                        }
                    }
                    _ => (false, false),
                }
            };
            self.emit(ClientEvent::RosterChanged);
            if reconciled {
                self.emit(ClientEvent::MessagesChanged { conversation_id });
                if scroll {
                    self.emit(ClientEvent::ScrollToBottom { conversation_id });
                }
            }
        } else {
            let removed_from = {
                let mut state = self.inner.lock().await;
                match state.active.as_mut() {
                    Some(active) => match active.position_of_temp(&temp_id) {
                        Some(position) => {
                            active.messages.remove(position);
                            Some(active.conversation_id)
                        }
                        None => None,
                    },
                    None => None,
                }
            };
            // The typed content is not restored into the composer; the
            // failure notification carries the reason instead.
            self.emit(ClientEvent::SendFailed {
                temp_id,
                reason: error.unwrap_or_else(|| "message send failed".into()),
            });
            if let Some(conversation_id) = removed_from {
                self.emit(ClientEvent::MessagesChanged { conversation_id });
            }
        }
    }

    async fn on_conversation_upserted(&self, conversation: ConversationSummary) {
        let conversation_id = conversation.conversation_id;
        let for_active = {
            let mut state = self.inner.lock().await;
            state.locally_removed.remove(&conversation_id);
            state.roster.upsert(&conversation);
            state
                .active
                .as_ref()
                .is_some_and(|active| active.conversation_id == conversation_id)
        };
        self.emit(ClientEvent::RosterChanged);
        if for_active {
            // Membership affects receipt aggregation for the open thread.
            self.emit(ClientEvent::MessagesChanged { conversation_id });
        }
    }

    pub fn shutdown(&self) {
        self.socket.shutdown();
    }
}

/// Directory of display names gathered from message traffic, for rendering
/// senders who are no longer participants.
pub fn sender_directory(messages: &[MessageRecord]) -> HashMap<UserId, String> {
    let mut directory = HashMap::new();
    for record in messages {
        if let Some(name) = &record.sender_name {
            directory.insert(record.sender_id, name.clone());
        }
    }
    directory
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
