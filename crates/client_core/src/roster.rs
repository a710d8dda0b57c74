use std::collections::HashMap;

use chrono::{DateTime, Utc};
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, ParticipantSummary, UserId},
    protocol::{ConversationSummary, MessagePayload},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KindFilter {
    #[default]
    All,
    Direct,
    Group,
}

/// Pure projection parameters for the visible conversation list. The
/// projection is recomputed from the full roster on every query instead of
/// being patched incrementally.
#[derive(Debug, Clone, Default)]
pub struct RosterFilter {
    pub kind: KindFilter,
    pub archived: bool,
    pub query: String,
}

/// Denormalized cache of a conversation's newest message.
#[derive(Debug, Clone, PartialEq)]
pub struct MessagePreview {
    pub message_id: MessageId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub content: String,
    pub has_voice_note: bool,
    pub deleted: bool,
    pub sent_at: DateTime<Utc>,
}

impl From<&MessagePayload> for MessagePreview {
    fn from(message: &MessagePayload) -> Self {
        Self {
            message_id: message.message_id,
            sender_id: message.sender_id,
            sender_name: message.sender_name.clone(),
            content: if message.is_deleted {
                String::new()
            } else {
                message.content.clone()
            },
            has_voice_note: !message.is_deleted && message.voice_note_url.is_some(),
            deleted: message.is_deleted,
            sent_at: message.created_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RosterEntry {
    pub conversation_id: ConversationId,
    pub kind: ConversationKind,
    pub name: Option<String>,
    pub participants: Vec<ParticipantSummary>,
    pub admin_id: Option<UserId>,
    pub pinned: bool,
    pub archived: bool,
    pub last_message: Option<MessagePreview>,
    pub created_at: DateTime<Utc>,
    /// Messages that arrived while the conversation was not being looked at.
    /// Local state, never sent on the wire.
    pub unseen: u32,
}

impl RosterEntry {
    pub fn from_summary(summary: &ConversationSummary) -> Self {
        Self {
            conversation_id: summary.conversation_id,
            kind: summary.kind,
            name: summary.name.clone(),
            participants: summary.participants.clone(),
            admin_id: summary.admin_id,
            pinned: summary.pinned,
            archived: summary.archived,
            last_message: summary.last_message.as_ref().map(MessagePreview::from),
            created_at: summary.created_at,
            unseen: 0,
        }
    }

    fn merge_summary(&mut self, summary: &ConversationSummary) {
        self.kind = summary.kind;
        self.name = summary.name.clone();
        self.participants = summary.participants.clone();
        self.admin_id = summary.admin_id;
        self.pinned = summary.pinned;
        self.archived = summary.archived;
        self.created_at = summary.created_at;
        if let Some(message) = &summary.last_message {
            self.apply_preview_payload(message);
        }
    }

    fn apply_preview_payload(&mut self, message: &MessagePayload) -> bool {
        let newer = match &self.last_message {
            Some(preview) => message.message_id >= preview.message_id,
            None => true,
        };
        if newer {
            self.last_message = Some(MessagePreview::from(message));
        }
        newer
    }

    /// Most recent activity, used for ordering. Conversations with no
    /// messages fall back to their creation time.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message
            .as_ref()
            .map(|preview| preview.sent_at)
            .unwrap_or(self.created_at)
    }

    /// Group name for groups, the counterpart's display name for directs.
    pub fn title(&self, viewer: UserId) -> String {
        match self.kind {
            ConversationKind::Group => self.name.clone().unwrap_or_else(|| "Group".into()),
            ConversationKind::Direct => self
                .participants
                .iter()
                .find(|p| p.user_id != viewer)
                .map(|p| p.display_name.clone())
                .unwrap_or_else(|| "Direct chat".into()),
        }
    }

    fn matches(&self, filter: &RosterFilter) -> bool {
        match filter.kind {
            KindFilter::All => {}
            KindFilter::Direct => {
                if self.kind != ConversationKind::Direct {
                    return false;
                }
            }
            KindFilter::Group => {
                if self.kind != ConversationKind::Group {
                    return false;
                }
            }
        }
        if self.archived != filter.archived {
            return false;
        }

        let query = filter.query.trim().to_lowercase();
        if query.is_empty() {
            return true;
        }
        if let Some(name) = &self.name {
            if name.to_lowercase().contains(&query) {
                return true;
            }
        }
        if self
            .participants
            .iter()
            .any(|p| p.display_name.to_lowercase().contains(&query))
        {
            return true;
        }
        if let Some(preview) = &self.last_message {
            if !preview.deleted && preview.content.to_lowercase().contains(&query) {
                return true;
            }
        }
        false
    }
}

/// The conversation list visible to the user, keyed by conversation id.
/// Ordering and filtering are derived on demand, never stored.
#[derive(Debug, Default)]
pub struct Roster {
    entries: HashMap<ConversationId, RosterEntry>,
}

impl Roster {
    pub fn contains(&self, conversation_id: ConversationId) -> bool {
        self.entries.contains_key(&conversation_id)
    }

    pub fn get(&self, conversation_id: ConversationId) -> Option<&RosterEntry> {
        self.entries.get(&conversation_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Inserts or merges a server summary, keeping the local unseen counter.
    pub fn upsert(&mut self, summary: &ConversationSummary) {
        match self.entries.get_mut(&summary.conversation_id) {
            Some(entry) => entry.merge_summary(summary),
            None => {
                self.entries
                    .insert(summary.conversation_id, RosterEntry::from_summary(summary));
            }
        }
    }

    /// Replaces the roster with a fresh server listing, carrying local unseen
    /// counters over for conversations present in both. Entries missing from
    /// the listing are dropped; a conversation listed twice (e.g. on both the
    /// active and archived pages) is merged, not reset.
    pub fn replace_all(&mut self, summaries: &[ConversationSummary]) {
        let mut next: HashMap<ConversationId, RosterEntry> =
            HashMap::with_capacity(summaries.len());
        for summary in summaries {
            if let Some(entry) = next.get_mut(&summary.conversation_id) {
                entry.merge_summary(summary);
                continue;
            }
            let entry = match self.entries.remove(&summary.conversation_id) {
                Some(mut existing) => {
                    existing.merge_summary(summary);
                    existing
                }
                None => RosterEntry::from_summary(summary),
            };
            next.insert(summary.conversation_id, entry);
        }
        self.entries = next;
    }

    pub fn remove(&mut self, conversation_id: ConversationId) -> Option<RosterEntry> {
        self.entries.remove(&conversation_id)
    }

    /// Updates the preview cache for a newly arrived or acknowledged message.
    /// Returns false when the conversation is unknown to the roster.
    pub fn apply_preview(&mut self, message: &MessagePayload) -> bool {
        match self.entries.get_mut(&message.conversation_id) {
            Some(entry) => {
                entry.apply_preview_payload(message);
                true
            }
            None => false,
        }
    }

    /// An edit only touches the preview when the edited message is the one
    /// being previewed.
    pub fn apply_edited(&mut self, conversation_id: ConversationId, message: &MessagePayload) -> bool {
        let Some(entry) = self.entries.get_mut(&conversation_id) else {
            return false;
        };
        match &entry.last_message {
            Some(preview) if preview.message_id == message.message_id => {
                entry.last_message = Some(MessagePreview::from(message));
                true
            }
            _ => false,
        }
    }

    /// A deletion replaces the preview with the server-provided successor, or
    /// blanks it out when the deleted message was the one previewed.
    pub fn apply_deleted(
        &mut self,
        conversation_id: ConversationId,
        message_id: MessageId,
        last_message: Option<&MessagePayload>,
    ) -> bool {
        let Some(entry) = self.entries.get_mut(&conversation_id) else {
            return false;
        };
        let previewing_deleted = entry
            .last_message
            .as_ref()
            .is_some_and(|preview| preview.message_id == message_id);
        if !previewing_deleted {
            return false;
        }
        match last_message {
            Some(message) => entry.last_message = Some(MessagePreview::from(message)),
            None => {
                if let Some(preview) = entry.last_message.as_mut() {
                    preview.deleted = true;
                    preview.content.clear();
                    preview.has_voice_note = false;
                }
            }
        }
        true
    }

    /// Returns the new per-conversation count, or None when the conversation
    /// is unknown (the caller should refresh the roster).
    pub fn bump_unseen(&mut self, conversation_id: ConversationId) -> Option<u32> {
        let entry = self.entries.get_mut(&conversation_id)?;
        entry.unseen = entry.unseen.saturating_add(1);
        Some(entry.unseen)
    }

    pub fn clear_unseen(&mut self, conversation_id: ConversationId) -> bool {
        match self.entries.get_mut(&conversation_id) {
            Some(entry) if entry.unseen > 0 => {
                entry.unseen = 0;
                true
            }
            _ => false,
        }
    }

    pub fn total_unread(&self) -> u32 {
        self.entries.values().map(|entry| entry.unseen).sum()
    }

    pub fn set_pinned(&mut self, conversation_id: ConversationId, pinned: bool) -> bool {
        match self.entries.get_mut(&conversation_id) {
            Some(entry) => {
                entry.pinned = pinned;
                true
            }
            None => false,
        }
    }

    pub fn set_archived(&mut self, conversation_id: ConversationId, archived: bool) -> bool {
        match self.entries.get_mut(&conversation_id) {
            Some(entry) => {
                entry.archived = archived;
                true
            }
            None => false,
        }
    }

    /// The ordered, filtered projection: pinned conversations first, then by
    /// most recent activity, ties broken by conversation id for determinism.
    pub fn visible(&self, filter: &RosterFilter) -> Vec<RosterEntry> {
        let mut entries: Vec<RosterEntry> = self
            .entries
            .values()
            .filter(|entry| entry.matches(filter))
            .cloned()
            .collect();
        entries.sort_by(|a, b| {
            b.pinned
                .cmp(&a.pinned)
                .then_with(|| b.last_activity().cmp(&a.last_activity()))
                .then_with(|| a.conversation_id.cmp(&b.conversation_id))
        });
        entries
    }
}
