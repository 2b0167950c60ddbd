use chrono::{DateTime, Utc};
use uuid::Uuid;

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{AttachmentPayload, MessagePayload},
};

/// Collapse window for a reliable-send response racing the server's
/// broadcast echo of the same message. This is a documented workaround for
/// the backend not round-tripping a client-generated message id; if sends
/// become idempotent server-side, the content+window clause should be
/// deleted, not kept.
pub(crate) const DEDUP_WINDOW_MS: i64 = 1500;

/// One entry of a conversation's message list. `id` is authoritative once
/// present; until the server acks, an optimistic entry carries only the
/// `client_token` correlation token.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub id: Option<MessageId>,
    pub client_token: Option<Uuid>,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    pub sender_name: Option<String>,
    pub body: Option<String>,
    pub attachment: Option<AttachmentPayload>,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
}

impl From<MessagePayload> for ChatMessage {
    fn from(payload: MessagePayload) -> Self {
        Self {
            id: Some(payload.message_id),
            client_token: None,
            conversation_id: payload.conversation_id,
            sender_id: payload.sender_id,
            sender_name: payload.sender_name,
            body: payload.body,
            attachment: payload.attachment,
            sent_at: payload.sent_at,
            read: payload.read,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    Inserted,
    Promoted,
    Unchanged,
}

/// The single owner of the active conversation's ordered, duplicate-free
/// message list. Every mutation goes through here.
#[derive(Debug, Default)]
pub struct MessageLog {
    conversation: Option<ConversationId>,
    messages: Vec<ChatMessage>,
    generation: u64,
}

impl MessageLog {
    pub fn conversation(&self) -> Option<ConversationId> {
        self.conversation
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    /// Starts a history load for a conversation switch. Returns a token that
    /// must accompany the matching [`complete_load`](Self::complete_load);
    /// only the newest load wins. Switching to a different conversation
    /// clears the list immediately so the old conversation's messages never
    /// bleed through; reloading the same conversation keeps the current
    /// list until the fetch succeeds.
    pub fn begin_load(&mut self, conversation_id: ConversationId) -> u64 {
        self.generation += 1;
        if self.conversation != Some(conversation_id) {
            self.messages.clear();
            self.conversation = Some(conversation_id);
        }
        self.generation
    }

    /// Replaces the list wholesale. A stale token (another switch happened
    /// since) or a failed fetch leaves the current list untouched.
    pub fn complete_load(&mut self, token: u64, payloads: Vec<MessagePayload>) -> bool {
        if token != self.generation {
            return false;
        }
        let mut messages: Vec<ChatMessage> = payloads.into_iter().map(ChatMessage::from).collect();
        messages.sort_by_key(|m| m.sent_at);
        self.messages = messages;
        true
    }

    /// Appends an optimistic local entry awaiting its server ack.
    pub fn insert_pending(&mut self, message: ChatMessage) {
        if self.conversation != Some(message.conversation_id) {
            return;
        }
        self.insert_sorted(message);
    }

    pub fn remove_pending(&mut self, token: Uuid) -> Option<ChatMessage> {
        let position = self
            .messages
            .iter()
            .position(|m| m.client_token == Some(token))?;
        Some(self.messages.remove(position))
    }

    /// Merges a server-sourced message using the dedup rule: identical ids,
    /// or same sender/body/attachment within the echo window. A duplicate
    /// with an id promotes the existing entry in place rather than adding a
    /// second one.
    pub fn merge(&mut self, candidate: ChatMessage) -> MergeOutcome {
        if self.conversation != Some(candidate.conversation_id) {
            return MergeOutcome::Unchanged;
        }
        match self
            .messages
            .iter()
            .position(|existing| is_duplicate(existing, &candidate))
        {
            Some(position) => {
                let mut existing = self.messages.remove(position);
                let promoted = candidate.id.is_some() && existing.id.is_none();
                if candidate.id.is_some() {
                    existing.id = candidate.id;
                    existing.sent_at = candidate.sent_at;
                    existing.client_token = None;
                }
                existing.read |= candidate.read;
                if existing.sender_name.is_none() {
                    existing.sender_name = candidate.sender_name;
                }
                self.insert_sorted(existing);
                if promoted {
                    MergeOutcome::Promoted
                } else {
                    MergeOutcome::Unchanged
                }
            }
            None => {
                self.insert_sorted(candidate);
                MergeOutcome::Inserted
            }
        }
    }

    /// Local mark-as-read: flips the flag on everything the counterpart
    /// sent. Returns whether anything changed.
    pub fn mark_read_locally(&mut self, local_user: UserId) -> bool {
        let mut changed = false;
        for message in &mut self.messages {
            if message.sender_id != local_user && !message.read {
                message.read = true;
                changed = true;
            }
        }
        changed
    }

    /// Remote `message_read`: the mirror update for messages the local user
    /// authored.
    pub fn apply_remote_read(&mut self, local_user: UserId) -> bool {
        let mut changed = false;
        for message in &mut self.messages {
            if message.sender_id == local_user && !message.read {
                message.read = true;
                changed = true;
            }
        }
        changed
    }

    fn insert_sorted(&mut self, message: ChatMessage) {
        let at = self
            .messages
            .partition_point(|m| m.sent_at <= message.sent_at);
        self.messages.insert(at, message);
    }
}

fn is_duplicate(existing: &ChatMessage, candidate: &ChatMessage) -> bool {
    if let (Some(a), Some(b)) = (existing.id, candidate.id) {
        // both ids known: equality alone decides, so repeated identical
        // texts stay distinct messages
        return a == b;
    }
    existing.sender_id == candidate.sender_id
        && existing.body == candidate.body
        && attachment_url(existing) == attachment_url(candidate)
        && (existing.sent_at - candidate.sent_at)
            .num_milliseconds()
            .abs()
            <= DEDUP_WINDOW_MS
}

fn attachment_url(message: &ChatMessage) -> Option<&str> {
    message.attachment.as_ref().map(|a| a.url.as_str())
}

#[cfg(test)]
#[path = "tests/messages_tests.rs"]
mod tests;
