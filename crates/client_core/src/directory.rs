use shared::{
    domain::{ConversationId, UserId},
    protocol::{ConversationSummary, MessagePayload},
};

/// Conversation list with summary state, kept in server order. Exactly one
/// conversation is active at a time; selection changes drive scope joins,
/// read marks and history loads in the engine.
#[derive(Debug, Default)]
pub struct ConversationDirectory {
    conversations: Vec<ConversationSummary>,
    active: Option<ConversationId>,
}

impl ConversationDirectory {
    pub fn replace_all(&mut self, conversations: Vec<ConversationSummary>) {
        self.conversations = conversations;
    }

    pub fn summaries(&self) -> Vec<ConversationSummary> {
        self.conversations.clone()
    }

    pub fn active(&self) -> Option<ConversationId> {
        self.active
    }

    /// Switches the active conversation and returns the previous one so the
    /// caller can leave its transport scope.
    pub fn set_active(&mut self, conversation: Option<ConversationId>) -> Option<ConversationId> {
        std::mem::replace(&mut self.active, conversation)
    }

    pub fn clear_unread(&mut self, conversation_id: ConversationId) {
        if let Some(entry) = self.find_mut(conversation_id) {
            entry.unread_count = 0;
        }
    }

    /// Applies a `new_message` patch to the owning conversation's summary.
    /// Unread grows only for counterpart messages in a conversation that is
    /// not currently active.
    pub fn note_incoming(&mut self, message: &MessagePayload, local_user: UserId) -> bool {
        let active = self.active;
        let Some(entry) = self.find_mut(message.conversation_id) else {
            return false;
        };
        entry.last_message = Some(summary_line(message));
        entry.last_activity = Some(message.sent_at);
        if message.sender_id != local_user && active != Some(message.conversation_id) {
            entry.unread_count += 1;
        }
        true
    }

    fn find_mut(&mut self, conversation_id: ConversationId) -> Option<&mut ConversationSummary> {
        self.conversations
            .iter_mut()
            .find(|c| c.conversation_id == conversation_id)
    }
}

fn summary_line(message: &MessagePayload) -> String {
    if let Some(body) = message.body.as_deref() {
        if !body.is_empty() {
            return body.to_string();
        }
    }
    match &message.attachment {
        Some(attachment) => attachment.filename.clone(),
        None => String::new(),
    }
}

#[cfg(test)]
#[path = "tests/directory_tests.rs"]
mod tests;
