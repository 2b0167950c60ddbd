use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{AttachmentKind, ConversationId, MessageId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentPayload {
    pub url: String,
    pub filename: String,
    pub kind: AttachmentKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub message_id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentPayload>,
    pub sent_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterpartSummary {
    pub user_id: UserId,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub online: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub counterpart: CounterpartSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default)]
    pub unread_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Standard offer/answer description as exchanged over the signaling channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    pub kind: SdpKind,
    pub sdp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

/// One-way signals the client pushes over the socket. Message *sending* is
/// not here: it goes through the reliable HTTP request so transport flakiness
/// cannot silently drop it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ClientSignal {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        conversation_id: ConversationId,
    },
    MarkAsRead {
        conversation_id: ConversationId,
    },
    UserTyping {
        conversation_id: ConversationId,
        display_name: String,
    },
    UserStoppedTyping {
        conversation_id: ConversationId,
    },
    VoiceCallOffer {
        conversation_id: ConversationId,
        description: SessionDescription,
    },
    VoiceCallAnswer {
        conversation_id: ConversationId,
        description: SessionDescription,
    },
    VoiceCallIceCandidate {
        conversation_id: ConversationId,
        candidate: IceCandidate,
    },
    VoiceCallEnd {
        conversation_id: ConversationId,
    },
}

/// Events the server pushes down the same socket, scoped by conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerSignal {
    NewMessage {
        message: MessagePayload,
    },
    UserTyping {
        conversation_id: ConversationId,
        user_id: UserId,
        display_name: String,
    },
    UserStoppedTyping {
        conversation_id: ConversationId,
        user_id: UserId,
    },
    MessageRead {
        conversation_id: ConversationId,
        reader_id: UserId,
    },
    VoiceCallOffer {
        conversation_id: ConversationId,
        caller_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        caller_name: Option<String>,
        description: SessionDescription,
    },
    VoiceCallAnswer {
        conversation_id: ConversationId,
        description: SessionDescription,
    },
    VoiceCallIceCandidate {
        conversation_id: ConversationId,
        candidate: IceCandidate,
    },
    VoiceCallEnd {
        conversation_id: ConversationId,
    },
}
