use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domain::{
    ConversationId, ConversationKind, MessageId, MessageKind, PresenceStatus, UserId,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message_sender_username: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at_formatted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Participant {
    #[serde(alias = "user_id")]
    pub id: UserId,
    pub username: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationDetails {
    pub id: ConversationId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl ConversationDetails {
    pub fn title(&self) -> String {
        match self.kind {
            ConversationKind::Notes => "Notes".to_string(),
            ConversationKind::Files => "Files".to_string(),
            ConversationKind::Direct | ConversationKind::Group => self
                .name
                .clone()
                .filter(|name| !name.trim().is_empty())
                .unwrap_or_else(|| "Direct chat".to_string()),
        }
    }

    pub fn subtitle(&self) -> String {
        if !self.participants.is_empty() {
            let names: Vec<&str> = self
                .participants
                .iter()
                .map(|participant| participant.username.as_str())
                .collect();
            return format!("Participants: {}", names.join(", "));
        }
        if let Some(description) = &self.description {
            return description.clone();
        }
        match self.kind {
            ConversationKind::Notes => "Your saved notes".to_string(),
            ConversationKind::Files => "Your saved files".to_string(),
            ConversationKind::Direct | ConversationKind::Group => "No description".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagePayload {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_username: Option<String>,
    pub message_type: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_size_formatted: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note_color: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at_formatted: Option<String>,
}

impl MessagePayload {
    /// One-line preview used for notifications.
    pub fn preview(&self) -> String {
        let sender = self.sender_username.as_deref().unwrap_or("someone");
        let body = match self.message_type {
            MessageKind::Text => self.content.clone(),
            MessageKind::Note => self.note_title.clone(),
            MessageKind::File | MessageKind::Image | MessageKind::Voice => self.file_name.clone(),
        }
        .unwrap_or_else(|| "File or note".to_string());
        format!("{sender}: {body}")
    }
}

/// Accepts RFC 3339 as well as the naive `YYYY-MM-DD HH:MM:SS` form SQL
/// backends emit (read as UTC). Anything else becomes `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| Utc.from_utc_datetime(&naive))
}

// A bad timestamp must never cost us the whole message.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(raw.as_ref().and_then(Value::as_str).and_then(parse_timestamp))
}

/// Envelopes the client sends over the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    JoinConversation {
        conversation_id: ConversationId,
    },
    LeaveConversation {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conversation_id: Option<ConversationId>,
    },
    Typing {
        conversation_id: ConversationId,
        is_typing: bool,
    },
    Ping,
}

impl ClientEnvelope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::JoinConversation { .. } => "join_conversation",
            Self::LeaveConversation { .. } => "leave_conversation",
            Self::Typing { .. } => "typing",
            Self::Ping => "ping",
        }
    }
}

/// Envelopes the server pushes. Kinds this client does not know decode to
/// `Unknown`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    Connected {
        #[serde(default)]
        user_id: Option<UserId>,
        #[serde(default)]
        username: Option<String>,
    },
    NewMessage {
        conversation_id: ConversationId,
        message: MessagePayload,
    },
    UserStatus {
        user_id: UserId,
        #[serde(default)]
        username: Option<String>,
        status: PresenceStatus,
    },
    Typing {
        conversation_id: ConversationId,
        #[serde(default)]
        user_id: Option<UserId>,
        username: String,
        is_typing: bool,
    },
    Pong,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct NewMessagesQuery {
    pub last_message_id: MessageId,
}
