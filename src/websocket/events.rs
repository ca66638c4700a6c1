//! Room event schema at the transport boundary.
//!
//! The broadcast core treats payloads as opaque JSON; this enum is the
//! boundary's contract for what clients may send and what collaborators
//! (room mutation logic, AI responders, system notices) publish. Every
//! event carries a `type` tag and round-trips through JSON unchanged.

use serde::{Deserialize, Serialize};

/// One attachment on an AI response, e.g. a recommended business card.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RoomEvent {
    /// Ordinary chat message from a user.
    Text {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
    },

    /// Server-generated notice ("Alice joined the room").
    System { content: String },

    /// Typing indicator.
    Typing {
        user_id: String,
        #[serde(default = "default_true")]
        is_typing: bool,
    },

    /// AI assistant response, optionally with recommendation attachments.
    AiResponse {
        content: String,
        sender_id: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        attachments: Vec<Attachment>,
    },
}

fn default_true() -> bool {
    true
}

impl RoomEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::System { .. } => "system",
            Self::Typing { .. } => "typing",
            Self::AiResponse { .. } => "ai_response",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_event_round_trips_exactly() {
        let wire = json!({"type": "text", "content": "hi"});
        let event: RoomEvent = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(event.event_type(), "text");
        assert_eq!(serde_json::to_value(&event).unwrap(), wire);
    }

    #[test]
    fn text_event_keeps_sender() {
        let wire = json!({"type": "text", "content": "hi", "sender_id": "u1"});
        let event: RoomEvent = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(serde_json::to_value(&event).unwrap(), wire);
    }

    #[test]
    fn typing_defaults_to_started() {
        let event: RoomEvent =
            serde_json::from_value(json!({"type": "typing", "user_id": "u1"})).unwrap();
        assert_eq!(
            event,
            RoomEvent::Typing {
                user_id: "u1".into(),
                is_typing: true
            }
        );
    }

    #[test]
    fn ai_response_carries_attachments() {
        let wire = json!({
            "type": "ai_response",
            "content": "Try these spots",
            "sender_id": "ai",
            "attachments": [{"title": "Noodle Bar", "url": "https://example.com/noodle"}]
        });
        let event: RoomEvent = serde_json::from_value(wire.clone()).unwrap();
        assert_eq!(serde_json::to_value(&event).unwrap(), wire);
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = serde_json::from_value::<RoomEvent>(json!({"type": "exec", "cmd": "rm"}));
        assert!(err.is_err());
    }
}
