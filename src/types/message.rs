use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Video,
    File,
    Audio,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: AttachmentKind,
    pub uri: String,
    pub filename: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReactionKind {
    Like,
    Love,
    Haha,
    Sad,
    Angry,
}

impl ReactionKind {
    /// Wire name, as used in reaction resource paths.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReactionKind::Like => "like",
            ReactionKind::Love => "love",
            ReactionKind::Haha => "haha",
            ReactionKind::Sad => "sad",
            ReactionKind::Angry => "angry",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reaction {
    pub emoji: ReactionKind,
    pub count: u32,
    /// Public keys of the reactors, when the server discloses them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactors: Option<Vec<String>>,
}

/// A read receipt: reader identity and when they read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Seen {
    pub by: String,
    pub at: i64,
}

/// A single chat message, in the server's wire shape. Optional fields are
/// omitted on the wire when unset, never serialized as null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    /// May be empty when an attachment or voice payload carries the content.
    pub content: String,
    #[serde(default)]
    pub edited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seen: Option<Vec<Seen>>,
    /// Author's public key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    /// Id of the chat this message belongs to.
    pub ctx: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<Attachment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mentions: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reactions: Option<Vec<Reaction>>,
    /// Creation timestamp, milliseconds since the epoch.
    pub created: i64,
}

impl Message {
    /// Builds a plain text message timestamped now, ready to send.
    pub fn text(id: impl Into<String>, ctx: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            content: content.into(),
            edited: false,
            seen: None,
            author: None,
            ctx: ctx.into(),
            attachments: None,
            mentions: None,
            reactions: None,
            created: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted_when_unset() {
        let msg = Message::text("m1", "c1", "hi");
        let json = serde_json::to_value(&msg).unwrap();
        let obj = json.as_object().unwrap();
        assert!(!obj.contains_key("seen"));
        assert!(!obj.contains_key("author"));
        assert!(!obj.contains_key("attachments"));
        assert!(!obj.contains_key("reactions"));
        assert_eq!(obj["ctx"], "c1");
    }

    #[test]
    fn attachment_kind_uses_type_field() {
        let att = Attachment {
            kind: AttachmentKind::Audio,
            uri: "carbon://blob/1".into(),
            filename: "note.ogg".into(),
        };
        let json = serde_json::to_value(&att).unwrap();
        assert_eq!(json["type"], "audio");
    }

    #[test]
    fn reaction_kind_round_trips_lowercase() {
        let r: Reaction = serde_json::from_str(r#"{"emoji":"haha","count":3}"#).unwrap();
        assert_eq!(r.emoji, ReactionKind::Haha);
        assert_eq!(r.reactors, None);
        assert_eq!(r.emoji.as_str(), "haha");
    }
}
