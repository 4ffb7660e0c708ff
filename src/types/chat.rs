use serde::{Deserialize, Serialize};

/// Abbreviated message carried on a chat as its `lastMessage` preview.
/// Every field is optional; the server sends whatever subset it has.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created: Option<i64>,
}

/// A chat, in the server's wire shape.
///
/// Invariants maintained by the server and preserved here: `admins` is a
/// subset of `members`, and `pins` only references message ids that exist
/// (or existed) in this chat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub name: String,
    pub logo: String,
    pub description: String,
    pub admins: Vec<String>,
    pub members: Vec<String>,
    pub pins: Vec<String>,
    pub private: bool,
    pub broadcast: bool,
    /// Opaque symmetric key material. The wire name keeps the server's
    /// historical spelling.
    #[serde(rename = "symetric_keys")]
    pub symmetric_keys: Vec<String>,
    /// Creation timestamp, milliseconds since the epoch.
    pub created: i64,
    #[serde(
        rename = "lastMessage",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub last_message: Option<MessageSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unread: Option<u32>,
}

impl Chat {
    pub fn is_member(&self, user: &str) -> bool {
        self.members.iter().any(|m| m == user)
    }

    pub fn is_admin(&self, user: &str) -> bool {
        self.admins.iter().any(|a| a == user)
    }
}
