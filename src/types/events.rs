use super::chat::Chat;
use super::message::Message;
use crate::error::ClientError;
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::broadcast;

// The size of the broadcast channel buffer.
const CHANNEL_CAPACITY: usize = 100;

/// Inbound push-channel event. A closed union: every frame the server sends
/// is one of these three, anything else is rejected at decode time.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageEvent {
    Created(Message),
    Updated(Message),
    Deleted(Message),
}

/// Wire envelope, decoded before the discriminant is inspected so an
/// unknown `type` can be told apart from an unparseable frame.
#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    message: Message,
}

impl MessageEvent {
    /// Decodes one push-channel frame.
    ///
    /// Returns `Malformed` when the JSON does not parse and
    /// `UnknownEventType` when it parses but carries a discriminant this
    /// client does not know. Both are dropped by the stream, not fatal.
    pub fn from_frame(frame: &str) -> Result<Self, ClientError> {
        let raw: RawEnvelope =
            serde_json::from_str(frame).map_err(|e| ClientError::Malformed(e.to_string()))?;
        match raw.kind.as_str() {
            "created" => Ok(MessageEvent::Created(raw.message)),
            "updated" => Ok(MessageEvent::Updated(raw.message)),
            "deleted" => Ok(MessageEvent::Deleted(raw.message)),
            other => Err(ClientError::UnknownEventType(other.to_string())),
        }
    }

    pub fn message(&self) -> &Message {
        match self {
            MessageEvent::Created(m) | MessageEvent::Updated(m) | MessageEvent::Deleted(m) => m,
        }
    }
}

// Macro to generate CacheBus fields and constructor
macro_rules! define_cache_bus {
    ($(($field:ident, $type:ty)),* $(,)?) => {
        /// Typed change-notification bus with a separate broadcast channel
        /// per change kind. The UI layer subscribes to the channels it
        /// renders from; a send with no receivers is not an error.
        #[derive(Debug)]
        pub struct CacheBus {
            $(
                pub $field: broadcast::Sender<$type>,
            )*
        }

        impl CacheBus {
            pub fn new() -> Self {
                Self {
                    $(
                        $field: broadcast::channel(CHANNEL_CAPACITY).0,
                    )*
                }
            }
        }
    };
}

define_cache_bus! {
    (chat_upserted, Arc<Chat>),
    (chat_removed, Arc<String>),
    (message_upserted, Arc<Message>),
    (message_removed, Arc<String>),
}

impl Default for CacheBus {
    fn default() -> Self {
        Self::new()
    }
}
