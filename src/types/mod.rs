pub mod chat;
pub mod events;
pub mod message;

pub use chat::{Chat, MessageSummary};
pub use events::{CacheBus, MessageEvent};
pub use message::{Attachment, AttachmentKind, Message, Reaction, ReactionKind, Seen};
