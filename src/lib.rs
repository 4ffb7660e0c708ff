//! Client-side synchronization core for the Carbon chat service.
//!
//! The crate keeps an in-memory mirror of chats and messages consistent with
//! the remote server across two channels: authenticated REST mutations
//! ([`api::ApiClient`]) and a server-push event stream
//! ([`stream::EventStream`]). The [`sync::SyncEngine`] orchestrates both and
//! is the only writer to the [`cache::CacheStore`]; the UI layer reads the
//! cache and subscribes to its change bus.

pub mod api;
pub mod auth;
pub mod cache;
pub mod config;
pub mod error;
pub mod http;
pub mod stream;
pub mod sync;
pub mod types;

pub use api::ApiClient;
pub use auth::{Credentials, RequestSigner, StaticSigner};
pub use cache::CacheStore;
pub use config::ClientConfig;
pub use error::ClientError;
pub use stream::EventStream;
pub use sync::{SyncEngine, SyncState};
