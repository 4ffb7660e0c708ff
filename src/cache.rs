//! The canonical local snapshot of chats and messages.
//!
//! All UI reads and all SyncEngine writes pass through here. Both
//! collections are insertion-ordered so replacing a record in place keeps
//! its display position. Writes are serialized behind the locks; reads hand
//! out cloned snapshots.

use crate::error::ClientError;
use crate::types::{CacheBus, Chat, Message};
use indexmap::IndexMap;
use log::debug;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct CacheStore {
    chats: RwLock<IndexMap<String, Chat>>,
    messages: RwLock<IndexMap<String, Message>>,
    bus: CacheBus,
}

impl Default for CacheStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CacheStore {
    pub fn new() -> Self {
        Self {
            chats: RwLock::new(IndexMap::new()),
            messages: RwLock::new(IndexMap::new()),
            bus: CacheBus::new(),
        }
    }

    /// Change-notification channels the UI layer subscribes to.
    pub fn bus(&self) -> &CacheBus {
        &self.bus
    }

    /// Inserts or replaces by id. Replacement keeps the chat's position.
    pub async fn upsert_chat(&self, chat: Chat) {
        let notify = Arc::new(chat.clone());
        self.chats.write().await.insert(chat.id.clone(), chat);
        let _ = self.bus.chat_upserted.send(notify);
    }

    /// Removes the chat and, as explicit policy, every message whose `ctx`
    /// points at it. No-op when the chat is not cached.
    pub async fn remove_chat(&self, id: &str) {
        let removed = self.chats.write().await.shift_remove(id);
        if removed.is_none() {
            debug!(target: "Carbon/Cache", "remove_chat: {id} not cached, ignoring");
            return;
        }
        let orphaned: Vec<String> = {
            let mut messages = self.messages.write().await;
            let ids: Vec<String> = messages
                .values()
                .filter(|m| m.ctx == id)
                .map(|m| m.id.clone())
                .collect();
            messages.retain(|_, m| m.ctx != id);
            ids
        };
        let _ = self.bus.chat_removed.send(Arc::new(id.to_string()));
        for mid in orphaned {
            let _ = self.bus.message_removed.send(Arc::new(mid));
        }
    }

    /// Idempotent upsert: a new id appends, a known id is replaced in place
    /// so stored order is stable for display.
    pub async fn upsert_message(&self, message: Message) {
        let notify = Arc::new(message.clone());
        self.messages
            .write()
            .await
            .insert(message.id.clone(), message);
        let _ = self.bus.message_upserted.send(notify);
    }

    /// Order-preserving remove. Absent ids are a no-op, not an error —
    /// events may arrive after a local delete already happened.
    pub async fn remove_message(&self, id: &str) {
        if self.messages.write().await.shift_remove(id).is_some() {
            let _ = self.bus.message_removed.send(Arc::new(id.to_string()));
        } else {
            debug!(target: "Carbon/Cache", "remove_message: {id} not cached, ignoring");
        }
    }

    /// Merges a historical backfill. Within the batch only the first
    /// occurrence of each id survives; survivors are then upserted under a
    /// single write lock so readers never observe a half-applied batch.
    pub async fn merge_messages(&self, batch: Vec<Message>) {
        let mut seen: HashSet<String> = HashSet::new();
        let mut notifications = Vec::new();
        {
            let mut messages = self.messages.write().await;
            for message in batch {
                if !seen.insert(message.id.clone()) {
                    continue;
                }
                let notify = Arc::new(message.clone());
                messages.insert(message.id.clone(), message);
                notifications.push(notify);
            }
        }
        for n in notifications {
            let _ = self.bus.message_upserted.send(n);
        }
    }

    pub async fn chat_by_id(&self, id: &str) -> Result<Chat, ClientError> {
        self.chats
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or(ClientError::NotFound)
    }

    pub async fn contains_chat(&self, id: &str) -> bool {
        self.chats.read().await.contains_key(id)
    }

    /// All cached chats in insertion order.
    pub async fn chats(&self) -> Vec<Chat> {
        self.chats.read().await.values().cloned().collect()
    }

    pub async fn message_by_id(&self, id: &str) -> Option<Message> {
        self.messages.read().await.get(id).cloned()
    }

    /// The subsequence of cached messages belonging to `chat_id`, in stored
    /// order.
    pub async fn messages_for(&self, chat_id: &str) -> Vec<Message> {
        self.messages
            .read()
            .await
            .values()
            .filter(|m| m.ctx == chat_id)
            .cloned()
            .collect()
    }

    pub async fn message_count(&self) -> usize {
        self.messages.read().await.len()
    }
}
