//! The reconciliation state machine.
//!
//! Owns the push-channel lifecycle (subscribe while authenticated, bounded
//! backoff after a drop), applies inbound events to the cache, and exposes
//! the mutation surface. Mutations delegate to [`ApiClient`] and reflect
//! the server's response in the cache on success, so callers never wait
//! for the echoed push event; on failure nothing is applied locally.

use crate::api::{ApiClient, ChatWithMessages};
use crate::auth::{Credentials, RequestSigner};
use crate::cache::CacheStore;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::http::UreqHttpClient;
use crate::stream::{EventStream, InboundItem, SseTransportFactory};
use crate::types::{Chat, Message, MessageEvent, ReactionKind};
use indexmap::IndexSet;
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock, mpsc, watch};
use tokio::time::sleep;

/// A connection that survives this long (or delivers at least one event)
/// counts as healthy and resets the consecutive-failure counter. Without
/// the grace period, a server that accepts subscriptions and drops them
/// immediately would be reconnected to in a tight zero-delay loop.
const STREAM_HEALTHY_AFTER: Duration = Duration::from_secs(10);

/// Tombstones are evicted oldest-first past this size so a very long
/// session cannot grow the set without bound.
const DELETED_TOMBSTONE_CAP: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Disconnected,
    /// Subscription requested, awaiting first success or failure.
    Connecting,
    Connected,
}

pub struct SyncEngine {
    cache: Arc<CacheStore>,
    api: Arc<ApiClient>,
    stream: Arc<EventStream>,

    state_tx: watch::Sender<SyncState>,
    credentials: RwLock<Option<Credentials>>,
    is_running: AtomicBool,
    shutdown_notifier: Notify,

    auto_reconnect: AtomicBool,
    reconnect_errors: AtomicU32,
    reconnect_max_delay: Duration,

    /// Chat ids with a fetch in flight. Checked-and-inserted under the lock
    /// so a burst of events for one unknown chat triggers a single fetch.
    pending_chat_fetches: Mutex<HashSet<String>>,

    /// Message ids deleted this session, insertion-ordered and capped. A
    /// `created` or `updated` event that arrives after the delete (reordered
    /// stream, reconnect gap) must not resurrect the message.
    deleted_messages: Mutex<IndexSet<String>>,
}

impl SyncEngine {
    pub fn new(
        config: &ClientConfig,
        cache: Arc<CacheStore>,
        api: Arc<ApiClient>,
        stream: Arc<EventStream>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cache,
            api,
            stream,
            state_tx: watch::channel(SyncState::Disconnected).0,
            credentials: RwLock::new(None),
            is_running: AtomicBool::new(false),
            shutdown_notifier: Notify::new(),
            auto_reconnect: AtomicBool::new(config.auto_reconnect),
            reconnect_errors: AtomicU32::new(0),
            reconnect_max_delay: config.reconnect_max_delay,
            pending_chat_fetches: Mutex::new(HashSet::new()),
            deleted_messages: Mutex::new(IndexSet::new()),
        })
    }

    /// Wires up an engine against the real server: `ureq`-backed REST
    /// client and SSE push channel, credentials drawn from `signer`.
    pub fn standard(config: &ClientConfig, signer: Arc<dyn RequestSigner>) -> Arc<Self> {
        let http = Arc::new(UreqHttpClient::new(config.request_timeout));
        let api = Arc::new(ApiClient::new(http, config.base_url.clone(), signer));
        let stream = Arc::new(EventStream::new(Arc::new(SseTransportFactory::new(
            config.base_url.clone(),
        ))));
        Self::new(config, Arc::new(CacheStore::new()), api, stream)
    }

    pub fn cache(&self) -> &Arc<CacheStore> {
        &self.cache
    }

    /// Observe state transitions. The receiver starts at the current state.
    pub fn state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn current_state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    /// Stores the session credentials. The stream connects once `run` is
    /// driving the engine.
    pub async fn login(&self, credentials: Credentials) {
        *self.credentials.write().await = Some(credentials);
    }

    /// Ends the session: clears credentials, cancels any pending reconnect
    /// timer and closes the push channel. Nothing survives a logout.
    pub async fn logout(&self) {
        info!(target: "Carbon/Sync", "logging out, closing push channel");
        *self.credentials.write().await = None;
        self.is_running.store(false, Ordering::Relaxed);
        self.shutdown_notifier.notify_waiters();
        self.stream.unsubscribe().await;
        self.state_tx.send_replace(SyncState::Disconnected);
    }

    /// The main loop: keeps one subscription alive while authenticated.
    /// Returns after `logout` or, with auto-reconnect disabled, after the
    /// first stream drop. Reconnection only ever happens here, so at most
    /// one attempt is in flight.
    pub async fn run(self: &Arc<Self>) {
        if self.is_running.swap(true, Ordering::SeqCst) {
            warn!(target: "Carbon/Sync", "run called while already running");
            return;
        }
        let _running_guard = scopeguard::guard((), |_| {
            self.is_running.store(false, Ordering::Relaxed);
        });

        let mut stay_connected = false;
        while self.is_running.load(Ordering::Relaxed) {
            let Some(credentials) = self.credentials.read().await.clone() else {
                debug!(target: "Carbon/Sync", "not authenticated, leaving run loop");
                break;
            };

            self.state_tx.send_replace(SyncState::Connecting);
            match self.stream.subscribe(&credentials).await {
                Ok(Some(mut rx)) => {
                    self.state_tx.send_replace(SyncState::Connected);
                    info!(target: "Carbon/Sync", "push channel connected");

                    let connected_at = Instant::now();
                    let saw_event = self.drain_stream(&mut rx).await;
                    // The failure counter resets only once the connection
                    // has proven itself; an accept-then-drop server must
                    // still see a growing backoff.
                    if stream_was_healthy(saw_event, connected_at.elapsed()) {
                        self.reconnect_errors.store(0, Ordering::Relaxed);
                    }

                    self.stream.unsubscribe().await;
                    self.state_tx.send_replace(SyncState::Disconnected);
                }
                Ok(None) => {
                    // A previous subscription is still live and keeps its
                    // own state; this loop must not disturb it on the way
                    // out.
                    self.state_tx.send_replace(SyncState::Connected);
                    stay_connected = true;
                    break;
                }
                Err(ClientError::Unauthorized) => {
                    error!(target: "Carbon/Sync", "push channel rejected credentials");
                    self.logout().await;
                    break;
                }
                Err(e) => {
                    warn!(target: "Carbon/Sync", "push channel connect failed: {e}");
                    self.state_tx.send_replace(SyncState::Disconnected);
                }
            }

            // Register for shutdown before re-checking the flags; a logout
            // landing between the check and the select below is then still
            // observed.
            let shutdown = self.shutdown_notifier.notified();
            tokio::pin!(shutdown);
            shutdown.as_mut().enable();

            if !self.is_running.load(Ordering::Relaxed)
                || !self.auto_reconnect.load(Ordering::Relaxed)
            {
                break;
            }

            let errors = self.reconnect_errors.fetch_add(1, Ordering::SeqCst);
            let delay = backoff_delay(errors, self.reconnect_max_delay);
            info!(
                target: "Carbon/Sync",
                "will attempt to reconnect in {delay:?} (attempt {})",
                errors + 1
            );
            tokio::select! {
                _ = sleep(delay) => {}
                _ = &mut shutdown => break,
            }
        }
        if !stay_connected {
            self.state_tx.send_replace(SyncState::Disconnected);
        }
        debug!(target: "Carbon/Sync", "run loop has shut down");
    }

    /// Applies inbound events until the stream closes or shutdown is
    /// signalled. Returns whether at least one event arrived.
    async fn drain_stream(self: &Arc<Self>, rx: &mut mpsc::Receiver<InboundItem>) -> bool {
        let mut saw_event = false;
        // One registration held across iterations: a `notify_waiters` fired
        // while an event is being applied would otherwise be missed by the
        // next loop turn.
        let shutdown = self.shutdown_notifier.notified();
        tokio::pin!(shutdown);
        shutdown.as_mut().enable();
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(InboundItem::Event(event)) => {
                        saw_event = true;
                        self.apply_event(event).await;
                    }
                    Some(InboundItem::Closed) | None => {
                        warn!(target: "Carbon/Sync", "push channel closed");
                        return saw_event;
                    }
                },
                _ = &mut shutdown => return saw_event,
            }
        }
    }

    /// Applies one inbound event to the cache.
    ///
    /// `created` and `updated` are deliberately symmetric: an update for an
    /// id the cache has never seen behaves as a create, because the stream
    /// can miss the original event across a reconnect gap. The message is
    /// cached before its parent chat resolves so content is visible even if
    /// the chat metadata arrives later.
    pub async fn apply_event(self: &Arc<Self>, event: MessageEvent) {
        match event {
            MessageEvent::Created(message) | MessageEvent::Updated(message) => {
                if self.deleted_messages.lock().await.contains(&message.id) {
                    debug!(
                        target: "Carbon/Sync",
                        "ignoring event for already-deleted message {}", message.id
                    );
                    return;
                }
                let ctx = message.ctx.clone();
                self.cache.upsert_message(message).await;
                if !self.cache.contains_chat(&ctx).await {
                    self.fetch_unknown_chat(ctx).await;
                }
            }
            MessageEvent::Deleted(message) => {
                push_tombstone(
                    &mut *self.deleted_messages.lock().await,
                    message.id.clone(),
                    DELETED_TOMBSTONE_CAP,
                );
                self.cache.remove_message(&message.id).await;
            }
        }
    }

    /// Fetches a chat referenced by an event but missing from the cache.
    /// Deduplicated per chat id: while one fetch is outstanding, further
    /// events for the same chat do not trigger another.
    async fn fetch_unknown_chat(self: &Arc<Self>, ctx: String) {
        {
            let mut pending = self.pending_chat_fetches.lock().await;
            if !pending.insert(ctx.clone()) {
                debug!(target: "Carbon/Sync", "chat fetch for {ctx} already in flight");
                return;
            }
        }

        let engine = self.clone();
        tokio::spawn(async move {
            match engine.api.fetch_chat(&ctx).await {
                Ok(bundle) => engine.apply_chat_bundle(bundle).await,
                Err(ClientError::Unauthorized) => {
                    error!(target: "Carbon/Sync", "chat fetch rejected credentials");
                    engine.logout().await;
                }
                Err(e) => {
                    // The next event referencing this chat retries.
                    warn!(target: "Carbon/Sync", "chat fetch for {ctx} failed: {e}");
                }
            }
            engine.pending_chat_fetches.lock().await.remove(&ctx);
        });
    }

    async fn apply_chat_bundle(&self, bundle: ChatWithMessages) {
        self.cache.upsert_chat(bundle.chat).await;
        let deleted = self.deleted_messages.lock().await;
        let batch: Vec<Message> = bundle
            .messages
            .into_iter()
            .filter(|m| !deleted.contains(&m.id))
            .collect();
        drop(deleted);
        self.cache.merge_messages(batch).await;
    }

    /// Maps an `Unauthorized` rejection to a forced logout before handing
    /// the error back to the caller.
    async fn guard<T>(&self, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(ClientError::Unauthorized) = &result {
            self.logout().await;
        }
        result
    }

    // --- message mutations ---

    pub async fn send_message(&self, message: Message) -> Result<Message, ClientError> {
        let sent = self.guard(self.api.send_message(&message).await).await?;
        self.cache.upsert_message(sent.clone()).await;
        Ok(sent)
    }

    pub async fn edit_message(&self, id: &str, content: &str) -> Result<Message, ClientError> {
        let edited = self.guard(self.api.edit_message(id, content).await).await?;
        self.cache.upsert_message(edited.clone()).await;
        Ok(edited)
    }

    pub async fn delete_message(&self, id: &str) -> Result<(), ClientError> {
        self.guard(self.api.delete_message(id).await).await?;
        push_tombstone(
            &mut *self.deleted_messages.lock().await,
            id.to_string(),
            DELETED_TOMBSTONE_CAP,
        );
        self.cache.remove_message(id).await;
        Ok(())
    }

    pub async fn react_to_message(
        &self,
        id: &str,
        reaction: ReactionKind,
    ) -> Result<Message, ClientError> {
        let updated = self
            .guard(self.api.react_to_message(id, reaction).await)
            .await?;
        self.cache.upsert_message(updated.clone()).await;
        Ok(updated)
    }

    pub async fn remove_reaction(
        &self,
        id: &str,
        reaction: ReactionKind,
    ) -> Result<Message, ClientError> {
        let updated = self
            .guard(self.api.remove_reaction(id, reaction).await)
            .await?;
        self.cache.upsert_message(updated.clone()).await;
        Ok(updated)
    }

    /// Tells the server the session has read up to `message_id`; the
    /// returned chat carries the reset unread counter.
    pub async fn mark_read(&self, message_id: &str) -> Result<Chat, ClientError> {
        let chat = self.guard(self.api.mark_read(message_id).await).await?;
        self.cache.upsert_chat(chat.clone()).await;
        Ok(chat)
    }

    // --- chat mutations ---

    pub async fn create_chat(&self, chat: Chat) -> Result<Chat, ClientError> {
        let created = self.guard(self.api.create_chat(&chat).await).await?;
        self.cache.upsert_chat(created.clone()).await;
        Ok(created)
    }

    pub async fn edit_chat(&self, id: &str, chat: Chat) -> Result<Chat, ClientError> {
        let edited = self.guard(self.api.edit_chat(id, &chat).await).await?;
        self.cache.upsert_chat(edited.clone()).await;
        Ok(edited)
    }

    pub async fn delete_chat(&self, id: &str) -> Result<(), ClientError> {
        self.guard(self.api.delete_chat(id).await).await?;
        self.cache.remove_chat(id).await;
        Ok(())
    }

    pub async fn add_member(&self, chat_id: &str, member: &str) -> Result<Chat, ClientError> {
        let chat = self.guard(self.api.add_member(chat_id, member).await).await?;
        self.cache.upsert_chat(chat.clone()).await;
        Ok(chat)
    }

    pub async fn remove_member(&self, chat_id: &str, member: &str) -> Result<Chat, ClientError> {
        let chat = self
            .guard(self.api.remove_member(chat_id, member).await)
            .await?;
        self.cache.upsert_chat(chat.clone()).await;
        Ok(chat)
    }

    pub async fn add_admin(&self, chat_id: &str, admin: &str) -> Result<Chat, ClientError> {
        let chat = self.guard(self.api.add_admin(chat_id, admin).await).await?;
        self.cache.upsert_chat(chat.clone()).await;
        Ok(chat)
    }

    pub async fn remove_admin(&self, chat_id: &str, admin: &str) -> Result<Chat, ClientError> {
        let chat = self
            .guard(self.api.remove_admin(chat_id, admin).await)
            .await?;
        self.cache.upsert_chat(chat.clone()).await;
        Ok(chat)
    }

    pub async fn pin_message(&self, chat_id: &str, message_id: &str) -> Result<Chat, ClientError> {
        let chat = self
            .guard(self.api.pin_message(chat_id, message_id).await)
            .await?;
        self.cache.upsert_chat(chat.clone()).await;
        Ok(chat)
    }

    pub async fn unpin_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Chat, ClientError> {
        let chat = self
            .guard(self.api.unpin_message(chat_id, message_id).await)
            .await?;
        self.cache.upsert_chat(chat.clone()).await;
        Ok(chat)
    }

    // --- reads ---

    /// Local read of a chat and its messages; `NotFound` when uncached.
    pub async fn load_chat(&self, id: &str) -> Result<(Chat, Vec<Message>), ClientError> {
        let chat = self.cache.chat_by_id(id).await?;
        let messages = self.cache.messages_for(id).await;
        Ok((chat, messages))
    }

    /// Forces a server round-trip for a chat and merges the result.
    pub async fn refresh_chat(&self, id: &str) -> Result<Chat, ClientError> {
        let bundle = self.guard(self.api.fetch_chat(id).await).await?;
        let chat = bundle.chat.clone();
        self.apply_chat_bundle(bundle).await;
        Ok(chat)
    }
}

fn stream_was_healthy(saw_event: bool, connected_for: Duration) -> bool {
    saw_event || connected_for >= STREAM_HEALTHY_AFTER
}

/// Records a deletion, evicting the oldest entry once the set is full.
fn push_tombstone(set: &mut IndexSet<String>, id: String, cap: usize) {
    set.insert(id);
    if set.len() > cap {
        set.shift_remove_index(0);
    }
}

/// Backoff before reconnect attempt `errors + 1`: two seconds per previous
/// consecutive failure, capped, with ±10% jitter so clients that lost the
/// same server do not stampede it. The first retry is immediate.
fn backoff_delay(errors: u32, max: Duration) -> Duration {
    use rand::Rng;
    let base = Duration::from_secs(u64::from(errors) * 2).min(max);
    if base.is_zero() {
        return base;
    }
    let jittered = base.as_millis() as u64 * rand::rng().random_range(900..=1100) / 1000;
    Duration::from_millis(jittered)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_immediate_first_then_ramps_capped() {
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(0, max), Duration::ZERO);
        let d1 = backoff_delay(1, max);
        assert!(d1 >= Duration::from_millis(1800) && d1 <= Duration::from_millis(2200));
        let d_large = backoff_delay(1000, max);
        assert!(d_large <= Duration::from_secs(33));
        assert!(d_large >= Duration::from_secs(27));
    }

    #[test]
    fn failure_counter_resets_only_for_proven_connections() {
        // An instantly dropped connection with no traffic is not healthy.
        assert!(!stream_was_healthy(false, Duration::from_millis(5)));
        // Either delivered traffic or a long enough lifetime qualifies.
        assert!(stream_was_healthy(true, Duration::from_millis(5)));
        assert!(stream_was_healthy(false, STREAM_HEALTHY_AFTER));
    }

    #[test]
    fn tombstones_evict_oldest_past_the_cap() {
        let mut set = IndexSet::new();
        for id in ["a", "b", "c"] {
            push_tombstone(&mut set, id.to_string(), 3);
        }
        assert_eq!(set.len(), 3);
        push_tombstone(&mut set, "d".to_string(), 3);
        assert_eq!(set.len(), 3);
        assert!(!set.contains("a"));
        assert!(set.contains("b") && set.contains("c") && set.contains("d"));
        // Re-deleting an already-recorded id does not evict anything.
        push_tombstone(&mut set, "d".to_string(), 3);
        assert!(set.contains("b"));
    }
}
