//! The sole point of outbound REST calls.
//!
//! Every request carries the opaque signed `Authorization` credential and
//! the acting identity in a `user` header. POST endpoints are not safely
//! repeatable; PUT and DELETE are idempotent by resource id. Nothing here
//! retries — that is the caller's decision.

use crate::auth::RequestSigner;
use crate::error::ClientError;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::types::{Chat, Message, ReactionKind};
use log::debug;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;

/// Payload of `GET /chats/{id}`: the chat plus its message backfill.
#[derive(Debug, Clone, Deserialize)]
pub struct ChatWithMessages {
    pub chat: Chat,
    pub messages: Vec<Message>,
}

pub struct ApiClient {
    http: Arc<dyn HttpClient>,
    base_url: String,
    signer: Arc<dyn RequestSigner>,
}

impl ApiClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        base_url: impl Into<String>,
        signer: Arc<dyn RequestSigner>,
    ) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            http,
            base_url,
            signer,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Attaches the session credential, acting identity and content type.
    fn authed(&self, req: HttpRequest) -> HttpRequest {
        req.with_header("Authorization", self.signer.authorization())
            .with_header("user", self.signer.identity())
            .with_header("Content-Type", "application/json")
    }

    async fn execute(&self, req: HttpRequest) -> Result<HttpResponse, ClientError> {
        debug!(target: "Carbon/Api", "{} {}", req.method, req.url);
        let resp = self.http.execute(self.authed(req)).await?;
        match resp.status_code {
            _ if resp.is_success() => Ok(resp),
            401 | 403 => Err(ClientError::Unauthorized),
            404 => Err(ClientError::NotFound),
            status => Err(ClientError::Api { status }),
        }
    }

    async fn execute_json<T: DeserializeOwned>(&self, req: HttpRequest) -> Result<T, ClientError> {
        let resp = self.execute(req).await?;
        serde_json::from_slice(&resp.body).map_err(|e| ClientError::Malformed(e.to_string()))
    }

    fn json_body<T: serde::Serialize>(value: &T) -> Result<Vec<u8>, ClientError> {
        serde_json::to_vec(value).map_err(|e| ClientError::Malformed(e.to_string()))
    }

    // --- message resources ---

    /// POST /messages — not safely repeatable. Returns the canonical record.
    pub async fn send_message(&self, message: &Message) -> Result<Message, ClientError> {
        let req = HttpRequest::post(self.url("/messages")).with_body(Self::json_body(message)?);
        self.execute_json(req).await
    }

    /// PUT /messages/{id} — replaces the textual content.
    pub async fn edit_message(&self, id: &str, content: &str) -> Result<Message, ClientError> {
        let body = Self::json_body(&serde_json::json!({ "content": content }))?;
        let req =
            HttpRequest::put(self.url(&format!("/messages/{}", urlencoding::encode(id))))
                .with_body(body);
        self.execute_json(req).await
    }

    /// DELETE /messages/{id} — idempotent.
    pub async fn delete_message(&self, id: &str) -> Result<(), ClientError> {
        let req = HttpRequest::delete(self.url(&format!("/messages/{}", urlencoding::encode(id))));
        self.execute(req).await.map(|_| ())
    }

    /// PUT /messages/{id}/read — marks the chat read up to this message.
    /// Returns the owning chat with its unread counter reset.
    pub async fn mark_read(&self, message_id: &str) -> Result<Chat, ClientError> {
        let req = HttpRequest::put(self.url(&format!(
            "/messages/{}/read",
            urlencoding::encode(message_id)
        )));
        self.execute_json(req).await
    }

    /// PUT /messages/{id}/reactions
    pub async fn react_to_message(
        &self,
        id: &str,
        reaction: ReactionKind,
    ) -> Result<Message, ClientError> {
        let body = Self::json_body(&serde_json::json!({ "reaction": reaction }))?;
        let req = HttpRequest::put(self.url(&format!(
            "/messages/{}/reactions",
            urlencoding::encode(id)
        )))
        .with_body(body);
        self.execute_json(req).await
    }

    /// DELETE /messages/{id}/reactions/{reaction}
    pub async fn remove_reaction(
        &self,
        id: &str,
        reaction: ReactionKind,
    ) -> Result<Message, ClientError> {
        let req = HttpRequest::delete(self.url(&format!(
            "/messages/{}/reactions/{}",
            urlencoding::encode(id),
            reaction.as_str()
        )));
        self.execute_json(req).await
    }

    // --- chat resources ---

    /// POST /chats — not safely repeatable.
    pub async fn create_chat(&self, chat: &Chat) -> Result<Chat, ClientError> {
        let req = HttpRequest::post(self.url("/chats")).with_body(Self::json_body(chat)?);
        self.execute_json(req).await
    }

    /// POST /chats/{id} — replaces the chat metadata.
    pub async fn edit_chat(&self, id: &str, chat: &Chat) -> Result<Chat, ClientError> {
        let req = HttpRequest::post(self.url(&format!("/chats/{}", urlencoding::encode(id))))
            .with_body(Self::json_body(chat)?);
        self.execute_json(req).await
    }

    /// DELETE /chats/{id} — idempotent.
    pub async fn delete_chat(&self, id: &str) -> Result<(), ClientError> {
        let req = HttpRequest::delete(self.url(&format!("/chats/{}", urlencoding::encode(id))));
        self.execute(req).await.map(|_| ())
    }

    /// GET /chats/{id} — the chat plus its messages.
    pub async fn fetch_chat(&self, id: &str) -> Result<ChatWithMessages, ClientError> {
        let req = HttpRequest::get(self.url(&format!("/chats/{}", urlencoding::encode(id))));
        self.execute_json(req).await
    }

    /// PUT /chats/{id}/members/{member}
    pub async fn add_member(&self, chat_id: &str, member: &str) -> Result<Chat, ClientError> {
        let req = HttpRequest::put(self.url(&format!(
            "/chats/{}/members/{}",
            urlencoding::encode(chat_id),
            urlencoding::encode(member)
        )));
        self.execute_json(req).await
    }

    /// DELETE /chats/{id}/members/{member}
    pub async fn remove_member(&self, chat_id: &str, member: &str) -> Result<Chat, ClientError> {
        let req = HttpRequest::delete(self.url(&format!(
            "/chats/{}/members/{}",
            urlencoding::encode(chat_id),
            urlencoding::encode(member)
        )));
        self.execute_json(req).await
    }

    /// PUT /chats/{id}/admins/{admin}
    pub async fn add_admin(&self, chat_id: &str, admin: &str) -> Result<Chat, ClientError> {
        let req = HttpRequest::put(self.url(&format!(
            "/chats/{}/admins/{}",
            urlencoding::encode(chat_id),
            urlencoding::encode(admin)
        )));
        self.execute_json(req).await
    }

    /// DELETE /chats/{id}/admins/{admin}
    pub async fn remove_admin(&self, chat_id: &str, admin: &str) -> Result<Chat, ClientError> {
        let req = HttpRequest::delete(self.url(&format!(
            "/chats/{}/admins/{}",
            urlencoding::encode(chat_id),
            urlencoding::encode(admin)
        )));
        self.execute_json(req).await
    }

    /// PUT /chats/{id}/{messageId}/pins
    pub async fn pin_message(&self, chat_id: &str, message_id: &str) -> Result<Chat, ClientError> {
        let req = HttpRequest::put(self.url(&format!(
            "/chats/{}/{}/pins",
            urlencoding::encode(chat_id),
            urlencoding::encode(message_id)
        )));
        self.execute_json(req).await
    }

    /// DELETE /chats/{id}/{messageId}/pins
    pub async fn unpin_message(
        &self,
        chat_id: &str,
        message_id: &str,
    ) -> Result<Chat, ClientError> {
        let req = HttpRequest::delete(self.url(&format!(
            "/chats/{}/{}/pins",
            urlencoding::encode(chat_id),
            urlencoding::encode(message_id)
        )));
        self.execute_json(req).await
    }
}
