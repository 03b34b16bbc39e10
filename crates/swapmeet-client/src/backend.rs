use std::future::Future;
use std::sync::Arc;

use reqwest::{Response, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use swapmeet_types::api::{
    CreateConversationRequest, ErrorBody, LoginRequest, LoginResponse, SendMessageRequest,
};
use swapmeet_types::error::{ChatError, ErrorKind};
use swapmeet_types::models::{Conversation, ConversationPreview, Message};

use crate::error::ClientError;

/// The persisted half of the chat: everything that goes through REST.
///
/// Controllers are generic over this so they can run against a local store
/// in tests.
pub trait ChatBackend: Send + Sync {
    /// Inbox of the authenticated user.
    fn list_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<ConversationPreview>, ClientError>> + Send;

    /// Conversation with `user_id`, created on first contact.
    fn open_conversation(
        &self,
        user_id: Uuid,
    ) -> impl Future<Output = Result<Conversation, ClientError>> + Send;

    /// Full history, oldest first. Marks the peer's messages read.
    fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Message>, ClientError>> + Send;

    fn send_message(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> impl Future<Output = Result<Message, ClientError>> + Send;
}

impl<T: ChatBackend> ChatBackend for Arc<T> {
    fn list_conversations(
        &self,
    ) -> impl Future<Output = Result<Vec<ConversationPreview>, ClientError>> + Send {
        (**self).list_conversations()
    }

    fn open_conversation(
        &self,
        user_id: Uuid,
    ) -> impl Future<Output = Result<Conversation, ClientError>> + Send {
        (**self).open_conversation(user_id)
    }

    fn list_messages(
        &self,
        conversation_id: Uuid,
    ) -> impl Future<Output = Result<Vec<Message>, ClientError>> + Send {
        (**self).list_messages(conversation_id)
    }

    fn send_message(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> impl Future<Output = Result<Message, ClientError>> + Send {
        (**self).send_message(conversation_id, content)
    }
}

/// [`ChatBackend`] over the server's REST routes.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpBackend {
    pub fn new(base_url: &str, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        }
    }

    /// Exchange credentials for a token. No backend exists before this.
    pub async fn login(
        base_url: &str,
        username: &str,
        password: &str,
    ) -> Result<LoginResponse, ClientError> {
        let resp = reqwest::Client::new()
            .post(format!("{}/auth/login", base_url.trim_end_matches('/')))
            .json(&LoginRequest {
                username: username.to_string(),
                password: password.to_string(),
            })
            .send()
            .await?;
        decode(resp).await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .send()
            .await?;
        decode(resp).await
    }

    async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, ClientError>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let resp = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        decode(resp).await
    }
}

impl ChatBackend for HttpBackend {
    async fn list_conversations(&self) -> Result<Vec<ConversationPreview>, ClientError> {
        self.get_json("/conversations").await
    }

    async fn open_conversation(&self, user_id: Uuid) -> Result<Conversation, ClientError> {
        self.post_json("/conversations", &CreateConversationRequest { user_id })
            .await
    }

    async fn list_messages(&self, conversation_id: Uuid) -> Result<Vec<Message>, ClientError> {
        self.get_json(&format!("/conversations/{}/messages", conversation_id))
            .await
    }

    async fn send_message(
        &self,
        conversation_id: Uuid,
        content: &str,
    ) -> Result<Message, ClientError> {
        let body = SendMessageRequest {
            content: content.to_string(),
        };
        self.post_json(&format!("/conversations/{}/messages", conversation_id), &body)
            .await
    }
}

async fn decode<T: DeserializeOwned>(resp: Response) -> Result<T, ClientError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }

    let error = match resp.json::<ErrorBody>().await {
        Ok(body) => ChatError::new(body.kind, body.error),
        Err(_) => ChatError::new(kind_for_status(status), status.to_string()),
    };
    Err(error.into())
}

/// Fallback when the body is not an [`ErrorBody`] (proxies, panics).
fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ErrorKind::Unauthorized,
        StatusCode::NOT_FOUND => ErrorKind::NotFound,
        StatusCode::BAD_REQUEST | StatusCode::CONFLICT | StatusCode::UNPROCESSABLE_ENTITY => {
            ErrorKind::InvalidArgument
        }
        _ => ErrorKind::Internal,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_fallback_kinds() {
        assert_eq!(kind_for_status(StatusCode::UNAUTHORIZED), ErrorKind::Unauthorized);
        assert_eq!(kind_for_status(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(kind_for_status(StatusCode::CONFLICT), ErrorKind::InvalidArgument);
        assert_eq!(kind_for_status(StatusCode::BAD_GATEWAY), ErrorKind::Internal);
    }

    #[test]
    fn base_url_is_normalized() {
        let backend = HttpBackend::new("http://localhost:3210/", "tok");
        assert_eq!(backend.base_url, "http://localhost:3210");
    }
}
