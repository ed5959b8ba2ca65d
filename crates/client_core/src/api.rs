use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, COOKIE},
    Client, Response, StatusCode,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::{ConversationId, MessageId},
    error::ErrorBody,
    protocol::{
        ConversationDetails, ConversationSummary, MessagePayload, NewMessagesQuery,
        SendMessageRequest,
    },
};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// HTTP collaborator the synchronization core pulls state from.
#[async_trait]
pub trait ChatApi: Send + Sync {
    async fn list_conversations(&self) -> SyncResult<Vec<ConversationSummary>>;
    async fn conversation_details(
        &self,
        conversation_id: ConversationId,
    ) -> SyncResult<ConversationDetails>;
    async fn list_messages(&self, conversation_id: ConversationId)
        -> SyncResult<Vec<MessagePayload>>;
    /// Only messages with an id strictly greater than `after`.
    async fn list_messages_after(
        &self,
        conversation_id: ConversationId,
        after: MessageId,
    ) -> SyncResult<Vec<MessagePayload>>;
    async fn send_message(&self, conversation_id: ConversationId, content: &str)
        -> SyncResult<()>;
}

pub struct HttpChatApi {
    http: Client,
    server_url: String,
}

impl HttpChatApi {
    pub fn new(server_url: impl Into<String>, auth_cookie: Option<&str>) -> SyncResult<Self> {
        let mut headers = HeaderMap::new();
        if let Some(cookie) = auth_cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|err| SyncError::Config(format!("auth_cookie: {err}")))?;
            headers.insert(COOKIE, value);
        }
        let http = Client::builder()
            .default_headers(headers)
            .build()
            .map_err(|err| SyncError::Config(format!("failed to build http client: {err}")))?;
        Ok(Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.server_url)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        conversation_id: Option<ConversationId>,
    ) -> SyncResult<T> {
        let res = self.http.get(self.url(path)).send().await?;
        let res = check_status(res, conversation_id).await?;
        Ok(res.json().await?)
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn list_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        self.get_json("/api/conversations", None).await
    }

    async fn conversation_details(
        &self,
        conversation_id: ConversationId,
    ) -> SyncResult<ConversationDetails> {
        self.get_json(
            &format!("/api/conversations/{conversation_id}"),
            Some(conversation_id),
        )
        .await
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> SyncResult<Vec<MessagePayload>> {
        self.get_json(
            &format!("/api/conversations/{conversation_id}/messages"),
            Some(conversation_id),
        )
        .await
    }

    async fn list_messages_after(
        &self,
        conversation_id: ConversationId,
        after: MessageId,
    ) -> SyncResult<Vec<MessagePayload>> {
        let res = self
            .http
            .get(self.url(&format!(
                "/api/conversations/{conversation_id}/messages/new"
            )))
            .query(&NewMessagesQuery {
                last_message_id: after,
            })
            .send()
            .await?;
        let res = check_status(res, Some(conversation_id)).await?;
        Ok(res.json().await?)
    }

    async fn send_message(
        &self,
        conversation_id: ConversationId,
        content: &str,
    ) -> SyncResult<()> {
        let res = self
            .http
            .post(self.url(&format!(
                "/api/conversations/{conversation_id}/messages"
            )))
            .json(&SendMessageRequest {
                content: content.to_string(),
            })
            .send()
            .await?;
        let res = check_status(res, Some(conversation_id)).await?;

        // Some endpoints answer 200 with `{"success": false}`.
        let body = res.text().await?;
        if let Ok(parsed) = serde_json::from_str::<ErrorBody>(&body) {
            if parsed.reports_failure() {
                return Err(SyncError::Server {
                    status: StatusCode::OK.as_u16(),
                    message: parsed.message_or("request failed"),
                });
            }
        }
        debug!(%conversation_id, "message accepted by server");
        Ok(())
    }
}

async fn check_status(
    res: Response,
    conversation_id: Option<ConversationId>,
) -> SyncResult<Response> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    match (status, conversation_id) {
        (StatusCode::NOT_FOUND, Some(id)) => Err(SyncError::NotFound(id)),
        (StatusCode::FORBIDDEN, Some(id)) => Err(SyncError::Forbidden(id)),
        _ => {
            let body = res.json::<ErrorBody>().await.unwrap_or_default();
            Err(SyncError::Server {
                status: status.as_u16(),
                message: body.message_or(status.canonical_reason().unwrap_or("request failed")),
            })
        }
    }
}

#[cfg(test)]
#[path = "tests/api_tests.rs"]
mod tests;
