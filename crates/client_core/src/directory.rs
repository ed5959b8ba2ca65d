use std::sync::Arc;

use shared::{
    domain::{ConversationId, ConversationKind},
    protocol::ConversationSummary,
};
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, warn};

use crate::{api::ChatApi, error::SyncResult, ClientEvent};

/// Conversation-list collaborator. The cached list is replaced wholesale on
/// every refresh and never patched locally.
pub struct ConversationDirectory {
    api: Arc<dyn ChatApi>,
    events: broadcast::Sender<ClientEvent>,
    conversations: RwLock<Vec<ConversationSummary>>,
}

impl ConversationDirectory {
    pub fn new(api: Arc<dyn ChatApi>, events: broadcast::Sender<ClientEvent>) -> Arc<Self> {
        Arc::new(Self {
            api,
            events,
            conversations: RwLock::new(Vec::new()),
        })
    }

    pub async fn refresh(&self) -> SyncResult<Vec<ConversationSummary>> {
        match self.api.list_conversations().await {
            Ok(conversations) => {
                debug!(count = conversations.len(), "conversation list refreshed");
                *self.conversations.write().await = conversations.clone();
                let _ = self
                    .events
                    .send(ClientEvent::ConversationsUpdated(conversations.clone()));
                Ok(conversations)
            }
            Err(err) => {
                if err.is_transport() {
                    warn!(%err, "conversation list refresh failed; will retry on next sync");
                } else {
                    let _ = self
                        .events
                        .send(ClientEvent::Status("Failed to load conversations".into()));
                }
                Err(err)
            }
        }
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.conversations.read().await.clone()
    }

    pub async fn kind_of(&self, conversation_id: ConversationId) -> Option<ConversationKind> {
        self.conversations
            .read()
            .await
            .iter()
            .find(|conversation| conversation.id == conversation_id)
            .map(|conversation| conversation.kind)
    }
}
