//! Active-conversation state and the conversation-switch protocol.

use std::sync::Arc;

use shared::{
    domain::{ConversationId, ConversationKind, MessageId},
    protocol::ClientEnvelope,
};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::{
    api::ChatApi,
    channel::PushChannel,
    directory::ConversationDirectory,
    error::{SyncError, SyncResult},
    ingest::MessageIngestor,
    polling::PollFallback,
    presence::{PresenceTracker, TypingEmitter},
    ClientEvent,
};

/// Identifies one `select()` of one conversation. Async completions carry
/// the ticket they were issued under and are dropped once it is stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket {
    pub conversation_id: ConversationId,
    pub epoch: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSessionState {
    pub active: Option<ConversationId>,
    pub kind: Option<ConversationKind>,
    /// Highest message id rendered for `active`; zero means nothing yet.
    pub watermark: MessageId,
    pub epoch: u64,
    pub unavailable: bool,
}

/// Single source of truth for the active conversation. Mutated only by
/// `ConversationSession`, except for the monotonic watermark advance done
/// on behalf of rendered messages.
#[derive(Default)]
pub struct SessionState {
    inner: Mutex<ConversationSessionState>,
}

impl SessionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn snapshot(&self) -> ConversationSessionState {
        self.inner.lock().await.clone()
    }

    pub async fn active_id(&self) -> Option<ConversationId> {
        self.inner.lock().await.active
    }

    pub async fn watermark(&self) -> MessageId {
        self.inner.lock().await.watermark
    }

    pub async fn ticket(&self) -> Option<SessionTicket> {
        let guard = self.inner.lock().await;
        guard.active.map(|conversation_id| SessionTicket {
            conversation_id,
            epoch: guard.epoch,
        })
    }

    /// Ticket plus watermark read under one lock.
    pub async fn poll_target(&self) -> Option<(SessionTicket, MessageId)> {
        let guard = self.inner.lock().await;
        if guard.unavailable || guard.kind.is_some_and(ConversationKind::is_singleton) {
            return None;
        }
        guard.active.map(|conversation_id| {
            (
                SessionTicket {
                    conversation_id,
                    epoch: guard.epoch,
                },
                guard.watermark,
            )
        })
    }

    pub async fn is_current(&self, ticket: SessionTicket) -> bool {
        let guard = self.inner.lock().await;
        guard.epoch == ticket.epoch && guard.active == Some(ticket.conversation_id)
    }

    pub(crate) async fn activate(&self, conversation_id: ConversationId) -> SessionTicket {
        let mut guard = self.inner.lock().await;
        guard.epoch += 1;
        guard.active = Some(conversation_id);
        guard.kind = None;
        guard.watermark = MessageId::UNSEEN;
        guard.unavailable = false;
        SessionTicket {
            conversation_id,
            epoch: guard.epoch,
        }
    }

    pub(crate) async fn set_kind(&self, ticket: SessionTicket, kind: Option<ConversationKind>) {
        let mut guard = self.inner.lock().await;
        if guard.epoch == ticket.epoch {
            guard.kind = kind;
        }
    }

    pub(crate) async fn mark_unavailable(&self, ticket: SessionTicket) {
        let mut guard = self.inner.lock().await;
        if guard.epoch == ticket.epoch {
            guard.unavailable = true;
        }
    }

    pub(crate) async fn advance_watermark(&self, ticket: SessionTicket, id: MessageId) -> bool {
        let mut guard = self.inner.lock().await;
        if guard.epoch != ticket.epoch || id <= guard.watermark {
            return false;
        }
        guard.watermark = id;
        true
    }

    pub(crate) async fn deactivate(&self) -> Option<ConversationId> {
        let mut guard = self.inner.lock().await;
        guard.epoch += 1;
        guard.kind = None;
        guard.watermark = MessageId::UNSEEN;
        guard.unavailable = false;
        guard.active.take()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectOutcome {
    /// Metadata and history applied, join sent, fallback polling armed.
    Opened,
    /// Notes/files view handed to its listing collaborator.
    PseudoConversation(ConversationKind),
    Unavailable,
    /// A later `select()` won; nothing from this one was applied.
    Superseded,
}

pub struct ConversationSession {
    state: Arc<SessionState>,
    api: Arc<dyn ChatApi>,
    channel: Arc<dyn PushChannel>,
    poll: Arc<PollFallback>,
    presence: Arc<PresenceTracker>,
    typing: Arc<TypingEmitter>,
    ingestor: Arc<MessageIngestor>,
    directory: Arc<ConversationDirectory>,
    events: broadcast::Sender<ClientEvent>,
}

pub struct SessionParts {
    pub state: Arc<SessionState>,
    pub api: Arc<dyn ChatApi>,
    pub channel: Arc<dyn PushChannel>,
    pub poll: Arc<PollFallback>,
    pub presence: Arc<PresenceTracker>,
    pub typing: Arc<TypingEmitter>,
    pub ingestor: Arc<MessageIngestor>,
    pub directory: Arc<ConversationDirectory>,
    pub events: broadcast::Sender<ClientEvent>,
}

impl ConversationSession {
    pub fn new(parts: SessionParts) -> Arc<Self> {
        Arc::new(Self {
            state: parts.state,
            api: parts.api,
            channel: parts.channel,
            poll: parts.poll,
            presence: parts.presence,
            typing: parts.typing,
            ingestor: parts.ingestor,
            directory: parts.directory,
            events: parts.events,
        })
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    pub async fn select(&self, conversation_id: ConversationId) -> SelectOutcome {
        let previous = self.state.active_id().await;
        self.typing.stop().await;
        if let Some(previous) = previous.filter(|previous| *previous != conversation_id) {
            self.channel
                .send(ClientEnvelope::LeaveConversation {
                    conversation_id: Some(previous),
                })
                .await;
        }

        let ticket = self.state.activate(conversation_id).await;
        self.presence.reset(Some(conversation_id)).await;
        self.ingestor.reset(ticket).await;
        info!(%conversation_id, epoch = ticket.epoch, "conversation selected");

        let kind = match self.api.conversation_details(conversation_id).await {
            Ok(details) => {
                if !self.state.is_current(ticket).await {
                    return self.superseded(ticket, "metadata");
                }
                let kind = details.kind;
                let _ = self.events.send(ClientEvent::ConversationOpened(details));
                Some(kind)
            }
            Err(err) if err.is_unavailable() => {
                if !self.state.is_current(ticket).await {
                    return self.superseded(ticket, "metadata");
                }
                warn!(%conversation_id, %err, "conversation unavailable");
                self.state.mark_unavailable(ticket).await;
                self.poll.stop().await;
                let _ = self
                    .events
                    .send(ClientEvent::ConversationUnavailable { conversation_id });
                return SelectOutcome::Unavailable;
            }
            Err(err) => {
                if !self.state.is_current(ticket).await {
                    return self.superseded(ticket, "metadata");
                }
                warn!(%conversation_id, %err, "failed to load conversation metadata");
                if !err.is_transport() {
                    let _ = self.events.send(ClientEvent::Status(
                        "Failed to load conversation details".into(),
                    ));
                }
                self.directory.kind_of(conversation_id).await
            }
        };
        self.state.set_kind(ticket, kind).await;

        if let Some(kind) = kind.filter(|kind| kind.is_singleton()) {
            self.poll.stop().await;
            let _ = self.events.send(ClientEvent::PseudoConversationOpened {
                conversation_id,
                kind,
            });
            return SelectOutcome::PseudoConversation(kind);
        }

        if !self.load_history(ticket).await {
            return self.superseded(ticket, "history");
        }

        self.channel
            .send(ClientEnvelope::JoinConversation { conversation_id })
            .await;
        self.poll.start().await;
        SelectOutcome::Opened
    }

    /// Re-issues the join after the push channel reopens; the server keeps
    /// no membership across disconnects.
    pub async fn rejoin(&self) -> bool {
        let snapshot = self.state.snapshot().await;
        let Some(conversation_id) = snapshot.active else {
            return false;
        };
        if snapshot.unavailable || snapshot.kind.is_some_and(ConversationKind::is_singleton) {
            return false;
        }
        debug!(%conversation_id, "rejoining active conversation");
        self.channel
            .send(ClientEnvelope::JoinConversation { conversation_id })
            .await
    }

    /// Validates locally, posts, then re-fetches list and history on success.
    pub async fn send_message(&self, content: &str) -> SyncResult<()> {
        let content = content.trim();
        if content.is_empty() {
            return Err(self.reject("Message is empty"));
        }
        let snapshot = self.state.snapshot().await;
        let Some(ticket) = self.state.ticket().await else {
            return Err(self.reject("Select a conversation first"));
        };
        if snapshot.unavailable {
            return Err(self.reject("Conversation is unavailable"));
        }
        if snapshot.kind.is_some_and(ConversationKind::is_singleton) {
            return Err(self.reject("Messages cannot be sent here"));
        }

        self.typing.stop().await;
        if let Err(err) = self
            .api
            .send_message(ticket.conversation_id, content)
            .await
        {
            warn!(conversation_id = %ticket.conversation_id, %err, "send failed");
            let _ = self
                .events
                .send(ClientEvent::Status(format!("Failed to send message: {err}")));
            return Err(err);
        }

        let _ = self.directory.refresh().await;
        self.load_history(ticket).await;
        Ok(())
    }

    /// Leaves the active conversation without selecting another one.
    pub async fn clear(&self) {
        self.typing.stop().await;
        self.poll.stop().await;
        if let Some(previous) = self.state.deactivate().await {
            self.channel
                .send(ClientEnvelope::LeaveConversation {
                    conversation_id: Some(previous),
                })
                .await;
        }
        self.presence.reset(None).await;
    }

    /// Returns `false` when the ticket went stale while the request was in flight.
    async fn load_history(&self, ticket: SessionTicket) -> bool {
        match self.api.list_messages(ticket.conversation_id).await {
            Ok(messages) => self.ingestor.load_history(ticket, messages).await,
            Err(err) => {
                if !self.state.is_current(ticket).await {
                    return false;
                }
                warn!(conversation_id = %ticket.conversation_id, %err, "failed to load history");
                if !err.is_transport() {
                    let _ = self
                        .events
                        .send(ClientEvent::Status("Failed to load messages".into()));
                }
                true
            }
        }
    }

    fn superseded(&self, ticket: SessionTicket, what: &str) -> SelectOutcome {
        debug!(
            conversation_id = %ticket.conversation_id,
            epoch = ticket.epoch,
            what,
            "discarding stale completion"
        );
        SelectOutcome::Superseded
    }

    fn reject(&self, reason: &str) -> SyncError {
        let _ = self.events.send(ClientEvent::Status(reason.to_string()));
        SyncError::Validation(reason.to_string())
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;
