use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, PresenceStatus, UserId},
    protocol::{MessagePayload, ServerEnvelope},
};
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::{
    channel::{ChannelState, EnvelopeHandler},
    directory::ConversationDirectory,
    ingest::{Delivery, MessageIngestor},
    presence::PresenceTracker,
    session::ConversationSession,
    ClientEvent,
};

/// Where an inbound envelope goes, decided against the active conversation
/// at the moment it arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum Route {
    Connected {
        username: Option<String>,
    },
    Ingest(MessagePayload),
    /// A message for some other conversation; only the list needs refreshing.
    RefreshList(ConversationId),
    UserStatus {
        user_id: UserId,
        username: Option<String>,
        status: PresenceStatus,
    },
    Typing {
        conversation_id: ConversationId,
        username: String,
        is_typing: bool,
    },
    Ignore(&'static str),
}

pub fn classify(envelope: ServerEnvelope, active: Option<ConversationId>) -> Route {
    match envelope {
        ServerEnvelope::Connected { username, .. } => Route::Connected { username },
        ServerEnvelope::NewMessage {
            conversation_id,
            message,
        } => {
            if active == Some(conversation_id) {
                Route::Ingest(message)
            } else {
                Route::RefreshList(conversation_id)
            }
        }
        ServerEnvelope::UserStatus {
            user_id,
            username,
            status,
        } => Route::UserStatus {
            user_id,
            username,
            status,
        },
        ServerEnvelope::Typing {
            conversation_id,
            username,
            is_typing,
            ..
        } => {
            if active == Some(conversation_id) {
                Route::Typing {
                    conversation_id,
                    username,
                    is_typing,
                }
            } else {
                Route::Ignore("typing for inactive conversation")
            }
        }
        ServerEnvelope::Pong => Route::Ignore("pong"),
        ServerEnvelope::Unknown => Route::Ignore("unknown envelope type"),
    }
}

pub struct Dispatcher {
    session: Arc<ConversationSession>,
    ingestor: Arc<MessageIngestor>,
    presence: Arc<PresenceTracker>,
    directory: Arc<ConversationDirectory>,
    events: broadcast::Sender<ClientEvent>,
}

impl Dispatcher {
    pub fn new(
        session: Arc<ConversationSession>,
        ingestor: Arc<MessageIngestor>,
        presence: Arc<PresenceTracker>,
        directory: Arc<ConversationDirectory>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            ingestor,
            presence,
            directory,
            events,
        })
    }
}

#[async_trait]
impl EnvelopeHandler for Dispatcher {
    async fn on_envelope(&self, envelope: ServerEnvelope) {
        let active = self.session.state().active_id().await;
        match classify(envelope, active) {
            Route::Connected { username } => {
                info!(
                    username = username.as_deref().unwrap_or("?"),
                    "push channel acknowledged"
                );
            }
            Route::Ingest(message) => {
                let message_id = message.id;
                let outcome = self.ingestor.ingest(message, Delivery::Push).await;
                trace!(%message_id, ?outcome, "pushed message ingested");
            }
            Route::RefreshList(conversation_id) => {
                debug!(%conversation_id, "message for another conversation");
                let _ = self.directory.refresh().await;
            }
            Route::UserStatus {
                user_id,
                username,
                status,
            } => {
                let _ = self.events.send(ClientEvent::UserStatusChanged {
                    user_id,
                    username,
                    status,
                });
            }
            Route::Typing {
                conversation_id,
                username,
                is_typing,
            } => {
                self.presence
                    .note_typing(conversation_id, &username, is_typing)
                    .await;
            }
            Route::Ignore(reason) => trace!(reason, "envelope ignored"),
        }
    }

    async fn on_state_change(&self, state: ChannelState) {
        let _ = self.events.send(ClientEvent::ChannelStateChanged(state));
        match state {
            ChannelState::Open => {
                self.session.rejoin().await;
            }
            ChannelState::ClosedGivenUp => {
                let _ = self.events.send(ClientEvent::Status(
                    "Realtime connection lost; falling back to polling".into(),
                ));
            }
            _ => {}
        }
    }
}

#[cfg(test)]
#[path = "tests/dispatch_tests.rs"]
mod tests;
