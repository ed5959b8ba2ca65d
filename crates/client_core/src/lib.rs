use std::sync::Arc;

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, ConversationKind, PresenceStatus, UserId},
    protocol::{ConversationDetails, ConversationSummary, MessagePayload},
};
use tokio::sync::{broadcast, watch};
use tracing::info;

pub mod api;
pub mod channel;
pub mod config;
pub mod directory;
pub mod dispatch;
pub mod error;
pub mod ingest;
pub mod polling;
pub mod presence;
pub mod session;
pub mod transport;

use api::{ChatApi, HttpChatApi};
use channel::{ChannelOptions, ChannelState, ConnectionChannel, EnvelopeHandler, PushChannel};
use config::SyncSettings;
use directory::ConversationDirectory;
use dispatch::Dispatcher;
use error::SyncResult;
use ingest::MessageIngestor;
use polling::PollFallback;
use presence::{PresenceTracker, TypingEmitter};
use session::{ConversationSession, SelectOutcome, SessionParts, SessionState};
use transport::{ws_url, TungsteniteConnector, WsConnector};

pub use session::SessionTicket;

const EVENT_CAPACITY: usize = 1024;

/// Everything the view layer needs to render. Published on a broadcast
/// channel; slow subscribers lag rather than block the core.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    ConversationsUpdated(Vec<ConversationSummary>),
    ConversationOpened(ConversationDetails),
    ConversationUnavailable {
        conversation_id: ConversationId,
    },
    PseudoConversationOpened {
        conversation_id: ConversationId,
        kind: ConversationKind,
    },
    MessagesReplaced {
        conversation_id: ConversationId,
        messages: Vec<MessagePayload>,
    },
    MessageAppended {
        conversation_id: ConversationId,
        message: MessagePayload,
    },
    TypingChanged {
        conversation_id: ConversationId,
        description: Option<String>,
    },
    UserStatusChanged {
        user_id: UserId,
        username: Option<String>,
        status: PresenceStatus,
    },
    Notification(MessagePayload),
    ChannelStateChanged(ChannelState),
    Status(String),
}

#[async_trait]
pub trait ClientHandle: Send + Sync {
    async fn start(&self);
    async fn refresh_conversations(&self) -> SyncResult<Vec<ConversationSummary>>;
    async fn select_conversation(&self, conversation_id: ConversationId) -> SelectOutcome;
    async fn input_activity(&self);
    async fn send_message(&self, content: &str) -> SyncResult<()>;
    async fn reconnect(&self);
    async fn shutdown(&self);
    fn set_page_visible(&self, visible: bool);
    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent>;
}

/// The synchronization core, wired together. Components receive their
/// collaborators at construction; nothing reaches for globals.
pub struct SyncClient {
    channel: Arc<ConnectionChannel>,
    state: Arc<SessionState>,
    directory: Arc<ConversationDirectory>,
    presence: Arc<PresenceTracker>,
    ingestor: Arc<MessageIngestor>,
    poll: Arc<PollFallback>,
    typing: Arc<TypingEmitter>,
    session: Arc<ConversationSession>,
    dispatcher: Arc<dyn EnvelopeHandler>,
    events: broadcast::Sender<ClientEvent>,
}

impl SyncClient {
    pub fn new(settings: &SyncSettings) -> SyncResult<Arc<Self>> {
        settings.validate()?;
        let api = HttpChatApi::new(settings.server_url.clone(), settings.auth_cookie.as_deref())?;
        let connector = TungsteniteConnector::new(settings.auth_cookie.clone());
        Self::new_with_dependencies(settings, Arc::new(api), Arc::new(connector))
    }

    pub fn new_with_dependencies(
        settings: &SyncSettings,
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn WsConnector>,
    ) -> SyncResult<Arc<Self>> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let channel = ConnectionChannel::new(
            connector,
            ChannelOptions {
                url: ws_url(&settings.server_url)?,
                base_delay: settings.reconnect_base_delay(),
                max_attempts: settings.max_reconnect_attempts,
                ping_interval: settings.ping_interval(),
            },
        );
        let push: Arc<dyn PushChannel> = channel.clone();

        let state = SessionState::new();
        let directory = ConversationDirectory::new(api.clone(), events.clone());
        let presence = PresenceTracker::new(settings.typing_expiry(), events.clone());
        let ingestor = MessageIngestor::new(state.clone(), directory.clone(), events.clone());
        let poll = PollFallback::new(
            api.clone(),
            push.clone(),
            state.clone(),
            ingestor.clone(),
            settings.poll_interval(),
        );
        let typing = TypingEmitter::new(push.clone(), state.clone(), settings.typing_idle());
        let session = ConversationSession::new(SessionParts {
            state: state.clone(),
            api,
            channel: push,
            poll: poll.clone(),
            presence: presence.clone(),
            typing: typing.clone(),
            ingestor: ingestor.clone(),
            directory: directory.clone(),
            events: events.clone(),
        });
        let dispatcher: Arc<dyn EnvelopeHandler> = Dispatcher::new(
            session.clone(),
            ingestor.clone(),
            presence.clone(),
            directory.clone(),
            events.clone(),
        );

        Ok(Arc::new(Self {
            channel,
            state,
            directory,
            presence,
            ingestor,
            poll,
            typing,
            session,
            dispatcher,
            events,
        }))
    }

    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    pub fn watch_channel(&self) -> watch::Receiver<ChannelState> {
        self.channel.subscribe()
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.state.active_id().await
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.directory.conversations().await
    }

    pub async fn typing_description(&self) -> Option<String> {
        self.presence.describe().await
    }
}

#[async_trait]
impl ClientHandle for SyncClient {
    async fn start(&self) {
        self.channel.on_envelope(&self.dispatcher).await;
        let _ = self.directory.refresh().await;
        self.channel.open().await;
        info!("sync client started");
    }

    async fn refresh_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        self.directory.refresh().await
    }

    async fn select_conversation(&self, conversation_id: ConversationId) -> SelectOutcome {
        self.session.select(conversation_id).await
    }

    async fn input_activity(&self) {
        self.typing.input_activity().await;
    }

    async fn send_message(&self, content: &str) -> SyncResult<()> {
        self.session.send_message(content).await
    }

    async fn reconnect(&self) {
        self.channel.reconnect().await;
    }

    async fn shutdown(&self) {
        self.session.clear().await;
        self.poll.stop().await;
        self.channel.close().await;
        info!("sync client stopped");
    }

    fn set_page_visible(&self, visible: bool) {
        self.ingestor.set_page_visible(visible);
    }

    fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
