//! In-process fakes for the HTTP api, the push channel and the socket
//! connector.

use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use async_trait::async_trait;
use shared::{
    domain::{ConversationId, ConversationKind, MessageId, MessageKind, UserId},
    protocol::{
        ClientEnvelope, ConversationDetails, ConversationSummary, MessagePayload, Participant,
        ServerEnvelope,
    },
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch, Mutex},
    time::Instant,
};

use crate::{
    api::ChatApi,
    channel::{ChannelState, EnvelopeHandler, PushChannel},
    config::SyncSettings,
    directory::ConversationDirectory,
    error::{SyncError, SyncResult},
    ingest::MessageIngestor,
    polling::PollFallback,
    presence::{PresenceTracker, TypingEmitter},
    session::{ConversationSession, SessionParts, SessionState},
    transport::{WsConnector, WsLink},
    ClientEvent,
};

pub(crate) fn text_message(id: i64, conversation_id: i64) -> MessagePayload {
    MessagePayload {
        id: MessageId(id),
        conversation_id: ConversationId(conversation_id),
        sender_id: UserId(2),
        sender_username: Some("bob".into()),
        message_type: MessageKind::Text,
        content: Some(format!("message {id}")),
        file_name: None,
        stored_name: None,
        file_size_formatted: None,
        note_title: None,
        note_content: None,
        note_color: None,
        created_at: None,
        created_at_formatted: None,
    }
}

pub(crate) fn details(conversation_id: i64, kind: ConversationKind) -> ConversationDetails {
    ConversationDetails {
        id: ConversationId(conversation_id),
        name: Some(format!("conversation {conversation_id}")),
        kind,
        participants: vec![Participant {
            id: UserId(2),
            username: "bob".into(),
        }],
        description: None,
    }
}

pub(crate) fn summary(conversation_id: i64, kind: ConversationKind) -> ConversationSummary {
    ConversationSummary {
        id: ConversationId(conversation_id),
        name: Some(format!("conversation {conversation_id}")),
        kind,
        last_message: None,
        last_message_sender_username: None,
        updated_at: None,
        updated_at_formatted: None,
    }
}

/// Everything buffered on the receiver right now.
pub(crate) fn drain_events(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            Err(_) => break,
        }
    }
    events
}

/// Message ids rendered into `conversation_id`'s view, in render order.
/// A full replace restarts the list.
pub(crate) fn rendered_ids(events: &[ClientEvent], conversation_id: i64) -> Vec<i64> {
    let target = ConversationId(conversation_id);
    let mut ids = Vec::new();
    for event in events {
        match event {
            ClientEvent::MessagesReplaced {
                conversation_id,
                messages,
            } if *conversation_id == target => {
                ids = messages.iter().map(|message| message.id.0).collect();
            }
            ClientEvent::MessageAppended {
                conversation_id,
                message,
            } if *conversation_id == target => ids.push(message.id.0),
            _ => {}
        }
    }
    ids
}

pub(crate) async fn next_event<F>(
    rx: &mut broadcast::Receiver<ClientEvent>,
    mut matches: F,
) -> ClientEvent
where
    F: FnMut(&ClientEvent) -> bool,
{
    loop {
        match rx.recv().await {
            Ok(event) if matches(&event) => return event,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ApiCall {
    ListConversations,
    Details(ConversationId),
    Messages(ConversationId),
    MessagesAfter(ConversationId, MessageId),
    Send(ConversationId, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Gate {
    Details(ConversationId),
    Messages(ConversationId),
    MessagesAfter(ConversationId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Failure {
    Transport,
    Forbidden,
    Server,
}

impl Failure {
    fn into_error(self, conversation_id: ConversationId) -> SyncError {
        match self {
            Self::Transport => SyncError::Transport("connection refused".into()),
            Self::Forbidden => SyncError::Forbidden(conversation_id),
            Self::Server => SyncError::Server {
                status: 500,
                message: "database unavailable".into(),
            },
        }
    }
}

/// Held response. Await `entered` to know the request is in flight, then
/// drop or fire `release` to let it complete.
pub(crate) struct GateHandle {
    pub entered: oneshot::Receiver<()>,
    pub release: oneshot::Sender<()>,
}

struct PendingGate {
    entered: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

#[derive(Default)]
struct FakeApiState {
    conversations: Vec<ConversationSummary>,
    details: HashMap<ConversationId, ConversationDetails>,
    messages: HashMap<ConversationId, Vec<MessagePayload>>,
    failures: HashMap<Gate, Failure>,
    send_failure: Option<Failure>,
    gates: HashMap<Gate, PendingGate>,
    calls: Vec<ApiCall>,
}

/// Scripted `ChatApi`. Messages live in one store per conversation; the
/// watermark query filters it the way the server does.
#[derive(Default)]
pub(crate) struct FakeChatApi {
    state: Mutex<FakeApiState>,
}

impl FakeChatApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn add_conversation(&self, conversation_id: i64, kind: ConversationKind) {
        let mut state = self.state.lock().await;
        state.conversations.push(summary(conversation_id, kind));
        state
            .details
            .insert(ConversationId(conversation_id), details(conversation_id, kind));
    }

    /// Listed but with no details endpoint; `conversation_details` 404s.
    pub async fn add_listed_only(&self, conversation_id: i64, kind: ConversationKind) {
        self.state
            .lock()
            .await
            .conversations
            .push(summary(conversation_id, kind));
    }

    pub async fn store(&self, message: MessagePayload) {
        self.state
            .lock()
            .await
            .messages
            .entry(message.conversation_id)
            .or_default()
            .push(message);
    }

    pub async fn fail(&self, gate: Gate, failure: Failure) {
        self.state.lock().await.failures.insert(gate, failure);
    }

    pub async fn clear_failure(&self, gate: Gate) {
        self.state.lock().await.failures.remove(&gate);
    }

    pub async fn fail_send(&self, failure: Failure) {
        self.state.lock().await.send_failure = Some(failure);
    }

    pub async fn hold(&self, gate: Gate) -> GateHandle {
        let (entered_tx, entered_rx) = oneshot::channel();
        let (release_tx, release_rx) = oneshot::channel();
        self.state.lock().await.gates.insert(
            gate,
            PendingGate {
                entered: entered_tx,
                release: release_rx,
            },
        );
        GateHandle {
            entered: entered_rx,
            release: release_tx,
        }
    }

    pub async fn calls(&self) -> Vec<ApiCall> {
        self.state.lock().await.calls.clone()
    }

    pub async fn count(&self, matches: impl Fn(&ApiCall) -> bool) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|call| matches(call))
            .count()
    }

    async fn enter(&self, call: ApiCall, gate: Option<Gate>) -> Option<Failure> {
        let (pending, failure) = {
            let mut state = self.state.lock().await;
            state.calls.push(call);
            match gate {
                Some(gate) => (state.gates.remove(&gate), state.failures.get(&gate).copied()),
                None => (None, None),
            }
        };
        if let Some(pending) = pending {
            let _ = pending.entered.send(());
            let _ = pending.release.await;
        }
        failure
    }
}

#[async_trait]
impl ChatApi for FakeChatApi {
    async fn list_conversations(&self) -> SyncResult<Vec<ConversationSummary>> {
        self.enter(ApiCall::ListConversations, None).await;
        Ok(self.state.lock().await.conversations.clone())
    }

    async fn conversation_details(
        &self,
        conversation_id: ConversationId,
    ) -> SyncResult<ConversationDetails> {
        let gate = Gate::Details(conversation_id);
        if let Some(failure) = self
            .enter(ApiCall::Details(conversation_id), Some(gate))
            .await
        {
            return Err(failure.into_error(conversation_id));
        }
        self.state
            .lock()
            .await
            .details
            .get(&conversation_id)
            .cloned()
            .ok_or(SyncError::NotFound(conversation_id))
    }

    async fn list_messages(
        &self,
        conversation_id: ConversationId,
    ) -> SyncResult<Vec<MessagePayload>> {
        let gate = Gate::Messages(conversation_id);
        if let Some(failure) = self
            .enter(ApiCall::Messages(conversation_id), Some(gate))
            .await
        {
            return Err(failure.into_error(conversation_id));
        }
        Ok(self
            .state
            .lock()
            .await
            .messages
            .get(&conversation_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_messages_after(
        &self,
        conversation_id: ConversationId,
        after: MessageId,
    ) -> SyncResult<Vec<MessagePayload>> {
        let gate = Gate::MessagesAfter(conversation_id);
        if let Some(failure) = self
            .enter(ApiCall::MessagesAfter(conversation_id, after), Some(gate))
            .await
        {
            return Err(failure.into_error(conversation_id));
        }
        Ok(self
            .state
            .lock()
            .await
            .messages
            .get(&conversation_id)
            .map(|messages| {
                messages
                    .iter()
                    .filter(|message| message.id > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn send_message(&self, conversation_id: ConversationId, content: &str) -> SyncResult<()> {
        self.enter(ApiCall::Send(conversation_id, content.to_string()), None)
            .await;
        let mut state = self.state.lock().await;
        if let Some(failure) = state.send_failure {
            return Err(failure.into_error(conversation_id));
        }
        let next_id = state
            .messages
            .values()
            .flatten()
            .map(|message| message.id.0)
            .max()
            .unwrap_or(0)
            + 1;
        let mut message = text_message(next_id, conversation_id.0);
        message.sender_id = UserId(1);
        message.sender_username = Some("alice".into());
        message.content = Some(content.to_string());
        state
            .messages
            .entry(conversation_id)
            .or_default()
            .push(message);
        Ok(())
    }
}

/// `PushChannel` with a state the test sets directly. Only envelopes sent
/// while open are recorded, like the real channel.
pub(crate) struct FakeChannel {
    state: watch::Sender<ChannelState>,
    sent: Mutex<Vec<ClientEnvelope>>,
}

impl FakeChannel {
    pub fn new(state: ChannelState) -> Arc<Self> {
        let (state, _) = watch::channel(state);
        Arc::new(Self {
            state,
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_state(&self, state: ChannelState) {
        self.state.send_replace(state);
    }

    pub async fn sent(&self) -> Vec<ClientEnvelope> {
        self.sent.lock().await.clone()
    }

    pub async fn typing_sent(&self) -> Vec<(ConversationId, bool)> {
        self.sent
            .lock()
            .await
            .iter()
            .filter_map(|envelope| match envelope {
                ClientEnvelope::Typing {
                    conversation_id,
                    is_typing,
                } => Some((*conversation_id, *is_typing)),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl PushChannel for FakeChannel {
    async fn send(&self, envelope: ClientEnvelope) -> bool {
        if !self.is_open() {
            return false;
        }
        self.sent.lock().await.push(envelope);
        true
    }

    fn state(&self) -> ChannelState {
        *self.state.borrow()
    }
}

pub(crate) enum ConnectPlan {
    Accept,
    Fail,
}

/// The server's half of an accepted fake link.
pub(crate) struct ServerEnd {
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

impl ServerEnd {
    pub fn push(&self, envelope: &ServerEnvelope) {
        let text = serde_json::to_string(envelope).expect("encode server envelope");
        self.to_client.send(text).expect("client link alive");
    }

    pub async fn next_envelope(&mut self) -> ClientEnvelope {
        let text = self.from_client.recv().await.expect("client frame");
        serde_json::from_str(&text).expect("decode client envelope")
    }
}

/// Connector following a fixed plan; once the plan runs out every attempt
/// fails.
pub(crate) struct FakeConnector {
    plan: Mutex<VecDeque<ConnectPlan>>,
    attempts: Mutex<Vec<Instant>>,
    ends: mpsc::UnboundedSender<ServerEnd>,
}

impl FakeConnector {
    pub fn new(plan: Vec<ConnectPlan>) -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnd>) {
        let (ends, ends_rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                plan: Mutex::new(plan.into()),
                attempts: Mutex::new(Vec::new()),
                ends,
            }),
            ends_rx,
        )
    }

    pub async fn attempt_times(&self) -> Vec<Instant> {
        self.attempts.lock().await.clone()
    }

    pub async fn extend(&self, plan: Vec<ConnectPlan>) {
        self.plan.lock().await.extend(plan);
    }
}

#[async_trait]
impl WsConnector for FakeConnector {
    async fn connect(&self, _url: &str) -> SyncResult<WsLink> {
        self.attempts.lock().await.push(Instant::now());
        match self.plan.lock().await.pop_front() {
            Some(ConnectPlan::Accept) => {
                let (to_client, inbound) = mpsc::unbounded_channel();
                let (outbound, from_client) = mpsc::unbounded_channel();
                let _ = self.ends.send(ServerEnd {
                    to_client,
                    from_client,
                });
                Ok(WsLink { outbound, inbound })
            }
            Some(ConnectPlan::Fail) | None => {
                Err(SyncError::Transport("connection refused".into()))
            }
        }
    }
}

/// Records what the channel hands its handler.
pub(crate) struct RecordingHandler {
    envelopes: mpsc::UnboundedSender<ServerEnvelope>,
    states: Mutex<Vec<ChannelState>>,
}

impl RecordingHandler {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ServerEnvelope>) {
        let (envelopes, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                envelopes,
                states: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    pub async fn states(&self) -> Vec<ChannelState> {
        self.states.lock().await.clone()
    }
}

#[async_trait]
impl EnvelopeHandler for RecordingHandler {
    async fn on_envelope(&self, envelope: ServerEnvelope) {
        let _ = self.envelopes.send(envelope);
    }

    async fn on_state_change(&self, state: ChannelState) {
        self.states.lock().await.push(state);
    }
}

/// The core wired around a `FakeChatApi` and a `FakeChannel`, with default
/// timings.
pub(crate) struct Harness {
    pub api: Arc<FakeChatApi>,
    pub channel: Arc<FakeChannel>,
    pub state: Arc<SessionState>,
    pub directory: Arc<ConversationDirectory>,
    pub presence: Arc<PresenceTracker>,
    pub ingestor: Arc<MessageIngestor>,
    pub poll: Arc<PollFallback>,
    pub typing: Arc<TypingEmitter>,
    pub session: Arc<ConversationSession>,
    pub events_tx: broadcast::Sender<ClientEvent>,
    pub events: broadcast::Receiver<ClientEvent>,
}

impl Harness {
    pub fn new(channel_state: ChannelState) -> Self {
        let settings = SyncSettings::default();
        let (events_tx, events) = broadcast::channel(256);
        let api = FakeChatApi::new();
        let channel = FakeChannel::new(channel_state);
        let chat_api: Arc<dyn ChatApi> = api.clone();
        let push: Arc<dyn PushChannel> = channel.clone();

        let state = SessionState::new();
        let directory = ConversationDirectory::new(chat_api.clone(), events_tx.clone());
        let presence = PresenceTracker::new(settings.typing_expiry(), events_tx.clone());
        let ingestor = MessageIngestor::new(state.clone(), directory.clone(), events_tx.clone());
        let poll = PollFallback::new(
            chat_api.clone(),
            push.clone(),
            state.clone(),
            ingestor.clone(),
            settings.poll_interval(),
        );
        let typing = TypingEmitter::new(push.clone(), state.clone(), settings.typing_idle());
        let session = ConversationSession::new(SessionParts {
            state: state.clone(),
            api: chat_api,
            channel: push,
            poll: poll.clone(),
            presence: presence.clone(),
            typing: typing.clone(),
            ingestor: ingestor.clone(),
            directory: directory.clone(),
            events: events_tx.clone(),
        });

        Self {
            api,
            channel,
            state,
            directory,
            presence,
            ingestor,
            poll,
            typing,
            session,
            events_tx,
            events,
        }
    }

    /// Conversations 42 (group, history 101 and 102) and 7 (direct, empty).
    pub async fn seeded(channel_state: ChannelState) -> Self {
        let harness = Self::new(channel_state);
        harness.api.add_conversation(42, ConversationKind::Group).await;
        harness.api.add_conversation(7, ConversationKind::Direct).await;
        harness.api.store(text_message(101, 42)).await;
        harness.api.store(text_message(102, 42)).await;
        harness
    }

    pub fn drain(&mut self) -> Vec<ClientEvent> {
        drain_events(&mut self.events)
    }
}
