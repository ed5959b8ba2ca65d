//! Remote typing indicators and local typing emission.

use std::{sync::Arc, time::Duration};

use shared::{domain::ConversationId, protocol::ClientEnvelope};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
    time::{self, Instant},
};
use tracing::{debug, trace};

use crate::{channel::PushChannel, session::SessionState, ClientEvent};

/// Renders the typing line for a set of usernames, in insertion order.
pub fn describe_typing<S: AsRef<str>>(names: &[S]) -> Option<String> {
    match names {
        [] => None,
        [one] => Some(format!("{} is typing", one.as_ref())),
        [first, second] => Some(format!(
            "{} and {} are typing",
            first.as_ref(),
            second.as_ref()
        )),
        [first, rest @ ..] => Some(format!(
            "{} and {} more are typing",
            first.as_ref(),
            rest.len()
        )),
    }
}

#[derive(Debug, Default)]
struct TypingSet {
    conversation_id: Option<ConversationId>,
    entries: Vec<(String, Instant)>,
}

impl TypingSet {
    fn upsert(&mut self, username: &str, now: Instant) {
        match self.entries.iter_mut().find(|(name, _)| name == username) {
            Some(entry) => entry.1 = now,
            None => self.entries.push((username.to_string(), now)),
        }
    }

    fn remove(&mut self, username: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(name, _)| name != username);
        self.entries.len() != before
    }

    fn prune(&mut self, now: Instant, expiry: Duration) -> bool {
        let before = self.entries.len();
        self.entries
            .retain(|(_, seen)| now.saturating_duration_since(*seen) < expiry);
        self.entries.len() != before
    }

    fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// Who is typing in the active conversation. Entries expire when no refresh
/// arrives within the expiry window.
pub struct PresenceTracker {
    expiry: Duration,
    events: broadcast::Sender<ClientEvent>,
    typing: Mutex<TypingSet>,
}

impl PresenceTracker {
    pub fn new(expiry: Duration, events: broadcast::Sender<ClientEvent>) -> Arc<Self> {
        Arc::new(Self {
            expiry,
            events,
            typing: Mutex::new(TypingSet::default()),
        })
    }

    /// Rescopes the tracker; previous entries never leak into the new view.
    pub async fn reset(&self, conversation_id: Option<ConversationId>) {
        let mut typing = self.typing.lock().await;
        let had_entries = !typing.entries.is_empty();
        typing.entries.clear();
        typing.conversation_id = conversation_id;
        if let (true, Some(conversation_id)) = (had_entries, conversation_id) {
            let _ = self.events.send(ClientEvent::TypingChanged {
                conversation_id,
                description: None,
            });
        }
    }

    pub async fn note_typing(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        username: &str,
        is_typing: bool,
    ) {
        let mut typing = self.typing.lock().await;
        if typing.conversation_id != Some(conversation_id) {
            trace!(%conversation_id, username, "typing event for inactive conversation");
            return;
        }
        let now = Instant::now();
        typing.prune(now, self.expiry);
        if is_typing {
            typing.upsert(username, now);
            let tracker = Arc::clone(self);
            tokio::spawn(async move {
                time::sleep(tracker.expiry).await;
                tracker.expire(conversation_id).await;
            });
        } else if !typing.remove(username) {
            return;
        }
        self.publish(conversation_id, &typing);
    }

    pub async fn describe(&self) -> Option<String> {
        let mut typing = self.typing.lock().await;
        typing.prune(Instant::now(), self.expiry);
        describe_typing(&typing.names())
    }

    pub async fn typing_users(&self) -> Vec<String> {
        let mut typing = self.typing.lock().await;
        typing.prune(Instant::now(), self.expiry);
        typing.names().into_iter().map(str::to_string).collect()
    }

    async fn expire(&self, conversation_id: ConversationId) {
        let mut typing = self.typing.lock().await;
        if typing.conversation_id != Some(conversation_id) {
            return;
        }
        if typing.prune(Instant::now(), self.expiry) {
            debug!(%conversation_id, "typing indicator expired");
            self.publish(conversation_id, &typing);
        }
    }

    fn publish(&self, conversation_id: ConversationId, typing: &TypingSet) {
        let _ = self.events.send(ClientEvent::TypingChanged {
            conversation_id,
            description: describe_typing(&typing.names()),
        });
    }
}

#[derive(Default)]
struct EmitterState {
    typing_in: Option<ConversationId>,
    generation: u64,
    idle_timer: Option<JoinHandle<()>>,
}

/// Debounces local input into at most one `typing=true` per burst and one
/// `typing=false` after the idle gap.
pub struct TypingEmitter {
    channel: Arc<dyn PushChannel>,
    session: Arc<SessionState>,
    idle: Duration,
    state: Mutex<EmitterState>,
}

impl TypingEmitter {
    pub fn new(
        channel: Arc<dyn PushChannel>,
        session: Arc<SessionState>,
        idle: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            channel,
            session,
            idle,
            state: Mutex::new(EmitterState::default()),
        })
    }

    pub async fn input_activity(self: &Arc<Self>) {
        let snapshot = self.session.snapshot().await;
        let Some(conversation_id) = snapshot.active else {
            return;
        };
        if snapshot.unavailable || snapshot.kind.is_some_and(|kind| kind.is_singleton()) {
            return;
        }

        let mut state = self.state.lock().await;
        if state.typing_in != Some(conversation_id) {
            if let Some(previous) = state.typing_in.take() {
                self.send_typing(previous, false).await;
            }
            self.send_typing(conversation_id, true).await;
            state.typing_in = Some(conversation_id);
        }

        state.generation += 1;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        let emitter = Arc::clone(self);
        let generation = state.generation;
        state.idle_timer = Some(tokio::spawn(async move {
            time::sleep(emitter.idle).await;
            emitter.idle_elapsed(generation).await;
        }));
    }

    /// Ends any burst in progress, sending `typing=false` for it.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        state.generation += 1;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
        if let Some(conversation_id) = state.typing_in.take() {
            self.send_typing(conversation_id, false).await;
        }
    }

    pub async fn is_typing(&self) -> bool {
        self.state.lock().await.typing_in.is_some()
    }

    async fn idle_elapsed(&self, generation: u64) {
        let mut state = self.state.lock().await;
        if state.generation != generation {
            return;
        }
        state.idle_timer = None;
        if let Some(conversation_id) = state.typing_in.take() {
            self.send_typing(conversation_id, false).await;
        }
    }

    async fn send_typing(&self, conversation_id: ConversationId, is_typing: bool) {
        self.channel
            .send(ClientEnvelope::Typing {
                conversation_id,
                is_typing,
            })
            .await;
    }
}

#[cfg(test)]
#[path = "tests/presence_tests.rs"]
mod tests;
