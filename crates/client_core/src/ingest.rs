//! Dedup and render of messages arriving from history, push and poll.

use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use shared::{domain::MessageId, protocol::MessagePayload};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, trace};

use crate::{
    directory::ConversationDirectory,
    session::{SessionState, SessionTicket},
    ClientEvent,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Push,
    Poll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Rendered,
    Duplicate,
    /// The message belongs to a conversation other than the active one, or
    /// the session moved on before it could be applied.
    NotActive,
}

/// Ids rendered in the current view. Scoped to one session epoch.
///
/// `appended` keeps every message rendered since the last full replace, so a
/// replace that raced a push can put it back.
#[derive(Debug, Default)]
struct RenderedSet {
    epoch: u64,
    ids: HashSet<MessageId>,
    appended: BTreeMap<MessageId, MessagePayload>,
}

pub struct MessageIngestor {
    session: Arc<SessionState>,
    directory: Arc<ConversationDirectory>,
    events: broadcast::Sender<ClientEvent>,
    rendered: Mutex<RenderedSet>,
    page_visible: AtomicBool,
}

impl MessageIngestor {
    pub fn new(
        session: Arc<SessionState>,
        directory: Arc<ConversationDirectory>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            session,
            directory,
            events,
            rendered: Mutex::new(RenderedSet::default()),
            page_visible: AtomicBool::new(true),
        })
    }

    pub fn set_page_visible(&self, visible: bool) {
        self.page_visible.store(visible, Ordering::Relaxed);
    }

    pub fn page_visible(&self) -> bool {
        self.page_visible.load(Ordering::Relaxed)
    }

    pub(crate) async fn reset(&self, ticket: SessionTicket) {
        let mut rendered = self.rendered.lock().await;
        rendered.epoch = ticket.epoch;
        rendered.ids.clear();
        rendered.appended.clear();
    }

    pub async fn is_rendered(&self, id: MessageId) -> bool {
        self.rendered.lock().await.ids.contains(&id)
    }

    /// Replaces the view with a full history load. Returns `false` when the
    /// ticket is stale and nothing was applied.
    pub async fn load_history(
        &self,
        ticket: SessionTicket,
        mut messages: Vec<MessagePayload>,
    ) -> bool {
        let mut rendered = self.rendered.lock().await;
        if rendered.epoch != ticket.epoch || !self.session.is_current(ticket).await {
            debug!(
                conversation_id = %ticket.conversation_id,
                "discarding stale history"
            );
            return false;
        }

        messages.retain(|message| message.conversation_id == ticket.conversation_id);
        messages.sort_by_key(|message| message.id);
        messages.dedup_by_key(|message| message.id);

        // Anything rendered past the end of this page arrived while it was in
        // flight; the watermark already covers it, so nothing else would.
        let history_max = messages.last().map_or(MessageId::UNSEEN, |message| message.id);
        let appended = std::mem::take(&mut rendered.appended);
        let carried = appended.into_values().filter(|message| message.id > history_max);
        messages.extend(carried);

        rendered.ids = messages.iter().map(|message| message.id).collect();
        if let Some(last) = messages.last() {
            self.session.advance_watermark(ticket, last.id).await;
        }
        debug!(
            conversation_id = %ticket.conversation_id,
            count = messages.len(),
            "history rendered"
        );
        let _ = self.events.send(ClientEvent::MessagesReplaced {
            conversation_id: ticket.conversation_id,
            messages,
        });
        true
    }

    /// Single message from the push channel (or a test driving it directly).
    pub async fn ingest(&self, message: MessagePayload, delivery: Delivery) -> IngestOutcome {
        let Some(ticket) = self.session.ticket().await else {
            return IngestOutcome::NotActive;
        };
        if message.conversation_id != ticket.conversation_id {
            return IngestOutcome::NotActive;
        }

        let outcome = {
            let mut rendered = self.rendered.lock().await;
            self.render(&mut rendered, ticket, message, delivery, true).await
        };
        if outcome == IngestOutcome::Rendered {
            let _ = self.directory.refresh().await;
        }
        outcome
    }

    /// Batch from a poll, applied in ascending id order under `ticket`.
    /// Returns the ids that were rendered.
    pub async fn ingest_batch(
        &self,
        ticket: SessionTicket,
        mut messages: Vec<MessagePayload>,
    ) -> Vec<MessageId> {
        messages.sort_by_key(|message| message.id);
        let mut delivered = Vec::new();
        {
            let mut rendered = self.rendered.lock().await;
            for message in messages {
                if message.conversation_id != ticket.conversation_id {
                    continue;
                }
                let id = message.id;
                let notify = delivered.is_empty();
                match self
                    .render(&mut rendered, ticket, message, Delivery::Poll, notify)
                    .await
                {
                    IngestOutcome::Rendered => delivered.push(id),
                    IngestOutcome::Duplicate => {}
                    IngestOutcome::NotActive => break,
                }
            }
        }
        if !delivered.is_empty() {
            let _ = self.directory.refresh().await;
        }
        delivered
    }

    async fn render(
        &self,
        rendered: &mut RenderedSet,
        ticket: SessionTicket,
        message: MessagePayload,
        delivery: Delivery,
        notify: bool,
    ) -> IngestOutcome {
        if rendered.epoch != ticket.epoch || !self.session.is_current(ticket).await {
            debug!(
                conversation_id = %ticket.conversation_id,
                message_id = %message.id,
                ?delivery,
                "discarding message for inactive session"
            );
            return IngestOutcome::NotActive;
        }
        if !rendered.ids.insert(message.id) {
            trace!(message_id = %message.id, ?delivery, "duplicate message skipped");
            return IngestOutcome::Duplicate;
        }

        self.session.advance_watermark(ticket, message.id).await;
        if notify && !self.page_visible() {
            let _ = self.events.send(ClientEvent::Notification(message.clone()));
        }
        rendered.appended.insert(message.id, message.clone());
        let _ = self.events.send(ClientEvent::MessageAppended {
            conversation_id: ticket.conversation_id,
            message,
        });
        IngestOutcome::Rendered
    }
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
