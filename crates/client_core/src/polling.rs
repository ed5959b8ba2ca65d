use std::{sync::Arc, time::Duration};

use tokio::{
    sync::Mutex,
    task::JoinHandle,
    time::{self, Instant, MissedTickBehavior},
};
use tracing::{debug, trace, warn};

use crate::{
    api::ChatApi, channel::PushChannel, ingest::MessageIngestor, session::SessionState,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Push channel is open; no request was made.
    ChannelOpen,
    NoActiveConversation,
    Empty,
    Delivered(usize),
    /// The session moved on while the request was in flight.
    Stale,
    Failed,
}

/// Catch-up fetch used whenever the push channel is not open. The timer runs
/// for the life of an active conversation; each tick decides for itself
/// whether to fetch.
pub struct PollFallback {
    api: Arc<dyn ChatApi>,
    channel: Arc<dyn PushChannel>,
    session: Arc<SessionState>,
    ingestor: Arc<MessageIngestor>,
    interval: Duration,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl PollFallback {
    pub fn new(
        api: Arc<dyn ChatApi>,
        channel: Arc<dyn PushChannel>,
        session: Arc<SessionState>,
        ingestor: Arc<MessageIngestor>,
        interval: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            channel,
            session,
            ingestor,
            interval,
            timer: Mutex::new(None),
        })
    }

    /// (Re)arms the timer. Any previous timer is cancelled first.
    pub async fn start(self: &Arc<Self>) {
        let mut timer = self.timer.lock().await;
        if let Some(previous) = timer.take() {
            previous.abort();
        }
        let poll = Arc::clone(self);
        *timer = Some(tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + poll.interval, poll.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                poll.tick().await;
            }
        }));
        debug!(interval_ms = self.interval.as_millis() as u64, "poll fallback armed");
    }

    pub async fn stop(&self) {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.abort();
            debug!("poll fallback stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.timer
            .lock()
            .await
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }

    pub async fn tick(&self) -> PollOutcome {
        if self.channel.is_open() {
            trace!("push channel open; skipping poll");
            return PollOutcome::ChannelOpen;
        }
        let Some((ticket, watermark)) = self.session.poll_target().await else {
            return PollOutcome::NoActiveConversation;
        };

        let messages = match self
            .api
            .list_messages_after(ticket.conversation_id, watermark)
            .await
        {
            Ok(messages) => messages,
            Err(err) => {
                warn!(conversation_id = %ticket.conversation_id, %err, "poll failed");
                return PollOutcome::Failed;
            }
        };
        if !self.session.is_current(ticket).await {
            debug!(
                conversation_id = %ticket.conversation_id,
                count = messages.len(),
                "discarding stale poll result"
            );
            return PollOutcome::Stale;
        }
        if messages.is_empty() {
            return PollOutcome::Empty;
        }

        let delivered = self.ingestor.ingest_batch(ticket, messages).await;
        PollOutcome::Delivered(delivered.len())
    }
}

#[cfg(test)]
#[path = "tests/polling_tests.rs"]
mod tests;
