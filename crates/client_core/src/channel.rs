//! Push channel lifecycle: connect, reconnect with linear backoff, framing.

use std::{
    sync::{Arc, Weak},
    time::Duration,
};

use async_trait::async_trait;
use shared::protocol::{ClientEnvelope, ServerEnvelope};
use tokio::{
    sync::{mpsc, watch, Mutex, RwLock},
    task::JoinHandle,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::transport::{WsConnector, WsLink};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Connecting,
    Open,
    ClosedRetrying,
    ClosedGivenUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    pub attempts: u32,
    pub max_attempts: u32,
}

impl ReconnectState {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            attempts: 0,
            max_attempts,
        }
    }

    pub fn record_open(&mut self) {
        self.attempts = 0;
    }

    /// Counts one close event. Returns the retry number to schedule, or
    /// `None` once the ceiling is reached.
    pub fn record_close(&mut self) -> Option<u32> {
        self.attempts = self.attempts.saturating_add(1);
        (self.attempts < self.max_attempts).then_some(self.attempts)
    }

    pub fn exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

pub fn retry_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(attempt)
}

/// Sole consumer of inbound frames and channel transitions.
#[async_trait]
pub trait EnvelopeHandler: Send + Sync {
    async fn on_envelope(&self, envelope: ServerEnvelope);
    async fn on_state_change(&self, _state: ChannelState) {}
}

/// What the rest of the core needs from the push channel.
#[async_trait]
pub trait PushChannel: Send + Sync {
    /// Best effort: returns `false` (after logging) when the envelope was dropped.
    async fn send(&self, envelope: ClientEnvelope) -> bool;
    fn state(&self) -> ChannelState;

    fn is_open(&self) -> bool {
        self.state() == ChannelState::Open
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub url: String,
    pub base_delay: Duration,
    pub max_attempts: u32,
    pub ping_interval: Option<Duration>,
}

struct Outbound {
    generation: u64,
    tx: mpsc::UnboundedSender<String>,
}

struct ChannelInner {
    reconnect: ReconnectState,
    generation: u64,
    outbound: Option<Outbound>,
    supervisor: Option<JoinHandle<()>>,
}

pub struct ConnectionChannel {
    connector: Arc<dyn WsConnector>,
    options: ChannelOptions,
    handler: RwLock<Option<Weak<dyn EnvelopeHandler>>>,
    inner: Mutex<ChannelInner>,
    state_tx: watch::Sender<ChannelState>,
}

impl ConnectionChannel {
    pub fn new(connector: Arc<dyn WsConnector>, options: ChannelOptions) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ChannelState::Idle);
        Arc::new(Self {
            connector,
            inner: Mutex::new(ChannelInner {
                reconnect: ReconnectState::new(options.max_attempts),
                generation: 0,
                outbound: None,
                supervisor: None,
            }),
            options,
            handler: RwLock::new(None),
            state_tx,
        })
    }

    /// Registers the handler that receives every inbound envelope. Held
    /// weakly; the owner keeps it alive.
    pub async fn on_envelope(&self, handler: &Arc<dyn EnvelopeHandler>) {
        *self.handler.write().await = Some(Arc::downgrade(handler));
    }

    pub fn subscribe(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    pub async fn reconnect_state(&self) -> ReconnectState {
        self.inner.lock().await.reconnect
    }

    pub async fn generation(&self) -> u64 {
        self.inner.lock().await.generation
    }

    pub async fn open(self: &Arc<Self>) {
        let mut inner = self.inner.lock().await;
        if inner
            .supervisor
            .as_ref()
            .is_some_and(|supervisor| !supervisor.is_finished())
        {
            debug!("push channel already running");
            return;
        }
        if self.state() == ChannelState::ClosedGivenUp {
            debug!("push channel gave up; waiting for an explicit reconnect");
            return;
        }
        let channel = Arc::clone(self);
        inner.supervisor = Some(tokio::spawn(async move { channel.supervise().await }));
    }

    /// Leaves any state (including `ClosedGivenUp`), zeroes the attempt
    /// counter and connects again.
    pub async fn reconnect(self: &Arc<Self>) {
        self.stop_supervisor().await;
        self.set_state(ChannelState::Idle).await;
        self.open().await;
    }

    pub async fn close(&self) {
        self.stop_supervisor().await;
        self.set_state(ChannelState::Idle).await;
    }

    async fn stop_supervisor(&self) {
        let mut inner = self.inner.lock().await;
        if let Some(supervisor) = inner.supervisor.take() {
            supervisor.abort();
        }
        inner.outbound = None;
        inner.reconnect.record_open();
    }

    async fn supervise(self: Arc<Self>) {
        loop {
            let generation = {
                let mut inner = self.inner.lock().await;
                inner.generation += 1;
                inner.generation
            };
            self.set_state(ChannelState::Connecting).await;

            match self.connector.connect(&self.options.url).await {
                Ok(link) => self.run_link(generation, link).await,
                Err(err) => warn!(generation, %err, "push channel connect failed"),
            }

            let retry = {
                let mut inner = self.inner.lock().await;
                inner.outbound = None;
                inner.reconnect.record_close()
            };
            match retry {
                Some(attempt) => {
                    let delay = retry_delay(self.options.base_delay, attempt);
                    info!(
                        attempt,
                        max_attempts = self.options.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        "push channel closed; scheduling reconnect"
                    );
                    self.set_state(ChannelState::ClosedRetrying).await;
                    time::sleep(delay).await;
                }
                None => {
                    warn!(
                        max_attempts = self.options.max_attempts,
                        "push channel reconnect attempts exhausted; polling takes over"
                    );
                    self.set_state(ChannelState::ClosedGivenUp).await;
                    break;
                }
            }
        }
    }

    async fn run_link(&self, generation: u64, link: WsLink) {
        let WsLink {
            outbound,
            mut inbound,
        } = link;
        {
            let mut inner = self.inner.lock().await;
            inner.reconnect.record_open();
            inner.outbound = Some(Outbound {
                generation,
                tx: outbound,
            });
        }
        info!(generation, "push channel open");
        self.set_state(ChannelState::Open).await;

        let mut keepalive = self.options.ping_interval.map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });

        loop {
            tokio::select! {
                frame = inbound.recv() => match frame {
                    Some(text) => self.deliver(generation, &text).await,
                    None => break,
                },
                _ = next_keepalive(&mut keepalive) => {
                    self.send(ClientEnvelope::Ping).await;
                }
            }
        }
        info!(generation, "push channel link closed");
    }

    async fn deliver(&self, generation: u64, text: &str) {
        let envelope = match serde_json::from_str::<ServerEnvelope>(text) {
            Ok(envelope) => envelope,
            Err(err) => {
                warn!(generation, %err, "dropping malformed server envelope");
                return;
            }
        };
        if let Some(handler) = self.handler().await {
            handler.on_envelope(envelope).await;
        }
    }

    async fn handler(&self) -> Option<Arc<dyn EnvelopeHandler>> {
        self.handler.read().await.as_ref().and_then(Weak::upgrade)
    }

    async fn set_state(&self, state: ChannelState) {
        let previous = self.state_tx.send_replace(state);
        if previous == state {
            return;
        }
        debug!(?previous, ?state, "push channel state changed");
        if let Some(handler) = self.handler().await {
            handler.on_state_change(state).await;
        }
    }
}

async fn next_keepalive(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[async_trait]
impl PushChannel for ConnectionChannel {
    async fn send(&self, envelope: ClientEnvelope) -> bool {
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(err) => {
                warn!(kind = envelope.kind(), %err, "failed to encode envelope");
                return false;
            }
        };
        let inner = self.inner.lock().await;
        let Some(outbound) = inner.outbound.as_ref().filter(|_| self.is_open()) else {
            debug!(kind = envelope.kind(), "dropping envelope; push channel not open");
            return false;
        };
        if outbound.tx.send(text).is_err() {
            debug!(
                kind = envelope.kind(),
                generation = outbound.generation,
                "dropping envelope; link already closed"
            );
            return false;
        }
        true
    }

    fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
