//! Realtime subscription state machine and its async driver.
//!
//! ```text
//! Disconnected --Start/NetworkOnline--> Connecting --Subscribed--> Subscribed
//!      ^                                  |   ^                        |
//!      |                         ChannelError  ReconnectTimer    ChannelError
//!      |                                  v   |                        |
//!      +--- attempts exhausted ------ Reconnecting{attempt, delay} <---+
//! ```
//!
//! [`ChannelMachine`] is pure: it maps an [`Input`] to a state change plus
//! a list of [`Command`]s. [`RealtimeManager`] owns the side effects
//! (transport, timers, notices) and feeds results back in as inputs.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::invalidation::InvalidationHandler;
use super::protocol::ChannelMessage;
use super::transport::{ChannelConnection, ChannelTransport, Inbound};
use crate::cache_keys;
use crate::error::ChannelError;
use crate::network::NetworkStatus;
use crate::notify::{Notice, Notifier};

pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ChannelState {
    /// Idle. `exhausted` is set after the reconnect budget ran out; only an
    /// online transition (or an explicit start) leaves it.
    Disconnected { exhausted: bool },
    Connecting,
    Subscribed,
    Reconnecting { attempt: u32, delay_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Start,
    Subscribed,
    ChannelError(ChannelError),
    ReconnectTimer,
    NetworkOnline,
    NetworkOffline,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Open,
    Close,
    ScheduleReconnect(Duration),
    CancelReconnect,
    NotifyUnavailable,
}

#[derive(Debug, Clone)]
pub struct ChannelMachine {
    state: ChannelState,
    attempts: u32,
    max_attempts: u32,
    initial_delay: Duration,
}

impl ChannelMachine {
    pub fn new(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            state: ChannelState::Disconnected { exhausted: false },
            attempts: 0,
            max_attempts,
            initial_delay,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// `initial_delay * 2^attempt`, saturating.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor)
    }

    pub fn step(&mut self, input: Input) -> Vec<Command> {
        use ChannelState as S;

        match (self.state, input) {
            (S::Disconnected { .. }, Input::Start | Input::NetworkOnline) => {
                self.attempts = 0;
                self.state = S::Connecting;
                vec![Command::Open]
            }
            (S::Connecting, Input::Subscribed) => {
                self.attempts = 0;
                self.state = S::Subscribed;
                Vec::new()
            }
            (S::Connecting | S::Subscribed, Input::ChannelError(err)) => {
                if self.attempts < self.max_attempts {
                    let delay = self.backoff(self.attempts);
                    self.attempts += 1;
                    debug!(attempt = self.attempts, delay_ms = delay.as_millis() as u64, error = %err, "scheduling channel reconnect");
                    self.state = S::Reconnecting {
                        attempt: self.attempts,
                        delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    };
                    vec![Command::Close, Command::ScheduleReconnect(delay)]
                } else {
                    self.state = S::Disconnected { exhausted: true };
                    vec![Command::Close, Command::NotifyUnavailable]
                }
            }
            (S::Reconnecting { .. }, Input::ReconnectTimer) => {
                self.state = S::Connecting;
                vec![Command::Open]
            }
            (S::Connecting | S::Subscribed | S::Reconnecting { .. }, Input::NetworkOffline) => {
                self.attempts = 0;
                self.state = S::Disconnected { exhausted: false };
                vec![Command::Close, Command::CancelReconnect]
            }
            (_, Input::Stop) => {
                self.state = S::Disconnected { exhausted: false };
                vec![Command::Close, Command::CancelReconnect]
            }
            // Everything else is stale (a late timer, a duplicate
            // subscribe ack, an error on an already-closed channel).
            _ => Vec::new(),
        }
    }
}

impl Default for ChannelMachine {
    fn default() -> Self {
        Self::new(MAX_RECONNECT_ATTEMPTS, INITIAL_RECONNECT_DELAY)
    }
}

pub struct RealtimeManager<T: ChannelTransport> {
    transport: T,
    handler: Arc<InvalidationHandler>,
    notifier: Notifier,
    machine: ChannelMachine,
    state_tx: watch::Sender<ChannelState>,
}

impl<T: ChannelTransport> RealtimeManager<T> {
    pub fn new(transport: T, handler: Arc<InvalidationHandler>, notifier: Notifier) -> Self {
        Self::with_machine(transport, handler, notifier, ChannelMachine::default())
    }

    pub fn with_machine(
        transport: T,
        handler: Arc<InvalidationHandler>,
        notifier: Notifier,
        machine: ChannelMachine,
    ) -> Self {
        let (state_tx, _) = watch::channel(machine.state());
        Self {
            transport,
            handler,
            notifier,
            machine,
            state_tx,
        }
    }

    pub fn state(&self) -> watch::Receiver<ChannelState> {
        self.state_tx.subscribe()
    }

    /// Drive the channel until `cancel` fires. Starts connecting right away
    /// when the network is up; otherwise waits for the online transition.
    pub async fn run(mut self, mut network: watch::Receiver<NetworkStatus>, cancel: CancellationToken) {
        let tables = cache_keys::watched_tables();
        let mut conn: Option<ChannelConnection> = None;
        let mut reconnect_at: Option<Instant> = None;
        let mut inputs: VecDeque<Input> = VecDeque::new();
        let mut network_open = true;

        let online_at_start = network.borrow_and_update().online;
        if online_at_start {
            inputs.push_back(Input::Start);
        }
        info!(tables = tables.len(), "Realtime manager started");

        loop {
            while let Some(input) = inputs.pop_front() {
                for command in self.machine.step(input) {
                    match command {
                        Command::Open => match self.transport.open(&tables).await {
                            Ok(c) => conn = Some(c),
                            Err(e) => {
                                warn!(error = %e, "Realtime channel open failed");
                                inputs.push_back(Input::ChannelError(e));
                            }
                        },
                        Command::Close => conn = None,
                        Command::ScheduleReconnect(delay) => {
                            info!(delay_ms = delay.as_millis() as u64, "Realtime reconnect scheduled");
                            reconnect_at = Some(Instant::now() + delay);
                        }
                        Command::CancelReconnect => reconnect_at = None,
                        Command::NotifyUnavailable => {
                            warn!("Realtime reconnect attempts exhausted");
                            self.notifier.notify(Notice::RealtimeUnavailable);
                        }
                    }
                }
            }
            self.state_tx.send_replace(self.machine.state());

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.machine.step(Input::Stop);
                    self.state_tx.send_replace(self.machine.state());
                    break;
                }
                msg = next_inbound(&mut conn) => match msg {
                    Some(Ok(ChannelMessage::Subscribed)) => inputs.push_back(Input::Subscribed),
                    Some(Ok(ChannelMessage::Heartbeat)) => {}
                    Some(Ok(ChannelMessage::Change(event))) => {
                        self.handler.handle(&event);
                    }
                    Some(Ok(ChannelMessage::Error(message))) => {
                        warn!(%message, "Realtime channel error from server");
                        inputs.push_back(Input::ChannelError(ChannelError::Stream(message)));
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "Realtime channel dropped");
                        inputs.push_back(Input::ChannelError(e));
                    }
                    None => inputs.push_back(Input::ChannelError(ChannelError::Closed)),
                },
                _ = sleep_until_opt(reconnect_at) => {
                    reconnect_at = None;
                    inputs.push_back(Input::ReconnectTimer);
                }
                changed = network.changed(), if network_open => {
                    if changed.is_err() {
                        network_open = false;
                        continue;
                    }
                    let online = network.borrow_and_update().online;
                    inputs.push_back(if online { Input::NetworkOnline } else { Input::NetworkOffline });
                }
            }
        }
        info!("Realtime manager stopped");
    }
}

async fn next_inbound(conn: &mut Option<ChannelConnection>) -> Option<Inbound> {
    match conn {
        Some(c) => c.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}
