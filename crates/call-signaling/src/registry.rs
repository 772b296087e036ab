//! Process-wide table of call sessions, one per remote peer.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use metrics::{counter, gauge};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelEvent, SignalingChannel, SignalingSink};
use crate::config::RegistryConfig;
use crate::engine::NegotiationEngineFactory;
use crate::error::RegistryError;
use crate::media::MediaSource;
use crate::protocol::{MessageKind, SignalingMessage};
use crate::session::{
    CallSessionController, SessionContext, SessionExit, SessionNotice, SessionOutcome,
    SessionSnapshot, settle,
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    /// A peer offered a call; accept or reject it through `session`.
    IncomingCall {
        peer_id: String,
        session: CallSessionController,
    },
    SessionEnded {
        peer_id: String,
        session_id: String,
        outcome: SessionOutcome,
    },
    Presence {
        user_id: String,
        online: bool,
    },
    ChannelUnavailable {
        attempts: u32,
    },
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    context: SessionContext,
    config: RegistryConfig,
    sessions: Mutex<HashMap<String, CallSessionController>>,
    notices: mpsc::UnboundedSender<SessionNotice>,
    events: broadcast::Sender<RegistryEvent>,
    shutdown: CancellationToken,
    channel: Option<Arc<SignalingChannel>>,
}

impl SessionRegistry {
    /// Builds a registry that sends through `sink` as `local_user_id`.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        local_user_id: impl Into<String>,
        sink: Arc<dyn SignalingSink>,
        media: Arc<dyn MediaSource>,
        engines: Arc<dyn NegotiationEngineFactory>,
        config: RegistryConfig,
    ) -> Self {
        Self::build(local_user_id.into(), sink, media, engines, config, None)
    }

    /// Builds a registry on top of a connected relay channel. `shutdown`
    /// also disconnects the channel.
    pub fn with_channel(
        channel: Arc<SignalingChannel>,
        media: Arc<dyn MediaSource>,
        engines: Arc<dyn NegotiationEngineFactory>,
        config: RegistryConfig,
    ) -> Self {
        let sink: Arc<dyn SignalingSink> = channel.clone();
        Self::build(
            channel.user_id().to_string(),
            sink,
            media,
            engines,
            config,
            Some(channel),
        )
    }

    fn build(
        local_user_id: String,
        sink: Arc<dyn SignalingSink>,
        media: Arc<dyn MediaSource>,
        engines: Arc<dyn NegotiationEngineFactory>,
        config: RegistryConfig,
        channel: Option<Arc<SignalingChannel>>,
    ) -> Self {
        let (notices_tx, notices_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Arc::new(RegistryInner {
            context: SessionContext {
                local_user_id,
                sink,
                media,
                engines,
                config: config.session.clone(),
            },
            config,
            sessions: Mutex::new(HashMap::new()),
            notices: notices_tx,
            events,
            shutdown: CancellationToken::new(),
            channel,
        });
        tokio::spawn(supervise(Arc::downgrade(&inner), notices_rx));
        Self { inner }
    }

    pub fn local_user_id(&self) -> &str {
        &self.inner.context.local_user_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.inner.events.subscribe()
    }

    /// The live session with `peer_id`, if any.
    pub fn session(&self, peer_id: &str) -> Option<CallSessionController> {
        self.inner
            .sessions
            .lock()
            .get(peer_id)
            .filter(|session| !session.state().is_terminal())
            .cloned()
    }

    pub fn snapshots(&self) -> Vec<SessionSnapshot> {
        self.inner
            .sessions
            .lock()
            .values()
            .map(CallSessionController::snapshot)
            .collect()
    }

    pub fn live_sessions(&self) -> usize {
        live_count(&self.inner.sessions.lock())
    }

    /// Returns the live session with `peer_id`, or admits a new idle one.
    pub fn acquire(&self, peer_id: &str) -> Result<CallSessionController, RegistryError> {
        self.ensure_running()?;
        let mut sessions = self.inner.sessions.lock();
        if let Some(existing) = sessions.get(peer_id) {
            if !existing.state().is_terminal() {
                return Ok(existing.clone());
            }
        }
        self.admit(&mut sessions, peer_id)
    }

    /// Removes the entry for `peer_id` if its session has terminated.
    pub fn release(&self, peer_id: &str) -> bool {
        let mut sessions = self.inner.sessions.lock();
        let terminal = sessions
            .get(peer_id)
            .is_some_and(|session| session.state().is_terminal());
        if terminal {
            sessions.remove(peer_id);
            gauge!("call_sessions_live", live_count(&sessions) as f64);
        }
        terminal
    }

    /// Admits and starts an outbound call to `peer_id`.
    ///
    /// Fails with [`RegistryError::Busy`] when a live session with the peer
    /// exists or the session limit is reached.
    pub async fn initiate(&self, peer_id: &str) -> Result<CallSessionController, RegistryError> {
        self.ensure_running()?;
        let (session, reply) = {
            let mut sessions = self.inner.sessions.lock();
            if sessions
                .get(peer_id)
                .is_some_and(|session| !session.state().is_terminal())
            {
                tracing::info!(target = "registry", peer_id, "call refused: session already live");
                return Err(RegistryError::Busy(format!("already in a call with {peer_id}")));
            }
            let session = self.admit(&mut sessions, peer_id)?;
            // Queued before the lock is released so a racing offer from the
            // peer is handled as glare.
            let reply = session.queue_initiate()?;
            (session, reply)
        };
        settle(reply).await?;
        Ok(session)
    }

    /// Routes one inbound frame to its session.
    pub fn dispatch(&self, message: SignalingMessage) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        let local = self.local_user_id();
        if message.sender_id == local || !message.is_addressed_to(local) {
            tracing::debug!(
                target = "registry",
                kind = %message.kind,
                sender_id = %message.sender_id,
                target_id = ?message.target_id,
                "frame not for this user dropped"
            );
            return;
        }

        match message.kind {
            MessageKind::UserJoined | MessageKind::UserLeft => {
                self.emit(RegistryEvent::Presence {
                    user_id: message.sender_id.clone(),
                    online: message.kind == MessageKind::UserJoined,
                });
                return;
            }
            _ => {}
        }

        if let Some(session) = self.session(&message.sender_id) {
            if session.deliver(message).is_err() {
                tracing::debug!(target = "registry", session_id = %session.session_id(), "session closed before delivery");
            }
            return;
        }

        if message.kind == MessageKind::Offer {
            self.admit_offer(message);
            return;
        }

        counter!("signaling_messages_dropped_total", 1, "kind" => message.kind.as_str(), "direction" => "registry");
        tracing::warn!(
            target = "registry",
            kind = %message.kind,
            sender_id = %message.sender_id,
            "no session for frame; dropped"
        );
    }

    /// Consumes channel events until the stream ends or the registry shuts
    /// down.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<ChannelEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                ChannelEvent::Message(message) => self.dispatch(message),
                ChannelEvent::Reconnected => {
                    tracing::warn!(target = "registry", "relay reconnected; live calls cannot resume");
                    self.drop_all();
                }
                ChannelEvent::Unavailable { attempts } => {
                    tracing::error!(target = "registry", attempts, "relay unavailable; dropping live calls");
                    self.drop_all();
                    self.emit(RegistryEvent::ChannelUnavailable { attempts });
                }
                ChannelEvent::Disconnected { reason } => {
                    tracing::info!(target = "registry", reason = %reason, "relay connection lost");
                }
                other => {
                    tracing::debug!(target = "registry", event = ?other, "channel event");
                }
            }
        }
        tracing::debug!(target = "registry", "dispatch loop stopped");
    }

    /// Hangs up every live session, waits for their teardown and closes the
    /// relay channel.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        self.inner.shutdown.cancel();
        let live = self.live_handles();
        for session in &live {
            session.end_call();
        }
        for session in &live {
            session.closed().await;
        }
        if let Some(channel) = &self.inner.channel {
            channel.disconnect();
        }
        tracing::info!(target = "registry", ended = live.len(), "registry shut down");
    }

    fn admit_offer(&self, message: SignalingMessage) {
        let peer_id = message.sender_id.clone();
        let admitted = {
            let mut sessions = self.inner.sessions.lock();
            self.admit(&mut sessions, &peer_id)
        };
        match admitted {
            Ok(session) => {
                if session.deliver(message).is_err() {
                    tracing::debug!(target = "registry", session_id = %session.session_id(), "session closed before delivery");
                }
            }
            Err(err) => {
                tracing::info!(target = "registry", peer_id = %peer_id, error = %err, "incoming call refused");
                let reply = SignalingMessage::call_rejected(self.local_user_id(), &peer_id, "busy");
                if let Err(err) = self.inner.context.sink.send(reply) {
                    tracing::debug!(target = "registry", error = %err, "busy reply not sent");
                }
            }
        }
    }

    /// Inserts a new idle session. Caller holds the table lock.
    fn admit(
        &self,
        sessions: &mut HashMap<String, CallSessionController>,
        peer_id: &str,
    ) -> Result<CallSessionController, RegistryError> {
        if live_count(sessions) >= self.inner.config.max_sessions {
            counter!("call_sessions_refused_total", 1, "reason" => "capacity");
            return Err(RegistryError::Busy(format!(
                "session limit of {} reached",
                self.inner.config.max_sessions
            )));
        }
        let session = CallSessionController::spawn(
            self.inner.context.clone(),
            peer_id,
            Some(self.inner.notices.clone()),
        );
        sessions.insert(peer_id.to_string(), session.clone());
        gauge!("call_sessions_live", live_count(sessions) as f64);
        tracing::debug!(target = "registry", peer_id, session_id = %session.session_id(), "session admitted");
        Ok(session)
    }

    fn drop_all(&self) {
        for session in self.live_handles() {
            session.channel_lost();
        }
    }

    fn live_handles(&self) -> Vec<CallSessionController> {
        self.inner
            .sessions
            .lock()
            .values()
            .filter(|session| !session.state().is_terminal())
            .cloned()
            .collect()
    }

    fn ensure_running(&self) -> Result<(), RegistryError> {
        if self.inner.shutdown.is_cancelled() {
            Err(RegistryError::Closed)
        } else {
            Ok(())
        }
    }

    fn emit(&self, event: RegistryEvent) {
        let _ = self.inner.events.send(event);
    }
}

fn live_count(sessions: &HashMap<String, CallSessionController>) -> usize {
    sessions
        .values()
        .filter(|session| !session.state().is_terminal())
        .count()
}

/// Announces parked offers and removes sessions from the table as their
/// actors stop.
async fn supervise(registry: Weak<RegistryInner>, mut notices: mpsc::UnboundedReceiver<SessionNotice>) {
    while let Some(notice) = notices.recv().await {
        let Some(inner) = registry.upgrade() else {
            break;
        };
        match notice {
            SessionNotice::IncomingOffer {
                session_id,
                peer_id,
            } => {
                let session = inner
                    .sessions
                    .lock()
                    .get(&peer_id)
                    .filter(|session| session.session_id() == session_id)
                    .cloned();
                match session {
                    Some(session) => {
                        tracing::info!(target = "registry", peer_id = %peer_id, session_id = %session_id, "incoming call");
                        let _ = inner
                            .events
                            .send(RegistryEvent::IncomingCall { peer_id, session });
                    }
                    None => {
                        tracing::debug!(target = "registry", peer_id = %peer_id, session_id = %session_id, "offer for a released session not announced");
                    }
                }
            }
            SessionNotice::Exited(exit) => release_exited(&inner, exit),
        }
    }
}

fn release_exited(inner: &RegistryInner, exit: SessionExit) {
    {
        let mut sessions = inner.sessions.lock();
        let current = sessions
            .get(&exit.peer_id)
            .is_some_and(|session| session.session_id() == exit.session_id);
        if current {
            sessions.remove(&exit.peer_id);
        }
        gauge!("call_sessions_live", live_count(&sessions) as f64);
    }
    tracing::debug!(
        target = "registry",
        peer_id = %exit.peer_id,
        session_id = %exit.session_id,
        outcome = %exit.outcome,
        "session released"
    );
    let _ = inner.events.send(RegistryEvent::SessionEnded {
        peer_id: exit.peer_id,
        session_id: exit.session_id,
        outcome: exit.outcome,
    });
}
