//! Per-call state machine.
//!
//! Each [`CallSessionController`] is a cheap handle onto one actor task. The
//! actor is the only code that touches session state; intents, inbound
//! frames and engine callbacks all reach it through its queue.

mod actor;
mod ice_buffer;
mod state;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use ice_buffer::IceCandidateBuffer;
pub use state::SessionState;

use crate::channel::SignalingSink;
use crate::config::SessionConfig;
use crate::engine::NegotiationEngineFactory;
use crate::error::SessionError;
use crate::media::{MediaHandle, MediaSource, RemoteTrack};
use crate::protocol::SignalingMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outbound,
    Inbound,
}

/// Why a session reached `Ended`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallEndReason {
    LocalHangup,
    RemoteHangup,
    Declined,
}

/// Why a session reached `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallFailure {
    MediaUnavailable,
    NegotiationFailure,
    NegotiationTimeout,
    Rejected,
    CallDropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionOutcome {
    Ended(CallEndReason),
    Failed(CallFailure),
}

impl SessionOutcome {
    pub fn label(self) -> &'static str {
        match self {
            SessionOutcome::Ended(CallEndReason::LocalHangup) => "local_hangup",
            SessionOutcome::Ended(CallEndReason::RemoteHangup) => "remote_hangup",
            SessionOutcome::Ended(CallEndReason::Declined) => "declined",
            SessionOutcome::Failed(CallFailure::MediaUnavailable) => "media_unavailable",
            SessionOutcome::Failed(CallFailure::NegotiationFailure) => "negotiation_failure",
            SessionOutcome::Failed(CallFailure::NegotiationTimeout) => "negotiation_timeout",
            SessionOutcome::Failed(CallFailure::Rejected) => "rejected",
            SessionOutcome::Failed(CallFailure::CallDropped) => "call_dropped",
        }
    }
}

impl fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// What the UI layer observes about one call.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub session_id: String,
    pub peer_id: String,
    pub direction: Option<CallDirection>,
    pub state: SessionState,
    pub reason: Option<SessionOutcome>,
    pub local_media: Option<MediaHandle>,
    pub remote_tracks: Vec<RemoteTrack>,
    pub created_at: DateTime<Utc>,
}

/// Collaborators shared by every session of one registry.
#[derive(Clone)]
pub struct SessionContext {
    pub local_user_id: String,
    pub sink: Arc<dyn SignalingSink>,
    pub media: Arc<dyn MediaSource>,
    pub engines: Arc<dyn NegotiationEngineFactory>,
    pub config: SessionConfig,
}

/// Reported once when a session's actor stops.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionExit {
    pub session_id: String,
    pub peer_id: String,
    pub outcome: SessionOutcome,
}

/// Lifecycle reports a session sends to whoever spawned it.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// A remote offer moved the session from `Idle` to `ReceivedOffer`.
    IncomingOffer { session_id: String, peer_id: String },
    Exited(SessionExit),
}

type Reply = Result<(), SessionError>;

pub(crate) enum Command {
    Initiate(oneshot::Sender<Reply>),
    Accept(oneshot::Sender<Reply>),
    Reject(oneshot::Sender<Reply>),
    Inbound(SignalingMessage),
}

#[derive(Clone)]
pub struct CallSessionController {
    inner: Arc<Handle>,
}

struct Handle {
    session_id: String,
    peer_id: String,
    commands: mpsc::UnboundedSender<Command>,
    hangup: CancellationToken,
    dropped: CancellationToken,
    snapshot: watch::Receiver<SessionSnapshot>,
}

impl CallSessionController {
    /// Starts an idle session with `peer_id`. `notices` hears about parked
    /// offers and the final outcome.
    pub fn spawn(
        context: SessionContext,
        peer_id: impl Into<String>,
        notices: Option<mpsc::UnboundedSender<SessionNotice>>,
    ) -> Self {
        let peer_id = peer_id.into();
        let session_id = Uuid::new_v4().to_string();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let hangup = CancellationToken::new();
        let dropped = CancellationToken::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot {
            session_id: session_id.clone(),
            peer_id: peer_id.clone(),
            direction: None,
            state: SessionState::Idle,
            reason: None,
            local_media: None,
            remote_tracks: Vec::new(),
            created_at: Utc::now(),
        });

        tokio::spawn(
            actor::SessionActor::new(
                context,
                commands_rx,
                snapshot_tx,
                hangup.clone(),
                dropped.clone(),
                notices,
            )
            .run(),
        );

        Self {
            inner: Arc::new(Handle {
                session_id,
                peer_id,
                commands: commands_tx,
                hangup,
                dropped,
                snapshot: snapshot_rx,
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.inner.snapshot.clone()
    }

    /// Places the call. Valid only while `Idle`; progress is reported
    /// through [`subscribe`](Self::subscribe).
    pub async fn initiate(&self) -> Result<(), SessionError> {
        self.request(Command::Initiate).await
    }

    /// Answers the offer parked in `ReceivedOffer`.
    pub async fn accept_pending_offer(&self) -> Result<(), SessionError> {
        self.request(Command::Accept).await
    }

    /// Declines the offer parked in `ReceivedOffer`.
    pub async fn reject_pending_offer(&self) -> Result<(), SessionError> {
        self.request(Command::Reject).await
    }

    /// Hangs up. Interrupts any in-flight step; repeated calls are no-ops.
    pub fn end_call(&self) {
        if !self.inner.hangup.is_cancelled() {
            tracing::debug!(target = "session", session_id = %self.session_id(), "end call requested");
            self.inner.hangup.cancel();
        }
    }

    /// Waits until the session reaches `Ended` or `Failed`.
    pub async fn closed(&self) -> SessionOutcome {
        let mut updates = self.subscribe();
        loop {
            if let Some(outcome) = terminal_outcome(&updates.borrow_and_update()) {
                return outcome;
            }
            if updates.changed().await.is_err() {
                let last = updates.borrow();
                return terminal_outcome(&last)
                    .unwrap_or(SessionOutcome::Failed(CallFailure::CallDropped));
            }
        }
    }

    pub(crate) fn deliver(&self, message: SignalingMessage) -> Result<(), SessionError> {
        self.inner
            .commands
            .send(Command::Inbound(message))
            .map_err(|_| SessionError::Closed)
    }

    /// The relay connection carrying this call was lost.
    pub(crate) fn channel_lost(&self) {
        self.inner.dropped.cancel();
    }

    /// Queues `Initiate` without waiting, so it lands ahead of any frame
    /// delivered afterwards. Await the result with [`settle`].
    pub(crate) fn queue_initiate(&self) -> Result<oneshot::Receiver<Reply>, SessionError> {
        self.submit(Command::Initiate)
    }

    fn submit(
        &self,
        command: impl FnOnce(oneshot::Sender<Reply>) -> Command,
    ) -> Result<oneshot::Receiver<Reply>, SessionError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner
            .commands
            .send(command(reply_tx))
            .map_err(|_| SessionError::Closed)?;
        Ok(reply_rx)
    }

    async fn request(
        &self,
        command: impl FnOnce(oneshot::Sender<Reply>) -> Command,
    ) -> Result<(), SessionError> {
        settle(self.submit(command)?).await
    }
}

impl fmt::Debug for CallSessionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallSessionController")
            .field("session_id", &self.session_id())
            .field("peer_id", &self.peer_id())
            .field("state", &self.state())
            .finish()
    }
}

pub(crate) async fn settle(reply: oneshot::Receiver<Reply>) -> Result<(), SessionError> {
    reply.await.map_err(|_| SessionError::Closed)?
}

fn terminal_outcome(snapshot: &SessionSnapshot) -> Option<SessionOutcome> {
    if snapshot.state.is_terminal() {
        snapshot.reason
    } else {
        None
    }
}
