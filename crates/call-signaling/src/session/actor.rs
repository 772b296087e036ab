use std::future::Future;
use std::sync::Arc;

use metrics::counter;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{
    CallDirection, CallEndReason, CallFailure, Command, IceCandidateBuffer, SessionContext,
    SessionExit, SessionNotice, SessionOutcome, SessionSnapshot, SessionState,
};
use crate::engine::{EngineEvent, NegotiationEngine};
use crate::error::{NegotiationError, SessionError};
use crate::media::MediaHandle;
use crate::protocol::{IceCandidate, MessageKind, SessionDescription, SignalingMessage};

/// Something that cut an in-flight step short.
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Hangup,
    ChannelLost,
    Timeout,
}

/// Why a flow stopped before completing.
enum Halt {
    Interrupted(Interrupt),
    /// The session already reached a terminal state.
    Terminated,
}

impl From<Interrupt> for Halt {
    fn from(interrupt: Interrupt) -> Self {
        Halt::Interrupted(interrupt)
    }
}

type Flow<T = ()> = Result<T, Halt>;

pub(super) struct SessionActor {
    context: SessionContext,
    session_id: String,
    peer_id: String,
    state: SessionState,
    snapshot: watch::Sender<SessionSnapshot>,
    commands: mpsc::UnboundedReceiver<Command>,
    hangup: CancellationToken,
    dropped: CancellationToken,
    notices: Option<mpsc::UnboundedSender<SessionNotice>>,
    media: Option<MediaHandle>,
    engine: Option<Arc<dyn NegotiationEngine>>,
    engine_events: Option<mpsc::UnboundedReceiver<EngineEvent>>,
    candidates: IceCandidateBuffer,
    remote_description_set: bool,
    pending_offer: Option<SessionDescription>,
    peer_aware: bool,
    /// Set while remote candidates belong to a glare offer that was ignored.
    stale_remote_candidates: bool,
    deadline: Option<Instant>,
    torn_down: bool,
    outcome: Option<SessionOutcome>,
}

impl SessionActor {
    pub(super) fn new(
        context: SessionContext,
        commands: mpsc::UnboundedReceiver<Command>,
        snapshot: watch::Sender<SessionSnapshot>,
        hangup: CancellationToken,
        dropped: CancellationToken,
        notices: Option<mpsc::UnboundedSender<SessionNotice>>,
    ) -> Self {
        let (session_id, peer_id) = {
            let current = snapshot.borrow();
            (current.session_id.clone(), current.peer_id.clone())
        };
        Self {
            context,
            candidates: IceCandidateBuffer::new(session_id.clone()),
            session_id,
            peer_id,
            state: SessionState::Idle,
            snapshot,
            commands,
            hangup,
            dropped,
            notices,
            media: None,
            engine: None,
            engine_events: None,
            remote_description_set: false,
            pending_offer: None,
            peer_aware: false,
            stale_remote_candidates: false,
            deadline: None,
            torn_down: false,
            outcome: None,
        }
    }

    pub(super) async fn run(mut self) {
        tracing::debug!(
            target = "session",
            session_id = %self.session_id,
            peer_id = %self.peer_id,
            "session started"
        );

        while !self.state.is_terminal() {
            let hangup = self.hangup.clone();
            let dropped = self.dropped.clone();
            tokio::select! {
                biased;
                _ = hangup.cancelled() => self.interrupted(Interrupt::Hangup).await,
                _ = dropped.cancelled() => self.interrupted(Interrupt::ChannelLost).await,
                _ = sleep_until(self.deadline) => self.interrupted(Interrupt::Timeout).await,
                Some(event) = next_engine_event(&mut self.engine_events) => {
                    self.on_engine_event(event).await;
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => self.interrupted(Interrupt::Hangup).await,
                },
            }
        }

        self.finish();
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Initiate(reply) => {
                if self.state != SessionState::Idle {
                    self.refuse(reply, "initiate");
                    return;
                }
                let _ = reply.send(Ok(()));
                self.set_direction(CallDirection::Outbound);
                counter!("call_sessions_started_total", 1, "direction" => "outbound");
                let flow = self.place_call().await;
                self.settle(flow).await;
            }
            Command::Accept(reply) => {
                if self.state != SessionState::ReceivedOffer {
                    self.refuse(reply, "accept_pending_offer");
                    return;
                }
                let _ = reply.send(Ok(()));
                let flow = self.accept_offer().await;
                self.settle(flow).await;
            }
            Command::Reject(reply) => {
                if self.state != SessionState::ReceivedOffer {
                    self.refuse(reply, "reject_pending_offer");
                    return;
                }
                let _ = reply.send(Ok(()));
                self.pending_offer = None;
                self.send(SignalingMessage::call_rejected(
                    &self.context.local_user_id,
                    &self.peer_id,
                    "declined",
                ));
                self.end(CallEndReason::Declined, false).await;
            }
            Command::Inbound(message) => {
                let flow = self.on_message(message).await;
                self.settle(flow).await;
            }
        }
    }

    fn refuse(&self, reply: oneshot::Sender<Result<(), SessionError>>, operation: &'static str) {
        tracing::debug!(
            target = "session",
            session_id = %self.session_id,
            operation,
            state = %self.state,
            "intent refused"
        );
        let _ = reply.send(Err(SessionError::InvalidState {
            operation,
            state: self.state,
        }));
    }

    async fn settle(&mut self, flow: Flow) {
        if let Err(Halt::Interrupted(interrupt)) = flow {
            self.interrupted(interrupt).await;
        }
    }

    async fn interrupted(&mut self, interrupt: Interrupt) {
        if self.state.is_terminal() {
            return;
        }
        match interrupt {
            Interrupt::Hangup => self.end(CallEndReason::LocalHangup, true).await,
            Interrupt::ChannelLost => self.fail(CallFailure::CallDropped, false).await,
            Interrupt::Timeout => {
                tracing::warn!(
                    target = "session",
                    session_id = %self.session_id,
                    peer_id = %self.peer_id,
                    state = %self.state,
                    "negotiation timed out"
                );
                self.fail(CallFailure::NegotiationTimeout, true).await;
            }
        }
    }

    async fn place_call(&mut self) -> Flow {
        self.transition(SessionState::AcquiringMedia);
        self.acquire_media().await?;
        let engine = self.open_engine().await?;

        let offer = self.negotiate(engine.create_offer()).await?;
        self.negotiate(engine.set_local_description(offer.clone()))
            .await?;

        self.transition(SessionState::Offering);
        self.peer_aware = true;
        self.send(SignalingMessage::offer(
            &self.context.local_user_id,
            &self.peer_id,
            &offer,
        ));
        self.transition(SessionState::AwaitingAnswer);
        self.arm_deadline();
        Ok(())
    }

    async fn accept_offer(&mut self) -> Flow {
        let Some(offer) = self.pending_offer.take() else {
            return Ok(());
        };
        self.transition(SessionState::AcquiringMedia);
        self.acquire_media().await?;
        self.transition(SessionState::Answering);
        self.arm_deadline();
        self.answer(offer).await
    }

    /// Applies a remote offer and replies with an answer. Expects to run in
    /// `Answering` with local media held.
    async fn answer(&mut self, offer: SessionDescription) -> Flow {
        let engine = self.open_engine().await?;
        self.apply_remote_description(&engine, offer).await?;

        let answer = self.negotiate(engine.create_answer()).await?;
        self.negotiate(engine.set_local_description(answer.clone()))
            .await?;
        self.send(SignalingMessage::answer(
            &self.context.local_user_id,
            &self.peer_id,
            &answer,
        ));
        tracing::debug!(target = "session", session_id = %self.session_id, "answer sent");
        Ok(())
    }

    async fn on_message(&mut self, message: SignalingMessage) -> Flow {
        if message.sender_id != self.peer_id {
            tracing::warn!(
                target = "session",
                session_id = %self.session_id,
                sender_id = %message.sender_id,
                "frame from unexpected sender dropped"
            );
            return Ok(());
        }

        match message.kind {
            MessageKind::Offer => match message.description() {
                Ok(offer) => self.on_offer(offer).await,
                Err(err) => {
                    self.anomaly(message.kind, &err.to_string());
                    Ok(())
                }
            },
            MessageKind::Answer => match message.description() {
                Ok(answer) => self.on_answer(answer).await,
                Err(err) => {
                    self.anomaly(message.kind, &err.to_string());
                    Ok(())
                }
            },
            MessageKind::IceCandidate => match message.candidate() {
                Ok(candidate) => {
                    self.on_remote_candidate(candidate).await;
                    Ok(())
                }
                Err(err) => {
                    self.anomaly(message.kind, &err.to_string());
                    Ok(())
                }
            },
            MessageKind::CallEnded => {
                tracing::info!(target = "session", session_id = %self.session_id, peer_id = %self.peer_id, "peer ended the call");
                self.end(CallEndReason::RemoteHangup, false).await;
                Ok(())
            }
            MessageKind::CallRejected => {
                if matches!(
                    self.state,
                    SessionState::Offering | SessionState::AwaitingAnswer
                ) {
                    let reason = message.rejection_reason();
                    tracing::info!(
                        target = "session",
                        session_id = %self.session_id,
                        reason = reason.as_deref().unwrap_or("unspecified"),
                        "peer rejected the call"
                    );
                    self.fail(CallFailure::Rejected, false).await;
                } else {
                    self.anomaly(message.kind, "rejection outside of an outstanding offer");
                }
                Ok(())
            }
            MessageKind::UserJoined | MessageKind::UserLeft => Ok(()),
        }
    }

    async fn on_offer(&mut self, offer: SessionDescription) -> Flow {
        match self.state {
            SessionState::Idle | SessionState::ReceivedOffer => {
                if self.state == SessionState::Idle {
                    self.set_direction(CallDirection::Inbound);
                    counter!("call_sessions_started_total", 1, "direction" => "inbound");
                    self.transition(SessionState::ReceivedOffer);
                    self.notify(SessionNotice::IncomingOffer {
                        session_id: self.session_id.clone(),
                        peer_id: self.peer_id.clone(),
                    });
                } else {
                    tracing::debug!(target = "session", session_id = %self.session_id, "repeat offer replaces parked offer");
                }
                self.peer_aware = true;
                self.pending_offer = Some(offer);
                if self.context.config.auto_answer {
                    return self.accept_offer().await;
                }
                Ok(())
            }
            SessionState::AwaitingAnswer => {
                if self.context.local_user_id < self.peer_id {
                    tracing::info!(
                        target = "session",
                        session_id = %self.session_id,
                        peer_id = %self.peer_id,
                        "offer glare: keeping local offer"
                    );
                    self.candidates.clear();
                    self.stale_remote_candidates = true;
                    Ok(())
                } else {
                    self.yield_to_remote_offer(offer).await
                }
            }
            _ => {
                self.anomaly(MessageKind::Offer, "renegotiation is not supported");
                Ok(())
            }
        }
    }

    async fn yield_to_remote_offer(&mut self, offer: SessionDescription) -> Flow {
        tracing::info!(
            target = "session",
            session_id = %self.session_id,
            peer_id = %self.peer_id,
            "offer glare: yielding to remote offer"
        );
        self.close_engine().await;
        self.deadline = None;
        self.transition(SessionState::Answering);
        self.arm_deadline();
        self.answer(offer).await
    }

    async fn on_answer(&mut self, answer: SessionDescription) -> Flow {
        if self.state != SessionState::AwaitingAnswer {
            self.anomaly(MessageKind::Answer, "no outstanding offer");
            return Ok(());
        }
        let engine = self.current_engine()?;
        self.stale_remote_candidates = false;
        self.apply_remote_description(&engine, answer).await?;
        self.deadline = None;
        self.transition(SessionState::Connected);
        Ok(())
    }

    async fn on_remote_candidate(&mut self, candidate: IceCandidate) {
        if self.state.is_terminal() {
            return;
        }
        if !self.remote_description_set {
            if self.stale_remote_candidates {
                tracing::debug!(target = "session", session_id = %self.session_id, "candidate from abandoned offer dropped");
                return;
            }
            self.candidates.push(candidate);
            return;
        }
        if let Some(engine) = self.engine.clone() {
            apply_candidate(&engine, &self.session_id, candidate).await;
        }
    }

    async fn on_engine_event(&mut self, event: EngineEvent) {
        match event {
            EngineEvent::LocalCandidate(candidate) => {
                self.send(SignalingMessage::ice_candidate(
                    &self.context.local_user_id,
                    &self.peer_id,
                    &candidate,
                ));
            }
            EngineEvent::RemoteTrack(track) => {
                tracing::debug!(
                    target = "session",
                    session_id = %self.session_id,
                    track_id = %track.id,
                    kind = ?track.kind,
                    "remote track started"
                );
                self.snapshot
                    .send_modify(|snapshot| snapshot.remote_tracks.push(track));
                if self.state == SessionState::Answering {
                    self.deadline = None;
                    self.transition(SessionState::Connected);
                }
            }
            EngineEvent::ConnectionFailed(detail) => {
                counter!("call_ice_failures_total", 1, "source" => "connection");
                tracing::warn!(
                    target = "session",
                    session_id = %self.session_id,
                    detail = %detail,
                    "ice connectivity failure"
                );
            }
        }
    }

    async fn acquire_media(&mut self) -> Flow {
        if self.media.is_some() {
            return Ok(());
        }
        let source = Arc::clone(&self.context.media);
        match self.suspend(source.acquire()).await? {
            Ok(media) => {
                if self.hangup.is_cancelled() {
                    media.stop();
                    return Err(Interrupt::Hangup.into());
                }
                self.snapshot
                    .send_modify(|snapshot| snapshot.local_media = Some(media.clone()));
                self.media = Some(media);
                Ok(())
            }
            Err(err) => {
                tracing::warn!(target = "session", session_id = %self.session_id, error = %err, "local media unavailable");
                self.fail(CallFailure::MediaUnavailable, true).await;
                Err(Halt::Terminated)
            }
        }
    }

    /// Creates a fresh engine and attaches local media to it.
    async fn open_engine(&mut self) -> Flow<Arc<dyn NegotiationEngine>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let factory = Arc::clone(&self.context.engines);
        let engine = self.negotiate(factory.create(events_tx)).await?;
        self.engine = Some(Arc::clone(&engine));
        self.engine_events = Some(events_rx);
        self.remote_description_set = false;

        if let Some(media) = self.media.clone() {
            self.negotiate(engine.add_local_media(&media)).await?;
        }
        Ok(engine)
    }

    async fn close_engine(&mut self) {
        self.engine_events = None;
        self.remote_description_set = false;
        if let Some(engine) = self.engine.take() {
            engine.close().await;
        }
    }

    fn current_engine(&self) -> Flow<Arc<dyn NegotiationEngine>> {
        self.engine.clone().ok_or(Halt::Terminated)
    }

    async fn apply_remote_description(
        &mut self,
        engine: &Arc<dyn NegotiationEngine>,
        description: SessionDescription,
    ) -> Flow {
        self.negotiate(engine.set_remote_description(description))
            .await?;
        self.remote_description_set = true;

        let session_id = self.session_id.clone();
        self.candidates
            .flush_into(|candidate| {
                let engine = Arc::clone(engine);
                let session_id = session_id.clone();
                async move { apply_candidate(&engine, &session_id, candidate).await }
            })
            .await;
        Ok(())
    }

    /// Runs one engine step. A failure fails the session with
    /// `NegotiationFailure`.
    async fn negotiate<T>(
        &mut self,
        step: impl Future<Output = Result<T, NegotiationError>>,
    ) -> Flow<T> {
        match self.suspend(step).await? {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::warn!(
                    target = "session",
                    session_id = %self.session_id,
                    state = %self.state,
                    error = %err,
                    "negotiation step failed"
                );
                self.fail(CallFailure::NegotiationFailure, true).await;
                Err(Halt::Terminated)
            }
        }
    }

    /// Awaits `future` unless hang-up, channel loss or the negotiation
    /// deadline comes first.
    async fn suspend<T>(&self, future: impl Future<Output = T>) -> Result<T, Interrupt> {
        tokio::select! {
            biased;
            _ = self.hangup.cancelled() => Err(Interrupt::Hangup),
            _ = self.dropped.cancelled() => Err(Interrupt::ChannelLost),
            _ = sleep_until(self.deadline) => Err(Interrupt::Timeout),
            value = future => Ok(value),
        }
    }

    fn arm_deadline(&mut self) {
        self.deadline = Some(Instant::now() + self.context.config.negotiation_timeout());
    }

    async fn end(&mut self, reason: CallEndReason, notify: bool) {
        if self.state.is_terminal() {
            return;
        }
        self.transition(SessionState::Ending);
        self.teardown(notify).await;
        self.outcome = Some(SessionOutcome::Ended(reason));
        self.transition(SessionState::Ended);
    }

    async fn fail(&mut self, failure: CallFailure, notify: bool) {
        if self.state.is_terminal() {
            return;
        }
        self.teardown(notify).await;
        self.outcome = Some(SessionOutcome::Failed(failure));
        self.transition(SessionState::Failed);
    }

    /// Releases everything the session holds. Runs at most once.
    async fn teardown(&mut self, notify: bool) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.deadline = None;
        self.pending_offer = None;

        if let Some(media) = &self.media {
            media.stop();
        }
        self.close_engine().await;
        let discarded = self.candidates.clear();

        if notify && self.peer_aware {
            self.send(SignalingMessage::call_ended(
                &self.context.local_user_id,
                &self.peer_id,
            ));
        }
        tracing::debug!(
            target = "session",
            session_id = %self.session_id,
            discarded_candidates = discarded,
            "session torn down"
        );
    }

    fn transition(&mut self, next: SessionState) -> bool {
        if !self.state.can_transition_to(next) {
            tracing::warn!(
                target = "session",
                session_id = %self.session_id,
                from = %self.state,
                to = %next,
                "illegal state transition refused"
            );
            return false;
        }
        tracing::debug!(
            target = "session",
            session_id = %self.session_id,
            peer_id = %self.peer_id,
            from = %self.state,
            to = %next,
            "session state changed"
        );
        self.state = next;
        let outcome = if next.is_terminal() { self.outcome } else { None };
        self.snapshot.send_modify(|snapshot| {
            snapshot.state = next;
            snapshot.reason = outcome;
        });
        true
    }

    fn set_direction(&mut self, direction: CallDirection) {
        self.snapshot
            .send_modify(|snapshot| snapshot.direction = Some(direction));
    }

    fn send(&self, message: SignalingMessage) {
        let kind = message.kind;
        if let Err(err) = self.context.sink.send(message) {
            tracing::debug!(
                target = "session",
                session_id = %self.session_id,
                kind = %kind,
                error = %err,
                "best-effort send failed"
            );
        }
    }

    fn anomaly(&self, kind: MessageKind, detail: &str) {
        counter!("signaling_messages_dropped_total", 1, "kind" => kind.as_str(), "direction" => "session");
        tracing::warn!(
            target = "session",
            session_id = %self.session_id,
            state = %self.state,
            kind = %kind,
            detail,
            "protocol anomaly; frame ignored"
        );
    }

    fn finish(&mut self) {
        let outcome = self
            .outcome
            .unwrap_or(SessionOutcome::Failed(CallFailure::CallDropped));
        counter!("call_sessions_ended_total", 1, "outcome" => outcome.label());
        tracing::info!(
            target = "session",
            session_id = %self.session_id,
            peer_id = %self.peer_id,
            outcome = %outcome,
            "session finished"
        );
        let exit = SessionExit {
            session_id: self.session_id.clone(),
            peer_id: self.peer_id.clone(),
            outcome,
        };
        self.notify(SessionNotice::Exited(exit));
        self.notices = None;
    }

    fn notify(&self, notice: SessionNotice) {
        if let Some(notices) = &self.notices {
            let _ = notices.send(notice);
        }
    }
}

async fn apply_candidate(engine: &Arc<dyn NegotiationEngine>, session_id: &str, candidate: IceCandidate) {
    if let Err(err) = engine.add_ice_candidate(candidate).await {
        counter!("call_ice_failures_total", 1, "source" => "candidate");
        tracing::warn!(target = "session", session_id = %session_id, error = %err, "remote candidate rejected");
    }
}

async fn next_engine_event(
    events: &mut Option<mpsc::UnboundedReceiver<EngineEvent>>,
) -> Option<EngineEvent> {
    match events {
        Some(events) => events.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
