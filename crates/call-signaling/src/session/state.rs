use std::fmt;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SessionState {
    Idle,
    AcquiringMedia,
    Offering,
    AwaitingAnswer,
    ReceivedOffer,
    Answering,
    Connected,
    Ending,
    Ended,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        if self.is_terminal() {
            return false;
        }
        if matches!(next, Ending | Failed) {
            return self != Ending || next == Failed;
        }
        matches!(
            (self, next),
            (Idle, AcquiringMedia)
                | (Idle, ReceivedOffer)
                | (ReceivedOffer, AcquiringMedia)
                | (ReceivedOffer, Answering)
                | (AcquiringMedia, Offering)
                | (AcquiringMedia, Answering)
                | (Offering, AwaitingAnswer)
                | (AwaitingAnswer, Connected)
                | (AwaitingAnswer, Answering)
                | (Answering, Connected)
                | (Ending, Ended)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AcquiringMedia => "acquiring-media",
            SessionState::Offering => "offering",
            SessionState::AwaitingAnswer => "awaiting-answer",
            SessionState::ReceivedOffer => "received-offer",
            SessionState::Answering => "answering",
            SessionState::Connected => "connected",
            SessionState::Ending => "ending",
            SessionState::Ended => "ended",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
