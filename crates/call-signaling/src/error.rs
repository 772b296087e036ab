use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("relay rejected credentials: {0}")]
    Authentication(String),
    #[error("signaling transport error: {0}")]
    Transport(String),
    #[error("invalid relay url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("signaling channel is not open")]
    NotOpen,
    #[error("event stream already taken")]
    EventsTaken,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed signaling frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{kind} frame carries no payload")]
    MissingPayload { kind: &'static str },
    #[error("{kind} frame carries a {sdp_type:?} description")]
    DescriptionMismatch {
        kind: &'static str,
        sdp_type: crate::protocol::SdpType,
    },
    #[error("binary frame is not utf-8")]
    NotUtf8,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("media unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("negotiation engine setup failed: {0}")]
    Setup(String),
    #[error("failed to create {0}")]
    Create(&'static str),
    #[error("description rejected: {0}")]
    Description(String),
    #[error("ice candidate rejected: {0}")]
    Candidate(String),
    #[error("negotiation engine closed")]
    Closed,
}

/// Rejections of a local intent by a session.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("operation `{operation}` is not valid in state {state}")]
    InvalidState {
        operation: &'static str,
        state: crate::session::SessionState,
    },
    #[error("session already terminated")]
    Closed,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("busy: {0}")]
    Busy(String),
    #[error("registry shut down")]
    Closed,
    #[error(transparent)]
    Session(#[from] SessionError),
}
