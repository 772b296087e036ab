//! Call-session signaling for peer-to-peer audio/video calls.
//!
//! A [`SignalingChannel`] keeps one authenticated websocket to the relay, the
//! [`SessionRegistry`] routes inbound frames to one [`CallSessionController`]
//! per remote peer, and each controller drives offer/answer/candidate exchange
//! through a [`engine::NegotiationEngine`].

pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod identity;
pub mod media;
pub mod protocol;
pub mod registry;
pub mod session;

pub use channel::{ChannelEvent, ChannelState, SignalingChannel, SignalingSink};
pub use config::{ChannelConfig, ReconnectPolicy, RegistryConfig, SessionConfig};
pub use engine::{EngineEvent, NegotiationEngine, NegotiationEngineFactory};
pub use error::{
    MediaError, NegotiationError, ProtocolError, RegistryError, SessionError, SignalingError,
};
pub use identity::Identity;
pub use media::{LocalTrack, MediaHandle, MediaSource, RemoteTrack, TrackKind};
pub use protocol::{IceCandidate, MessageKind, SdpType, SessionDescription, SignalingMessage};
pub use registry::{RegistryEvent, SessionRegistry};
pub use session::{
    CallDirection, CallEndReason, CallFailure, CallSessionController, IceCandidateBuffer,
    SessionContext, SessionExit, SessionNotice, SessionOutcome, SessionSnapshot, SessionState,
};
