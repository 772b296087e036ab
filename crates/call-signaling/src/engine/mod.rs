//! Offer/answer capability consumed by sessions.
//!
//! A session owns exactly one engine at a time. Engine callbacks are turned
//! into [`EngineEvent`]s and delivered on the channel handed to
//! [`NegotiationEngineFactory::create`], so they enter the session's own queue.

#[cfg(feature = "rtc")]
pub mod rtc;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::NegotiationError;
use crate::media::{MediaHandle, RemoteTrack};
use crate::protocol::{IceCandidate, SessionDescription};

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A locally gathered candidate to forward to the peer.
    LocalCandidate(IceCandidate),
    /// Remote media started flowing.
    RemoteTrack(RemoteTrack),
    /// The transport reported a connectivity failure.
    ConnectionFailed(String),
}

pub type EngineEvents = mpsc::UnboundedSender<EngineEvent>;

#[async_trait]
pub trait NegotiationEngine: Send + Sync {
    async fn add_local_media(&self, media: &MediaHandle) -> Result<(), NegotiationError>;
    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError>;
    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError>;
    async fn close(&self);
}

#[async_trait]
pub trait NegotiationEngineFactory: Send + Sync {
    async fn create(
        &self,
        events: EngineEvents,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError>;
}
