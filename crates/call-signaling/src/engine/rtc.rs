//! webrtc-rs backed engine and a synthetic capture source for headless agents.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8, MediaEngine};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

use super::{EngineEvent, EngineEvents, NegotiationEngine, NegotiationEngineFactory};
use crate::error::{MediaError, NegotiationError};
use crate::media::{LocalTrack, MediaHandle, MediaSource, RemoteTrack, TrackKind};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

pub const DEFAULT_ICE_SERVER: &str = "stun:stun.l.google.com:19302";

const STREAM_ID: &str = "call-signaling";
const OPUS_FRAME: Duration = Duration::from_millis(20);
// Opus TOC for a 20ms CELT silence frame.
const OPUS_SILENCE: [u8; 3] = [0xf8, 0xff, 0xfe];

#[derive(Debug, Clone)]
pub struct RtcEngineFactory {
    ice_servers: Vec<String>,
}

impl Default for RtcEngineFactory {
    fn default() -> Self {
        Self::new(vec![DEFAULT_ICE_SERVER.to_string()])
    }
}

impl RtcEngineFactory {
    /// An empty list restricts gathering to host candidates.
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self { ice_servers }
    }

    fn configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl NegotiationEngineFactory for RtcEngineFactory {
    async fn create(
        &self,
        events: EngineEvents,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
        let setup = |err: webrtc::Error| NegotiationError::Setup(err.to_string());

        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup)?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .map_err(setup)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();
        let peer = Arc::new(
            api.new_peer_connection(self.configuration())
                .await
                .map_err(setup)?,
        );

        let candidate_tx = events.clone();
        peer.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = events.send(EngineEvent::LocalCandidate(from_rtc_candidate(init)));
                    }
                    Err(err) => {
                        tracing::warn!(target = "session", error = %err, "failed to serialise local candidate");
                    }
                }
            })
        }));

        let track_tx = events.clone();
        peer.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let kind = match track.kind() {
                    RTPCodecType::Audio => Some(TrackKind::Audio),
                    RTPCodecType::Video => Some(TrackKind::Video),
                    _ => None,
                };
                if let Some(kind) = kind {
                    let _ = track_tx.send(EngineEvent::RemoteTrack(RemoteTrack {
                        id: track.id(),
                        stream_id: track.stream_id(),
                        kind,
                    }));
                }
                Box::pin(async {})
            },
        ));

        let state_tx = events;
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            tracing::debug!(target = "session", state = %state, "peer connection state changed");
            if state == RTCPeerConnectionState::Failed {
                let _ = state_tx.send(EngineEvent::ConnectionFailed(state.to_string()));
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcEngine { peer }))
    }
}

struct RtcEngine {
    peer: Arc<RTCPeerConnection>,
}

#[async_trait]
impl NegotiationEngine for RtcEngine {
    async fn add_local_media(&self, media: &MediaHandle) -> Result<(), NegotiationError> {
        for track in media.tracks() {
            let local = match track.as_any().downcast_ref::<RtcLocalTrack>() {
                Some(rtc) => Arc::clone(&rtc.track),
                None => Arc::new(sample_track(track.kind(), track.id().to_string())),
            };
            self.peer
                .add_track(local as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|err| NegotiationError::Setup(format!("add track failed: {err}")))?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        let offer = self.peer.create_offer(None).await.map_err(|err| {
            tracing::warn!(target = "session", error = %err, "create offer failed");
            NegotiationError::Create("offer")
        })?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        let answer = self.peer.create_answer(None).await.map_err(|err| {
            tracing::warn!(target = "session", error = %err, "create answer failed");
            NegotiationError::Create("answer")
        })?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.peer
            .set_local_description(to_rtc_description(description)?)
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.peer
            .set_remote_description(to_rtc_description(description)?)
            .await
            .map_err(|err| NegotiationError::Description(err.to_string()))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.peer
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: candidate.username_fragment,
            })
            .await
            .map_err(|err| NegotiationError::Candidate(err.to_string()))
    }

    async fn close(&self) {
        if let Err(err) = self.peer.close().await {
            tracing::debug!(target = "session", error = %err, "peer connection close failed");
        }
    }
}

fn from_rtc_candidate(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc_description(
    description: SessionDescription,
) -> Result<RTCSessionDescription, NegotiationError> {
    let invalid = |err: webrtc::Error| NegotiationError::Description(err.to_string());
    match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp).map_err(invalid),
        SdpType::Answer => RTCSessionDescription::answer(description.sdp).map_err(invalid),
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp).map_err(invalid),
        SdpType::Rollback => Err(NegotiationError::Description(format!(
            "{} descriptions are not supported",
            RTCSdpType::Rollback
        ))),
    }
}

fn sample_track(kind: TrackKind, id: String) -> TrackLocalStaticSample {
    let mime_type = match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    };
    TrackLocalStaticSample::new(
        RTCRtpCodecCapability {
            mime_type: mime_type.to_owned(),
            ..Default::default()
        },
        id,
        STREAM_ID.to_owned(),
    )
}

/// A local track backed by a webrtc-rs sample track.
pub struct RtcLocalTrack {
    id: String,
    kind: TrackKind,
    track: Arc<TrackLocalStaticSample>,
    stop: CancellationToken,
}

impl RtcLocalTrack {
    pub fn new(kind: TrackKind) -> Self {
        let id = format!("{}-{}", track_label(kind), Uuid::new_v4());
        Self {
            track: Arc::new(sample_track(kind, id.clone())),
            id,
            kind,
            stop: CancellationToken::new(),
        }
    }

    pub fn sample_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.track)
    }
}

impl LocalTrack for RtcLocalTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> TrackKind {
        self.kind
    }

    fn stop(&self) {
        self.stop.cancel();
    }

    fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn track_label(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

/// Produces an Opus audio track fed with silence and an idle VP8 video track.
///
/// The silence keeps RTP flowing so the remote side observes a track.
#[derive(Debug, Clone)]
pub struct SyntheticMediaSource {
    video: bool,
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self { video: true }
    }
}

impl SyntheticMediaSource {
    pub fn audio_only() -> Self {
        Self { video: false }
    }
}

#[async_trait]
impl MediaSource for SyntheticMediaSource {
    async fn acquire(&self) -> Result<MediaHandle, MediaError> {
        let audio = Arc::new(RtcLocalTrack::new(TrackKind::Audio));
        spawn_silence(audio.sample_track(), audio.stop.clone());

        let mut tracks: Vec<Arc<dyn LocalTrack>> = vec![audio];
        if self.video {
            tracks.push(Arc::new(RtcLocalTrack::new(TrackKind::Video)));
        }
        Ok(MediaHandle::new(tracks))
    }
}

fn spawn_silence(track: Arc<TrackLocalStaticSample>, stop: CancellationToken) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OPUS_FRAME);
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    let sample = Sample {
                        data: Bytes::from_static(&OPUS_SILENCE),
                        duration: OPUS_FRAME,
                        ..Default::default()
                    };
                    // Writes before the track is bound are discarded.
                    if let Err(err) = track.write_sample(&sample).await {
                        tracing::trace!(target = "media", error = %err, "silence write failed");
                    }
                }
            }
        }
    });
}
