#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt::SubscriberBuilder};

use call_signaling::engine::EngineEvents;
use call_signaling::media::PlaceholderTrack;
use call_signaling::{
    CallSessionController, ChannelEvent, EngineEvent, IceCandidate, LocalTrack, MediaError,
    MediaHandle, MediaSource, MessageKind, NegotiationEngine, NegotiationEngineFactory,
    NegotiationError, RegistryConfig, RemoteTrack, SdpType, SessionDescription, SessionRegistry,
    SessionState, SignalingError, SignalingMessage, SignalingSink, TrackKind,
};

pub const WAIT: Duration = Duration::from_secs(10);

pub fn init_tracing() {
    let _ = SubscriberBuilder::default()
        .with_test_writer()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

pub async fn wait_for_state(session: &CallSessionController, expected: SessionState) {
    let mut updates = session.subscribe();
    let reached = timeout(WAIT, async {
        loop {
            let state = updates.borrow_and_update().state;
            if state == expected {
                return;
            }
            if updates.changed().await.is_err() {
                panic!("session stopped in {state} while waiting for {expected}");
            }
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {expected}, state is {}", session.state());
}

pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let reached = timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(reached.is_ok(), "timed out waiting for {what}");
}

// ---------------------------------------------------------------------------
// Media

#[derive(Default)]
pub struct FakeMediaSource {
    fail: bool,
    hang: bool,
    acquired: Mutex<Vec<MediaHandle>>,
}

impl FakeMediaSource {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Acquisition never completes.
    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::default()
        }
    }

    pub fn acquired(&self) -> Vec<MediaHandle> {
        self.acquired.lock().clone()
    }

    pub fn all_stopped(&self) -> bool {
        self.acquired.lock().iter().all(|handle| {
            handle.is_stopped() && handle.tracks().iter().all(|track| track.is_stopped())
        })
    }
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self) -> Result<MediaHandle, MediaError> {
        if self.hang {
            std::future::pending::<()>().await;
        }
        if self.fail {
            return Err(MediaError::Unavailable("no capture device".into()));
        }
        let tracks: Vec<Arc<dyn LocalTrack>> = vec![
            Arc::new(PlaceholderTrack::new(TrackKind::Audio)),
            Arc::new(PlaceholderTrack::new(TrackKind::Video)),
        ];
        let handle = MediaHandle::new(tracks);
        self.acquired.lock().push(handle.clone());
        Ok(handle)
    }
}

// ---------------------------------------------------------------------------
// Negotiation engine

#[derive(Debug, Clone, Default)]
pub struct EngineScript {
    pub fail_offer: bool,
    pub fail_candidates: bool,
    /// Local candidates announced after the local description is set.
    pub local_candidates: usize,
    /// Never report remote media.
    pub silent_remote: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineOp {
    Create(usize),
    AddMedia(usize),
    CreateOffer(usize),
    CreateAnswer(usize),
    SetLocal(usize, SdpType),
    SetRemote(usize, SdpType),
    Candidate(usize, String),
    Close(usize),
}

#[derive(Default)]
pub struct FakeEngineFactory {
    script: EngineScript,
    created: AtomicUsize,
    log: Arc<Mutex<Vec<EngineOp>>>,
}

impl FakeEngineFactory {
    pub fn scripted(script: EngineScript) -> Self {
        Self {
            script,
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn ops(&self) -> Vec<EngineOp> {
        self.log.lock().clone()
    }

    pub fn applied_candidates(&self) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter_map(|op| match op {
                EngineOp::Candidate(_, candidate) => Some(candidate),
                _ => None,
            })
            .collect()
    }

    pub fn closed(&self) -> usize {
        self.ops()
            .iter()
            .filter(|op| matches!(op, EngineOp::Close(_)))
            .count()
    }
}

#[async_trait]
impl NegotiationEngineFactory for FakeEngineFactory {
    async fn create(
        &self,
        events: EngineEvents,
    ) -> Result<Arc<dyn NegotiationEngine>, NegotiationError> {
        let index = self.created.fetch_add(1, Ordering::SeqCst);
        self.log.lock().push(EngineOp::Create(index));
        Ok(Arc::new(FakeEngine {
            index,
            script: self.script.clone(),
            events,
            log: Arc::clone(&self.log),
            local_set: AtomicBool::new(false),
            remote_set: AtomicBool::new(false),
            track_sent: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

struct FakeEngine {
    index: usize,
    script: EngineScript,
    events: EngineEvents,
    log: Arc<Mutex<Vec<EngineOp>>>,
    local_set: AtomicBool,
    remote_set: AtomicBool,
    track_sent: AtomicBool,
    closed: AtomicBool,
}

impl FakeEngine {
    fn record(&self, op: EngineOp) {
        self.log.lock().push(op);
    }

    fn ensure_open(&self) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(NegotiationError::Closed)
        } else {
            Ok(())
        }
    }

    fn maybe_start_remote_track(&self) {
        if !self.script.silent_remote
            && self.local_set.load(Ordering::SeqCst)
            && self.remote_set.load(Ordering::SeqCst)
            && !self.track_sent.swap(true, Ordering::SeqCst)
        {
            let _ = self.events.send(EngineEvent::RemoteTrack(RemoteTrack {
                id: format!("remote-audio-{}", self.index),
                stream_id: "fake".into(),
                kind: TrackKind::Audio,
            }));
        }
    }
}

#[async_trait]
impl NegotiationEngine for FakeEngine {
    async fn add_local_media(&self, _media: &MediaHandle) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.record(EngineOp::AddMedia(self.index));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.record(EngineOp::CreateOffer(self.index));
        if self.script.fail_offer {
            return Err(NegotiationError::Create("offer"));
        }
        Ok(SessionDescription::offer(format!("v=0 fake-offer {}", self.index)))
    }

    async fn create_answer(&self) -> Result<SessionDescription, NegotiationError> {
        self.ensure_open()?;
        self.record(EngineOp::CreateAnswer(self.index));
        Ok(SessionDescription::answer(format!("v=0 fake-answer {}", self.index)))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.record(EngineOp::SetLocal(self.index, description.sdp_type));
        self.local_set.store(true, Ordering::SeqCst);
        for n in 0..self.script.local_candidates {
            let candidate = IceCandidate::new(format!(
                "candidate:{n} 1 udp 2122260223 10.0.{}.{n} 5000{n} typ host",
                self.index
            ));
            let _ = self.events.send(EngineEvent::LocalCandidate(candidate));
        }
        self.maybe_start_remote_track();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        self.record(EngineOp::SetRemote(self.index, description.sdp_type));
        self.remote_set.store(true, Ordering::SeqCst);
        self.maybe_start_remote_track();
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), NegotiationError> {
        self.ensure_open()?;
        if self.script.fail_candidates {
            return Err(NegotiationError::Candidate("unreachable address".into()));
        }
        self.record(EngineOp::Candidate(self.index, candidate.candidate));
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.record(EngineOp::Close(self.index));
        }
    }
}

// ---------------------------------------------------------------------------
// Recording sink for driving a single controller by hand

#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<SignalingMessage>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<SignalingMessage> {
        self.sent.lock().clone()
    }

    pub fn count(&self, kind: MessageKind) -> usize {
        self.sent.lock().iter().filter(|m| m.kind == kind).count()
    }
}

impl SignalingSink for RecordingSink {
    fn send(&self, message: SignalingMessage) -> Result<(), SignalingError> {
        self.sent.lock().push(message);
        Ok(())
    }
}

/// A registry whose outbound frames are only recorded. Inbound frames are
/// fed with [`SessionRegistry::dispatch`].
pub struct Harness {
    pub registry: SessionRegistry,
    pub sink: Arc<RecordingSink>,
    pub media: Arc<FakeMediaSource>,
    pub engines: Arc<FakeEngineFactory>,
}

impl Harness {
    pub fn new(user_id: &str, config: RegistryConfig) -> Self {
        Self::with(user_id, config, FakeMediaSource::default(), EngineScript::default())
    }

    pub fn with(
        user_id: &str,
        config: RegistryConfig,
        media: FakeMediaSource,
        script: EngineScript,
    ) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let media = Arc::new(media);
        let engines = Arc::new(FakeEngineFactory::scripted(script));
        let registry = SessionRegistry::new(
            user_id,
            sink.clone(),
            media.clone(),
            engines.clone(),
            config,
        );
        Self {
            registry,
            sink,
            media,
            engines,
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory relay wiring several registries together

struct Link {
    events: mpsc::UnboundedSender<ChannelEvent>,
    online: bool,
    held: Option<Vec<SignalingMessage>>,
}

#[derive(Default)]
struct LoopbackState {
    links: HashMap<String, Link>,
    log: Vec<SignalingMessage>,
}

#[derive(Clone, Default)]
pub struct LoopbackRelay {
    state: Arc<Mutex<LoopbackState>>,
}

pub struct LoopbackSink {
    user_id: String,
    relay: LoopbackRelay,
}

impl SignalingSink for LoopbackSink {
    fn send(&self, mut message: SignalingMessage) -> Result<(), SignalingError> {
        if message.sender_id.is_empty() {
            message.sender_id = self.user_id.clone();
        }
        self.relay.route(&self.user_id, message)
    }
}

pub struct TestPeer {
    pub user_id: String,
    pub registry: SessionRegistry,
    pub media: Arc<FakeMediaSource>,
    pub engines: Arc<FakeEngineFactory>,
    dispatch: JoinHandle<()>,
}

impl Drop for TestPeer {
    fn drop(&mut self) {
        self.dispatch.abort();
    }
}

impl LoopbackRelay {
    pub fn join(&self, user_id: &str, config: RegistryConfig) -> TestPeer {
        self.join_with(user_id, config, FakeMediaSource::default(), EngineScript::default())
    }

    pub fn join_with(
        &self,
        user_id: &str,
        config: RegistryConfig,
        media: FakeMediaSource,
        script: EngineScript,
    ) -> TestPeer {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        self.state.lock().links.insert(
            user_id.to_string(),
            Link {
                events: events_tx,
                online: true,
                held: None,
            },
        );

        let media = Arc::new(media);
        let engines = Arc::new(FakeEngineFactory::scripted(script));
        let sink = Arc::new(LoopbackSink {
            user_id: user_id.to_string(),
            relay: self.clone(),
        });
        let registry = SessionRegistry::new(
            user_id,
            sink,
            media.clone(),
            engines.clone(),
            config,
        );
        let dispatch = tokio::spawn({
            let registry = registry.clone();
            async move { registry.run(events_rx).await }
        });

        TestPeer {
            user_id: user_id.to_string(),
            registry,
            media,
            engines,
            dispatch,
        }
    }

    fn route(&self, from: &str, message: SignalingMessage) -> Result<(), SignalingError> {
        let mut state = self.state.lock();
        if !state.links.get(from).is_some_and(|link| link.online) {
            return Err(SignalingError::NotOpen);
        }
        state.log.push(message.clone());
        let Some(target) = message.target_id.clone() else {
            return Ok(());
        };
        if let Some(link) = state.links.get_mut(&target) {
            if !link.online {
                return Ok(());
            }
            match &mut link.held {
                Some(held) => held.push(message),
                None => {
                    let _ = link.events.send(ChannelEvent::Message(message));
                }
            }
        }
        Ok(())
    }

    /// Queues frames addressed to `user_id` until [`release`](Self::release).
    pub fn hold(&self, user_id: &str) {
        if let Some(link) = self.state.lock().links.get_mut(user_id) {
            link.held.get_or_insert_with(Vec::new);
        }
    }

    pub fn release(&self, user_id: &str) {
        if let Some(link) = self.state.lock().links.get_mut(user_id) {
            for message in link.held.take().unwrap_or_default() {
                let _ = link.events.send(ChannelEvent::Message(message));
            }
        }
    }

    pub fn set_online(&self, user_id: &str, online: bool) {
        if let Some(link) = self.state.lock().links.get_mut(user_id) {
            link.online = online;
        }
    }

    /// Delivers a raw channel event to `user_id`'s dispatch loop.
    pub fn inject(&self, user_id: &str, event: ChannelEvent) {
        if let Some(link) = self.state.lock().links.get(user_id) {
            let _ = link.events.send(event);
        }
    }

    pub fn frames(&self) -> Vec<SignalingMessage> {
        self.state.lock().log.clone()
    }

    pub fn count(&self, from: &str, kind: MessageKind) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|message| message.sender_id == from && message.kind == kind)
            .count()
    }

    pub fn queued(&self, user_id: &str, kind: MessageKind) -> usize {
        self.state
            .lock()
            .links
            .get(user_id)
            .and_then(|link| link.held.as_ref())
            .map_or(0, |held| held.iter().filter(|m| m.kind == kind).count())
    }
}

// ---------------------------------------------------------------------------
// Websocket relay served by axum

struct Connection {
    id: usize,
    outbound: mpsc::UnboundedSender<String>,
    kick: CancellationToken,
}

#[derive(Default)]
struct RelayShared {
    tokens: Mutex<HashMap<String, String>>,
    connections: Mutex<HashMap<String, Connection>>,
    refusing: AtomicBool,
    accepted: AtomicUsize,
}

pub struct WsRelay {
    pub addr: std::net::SocketAddr,
    shared: Arc<RelayShared>,
    server: JoinHandle<()>,
}

impl Drop for WsRelay {
    fn drop(&mut self) {
        self.server.abort();
    }
}

impl WsRelay {
    pub async fn start(users: &[(&str, &str)]) -> Self {
        let shared = Arc::new(RelayShared::default());
        {
            let mut tokens = shared.tokens.lock();
            for (user, token) in users {
                tokens.insert(user.to_string(), token.to_string());
            }
        }
        let router = Router::new()
            .route("/signaling", get(upgrade))
            .with_state(Arc::clone(&shared));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind relay");
        let addr = listener.local_addr().expect("relay addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });
        Self {
            addr,
            shared,
            server,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/signaling", self.addr)
    }

    pub fn is_connected(&self, user_id: &str) -> bool {
        self.shared.connections.lock().contains_key(user_id)
    }

    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Drops `user_id`'s socket without a close handshake.
    pub fn kick(&self, user_id: &str) {
        if let Some(connection) = self.shared.connections.lock().remove(user_id) {
            connection.kick.cancel();
        }
    }

    /// While set, upgrades are answered with 503.
    pub fn refuse_connections(&self, refusing: bool) {
        self.shared.refusing.store(refusing, Ordering::SeqCst);
    }

    pub fn set_token(&self, user_id: &str, token: &str) {
        self.shared
            .tokens
            .lock()
            .insert(user_id.to_string(), token.to_string());
    }

    /// Pushes a raw text frame to `user_id`.
    pub fn push_raw(&self, user_id: &str, text: &str) {
        if let Some(connection) = self.shared.connections.lock().get(user_id) {
            let _ = connection.outbound.send(text.to_string());
        }
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    Query(params): Query<HashMap<String, String>>,
    State(shared): State<Arc<RelayShared>>,
) -> impl IntoResponse {
    if shared.refusing.load(Ordering::SeqCst) {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay paused").into_response();
    }
    let (Some(user_id), Some(token)) = (params.get("userId"), params.get("token")) else {
        return (StatusCode::UNAUTHORIZED, "missing credentials").into_response();
    };
    if shared.tokens.lock().get(user_id) != Some(token) {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    let user_id = user_id.clone();
    ws.on_upgrade(move |socket| serve_socket(socket, user_id, shared))
}

async fn serve_socket(socket: WebSocket, user_id: String, shared: Arc<RelayShared>) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let kick = CancellationToken::new();
    let id = shared.accepted.fetch_add(1, Ordering::SeqCst);
    shared.connections.lock().insert(
        user_id.clone(),
        Connection {
            id,
            outbound: outbound_tx,
            kick: kick.clone(),
        },
    );

    loop {
        tokio::select! {
            _ = kick.cancelled() => return,
            frame = outbound_rx.recv() => {
                let Some(text) = frame else { break };
                if sender.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => forward(&shared, &text),
                Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            },
        }
    }

    let mut connections = shared.connections.lock();
    if connections
        .get(&user_id)
        .is_some_and(|connection| connection.id == id)
    {
        connections.remove(&user_id);
    }
}

fn forward(shared: &RelayShared, text: &str) {
    let Ok(frame) = serde_json::from_str::<Value>(text) else {
        return;
    };
    let Some(target) = frame.get("targetId").and_then(Value::as_str) else {
        return;
    };
    if let Some(connection) = shared.connections.lock().get(target) {
        let _ = connection.outbound.send(text.to_string());
    }
}
