//! Core call state machine
//!
//! One orchestrator per session drives the whole lifecycle: acquire local
//! media, subscribe to the session's signaling channel, build the peer
//! connection, negotiate, monitor quality, and recover from transport drops.
//!
//! All state transitions happen inside a single engine loop that consumes
//! discrete events (signaling messages, transport state changes, locally
//! gathered candidates, retry timer firings) from one queue. Signaling
//! messages are therefore processed strictly in delivery order, and nothing
//! outside the loop mutates negotiation state.

use crate::candidates::CandidateQueue;
use crate::config::CallConfig;
use crate::events::{CallEvent, ConnectionState};
use crate::media::{MediaHandle, MediaProvider};
use crate::messenger::{ChatMessage, DataChannelMessenger};
use crate::quality::{ConnectionStats, PeerStatsSource, QualityMonitor};
use crate::reconnect::{ReconnectionSupervisor, RetryPolicy};
use crate::session::{Role, SessionIdentity};
use crate::signaling::{
    now_millis, CandidatePayload, ChannelEvent, DeviceInfo, MediaKind, SignalMessage,
    SignalingTransport,
};
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Label of the reliable ordered side-channel created by the initiator
const MESSAGES_CHANNEL_LABEL: &str = "messages";

/// Internal events consumed by the engine loop
enum EngineEvent {
    /// An event arrived on the session's signaling channel
    Signal(ChannelEvent),

    /// The transport reported a connection state change
    Transport(RTCPeerConnectionState),

    /// A locally gathered candidate is ready to trickle out
    LocalCandidate(CandidatePayload),

    /// A remote media track arrived
    RemoteTrack(Arc<TrackRemote>),

    /// The remote peer announced the side-channel (responder path)
    InboundChannel(Arc<RTCDataChannel>),

    /// The initiator's settle delay elapsed; publish the first offer
    PublishOffer,
}

/// Drives a single two-party call session.
///
/// Cheap to clone; all clones share the same engine. Events for the host
/// are delivered on the receiver returned by [`new`](Self::new).
#[derive(Clone)]
pub struct CallOrchestrator {
    engine: Arc<Engine>,
}

struct Engine {
    identity: SessionIdentity,
    config: CallConfig,
    signaling: Arc<dyn SignalingTransport>,
    media_provider: Arc<dyn MediaProvider>,
    events: mpsc::UnboundedSender<CallEvent>,
    tx: mpsc::UnboundedSender<EngineEvent>,
    state: RwLock<ConnectionState>,
    pc: RwLock<Option<Arc<RTCPeerConnection>>>,
    media: RwLock<Option<MediaHandle>>,
    candidates: CandidateQueue,
    messenger: Arc<DataChannelMessenger>,
    monitor: QualityMonitor,
    supervisor: ReconnectionSupervisor,
    ended: AtomicBool,
    loop_task: Mutex<Option<JoinHandle<()>>>,
    signal_task: Mutex<Option<JoinHandle<()>>>,
    settle_task: Mutex<Option<JoinHandle<()>>>,
}

impl CallOrchestrator {
    /// Create an orchestrator for the given session.
    ///
    /// Role follows deterministically from the two user ids; nothing is
    /// negotiated at runtime. The returned receiver carries every host-facing
    /// event for the session.
    pub async fn new(
        identity: SessionIdentity,
        config: CallConfig,
        signaling: Arc<dyn SignalingTransport>,
        media_provider: Arc<dyn MediaProvider>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<CallEvent>)> {
        config.validate()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (engine_tx, engine_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        let messenger = DataChannelMessenger::new(
            identity.clone(),
            Arc::clone(&signaling),
            events_tx.clone(),
        );
        let monitor = QualityMonitor::new(config.stats_interval(), events_tx.clone());
        let supervisor = ReconnectionSupervisor::new(RetryPolicy::from_config(&config), retry_tx);

        info!(
            session_id = %identity.session_id,
            local = %identity.local_user_id,
            remote = %identity.remote_user_id,
            role = ?identity.role(),
            "creating call orchestrator"
        );

        let engine = Arc::new(Engine {
            identity,
            config,
            signaling,
            media_provider,
            events: events_tx,
            tx: engine_tx,
            state: RwLock::new(ConnectionState::Initializing),
            pc: RwLock::new(None),
            media: RwLock::new(None),
            candidates: CandidateQueue::new(),
            messenger,
            monitor,
            supervisor,
            ended: AtomicBool::new(false),
            loop_task: Mutex::new(None),
            signal_task: Mutex::new(None),
            settle_task: Mutex::new(None),
        });

        let loop_engine = Arc::clone(&engine);
        let handle = tokio::spawn(async move {
            loop_engine.run(engine_rx, retry_rx).await;
        });
        *engine.loop_task.lock().await = Some(handle);

        Ok((Self { engine }, events_rx))
    }

    /// Session identity this orchestrator was built for
    pub fn identity(&self) -> &SessionIdentity {
        &self.engine.identity
    }

    /// Role of the local participant
    pub fn role(&self) -> Role {
        self.engine.identity.role()
    }

    /// Acquire fresh local media and bring the session up
    pub async fn initialize(&self) -> Result<()> {
        let media = self
            .engine
            .media_provider
            .acquire(&self.engine.config.media)
            .await;
        self.engine.bring_up(media).await
    }

    /// Bring the session up with a capture handle the caller already owns
    pub async fn initialize_with_media(&self, handle: MediaHandle) -> Result<()> {
        let media = self.engine.media_provider.reuse(handle).await;
        self.engine.bring_up(media).await
    }

    /// Flip the local audio track and announce the new state to the remote
    /// peer. Returns the new enabled state.
    pub async fn toggle_audio(&self) -> Result<bool> {
        let media = self.engine.local_media().await?;
        let enabled = media.toggle_audio();
        if let Err(e) = self
            .engine
            .messenger
            .send_media_toggle(MediaKind::Audio, enabled)
            .await
        {
            warn!(error = %e, "failed to announce audio toggle");
        }
        Ok(enabled)
    }

    /// Flip the local video track and announce the new state to the remote
    /// peer. Returns the new enabled state.
    pub async fn toggle_video(&self) -> Result<bool> {
        let media = self.engine.local_media().await?;
        let enabled = media.toggle_video();
        if let Err(e) = self
            .engine
            .messenger
            .send_media_toggle(MediaKind::Video, enabled)
            .await
        {
            warn!(error = %e, "failed to announce video toggle");
        }
        Ok(enabled)
    }

    /// Send a chat message over the side-channel, or once over the signaling
    /// fallback when the side-channel is not open.
    pub async fn send_message(&self, sender_name: &str, content: &str) -> Result<ChatMessage> {
        if self.engine.ended.load(Ordering::SeqCst) {
            return Err(Error::CallEnded);
        }
        self.engine.messenger.send_chat(sender_name, content).await
    }

    /// Describe local capture devices to the remote peer
    pub async fn send_device_info(&self, info: DeviceInfo) -> Result<()> {
        if self.engine.ended.load(Ordering::SeqCst) {
            return Err(Error::CallEnded);
        }
        self.engine.messenger.send_device_info(info).await
    }

    /// Force an immediate full renegotiation with a fresh retry budget
    pub async fn reconnect(&self) -> Result<()> {
        if self.engine.ended.load(Ordering::SeqCst) {
            return Err(Error::CallEnded);
        }
        info!("manual reconnect requested");
        self.engine.supervisor.cancel().await;
        self.engine.supervisor.reset();
        self.engine.monitor.stop().await;
        self.engine.set_state(ConnectionState::Reconnecting).await;
        self.engine.rebuild(0).await;
        Ok(())
    }

    /// Tear the session down. Idempotent and callable from any state.
    pub async fn end_call(&self) -> Result<()> {
        if self.engine.ended.swap(true, Ordering::SeqCst) {
            debug!("end_call on an already ended session");
            return Ok(());
        }
        info!(session_id = %self.engine.identity.session_id, "ending call");

        self.engine.monitor.stop().await;
        self.engine.supervisor.cancel().await;
        if let Some(task) = self.engine.settle_task.lock().await.take() {
            task.abort();
        }

        self.engine.messenger.detach().await;
        if let Some(pc) = self.engine.pc.write().await.take() {
            if let Err(e) = pc.close().await {
                warn!(error = %e, "error closing peer connection");
            }
        }
        if let Some(media) = self.engine.media.write().await.take() {
            media.stop();
        }
        if let Err(e) = self
            .engine
            .signaling
            .unsubscribe(&self.engine.identity.channel_id())
            .await
        {
            warn!(error = %e, "error unsubscribing from signaling");
        }
        if let Some(task) = self.engine.signal_task.lock().await.take() {
            task.abort();
        }

        self.engine.set_state(ConnectionState::Ended).await;

        if let Some(task) = self.engine.loop_task.lock().await.take() {
            task.abort();
        }
        Ok(())
    }

    /// Current lifecycle state
    pub async fn state(&self) -> ConnectionState {
        *self.engine.state.read().await
    }

    /// Most recent quality sample (defaults until the first sample lands)
    pub async fn stats(&self) -> ConnectionStats {
        self.engine.monitor.latest().await
    }
}

impl Engine {
    async fn run(
        self: Arc<Self>,
        mut engine_rx: mpsc::UnboundedReceiver<EngineEvent>,
        mut retry_rx: mpsc::UnboundedReceiver<u32>,
    ) {
        loop {
            tokio::select! {
                event = engine_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                attempt = retry_rx.recv() => match attempt {
                    Some(attempt) => self.rebuild(attempt).await,
                    None => break,
                },
            }
        }
    }

    async fn handle_event(self: &Arc<Self>, event: EngineEvent) {
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        match event {
            EngineEvent::Signal(ChannelEvent::Signal(msg)) => {
                if self.identity.is_self(msg.from()) {
                    return;
                }
                if let Err(e) = self.handle_signal(msg).await {
                    if e.is_recoverable_locally() {
                        debug!(error = %e, "dropped out-of-order signaling message");
                    } else if e.is_fatal() {
                        self.fail(&e).await;
                    } else {
                        warn!(error = %e, "signaling message handling failed");
                    }
                }
            }
            EngineEvent::Signal(ChannelEvent::Broadcast(msg)) => {
                self.messenger.handle_inbound(msg);
            }
            EngineEvent::Transport(state) => self.handle_transport(state).await,
            EngineEvent::LocalCandidate(payload) => {
                self.publish_signal(SignalMessage::IceCandidate {
                    from: self.identity.local_user_id.clone(),
                    to: self.identity.remote_user_id.clone(),
                    timestamp: now_millis(),
                    candidate: payload,
                })
                .await;
            }
            EngineEvent::RemoteTrack(track) => {
                info!(kind = ?track.kind(), "remote track arrived");
                let _ = self.events.send(CallEvent::RemoteTrack(track));
            }
            EngineEvent::InboundChannel(dc) => {
                info!(label = %dc.label(), "remote side-channel announced");
                self.messenger.attach(dc).await;
            }
            EngineEvent::PublishOffer => {
                if let Err(e) = self.publish_offer().await {
                    warn!(error = %e, "initial offer failed");
                }
            }
        }
    }

    /// Full startup pipeline shared by both initialize variants
    async fn bring_up(self: &Arc<Self>, media: Result<MediaHandle>) -> Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(Error::CallEnded);
        }
        self.set_state(ConnectionState::Initializing).await;

        let media = match media {
            Ok(media) => media,
            Err(e) => {
                self.fail(&e).await;
                return Err(e);
            }
        };
        let _ = self.events.send(CallEvent::LocalMedia(media.clone()));
        *self.media.write().await = Some(media);

        // A forwarder from an earlier initialize keeps its subscription;
        // subscribing again would deliver every signaling message twice
        if self.signal_task.lock().await.is_none() {
            let channel = self.identity.channel_id();
            let subscription = match self.signaling.subscribe(&channel).await {
                Ok(rx) => rx,
                Err(e) => {
                    let e = Error::SignalingSetup(e.to_string());
                    self.fail(&e).await;
                    return Err(e);
                }
            };

            // Forward signaling into the engine loop in delivery order
            let tx = self.tx.clone();
            let forward = tokio::spawn(async move {
                let mut subscription = subscription;
                while let Some(event) = subscription.recv().await {
                    if tx.send(EngineEvent::Signal(event)).is_err() {
                        break;
                    }
                }
            });
            *self.signal_task.lock().await = Some(forward);
        }

        if let Err(e) = self.build_transport().await {
            self.fail(&e).await;
            return Err(e);
        }
        self.set_state(ConnectionState::Connecting).await;

        if self.identity.role().is_initiator() {
            if let Err(e) = self.open_data_channel().await {
                self.fail(&e).await;
                return Err(e);
            }

            // Give the remote subscription a moment to become active before
            // the first offer hits the channel
            let tx = self.tx.clone();
            let delay = self.config.offer_settle_delay();
            let settle = tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(EngineEvent::PublishOffer);
            });
            *self.settle_task.lock().await = Some(settle);
        }

        Ok(())
    }

    /// Build a fresh peer connection, add local tracks and wire callbacks
    /// into the engine loop.
    async fn build_transport(&self) -> Result<()> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| Error::PeerConnection(format!("Failed to register codecs: {}", e)))?;

        let interceptor_registry = register_default_interceptors(
            Default::default(),
            &mut media_engine,
        )
        .map_err(|e| Error::PeerConnection(format!("Failed to register interceptors: {}", e)))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(interceptor_registry)
            .build();

        let ice_servers: Vec<RTCIceServer> = self
            .config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .chain(self.config.turn_servers.iter().map(|turn| {
                #[allow(clippy::needless_update)]
                RTCIceServer {
                    urls: vec![turn.url.clone()],
                    username: turn.username.clone(),
                    credential: turn.credential.clone(),
                    ..Default::default()
                }
            }))
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(api.new_peer_connection(rtc_config).await.map_err(|e| {
            Error::PeerConnection(format!("Failed to create peer connection: {}", e))
        })?);

        if let Some(media) = self.media.read().await.clone() {
            pc.add_track(Arc::clone(&media.audio) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::PeerConnection(format!("Failed to add audio track: {}", e)))?;
            pc.add_track(Arc::clone(&media.video) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Error::PeerConnection(format!("Failed to add video track: {}", e)))?;
        }

        let tx = self.tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let _ = tx.send(EngineEvent::Transport(state));
            Box::pin(async {})
        }));

        let tx = self.tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = tx.send(EngineEvent::LocalCandidate(
                                CandidatePayload::from_init(init),
                            ));
                        }
                        Err(e) => warn!(error = %e, "failed to serialize local candidate"),
                    }
                }
            })
        }));

        let tx = self.tx.clone();
        pc.on_track(Box::new(move |track: Arc<TrackRemote>, _receiver, _transceiver| {
            let _ = tx.send(EngineEvent::RemoteTrack(track));
            Box::pin(async {})
        }));

        let tx = self.tx.clone();
        pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
            let _ = tx.send(EngineEvent::InboundChannel(dc));
            Box::pin(async {})
        }));

        *self.pc.write().await = Some(pc);
        Ok(())
    }

    /// Initiator-only: create the reliable ordered side-channel
    async fn open_data_channel(&self) -> Result<()> {
        let pc = self.current_pc().await?;
        let dc = pc
            .create_data_channel(MESSAGES_CHANNEL_LABEL, Some(RTCDataChannelInit::default()))
            .await
            .map_err(|e| Error::DataChannel(format!("Failed to create data channel: {}", e)))?;
        self.messenger.attach(dc).await;
        Ok(())
    }

    async fn handle_signal(&self, msg: SignalMessage) -> Result<()> {
        match msg {
            SignalMessage::Offer { sdp, from, .. } => {
                let pc = self.current_pc().await?;
                let state = pc.signaling_state();
                if !matches!(
                    state,
                    RTCSignalingState::Stable | RTCSignalingState::HaveLocalOffer
                ) {
                    return Err(Error::InvalidNegotiationState(format!(
                        "offer from {} in signaling state {:?}",
                        from, state
                    )));
                }

                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| Error::Sdp(format!("Invalid offer: {}", e)))?;
                pc.set_remote_description(offer)
                    .await
                    .map_err(|e| Error::Sdp(format!("Failed to apply offer: {}", e)))?;
                debug!(from = %from, "remote offer applied");

                self.apply_queued_candidates(&pc).await;

                // Answer only when the offer actually moved us into
                // have-remote-offer; glare losers stay silent here
                if pc.signaling_state() == RTCSignalingState::HaveRemoteOffer {
                    let answer = pc
                        .create_answer(None)
                        .await
                        .map_err(|e| Error::Sdp(format!("Failed to create answer: {}", e)))?;
                    let answer_sdp = answer.sdp.clone();
                    pc.set_local_description(answer)
                        .await
                        .map_err(|e| Error::Sdp(format!("Failed to apply local answer: {}", e)))?;
                    self.publish_signal(SignalMessage::Answer {
                        from: self.identity.local_user_id.clone(),
                        to: self.identity.remote_user_id.clone(),
                        timestamp: now_millis(),
                        sdp: answer_sdp,
                    })
                    .await;
                }
                Ok(())
            }

            SignalMessage::Answer { sdp, from, .. } => {
                let pc = self.current_pc().await?;
                let state = pc.signaling_state();
                if state != RTCSignalingState::HaveLocalOffer {
                    return Err(Error::InvalidNegotiationState(format!(
                        "answer from {} in signaling state {:?}",
                        from, state
                    )));
                }

                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| Error::Sdp(format!("Invalid answer: {}", e)))?;
                pc.set_remote_description(answer)
                    .await
                    .map_err(|e| Error::Sdp(format!("Failed to apply answer: {}", e)))?;
                debug!(from = %from, "remote answer applied");

                self.apply_queued_candidates(&pc).await;
                Ok(())
            }

            SignalMessage::IceCandidate { candidate, .. } => {
                let init = candidate.to_init();
                if self.candidates.offer(init.clone()) {
                    debug!(buffered = self.candidates.len(), "candidate queued");
                    return Ok(());
                }
                let pc = self.current_pc().await?;
                if let Err(e) = pc.add_ice_candidate(init).await {
                    // Stale and duplicate candidates are routine
                    debug!(error = %e, "live candidate not applied");
                }
                Ok(())
            }
        }
    }

    /// Drain the queue once and apply each buffered candidate in arrival
    /// order, tolerating individual failures.
    async fn apply_queued_candidates(&self, pc: &Arc<RTCPeerConnection>) {
        let buffered = self.candidates.drain();
        if buffered.is_empty() {
            return;
        }
        debug!(count = buffered.len(), "applying buffered candidates");
        for init in buffered {
            if let Err(e) = pc.add_ice_candidate(init).await {
                debug!(error = %e, "buffered candidate not applied");
            }
        }
    }

    async fn handle_transport(&self, state: RTCPeerConnectionState) {
        debug!(transport_state = ?state, "transport state change");
        match state {
            RTCPeerConnectionState::Connecting => {
                // Leaving connected for any reason stops the sampler
                self.monitor.stop().await;
                self.set_state(ConnectionState::Connecting).await;
            }
            RTCPeerConnectionState::Connected => {
                self.supervisor.cancel().await;
                self.supervisor.reset();
                self.set_state(ConnectionState::Connected).await;

                let pc = self.pc.read().await.clone();
                let media = self.media.read().await.clone();
                if let (Some(pc), Some(media)) = (pc, media) {
                    self.monitor
                        .start(Arc::new(PeerStatsSource::new(pc, media.settings)))
                        .await;
                }
            }
            RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => {
                self.monitor.stop().await;

                let current = *self.state.read().await;

                // Failed is terminal for transport events; the dying peer
                // connection keeps reporting after the budget is gone
                if current == ConnectionState::Failed {
                    return;
                }

                // A disconnect immediately followed by a failure on the same
                // transport must not burn two attempts
                if current == ConnectionState::Reconnecting && self.supervisor.pending().await {
                    return;
                }

                self.set_state(ConnectionState::Reconnecting).await;
                if self.supervisor.schedule().await.is_none() {
                    self.fail(&Error::ConnectionLost(format!(
                        "{} reconnection attempts exhausted",
                        self.config.max_reconnect_attempts
                    )))
                    .await;
                }
            }
            _ => {}
        }
    }

    /// One supervised recovery attempt: discard the transport and negotiate
    /// from scratch.
    async fn rebuild(self: &Arc<Self>, attempt: u32) {
        if self.ended.load(Ordering::SeqCst) {
            return;
        }
        info!(attempt, "rebuilding transport");

        if let Some(pc) = self.pc.write().await.take() {
            if let Err(e) = pc.close().await {
                debug!(error = %e, "old peer connection close failed");
            }
        }
        self.candidates.reset();
        self.messenger.detach().await;

        if let Err(e) = self.build_transport().await {
            self.fail(&e).await;
            return;
        }
        self.set_state(ConnectionState::Connecting).await;

        if self.identity.role().is_initiator() {
            if let Err(e) = self.open_data_channel().await {
                warn!(error = %e, "side-channel recreation failed");
            }
            if let Err(e) = self.publish_offer().await {
                warn!(error = %e, "renegotiation offer failed");
            }
        }
    }

    /// Initiator-only: create an offer, apply it locally and publish it
    async fn publish_offer(&self) -> Result<()> {
        if self.ended.load(Ordering::SeqCst) {
            return Err(Error::CallEnded);
        }
        let pc = self.current_pc().await?;
        let state = pc.signaling_state();
        if !matches!(
            state,
            RTCSignalingState::Stable | RTCSignalingState::HaveLocalOffer
        ) {
            return Err(Error::InvalidNegotiationState(format!(
                "cannot offer in signaling state {:?}",
                state
            )));
        }

        let offer = pc
            .create_offer(None)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to create offer: {}", e)))?;
        let sdp = offer.sdp.clone();
        pc.set_local_description(offer)
            .await
            .map_err(|e| Error::Sdp(format!("Failed to apply local offer: {}", e)))?;

        info!("publishing offer");
        self.publish_signal(SignalMessage::Offer {
            from: self.identity.local_user_id.clone(),
            to: self.identity.remote_user_id.clone(),
            timestamp: now_millis(),
            sdp,
        })
        .await;
        Ok(())
    }

    async fn publish_signal(&self, msg: SignalMessage) {
        if let Err(e) = self
            .signaling
            .publish(&self.identity.channel_id(), ChannelEvent::Signal(msg))
            .await
        {
            warn!(error = %e, "failed to publish signaling message");
        }
    }

    /// Single fatal-error entry point: the host always sees the state change
    /// and the sanitized error together.
    async fn fail(&self, err: &Error) {
        error!(error = %err, "fatal call failure");
        self.monitor.stop().await;
        self.supervisor.cancel().await;
        self.set_state(ConnectionState::Failed).await;
        let _ = self.events.send(CallEvent::Error(err.user_message()));
    }

    async fn set_state(&self, next: ConnectionState) {
        {
            let mut state = self.state.write().await;
            // Ended is terminal; nothing transitions out of it
            if *state == ConnectionState::Ended {
                return;
            }
            if *state != next {
                info!(from = %*state, to = %next, "state transition");
            }
            *state = next;
        }
        let _ = self.events.send(CallEvent::StateChanged(next));
    }

    async fn local_media(&self) -> Result<MediaHandle> {
        self.media
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::MediaAccess("local media not initialized".to_string()))
    }

    async fn current_pc(&self) -> Result<Arc<RTCPeerConnection>> {
        self.pc
            .read()
            .await
            .clone()
            .ok_or_else(|| Error::PeerConnection("no active peer connection".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::SyntheticMediaProvider;
    use crate::signaling::memory::MemorySignaling;

    fn config() -> CallConfig {
        CallConfig {
            offer_settle_delay_ms: 10,
            ..CallConfig::default()
        }
    }

    async fn orchestrator(
        local: &str,
        remote: &str,
        signaling: Arc<MemorySignaling>,
    ) -> (CallOrchestrator, mpsc::UnboundedReceiver<CallEvent>) {
        let identity = SessionIdentity::new("s1", local, remote);
        CallOrchestrator::new(
            identity,
            config(),
            signaling,
            Arc::new(SyntheticMediaProvider::default()),
        )
        .await
        .unwrap()
    }

    /// Consume buffered events until the wanted state change arrives
    async fn await_state_event(
        events: &mut mpsc::UnboundedReceiver<CallEvent>,
        want: ConnectionState,
    ) {
        tokio::time::timeout(std::time::Duration::from_secs(5), async {
            loop {
                match events.recv().await {
                    Some(CallEvent::StateChanged(s)) if s == want => return,
                    Some(_) => {}
                    None => panic!("event channel closed before {}", want),
                }
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for state {}", want));
    }

    fn send_transport(orchestrator: &CallOrchestrator, state: RTCPeerConnectionState) {
        let _ = orchestrator.engine.tx.send(EngineEvent::Transport(state));
    }

    #[tokio::test]
    async fn test_role_is_deterministic() {
        let signaling = MemorySignaling::new();
        let (alice, _rx) = orchestrator("alice", "bob", Arc::clone(&signaling)).await;
        let (bob, _rx) = orchestrator("bob", "alice", signaling).await;
        assert_eq!(alice.role(), Role::Initiator);
        assert_eq!(bob.role(), Role::Responder);
        let _ = alice.end_call().await;
        let _ = bob.end_call().await;
    }

    #[tokio::test]
    async fn test_media_denial_is_fatal() {
        let signaling = MemorySignaling::new();
        let identity = SessionIdentity::new("s1", "alice", "bob");
        let (orchestrator, mut events) = CallOrchestrator::new(
            identity,
            config(),
            signaling,
            Arc::new(SyntheticMediaProvider { deny_access: true }),
        )
        .await
        .unwrap();

        let result = orchestrator.initialize().await;
        assert!(matches!(result, Err(Error::MediaAccess(_))));
        assert_eq!(orchestrator.state().await, ConnectionState::Failed);

        // Initializing, then Failed, then the sanitized error
        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let CallEvent::Error(msg) = event {
                assert!(msg.contains("permissions"));
                saw_error = true;
            }
        }
        assert!(saw_error);
        let _ = orchestrator.end_call().await;
    }

    #[tokio::test]
    async fn test_error_fires_once_when_retries_exhausted() {
        let signaling = MemorySignaling::new();
        let identity = SessionIdentity::new("s1", "bob", "alice");
        let cfg = CallConfig {
            offer_settle_delay_ms: 10,
            max_reconnect_attempts: 2,
            reconnect_backoff_step_ms: 1,
            ..CallConfig::default()
        };
        let (orchestrator, mut events) = CallOrchestrator::new(
            identity,
            cfg,
            signaling,
            Arc::new(SyntheticMediaProvider::default()),
        )
        .await
        .unwrap();

        orchestrator.initialize().await.unwrap();
        await_state_event(&mut events, ConnectionState::Connecting).await;

        // Burn both supervised attempts, letting each rebuild complete
        for _ in 0..2 {
            send_transport(&orchestrator, RTCPeerConnectionState::Disconnected);
            await_state_event(&mut events, ConnectionState::Reconnecting).await;
            await_state_event(&mut events, ConnectionState::Connecting).await;
        }

        // Third drop exhausts the budget
        send_transport(&orchestrator, RTCPeerConnectionState::Disconnected);
        await_state_event(&mut events, ConnectionState::Failed).await;

        // The dying transport keeps reporting; failed stays terminal
        send_transport(&orchestrator, RTCPeerConnectionState::Disconnected);
        send_transport(&orchestrator, RTCPeerConnectionState::Failed);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(orchestrator.state().await, ConnectionState::Failed);

        // Exactly one sanitized error, and no retry activity after failed
        let mut errors = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                CallEvent::Error(_) => errors += 1,
                CallEvent::StateChanged(s) => {
                    assert_ne!(s, ConnectionState::Reconnecting);
                }
                _ => {}
            }
        }
        assert_eq!(errors, 1);

        let _ = orchestrator.end_call().await;
    }

    #[tokio::test]
    async fn test_retry_counter_resets_on_recovery() {
        let signaling = MemorySignaling::new();
        let identity = SessionIdentity::new("s1", "bob", "alice");
        let cfg = CallConfig {
            offer_settle_delay_ms: 10,
            max_reconnect_attempts: 1,
            reconnect_backoff_step_ms: 1,
            ..CallConfig::default()
        };
        let (orchestrator, mut events) = CallOrchestrator::new(
            identity,
            cfg,
            signaling,
            Arc::new(SyntheticMediaProvider::default()),
        )
        .await
        .unwrap();

        orchestrator.initialize().await.unwrap();
        await_state_event(&mut events, ConnectionState::Connecting).await;

        // First drop uses the single attempt
        send_transport(&orchestrator, RTCPeerConnectionState::Disconnected);
        await_state_event(&mut events, ConnectionState::Reconnecting).await;
        await_state_event(&mut events, ConnectionState::Connecting).await;

        // Recovery restores the full budget
        send_transport(&orchestrator, RTCPeerConnectionState::Connected);
        await_state_event(&mut events, ConnectionState::Connected).await;

        // So the next drop schedules again instead of failing
        send_transport(&orchestrator, RTCPeerConnectionState::Disconnected);
        await_state_event(&mut events, ConnectionState::Reconnecting).await;
        await_state_event(&mut events, ConnectionState::Connecting).await;

        assert_ne!(orchestrator.state().await, ConnectionState::Failed);
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, CallEvent::Error(_)));
        }

        let _ = orchestrator.end_call().await;
    }

    #[tokio::test]
    async fn test_sampler_stops_when_transport_leaves_connected() {
        let signaling = MemorySignaling::new();
        let (orchestrator, mut events) = orchestrator("bob", "alice", signaling).await;
        orchestrator.initialize().await.unwrap();
        await_state_event(&mut events, ConnectionState::Connecting).await;

        send_transport(&orchestrator, RTCPeerConnectionState::Connected);
        await_state_event(&mut events, ConnectionState::Connected).await;
        // The sampler starts right after the state change lands
        let mut running = false;
        for _ in 0..100 {
            if orchestrator.engine.monitor.is_running().await {
                running = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert!(running);

        send_transport(&orchestrator, RTCPeerConnectionState::Connecting);
        await_state_event(&mut events, ConnectionState::Connecting).await;
        assert!(!orchestrator.engine.monitor.is_running().await);

        let _ = orchestrator.end_call().await;
    }

    #[tokio::test]
    async fn test_second_initialize_keeps_single_subscription() {
        let signaling = MemorySignaling::new();
        let (orchestrator, _events) =
            orchestrator("bob", "alice", Arc::clone(&signaling)).await;

        orchestrator.initialize().await.unwrap();
        orchestrator.initialize().await.unwrap();
        assert_eq!(signaling.subscriber_count("call:s1").await, 1);

        let _ = orchestrator.end_call().await;
    }

    #[tokio::test]
    async fn test_end_call_is_idempotent() {
        let signaling = MemorySignaling::new();
        let (orchestrator, _events) = orchestrator("alice", "bob", signaling).await;

        orchestrator.end_call().await.unwrap();
        orchestrator.end_call().await.unwrap();
        assert_eq!(orchestrator.state().await, ConnectionState::Ended);
    }

    #[tokio::test]
    async fn test_operations_after_end_are_rejected() {
        let signaling = MemorySignaling::new();
        let (orchestrator, _events) = orchestrator("alice", "bob", signaling).await;
        orchestrator.end_call().await.unwrap();

        assert!(matches!(
            orchestrator.send_message("Alice", "hi").await,
            Err(Error::CallEnded)
        ));
        assert!(matches!(
            orchestrator.reconnect().await,
            Err(Error::CallEnded)
        ));
        assert!(matches!(
            orchestrator.initialize().await,
            Err(Error::CallEnded)
        ));
    }
}
