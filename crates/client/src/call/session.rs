//! The call session: a linear offer/answer/ICE exchange over the signaling
//! store, driving local and remote media attachment.
//!
//! Caller path: `Idle → CapturingMedia → CreatingOffer → AwaitingAnswer →
//! Connected → Ended`. Callee path: `Idle → CapturingMedia → HasOffer →
//! CreatingAnswer → Connected → Ended`. Hang-up moves to `Ended` from any
//! state; a setup failure before the session exists releases everything and
//! returns to `Idle` with the error surfaced to the caller.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parlor_shared::{
    CandidateSide, IceCandidate, SdpKind, SessionDescription, SignalingError,
};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::call::media::{LocalMedia, MediaConstraints, MediaDevices};
use crate::call::peer::build_peer_connection;
use crate::call::store::{SignalingStore, SignalingUpdate, UpdateStream};
use crate::config::{ClientConfig, IceServerConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallRole {
    Caller,
    Callee,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Idle,
    CapturingMedia,
    CreatingOffer,
    AwaitingAnswer,
    HasOffer,
    CreatingAnswer,
    Connected,
    Ended,
}

#[derive(Debug, Clone)]
pub struct CallConfig {
    pub ice_servers: Vec<IceServerConfig>,
    pub constraints: MediaConstraints,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            ice_servers: ClientConfig::default().ice_servers,
            constraints: MediaConstraints::default(),
        }
    }
}

impl From<&ClientConfig> for CallConfig {
    fn from(config: &ClientConfig) -> Self {
        Self {
            ice_servers: config.ice_servers.clone(),
            constraints: MediaConstraints::default(),
        }
    }
}

#[derive(Default)]
struct CallResources {
    pc: Option<Arc<RTCPeerConnection>>,
    local: Option<LocalMedia>,
    session_id: Option<String>,
    role: Option<CallRole>,
    tasks: Vec<JoinHandle<()>>,
}

/// One point-to-point call. Exclusively owns its peer connection and local
/// media; whoever constructs it is responsible for `hang_up`.
pub struct CallSession {
    store: Arc<dyn SignalingStore>,
    devices: Arc<dyn MediaDevices>,
    config: CallConfig,
    state: watch::Sender<CallState>,
    remote: watch::Sender<Option<Arc<TrackRemote>>>,
    remote_candidates: Arc<AtomicUsize>,
    resources: Mutex<CallResources>,
}

impl CallSession {
    pub fn new(
        store: Arc<dyn SignalingStore>,
        devices: Arc<dyn MediaDevices>,
        config: CallConfig,
    ) -> Self {
        let (state, _) = watch::channel(CallState::Idle);
        let (remote, _) = watch::channel(None);
        Self {
            store,
            devices,
            config,
            state,
            remote,
            remote_candidates: Arc::new(AtomicUsize::new(0)),
            resources: Mutex::new(CallResources::default()),
        }
    }

    pub fn state(&self) -> CallState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CallState> {
        self.state.subscribe()
    }

    /// The remote peer's first incoming track; `None` until it arrives and
    /// again after teardown. This is the "remote video sink" seam.
    pub fn watch_remote(&self) -> watch::Receiver<Option<Arc<TrackRemote>>> {
        self.remote.subscribe()
    }

    /// How many remote ICE candidates the update listener has consumed.
    pub fn remote_candidate_count(&self) -> usize {
        self.remote_candidates.load(Ordering::SeqCst)
    }

    pub async fn session_id(&self) -> Option<String> {
        self.resources.lock().await.session_id.clone()
    }

    pub async fn role(&self) -> Option<CallRole> {
        self.resources.lock().await.role
    }

    /// Whether a peer connection is currently allocated.
    pub async fn is_active(&self) -> bool {
        self.resources.lock().await.pc.is_some()
    }

    /// Start a call as the caller: capture media, publish the offer, then
    /// wait for the answer. Returns the generated session id to share with
    /// the callee.
    pub async fn start(&self) -> Result<String, SignalingError> {
        let mut resources = self.resources.lock().await;
        if resources.pc.is_some() {
            return Err(SignalingError::Negotiation(
                "a call is already active".to_string(),
            ));
        }

        self.set_state(CallState::CapturingMedia);
        let mut local = match self.devices.capture(self.config.constraints).await {
            Ok(local) => local,
            Err(e) => {
                self.set_state(CallState::Idle);
                return Err(e.into());
            }
        };

        self.set_state(CallState::CreatingOffer);
        let pc = match build_peer_connection(&self.config.ice_servers).await {
            Ok(pc) => pc,
            Err(e) => {
                local.stop();
                self.set_state(CallState::Idle);
                return Err(e);
            }
        };

        let session_id = uuid::Uuid::new_v4().to_string();
        let setup = async {
            self.wire_peer(&pc, &local, &session_id, CandidateSide::Caller)
                .await?;
            self.store.create(&session_id).await?;

            let offer = pc.create_offer(None).await.map_err(|e| {
                SignalingError::Negotiation(format!("failed to create offer: {e}"))
            })?;
            let sdp = offer.sdp.clone();
            // Candidate gathering starts here; the emit handler is already
            // wired, so early candidates land in the record too.
            pc.set_local_description(offer).await.map_err(|e| {
                SignalingError::Negotiation(format!("failed to set local offer: {e}"))
            })?;
            self.store
                .put_offer(
                    &session_id,
                    SessionDescription {
                        kind: SdpKind::Offer,
                        sdp,
                    },
                )
                .await?;
            self.store.updates(&session_id, CandidateSide::Callee).await
        };

        let setup_result = setup.await;
        let updates = match setup_result {
            Ok(updates) => updates,
            Err(e) => {
                self.abort_setup(pc, &mut local).await;
                return Err(e);
            }
        };

        self.set_state(CallState::AwaitingAnswer);
        let consumer = self.spawn_update_consumer(pc.clone(), updates, CallRole::Caller);

        resources.pc = Some(pc);
        resources.local = Some(local);
        resources.session_id = Some(session_id.clone());
        resources.role = Some(CallRole::Caller);
        resources.tasks.push(consumer);

        info!(session = %session_id, "call offer published");
        Ok(session_id)
    }

    /// Join an existing call as the callee. Fails with `SessionNotFound`
    /// when the record does not exist or carries no offer yet.
    pub async fn join(&self, session_id: &str) -> Result<(), SignalingError> {
        let mut resources = self.resources.lock().await;
        if resources.pc.is_some() {
            return Err(SignalingError::Negotiation(
                "a call is already active".to_string(),
            ));
        }

        self.set_state(CallState::CapturingMedia);
        let mut local = match self.devices.capture(self.config.constraints).await {
            Ok(local) => local,
            Err(e) => {
                self.set_state(CallState::Idle);
                return Err(e.into());
            }
        };

        let pc = match build_peer_connection(&self.config.ice_servers).await {
            Ok(pc) => pc,
            Err(e) => {
                local.stop();
                self.set_state(CallState::Idle);
                return Err(e);
            }
        };

        let setup = async {
            self.wire_peer(&pc, &local, session_id, CandidateSide::Callee)
                .await?;

            let record = self.store.read(session_id).await?;
            let offer = record.and_then(|record| record.offer).ok_or_else(|| {
                SignalingError::SessionNotFound(session_id.to_string())
            })?;
            self.set_state(CallState::HasOffer);

            let remote_offer = RTCSessionDescription::offer(offer.sdp).map_err(|e| {
                SignalingError::Negotiation(format!("stored offer is invalid: {e}"))
            })?;
            pc.set_remote_description(remote_offer).await.map_err(|e| {
                SignalingError::Negotiation(format!("failed to apply remote offer: {e}"))
            })?;

            self.set_state(CallState::CreatingAnswer);
            let answer = pc.create_answer(None).await.map_err(|e| {
                SignalingError::Negotiation(format!("failed to create answer: {e}"))
            })?;
            let sdp = answer.sdp.clone();
            pc.set_local_description(answer).await.map_err(|e| {
                SignalingError::Negotiation(format!("failed to set local answer: {e}"))
            })?;

            // Merge the answer and the established marker into the record;
            // the offer and any recorded candidates stay untouched.
            self.store
                .put_answer(
                    session_id,
                    SessionDescription {
                        kind: SdpKind::Answer,
                        sdp,
                    },
                )
                .await?;

            self.store.updates(session_id, CandidateSide::Caller).await
        };

        let setup_result = setup.await;
        let updates = match setup_result {
            Ok(updates) => updates,
            Err(e) => {
                self.abort_setup(pc, &mut local).await;
                return Err(e);
            }
        };

        let consumer = self.spawn_update_consumer(pc.clone(), updates, CallRole::Callee);
        self.set_state(CallState::Connected);

        resources.pc = Some(pc);
        resources.local = Some(local);
        resources.session_id = Some(session_id.to_string());
        resources.role = Some(CallRole::Callee);
        resources.tasks.push(consumer);

        info!(session = %session_id, "joined call");
        Ok(())
    }

    /// Tear the call down: abort listeners, close the peer connection, stop
    /// every local track, detach the remote sink, clear the session id. Safe
    /// from any state, including before any call was started.
    pub async fn hang_up(&self) {
        let mut resources = self.resources.lock().await;
        for task in resources.tasks.drain(..) {
            task.abort();
        }
        if let Some(pc) = resources.pc.take() {
            if let Err(e) = pc.close().await {
                warn!("failed to close peer connection: {e}");
            }
        }
        if let Some(mut local) = resources.local.take() {
            local.stop();
        }
        resources.session_id = None;
        resources.role = None;
        let _ = self.remote.send_replace(None);
        self.set_state(CallState::Ended);
        info!("call torn down");
    }

    fn set_state(&self, next: CallState) {
        debug!("call state -> {next:?}");
        let _ = self.state.send_replace(next);
    }

    /// Attach local tracks, route the first remote track into the sink, and
    /// emit locally discovered ICE candidates into our side's collection.
    async fn wire_peer(
        &self,
        pc: &Arc<RTCPeerConnection>,
        local: &LocalMedia,
        session_id: &str,
        side: CandidateSide,
    ) -> Result<(), SignalingError> {
        for track in local.tracks() {
            pc.add_track(track.clone() as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| {
                    SignalingError::Negotiation(format!("failed to attach local track: {e}"))
                })?;
        }

        // Exactly one remote stream per session: the first track wins and
        // later ones are ignored.
        let remote = self.remote.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let remote = remote.clone();
            Box::pin(async move {
                let mut attached = false;
                remote.send_modify(|current| {
                    if current.is_none() {
                        *current = Some(track.clone());
                        attached = true;
                    }
                });
                if attached {
                    info!("remote track attached");
                } else {
                    debug!("ignoring additional remote track");
                }
            })
        }));

        let store = self.store.clone();
        let session = session_id.to_string();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let store = store.clone();
            let session = session.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ice candidate gathering complete");
                    return;
                };
                let init = match candidate.to_json() {
                    Ok(init) => init,
                    Err(e) => {
                        warn!("failed to serialize ice candidate: {e}");
                        return;
                    }
                };
                let record = IceCandidate {
                    candidate: init.candidate,
                    sdp_mid: init.sdp_mid,
                    sdp_mline_index: init.sdp_mline_index,
                    username_fragment: init.username_fragment,
                };
                if let Err(e) = store.add_candidate(&session, side, record).await {
                    warn!("failed to append ice candidate: {e}");
                }
            })
        }));

        Ok(())
    }

    /// Consume the remote side's updates: the answer (caller only) and ICE
    /// candidates. Candidate failures are logged, never fatal.
    fn spawn_update_consumer(
        &self,
        pc: Arc<RTCPeerConnection>,
        mut updates: UpdateStream,
        role: CallRole,
    ) -> JoinHandle<()> {
        let state = self.state.clone();
        let counter = self.remote_candidates.clone();
        tokio::spawn(async move {
            while let Some(update) = updates.next().await {
                match update {
                    SignalingUpdate::Answer(answer) => {
                        if role != CallRole::Caller {
                            continue;
                        }
                        let desc = match RTCSessionDescription::answer(answer.sdp) {
                            Ok(desc) => desc,
                            Err(e) => {
                                warn!("received invalid answer: {e}");
                                continue;
                            }
                        };
                        match pc.set_remote_description(desc).await {
                            Ok(()) => {
                                state.send_modify(|s| {
                                    if *s == CallState::AwaitingAnswer {
                                        *s = CallState::Connected;
                                    }
                                });
                                info!("remote answer applied, call connected");
                            }
                            Err(e) => warn!("failed to apply remote answer: {e}"),
                        }
                    }
                    SignalingUpdate::Candidate(candidate) => {
                        counter.fetch_add(1, Ordering::SeqCst);
                        let init = RTCIceCandidateInit {
                            candidate: candidate.candidate,
                            sdp_mid: candidate.sdp_mid,
                            sdp_mline_index: candidate.sdp_mline_index,
                            username_fragment: candidate.username_fragment,
                        };
                        if let Err(e) = pc.add_ice_candidate(init).await {
                            warn!("failed to add remote ice candidate: {e}");
                        }
                    }
                }
            }
            debug!("signaling update stream ended");
        })
    }

    async fn abort_setup(&self, pc: Arc<RTCPeerConnection>, local: &mut LocalMedia) {
        if let Err(e) = pc.close().await {
            warn!("failed to close peer connection: {e}");
        }
        local.stop();
        let _ = self.remote.send_replace(None);
        self.set_state(CallState::Idle);
    }
}
