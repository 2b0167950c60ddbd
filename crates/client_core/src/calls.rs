use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use shared::{
    domain::{ConversationId, UserId},
    protocol::{ClientSignal, IceCandidate, SessionDescription},
};
use webrtc_integration::{
    MediaDeviceError, MediaDevices, MediaSource, PeerConnection, PeerConnectionConfig,
    PeerConnector, PeerEvent, RemoteAudioSink,
};

use crate::{
    capture::stop_tracks,
    mic::{MicClaim, MicOwner, MicrophoneArbiter},
    transport::SignalTransport,
    ClientEvent,
};

/// Cap on candidates buffered for a conversation with no session yet, so a
/// misbehaving peer cannot grow the queue without bound.
const EARLY_CANDIDATE_CAP: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPhase {
    Idle,
    OutgoingRinging,
    IncomingRinging,
    Connecting,
    InCall,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallSnapshot {
    pub phase: CallPhase,
    pub conversation_id: Option<ConversationId>,
    pub remote_name: Option<String>,
    pub muted: bool,
}

impl CallSnapshot {
    fn idle() -> Self {
        Self {
            phase: CallPhase::Idle,
            conversation_id: None,
            remote_name: None,
            muted: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CallError {
    #[error("a call is already in progress")]
    AlreadyInCall,
    #[error("no ringing call to answer")]
    NoIncomingCall,
    #[error("no call in progress")]
    NoActiveCall,
    #[error("microphone busy: held by {0}")]
    MicrophoneBusy(MicOwner),
    #[error(transparent)]
    Microphone(#[from] MediaDeviceError),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
}

fn negotiation(err: anyhow::Error) -> CallError {
    CallError::Negotiation(err.to_string())
}

struct CallSession {
    conversation_id: ConversationId,
    phase: CallPhase,
    remote_name: Option<String>,
    pending_offer: Option<SessionDescription>,
    connection: Option<Arc<dyn PeerConnection>>,
    microphone: Option<Arc<dyn MediaSource>>,
    mic_claim: Option<MicClaim>,
    queued_candidates: Vec<IceCandidate>,
    remote_description_set: bool,
    muted: bool,
    event_task: Option<JoinHandle<()>>,
}

struct CallState {
    session: Option<CallSession>,
    // candidates that raced ahead of their session's creation
    early_candidates: HashMap<ConversationId, Vec<IceCandidate>>,
}

/// One voice-call session at a time, scoped to a conversation rather than
/// to whichever conversation is on screen. All device resources flow
/// through teardown on every exit path.
pub struct CallManager {
    devices: Arc<dyn MediaDevices>,
    connector: Arc<dyn PeerConnector>,
    sink: Arc<dyn RemoteAudioSink>,
    transport: Arc<dyn SignalTransport>,
    mic: Arc<MicrophoneArbiter>,
    config: PeerConnectionConfig,
    events: broadcast::Sender<ClientEvent>,
    state: Mutex<CallState>,
}

impl CallManager {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn RemoteAudioSink>,
        transport: Arc<dyn SignalTransport>,
        mic: Arc<MicrophoneArbiter>,
        config: PeerConnectionConfig,
        events: broadcast::Sender<ClientEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            devices,
            connector,
            sink,
            transport,
            mic,
            config,
            events,
            state: Mutex::new(CallState {
                session: None,
                early_candidates: HashMap::new(),
            }),
        })
    }

    pub async fn snapshot(&self) -> CallSnapshot {
        let state = self.state.lock().await;
        match &state.session {
            Some(session) => CallSnapshot {
                phase: session.phase,
                conversation_id: Some(session.conversation_id),
                remote_name: session.remote_name.clone(),
                muted: session.muted,
            },
            None => CallSnapshot::idle(),
        }
    }

    /// Caller path: microphone, peer connection, local tracks, offer.
    pub async fn start_call(
        self: &Arc<Self>,
        conversation_id: ConversationId,
    ) -> Result<(), CallError> {
        {
            let state = self.state.lock().await;
            if state.session.is_some() {
                return Err(CallError::AlreadyInCall);
            }
        }

        let claim = self
            .mic
            .claim(MicOwner::Call)
            .map_err(CallError::MicrophoneBusy)?;
        let microphone = self.devices.open_microphone().await?;

        let setup = self.negotiate_offer(&microphone).await;
        let (connection, offer) = match setup {
            Ok(ready) => ready,
            Err(err) => {
                stop_tracks(microphone.as_ref());
                drop(claim);
                return Err(err);
            }
        };

        let event_task = self.spawn_peer_event_task(conversation_id, Arc::clone(&connection));
        {
            let mut state = self.state.lock().await;
            if state.session.is_some() {
                // an incoming offer won the race while we were negotiating
                event_task.abort();
                let _ = connection.close().await;
                stop_tracks(microphone.as_ref());
                drop(claim);
                return Err(CallError::AlreadyInCall);
            }
            let queued = state
                .early_candidates
                .remove(&conversation_id)
                .unwrap_or_default();
            state.session = Some(CallSession {
                conversation_id,
                phase: CallPhase::OutgoingRinging,
                remote_name: None,
                pending_offer: None,
                connection: Some(connection),
                microphone: Some(microphone),
                mic_claim: Some(claim),
                queued_candidates: queued,
                remote_description_set: false,
                muted: false,
                event_task: Some(event_task),
            });
        }

        self.transport.send(ClientSignal::VoiceCallOffer {
            conversation_id,
            description: offer,
        });
        info!(
            conversation_id = conversation_id.0,
            "voice: outgoing call ringing"
        );
        self.emit_state().await;
        Ok(())
    }

    async fn negotiate_offer(
        &self,
        microphone: &Arc<dyn MediaSource>,
    ) -> Result<(Arc<dyn PeerConnection>, SessionDescription), CallError> {
        let connection = self
            .connector
            .create(self.config.clone())
            .await
            .map_err(negotiation)?;
        for track in microphone.audio_tracks() {
            connection.add_track(track).await.map_err(negotiation)?;
        }
        let offer = connection.create_offer().await.map_err(negotiation)?;
        connection
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation)?;
        Ok((connection, offer))
    }

    /// Callee path, first half: an inbound offer rings regardless of which
    /// conversation is on screen. A second offer while any session exists is
    /// declined without touching the live one.
    pub async fn on_remote_offer(
        &self,
        conversation_id: ConversationId,
        caller_id: UserId,
        caller_name: Option<String>,
        description: SessionDescription,
    ) {
        {
            let mut state = self.state.lock().await;
            if state.session.is_some() {
                warn!(
                    conversation_id = conversation_id.0,
                    "voice: declining offer while another call is active"
                );
                self.transport
                    .send(ClientSignal::VoiceCallEnd { conversation_id });
                return;
            }
            let queued = state
                .early_candidates
                .remove(&conversation_id)
                .unwrap_or_default();
            state.session = Some(CallSession {
                conversation_id,
                phase: CallPhase::IncomingRinging,
                remote_name: caller_name.clone(),
                pending_offer: Some(description),
                connection: None,
                microphone: None,
                mic_claim: None,
                queued_candidates: queued,
                remote_description_set: false,
                muted: false,
                event_task: None,
            });
        }
        info!(
            conversation_id = conversation_id.0,
            caller_id = caller_id.0,
            "voice: incoming call ringing"
        );
        let _ = self.events.send(ClientEvent::IncomingCall {
            conversation_id,
            caller_id,
            caller_name,
        });
        self.emit_state().await;
    }

    /// Callee path, second half: accept acquires the microphone, builds the
    /// connection, applies the stored offer and answers.
    pub async fn accept_call(self: &Arc<Self>) -> Result<(), CallError> {
        let (conversation_id, offer) = {
            let state = self.state.lock().await;
            match &state.session {
                Some(session) if session.phase == CallPhase::IncomingRinging => {
                    match session.pending_offer.clone() {
                        Some(offer) => (session.conversation_id, offer),
                        None => return Err(CallError::NoIncomingCall),
                    }
                }
                _ => return Err(CallError::NoIncomingCall),
            }
        };

        // surfaced without tearing down: the call keeps ringing so the user
        // can free the microphone and accept again
        let claim = self
            .mic
            .claim(MicOwner::Call)
            .map_err(CallError::MicrophoneBusy)?;
        let microphone = match self.devices.open_microphone().await {
            Ok(microphone) => microphone,
            Err(err) => {
                drop(claim);
                self.teardown(Some(conversation_id), true, true).await;
                return Err(err.into());
            }
        };

        let setup = self.negotiate_answer(&microphone, offer).await;
        let (connection, answer) = match setup {
            Ok(ready) => ready,
            Err(err) => {
                stop_tracks(microphone.as_ref());
                drop(claim);
                self.teardown(Some(conversation_id), true, true).await;
                return Err(err);
            }
        };

        let event_task = self.spawn_peer_event_task(conversation_id, Arc::clone(&connection));
        let queued = {
            let mut state = self.state.lock().await;
            let Some(session) = state
                .session
                .as_mut()
                .filter(|s| s.conversation_id == conversation_id)
            else {
                // remote hung up while we were negotiating
                event_task.abort();
                let _ = connection.close().await;
                stop_tracks(microphone.as_ref());
                drop(claim);
                return Err(CallError::NoIncomingCall);
            };
            session.connection = Some(Arc::clone(&connection));
            session.microphone = Some(microphone);
            session.mic_claim = Some(claim);
            session.pending_offer = None;
            session.remote_description_set = true;
            session.phase = CallPhase::Connecting;
            session.event_task = Some(event_task);
            std::mem::take(&mut session.queued_candidates)
        };
        self.apply_candidates(&connection, queued).await;

        self.transport.send(ClientSignal::VoiceCallAnswer {
            conversation_id,
            description: answer,
        });
        info!(conversation_id = conversation_id.0, "voice: call accepted");
        self.emit_state().await;
        Ok(())
    }

    async fn negotiate_answer(
        &self,
        microphone: &Arc<dyn MediaSource>,
        offer: SessionDescription,
    ) -> Result<(Arc<dyn PeerConnection>, SessionDescription), CallError> {
        let connection = self
            .connector
            .create(self.config.clone())
            .await
            .map_err(negotiation)?;
        for track in microphone.audio_tracks() {
            connection.add_track(track).await.map_err(negotiation)?;
        }
        connection
            .set_remote_description(offer)
            .await
            .map_err(negotiation)?;
        let answer = connection.create_answer().await.map_err(negotiation)?;
        connection
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation)?;
        Ok((connection, answer))
    }

    pub async fn reject_call(&self) -> Result<(), CallError> {
        let ringing = {
            let state = self.state.lock().await;
            matches!(
                &state.session,
                Some(session) if session.phase == CallPhase::IncomingRinging
            )
        };
        if !ringing {
            return Err(CallError::NoIncomingCall);
        }
        self.teardown(None, true, true).await;
        Ok(())
    }

    /// Caller path: the answer moves the session to connecting and unlocks
    /// candidate application.
    pub async fn on_remote_answer(
        &self,
        conversation_id: ConversationId,
        description: SessionDescription,
    ) {
        let connection = {
            let state = self.state.lock().await;
            match &state.session {
                Some(session)
                    if session.conversation_id == conversation_id
                        && session.phase == CallPhase::OutgoingRinging =>
                {
                    session.connection.clone()
                }
                _ => {
                    debug!(
                        conversation_id = conversation_id.0,
                        "voice: answer without a matching ringing session"
                    );
                    return;
                }
            }
        };
        let Some(connection) = connection else {
            return;
        };

        if let Err(err) = connection.set_remote_description(description).await {
            warn!("voice: failed to apply remote answer: {err}");
            let _ = self
                .events
                .send(ClientEvent::Error(format!("call failed: {err}")));
            self.teardown(Some(conversation_id), true, true).await;
            return;
        }

        let queued = {
            let mut state = self.state.lock().await;
            let Some(session) = state
                .session
                .as_mut()
                .filter(|s| s.conversation_id == conversation_id)
            else {
                return;
            };
            session.remote_description_set = true;
            session.phase = CallPhase::Connecting;
            std::mem::take(&mut session.queued_candidates)
        };
        self.apply_candidates(&connection, queued).await;
        self.emit_state().await;
    }

    /// Candidates are applied only once the connection exists and its remote
    /// description is set; anything earlier is queued, never dropped.
    pub async fn on_remote_candidate(
        &self,
        conversation_id: ConversationId,
        candidate: IceCandidate,
    ) {
        let connection = {
            let mut state = self.state.lock().await;
            match state
                .session
                .as_mut()
                .filter(|s| s.conversation_id == conversation_id)
            {
                Some(session) if session.remote_description_set => session.connection.clone(),
                Some(session) => {
                    session.queued_candidates.push(candidate);
                    return;
                }
                None => {
                    let queue = state.early_candidates.entry(conversation_id).or_default();
                    if queue.len() < EARLY_CANDIDATE_CAP {
                        queue.push(candidate);
                    } else {
                        warn!(
                            conversation_id = conversation_id.0,
                            "voice: early candidate queue full, dropping"
                        );
                    }
                    return;
                }
            }
        };
        if let Some(connection) = connection {
            self.apply_candidates(&connection, vec![candidate]).await;
        }
    }

    pub async fn on_remote_end(&self, conversation_id: ConversationId) {
        {
            let mut state = self.state.lock().await;
            state.early_candidates.remove(&conversation_id);
        }
        self.teardown(Some(conversation_id), false, true).await;
    }

    /// Local hangup. Safe to call at any time, including twice.
    pub async fn hang_up(&self) {
        self.teardown(None, true, true).await;
    }

    /// Mute flips `enabled` on the local tracks; no renegotiation, nothing
    /// signaled to the peer beyond the silence.
    pub async fn set_muted(&self, muted: bool) -> Result<(), CallError> {
        {
            let mut state = self.state.lock().await;
            let session = state.session.as_mut().ok_or(CallError::NoActiveCall)?;
            if let Some(microphone) = &session.microphone {
                for track in microphone.audio_tracks() {
                    track.set_enabled(!muted);
                }
            }
            session.muted = muted;
        }
        self.emit_state().await;
        Ok(())
    }

    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        let muted = {
            let state = self.state.lock().await;
            state
                .session
                .as_ref()
                .map(|s| s.muted)
                .ok_or(CallError::NoActiveCall)?
        };
        self.set_muted(!muted).await?;
        Ok(!muted)
    }

    fn spawn_peer_event_task(
        self: &Arc<Self>,
        conversation_id: ConversationId,
        connection: Arc<dyn PeerConnection>,
    ) -> JoinHandle<()> {
        let mut events = connection.subscribe_events();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                match event {
                    PeerEvent::IceCandidate(candidate) => {
                        manager.transport.send(ClientSignal::VoiceCallIceCandidate {
                            conversation_id,
                            candidate,
                        });
                    }
                    PeerEvent::RemoteTrackAdded { track_id } => {
                        manager.on_remote_track(conversation_id, &track_id).await;
                    }
                    PeerEvent::ConnectionFailed { reason } => {
                        warn!(
                            conversation_id = conversation_id.0,
                            "voice: connection failed: {reason}"
                        );
                        let _ = manager
                            .events
                            .send(ClientEvent::Error(format!("call failed: {reason}")));
                        // this task breaks right after, so no self-abort
                        manager.teardown(Some(conversation_id), true, false).await;
                        break;
                    }
                    PeerEvent::Closed => break,
                }
            }
        })
    }

    /// First remote media marks the call live.
    async fn on_remote_track(&self, conversation_id: ConversationId, track_id: &str) {
        let changed = {
            let mut state = self.state.lock().await;
            let Some(session) = state
                .session
                .as_mut()
                .filter(|s| s.conversation_id == conversation_id)
            else {
                return;
            };
            self.sink.attach(track_id);
            if session.phase != CallPhase::InCall {
                session.phase = CallPhase::InCall;
                true
            } else {
                false
            }
        };
        if changed {
            info!(conversation_id = conversation_id.0, "voice: call connected");
            self.emit_state().await;
        }
    }

    async fn apply_candidates(
        &self,
        connection: &Arc<dyn PeerConnection>,
        candidates: Vec<IceCandidate>,
    ) {
        for candidate in candidates {
            if let Err(err) = connection.add_ice_candidate(candidate).await {
                warn!("voice: failed to apply ice candidate: {err}");
            }
        }
    }

    /// Idempotent teardown: closes the connection, stops every local track,
    /// clears the remote sink and releases the microphone claim. With
    /// `notify_remote` an `end` signal mirrors the teardown to the peer.
    async fn teardown(
        &self,
        only_conversation: Option<ConversationId>,
        notify_remote: bool,
        abort_event_task: bool,
    ) {
        let session = {
            let mut state = self.state.lock().await;
            let in_scope = match (&state.session, only_conversation) {
                (Some(session), Some(id)) => session.conversation_id == id,
                _ => true,
            };
            if !in_scope {
                return;
            }
            state.session.take()
        };
        let Some(mut session) = session else {
            return;
        };

        if let Some(task) = session.event_task.take() {
            if abort_event_task {
                task.abort();
            }
        }
        if let Some(connection) = session.connection.take() {
            if let Err(err) = connection.close().await {
                debug!("voice: close on torn-down connection: {err}");
            }
        }
        if let Some(microphone) = session.microphone.take() {
            stop_tracks(microphone.as_ref());
        }
        self.sink.clear();
        drop(session.mic_claim.take());
        if notify_remote {
            self.transport.send(ClientSignal::VoiceCallEnd {
                conversation_id: session.conversation_id,
            });
        }
        info!(
            conversation_id = session.conversation_id.0,
            "voice: session closed"
        );
        self.emit_state().await;
    }

    async fn emit_state(&self) {
        let snapshot = self.snapshot().await;
        let _ = self.events.send(ClientEvent::CallStateChanged(snapshot));
    }
}

#[cfg(test)]
#[path = "tests/calls_tests.rs"]
mod tests;
