use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use shared::{
    domain::{ConversationId, UserId},
    protocol::{AttachmentPayload, ClientSignal, ConversationSummary, MessagePayload, ServerSignal},
};
use webrtc_integration::{
    AudioChunk, AudioRecorder, MediaDeviceError, MediaDevices, MediaSource, PeerConnection,
    PeerConnectionConfig, PeerConnector, RecorderSession, RemoteAudioSink,
};

pub mod api;
pub mod calls;
pub mod capture;
pub mod directory;
pub mod error;
pub mod messages;
pub mod mic;
pub mod scheduler;
pub mod transport;
pub mod typing;

pub use calls::{CallError, CallPhase, CallSnapshot};
pub use capture::{CaptureError, RecordingIntent};
pub use error::SendError;
pub use messages::{ChatMessage, MergeOutcome};
pub use transport::{SignalTransport, SocketTransport};

use api::{ConversationApi, OutgoingMessage, UploadService};
use calls::CallManager;
use capture::CapturePipeline;
use directory::ConversationDirectory;
use messages::MessageLog;
use mic::MicrophoneArbiter;
use scheduler::{Scheduler, TokioScheduler};
use typing::TypingCoordinator;

/// Who this client is, used to tell local from remote senders.
#[derive(Debug, Clone)]
pub struct LocalIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

/// Passive state-change stream for the surrounding application. The engine
/// issues no rendering calls; everything observable flows through here or
/// the pollable snapshot getters.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    ConversationsUpdated,
    MessagesUpdated {
        conversation_id: ConversationId,
    },
    TypingChanged {
        conversation_id: ConversationId,
        names: Vec<String>,
    },
    CallStateChanged(CallSnapshot),
    IncomingCall {
        conversation_id: ConversationId,
        caller_id: UserId,
        caller_name: Option<String>,
    },
    UploadProgress {
        token: Uuid,
        fraction: f32,
    },
    RecordingStateChanged {
        active: bool,
    },
    TransportStatusChanged {
        connected: bool,
    },
    Error(String),
}

pub struct MissingMediaDevices;

#[async_trait]
impl MediaDevices for MissingMediaDevices {
    async fn open_microphone(&self) -> std::result::Result<Arc<dyn MediaSource>, MediaDeviceError> {
        Err(MediaDeviceError::Unavailable)
    }
}

pub struct MissingAudioRecorder;

#[async_trait]
impl AudioRecorder for MissingAudioRecorder {
    async fn start(
        &self,
        _source: Arc<dyn MediaSource>,
        _slice: Duration,
    ) -> Result<(Box<dyn RecorderSession>, mpsc::UnboundedReceiver<AudioChunk>)> {
        Err(anyhow!("audio recorder backend is unavailable"))
    }
}

pub struct MissingPeerConnector;

#[async_trait]
impl PeerConnector for MissingPeerConnector {
    async fn create(&self, _config: PeerConnectionConfig) -> Result<Arc<dyn PeerConnection>> {
        Err(anyhow!("peer connection backend is unavailable"))
    }
}

pub struct MissingRemoteAudioSink;

impl RemoteAudioSink for MissingRemoteAudioSink {
    fn attach(&self, track_id: &str) {
        debug!(track_id, "no remote audio sink configured");
    }

    fn clear(&self) {}
}

/// The conversation engine: one active conversation's reconciled message
/// list, the conversation directory, typing state, media capture and the
/// call session, all fed by one transport subscription.
pub struct ChatClient {
    identity: LocalIdentity,
    api: Arc<dyn ConversationApi>,
    transport: Arc<dyn SignalTransport>,
    typing: Arc<TypingCoordinator>,
    calls: Arc<CallManager>,
    capture: Arc<CapturePipeline>,
    directory: Mutex<ConversationDirectory>,
    messages: Mutex<MessageLog>,
    sender_directory: Mutex<HashMap<i64, String>>,
    events: broadcast::Sender<ClientEvent>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl ChatClient {
    /// Engine with no device backends: messaging works, call/recording
    /// attempts surface "unavailable" errors.
    pub fn new(
        identity: LocalIdentity,
        api: Arc<dyn ConversationApi>,
        uploads: Arc<dyn UploadService>,
        transport: Arc<dyn SignalTransport>,
    ) -> Arc<Self> {
        Self::new_with_dependencies(
            identity,
            api,
            uploads,
            transport,
            Arc::new(MissingMediaDevices),
            Arc::new(MissingAudioRecorder),
            Arc::new(MissingPeerConnector),
            Arc::new(MissingRemoteAudioSink),
            Arc::new(TokioScheduler),
            PeerConnectionConfig::default(),
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new_with_dependencies(
        identity: LocalIdentity,
        api: Arc<dyn ConversationApi>,
        uploads: Arc<dyn UploadService>,
        transport: Arc<dyn SignalTransport>,
        devices: Arc<dyn MediaDevices>,
        recorder: Arc<dyn AudioRecorder>,
        connector: Arc<dyn PeerConnector>,
        sink: Arc<dyn RemoteAudioSink>,
        scheduler: Arc<dyn Scheduler>,
        peer_config: PeerConnectionConfig,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        let mic = MicrophoneArbiter::new();
        let typing = TypingCoordinator::new(
            identity.clone(),
            Arc::clone(&transport),
            scheduler,
            events.clone(),
        );
        let calls = CallManager::new(
            Arc::clone(&devices),
            connector,
            sink,
            Arc::clone(&transport),
            Arc::clone(&mic),
            peer_config,
            events.clone(),
        );
        let capture = Arc::new(CapturePipeline::new(
            devices,
            recorder,
            uploads,
            mic,
            events.clone(),
        ));
        Arc::new(Self {
            identity,
            api,
            transport,
            typing,
            calls,
            capture,
            directory: Mutex::new(ConversationDirectory::default()),
            messages: Mutex::new(MessageLog::default()),
            sender_directory: Mutex::new(HashMap::new()),
            events,
            pump: Mutex::new(None),
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    /// Spawns the socket event pump. Idempotent: a second call replaces the
    /// previous pump.
    pub async fn start(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let mut signals = self.transport.subscribe();
        let mut status = self.transport.subscribe_status();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    signal = signals.recv() => match signal {
                        Ok(signal) => client.handle_signal(signal).await,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "socket event stream lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    changed = status.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let connected = *status.borrow_and_update();
                        client.on_transport_status(connected).await;
                    }
                }
            }
        });
        let mut pump = self.pump.lock().await;
        if let Some(previous) = pump.replace(task) {
            previous.abort();
        }
    }

    pub async fn shutdown(&self) {
        if let Some(task) = self.pump.lock().await.take() {
            task.abort();
        }
        self.capture.cancel_recording().await;
        self.calls.hang_up().await;
    }

    /// Exhaustive dispatch of the closed signal vocabulary; every mutation
    /// happens inside the owning component.
    async fn handle_signal(&self, signal: ServerSignal) {
        match signal {
            ServerSignal::NewMessage { message } => self.on_new_message(message).await,
            ServerSignal::UserTyping {
                conversation_id,
                user_id,
                display_name,
            } => self
                .typing
                .on_remote_typing(conversation_id, user_id, display_name),
            ServerSignal::UserStoppedTyping {
                conversation_id,
                user_id,
            } => self.typing.on_remote_stopped(conversation_id, user_id),
            ServerSignal::MessageRead {
                conversation_id,
                reader_id,
            } => self.on_message_read(conversation_id, reader_id).await,
            ServerSignal::VoiceCallOffer {
                conversation_id,
                caller_id,
                caller_name,
                description,
            } => {
                self.calls
                    .on_remote_offer(conversation_id, caller_id, caller_name, description)
                    .await;
            }
            ServerSignal::VoiceCallAnswer {
                conversation_id,
                description,
            } => self.calls.on_remote_answer(conversation_id, description).await,
            ServerSignal::VoiceCallIceCandidate {
                conversation_id,
                candidate,
            } => self.calls.on_remote_candidate(conversation_id, candidate).await,
            ServerSignal::VoiceCallEnd { conversation_id } => {
                self.calls.on_remote_end(conversation_id).await;
            }
        }
    }

    async fn on_transport_status(&self, connected: bool) {
        let _ = self
            .events
            .send(ClientEvent::TransportStatusChanged { connected });
        if connected {
            // server-side scoping does not survive a reconnect
            let active = { self.directory.lock().await.active() };
            if let Some(conversation_id) = active {
                self.transport
                    .send(ClientSignal::JoinConversation { conversation_id });
            }
        }
    }

    async fn on_new_message(&self, message: MessagePayload) {
        self.record_sender_name(&message).await;
        let conversation_id = message.conversation_id;
        let (directory_changed, active) = {
            let mut directory = self.directory.lock().await;
            (
                directory.note_incoming(&message, self.identity.user_id),
                directory.active(),
            )
        };
        if directory_changed {
            let _ = self.events.send(ClientEvent::ConversationsUpdated);
        }
        if active == Some(conversation_id) {
            let outcome = {
                self.messages
                    .lock()
                    .await
                    .merge(ChatMessage::from(message))
            };
            debug!(
                ?outcome,
                conversation_id = conversation_id.0,
                "merged socket message"
            );
            let _ = self
                .events
                .send(ClientEvent::MessagesUpdated { conversation_id });
        }
    }

    async fn on_message_read(&self, conversation_id: ConversationId, reader_id: UserId) {
        if reader_id == self.identity.user_id {
            return;
        }
        let active = { self.directory.lock().await.active() };
        if active != Some(conversation_id) {
            return;
        }
        let changed = {
            self.messages
                .lock()
                .await
                .apply_remote_read(self.identity.user_id)
        };
        if changed {
            let _ = self
                .events
                .send(ClientEvent::MessagesUpdated { conversation_id });
        }
    }

    async fn record_sender_name(&self, message: &MessagePayload) {
        let Some(name) = message.sender_name.clone() else {
            return;
        };
        self.sender_directory
            .lock()
            .await
            .insert(message.sender_id.0, name);
    }

    pub async fn sender_directory(&self) -> HashMap<i64, String> {
        self.sender_directory.lock().await.clone()
    }

    pub async fn refresh_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let conversations = self
            .api
            .list_conversations()
            .await
            .context("failed to load conversation list")?;
        {
            self.directory
                .lock()
                .await
                .replace_all(conversations.clone());
        }
        let _ = self.events.send(ClientEvent::ConversationsUpdated);
        Ok(conversations)
    }

    pub async fn conversations(&self) -> Vec<ConversationSummary> {
        self.directory.lock().await.summaries()
    }

    pub async fn active_conversation(&self) -> Option<ConversationId> {
        self.directory.lock().await.active()
    }

    /// The single trigger of the switch protocol: leave the old scope, join
    /// the new one, mark it read and load its history. A failed load leaves
    /// previously loaded state intact and reports the error.
    pub async fn select_conversation(&self, conversation_id: ConversationId) -> Result<()> {
        let previous = {
            self.directory
                .lock()
                .await
                .set_active(Some(conversation_id))
        };
        if let Some(previous) = previous.filter(|p| *p != conversation_id) {
            self.transport.send(ClientSignal::LeaveConversation {
                conversation_id: previous,
            });
        }
        self.typing.set_conversation(Some(conversation_id));
        self.transport
            .send(ClientSignal::JoinConversation { conversation_id });
        self.transport
            .send(ClientSignal::MarkAsRead { conversation_id });
        {
            self.directory.lock().await.clear_unread(conversation_id);
        }
        let _ = self.events.send(ClientEvent::ConversationsUpdated);

        let token = { self.messages.lock().await.begin_load(conversation_id) };
        match self.api.fetch_history(conversation_id).await {
            Ok(payloads) => {
                for payload in &payloads {
                    self.record_sender_name(payload).await;
                }
                let applied = {
                    let mut log = self.messages.lock().await;
                    let applied = log.complete_load(token, payloads);
                    if applied {
                        log.mark_read_locally(self.identity.user_id);
                    }
                    applied
                };
                if applied {
                    let _ = self
                        .events
                        .send(ClientEvent::MessagesUpdated { conversation_id });
                }
            }
            Err(err) => {
                let _ = self
                    .events
                    .send(ClientEvent::Error(format!("history load failed: {err}")));
                return Err(err.context("history load failed"));
            }
        }

        if let Err(err) = self.api.mark_as_read(conversation_id).await {
            debug!("mark-as-read request failed: {err}");
        }
        Ok(())
    }

    /// Leaves the active conversation's scope. In-progress calls and
    /// uploads are keyed by their own session, not by the view, and keep
    /// running.
    pub async fn deselect_conversation(&self) {
        let previous = { self.directory.lock().await.set_active(None) };
        self.typing.set_conversation(None);
        if let Some(conversation_id) = previous {
            self.transport
                .send(ClientSignal::LeaveConversation { conversation_id });
        }
    }

    /// Messages of the active conversation, in timestamp order.
    pub async fn messages(&self) -> Vec<ChatMessage> {
        let active = { self.directory.lock().await.active() };
        let log = self.messages.lock().await;
        if active.is_some() && log.conversation() == active {
            log.messages().to_vec()
        } else {
            Vec::new()
        }
    }

    pub fn note_keystroke(&self) {
        self.typing.note_keystroke();
    }

    pub fn typing_names(&self) -> Vec<String> {
        self.typing.typing_names()
    }

    pub async fn send_text(&self, text: &str) -> Result<()> {
        let body = text.trim();
        if body.is_empty() {
            return Err(SendError::EmptyMessage.into());
        }
        self.send_internal(Some(body.to_string()), None).await
    }

    pub async fn send_attachment(
        &self,
        filename: &str,
        mime_type: Option<&str>,
        bytes: Vec<u8>,
        caption: Option<&str>,
    ) -> Result<()> {
        let asset = self
            .capture
            .upload_attachment(filename.to_string(), mime_type.map(Into::into), bytes)
            .await?;
        let attachment = AttachmentPayload {
            url: asset.url,
            filename: asset.filename,
            kind: asset.kind,
        };
        let body = caption
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(ToString::to_string);
        self.send_internal(body, Some(attachment)).await
    }

    async fn send_internal(
        &self,
        body: Option<String>,
        attachment: Option<AttachmentPayload>,
    ) -> Result<()> {
        let conversation_id = { self.directory.lock().await.active() }
            .ok_or(SendError::NoActiveConversation)?;
        if body.is_none() && attachment.is_none() {
            return Err(SendError::EmptyMessage.into());
        }
        self.typing.note_sent();

        let token = Uuid::new_v4();
        let pending = ChatMessage {
            id: None,
            client_token: Some(token),
            conversation_id,
            sender_id: self.identity.user_id,
            sender_name: Some(self.identity.display_name.clone()),
            body: body.clone(),
            attachment: attachment.clone(),
            sent_at: Utc::now(),
            read: false,
        };
        {
            self.messages.lock().await.insert_pending(pending);
        }
        let _ = self
            .events
            .send(ClientEvent::MessagesUpdated { conversation_id });

        let outgoing = OutgoingMessage {
            conversation_id,
            body,
            attachment,
        };
        match self.api.send_message(outgoing).await {
            Ok(payload) => {
                let outcome = {
                    self.messages
                        .lock()
                        .await
                        .merge(ChatMessage::from(payload.clone()))
                };
                debug!(?outcome, "merged send response");
                {
                    self.directory
                        .lock()
                        .await
                        .note_incoming(&payload, self.identity.user_id);
                }
                let _ = self
                    .events
                    .send(ClientEvent::MessagesUpdated { conversation_id });
                let _ = self.events.send(ClientEvent::ConversationsUpdated);
                Ok(())
            }
            Err(err) => {
                // the composed content stays with the caller; only the
                // optimistic entry is rolled back
                {
                    self.messages.lock().await.remove_pending(token);
                }
                let _ = self
                    .events
                    .send(ClientEvent::MessagesUpdated { conversation_id });
                Err(SendError::Request(err.to_string()).into())
            }
        }
    }

    pub async fn start_recording(&self) -> Result<()> {
        self.capture.start_recording().await?;
        Ok(())
    }

    pub fn recording_elapsed(&self) -> Option<Duration> {
        self.capture.recording_elapsed()
    }

    pub async fn cancel_recording(&self) {
        self.capture.cancel_recording().await;
    }

    /// Stop-with-send: packages the captured audio, uploads it and sends it
    /// as an audio message in the active conversation.
    pub async fn finish_recording(&self) -> Result<()> {
        let asset = self.capture.stop_recording(RecordingIntent::Send).await?;
        let Some(asset) = asset else {
            return Ok(());
        };
        let attachment = AttachmentPayload {
            url: asset.url,
            filename: asset.filename,
            kind: asset.kind,
        };
        self.send_internal(None, Some(attachment)).await
    }

    pub async fn start_call(&self) -> Result<()> {
        let conversation_id = { self.directory.lock().await.active() }
            .ok_or(SendError::NoActiveConversation)?;
        self.calls.start_call(conversation_id).await?;
        Ok(())
    }

    pub async fn accept_call(&self) -> Result<()> {
        self.calls.accept_call().await?;
        Ok(())
    }

    pub async fn reject_call(&self) -> Result<()> {
        self.calls.reject_call().await?;
        Ok(())
    }

    pub async fn hang_up(&self) {
        self.calls.hang_up().await;
    }

    pub async fn toggle_mute(&self) -> Result<bool> {
        Ok(self.calls.toggle_mute().await?)
    }

    pub async fn call_state(&self) -> CallSnapshot {
        self.calls.snapshot().await
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
