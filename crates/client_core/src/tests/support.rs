use std::collections::HashMap;
use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex as StdMutex,
};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::{broadcast, mpsc, watch};

use shared::{
    domain::{ConversationId, MessageId, UserId},
    protocol::{
        ClientSignal, ConversationSummary, CounterpartSummary, IceCandidate, MessagePayload,
        SdpKind, ServerSignal, SessionDescription,
    },
};
use webrtc_integration::{
    AudioChunk, AudioRecorder, AudioTrack, MediaDeviceError, MediaDevices, MediaSource,
    PeerConnection, PeerConnectionConfig, PeerConnector, PeerEvent, RecorderSession,
    RemoteAudioSink,
};

use crate::api::{
    ConversationApi, OutgoingMessage, ProgressCallback, UploadRequest, UploadService, UploadedAsset,
};
use crate::capture::coarse_kind;
use crate::transport::SignalTransport;
use crate::{ChatClient, LocalIdentity};

pub(crate) fn ts(seconds_offset: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds_offset, 0)
        .single()
        .expect("timestamp")
}

pub(crate) fn ts_millis(millis_offset: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(1_700_000_000_000 + millis_offset)
        .single()
        .expect("timestamp")
}

pub(crate) fn sample_payload(
    id: i64,
    conversation: i64,
    sender: i64,
    body: &str,
    sent_at: DateTime<Utc>,
) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        conversation_id: ConversationId(conversation),
        sender_id: UserId(sender),
        sender_name: None,
        body: Some(body.to_string()),
        attachment: None,
        sent_at,
        read: false,
    }
}

pub(crate) fn sample_summary(conversation: i64, user: i64, name: &str) -> ConversationSummary {
    ConversationSummary {
        conversation_id: ConversationId(conversation),
        counterpart: CounterpartSummary {
            user_id: UserId(user),
            display_name: name.to_string(),
            avatar_url: None,
            online: false,
        },
        last_message: None,
        unread_count: 0,
        last_activity: None,
    }
}

pub(crate) fn sample_offer() -> SessionDescription {
    SessionDescription {
        kind: SdpKind::Offer,
        sdp: "v=0 remote-offer".to_string(),
    }
}

pub(crate) fn sample_candidate(tag: &str) -> IceCandidate {
    IceCandidate {
        candidate: format!("candidate:{tag} 1 UDP 2122252543 192.0.2.1 54400 typ host"),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}

pub(crate) struct FakeTransport {
    sent: StdMutex<Vec<ClientSignal>>,
    events: broadcast::Sender<ServerSignal>,
    status: watch::Sender<bool>,
}

impl FakeTransport {
    pub(crate) fn new() -> Arc<Self> {
        Self::with_connected(true)
    }

    pub(crate) fn offline() -> Arc<Self> {
        Self::with_connected(false)
    }

    fn with_connected(connected: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        let (status, _) = watch::channel(connected);
        Arc::new(Self {
            sent: StdMutex::new(Vec::new()),
            events,
            status,
        })
    }

    pub(crate) fn push(&self, signal: ServerSignal) {
        let _ = self.events.send(signal);
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        let _ = self.status.send(connected);
    }

    pub(crate) fn sent_signals(&self) -> Vec<ClientSignal> {
        self.sent.lock().expect("sent lock").clone()
    }
}

impl SignalTransport for FakeTransport {
    fn connected(&self) -> bool {
        *self.status.borrow()
    }

    // mirrors the real transport: signals sent while offline vanish
    fn send(&self, signal: ClientSignal) {
        if self.connected() {
            self.sent.lock().expect("sent lock").push(signal);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerSignal> {
        self.events.subscribe()
    }

    fn subscribe_status(&self) -> watch::Receiver<bool> {
        self.status.subscribe()
    }
}

pub(crate) struct FakeApi {
    user_id: UserId,
    pub(crate) conversations: StdMutex<Vec<ConversationSummary>>,
    pub(crate) history: StdMutex<HashMap<i64, Vec<MessagePayload>>>,
    pub(crate) fail_history: StdMutex<bool>,
    pub(crate) fail_send: StdMutex<bool>,
    pub(crate) sent: StdMutex<Vec<OutgoingMessage>>,
    pub(crate) read_marks: StdMutex<Vec<i64>>,
    pub(crate) next_message_id: StdMutex<i64>,
    pub(crate) send_sent_at: StdMutex<Option<DateTime<Utc>>>,
}

impl FakeApi {
    pub(crate) fn new(user_id: UserId) -> Arc<Self> {
        Arc::new(Self {
            user_id,
            conversations: StdMutex::new(Vec::new()),
            history: StdMutex::new(HashMap::new()),
            fail_history: StdMutex::new(false),
            fail_send: StdMutex::new(false),
            sent: StdMutex::new(Vec::new()),
            read_marks: StdMutex::new(Vec::new()),
            next_message_id: StdMutex::new(100),
            send_sent_at: StdMutex::new(None),
        })
    }

    pub(crate) fn set_history(&self, conversation: i64, payloads: Vec<MessagePayload>) {
        self.history
            .lock()
            .expect("history lock")
            .insert(conversation, payloads);
    }
}

#[async_trait]
impl ConversationApi for FakeApi {
    async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        Ok(self.conversations.lock().expect("conversations").clone())
    }

    async fn fetch_history(&self, conversation_id: ConversationId) -> Result<Vec<MessagePayload>> {
        if *self.fail_history.lock().expect("fail_history") {
            return Err(anyhow!("history backend down"));
        }
        Ok(self
            .history
            .lock()
            .expect("history")
            .get(&conversation_id.0)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, outgoing: OutgoingMessage) -> Result<MessagePayload> {
        if *self.fail_send.lock().expect("fail_send") {
            return Err(anyhow!("send backend down"));
        }
        self.sent.lock().expect("sent").push(outgoing.clone());
        let id = {
            let mut next = self.next_message_id.lock().expect("next id");
            *next += 1;
            *next
        };
        let sent_at = self
            .send_sent_at
            .lock()
            .expect("send_sent_at")
            .unwrap_or_else(Utc::now);
        Ok(MessagePayload {
            message_id: MessageId(id),
            conversation_id: outgoing.conversation_id,
            sender_id: self.user_id,
            sender_name: None,
            body: outgoing.body,
            attachment: outgoing.attachment,
            sent_at,
            read: false,
        })
    }

    async fn mark_as_read(&self, conversation_id: ConversationId) -> Result<()> {
        self.read_marks
            .lock()
            .expect("read marks")
            .push(conversation_id.0);
        Ok(())
    }
}

pub(crate) struct FakeUploadService {
    pub(crate) uploaded: StdMutex<Vec<UploadRequest>>,
    pub(crate) fail: StdMutex<bool>,
}

impl FakeUploadService {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            uploaded: StdMutex::new(Vec::new()),
            fail: StdMutex::new(false),
        })
    }
}

#[async_trait]
impl UploadService for FakeUploadService {
    async fn upload(
        &self,
        request: UploadRequest,
        progress: ProgressCallback,
    ) -> Result<UploadedAsset> {
        if *self.fail.lock().expect("fail") {
            return Err(anyhow!("upload backend down"));
        }
        progress(0.5);
        progress(1.0);
        let kind = coarse_kind(request.mime_type.as_deref(), &request.filename);
        let asset = UploadedAsset {
            url: format!("https://cdn.test/{}/{}", request.folder, request.filename),
            filename: request.filename.clone(),
            kind,
        };
        self.uploaded.lock().expect("uploaded").push(request);
        Ok(asset)
    }
}

pub(crate) struct FakeAudioTrack {
    id: String,
    enabled: AtomicBool,
    live: AtomicBool,
}

impl FakeAudioTrack {
    fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            enabled: AtomicBool::new(true),
            live: AtomicBool::new(true),
        })
    }
}

impl AudioTrack for FakeAudioTrack {
    fn id(&self) -> String {
        self.id.clone()
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.live.store(false, Ordering::SeqCst);
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }
}

pub(crate) struct FakeMediaSource {
    tracks: Vec<Arc<FakeAudioTrack>>,
}

impl FakeMediaSource {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            tracks: vec![FakeAudioTrack::new("mic-0")],
        })
    }

    pub(crate) fn live_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_live()).count()
    }

    pub(crate) fn enabled_tracks(&self) -> usize {
        self.tracks.iter().filter(|t| t.is_enabled()).count()
    }
}

impl MediaSource for FakeMediaSource {
    fn audio_tracks(&self) -> Vec<Arc<dyn AudioTrack>> {
        self.tracks
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn AudioTrack>)
            .collect()
    }
}

pub(crate) struct FakeMediaDevices {
    pub(crate) opened: StdMutex<Vec<Arc<FakeMediaSource>>>,
    pub(crate) deny: StdMutex<bool>,
}

impl FakeMediaDevices {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            opened: StdMutex::new(Vec::new()),
            deny: StdMutex::new(false),
        })
    }

    pub(crate) fn opened_count(&self) -> usize {
        self.opened.lock().expect("opened").len()
    }

    pub(crate) fn last_source(&self) -> Arc<FakeMediaSource> {
        self.opened
            .lock()
            .expect("opened")
            .last()
            .cloned()
            .expect("a microphone was opened")
    }
}

#[async_trait]
impl MediaDevices for FakeMediaDevices {
    async fn open_microphone(&self) -> std::result::Result<Arc<dyn MediaSource>, MediaDeviceError> {
        if *self.deny.lock().expect("deny") {
            return Err(MediaDeviceError::PermissionDenied);
        }
        let source = FakeMediaSource::new();
        self.opened
            .lock()
            .expect("opened")
            .push(Arc::clone(&source));
        Ok(source)
    }
}

pub(crate) struct FakeRecorder {
    chunks: Vec<Vec<u8>>,
    fail_start: bool,
}

impl FakeRecorder {
    pub(crate) fn with_chunks(chunks: Vec<Vec<u8>>) -> Arc<Self> {
        Arc::new(Self {
            chunks,
            fail_start: false,
        })
    }

    pub(crate) fn failing() -> Arc<Self> {
        Arc::new(Self {
            chunks: Vec::new(),
            fail_start: true,
        })
    }
}

struct FakeRecorderSession {
    _tx: mpsc::UnboundedSender<AudioChunk>,
}

#[async_trait]
impl RecorderSession for FakeRecorderSession {
    fn mime_type(&self) -> &str {
        "audio/webm"
    }

    async fn stop(self: Box<Self>) -> Result<()> {
        // dropping self drops the sender and closes the chunk stream
        Ok(())
    }
}

#[async_trait]
impl AudioRecorder for FakeRecorder {
    async fn start(
        &self,
        _source: Arc<dyn MediaSource>,
        _slice: Duration,
    ) -> Result<(Box<dyn RecorderSession>, mpsc::UnboundedReceiver<AudioChunk>)> {
        if self.fail_start {
            return Err(anyhow!("recorder start failed"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        for chunk in &self.chunks {
            let _ = tx.send(chunk.clone());
        }
        Ok((Box::new(FakeRecorderSession { _tx: tx }), rx))
    }
}

pub(crate) struct FakePeerConnection {
    pub(crate) ops: StdMutex<Vec<String>>,
    pub(crate) added_candidates: StdMutex<Vec<IceCandidate>>,
    pub(crate) local_description: StdMutex<Option<SessionDescription>>,
    pub(crate) remote_description: StdMutex<Option<SessionDescription>>,
    pub(crate) closed: AtomicBool,
    fail_offer: bool,
    events: broadcast::Sender<PeerEvent>,
}

impl FakePeerConnection {
    fn new(fail_offer: bool) -> Arc<Self> {
        let (events, _) = broadcast::channel(32);
        Arc::new(Self {
            ops: StdMutex::new(Vec::new()),
            added_candidates: StdMutex::new(Vec::new()),
            local_description: StdMutex::new(None),
            remote_description: StdMutex::new(None),
            closed: AtomicBool::new(false),
            fail_offer,
            events,
        })
    }

    pub(crate) fn emit(&self, event: PeerEvent) {
        let _ = self.events.send(event);
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn candidate_count(&self) -> usize {
        self.added_candidates.lock().expect("candidates").len()
    }
}

#[async_trait]
impl PeerConnection for FakePeerConnection {
    async fn add_track(&self, _track: Arc<dyn AudioTrack>) -> Result<()> {
        self.ops.lock().expect("ops").push("add_track".to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        if self.fail_offer {
            return Err(anyhow!("offer generation failed"));
        }
        self.ops
            .lock()
            .expect("ops")
            .push("create_offer".to_string());
        Ok(SessionDescription {
            kind: SdpKind::Offer,
            sdp: "v=0 local-offer".to_string(),
        })
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        self.ops
            .lock()
            .expect("ops")
            .push("create_answer".to_string());
        Ok(SessionDescription {
            kind: SdpKind::Answer,
            sdp: "v=0 local-answer".to_string(),
        })
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.ops
            .lock()
            .expect("ops")
            .push("set_local_description".to_string());
        *self.local_description.lock().expect("local") = Some(description);
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.ops
            .lock()
            .expect("ops")
            .push("set_remote_description".to_string());
        *self.remote_description.lock().expect("remote") = Some(description);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.ops
            .lock()
            .expect("ops")
            .push("add_ice_candidate".to_string());
        self.added_candidates
            .lock()
            .expect("candidates")
            .push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

pub(crate) struct FakePeerConnector {
    pub(crate) connections: StdMutex<Vec<Arc<FakePeerConnection>>>,
    fail_create: bool,
    fail_offer: bool,
}

impl FakePeerConnector {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            connections: StdMutex::new(Vec::new()),
            fail_create: false,
            fail_offer: false,
        })
    }

    pub(crate) fn failing_create() -> Arc<Self> {
        Arc::new(Self {
            connections: StdMutex::new(Vec::new()),
            fail_create: true,
            fail_offer: false,
        })
    }

    pub(crate) fn failing_offer() -> Arc<Self> {
        Arc::new(Self {
            connections: StdMutex::new(Vec::new()),
            fail_create: false,
            fail_offer: true,
        })
    }

    pub(crate) fn last_connection(&self) -> Arc<FakePeerConnection> {
        self.connections
            .lock()
            .expect("connections")
            .last()
            .cloned()
            .expect("a peer connection was created")
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn create(&self, _config: PeerConnectionConfig) -> Result<Arc<dyn PeerConnection>> {
        if self.fail_create {
            return Err(anyhow!("peer connection setup failed"));
        }
        let connection = FakePeerConnection::new(self.fail_offer);
        self.connections
            .lock()
            .expect("connections")
            .push(Arc::clone(&connection));
        Ok(connection)
    }
}

pub(crate) struct FakeSink {
    pub(crate) attached: StdMutex<Vec<String>>,
    pub(crate) cleared: AtomicUsize,
}

impl FakeSink {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            attached: StdMutex::new(Vec::new()),
            cleared: AtomicUsize::new(0),
        })
    }
}

impl RemoteAudioSink for FakeSink {
    fn attach(&self, track_id: &str) {
        self.attached
            .lock()
            .expect("attached")
            .push(track_id.to_string());
    }

    fn clear(&self) {
        self.cleared.fetch_add(1, Ordering::SeqCst);
    }
}

pub(crate) struct TestHarness {
    pub(crate) client: Arc<ChatClient>,
    pub(crate) api: Arc<FakeApi>,
    pub(crate) transport: Arc<FakeTransport>,
    pub(crate) uploads: Arc<FakeUploadService>,
    pub(crate) devices: Arc<FakeMediaDevices>,
    pub(crate) connector: Arc<FakePeerConnector>,
    pub(crate) sink: Arc<FakeSink>,
}

pub(crate) const LOCAL_USER: UserId = UserId(1);

pub(crate) fn harness() -> TestHarness {
    harness_with_transport(FakeTransport::new())
}

pub(crate) fn offline_harness() -> TestHarness {
    harness_with_transport(FakeTransport::offline())
}

fn harness_with_transport(transport: Arc<FakeTransport>) -> TestHarness {
    let api = FakeApi::new(LOCAL_USER);
    let uploads = FakeUploadService::new();
    let devices = FakeMediaDevices::new();
    let connector = FakePeerConnector::new();
    let sink = FakeSink::new();
    let client = ChatClient::new_with_dependencies(
        LocalIdentity {
            user_id: LOCAL_USER,
            display_name: "me".to_string(),
        },
        Arc::clone(&api) as Arc<dyn ConversationApi>,
        Arc::clone(&uploads) as Arc<dyn UploadService>,
        Arc::clone(&transport) as Arc<dyn SignalTransport>,
        Arc::clone(&devices) as Arc<dyn MediaDevices>,
        FakeRecorder::with_chunks(vec![b"chunk-a".to_vec(), b"chunk-b".to_vec()]),
        Arc::clone(&connector) as Arc<dyn PeerConnector>,
        Arc::clone(&sink) as Arc<dyn RemoteAudioSink>,
        Arc::new(crate::scheduler::TokioScheduler),
        PeerConnectionConfig::default(),
    );
    TestHarness {
        client,
        api,
        transport,
        uploads,
        devices,
        connector,
        sink,
    }
}
