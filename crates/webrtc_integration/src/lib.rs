use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use shared::protocol::{IceCandidate, SessionDescription};

/// Raw audio captured over one slice interval.
pub type AudioChunk = Vec<u8>;

#[derive(Debug, Error)]
pub enum MediaDeviceError {
    #[error("microphone permission denied")]
    PermissionDenied,
    #[error("no audio capture device available")]
    Unavailable,
    #[error("capture backend failure: {0}")]
    Backend(String),
}

/// A single local audio track. `enabled` gates whether the track produces
/// audible frames; `stop` releases the underlying device handle for good.
pub trait AudioTrack: Send + Sync {
    fn id(&self) -> String;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    fn stop(&self);
    fn is_live(&self) -> bool;
}

/// A captured input stream (the getUserMedia result): one or more tracks
/// backed by an exclusive device handle.
pub trait MediaSource: Send + Sync {
    fn audio_tracks(&self) -> Vec<Arc<dyn AudioTrack>>;
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn open_microphone(&self) -> Result<Arc<dyn MediaSource>, MediaDeviceError>;
}

/// Chunked capture session. Chunks arrive on the channel returned by
/// `start` at roughly the slice interval; the sender is dropped when the
/// session stops, so draining the receiver to completion observes every
/// chunk including the final flush.
#[async_trait]
pub trait RecorderSession: Send + Sync {
    fn mime_type(&self) -> &str;
    async fn stop(self: Box<Self>) -> anyhow::Result<()>;
}

#[async_trait]
pub trait AudioRecorder: Send + Sync {
    async fn start(
        &self,
        source: Arc<dyn MediaSource>,
        slice: Duration,
    ) -> anyhow::Result<(Box<dyn RecorderSession>, mpsc::UnboundedReceiver<AudioChunk>)>;
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerConnectionConfig {
    pub ice_servers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    IceCandidate(IceCandidate),
    RemoteTrackAdded { track_id: String },
    ConnectionFailed { reason: String },
    Closed,
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn add_track(&self, track: Arc<dyn AudioTrack>) -> anyhow::Result<()>;
    async fn create_offer(&self) -> anyhow::Result<SessionDescription>;
    async fn create_answer(&self) -> anyhow::Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> anyhow::Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()>;
    async fn close(&self) -> anyhow::Result<()>;
    fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent>;
}

#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(&self, config: PeerConnectionConfig) -> anyhow::Result<Arc<dyn PeerConnection>>;
}

/// Playback destination for remote audio. `clear` detaches whatever is
/// currently routed so teardown leaves no dangling sink.
pub trait RemoteAudioSink: Send + Sync {
    fn attach(&self, track_id: &str);
    fn clear(&self);
}
