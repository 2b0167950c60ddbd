use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use shared::domain::AttachmentKind;
use webrtc_integration::{
    AudioRecorder, MediaDeviceError, MediaDevices, MediaSource, RecorderSession,
};

use crate::{
    api::{ProgressCallback, UploadRequest, UploadService, UploadedAsset},
    mic::{MicClaim, MicOwner, MicrophoneArbiter},
    ClientEvent,
};

pub(crate) const MAX_ATTACHMENT_BYTES: usize = 25 * 1024 * 1024;
pub(crate) const RECORDER_SLICE: Duration = Duration::from_millis(250);
const VOICE_NOTE_FOLDER: &str = "voice-notes";
const ATTACHMENT_FOLDER: &str = "attachments";

/// What to do with the accumulated audio when capture stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingIntent {
    Send,
    Discard,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("attachment is empty")]
    EmptyFile,
    #[error("attachment too large: {size} bytes (limit {limit})")]
    TooLarge { size: usize, limit: usize },
    #[error("microphone busy: held by {0}")]
    MicrophoneBusy(MicOwner),
    #[error(transparent)]
    Microphone(#[from] MediaDeviceError),
    #[error("recorder failure: {0}")]
    Recorder(String),
    #[error("nothing was recorded")]
    NothingRecorded,
    #[error("recording already in progress")]
    AlreadyRecording,
    #[error("no recording in progress")]
    NotRecording,
    #[error("upload failed: {0}")]
    Upload(String),
}

/// Maps a declared MIME type (or, failing that, the filename extension) to
/// the coarse kind downstream renderers switch on.
pub fn coarse_kind(mime_type: Option<&str>, filename: &str) -> AttachmentKind {
    if let Some(mime) = mime_type {
        if mime.starts_with("image/") {
            return AttachmentKind::Image;
        }
        if mime.starts_with("audio/") {
            return AttachmentKind::Audio;
        }
    }
    let extension = filename
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase());
    match extension.as_deref() {
        Some("png" | "jpg" | "jpeg" | "gif" | "webp") => AttachmentKind::Image,
        Some("mp3" | "ogg" | "wav" | "webm" | "m4a") => AttachmentKind::Audio,
        _ => AttachmentKind::File,
    }
}

/// Rejected before any network call.
pub fn validate_attachment(size: usize) -> Result<(), CaptureError> {
    if size == 0 {
        return Err(CaptureError::EmptyFile);
    }
    if size > MAX_ATTACHMENT_BYTES {
        return Err(CaptureError::TooLarge {
            size,
            limit: MAX_ATTACHMENT_BYTES,
        });
    }
    Ok(())
}

struct ActiveRecording {
    session: Box<dyn RecorderSession>,
    microphone: Arc<dyn MediaSource>,
    chunks: Arc<StdMutex<Vec<Vec<u8>>>>,
    collector: JoinHandle<()>,
    started_at: Instant,
    _mic_claim: MicClaim,
}

/// Produces uploaded-asset descriptors from two producers: picked files and
/// hold-to-record voice notes. The microphone is released on every exit
/// path; the claim guard and explicit track stops back that up.
pub struct CapturePipeline {
    devices: Arc<dyn MediaDevices>,
    recorder: Arc<dyn AudioRecorder>,
    uploads: Arc<dyn UploadService>,
    mic: Arc<MicrophoneArbiter>,
    events: broadcast::Sender<ClientEvent>,
    active: Mutex<Option<ActiveRecording>>,
    started_at: StdMutex<Option<Instant>>,
}

impl CapturePipeline {
    pub fn new(
        devices: Arc<dyn MediaDevices>,
        recorder: Arc<dyn AudioRecorder>,
        uploads: Arc<dyn UploadService>,
        mic: Arc<MicrophoneArbiter>,
        events: broadcast::Sender<ClientEvent>,
    ) -> Self {
        Self {
            devices,
            recorder,
            uploads,
            mic,
            events,
            active: Mutex::new(None),
            started_at: StdMutex::new(None),
        }
    }

    pub async fn start_recording(&self) -> Result<(), CaptureError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            return Err(CaptureError::AlreadyRecording);
        }
        let claim = self
            .mic
            .claim(MicOwner::Recorder)
            .map_err(CaptureError::MicrophoneBusy)?;
        let microphone = self.devices.open_microphone().await?;
        let (session, mut rx) = match self
            .recorder
            .start(Arc::clone(&microphone), RECORDER_SLICE)
            .await
        {
            Ok(started) => started,
            Err(err) => {
                stop_tracks(microphone.as_ref());
                drop(claim);
                return Err(CaptureError::Recorder(err.to_string()));
            }
        };

        let chunks = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&chunks);
        let collector = tokio::spawn(async move {
            while let Some(chunk) = rx.recv().await {
                sink.lock().unwrap_or_else(|e| e.into_inner()).push(chunk);
            }
        });

        let started_at = Instant::now();
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = Some(started_at);
        *active = Some(ActiveRecording {
            session,
            microphone,
            chunks,
            collector,
            started_at,
            _mic_claim: claim,
        });
        let _ = self
            .events
            .send(ClientEvent::RecordingStateChanged { active: true });
        info!("voice recording started");
        Ok(())
    }

    /// Elapsed time of the in-progress recording, polled for UI feedback.
    pub fn recording_elapsed(&self) -> Option<Duration> {
        self.started_at
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .map(|started| started.elapsed())
    }

    /// Stops the capture. `Send` packages the chunks into one audio asset
    /// and uploads it; `Discard` drops everything. Stopping with nothing
    /// captured is a recoverable [`CaptureError::NothingRecorded`], and the
    /// microphone is released before this returns, whatever the outcome.
    pub async fn stop_recording(
        &self,
        intent: RecordingIntent,
    ) -> Result<Option<UploadedAsset>, CaptureError> {
        let recording = self.active.lock().await.take();
        *self.started_at.lock().unwrap_or_else(|e| e.into_inner()) = None;
        let Some(recording) = recording else {
            return Err(CaptureError::NotRecording);
        };
        let ActiveRecording {
            session,
            microphone,
            chunks,
            collector,
            started_at,
            _mic_claim: mic_claim,
        } = recording;

        let mime = session.mime_type().to_string();
        let stop_result = session.stop().await;
        // stop dropped the chunk sender; the collector drains the final
        // flush and finishes on its own
        let _ = collector.await;
        stop_tracks(microphone.as_ref());
        // release the device before any upload work
        drop(mic_claim);
        let _ = self
            .events
            .send(ClientEvent::RecordingStateChanged { active: false });
        if let Err(err) = stop_result {
            warn!("recorder stop reported failure: {err}");
        }

        let collected = std::mem::take(&mut *chunks.lock().unwrap_or_else(|e| e.into_inner()));
        match intent {
            RecordingIntent::Discard => {
                debug!("voice recording discarded");
                Ok(None)
            }
            RecordingIntent::Send => {
                let data: Vec<u8> = collected.concat();
                if data.is_empty() {
                    return Err(CaptureError::NothingRecorded);
                }
                let filename = format!("voice-note-{}.{}", Uuid::new_v4(), extension_for(&mime));
                let asset = self
                    .upload_with_progress(UploadRequest {
                        filename,
                        mime_type: Some(mime),
                        folder: VOICE_NOTE_FOLDER.to_string(),
                        bytes: data,
                    })
                    .await?;
                info!(
                    duration_ms = started_at.elapsed().as_millis() as u64,
                    "voice note uploaded"
                );
                Ok(Some(asset))
            }
        }
    }

    /// Teardown hook: discards any in-progress capture, absorbing the
    /// not-recording case.
    pub async fn cancel_recording(&self) {
        match self.stop_recording(RecordingIntent::Discard).await {
            Ok(_) | Err(CaptureError::NotRecording) => {}
            Err(err) => warn!("failed to cancel recording: {err}"),
        }
    }

    pub async fn upload_attachment(
        &self,
        filename: String,
        mime_type: Option<String>,
        bytes: Vec<u8>,
    ) -> Result<UploadedAsset, CaptureError> {
        validate_attachment(bytes.len())?;
        self.upload_with_progress(UploadRequest {
            filename,
            mime_type,
            folder: ATTACHMENT_FOLDER.to_string(),
            bytes,
        })
        .await
    }

    async fn upload_with_progress(
        &self,
        request: UploadRequest,
    ) -> Result<UploadedAsset, CaptureError> {
        let token = Uuid::new_v4();
        let events = self.events.clone();
        let progress: ProgressCallback = Arc::new(move |fraction| {
            let _ = events.send(ClientEvent::UploadProgress { token, fraction });
        });
        self.uploads
            .upload(request, progress)
            .await
            .map_err(|err| CaptureError::Upload(err.to_string()))
    }
}

pub(crate) fn stop_tracks(source: &dyn MediaSource) {
    for track in source.audio_tracks() {
        track.stop();
    }
}

fn extension_for(mime: &str) -> &str {
    match mime {
        "audio/webm" => "webm",
        "audio/ogg" => "ogg",
        "audio/mp4" => "m4a",
        "audio/wav" | "audio/x-wav" => "wav",
        _ => "bin",
    }
}

#[cfg(test)]
#[path = "tests/capture_tests.rs"]
mod tests;
