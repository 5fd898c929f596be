use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::signal::{CallType, MediaKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRequest {
    pub audio: bool,
    pub video: bool,
}

impl CaptureRequest {
    pub fn for_call(call_type: CallType) -> Self {
        Self {
            audio: true,
            video: call_type == CallType::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTrack {
    pub kind: MediaKind,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureStream {
    pub id: u64,
    pub tracks: Vec<LocalTrack>,
}

impl CaptureStream {
    pub fn new(id: u64, request: CaptureRequest) -> Self {
        let mut tracks = Vec::with_capacity(2);
        if request.audio {
            tracks.push(LocalTrack {
                kind: MediaKind::Audio,
                enabled: true,
            });
        }
        if request.video {
            tracks.push(LocalTrack {
                kind: MediaKind::Video,
                enabled: true,
            });
        }
        Self { id, tracks }
    }

    pub fn track(&self, kind: MediaKind) -> Option<&LocalTrack> {
        self.tracks.iter().find(|track| track.kind == kind)
    }

    pub fn has_video(&self) -> bool {
        self.track(MediaKind::Video).is_some()
    }

    fn set_enabled(&mut self, kind: MediaKind, enabled: bool) -> bool {
        match self.tracks.iter_mut().find(|track| track.kind == kind) {
            Some(track) => {
                track.enabled = enabled;
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("capture permission denied: {0}")]
    Denied(String),
    #[error("capture device unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    async fn acquire_capture(&self, request: CaptureRequest) -> Result<CaptureStream, DeviceError>;
    async fn release_capture(&self, stream: CaptureStream);
    fn track_state_changed(&self, _stream: &CaptureStream) {}
}

pub struct MissingCaptureDevice;

#[async_trait]
impl CaptureDevice for MissingCaptureDevice {
    async fn acquire_capture(&self, _request: CaptureRequest) -> Result<CaptureStream, DeviceError> {
        Err(DeviceError::Unavailable("no capture device configured".into()))
    }

    async fn release_capture(&self, _stream: CaptureStream) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemotePreview {
    MirroredLocal,
    NoRemoteMedia,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Presentation {
    Inactive,
    Video { remote: RemotePreview },
    AudioOnly,
    AvatarOnly,
}

#[derive(Debug)]
struct MediaSlot {
    generation: u64,
    stream: Option<CaptureStream>,
    audio_enabled: bool,
    video_enabled: bool,
    presentation: Presentation,
}

pub struct MediaIntentController {
    device: Arc<dyn CaptureDevice>,
    mirror_local_preview: bool,
    slot: Mutex<MediaSlot>,
}

impl MediaIntentController {
    pub fn new(device: Arc<dyn CaptureDevice>, mirror_local_preview: bool) -> Self {
        Self {
            device,
            mirror_local_preview,
            slot: Mutex::new(MediaSlot {
                generation: 0,
                stream: None,
                audio_enabled: true,
                video_enabled: true,
                presentation: Presentation::Inactive,
            }),
        }
    }

    pub async fn presentation(&self) -> Presentation {
        self.slot.lock().await.presentation
    }

    pub async fn holds_capture(&self) -> bool {
        self.slot.lock().await.stream.is_some()
    }

    pub async fn on_enter_live(&self, call_type: CallType) -> Presentation {
        let generation = self.begin_live().await;
        self.complete_live(generation, call_type).await
    }

    /// First half of [`Self::on_enter_live`]: claims the slot for a new call
    /// and returns its generation. Callers that acquire in the background run
    /// this inline so a teardown issued afterwards always invalidates it.
    pub async fn begin_live(&self) -> u64 {
        let mut slot = self.slot.lock().await;
        if let Some(previous) = slot.stream.take() {
            drop(slot);
            warn!(stream = previous.id, "media: releasing stream left over from a previous call");
            self.device.release_capture(previous).await;
            slot = self.slot.lock().await;
        }
        slot.audio_enabled = true;
        slot.video_enabled = true;
        slot.generation
    }

    pub async fn complete_live(&self, generation: u64, call_type: CallType) -> Presentation {
        let request = CaptureRequest::for_call(call_type);
        let acquired = self.device.acquire_capture(request).await;

        let mut slot = self.slot.lock().await;
        if slot.generation != generation {
            drop(slot);
            if let Ok(stream) = acquired {
                debug!(stream = stream.id, "media: capture resolved after teardown; releasing");
                self.device.release_capture(stream).await;
            }
            return Presentation::Inactive;
        }

        let presentation = match acquired {
            Ok(mut stream) => {
                let audio_enabled = slot.audio_enabled;
                let video_enabled = slot.video_enabled;
                stream.set_enabled(MediaKind::Audio, audio_enabled);
                stream.set_enabled(MediaKind::Video, video_enabled);
                let presentation = if call_type == CallType::Video && stream.has_video() {
                    Presentation::Video {
                        remote: if self.mirror_local_preview {
                            RemotePreview::MirroredLocal
                        } else {
                            RemotePreview::NoRemoteMedia
                        },
                    }
                } else if call_type == CallType::Video {
                    Presentation::AvatarOnly
                } else {
                    Presentation::AudioOnly
                };
                info!(stream = stream.id, ?call_type, ?presentation, "media: capture acquired");
                slot.stream = Some(stream);
                presentation
            }
            Err(err) => {
                warn!(error = %err, ?call_type, "media: capture failed; continuing avatar-only");
                Presentation::AvatarOnly
            }
        };
        slot.presentation = presentation;
        presentation
    }

    pub async fn on_leave_live(&self) {
        let stream = {
            let mut slot = self.slot.lock().await;
            slot.generation += 1;
            slot.presentation = Presentation::Inactive;
            slot.audio_enabled = true;
            slot.video_enabled = true;
            slot.stream.take()
        };
        if let Some(stream) = stream {
            debug!(stream = stream.id, "media: releasing capture");
            self.device.release_capture(stream).await;
        }
    }

    /// Flips a local track's enabled flag. The track itself is kept.
    ///
    /// The intent is remembered so a stream that resolves later starts with it.
    pub async fn set_track_enabled(&self, kind: MediaKind, enabled: bool) -> bool {
        let mut slot = self.slot.lock().await;
        match kind {
            MediaKind::Audio => slot.audio_enabled = enabled,
            MediaKind::Video => slot.video_enabled = enabled,
        }
        let Some(stream) = slot.stream.as_mut() else {
            return false;
        };
        let changed = stream.set_enabled(kind, enabled);
        if changed {
            self.device.track_state_changed(stream);
        }
        changed
    }
}

#[cfg(test)]
#[path = "tests/media_tests.rs"]
mod tests;
