//! Media Session - besitzt lokalen und entfernten Stream
//!
//! Der lokale Stream wird lazy und höchstens einmal pro Anrufversuch
//! beschafft. `release()` stoppt alle Tracks und ist beliebig oft aufrufbar.

use super::stream::MediaStream;
use crate::single_flight::SingleFlight;
use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaAcquisitionError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Microphone access denied: {0}")]
    PermissionDenied(String),

    #[error("Unsupported audio configuration: {0}")]
    UnsupportedConfig(String),

    #[error("Failed to start audio capture: {0}")]
    StreamFailed(String),

    #[error("Media was released while the microphone was being acquired")]
    Released,

    #[error("Timed out waiting for the microphone")]
    TimedOut,
}

/// Plattform-Fähigkeit für Audio-Capture (kein Video)
#[async_trait]
pub trait MediaCapability: Send + Sync {
    async fn capture_audio(&self) -> Result<MediaStream, MediaAcquisitionError>;
}

// ============================================================================
// MEDIA SESSION
// ============================================================================

#[derive(Default)]
struct SessionState {
    local: Option<MediaStream>,
    remote: Option<MediaStream>,
    /// Wird von `release` erhöht, um laufende Beschaffungen zu verwerfen
    generation: u64,
    muted: bool,
}

pub struct MediaSession {
    capability: Arc<dyn MediaCapability>,
    state: Arc<Mutex<SessionState>>,
    acquiring: SingleFlight<MediaStream, MediaAcquisitionError>,
    timeout: Duration,
}

impl MediaSession {
    pub fn new(capability: Arc<dyn MediaCapability>, timeout: Duration) -> Self {
        Self {
            capability,
            state: Arc::new(Mutex::new(SessionState::default())),
            acquiring: SingleFlight::new(),
            timeout,
        }
    }

    /// Gibt den lokalen Stream zurück und beschafft ihn bei Bedarf
    pub async fn ensure_local_stream(&self) -> Result<MediaStream, MediaAcquisitionError> {
        if let Some(stream) = self.state.lock().local.clone() {
            return Ok(stream);
        }

        let capability = Arc::clone(&self.capability);
        let state = Arc::clone(&self.state);
        let timeout = self.timeout;

        self.acquiring
            .run(move || {
                async move {
                    let generation = state.lock().generation;

                    let stream =
                        match tokio::time::timeout(timeout, capability.capture_audio()).await {
                            Ok(Ok(stream)) => stream,
                            Ok(Err(e)) => return Err(e),
                            Err(_) => return Err(MediaAcquisitionError::TimedOut),
                        };

                    let mut guard = state.lock();
                    if guard.generation != generation {
                        drop(guard);
                        tracing::info!("Discarding microphone stream acquired after release");
                        stream.stop_all();
                        return Err(MediaAcquisitionError::Released);
                    }

                    if guard.muted {
                        for track in stream.audio_tracks() {
                            track.set_enabled(false);
                        }
                    }
                    guard.local = Some(stream.clone());
                    tracing::info!("Local audio stream acquired: {}", stream.id());
                    Ok(stream)
                }
                .boxed()
            })
            .await
    }

    /// Merkt sich den entfernten Stream für die UI
    pub fn attach_remote(&self, stream: MediaStream) {
        let previous = {
            let mut state = self.state.lock();
            state.remote.replace(stream)
        };
        if let Some(previous) = previous {
            previous.stop_all();
        }
    }

    /// Stoppt alle Tracks beider Streams und vergisst sie
    pub fn release(&self) {
        let (local, remote) = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.muted = false;
            (state.local.take(), state.remote.take())
        };

        if local.is_none() && remote.is_none() {
            return;
        }
        if let Some(local) = local {
            local.stop_all();
        }
        if let Some(remote) = remote {
            remote.stop_all();
        }
        tracing::info!("Media resources released");
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.state.lock().local.clone()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.state.lock().remote.clone()
    }

    /// Setzt den Mute-Status für alle lokalen Audio-Tracks
    pub fn set_muted(&self, muted: bool) {
        let mut state = self.state.lock();
        state.muted = muted;
        if let Some(local) = state.local.as_ref() {
            for track in local.audio_tracks() {
                track.set_enabled(!muted);
            }
        }
        tracing::debug!("Audio muted: {}", muted);
    }

    pub fn is_muted(&self) -> bool {
        self.state.lock().muted
    }
}

impl std::fmt::Debug for MediaSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MediaSession")
            .field("local", &state.local.as_ref().map(MediaStream::id))
            .field("remote", &state.remote.as_ref().map(MediaStream::id))
            .field("muted", &state.muted)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
