//! Media Streams und Tracks
//!
//! Handles sind Referenzen: ein Klon zeigt auf denselben Track. Besitzer ist
//! immer die `MediaSession`, alle anderen halten nur Klone zum Lesen.

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use uuid::Uuid;

type StopHook = Box<dyn FnOnce() + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    stopped: AtomicBool,
    enabled: AtomicBool,
    on_stop: Mutex<Option<StopHook>>,
}

/// Ein einzelner Media Track
#[derive(Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind) -> Self {
        Self::build(kind, None)
    }

    /// Track mit Hook, der beim ersten `stop()` die Quelle freigibt
    pub fn with_stop_hook(kind: TrackKind, hook: impl FnOnce() + Send + 'static) -> Self {
        Self::build(kind, Some(Box::new(hook)))
    }

    fn build(kind: TrackKind, hook: Option<StopHook>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: Uuid::new_v4().to_string(),
                kind,
                stopped: AtomicBool::new(false),
                enabled: AtomicBool::new(true),
                on_stop: Mutex::new(hook),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Referenz, die den Track nicht am Leben hält
    pub fn downgrade(&self) -> WeakMediaTrack {
        WeakMediaTrack {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Stoppt den Track. Weitere Aufrufe sind wirkungslos.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        let hook = self.inner.on_stop.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl std::fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("stopped", &self.is_stopped())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Schwache Referenz auf einen `MediaTrack`
///
/// Für Quellen, die ihren eigenen Track beobachten: sie dürfen ihn nicht
/// am Leben halten, sonst läuft die Quelle nach dem letzten Drop weiter.
#[derive(Clone)]
pub struct WeakMediaTrack {
    inner: Weak<TrackInner>,
}

impl WeakMediaTrack {
    pub fn upgrade(&self) -> Option<MediaTrack> {
        self.inner.upgrade().map(|inner| MediaTrack { inner })
    }
}

/// Ein Media Stream aus einem oder mehreren Tracks
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &MediaTrack> {
        self.tracks
            .iter()
            .filter(|track| track.kind() == TrackKind::Audio)
    }

    /// Mindestens ein Track läuft noch
    pub fn is_active(&self) -> bool {
        self.tracks.iter().any(|track| !track.is_stopped())
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
