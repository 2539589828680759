//! Media Module - Audio Capture und Stream-Verwaltung
//!
//! Dieses Modul verwaltet:
//! - Lokalen Mikrofon-Stream (lazy, einmal pro Anrufversuch)
//! - Entfernten Stream vom Peer
//! - Freigabe aller Tracks am Ende eines Anrufs

mod capture;
mod session;
mod stream;

pub use capture::{CpalCapture, CHANNELS, SAMPLE_RATE};
pub use session::{MediaAcquisitionError, MediaCapability, MediaSession};
pub use stream::{MediaStream, MediaTrack, TrackKind, WeakMediaTrack};
