//! Mikrofon-Capture über cpal
//!
//! Jede Beschaffung startet einen eigenen Capture-Thread, der den
//! cpal-Stream besitzt (cpal-Streams sind nicht `Send`). Der Stop-Hook des
//! Tracks beendet den Thread und damit die Aufnahme, ebenso das Droppen des
//! letzten Track-Handles. Thread und Callback halten den Track nur schwach.

use super::session::{MediaAcquisitionError, MediaCapability};
use super::stream::{MediaStream, MediaTrack, TrackKind, WeakMediaTrack};
use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{
    BuildStreamError, Device, SampleFormat, Stream, StreamConfig, SupportedStreamConfigRange,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::oneshot;

// ============================================================================
// CONSTANTS
// ============================================================================

/// Sample Rate (48kHz ist der Standard für Opus)
pub const SAMPLE_RATE: u32 = 48000;

/// Channels (Mono für Voice)
pub const CHANNELS: u16 = 1;

// ============================================================================
// CPAL CAPTURE
// ============================================================================

/// Mikrofon-Zugriff über das Standard-Eingabegerät
#[derive(Debug, Default, Clone)]
pub struct CpalCapture {
    /// Audio Level (0.0 - 1.0) der laufenden Aufnahme
    input_level: Arc<Mutex<f32>>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aktueller Eingangspegel (RMS)
    pub fn input_level(&self) -> f32 {
        *self.input_level.lock()
    }
}

#[async_trait]
impl MediaCapability for CpalCapture {
    async fn capture_audio(&self) -> Result<MediaStream, MediaAcquisitionError> {
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), MediaAcquisitionError>>();
        let (stop_tx, stop_rx) = std::sync::mpsc::channel::<()>();

        let track = MediaTrack::with_stop_hook(TrackKind::Audio, move || {
            let _ = stop_tx.send(());
        });

        let thread_track = track.downgrade();
        let input_level = Arc::clone(&self.input_level);

        std::thread::Builder::new()
            .name("callsession-capture".to_string())
            .spawn(move || match open_input_stream(thread_track, &input_level) {
                Ok(stream) => {
                    hold_until_stopped(stream, ready_tx, stop_rx);
                    *input_level.lock() = 0.0;
                    tracing::info!("Audio capture stopped");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| MediaAcquisitionError::StreamFailed(e.to_string()))?;

        ready_rx
            .await
            .map_err(|_| MediaAcquisitionError::StreamFailed("capture thread exited".into()))??;

        Ok(MediaStream::new(vec![track]))
    }
}

/// Hält den laufenden Stream, bis der Track gestoppt oder gedroppt wird
///
/// Ist der Anfragende schon weg (z.B. Timeout), wird der Stream sofort
/// geschlossen. Gibt zurück, ob der Stream ausgeliefert wurde.
fn hold_until_stopped<S>(
    stream: S,
    ready_tx: oneshot::Sender<Result<(), MediaAcquisitionError>>,
    stop_rx: std::sync::mpsc::Receiver<()>,
) -> bool {
    if ready_tx.send(Ok(())).is_err() {
        tracing::warn!("Capture requester gone, closing input stream");
        drop(stream);
        return false;
    }

    let _ = stop_rx.recv();
    drop(stream);
    true
}

/// Öffnet und startet den Input-Stream des Standard-Geräts
fn open_input_stream(
    track: WeakMediaTrack,
    input_level: &Arc<Mutex<f32>>,
) -> Result<Stream, MediaAcquisitionError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(MediaAcquisitionError::NoInputDevice)?;

    let config = find_best_input_config(&device)?;

    tracing::info!(
        "Starting audio capture: {} Hz, {} channels",
        config.sample_rate.0,
        config.channels
    );

    let level = Arc::clone(input_level);

    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let enabled = track.upgrade().is_some_and(|track| track.is_enabled());
                if !enabled || data.is_empty() {
                    *level.lock() = 0.0;
                    return;
                }

                // Audio Level berechnen (RMS)
                let rms: f32 =
                    (data.iter().map(|s| s * s).sum::<f32>() / data.len() as f32).sqrt();
                *level.lock() = rms.min(1.0);
            },
            |err| {
                tracing::error!("Audio capture error: {}", err);
            },
            None,
        )
        .map_err(|e| match e {
            BuildStreamError::DeviceNotAvailable => MediaAcquisitionError::NoInputDevice,
            BuildStreamError::StreamConfigNotSupported => {
                MediaAcquisitionError::UnsupportedConfig("stream config not supported".into())
            }
            BuildStreamError::BackendSpecific { err } => {
                MediaAcquisitionError::PermissionDenied(err.description)
            }
            other => MediaAcquisitionError::StreamFailed(other.to_string()),
        })?;

    stream
        .play()
        .map_err(|e| MediaAcquisitionError::StreamFailed(e.to_string()))?;

    Ok(stream)
}

fn find_best_input_config(device: &Device) -> Result<StreamConfig, MediaAcquisitionError> {
    let configs = device
        .supported_input_configs()
        .map_err(|e| MediaAcquisitionError::UnsupportedConfig(e.to_string()))?;

    select_best_config(configs.collect())
}

/// Wählt die beste Konfiguration aus einer Liste
///
/// Priorität: 48kHz F32 > beliebige Rate F32. Andere Formate werden nicht
/// unterstützt, da der Callback mit `f32` arbeitet.
fn select_best_config(
    configs: Vec<SupportedStreamConfigRange>,
) -> Result<StreamConfig, MediaAcquisitionError> {
    let target_rate = cpal::SampleRate(SAMPLE_RATE);

    let f32_configs = || {
        configs
            .iter()
            .filter(|config| config.sample_format() == SampleFormat::F32)
    };

    // Versuche exakt 48kHz zu finden, Mono bevorzugt
    let exact = f32_configs()
        .filter(|config| {
            config.min_sample_rate() <= target_rate && config.max_sample_rate() >= target_rate
        })
        .min_by_key(|config| config.channels().abs_diff(CHANNELS));
    if let Some(config) = exact {
        return Ok(config.clone().with_sample_rate(target_rate).into());
    }

    // Fallback auf höchste verfügbare Rate
    if let Some(config) = f32_configs().max_by_key(|config| config.max_sample_rate().0) {
        return Ok(config.clone().with_max_sample_rate().into());
    }

    Err(MediaAcquisitionError::UnsupportedConfig(
        "No f32 input configuration found".to_string(),
    ))
}

// ============================================================================
// TESTS
// ============================================================================
