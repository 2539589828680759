//! WebRTC Peer Engine
//!
//! Verwaltet eine `RTCPeerConnection` pro Anruf. Eingehende Payloads
//! laufen über eine eigene Queue pro Peer und werden strikt in
//! Empfangsreihenfolge angewendet (ein Answer vor seinem Offer ist wertlos).
//!
//! Hinweis: Opus Encoding der Mikrofon-Samples ist noch nicht angebunden,
//! der lokale RTP-Track wird nur für die Negotiation registriert. Ebenso
//! gibt es keine Wiedergabe: eingehendes RTP wird gelesen und verworfen,
//! bis der Handle des entfernten Tracks gestoppt wird.

use super::negotiator::{
    NegotiationError, PeerConnection, PeerEngine, PeerEventSink, PeerRole, PeerSetup,
};
use crate::config::IceServerConfig;
use crate::media::{MediaStream, MediaTrack, TrackKind, CHANNELS, SAMPLE_RATE};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::TrackLocal;

fn engine_error(e: impl std::fmt::Display) -> NegotiationError {
    NegotiationError::Engine(e.to_string())
}

// ============================================================================
// SIGNAL PAYLOAD
// ============================================================================

/// Inhalt des `data`-Felds eines `signal`-Events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SignalData {
    Offer { sdp: String },
    Answer { sdp: String },
    Candidate { candidate: RTCIceCandidateInit },
}

impl SignalData {
    pub fn to_value(&self) -> Result<Value, NegotiationError> {
        serde_json::to_value(self).map_err(|e| NegotiationError::InvalidPayload(e.to_string()))
    }

    pub fn from_value(value: Value) -> Result<Self, NegotiationError> {
        serde_json::from_value(value).map_err(|e| NegotiationError::InvalidPayload(e.to_string()))
    }
}

// ============================================================================
// WEBRTC ENGINE
// ============================================================================

/// Produktions-Engine auf Basis von `webrtc`
#[derive(Debug, Clone)]
pub struct WebRtcEngine {
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcEngine {
    pub fn new(ice_servers: &[IceServerConfig]) -> Self {
        Self {
            ice_servers: ice_servers
                .iter()
                .map(|server| RTCIceServer {
                    urls: server.urls.clone(),
                    username: server.username.clone(),
                    credential: server.credential.clone(),
                    ..Default::default()
                })
                .collect(),
        }
    }

    /// Erstellt eine neue Peer Connection
    async fn create_peer_connection(&self) -> Result<Arc<RTCPeerConnection>, NegotiationError> {
        // Media Engine mit Opus konfigurieren
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(engine_error)?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry =
            register_default_interceptors(registry, &mut media_engine).map_err(engine_error)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(engine_error)?;
        Ok(Arc::new(pc))
    }
}

#[async_trait]
impl PeerEngine for WebRtcEngine {
    async fn open(
        &self,
        setup: PeerSetup,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        let pc = self.create_peer_connection().await?;
        register_handlers(&pc, &events);

        let audio_track = Arc::new(TrackLocalStaticRTP::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: SAMPLE_RATE,
                channels: CHANNELS,
                ..Default::default()
            },
            "audio".to_string(),
            setup.local.id().to_string(),
        ));

        if let Err(e) = pc
            .add_track(Arc::clone(&audio_track) as Arc<dyn TrackLocal + Send + Sync>)
            .await
        {
            let _ = pc.close().await;
            return Err(engine_error(e));
        }

        if setup.role == PeerRole::Initiator {
            if let Err(e) = send_offer(&pc, &events).await {
                let _ = pc.close().await;
                return Err(e);
            }
        }

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        tokio::spawn(apply_loop(Arc::clone(&pc), events, queue_rx, stop_rx));

        tracing::info!("WebRTC peer opened for call {}", setup.call_id);
        Ok(Box::new(WebRtcPeer {
            queue: Mutex::new(Some(queue_tx)),
            stop: Mutex::new(Some(stop_tx)),
        }))
    }
}

/// Registriert die Event Handler der Peer Connection
fn register_handlers(pc: &RTCPeerConnection, events: &PeerEventSink) {
    // Connection State Handler
    let sink = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        tracing::info!("Peer connection state: {:?}", s);
        match s {
            RTCPeerConnectionState::Connected => {
                sink.connected();
            }
            RTCPeerConnectionState::Failed => {
                sink.failed("Peer connection failed");
            }
            _ => {}
        }
        Box::pin(async {})
    }));

    // ICE Candidate Handler
    let sink = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            match c.to_json() {
                Ok(candidate) => match (SignalData::Candidate { candidate }).to_value() {
                    Ok(value) => {
                        sink.signal(value);
                    }
                    Err(e) => tracing::warn!("Failed to encode ICE candidate: {}", e),
                },
                Err(e) => tracing::warn!("Failed to serialize ICE candidate: {}", e),
            }
        }
        Box::pin(async {})
    }));

    // Track Handler (für eingehendes Audio)
    let sink = events.clone();
    pc.on_track(Box::new(move |track, _, _| {
        tracing::info!("Received remote track: {:?}", track.kind());

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = MediaTrack::with_stop_hook(TrackKind::Audio, move || {
            let _ = stop_tx.send(());
        });
        if sink.remote_stream(MediaStream::new(vec![handle])) {
            tokio::spawn(async move {
                let packets = consume_remote(
                    || {
                        let track = Arc::clone(&track);
                        async move {
                            track
                                .read_rtp()
                                .await
                                .map(|(packet, _)| packet.payload.len())
                        }
                    },
                    stop_rx,
                )
                .await;
                tracing::debug!("Remote track finished after {} packets", packets);
            });
        }
        Box::pin(async {})
    }));
}

/// Liest den entfernten Track leer, bis sein Handle gestoppt oder gedroppt
/// wird oder der Track endet. Gibt die Anzahl gelesener Pakete zurück.
async fn consume_remote<F, Fut, E>(mut read: F, mut stop: oneshot::Receiver<()>) -> usize
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<usize, E>>,
    E: std::fmt::Display,
{
    let mut packets = 0;
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            result = read() => match result {
                Ok(_) => packets += 1,
                Err(e) => {
                    tracing::debug!("Remote track ended: {}", e);
                    break;
                }
            },
        }
    }
    packets
}

async fn send_offer(pc: &RTCPeerConnection, events: &PeerEventSink) -> Result<(), NegotiationError> {
    let offer = pc.create_offer(None).await.map_err(engine_error)?;
    pc.set_local_description(offer.clone())
        .await
        .map_err(engine_error)?;

    events.signal(SignalData::Offer { sdp: offer.sdp }.to_value()?);
    Ok(())
}

/// Wendet Payloads nacheinander an, bis der Peer geschlossen wird
async fn apply_loop(
    pc: Arc<RTCPeerConnection>,
    events: PeerEventSink,
    mut queue: mpsc::UnboundedReceiver<Value>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        let data = tokio::select! {
            biased;
            _ = &mut stop => break,
            data = queue.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };

        if let Err(e) = apply(&pc, &events, data).await {
            match e {
                NegotiationError::InvalidPayload(_) => {
                    tracing::warn!("Ignoring negotiation payload: {}", e);
                }
                _ => {
                    tracing::error!("Negotiation failed: {}", e);
                    events.failed(e.to_string());
                }
            }
        }
    }

    if let Err(e) = pc.close().await {
        tracing::warn!("Failed to close peer connection: {}", e);
    }
    tracing::debug!("WebRTC peer closed");
}

async fn apply(
    pc: &RTCPeerConnection,
    events: &PeerEventSink,
    data: Value,
) -> Result<(), NegotiationError> {
    match SignalData::from_value(data)? {
        SignalData::Offer { sdp } => {
            let offer = RTCSessionDescription::offer(sdp)
                .map_err(|e| NegotiationError::InvalidPayload(e.to_string()))?;
            pc.set_remote_description(offer).await.map_err(engine_error)?;

            let answer = pc.create_answer(None).await.map_err(engine_error)?;
            pc.set_local_description(answer.clone())
                .await
                .map_err(engine_error)?;
            events.signal(SignalData::Answer { sdp: answer.sdp }.to_value()?);
        }
        SignalData::Answer { sdp } => {
            let answer = RTCSessionDescription::answer(sdp)
                .map_err(|e| NegotiationError::InvalidPayload(e.to_string()))?;
            pc.set_remote_description(answer).await.map_err(engine_error)?;
        }
        SignalData::Candidate { candidate } => {
            // Ein einzelner unbrauchbarer Candidate beendet den Anruf nicht
            if let Err(e) = pc.add_ice_candidate(candidate).await {
                tracing::warn!("Failed to add ICE candidate: {}", e);
            }
        }
    }
    Ok(())
}

struct WebRtcPeer {
    queue: Mutex<Option<mpsc::UnboundedSender<Value>>>,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl PeerConnection for WebRtcPeer {
    fn deliver(&self, data: Value) -> Result<(), NegotiationError> {
        let queue = self.queue.lock();
        let queue = queue.as_ref().ok_or(NegotiationError::Closed)?;
        queue.send(data).map_err(|_| NegotiationError::Closed)
    }

    fn close(&self) {
        self.queue.lock().take();
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
