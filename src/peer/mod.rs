//! Peer Module - Negotiation der direkten Medienverbindung
//!
//! Dieses Modul verwaltet:
//! - Genau eine Negotiation-Instanz pro Anruf (Initiator oder Answerer)
//! - Geordnete Zustellung eingehender SDP/ICE Payloads
//! - Lifecycle-Meldungen an den Controller

mod negotiator;
mod webrtc_engine;

pub use negotiator::{
    NegotiationError, PeerConnection, PeerEngine, PeerEvent, PeerEventSink, PeerId,
    PeerNegotiator, PeerNotice, PeerRole, PeerSetup,
};
pub use webrtc_engine::{SignalData, WebRtcEngine};
