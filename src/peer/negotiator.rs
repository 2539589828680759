//! Peer Negotiator - genau eine Negotiation-Instanz pro Anruf
//!
//! Die Engine meldet ihre vier Beobachtungen (Signal, Remote-Stream,
//! Connected, Error) über einen `PeerEventSink`. Jede Meldung trägt die
//! `PeerId` der Instanz, damit der Controller Nachzügler einer bereits
//! zerstörten Instanz verwerfen kann.

use crate::media::MediaStream;
use crate::signaling::CallId;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    #[error("A peer connection is already active")]
    AlreadyActive,

    #[error("No active peer connection")]
    NoActivePeer,

    #[error("Peer {0} has already been destroyed")]
    StaleHandle(PeerId),

    #[error("WebRTC error: {0}")]
    Engine(String),

    #[error("Invalid negotiation payload: {0}")]
    InvalidPayload(String),

    #[error("Peer connection is closed")]
    Closed,
}

// ============================================================================
// PEER TYPES
// ============================================================================

/// Rolle der lokalen Seite in der Negotiation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    /// Erstellt das Offer
    Initiator,
    /// Beantwortet ein Offer
    Answerer,
}

/// Kennung einer Negotiation-Instanz, fortlaufend pro Negotiator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId(u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// Beobachtungen einer Negotiation-Instanz
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Lokale Negotiation-Daten (SDP/ICE) für die Gegenseite
    Signal(Value),
    /// Entfernter Audio-Stream ist eingetroffen
    RemoteStream(MediaStream),
    Connected,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct PeerNotice {
    pub peer: PeerId,
    pub event: PeerEvent,
}

/// Rückkanal einer Engine-Instanz zum Negotiator
///
/// Nach `destroy()` ist der Sink abgekoppelt und verwirft alle Meldungen.
#[derive(Debug, Clone)]
pub struct PeerEventSink {
    peer: PeerId,
    tx: mpsc::UnboundedSender<PeerNotice>,
    detached: Arc<AtomicBool>,
}

impl PeerEventSink {
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::SeqCst)
    }

    pub fn signal(&self, data: Value) -> bool {
        self.emit(PeerEvent::Signal(data))
    }

    pub fn remote_stream(&self, stream: MediaStream) -> bool {
        self.emit(PeerEvent::RemoteStream(stream))
    }

    pub fn connected(&self) -> bool {
        self.emit(PeerEvent::Connected)
    }

    pub fn failed(&self, message: impl Into<String>) -> bool {
        self.emit(PeerEvent::Error(message.into()))
    }

    fn emit(&self, event: PeerEvent) -> bool {
        if self.is_detached() {
            tracing::debug!("Dropping event from detached {}", self.peer);
            return false;
        }
        self.tx
            .send(PeerNotice {
                peer: self.peer,
                event,
            })
            .is_ok()
    }
}

/// Parameter für eine neue Negotiation-Instanz
#[derive(Debug, Clone)]
pub struct PeerSetup {
    pub role: PeerRole,
    pub call_id: CallId,
    pub local: MediaStream,
}

/// Negotiation-Engine (WebRTC in Produktion, Fake in Tests)
#[async_trait]
pub trait PeerEngine: Send + Sync {
    async fn open(
        &self,
        setup: PeerSetup,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError>;
}

/// Eine laufende Negotiation-Instanz
pub trait PeerConnection: Send + Sync {
    /// Reiht einen eingehenden Payload ein; die Reihenfolge bleibt erhalten
    fn deliver(&self, data: Value) -> Result<(), NegotiationError>;

    fn close(&self);
}

// ============================================================================
// PEER NEGOTIATOR
// ============================================================================

struct PeerHandle {
    id: PeerId,
    call_id: CallId,
    connection: Box<dyn PeerConnection>,
    detached: Arc<AtomicBool>,
}

pub struct PeerNegotiator {
    engine: Arc<dyn PeerEngine>,
    events: mpsc::UnboundedSender<PeerNotice>,
    current: Option<PeerHandle>,
    next_id: u64,
}

impl PeerNegotiator {
    /// Erstellt den Negotiator und den Empfänger für `PeerNotice`s
    pub fn new(engine: Arc<dyn PeerEngine>) -> (Self, mpsc::UnboundedReceiver<PeerNotice>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                engine,
                events,
                current: None,
                next_id: 1,
            },
            rx,
        )
    }

    /// Erstellt genau eine Instanz für den Anruf
    pub async fn create(
        &mut self,
        role: PeerRole,
        call_id: CallId,
        local: &MediaStream,
    ) -> Result<PeerId, NegotiationError> {
        if self.current.is_some() {
            return Err(NegotiationError::AlreadyActive);
        }

        let id = PeerId(self.next_id);
        self.next_id += 1;

        let detached = Arc::new(AtomicBool::new(false));
        let sink = PeerEventSink {
            peer: id,
            tx: self.events.clone(),
            detached: Arc::clone(&detached),
        };
        let setup = PeerSetup {
            role,
            call_id: call_id.clone(),
            local: local.clone(),
        };

        let connection = match self.engine.open(setup, sink).await {
            Ok(connection) => connection,
            Err(e) => {
                detached.store(true, Ordering::SeqCst);
                return Err(e);
            }
        };

        tracing::info!("Created {} as {:?} for call {}", id, role, call_id);
        self.current = Some(PeerHandle {
            id,
            call_id,
            connection,
            detached,
        });
        Ok(id)
    }

    /// Übergibt einen eingehenden Payload an die lebende Instanz
    pub fn deliver(&self, id: PeerId, data: Value) -> Result<(), NegotiationError> {
        let handle = self.current.as_ref().ok_or(NegotiationError::NoActivePeer)?;
        if handle.id != id {
            return Err(NegotiationError::StaleHandle(id));
        }
        handle.connection.deliver(data)
    }

    /// Koppelt alle Listener ab und schließt die Instanz
    ///
    /// Gibt `true` zurück, wenn tatsächlich eine Instanz zerstört wurde.
    pub fn destroy(&mut self) -> bool {
        let Some(handle) = self.current.take() else {
            return false;
        };
        handle.detached.store(true, Ordering::SeqCst);
        handle.connection.close();
        tracing::info!("Destroyed {} for call {}", handle.id, handle.call_id);
        true
    }

    pub fn is_live(&self) -> bool {
        self.current.is_some()
    }

    pub fn current_id(&self) -> Option<PeerId> {
        self.current.as_ref().map(|handle| handle.id)
    }

    pub fn current_call_id(&self) -> Option<&CallId> {
        self.current.as_ref().map(|handle| &handle.call_id)
    }

    /// Stammt die Meldung von der aktuell lebenden Instanz?
    pub fn is_current(&self, notice: &PeerNotice) -> bool {
        self.current_id() == Some(notice.peer)
    }
}

impl Drop for PeerNegotiator {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for PeerNegotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerNegotiator")
            .field("current", &self.current_id())
            .field("next_id", &self.next_id)
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
