//! Signal Channel - genau eine Transport-Verbindung zum Call-Control-Service
//!
//! Verwaltet die Verbindung:
//! - Single-Flight Connect (gleichzeitige Aufrufer teilen sich den Handshake)
//! - Synchrones Senden, ohne Pufferung im getrennten Zustand
//! - Eingehende Frames parsen und als `ChannelEvent` weiterleiten
//! - `Close` genau einmal pro Verbindungs-Lebenszyklus

use super::messages::{InboundEvent, OutboundEvent};
use super::transport::{Connector, Frame, FrameSink, FrameStream, Link, TransportError};
use crate::config::signaling_endpoint;
use crate::single_flight::SingleFlight;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

// ============================================================================
// STATUS & EVENTS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Events die vom SignalChannel ausgelöst werden
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Transport ist bereit
    Open,

    /// Geparstes Event vom Server
    Event(InboundEvent),

    /// Frame konnte nicht geparst werden und wurde verworfen
    Malformed(String),

    /// Transport-Fehler
    Error(String),

    /// Lebenszyklus beendet (auch nach fehlgeschlagenem Connect)
    Close,
}

// ============================================================================
// CHANNEL STATE
// ============================================================================

struct Lifecycle {
    closed: Arc<AtomicBool>,
    outbound: mpsc::UnboundedSender<String>,
    reader: JoinHandle<()>,
}

#[derive(Default)]
struct ChannelState {
    status: ConnectionStatus,
    /// Wird von `disconnect` erhöht, um laufende Connects zu verwerfen
    epoch: u64,
    lifecycle: Option<Lifecycle>,
}

struct ChannelInner {
    connector: Arc<dyn Connector>,
    base_url: Url,
    state: Mutex<ChannelState>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

// ============================================================================
// SIGNAL CHANNEL
// ============================================================================

pub struct SignalChannel {
    inner: Arc<ChannelInner>,
    connecting: SingleFlight<(), TransportError>,
}

impl SignalChannel {
    /// Erstellt einen neuen SignalChannel samt Event-Receiver
    pub fn new(
        connector: Arc<dyn Connector>,
        base_url: Url,
    ) -> (Self, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (events, event_rx) = mpsc::unbounded_channel();

        let channel = Self {
            inner: Arc::new(ChannelInner {
                connector,
                base_url,
                state: Mutex::new(ChannelState::default()),
                events,
            }),
            connecting: SingleFlight::new(),
        };

        (channel, event_rx)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    pub fn is_connected(&self) -> bool {
        self.status() == ConnectionStatus::Connected
    }

    /// Verbindet mit dem Signaling-Server
    ///
    /// Idempotent wenn bereits verbunden. Läuft bereits ein Versuch, wird
    /// dessen Ergebnis geteilt statt einen zweiten Handshake zu starten.
    pub async fn connect(&self, credential: &str) -> Result<(), TransportError> {
        if self.is_connected() {
            return Ok(());
        }

        let endpoint = signaling_endpoint(&self.inner.base_url, credential);
        let inner = Arc::clone(&self.inner);
        self.connecting
            .run(move || inner.open(endpoint).boxed())
            .await
    }

    /// Sendet ein Event. Schlägt sofort fehl wenn nicht verbunden.
    pub fn send(&self, event: &OutboundEvent) -> Result<(), TransportError> {
        let state = self.inner.state.lock();
        let lifecycle = match (state.status, state.lifecycle.as_ref()) {
            (ConnectionStatus::Connected, Some(lifecycle)) => lifecycle,
            _ => return Err(TransportError::NotConnected),
        };

        let text = event
            .to_json()
            .map_err(|e| TransportError::Serialization(e.to_string()))?;

        lifecycle
            .outbound
            .send(text)
            .map_err(|e| TransportError::SendFailed(e.to_string()))?;

        tracing::debug!("Sent signaling event: {}", event.kind());
        Ok(())
    }

    /// Trennt die Verbindung. Idempotent.
    pub fn disconnect(&self) {
        let (lifecycle, previous) = {
            let mut state = self.inner.state.lock();
            state.epoch += 1;
            let previous = state.status;
            state.status = ConnectionStatus::Disconnected;
            (state.lifecycle.take(), previous)
        };
        // Ein späteres connect() darf nicht auf den abgebrochenen Versuch warten
        self.connecting.forget();

        match lifecycle {
            Some(lifecycle) => {
                lifecycle.reader.abort();
                if !lifecycle.closed.swap(true, Ordering::SeqCst) {
                    self.inner.emit(ChannelEvent::Close);
                }
                // Outbound-Sender wird hier gedroppt, der Write-Task schließt den Sink
                tracing::info!("Disconnected from signaling server");
            }
            None if previous == ConnectionStatus::Connecting => {
                tracing::info!("Cancelling pending signaling connect");
            }
            None => {}
        }
    }
}

impl ChannelInner {
    fn emit(&self, event: ChannelEvent) {
        // Receiver weg heißt Controller weg, dann ist nichts mehr zu tun
        let _ = self.events.send(event);
    }

    async fn open(self: Arc<Self>, endpoint: Url) -> Result<(), TransportError> {
        let epoch = {
            let mut state = self.state.lock();
            if state.status == ConnectionStatus::Connected {
                return Ok(());
            }
            state.status = ConnectionStatus::Connecting;
            state.epoch
        };

        let result = self.connector.connect(&endpoint).await;

        let mut state = self.state.lock();
        let link = match result {
            Ok(link) if state.epoch == epoch => link,
            Ok(link) => {
                drop(state);
                tracing::info!("Signaling connect finished after disconnect, closing link");
                let Link { mut sink, .. } = link;
                tokio::spawn(async move {
                    let _ = sink.close().await;
                });
                self.emit(ChannelEvent::Close);
                return Err(TransportError::Cancelled);
            }
            Err(e) => {
                if state.epoch == epoch {
                    state.status = ConnectionStatus::Disconnected;
                }
                drop(state);
                tracing::error!("Signaling connect failed: {}", e);
                self.emit(ChannelEvent::Error(e.to_string()));
                self.emit(ChannelEvent::Close);
                return Err(e);
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let (outbound, outbound_rx) = mpsc::unbounded_channel::<String>();

        state.status = ConnectionStatus::Connected;
        // Open vor dem Start des Read-Tasks, damit kein Event Open überholt
        self.emit(ChannelEvent::Open);

        let Link { sink, stream } = link;
        tokio::spawn(write_loop(sink, outbound_rx));
        let reader = tokio::spawn(read_loop(
            Arc::clone(&self),
            stream,
            Arc::clone(&closed),
        ));

        state.lifecycle = Some(Lifecycle {
            closed,
            outbound,
            reader,
        });

        tracing::info!("Connected to signaling server");
        Ok(())
    }

    /// Beendet einen Lebenszyklus vom Read-Task aus
    fn finish(&self, closed: &Arc<AtomicBool>) {
        if closed.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let mut state = self.state.lock();
            let current = state
                .lifecycle
                .as_ref()
                .is_some_and(|lifecycle| Arc::ptr_eq(&lifecycle.closed, closed));
            if current {
                state.lifecycle = None;
                state.status = ConnectionStatus::Disconnected;
            }
        }

        self.emit(ChannelEvent::Close);
    }
}

async fn read_loop(inner: Arc<ChannelInner>, mut stream: FrameStream, closed: Arc<AtomicBool>) {
    while let Some(frame) = stream.next().await {
        if closed.load(Ordering::SeqCst) {
            break;
        }

        match frame {
            Ok(Frame::Text(text)) => match InboundEvent::parse(&text) {
                Ok(event) => {
                    tracing::debug!("Received signaling event: {}", event.kind());
                    inner.emit(ChannelEvent::Event(event));
                }
                Err(e) => {
                    tracing::warn!("Dropping malformed signaling frame: {}", e);
                    inner.emit(ChannelEvent::Malformed(e.to_string()));
                }
            },
            Ok(Frame::Close) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Err(e) => {
                tracing::error!("WebSocket error: {}", e);
                inner.emit(ChannelEvent::Error(e.to_string()));
                break;
            }
        }
    }

    inner.finish(&closed);
}

async fn write_loop(mut sink: FrameSink, mut rx: mpsc::UnboundedReceiver<String>) {
    while let Some(text) = rx.recv().await {
        if let Err(e) = sink.send(text).await {
            tracing::error!("Failed to send WebSocket message: {}", e);
            break;
        }
    }
    let _ = sink.close().await;
}

impl std::fmt::Debug for SignalChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalChannel")
            .field("base_url", &self.inner.base_url.as_str())
            .field("status", &self.status())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================
