//! In-Memory Fakes für Transport, Mikrofon und Peer Engine

use crate::media::{MediaAcquisitionError, MediaCapability, MediaStream, MediaTrack, TrackKind};
use crate::peer::{
    NegotiationError, PeerConnection, PeerEngine, PeerEventSink, PeerRole, PeerSetup,
};
use crate::signaling::{CallId, Connector, Frame, Link, TransportError};
use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{FutureExt, SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use url::Url;

/// Gibt anderen Tasks Gelegenheit zu laufen
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Alle sofort verfügbaren Nachrichten
pub fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

// ============================================================================
// FAKE CONNECTOR
// ============================================================================

struct RemoteInner {
    inbound: fmpsc::UnboundedSender<Result<Frame, TransportError>>,
    outbound: Mutex<fmpsc::UnboundedReceiver<String>>,
    sent: Mutex<Vec<Value>>,
    closed_by_client: AtomicBool,
}

/// Serverseite einer Fake-Verbindung
#[derive(Clone)]
pub struct FakeRemote {
    inner: Arc<RemoteInner>,
}

impl FakeRemote {
    pub fn push_text(&self, text: impl Into<String>) {
        let _ = self.inner.inbound.unbounded_send(Ok(Frame::Text(text.into())));
    }

    pub fn push_json(&self, value: Value) {
        self.push_text(value.to_string());
    }

    /// Server schließt die Verbindung
    pub fn close(&self) {
        let _ = self.inner.inbound.unbounded_send(Ok(Frame::Close));
    }

    /// Alle bisher vom Client gesendeten Nachrichten
    pub async fn sent(&self) -> Vec<Value> {
        settle().await;
        self.collect();
        self.inner.sent.lock().clone()
    }

    /// Nur die `type`-Felder der gesendeten Nachrichten
    pub async fn sent_types(&self) -> Vec<String> {
        self.sent()
            .await
            .iter()
            .filter_map(|value| value.get("type").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    pub async fn is_closed_by_client(&self) -> bool {
        settle().await;
        self.collect();
        self.inner.closed_by_client.load(Ordering::SeqCst)
    }

    fn collect(&self) {
        let mut outbound = self.inner.outbound.lock();
        let mut sent = self.inner.sent.lock();
        loop {
            match outbound.next().now_or_never() {
                Some(Some(text)) => {
                    sent.push(serde_json::from_str(&text).unwrap_or(Value::String(text)));
                }
                Some(None) => {
                    self.inner.closed_by_client.store(true, Ordering::SeqCst);
                    break;
                }
                None => break,
            }
        }
    }
}

/// Connector, der In-Memory-Verbindungen öffnet
#[derive(Default)]
pub struct FakeConnector {
    remotes: Mutex<Vec<FakeRemote>>,
    endpoints: Mutex<Vec<Url>>,
    attempts: AtomicUsize,
    failures: Mutex<VecDeque<TransportError>>,
    holds: Mutex<VecDeque<oneshot::Receiver<()>>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn endpoints(&self) -> Vec<Url> {
        self.endpoints.lock().clone()
    }

    /// Der nächste Connect wartet, bis der Sender feuert oder gedroppt wird
    pub fn hold_next_connect(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.holds.lock().push_back(rx);
        tx
    }

    pub fn fail_next(&self, error: TransportError) {
        self.failures.lock().push_back(error);
    }

    /// Serverseite der `index`-ten erfolgreichen Verbindung
    pub fn remote(&self, index: usize) -> FakeRemote {
        self.remotes.lock()[index].clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Link, TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        self.endpoints.lock().push(endpoint.clone());

        let hold = self.holds.lock().pop_front();
        if let Some(hold) = hold {
            let _ = hold.await;
        }

        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let (out_tx, out_rx) = fmpsc::unbounded::<String>();
        let (in_tx, in_rx) = fmpsc::unbounded::<Result<Frame, TransportError>>();

        self.remotes.lock().push(FakeRemote {
            inner: Arc::new(RemoteInner {
                inbound: in_tx,
                outbound: Mutex::new(out_rx),
                sent: Mutex::new(Vec::new()),
                closed_by_client: AtomicBool::new(false),
            }),
        });

        Ok(Link {
            sink: Box::pin(out_tx.sink_map_err(|e| TransportError::SendFailed(e.to_string()))),
            stream: Box::pin(in_rx),
        })
    }
}

// ============================================================================
// FAKE MICROPHONE
// ============================================================================

#[derive(Default)]
pub struct FakeMicrophone {
    acquisitions: AtomicUsize,
    denials: Mutex<VecDeque<MediaAcquisitionError>>,
    holds: Mutex<VecDeque<oneshot::Receiver<()>>>,
    captures: Mutex<Vec<MediaStream>>,
}

impl FakeMicrophone {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn deny_next(&self, error: MediaAcquisitionError) {
        self.denials.lock().push_back(error);
    }

    pub fn hold_next_capture(&self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.holds.lock().push_back(rx);
        tx
    }

    /// Kein jemals gelieferter Stream läuft noch
    pub fn all_captures_stopped(&self) -> bool {
        self.captures.lock().iter().all(|stream| !stream.is_active())
    }
}

#[async_trait]
impl MediaCapability for FakeMicrophone {
    async fn capture_audio(&self) -> Result<MediaStream, MediaAcquisitionError> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);

        let hold = self.holds.lock().pop_front();
        if let Some(hold) = hold {
            let _ = hold.await;
        }

        if let Some(error) = self.denials.lock().pop_front() {
            return Err(error);
        }

        let stream = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio)]);
        self.captures.lock().push(stream.clone());
        Ok(stream)
    }
}

// ============================================================================
// FAKE PEER ENGINE
// ============================================================================

struct FakePeer {
    role: PeerRole,
    call_id: CallId,
    sink: PeerEventSink,
    delivered: Arc<Mutex<Vec<Value>>>,
    closed: Arc<AtomicBool>,
}

/// Zeichnet Instanzen und zugestellte Payloads auf
#[derive(Default)]
pub struct FakePeerEngine {
    peers: Mutex<Vec<FakePeer>>,
    failures: Mutex<VecDeque<NegotiationError>>,
}

impl FakePeerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, error: NegotiationError) {
        self.failures.lock().push_back(error);
    }

    /// Anzahl erfolgreich geöffneter Instanzen
    pub fn opened(&self) -> usize {
        self.peers.lock().len()
    }

    pub fn live_count(&self) -> usize {
        self.peers
            .lock()
            .iter()
            .filter(|peer| !peer.closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn delivered(&self, index: usize) -> Vec<Value> {
        self.peers
            .lock()
            .get(index)
            .map(|peer| peer.delivered.lock().clone())
            .unwrap_or_default()
    }

    pub fn role(&self, index: usize) -> Option<PeerRole> {
        self.peers.lock().get(index).map(|peer| peer.role)
    }

    pub fn call_id(&self, index: usize) -> Option<CallId> {
        self.peers.lock().get(index).map(|peer| peer.call_id.clone())
    }

    pub fn sink(&self, index: usize) -> Option<PeerEventSink> {
        self.peers.lock().get(index).map(|peer| peer.sink.clone())
    }

    pub fn is_closed(&self, index: usize) -> bool {
        self.peers
            .lock()
            .get(index)
            .is_some_and(|peer| peer.closed.load(Ordering::SeqCst))
    }
}

struct FakeConnection {
    delivered: Arc<Mutex<Vec<Value>>>,
    closed: Arc<AtomicBool>,
}

impl PeerConnection for FakeConnection {
    fn deliver(&self, data: Value) -> Result<(), NegotiationError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(NegotiationError::Closed);
        }
        self.delivered.lock().push(data);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerEngine for FakePeerEngine {
    async fn open(
        &self,
        setup: PeerSetup,
        events: PeerEventSink,
    ) -> Result<Box<dyn PeerConnection>, NegotiationError> {
        if let Some(error) = self.failures.lock().pop_front() {
            return Err(error);
        }

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let closed = Arc::new(AtomicBool::new(false));
        self.peers.lock().push(FakePeer {
            role: setup.role,
            call_id: setup.call_id,
            sink: events,
            delivered: Arc::clone(&delivered),
            closed: Arc::clone(&closed),
        });

        Ok(Box::new(FakeConnection { delivered, closed }))
    }
}
