//! Call Session Controller - die Zustandsmaschine
//!
//! Besitzt Call State, Wahlnummer und Signal-Puffer und orchestriert
//! SignalChannel, MediaSession und PeerNegotiator. Alle Übergänge laufen
//! über `&mut self` auf einem einzigen Task; Nebenläufigkeit entsteht nur
//! an den drei Wartepunkten (Connect, Mikrofon, Peer-Erstellung).

use super::buffer::PendingSignalBuffer;
use super::state::{CallSession, CallSnapshot, CallState};
use crate::config::CoordinatorConfig;
use crate::event_log::EventLog;
use crate::media::{
    CpalCapture, MediaAcquisitionError, MediaCapability, MediaSession, MediaStream,
};
use crate::peer::{
    NegotiationError, PeerEngine, PeerEvent, PeerNegotiator, PeerNotice, PeerRole, WebRtcEngine,
};
use crate::signaling::{
    CallId, ChannelEvent, Connector, InboundEvent, OutboundEvent, SignalChannel, TransportError,
    WsConnector,
};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Umgebungsvariable für `EnvToken`
pub const TOKEN_ENV_VAR: &str = "SIGNALING_TOKEN";

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("Signaling is not connected")]
    NotConnected,

    #[error("Enter a number to dial")]
    EmptyNumber,

    #[error("Not possible while the call is {0}")]
    InvalidState(CallState),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Media(#[from] MediaAcquisitionError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

// ============================================================================
// COLLABORATORS
// ============================================================================

/// Liefert das Bearer-Token für den Signaling-Handshake
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// `None` bricht den Connect ab
    async fn token(&self) -> Option<String>;
}

/// Festes Token, z.B. von der Kommandozeile
#[derive(Debug, Clone, Default)]
pub struct StaticToken(Option<String>);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn none() -> Self {
        Self(None)
    }
}

#[async_trait]
impl TokenProvider for StaticToken {
    async fn token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// Liest das Token bei jedem Connect aus der Umgebung
#[derive(Debug, Clone)]
pub struct EnvToken {
    var: String,
}

impl EnvToken {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvToken {
    fn default() -> Self {
        Self::new(TOKEN_ENV_VAR)
    }
}

#[async_trait]
impl TokenProvider for EnvToken {
    async fn token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .filter(|token| !token.trim().is_empty())
    }
}

/// Externe Fähigkeiten, die der Controller injiziert bekommt
#[derive(Clone)]
pub struct Collaborators {
    pub connector: Arc<dyn Connector>,
    pub microphone: Arc<dyn MediaCapability>,
    pub peers: Arc<dyn PeerEngine>,
    pub tokens: Arc<dyn TokenProvider>,
}

impl Collaborators {
    /// WebSocket, cpal und WebRTC
    pub fn production(config: &CoordinatorConfig, tokens: Arc<dyn TokenProvider>) -> Self {
        Self {
            connector: Arc::new(WsConnector),
            microphone: Arc::new(CpalCapture::new()),
            peers: Arc::new(WebRtcEngine::new(&config.ice_servers)),
            tokens,
        }
    }
}

/// Absichten der UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserIntent {
    ConnectSignaling,
    DisconnectSignaling,
    SetDialNumber(String),
    /// Wählt die angegebene oder die gespeicherte Nummer
    Dial(Option<String>),
    Answer,
    Hangup,
    SetMuted(bool),
    Dismiss,
    Quit,
}

// ============================================================================
// CONTROLLER
// ============================================================================

pub struct CallSessionController {
    config: CoordinatorConfig,
    session: CallSession,
    channel: SignalChannel,
    channel_events: mpsc::UnboundedReceiver<ChannelEvent>,
    media: MediaSession,
    negotiator: PeerNegotiator,
    peer_notices: mpsc::UnboundedReceiver<PeerNotice>,
    pending: PendingSignalBuffer,
    log: EventLog,
    tokens: Arc<dyn TokenProvider>,
    /// Ablaufzeit des Watchdogs für `connecting`/`ringing`
    deadline: Option<Instant>,
    snapshots: watch::Sender<CallSnapshot>,
}

impl CallSessionController {
    pub fn new(config: CoordinatorConfig, collaborators: Collaborators) -> Self {
        let (channel, channel_events) =
            SignalChannel::new(collaborators.connector, config.signaling_url.clone());
        let (negotiator, peer_notices) = PeerNegotiator::new(collaborators.peers);
        let media = MediaSession::new(collaborators.microphone, config.media_timeout);
        let log = EventLog::with_capacity(config.event_log_capacity);
        let (snapshots, _) = watch::channel(CallSnapshot::default());

        let controller = Self {
            config,
            session: CallSession::default(),
            channel,
            channel_events,
            media,
            negotiator,
            peer_notices,
            pending: PendingSignalBuffer::new(),
            log,
            tokens: collaborators.tokens,
            deadline: None,
            snapshots,
        };
        controller.publish();
        controller
    }

    /// Empfänger für Snapshots nach jedem Übergang
    pub fn subscribe(&self) -> watch::Receiver<CallSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> CallSnapshot {
        CallSnapshot::capture(
            &self.session,
            self.channel.status(),
            self.media.is_muted(),
            &self.log,
        )
    }

    pub fn call_state(&self) -> CallState {
        self.session.state
    }

    pub fn session(&self) -> &CallSession {
        &self.session
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    pub fn local_stream(&self) -> Option<MediaStream> {
        self.media.local_stream()
    }

    pub fn remote_stream(&self) -> Option<MediaStream> {
        self.media.remote_stream()
    }

    pub fn pending_signals(&self) -> usize {
        self.pending.len()
    }

    pub fn has_live_peer(&self) -> bool {
        self.negotiator.is_live()
    }

    /// Nächster Watchdog-Ablauf, falls scharf
    pub fn watchdog_deadline(&self) -> Option<Instant> {
        self.deadline
    }

    // ========================================================================
    // SIGNALING
    // ========================================================================

    /// Verbindet den SignalChannel mit dem Token des Auth-Providers
    pub async fn connect_signaling(&mut self) -> Result<(), CallError> {
        if self.channel.is_connected() {
            return Ok(());
        }

        let Some(token) = self.tokens.token().await else {
            let err = TransportError::MissingCredential;
            self.status(format!("Cannot connect: {}", err));
            self.publish();
            return Err(err.into());
        };

        self.log.append("Connecting to signaling server...");
        self.publish();

        match self.channel.connect(&token).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.status(format!("Signaling connect failed: {}", e));
                self.publish();
                Err(e.into())
            }
        }
    }

    /// Trennt den SignalChannel. Idempotent.
    pub fn disconnect_signaling(&mut self) {
        if !self.channel.is_connected() {
            tracing::debug!("Signaling already disconnected");
            return;
        }
        self.channel.disconnect();
        self.publish();
    }

    // ========================================================================
    // USER INTENTS
    // ========================================================================

    /// Setzt die Wahlnummer, solange kein Anruf läuft
    pub fn set_dial_number(&mut self, number: impl Into<String>) -> Result<(), CallError> {
        if !self.session.state.can_dial() {
            let state = self.session.state;
            self.reject(format!("Cannot change the number while call is {}", state));
            return Err(CallError::InvalidState(state));
        }
        self.session.dial_number = number.into();
        self.publish();
        Ok(())
    }

    /// Startet einen ausgehenden Anruf an die gespeicherte Wahlnummer
    pub async fn dial(&mut self) -> Result<CallId, CallError> {
        let number = self.session.dial_number.trim().to_string();

        if !self.channel.is_connected() {
            self.reject("Cannot dial: signaling is not connected");
            return Err(CallError::NotConnected);
        }
        if number.is_empty() {
            self.reject("Cannot dial: enter a number first");
            return Err(CallError::EmptyNumber);
        }
        if !self.session.state.can_dial() {
            let state = self.session.state;
            self.reject(format!("Cannot dial while call is {}", state));
            return Err(CallError::InvalidState(state));
        }

        let call_id = CallId::generate();
        self.session.begin_outgoing(call_id.clone());
        self.status(format!("Calling {}...", number));
        self.arm_watchdog(self.config.setup_timeout);
        self.publish();

        if let Err(e) = self.start_peer(PeerRole::Initiator, &call_id).await {
            self.fail_call(format!("Call failed: {}", e));
            return Err(e);
        }

        let initiate = OutboundEvent::CallInitiate {
            call_id: call_id.clone(),
            to: number,
        };
        if let Err(e) = self.channel.send(&initiate) {
            self.fail_call(format!("Call failed: {}", e));
            return Err(e.into());
        }

        tracing::info!("Outgoing call {} started", call_id);
        self.publish();
        Ok(call_id)
    }

    /// Nimmt den klingelnden eingehenden Anruf an
    pub async fn answer(&mut self) -> Result<(), CallError> {
        let call_id = match (&self.session.call_id, self.session.state) {
            (Some(call_id), CallState::Ringing) if self.session.is_incoming() => call_id.clone(),
            _ => {
                let state = self.session.state;
                self.reject("No incoming call to answer");
                return Err(CallError::InvalidState(state));
            }
        };
        if self.negotiator.is_live() {
            let state = self.session.state;
            self.reject("Call is already being answered");
            return Err(CallError::InvalidState(state));
        }

        self.session.state = CallState::Connecting;
        self.status("Answering call...");
        self.arm_watchdog(self.config.setup_timeout);
        self.publish();

        if let Err(e) = self.start_peer(PeerRole::Answerer, &call_id).await {
            self.fail_call(format!("Answer failed: {}", e));
            return Err(e);
        }

        if let Err(e) = self.channel.send(&OutboundEvent::CallAnswer {
            call_id: call_id.clone(),
        }) {
            self.fail_call(format!("Answer failed: {}", e));
            return Err(e.into());
        }

        tracing::info!("Answered call {}", call_id);
        self.publish();
        Ok(())
    }

    /// Beendet den laufenden Anruf
    ///
    /// Ohne laufenden Anruf passiert nichts. Media und Peer werden auch dann
    /// freigegeben, wenn `call.ended` nicht gesendet werden kann.
    pub fn hangup(&mut self) {
        if !self.session.state.is_active() {
            tracing::debug!("Hangup ignored in state {}", self.session.state);
            return;
        }

        if let Some(call_id) = self.session.call_id.clone() {
            if let Err(e) = self.channel.send(&OutboundEvent::CallEnded { call_id }) {
                tracing::warn!("Could not notify server about hangup: {}", e);
                self.log.append(format!("Hangup not delivered: {}", e));
            }
        }

        self.teardown();
        self.session.end();
        self.disarm_watchdog();
        self.status("Call ended");
        self.publish();
    }

    pub fn set_muted(&mut self, muted: bool) {
        if self.media.is_muted() == muted {
            return;
        }
        self.media.set_muted(muted);
        self.log
            .append(if muted { "Microphone muted" } else { "Microphone unmuted" });
        self.publish();
    }

    /// Bestätigt `ended`/`error` und kehrt nach `idle` zurück
    pub fn dismiss(&mut self) {
        if !self.session.state.is_terminal() {
            return;
        }
        self.session.reset();
        self.publish();
    }

    /// Führt eine UI-Absicht aus. Fehler landen bereits im Event Log.
    pub async fn handle_intent(&mut self, intent: UserIntent) {
        let result = match intent {
            UserIntent::ConnectSignaling => self.connect_signaling().await,
            UserIntent::DisconnectSignaling => {
                self.disconnect_signaling();
                Ok(())
            }
            UserIntent::SetDialNumber(number) => self.set_dial_number(number),
            UserIntent::Dial(number) => {
                let set = match number {
                    Some(number) => self.set_dial_number(number),
                    None => Ok(()),
                };
                match set {
                    Ok(()) => self.dial().await.map(|_| ()),
                    Err(e) => Err(e),
                }
            }
            UserIntent::Answer => self.answer().await,
            UserIntent::Hangup => {
                self.hangup();
                Ok(())
            }
            UserIntent::SetMuted(muted) => {
                self.set_muted(muted);
                Ok(())
            }
            UserIntent::Dismiss => {
                self.dismiss();
                Ok(())
            }
            UserIntent::Quit => Ok(()),
        };

        if let Err(e) = result {
            tracing::debug!("Intent rejected: {}", e);
        }
    }

    // ========================================================================
    // INBOUND EVENTS
    // ========================================================================

    pub fn handle_channel_event(&mut self, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                self.status("Signaling connected");
            }
            ChannelEvent::Close => {
                // Ein laufender Anruf bleibt bestehen, nur Signaling fehlt
                self.status("Signaling disconnected");
            }
            ChannelEvent::Error(message) => {
                self.status(format!("Signaling error: {}", message));
            }
            ChannelEvent::Malformed(reason) => {
                self.log
                    .append(format!("Dropped malformed signaling message: {}", reason));
            }
            ChannelEvent::Event(event) => self.handle_inbound(event),
        }
        self.publish();
    }

    fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::CallIncoming { call_id, from } => {
                if self.session.state.is_active() || self.negotiator.is_live() {
                    self.log.append("Replacing current call with incoming call");
                    self.teardown();
                }

                let call_id = call_id.unwrap_or_else(CallId::generate);
                let caller = from.clone().unwrap_or_else(|| "unknown".to_string());
                self.session.begin_incoming(call_id, from);
                self.status(format!("Incoming call from {}", caller));
                self.arm_watchdog(self.config.ring_timeout);
            }
            InboundEvent::CallRinging { .. } => {
                // Nur die Gegenseite eines ausgehenden Anrufs klingelt
                if self.session.state == CallState::Connecting
                    && !self.session.is_incoming()
                {
                    self.session.state = CallState::Ringing;
                    self.status("Ringing...");
                    self.arm_watchdog(self.config.ring_timeout);
                } else {
                    tracing::debug!("Ignoring call.ringing in state {}", self.session.state);
                }
            }
            InboundEvent::CallConnected { .. } => {
                self.session.state = CallState::InCall;
                self.disarm_watchdog();
                self.status("Call connected");
            }
            InboundEvent::CallEnded { .. } => {
                self.teardown();
                self.session.end();
                self.disarm_watchdog();
                self.status("Call ended by remote party");
            }
            InboundEvent::CallError { message, .. } => {
                let message = message.unwrap_or_else(|| "Call failed".to_string());
                self.fail_call(message);
            }
            InboundEvent::Signal { call_id, data } => self.handle_signal(call_id, data),
            InboundEvent::Presence { message } => {
                self.log.append(format!(
                    "Presence: {}",
                    message.as_deref().unwrap_or("update")
                ));
            }
            InboundEvent::Unknown { kind } => {
                tracing::warn!("Unknown signaling event: {}", kind);
                self.log.append(format!("Ignored unknown event '{}'", kind));
            }
        }
    }

    /// Zustellen oder puffern, je nachdem ob ein Peer lebt
    fn handle_signal(&mut self, call_id: Option<CallId>, data: Value) {
        if let (Some(incoming), Some(active)) = (&call_id, &self.session.call_id) {
            if incoming != active {
                tracing::warn!("Dropping signal for call {} (active: {})", incoming, active);
                self.log
                    .append(format!("Dropped signal for other call {}", incoming));
                return;
            }
        }

        match self.negotiator.current_id() {
            Some(peer) => {
                if let Err(e) = self.negotiator.deliver(peer, data) {
                    tracing::warn!("Failed to deliver signal: {}", e);
                    self.log.append(format!("Signal not delivered: {}", e));
                }
            }
            None => {
                self.pending.push(call_id, data);
                tracing::debug!("Buffered signal ({} pending)", self.pending.len());
            }
        }
    }

    pub fn handle_peer_notice(&mut self, notice: PeerNotice) {
        if !self.negotiator.is_current(&notice) {
            tracing::debug!("Dropping notice from stale {}", notice.peer);
            return;
        }

        match notice.event {
            PeerEvent::Signal(data) => {
                let Some(call_id) = self.negotiator.current_call_id().cloned() else {
                    return;
                };
                if let Err(e) = self.channel.send(&OutboundEvent::Signal { call_id, data }) {
                    tracing::warn!("Failed to send signal: {}", e);
                    self.log.append(format!("Signal not sent: {}", e));
                }
            }
            PeerEvent::RemoteStream(stream) => {
                self.media.attach_remote(stream);
                self.log.append("Remote audio received");
            }
            PeerEvent::Connected => {
                self.session.state = CallState::InCall;
                self.disarm_watchdog();
                self.status("Peer connected");
            }
            PeerEvent::Error(message) => {
                self.fail_call(format!("Peer error: {}", message));
            }
        }
        self.publish();
    }

    /// Watchdog für hängende `connecting`/`ringing` Zustände
    pub fn on_watchdog_elapsed(&mut self) {
        self.deadline = None;

        let message = match self.session.state {
            CallState::Connecting => "Call setup timed out",
            CallState::Ringing => "Call was not answered in time",
            state => {
                tracing::debug!("Watchdog elapsed in state {}", state);
                return;
            }
        };

        if let Some(call_id) = self.session.call_id.clone() {
            if let Err(e) = self.channel.send(&OutboundEvent::CallEnded { call_id }) {
                tracing::debug!("Timeout hangup not delivered: {}", e);
            }
        }
        self.fail_call(message);
        self.publish();
    }

    // ========================================================================
    // EVENT LOOP
    // ========================================================================

    /// Verarbeitet alle bereits eingetroffenen Events ohne zu warten
    pub fn process_pending(&mut self) -> usize {
        let mut handled = 0;
        loop {
            if let Ok(event) = self.channel_events.try_recv() {
                self.handle_channel_event(event);
            } else if let Ok(notice) = self.peer_notices.try_recv() {
                self.handle_peer_notice(notice);
            } else {
                break;
            }
            handled += 1;
        }
        if self.deadline.is_some_and(|deadline| deadline <= Instant::now()) {
            self.on_watchdog_elapsed();
            handled += 1;
        }
        handled
    }

    /// Event-Loop bis `Quit` oder bis alle Intent-Sender weg sind
    pub async fn run(mut self, mut intents: mpsc::Receiver<UserIntent>) {
        tracing::info!("Call session controller started");

        loop {
            let deadline = self.deadline;
            tokio::select! {
                intent = intents.recv() => match intent {
                    Some(UserIntent::Quit) | None => break,
                    Some(intent) => self.handle_intent(intent).await,
                },
                Some(event) = self.channel_events.recv() => self.handle_channel_event(event),
                Some(notice) = self.peer_notices.recv() => self.handle_peer_notice(notice),
                _ = watchdog(deadline) => self.on_watchdog_elapsed(),
            }
        }

        self.shutdown();
        tracing::info!("Call session controller stopped");
    }

    /// Legt auf und trennt das Signaling
    pub fn shutdown(&mut self) {
        self.hangup();
        self.teardown();
        self.channel.disconnect();
        self.publish();
    }

    // ========================================================================
    // PRIVATE METHODS
    // ========================================================================

    /// Mikrofon, Peer und Puffer-Replay für einen Anrufversuch
    async fn start_peer(&mut self, role: PeerRole, call_id: &CallId) -> Result<(), CallError> {
        let local = self.media.ensure_local_stream().await?;
        let peer = self.negotiator.create(role, call_id.clone(), &local).await?;

        let (buffered, discarded) = self.pending.drain_for(call_id);
        if discarded > 0 {
            self.log
                .append(format!("Discarded {} signals for other calls", discarded));
        }
        if !buffered.is_empty() {
            self.log
                .append(format!("Replaying {} buffered signals", buffered.len()));
        }
        for data in buffered {
            self.negotiator.deliver(peer, data)?;
        }
        Ok(())
    }

    /// Fehlerzustand mit vollständiger Freigabe
    fn fail_call(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.teardown();
        self.disarm_watchdog();
        self.session.fail(message.clone());
        self.log.append(message);
    }

    /// Peer zerstören, Media freigeben, Puffer leeren
    fn teardown(&mut self) {
        self.negotiator.destroy();
        self.media.release();
        let dropped = self.pending.clear();
        if dropped > 0 {
            tracing::debug!("Cleared {} pending signals", dropped);
        }
    }

    /// Abgelehnte Absicht: nur Statusmeldung, kein Zustandswechsel
    fn reject(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.status(message);
        self.publish();
    }

    fn status(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.session.status_message = message.clone();
        self.log.append(message);
    }

    fn arm_watchdog(&mut self, timeout: Option<Duration>) {
        self.deadline = timeout.map(|timeout| Instant::now() + timeout);
    }

    fn disarm_watchdog(&mut self) {
        self.deadline = None;
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.snapshot());
    }
}

async fn watchdog(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

impl std::fmt::Debug for CallSessionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSessionController")
            .field("session", &self.session)
            .field("channel", &self.channel)
            .field("negotiator", &self.negotiator)
            .field("pending", &self.pending.len())
            .finish()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{MediaTrack, TrackKind};
    use crate::testing::{settle, FakeConnector, FakeMicrophone, FakePeerEngine, FakeRemote};
    use serde_json::json;
    use url::Url;

    struct Harness {
        controller: CallSessionController,
        connector: Arc<FakeConnector>,
        mic: Arc<FakeMicrophone>,
        peers: Arc<FakePeerEngine>,
    }

    impl Harness {
        fn with_config(config: CoordinatorConfig) -> Self {
            let connector = Arc::new(FakeConnector::new());
            let mic = Arc::new(FakeMicrophone::new());
            let peers = Arc::new(FakePeerEngine::new());
            let controller = CallSessionController::new(
                config,
                Collaborators {
                    connector: Arc::clone(&connector) as Arc<dyn Connector>,
                    microphone: Arc::clone(&mic) as Arc<dyn MediaCapability>,
                    peers: Arc::clone(&peers) as Arc<dyn PeerEngine>,
                    tokens: Arc::new(StaticToken::new("token")),
                },
            );
            Self {
                controller,
                connector,
                mic,
                peers,
            }
        }

        fn new() -> Self {
            Self::with_config(test_config())
        }

        async fn connected() -> Self {
            let mut harness = Self::new();
            harness.controller.connect_signaling().await.unwrap();
            harness.pump().await;
            harness
        }

        fn remote(&self) -> FakeRemote {
            self.connector.remote(0)
        }

        /// Lässt Transport-Tasks laufen und verarbeitet deren Events
        async fn pump(&mut self) {
            settle().await;
            self.controller.process_pending();
        }

        async fn receive(&mut self, event: Value) {
            self.remote().push_json(event);
            self.pump().await;
        }

        async fn dial(&mut self, number: &str) -> Result<CallId, CallError> {
            self.controller.set_dial_number(number)?;
            self.controller.dial().await
        }

        fn state(&self) -> CallState {
            self.controller.call_state()
        }

        fn assert_media_released(&self) {
            assert!(self.controller.local_stream().is_none());
            assert!(self.controller.remote_stream().is_none());
            assert!(self.mic.all_captures_stopped());
        }
    }

    fn test_config() -> CoordinatorConfig {
        CoordinatorConfig {
            media_timeout: Duration::from_millis(200),
            ..CoordinatorConfig::with_signaling_url(Url::parse("ws://signal.test").unwrap())
        }
    }

    // ------------------------------------------------------------------------
    // Scenarios
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_outgoing_call_reaches_in_call() {
        let mut h = Harness::connected().await;

        let call_id = h.dial("1555").await.unwrap();
        assert_eq!(h.state(), CallState::Connecting);

        h.receive(json!({"type": "call.ringing"})).await;
        assert_eq!(h.state(), CallState::Ringing);

        h.receive(json!({"type": "call.connected"})).await;
        assert_eq!(h.state(), CallState::InCall);
        assert_eq!(h.controller.session().call_id, Some(call_id.clone()));
        assert_eq!(h.controller.session().dial_number, "1555");

        let sent = h.remote().sent().await;
        assert_eq!(
            sent[0],
            json!({"type": "call.initiate", "callId": call_id.as_str(), "to": "1555"})
        );
        assert_eq!(h.peers.role(0), Some(PeerRole::Initiator));
    }

    #[tokio::test]
    async fn test_incoming_call_can_be_answered() {
        let mut h = Harness::connected().await;

        h.receive(json!({"type": "call.incoming", "callId": "in-1", "from": "+1201"}))
            .await;
        assert_eq!(h.state(), CallState::Ringing);
        assert_eq!(
            h.controller.session().incoming_number.as_deref(),
            Some("+1201")
        );

        h.controller.answer().await.unwrap();

        assert_eq!(h.state(), CallState::Connecting);
        assert_eq!(
            h.remote().sent().await,
            vec![json!({"type": "call.answer", "callId": "in-1"})]
        );
        assert_eq!(h.peers.role(0), Some(PeerRole::Answerer));
        assert_eq!(h.peers.call_id(0), Some(CallId::new("in-1")));
    }

    #[tokio::test]
    async fn test_incoming_call_without_id_gets_generated_id() {
        let mut h = Harness::connected().await;

        h.receive(json!({"type": "call.incoming"})).await;

        assert_eq!(h.state(), CallState::Ringing);
        assert!(h.controller.session().call_id.is_some());
        assert!(h.controller.session().incoming_number.is_none());
    }

    #[tokio::test]
    async fn test_buffered_signals_replay_before_live_ones() {
        let mut h = Harness::connected().await;

        for n in 1..=3 {
            h.receive(json!({"type": "signal", "data": {"seq": n}})).await;
        }
        assert_eq!(h.controller.pending_signals(), 3);
        assert!(!h.controller.has_live_peer());

        h.dial("1555").await.unwrap();
        h.receive(json!({"type": "signal", "data": {"seq": 4}})).await;

        assert_eq!(
            h.peers.delivered(0),
            vec![
                json!({"seq": 1}),
                json!({"seq": 2}),
                json!({"seq": 3}),
                json!({"seq": 4})
            ]
        );
        assert_eq!(h.controller.pending_signals(), 0);
    }

    #[tokio::test]
    async fn test_dial_with_empty_number_is_rejected() {
        let mut h = Harness::connected().await;
        let log_before = h.controller.event_log().len();

        let err = h.dial("   ").await.unwrap_err();

        assert_eq!(err, CallError::EmptyNumber);
        assert_eq!(h.state(), CallState::Idle);
        assert!(h.remote().sent().await.is_empty());
        assert_eq!(h.controller.event_log().len(), log_before + 1);
        assert_eq!(h.mic.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_dial_requires_signaling() {
        let mut h = Harness::new();

        let err = h.dial("1555").await.unwrap_err();

        assert_eq!(err, CallError::NotConnected);
        assert_eq!(h.state(), CallState::Idle);
        assert_eq!(h.peers.opened(), 0);
    }

    // ------------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_never_two_live_peers() {
        let mut h = Harness::connected().await;

        h.dial("1").await.unwrap();
        assert!(h.dial("2").await.is_err());
        h.controller.hangup();
        h.dial("3").await.unwrap();
        h.receive(json!({"type": "call.incoming", "callId": "in-9", "from": "+49"}))
            .await;
        h.controller.answer().await.unwrap();

        assert_eq!(h.peers.opened(), 3);
        assert_eq!(h.peers.live_count(), 1);
    }

    #[tokio::test]
    async fn test_hangup_is_idempotent() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();

        h.controller.hangup();
        let log_len = h.controller.event_log().len();
        let snapshot = h.controller.snapshot();
        h.controller.hangup();

        assert_eq!(h.state(), CallState::Ended);
        assert_eq!(h.controller.event_log().len(), log_len);
        assert_eq!(h.controller.snapshot(), snapshot);
        assert_eq!(h.remote().sent_types().await, vec!["call.initiate", "call.ended"]);
        assert!(h.controller.session().call_id.is_none());
        h.assert_media_released();
    }

    #[tokio::test]
    async fn test_hangup_releases_media_even_if_send_fails() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();

        h.remote().close();
        h.pump().await;
        assert_eq!(h.state(), CallState::Connecting);

        h.controller.hangup();

        assert_eq!(h.state(), CallState::Ended);
        assert!(!h.controller.has_live_peer());
        h.assert_media_released();
    }

    #[tokio::test]
    async fn test_disconnect_when_disconnected_is_noop() {
        let mut h = Harness::connected().await;

        h.controller.disconnect_signaling();
        h.pump().await;
        let log_len = h.controller.event_log().len();
        h.controller.disconnect_signaling();
        h.pump().await;

        assert_eq!(h.controller.event_log().len(), log_len);
        assert_eq!(
            h.controller.snapshot().connection,
            crate::signaling::ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_remote_end_releases_everything() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();
        let sink = h.peers.sink(0).unwrap();
        sink.remote_stream(MediaStream::new(vec![MediaTrack::new(TrackKind::Audio)]));
        h.pump().await;
        let remote = h.controller.remote_stream().unwrap();

        h.receive(json!({"type": "call.ended"})).await;

        assert_eq!(h.state(), CallState::Ended);
        assert!(!remote.is_active());
        assert!(h.peers.is_closed(0));
        h.assert_media_released();
    }

    #[tokio::test]
    async fn test_remote_error_sets_message_and_cleans_up() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();

        h.receive(json!({"type": "call.error", "message": "busy"})).await;

        assert_eq!(h.state(), CallState::Error);
        assert_eq!(h.controller.session().last_error.as_deref(), Some("busy"));
        assert!(h.peers.is_closed(0));
        h.assert_media_released();
    }

    #[tokio::test]
    async fn test_microphone_denial_ends_in_error_without_peer() {
        let mut h = Harness::connected().await;
        h.mic
            .deny_next(MediaAcquisitionError::PermissionDenied("blocked".into()));

        let err = h.dial("1555").await.unwrap_err();

        assert!(matches!(err, CallError::Media(_)));
        assert_eq!(h.state(), CallState::Error);
        assert_eq!(h.peers.opened(), 0);
        assert!(h.remote().sent().await.is_empty());
        h.assert_media_released();
    }

    #[tokio::test]
    async fn test_peer_engine_failure_releases_microphone() {
        let mut h = Harness::connected().await;
        h.peers.fail_next(NegotiationError::Engine("no codecs".into()));

        h.dial("1555").await.unwrap_err();

        assert_eq!(h.state(), CallState::Error);
        assert_eq!(h.mic.acquisitions(), 1);
        h.assert_media_released();
    }

    #[tokio::test]
    async fn test_peer_events_drive_state() {
        let mut h = Harness::connected().await;
        let call_id = h.dial("1555").await.unwrap();
        let sink = h.peers.sink(0).unwrap();

        sink.signal(json!({"type": "offer", "sdp": "v=0"}));
        sink.connected();
        h.pump().await;

        assert_eq!(h.state(), CallState::InCall);
        assert_eq!(h.controller.watchdog_deadline(), None);
        let sent = h.remote().sent().await;
        assert_eq!(
            sent[1],
            json!({
                "type": "signal",
                "callId": call_id.as_str(),
                "data": {"type": "offer", "sdp": "v=0"}
            })
        );

        sink.failed("ice failed");
        h.pump().await;
        assert_eq!(h.state(), CallState::Error);
        assert_eq!(
            h.controller.session().last_error.as_deref(),
            Some("Peer error: ice failed")
        );
        h.assert_media_released();
    }

    #[tokio::test]
    async fn test_notices_from_destroyed_peer_are_ignored() {
        let mut h = Harness::connected().await;
        h.dial("1").await.unwrap();
        let stale = h.peers.sink(0).unwrap();
        h.controller.hangup();
        h.dial("2").await.unwrap();

        // Sink ist abgekoppelt, selbst ein direkt gesendetes Event bleibt folgenlos
        assert!(!stale.connected());
        h.pump().await;
        assert_eq!(h.state(), CallState::Connecting);
    }

    #[tokio::test]
    async fn test_signal_for_other_call_is_dropped() {
        let mut h = Harness::connected().await;
        let call_id = h.dial("1555").await.unwrap();

        h.receive(json!({"type": "signal", "callId": "someone-else", "data": {"n": 1}}))
            .await;
        h.receive(json!({"type": "signal", "callId": call_id.as_str(), "data": {"n": 2}}))
            .await;
        h.receive(json!({"type": "signal", "data": {"n": 3}})).await;

        assert_eq!(h.peers.delivered(0), vec![json!({"n": 2}), json!({"n": 3})]);
    }

    #[tokio::test]
    async fn test_buffered_signals_for_other_calls_are_discarded_on_flush() {
        let mut h = Harness::connected().await;
        h.receive(json!({"type": "signal", "callId": "stale", "data": {"n": 0}}))
            .await;
        h.receive(json!({"type": "signal", "callId": "in-1", "data": {"n": 1}}))
            .await;
        h.receive(json!({"type": "call.incoming", "callId": "in-1", "from": "+1201"}))
            .await;
        assert_eq!(h.controller.pending_signals(), 2);

        h.controller.answer().await.unwrap();

        assert_eq!(h.peers.delivered(0), vec![json!({"n": 1})]);
        assert_eq!(h.controller.pending_signals(), 0);
    }

    #[tokio::test]
    async fn test_answer_requires_incoming_call() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();
        h.receive(json!({"type": "call.ringing"})).await;

        let err = h.controller.answer().await.unwrap_err();

        assert_eq!(err, CallError::InvalidState(CallState::Ringing));
        assert_eq!(h.state(), CallState::Ringing);
    }

    #[tokio::test]
    async fn test_ringing_after_answer_keeps_call_alive() {
        let mut h = Harness::connected().await;
        h.receive(json!({"type": "call.incoming", "callId": "in-1", "from": "+1201"}))
            .await;
        h.controller.answer().await.unwrap();

        h.receive(json!({"type": "call.ringing", "callId": "in-1"}))
            .await;
        assert_eq!(h.state(), CallState::Connecting);

        let err = h.controller.answer().await.unwrap_err();

        assert_eq!(err, CallError::InvalidState(CallState::Connecting));
        assert_eq!(h.state(), CallState::Connecting);
        assert!(h.controller.session().last_error.is_none());
        assert_eq!(h.peers.opened(), 1);
        assert_eq!(h.peers.live_count(), 1);
        assert!(h.controller.local_stream().is_some());
        assert_eq!(h.remote().sent_types().await, vec!["call.answer"]);
    }

    #[tokio::test]
    async fn test_ringing_only_from_connecting() {
        let mut h = Harness::connected().await;

        h.receive(json!({"type": "call.ringing"})).await;

        assert_eq!(h.state(), CallState::Idle);
    }

    #[tokio::test]
    async fn test_incoming_call_replaces_active_call() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();

        h.receive(json!({"type": "call.incoming", "callId": "in-2", "from": "+33"}))
            .await;

        assert_eq!(h.state(), CallState::Ringing);
        assert!(h.peers.is_closed(0));
        assert!(!h.controller.has_live_peer());
        h.assert_media_released();
    }

    #[tokio::test]
    async fn test_channel_close_keeps_call_state() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();
        h.receive(json!({"type": "call.connected"})).await;

        h.remote().close();
        h.pump().await;

        assert_eq!(h.state(), CallState::InCall);
        assert_eq!(
            h.controller.snapshot().connection,
            crate::signaling::ConnectionStatus::Disconnected
        );
    }

    #[tokio::test]
    async fn test_malformed_frame_is_logged_only() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();

        h.remote().push_text("not json");
        h.pump().await;

        assert_eq!(h.state(), CallState::Connecting);
        let latest = h.controller.event_log().latest().unwrap();
        assert!(latest.message.starts_with("Dropped malformed"));
    }

    #[tokio::test]
    async fn test_missing_token_aborts_connect() {
        let connector = Arc::new(FakeConnector::new());
        let mut controller = CallSessionController::new(
            test_config(),
            Collaborators {
                connector: Arc::clone(&connector) as Arc<dyn Connector>,
                microphone: Arc::new(FakeMicrophone::new()),
                peers: Arc::new(FakePeerEngine::new()),
                tokens: Arc::new(StaticToken::none()),
            },
        );

        let err = controller.connect_signaling().await.unwrap_err();

        assert_eq!(err, CallError::Transport(TransportError::MissingCredential));
        assert_eq!(connector.attempts(), 0);
    }

    #[tokio::test]
    async fn test_dismiss_and_redial_from_error() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();
        h.receive(json!({"type": "call.error"})).await;
        assert_eq!(h.state(), CallState::Error);

        h.controller.dismiss();
        assert_eq!(h.state(), CallState::Idle);
        assert!(h.controller.session().last_error.is_none());

        h.receive(json!({"type": "call.error"})).await;
        h.dial("1555").await.unwrap();
        assert_eq!(h.state(), CallState::Connecting);
    }

    #[tokio::test]
    async fn test_dial_number_locked_during_call() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();

        let err = h.controller.set_dial_number("999").unwrap_err();

        assert_eq!(err, CallError::InvalidState(CallState::Connecting));
        assert_eq!(h.controller.session().dial_number, "1555");
    }

    #[tokio::test]
    async fn test_dial_with_number_during_call_is_reported() {
        let mut h = Harness::connected().await;
        h.dial("1555").await.unwrap();
        let log_before = h.controller.event_log().len();

        h.controller
            .handle_intent(UserIntent::Dial(Some("999".into())))
            .await;

        assert_eq!(h.state(), CallState::Connecting);
        assert_eq!(h.controller.session().dial_number, "1555");
        assert_eq!(h.controller.event_log().len(), log_before + 1);
        assert_eq!(
            h.controller.session().status_message,
            "Cannot change the number while call is connecting"
        );
        assert_eq!(h.peers.opened(), 1);
    }

    #[tokio::test]
    async fn test_mute_survives_until_teardown() {
        let mut h = Harness::connected().await;
        h.controller.set_muted(true);
        h.dial("1555").await.unwrap();

        let local = h.controller.local_stream().unwrap();
        assert!(local.audio_tracks().all(|t| !t.is_enabled()));
        assert!(h.controller.snapshot().muted);

        h.controller.hangup();
        assert!(!h.controller.snapshot().muted);
    }

    #[tokio::test]
    async fn test_event_log_stays_bounded() {
        let mut h = Harness::connected().await;
        for n in 0..120 {
            h.receive(json!({"type": "presence", "message": format!("p{}", n)}))
                .await;
        }
        assert_eq!(h.controller.event_log().len(), 50);
        assert_eq!(
            h.controller.event_log().latest().unwrap().message,
            "Presence: p119"
        );
    }

    #[tokio::test]
    async fn test_snapshots_are_published() {
        let mut h = Harness::connected().await;
        let mut rx = h.controller.subscribe();
        rx.borrow_and_update();

        h.dial("1555").await.unwrap();

        assert!(rx.has_changed().unwrap());
        let snapshot = rx.borrow_and_update().clone();
        assert_eq!(snapshot.call_state, CallState::Connecting);
        assert_eq!(snapshot.dial_number, "1555");
    }

    // ------------------------------------------------------------------------
    // Watchdog
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_setup_watchdog_fails_stalled_call() {
        let mut h = Harness::with_config(CoordinatorConfig {
            setup_timeout: Some(Duration::from_millis(30)),
            ..test_config()
        });
        h.controller.connect_signaling().await.unwrap();
        h.pump().await;
        h.dial("1555").await.unwrap();
        assert!(h.controller.watchdog_deadline().is_some());

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.pump().await;

        assert_eq!(h.state(), CallState::Error);
        assert_eq!(
            h.controller.session().last_error.as_deref(),
            Some("Call setup timed out")
        );
        assert_eq!(h.remote().sent_types().await, vec!["call.initiate", "call.ended"]);
        h.assert_media_released();
    }

    #[tokio::test]
    async fn test_ring_watchdog_fails_unanswered_call() {
        let mut h = Harness::with_config(CoordinatorConfig {
            ring_timeout: Some(Duration::from_millis(30)),
            ..test_config()
        });
        h.controller.connect_signaling().await.unwrap();
        h.pump().await;
        h.dial("1555").await.unwrap();
        h.receive(json!({"type": "call.ringing"})).await;
        assert_eq!(h.state(), CallState::Ringing);

        tokio::time::sleep(Duration::from_millis(60)).await;
        h.pump().await;

        assert_eq!(h.state(), CallState::Error);
        assert_eq!(
            h.controller.session().last_error.as_deref(),
            Some("Call was not answered in time")
        );
        assert_eq!(h.remote().sent_types().await, vec!["call.initiate", "call.ended"]);
        assert!(h.controller.watchdog_deadline().is_none());
        assert!(!h.controller.has_live_peer());
        h.assert_media_released();
    }

    #[tokio::test]
    async fn test_ring_watchdog_disarmed_by_connect() {
        let mut h = Harness::with_config(CoordinatorConfig {
            ring_timeout: Some(Duration::from_millis(30)),
            ..test_config()
        });
        h.controller.connect_signaling().await.unwrap();
        h.pump().await;
        h.receive(json!({"type": "call.incoming", "callId": "in-1"}))
            .await;
        assert!(h.controller.watchdog_deadline().is_some());

        h.receive(json!({"type": "call.connected"})).await;
        tokio::time::sleep(Duration::from_millis(60)).await;
        h.pump().await;

        assert_eq!(h.state(), CallState::InCall);
    }

    #[tokio::test]
    async fn test_disabled_watchdog_never_fires() {
        let mut h = Harness::with_config(CoordinatorConfig {
            setup_timeout: None,
            ..test_config()
        });
        h.controller.connect_signaling().await.unwrap();
        h.pump().await;
        h.dial("1555").await.unwrap();

        assert_eq!(h.controller.watchdog_deadline(), None);
    }

    // ------------------------------------------------------------------------
    // Event loop
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_run_loop_processes_intents_and_events() {
        let h = Harness::new();
        let connector = Arc::clone(&h.connector);
        let mut snapshots = h.controller.subscribe();
        let (intents, rx) = mpsc::channel(8);
        let task = tokio::spawn(h.controller.run(rx));

        intents.send(UserIntent::ConnectSignaling).await.unwrap();
        intents
            .send(UserIntent::Dial(Some("1555".into())))
            .await
            .unwrap();
        snapshots
            .wait_for(|s| s.call_state == CallState::Connecting)
            .await
            .unwrap();

        connector
            .remote(0)
            .push_json(json!({"type": "call.connected"}));
        snapshots
            .wait_for(|s| s.call_state == CallState::InCall)
            .await
            .unwrap();

        intents.send(UserIntent::Quit).await.unwrap();
        task.await.unwrap();
        assert!(connector.remote(0).is_closed_by_client().await);
    }
}
