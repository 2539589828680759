//! Call State und Session-Daten
//!
//! `CallSession` ist der einzige veränderliche Zustand eines Anrufversuchs.
//! Er gehört exklusiv dem Controller; die UI sieht nur `CallSnapshot`s.

use crate::event_log::{EventLog, EventLogEntry};
use crate::signaling::{CallId, ConnectionStatus};
use serde::Serialize;

/// Aktueller Status eines Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallState {
    /// Kein aktiver Anruf
    #[default]
    Idle,
    /// Anruf wird aufgebaut (ausgehend oder angenommen)
    Connecting,
    /// Es klingelt (lokal oder bei der Gegenseite)
    Ringing,
    /// Anruf aktiv
    InCall,
    /// Anruf beendet
    Ended,
    /// Anruf mit Fehler abgebrochen
    Error,
}

impl CallState {
    /// Ein Anrufversuch läuft
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting | Self::Ringing | Self::InCall)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Error)
    }

    /// Ein neuer Anruf darf gestartet werden
    pub fn can_dial(&self) -> bool {
        matches!(self, Self::Idle | Self::Ended | Self::Error)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Ringing => "ringing",
            Self::InCall => "in-call",
            Self::Ended => "ended",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for CallState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Felder eines Anrufversuchs
#[derive(Debug, Clone, Default)]
pub struct CallSession {
    pub state: CallState,
    pub call_id: Option<CallId>,
    pub direction: Option<CallDirection>,
    pub dial_number: String,
    /// Nur gesetzt, solange ein eingehender Anruf klingelt oder läuft
    pub incoming_number: Option<String>,
    pub status_message: String,
    pub last_error: Option<String>,
}

impl CallSession {
    /// Neuer ausgehender Versuch; die Wahlnummer bleibt erhalten
    pub fn begin_outgoing(&mut self, call_id: CallId) {
        self.state = CallState::Connecting;
        self.call_id = Some(call_id);
        self.direction = Some(CallDirection::Outgoing);
        self.incoming_number = None;
        self.last_error = None;
    }

    pub fn begin_incoming(&mut self, call_id: CallId, from: Option<String>) {
        self.state = CallState::Ringing;
        self.call_id = Some(call_id);
        self.direction = Some(CallDirection::Incoming);
        self.incoming_number = from;
        self.last_error = None;
    }

    /// Übergang in `ended`; Call ID und eingehende Nummer werden gelöscht
    pub fn end(&mut self) {
        self.state = CallState::Ended;
        self.call_id = None;
        self.direction = None;
        self.incoming_number = None;
    }

    /// Übergang in `error` mit Fehlermeldung
    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        self.state = CallState::Error;
        self.call_id = None;
        self.direction = None;
        self.incoming_number = None;
        self.status_message = message.clone();
        self.last_error = Some(message);
    }

    /// Zurück nach `idle`, die Wahlnummer bleibt stehen
    pub fn reset(&mut self) {
        *self = Self {
            dial_number: std::mem::take(&mut self.dial_number),
            ..Self::default()
        };
    }

    pub fn is_incoming(&self) -> bool {
        self.direction == Some(CallDirection::Incoming)
    }
}

/// Sicht der UI auf den Controller
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSnapshot {
    pub call_state: CallState,
    pub call_id: Option<CallId>,
    pub direction: Option<CallDirection>,
    pub dial_number: String,
    pub incoming_number: Option<String>,
    pub status_message: String,
    pub last_error: Option<String>,
    pub connection: ConnectionStatus,
    pub muted: bool,
    /// Diagnose-Spur, alt nach neu
    pub event_log: Vec<EventLogEntry>,
}

impl CallSnapshot {
    pub fn capture(
        session: &CallSession,
        connection: ConnectionStatus,
        muted: bool,
        log: &EventLog,
    ) -> Self {
        Self {
            call_state: session.state,
            call_id: session.call_id.clone(),
            direction: session.direction,
            dial_number: session.dial_number.clone(),
            incoming_number: session.incoming_number.clone(),
            status_message: session.status_message.clone(),
            last_error: session.last_error.clone(),
            connection,
            muted,
            event_log: log.to_vec(),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(CallState::Ringing.is_active());
        assert!(!CallState::Ended.is_active());
        assert!(CallState::Error.is_terminal());
        assert!(CallState::Error.can_dial());
        assert!(!CallState::InCall.can_dial());
    }

    #[test]
    fn test_state_serializes_kebab_case() {
        assert_eq!(serde_json::to_string(&CallState::InCall).unwrap(), "\"in-call\"");
        assert_eq!(CallState::InCall.to_string(), "in-call");
    }

    #[test]
    fn test_end_clears_call_fields_but_keeps_number() {
        let mut session = CallSession {
            dial_number: "1555".into(),
            ..Default::default()
        };
        session.begin_incoming(CallId::new("c1"), Some("+1201".into()));
        session.end();

        assert_eq!(session.state, CallState::Ended);
        assert!(session.call_id.is_none());
        assert!(session.incoming_number.is_none());
        assert_eq!(session.dial_number, "1555");
    }

    #[test]
    fn test_fail_overwrites_previous_error() {
        let mut session = CallSession::default();
        session.fail("first");
        session.fail("second");
        assert_eq!(session.last_error.as_deref(), Some("second"));
        assert_eq!(session.status_message, "second");
    }

    #[test]
    fn test_reset_returns_to_idle() {
        let mut session = CallSession {
            dial_number: "42".into(),
            ..Default::default()
        };
        session.fail("boom");
        session.reset();

        assert_eq!(session.state, CallState::Idle);
        assert!(session.last_error.is_none());
        assert_eq!(session.dial_number, "42");
    }
}
