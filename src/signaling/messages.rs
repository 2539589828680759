//! Message Types für das Signaling-Protokoll
//!
//! Jede Nachricht ist ein JSON-Objekt mit Pflichtfeld `type`.
//! Ausgehende Nachrichten werden direkt serialisiert, eingehende über
//! eine geschlossene Variante mit Fallback für unbekannte Typen geparst.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// CALL ID
// ============================================================================

/// Opaker Bezeichner eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(String);

impl CallId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Erzeugt eine neue, zufällige Call ID
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ============================================================================
// CLIENT → SERVER MESSAGES
// ============================================================================

/// Alle Nachrichten, die der Client sendet
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundEvent {
    /// Ausgehenden Anruf starten
    #[serde(rename = "call.initiate")]
    CallInitiate {
        #[serde(rename = "callId")]
        call_id: CallId,
        to: String,
    },

    /// Eingehenden Anruf annehmen
    #[serde(rename = "call.answer")]
    CallAnswer {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    /// Anruf beenden
    #[serde(rename = "call.ended")]
    CallEnded {
        #[serde(rename = "callId")]
        call_id: CallId,
    },

    /// Verhandlungsdaten (SDP / ICE) an die Gegenseite
    #[serde(rename = "signal")]
    Signal {
        #[serde(rename = "callId")]
        call_id: CallId,
        data: Value,
    },
}

impl OutboundEvent {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::CallInitiate { .. } => "call.initiate",
            OutboundEvent::CallAnswer { .. } => "call.answer",
            OutboundEvent::CallEnded { .. } => "call.ended",
            OutboundEvent::Signal { .. } => "signal",
        }
    }
}

// ============================================================================
// SERVER → CLIENT MESSAGES
// ============================================================================

/// Fehler beim Parsen eingehender Frames. Wird nur geloggt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolParseError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Message has no string 'type' field")]
    MissingType,

    #[error("Invalid fields for '{kind}': {reason}")]
    InvalidFields { kind: String, reason: String },
}

/// Alle Nachrichten, die der Call-Control-Service sendet
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    /// Eingehender Anruf
    CallIncoming {
        call_id: Option<CallId>,
        from: Option<String>,
    },

    /// Gegenseite klingelt
    CallRinging { call_id: Option<CallId> },

    /// Anruf verbunden
    CallConnected { call_id: Option<CallId> },

    /// Anruf beendet
    CallEnded { call_id: Option<CallId> },

    /// Anruf fehlgeschlagen
    CallError {
        call_id: Option<CallId>,
        message: Option<String>,
    },

    /// Verhandlungsdaten (SDP / ICE)
    Signal { call_id: Option<CallId>, data: Value },

    /// Presence-Hinweis
    Presence { message: Option<String> },

    /// Unbekannter Typ, wird nur geloggt
    Unknown { kind: String },
}

/// Wire-Form der bekannten Nachrichten
#[derive(Deserialize)]
#[serde(tag = "type")]
enum WireEvent {
    #[serde(rename = "call.incoming")]
    CallIncoming {
        #[serde(rename = "callId", default)]
        call_id: Option<CallId>,
        #[serde(default)]
        from: Option<String>,
    },

    #[serde(rename = "call.ringing")]
    CallRinging {
        #[serde(rename = "callId", default)]
        call_id: Option<CallId>,
    },

    #[serde(rename = "call.connected")]
    CallConnected {
        #[serde(rename = "callId", default)]
        call_id: Option<CallId>,
    },

    #[serde(rename = "call.ended")]
    CallEnded {
        #[serde(rename = "callId", default)]
        call_id: Option<CallId>,
    },

    #[serde(rename = "call.error")]
    CallError {
        #[serde(rename = "callId", default)]
        call_id: Option<CallId>,
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(rename = "signal")]
    Signal {
        #[serde(rename = "callId", default)]
        call_id: Option<CallId>,
        data: Value,
    },

    #[serde(rename = "presence")]
    Presence {
        #[serde(default)]
        message: Option<String>,
    },

    #[serde(other)]
    Unknown,
}

impl InboundEvent {
    /// Parst einen Text-Frame
    pub fn parse(text: &str) -> Result<Self, ProtocolParseError> {
        let value: Value = serde_json::from_str(text)
            .map_err(|e| ProtocolParseError::InvalidJson(e.to_string()))?;

        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolParseError::MissingType)?
            .to_string();

        let wire: WireEvent =
            serde_json::from_value(value).map_err(|e| ProtocolParseError::InvalidFields {
                kind: kind.clone(),
                reason: e.to_string(),
            })?;

        Ok(match wire {
            WireEvent::CallIncoming { call_id, from } => InboundEvent::CallIncoming { call_id, from },
            WireEvent::CallRinging { call_id } => InboundEvent::CallRinging { call_id },
            WireEvent::CallConnected { call_id } => InboundEvent::CallConnected { call_id },
            WireEvent::CallEnded { call_id } => InboundEvent::CallEnded { call_id },
            WireEvent::CallError { call_id, message } => InboundEvent::CallError { call_id, message },
            WireEvent::Signal { call_id, data } => InboundEvent::Signal { call_id, data },
            WireEvent::Presence { message } => InboundEvent::Presence { message },
            WireEvent::Unknown => InboundEvent::Unknown { kind },
        })
    }

    pub fn kind(&self) -> &str {
        match self {
            InboundEvent::CallIncoming { .. } => "call.incoming",
            InboundEvent::CallRinging { .. } => "call.ringing",
            InboundEvent::CallConnected { .. } => "call.connected",
            InboundEvent::CallEnded { .. } => "call.ended",
            InboundEvent::CallError { .. } => "call.error",
            InboundEvent::Signal { .. } => "signal",
            InboundEvent::Presence { .. } => "presence",
            InboundEvent::Unknown { kind } => kind,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
