//! Session Module - Zustandsmaschine eines Anrufs
//!
//! Dieses Modul verwaltet:
//! - Call State, Wahlnummer und eingehende Nummer
//! - Puffer für Negotiation-Payloads vor dem Peer
//! - Orchestrierung von Signaling, Media und Peer

mod buffer;
mod controller;
mod state;

pub use buffer::{BufferedSignal, PendingSignalBuffer};
pub use controller::{
    CallError, CallSessionController, Collaborators, EnvToken, StaticToken, TokenProvider,
    UserIntent, TOKEN_ENV_VAR,
};
pub use state::{CallDirection, CallSession, CallSnapshot, CallState};
