//! Call Session Coordinator
//!
//! Client-seitige Koordination eines Sprachanrufs:
//! - WebSocket-Signaling zum Call-Control-Service
//! - WebRTC für die Audio-Verbindung
//! - cpal für das Mikrofon
//! - Eine Zustandsmaschine, die alles zu einem konsistenten Call State
//!   zusammenführt

pub mod config;
pub mod event_log;
pub mod media;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod single_flight;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, CoordinatorConfig, IceServerConfig};
pub use event_log::{EventLog, EventLogEntry};
pub use session::{
    CallError, CallSessionController, CallSnapshot, CallState, Collaborators, EnvToken,
    StaticToken, TokenProvider, UserIntent,
};
pub use signaling::ConnectionStatus;

/// Standard-Filter, wenn `RUST_LOG` nicht gesetzt ist
const DEFAULT_LOG_DIRECTIVES: &str = "callsession=debug,webrtc=warn";

/// Initialisiert das Logging
///
/// Mehrfache Aufrufe sind harmlos, der erste Subscriber gewinnt.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_DIRECTIVES));

    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
