//! Signaling Module - Duplex-Verbindung zum Call-Control-Service
//!
//! Dieses Modul verwaltet die Kommunikation mit dem Signaling-Server:
//! - Verbindung aufbauen (Single-Flight) und trennen
//! - Events serialisieren und senden
//! - Eingehende Frames parsen und weiterleiten
//!

mod channel;
mod messages;
mod transport;

pub use channel::{ChannelEvent, ConnectionStatus, SignalChannel};
pub use messages::*;
pub use transport::{
    Connector, Frame, FrameSink, FrameStream, Link, TransportError, WsConnector,
};
