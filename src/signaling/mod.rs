//! Signaling Module
//!
//! - Nachrichtenformat (`type` + `data`) für Offer/Answer/Candidates und
//!   Teilnehmer-Events
//! - `SignalingSink` als ausgehende Seite
//! - WebSocket Client

mod client;
mod messages;

pub use client::{SignalingClient, SignalingError, SignalingEvent, SignalingSink};
pub use messages::SignalingMessage;
