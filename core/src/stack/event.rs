//! Decoding of engine callbacks into typed values.
//!
//! Decoding is total: any event id or DTLS state the engine emits that
//! this build does not recognize maps to an explicit `Unknown` variant,
//! never an error, so consumers always receive a well-formed value.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Four-character code, the engine's event id scheme.
const fn fourcc(code: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*code)
}

/// Raw event ids emitted by the engine.
pub mod event_ids {
    use super::fourcc;

    pub const GATTLINK_SESSION_READY: u32 = fourcc(b"gls+");
    pub const GATTLINK_SESSION_RESENT: u32 = fourcc(b"gls-");
    pub const GATTLINK_SESSION_STALL: u32 = fourcc(b"gls#");
    pub const GATTLINK_BUFFER_OVER_THRESHOLD: u32 = fourcc(b"glb+");
    pub const GATTLINK_BUFFER_UNDER_THRESHOLD: u32 = fourcc(b"glb-");
}

/// Raw DTLS protocol state values emitted by the engine.
pub mod dtls_state {
    pub const INIT: u32 = 0;
    pub const HANDSHAKE: u32 = 1;
    pub const SESSION: u32 = 2;
    pub const ERROR: u32 = 3;
}

/// Link-layer event decoded from an engine event id plus auxiliary data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StackEvent {
    /// The Gattlink session is up and ready to carry data.
    GattlinkSessionReady,
    /// The Gattlink session resent unacknowledged packets.
    GattlinkSessionResent,
    /// The Gattlink session has not made progress.
    GattlinkSessionStall {
        /// How long the session has been stalled for.
        stalled_time_ms: u32,
    },
    /// The outbound buffer crossed above its threshold.
    GattlinkBufferOverThreshold,
    /// The outbound buffer dropped back below its threshold.
    GattlinkBufferUnderThreshold,
    /// An event id this build does not recognize.
    Unknown { event_id: u32 },
}

impl StackEvent {
    /// Decode an engine callback. Total over all 32-bit event ids.
    pub fn parse(event_id: u32, data: u32) -> Self {
        match event_id {
            event_ids::GATTLINK_SESSION_READY => StackEvent::GattlinkSessionReady,
            event_ids::GATTLINK_SESSION_RESENT => StackEvent::GattlinkSessionResent,
            event_ids::GATTLINK_SESSION_STALL => StackEvent::GattlinkSessionStall {
                stalled_time_ms: data,
            },
            event_ids::GATTLINK_BUFFER_OVER_THRESHOLD => StackEvent::GattlinkBufferOverThreshold,
            event_ids::GATTLINK_BUFFER_UNDER_THRESHOLD => StackEvent::GattlinkBufferUnderThreshold,
            other => StackEvent::Unknown { event_id: other },
        }
    }
}

impl fmt::Display for StackEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackEvent::GattlinkSessionReady => write!(f, "GattlinkSessionReady"),
            StackEvent::GattlinkSessionResent => write!(f, "GattlinkSessionResent"),
            StackEvent::GattlinkSessionStall { stalled_time_ms } => {
                write!(f, "GattlinkSessionStall {{ stalled_time_ms: {stalled_time_ms} }}")
            }
            StackEvent::GattlinkBufferOverThreshold => write!(f, "GattlinkBufferOverThreshold"),
            StackEvent::GattlinkBufferUnderThreshold => write!(f, "GattlinkBufferUnderThreshold"),
            StackEvent::Unknown { event_id } => {
                write!(f, "Unknown {{ event_id: {event_id:#010x} }}")
            }
        }
    }
}

/// DTLS protocol state as projected to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtlsProtocolState {
    Init,
    Handshake,
    Session,
    Error,
    /// A raw state value this build does not recognize.
    Unknown,
}

impl DtlsProtocolState {
    /// Decode an engine state value. Total over all 32-bit values.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            dtls_state::INIT => DtlsProtocolState::Init,
            dtls_state::HANDSHAKE => DtlsProtocolState::Handshake,
            dtls_state::SESSION => DtlsProtocolState::Session,
            dtls_state::ERROR => DtlsProtocolState::Error,
            _ => DtlsProtocolState::Unknown,
        }
    }
}

/// Latest-known DTLS status, replayed to new subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsProtocolStatus {
    pub state: DtlsProtocolState,
    /// Engine result code from the last DTLS operation.
    pub last_error: i32,
    /// PSK identity offered during the handshake; may be empty.
    pub psk_identity: String,
}

impl DtlsProtocolStatus {
    /// Status before any engine callback has arrived.
    pub fn initial() -> Self {
        Self {
            state: DtlsProtocolState::Init,
            last_error: 0,
            psk_identity: String::new(),
        }
    }

    /// Build a status from a raw engine callback.
    pub fn from_callback(state: u32, last_error: i32, psk_identity: &[u8]) -> Self {
        Self {
            state: DtlsProtocolState::from_raw(state),
            last_error,
            psk_identity: String::from_utf8_lossy(psk_identity).into_owned(),
        }
    }
}
