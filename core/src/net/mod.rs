//! MHSP (Modhost Session Protocol)
//!
//! MHSP forms multiplayer sessions between one host and multiple remote
//! participants before the emulation engine starts. It handles:
//!
//! - Participant identity assignment
//! - Version handshake (major component must match)
//! - Session ("lobby") join/create with a hashed join secret
//! - Per-session shared storage seeded from module-declared fields
//! - Packet routing by packet id and channel tag, forwarding, and unicast
//!
//! # Protocol Flow
//!
//! ```text
//! Participant                        Host
//!   |                                  |
//!   |<-- AssignId ---------------------|
//!   |--- Version --------------------->|  (major components compared)
//!   |<-- VersionGood/VersionBad -------|  (bad: disconnect after grace)
//!   |                                  |
//!   |--- JoinRequest ----------------->|  (secret hash compared)
//!   |<-- SessionReady/DeniedBadSecret -|  (ready carries patch payload)
//!   |                                  |
//!   |--- Msg ------------------------->|  (routed on both buses,
//!   |<-- Msg (forwarded) --------------|   relayed when forwardable)
//!   |--- ToParticipant --------------->|  (unicast, bypasses membership)
//!   |                                  |
//!   |<-- Left -------------------------|  (another participant dropped)
//! ```

pub mod client;
pub mod host;
pub mod messages;
pub mod socket;


// Re-export state machine types
pub use client::{ClientEvent, NegotiatorConfig, NegotiatorState, SessionNegotiator};
pub use host::{HostEvent, RoutedPacket, Session, SessionHost, VERSION_MISMATCH_GRACE};

// Re-export message types
pub use messages::{
    AssignId, DecodeError, JoinRequest, Left, MAX_FRAME_SIZE, MHSP_HEADER_SIZE, MHSP_MAGIC,
    MHSP_VERSION, Packet, SessionConfig, SessionReady, ToParticipant, VersionBad, VersionGood,
    VersionHello, WireMessage,
};

// Re-export socket types
pub use socket::{DEFAULT_MHSP_PORT, HostListener, MessageStream, SocketError};
