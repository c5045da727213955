//! MHSP (Modhost Session Protocol) messages.
//!
//! All host/participant communication uses the [`WireMessage`] enum,
//! serialized with bitcode and framed for the stream transport:
//!
//! ```text
//! [MHSP][version:u16][length:u32][bitcode payload...]
//! ```

use bitcode::{Decode, Encode};

use modhost_shared::Participant;

/// MHSP protocol magic bytes
pub const MHSP_MAGIC: [u8; 4] = *b"MHSP";

/// Current MHSP protocol version
pub const MHSP_VERSION: u16 = 1;

/// Header size: magic (4) + version (2) + length (4)
pub const MHSP_HEADER_SIZE: usize = 10;

/// Upper bound on a single frame. Patch payloads ride inside
/// `SessionReady`, so this is sized for an embedded patch artifact.
pub const MAX_FRAME_SIZE: usize = 32 * 1024 * 1024;

/// Top-level MHSP message enum.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum WireMessage {
    // Host -> participant
    /// Participant id assigned on connect
    AssignId(AssignId),
    /// Version handshake accepted
    VersionGood(VersionGood),
    /// Version handshake rejected; the host disconnects after a grace delay
    VersionBad(VersionBad),
    /// Session join succeeded; carries the session config
    SessionReady(SessionReady),
    /// Session join denied: secret hash mismatch
    DeniedBadSecret,
    /// A participant left the session
    Left(Left),

    // Participant -> host
    /// Version handshake opener
    Version(VersionHello),
    /// Request to join (or create) a session
    JoinRequest(JoinRequest),

    // Either direction
    /// Application packet
    Msg(Packet),
    /// Unicast an application packet to a specific participant
    ToParticipant(ToParticipant),
}

/// Participant id assigned by the host when the transport connects.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct AssignId {
    pub participant_id: String,
}

/// Version handshake opener. Carries the full dotted version string.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct VersionHello {
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct VersionGood {
    /// Host version string
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct VersionBad {
    /// Host version string
    pub server: String,
    /// The rejected client version string
    pub client: String,
}

/// Session configuration, created by the first joiner and echoed to every
/// later joiner in `SessionReady`.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct SessionConfig {
    /// Unique session name
    pub name: String,
    /// SHA-256 hex digest of the join passphrase
    pub secret_hash: String,
    /// Name of the embedded patch artifact ("" when none)
    pub patch_name: String,
    /// Session-embedded patch payload (empty when none)
    pub patch: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct JoinRequest {
    pub config: SessionConfig,
    pub participant: Participant,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct SessionReady {
    pub config: SessionConfig,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Left {
    pub participant: Participant,
}

/// An application packet routed through a session.
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct Packet {
    /// Message-type identifier (first routing axis)
    pub packet_id: String,
    /// Channel tag (second routing axis)
    pub channel: String,
    /// Session the packet belongs to
    pub session: String,
    /// Whether the host relays this packet to the other members
    pub forward: bool,
    /// Opaque extension payload
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct ToParticipant {
    pub participant_id: String,
    pub packet: Packet,
}

// ============================================================================
// Serialization
// ============================================================================

impl WireMessage {
    /// Serialize with MHSP framing.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = bitcode::encode(self);
        let mut bytes = Vec::with_capacity(MHSP_HEADER_SIZE + payload.len());
        bytes.extend_from_slice(&MHSP_MAGIC);
        bytes.extend_from_slice(&MHSP_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
        bytes
    }

    /// Deserialize a complete frame.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DecodeError> {
        match decode_frame(bytes)? {
            Some((msg, _)) => Ok(msg),
            None => Err(DecodeError::TooShort),
        }
    }
}

/// Try to decode one frame from the front of a stream buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold a complete frame,
/// and `Ok(Some((message, consumed)))` once it does. Framing errors are
/// unrecoverable for the stream.
pub fn decode_frame(bytes: &[u8]) -> Result<Option<(WireMessage, usize)>, DecodeError> {
    if bytes.len() < MHSP_HEADER_SIZE {
        return Ok(None);
    }

    if bytes[0..4] != MHSP_MAGIC {
        return Err(DecodeError::InvalidMagic);
    }

    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != MHSP_VERSION {
        return Err(DecodeError::VersionMismatch {
            expected: MHSP_VERSION,
            got: version,
        });
    }

    let length = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(DecodeError::OversizedFrame(length));
    }

    if bytes.len() < MHSP_HEADER_SIZE + length {
        return Ok(None);
    }

    let payload = &bytes[MHSP_HEADER_SIZE..MHSP_HEADER_SIZE + length];
    let msg = bitcode::decode(payload).map_err(|e| DecodeError::DecodeFailed(e.to_string()))?;
    Ok(Some((msg, MHSP_HEADER_SIZE + length)))
}

/// Errors that can occur when decoding MHSP frames.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodeError {
    /// Buffer too short for the frame header
    TooShort,
    /// Invalid magic bytes
    InvalidMagic,
    /// Protocol version mismatch
    VersionMismatch { expected: u16, got: u16 },
    /// Declared payload length exceeds the frame bound
    OversizedFrame(usize),
    /// Bitcode decode failed
    DecodeFailed(String),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TooShort => write!(f, "buffer too short for MHSP header"),
            Self::InvalidMagic => write!(f, "invalid MHSP magic bytes"),
            Self::VersionMismatch { expected, got } => {
                write!(f, "MHSP version mismatch: expected {}, got {}", expected, got)
            }
            Self::OversizedFrame(len) => write!(f, "frame of {} bytes exceeds limit", len),
            Self::DecodeFailed(e) => write!(f, "failed to decode MHSP message: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_packet() -> Packet {
        Packet {
            packet_id: "inventory_sync".to_string(),
            channel: "zelda".to_string(),
            session: "alpha".to_string(),
            forward: true,
            payload: vec![1, 2, 3],
        }
    }

    #[test]
    fn join_request_roundtrip() {
        let msg = WireMessage::JoinRequest(JoinRequest {
            config: SessionConfig {
                name: "alpha".to_string(),
                secret_hash: "ab".repeat(32),
                patch_name: "fix.bps".to_string(),
                patch: vec![0xDE, 0xAD],
            },
            participant: Participant::new("pid-1", "Ana"),
        });
        let bytes = msg.to_bytes();
        assert_eq!(WireMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn packet_roundtrip() {
        let msg = WireMessage::Msg(sample_packet());
        let bytes = msg.to_bytes();
        assert_eq!(WireMessage::from_bytes(&bytes).unwrap(), msg);
    }

    #[test]
    fn incomplete_frames_wait_for_more_data() {
        let bytes = WireMessage::DeniedBadSecret.to_bytes();
        for cut in 0..bytes.len() {
            assert_eq!(decode_frame(&bytes[..cut]).unwrap(), None, "cut at {cut}");
        }
        assert!(decode_frame(&bytes).unwrap().is_some());
    }

    #[test]
    fn consumed_length_allows_back_to_back_frames() {
        let mut buffer = WireMessage::DeniedBadSecret.to_bytes();
        let second = WireMessage::Version(VersionHello {
            version: "1.0.0".to_string(),
        });
        buffer.extend_from_slice(&second.to_bytes());

        let (first, consumed) = decode_frame(&buffer).unwrap().unwrap();
        assert_eq!(first, WireMessage::DeniedBadSecret);
        let (next, _) = decode_frame(&buffer[consumed..]).unwrap().unwrap();
        assert_eq!(next, second);
    }

    #[test]
    fn invalid_magic_rejected() {
        let mut bytes = WireMessage::DeniedBadSecret.to_bytes();
        bytes[0] = b'X';
        assert_eq!(decode_frame(&bytes), Err(DecodeError::InvalidMagic));
    }

    #[test]
    fn version_mismatch_rejected() {
        let mut bytes = WireMessage::DeniedBadSecret.to_bytes();
        bytes[4] = 99;
        assert!(matches!(
            decode_frame(&bytes),
            Err(DecodeError::VersionMismatch { expected: 1, got: 99 })
        ));
    }

    #[test]
    fn oversized_frame_rejected() {
        let mut bytes = WireMessage::DeniedBadSecret.to_bytes();
        bytes[6..10].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert!(matches!(
            decode_frame(&bytes),
            Err(DecodeError::OversizedFrame(_))
        ));
    }
}
