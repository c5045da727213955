//! Network identity of a connected player.

use bitcode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A session participant.
///
/// The id is assigned by the host when the transport connects and stays
/// stable for the lifetime of the connection. Nicknames are display-only and
/// not required to be unique.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode, Serialize, Deserialize)]
pub struct Participant {
    /// Opaque unique id (uuid v4, assigned by the host)
    pub id: String,
    /// Display name
    pub nickname: String,
}

impl Participant {
    pub fn new(id: impl Into<String>, nickname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            nickname: nickname.into(),
        }
    }

    /// Create a participant with a freshly generated id.
    pub fn generate(nickname: impl Into<String>) -> Self {
        Self::new(uuid::Uuid::new_v4().to_string(), nickname)
    }
}

impl std::fmt::Display for Participant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.nickname, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_unique() {
        let a = Participant::generate("Player");
        let b = Participant::generate("Player");
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn display_includes_nickname_and_id() {
        let p = Participant::new("abc-123", "Ana");
        assert_eq!(p.to_string(), "Ana (abc-123)");
    }
}
