//! Peer identifiers and connection direction.
//!
//! The overlay does not manage identities itself; the embedding layer hands
//! it stable 32-byte identifiers (typically a public key hash) and liveness
//! events. Equality is by value, never by object reference.

use serde::{Deserialize, Serialize};

/// Opaque, stable peer identifier.
///
/// Comparable and hashable by value. The router never interprets the bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId([u8; 32]);

impl PeerId {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| hex::FromHexError::InvalidStringLength)?;
        Ok(Self(arr))
    }

    /// Short hex form for log output.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.short())
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.short())
    }
}

impl From<[u8; 32]> for PeerId {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl From<PeerId> for [u8; 32] {
    fn from(id: PeerId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for PeerId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Who initiated the underlying connection.
///
/// Mesh maintenance keeps a floor of outbound-initiated members per topic so
/// an attacker cannot eclipse the mesh purely with inbound connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
}

impl Direction {
    pub fn is_outbound(&self) -> bool {
        matches!(self, Direction::Outbound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_roundtrips_through_hex() {
        let id = PeerId::from_bytes([7u8; 32]);
        let hex = id.to_hex();
        assert_eq!(PeerId::from_hex(&hex).unwrap(), id);
    }

    #[test]
    fn peer_id_rejects_bad_hex() {
        assert!(PeerId::from_hex("abcd").is_err());
        assert!(PeerId::from_hex("zz").is_err());
    }

    #[test]
    fn equality_is_by_value() {
        let a = PeerId::from_bytes([1u8; 32]);
        let b = PeerId::from_bytes([1u8; 32]);
        let c = PeerId::from_bytes([2u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn direction_outbound_flag() {
        assert!(Direction::Outbound.is_outbound());
        assert!(!Direction::Inbound.is_outbound());
    }
}
