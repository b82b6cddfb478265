//! Identity atoms.
//!
//! `Id`: 128-bit hex-representable value. Generation is salted with the
//! local peer's network address so ids are globally unique without
//! coordination. `ChunkId` and `ItemId` are distinct id spaces over the same
//! representation. `PeerId` is a "host:port" endpoint string.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Invalid identifier input.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidId {
    #[error("id `{raw}` is invalid: {reason}")]
    Id { raw: String, reason: String },
    #[error("peer id `{raw}` is invalid: {reason}")]
    Peer { raw: String, reason: String },
}

/// 128-bit identifier, rendered as 32 lowercase hex characters.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; 16]);

impl Id {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(32);
        for b in self.0 {
            out.push_str(&format!("{:02x}", b));
        }
        out
    }

    pub fn from_hex(s: &str) -> Result<Self, InvalidId> {
        if s.len() != 32 {
            return Err(InvalidId::Id {
                raw: s.to_string(),
                reason: format!("must be 32 hex chars (got {})", s.len()),
            });
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|_| InvalidId::Id {
                raw: s.to_string(),
                reason: "contains invalid UTF-8".into(),
            })?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(|_| InvalidId::Id {
                raw: s.to_string(),
                reason: format!("contains invalid hex: {}", hex),
            })?;
        }
        Ok(Self(bytes))
    }

    /// Generate a fresh id salted with `salt` (the local peer address).
    ///
    /// The salt guarantees distinct peers never collide; the random component
    /// guarantees distinct calls on one peer never collide.
    pub fn generate(salt: &str) -> Self {
        use rand::Rng;
        let mut rng = rand::rng();
        let nonce: [u8; 16] = rng.random();
        let mut hasher = Sha256::new();
        hasher.update(salt.as_bytes());
        hasher.update(nonce);
        let digest = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&digest[..16]);
        Self(bytes)
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({})", self.to_hex())
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Id::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

macro_rules! typed_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Id);

        impl $name {
            pub const fn from_id(id: Id) -> Self {
                Self(id)
            }

            pub fn generate(salt: &str) -> Self {
                Self(Id::generate(salt))
            }

            pub fn from_hex(s: &str) -> Result<Self, InvalidId> {
                Id::from_hex(s).map(Self)
            }

            pub fn id(&self) -> Id {
                self.0
            }

            pub fn to_hex(&self) -> String {
                self.0.to_hex()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

typed_id!(
    /// Identifier of a chunk within a table.
    ChunkId
);
typed_id!(
    /// Identifier of an item (record) within a table.
    ItemId
);

/// Network endpoint of a peer, canonical form "host:port".
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerId(String);

impl PeerId {
    pub fn parse(s: impl Into<String>) -> Result<Self, InvalidId> {
        let s = s.into();
        let Some((host, port)) = s.rsplit_once(':') else {
            return Err(InvalidId::Peer {
                raw: s,
                reason: "must contain ':' separator".into(),
            });
        };
        if host.is_empty() {
            return Err(InvalidId::Peer {
                raw: s.clone(),
                reason: "missing host".into(),
            });
        }
        if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
            return Err(InvalidId::Peer {
                raw: s.clone(),
                reason: "port must be numeric".into(),
            });
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({:?})", self.0)
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl TryFrom<String> for PeerId {
    type Error = InvalidId;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        PeerId::parse(s)
    }
}

impl From<PeerId> for String {
    fn from(p: PeerId) -> String {
        p.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_hex_round_trip() {
        let id = Id::generate("127.0.0.1:5000");
        let parsed = Id::from_hex(&id.to_hex()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn id_rejects_bad_hex() {
        assert!(Id::from_hex("abc").is_err());
        assert!(Id::from_hex(&"zz".repeat(16)).is_err());
    }

    #[test]
    fn generated_ids_are_distinct() {
        let a = Id::generate("127.0.0.1:5000");
        let b = Id::generate("127.0.0.1:5000");
        assert_ne!(a, b);
    }

    #[test]
    fn peer_id_parses_host_port() {
        let peer = PeerId::parse("127.0.0.1:5000").unwrap();
        assert_eq!(peer.as_str(), "127.0.0.1:5000");
    }

    #[test]
    fn peer_id_rejects_malformed() {
        assert!(PeerId::parse("no-port").is_err());
        assert!(PeerId::parse(":123").is_err());
        assert!(PeerId::parse("host:").is_err());
        assert!(PeerId::parse("host:12ab").is_err());
    }

    #[test]
    fn typed_ids_do_not_compare_across_spaces() {
        let id = Id::generate("x:1");
        let chunk = ChunkId::from_id(id);
        let item = ItemId::from_id(id);
        assert_eq!(chunk.id(), item.id());
    }
}
