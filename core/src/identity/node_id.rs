use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const SIGN_BIT: u64 = 1 << 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum NodeIdError {
    #[error("Node id must be non-zero")]
    Zero,
    #[error("Node id must not have the sign bit set: {0}")]
    SignBit(u64),
    #[error("Invalid node id string: {0}")]
    Parse(String),
}

/// Identifier of a logical peer, shared by every transport it is reachable on
///
/// Always non-zero with the top bit cleared, so it is representable as a
/// positive signed 64-bit integer on peers that store it that way. A HELLO
/// frame carrying a value outside that range fails to deserialize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct NodeId(u64);

impl NodeId {
    /// Draw a fresh random id for this process
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        loop {
            let value = rng.gen::<u64>() & !SIGN_BIT;
            if value != 0 {
                return Self(value);
            }
        }
    }

    pub fn new(value: u64) -> Result<Self, NodeIdError> {
        if value == 0 {
            return Err(NodeIdError::Zero);
        }
        if value & SIGN_BIT != 0 {
            return Err(NodeIdError::SignBit(value));
        }
        Ok(Self(value))
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl TryFrom<u64> for NodeId {
    type Error = NodeIdError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for NodeId {
    type Err = NodeIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let value = s
            .trim()
            .parse::<u64>()
            .map_err(|_| NodeIdError::Parse(s.to_string()))?;
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_is_positive_and_non_zero() {
        for _ in 0..1_000 {
            let id = NodeId::generate();
            assert_ne!(id.get(), 0);
            assert_eq!(id.get() & SIGN_BIT, 0);
        }
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert_eq!(NodeId::new(0), Err(NodeIdError::Zero));
        assert!(matches!(NodeId::new(u64::MAX), Err(NodeIdError::SignBit(_))));
        assert_eq!(NodeId::new(42).unwrap().get(), 42);
    }

    #[test]
    fn test_display_parse() {
        let id = NodeId::new(1234567890123).unwrap();
        assert_eq!(id.to_string(), "1234567890123");
        assert_eq!("1234567890123".parse::<NodeId>().unwrap(), id);
        assert!("not-a-node".parse::<NodeId>().is_err());
        assert!("0".parse::<NodeId>().is_err());
    }

    #[test]
    fn test_deserialize_rejects_zero() {
        let zero = bincode::serialize(&0u64).unwrap();
        assert!(bincode::deserialize::<NodeId>(&zero).is_err());

        let ok = bincode::serialize(&7u64).unwrap();
        assert_eq!(bincode::deserialize::<NodeId>(&ok).unwrap().get(), 7);
    }
}
