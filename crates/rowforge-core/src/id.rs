//! Strongly-typed identifiers used across the engine.
//!
//! Operators, stages and partitions are never addressed by raw integers outside
//! of this module.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! new_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Ord, PartialOrd,
        )]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(v: u64) -> Self {
                Self(v)
            }
            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.0)
            }
        }
    };
}

new_id!(OpId);
new_id!(StageId);
new_id!(PartitionId);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_display_with_kind() {
        assert_eq!(OpId::new(7).to_string(), "OpId(7)");
        assert_eq!(StageId::new(0).to_string(), "StageId(0)");
    }

    #[test]
    fn ids_serialize_transparently() {
        let json = serde_json::to_string(&PartitionId::new(3)).unwrap();
        assert_eq!(json, "3");
        let back: PartitionId = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(), 3);
    }
}
