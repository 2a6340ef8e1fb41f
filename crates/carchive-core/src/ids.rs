use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! branded_id {
    ($name:ident, $prefix:expr) => {
        #[derive(Clone, Debug, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, Uuid::now_v7()))
            }

            /// Wrap an id that already exists (rows read back, ids minted elsewhere).
            pub fn from_raw(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::convert::Infallible;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.to_owned()))
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

// Buffer subsystem ids
branded_id!(BufferId, "buf");
branded_id!(BufferItemId, "itm");
branded_id!(CollectionId, "coll");
branded_id!(CollectionItemId, "citm");

// Archive entity ids (owned by the archive, only referenced here)
branded_id!(MessageId, "msg");
branded_id!(ConversationId, "conv");
branded_id!(ChunkId, "chk");
branded_id!(AgentOutputId, "gen");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_id_has_prefix() {
        let id = BufferId::new();
        assert!(id.as_str().starts_with("buf_"), "got: {id}");
    }

    #[test]
    fn collection_id_has_prefix() {
        let id = CollectionId::new();
        assert!(id.as_str().starts_with("coll_"), "got: {id}");
    }

    #[test]
    fn entity_ids_have_prefixes() {
        assert!(MessageId::new().as_str().starts_with("msg_"));
        assert!(ConversationId::new().as_str().starts_with("conv_"));
        assert!(ChunkId::new().as_str().starts_with("chk_"));
        assert!(AgentOutputId::new().as_str().starts_with("gen_"));
    }

    #[test]
    fn ids_are_unique() {
        let a = BufferId::new();
        let b = BufferId::new();
        assert_ne!(a, b);
    }

    #[test]
    fn display_and_from_str_roundtrip() {
        let id = BufferId::new();
        let s = id.to_string();
        let parsed: BufferId = s.parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn serde_roundtrip() {
        let id = MessageId::new();
        let json = serde_json::to_string(&id).unwrap();
        let parsed: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn from_raw_preserves_value() {
        let id = MessageId::from_raw("4a7b9c2e-legacy-uuid");
        assert_eq!(id.as_str(), "4a7b9c2e-legacy-uuid");
    }
}
