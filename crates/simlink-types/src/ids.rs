//! Type-safe identifier wrappers.
//!
//! Node ids and request ids are both plain integers on the wire. The
//! newtypes keep them from being mixed up in signatures while
//! serializing transparently.

use serde::{Deserialize, Serialize};

/// Generates a transparent newtype wrapper around an unsigned integer.
macro_rules! define_id {
    (
        $(#[$meta:meta])*
        $name:ident($inner:ty)
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl $name {
            /// Return the inner integer value.
            pub const fn into_inner(self) -> $inner {
                self.0
            }
        }

        impl core::fmt::Display for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(id: $inner) -> Self {
                Self(id)
            }
        }

        impl From<$name> for $inner {
            fn from(id: $name) -> Self {
                id.0
            }
        }
    };
}

define_id! {
    /// Index of a node inside one simulation (`0..node_count`).
    NodeId(u32)
}

define_id! {
    /// Correlation id attached to a `step` request and echoed in its response.
    RequestId(u64)
}

impl NodeId {
    /// The node id as a `usize` index into per-node storage.
    pub fn index(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_serialize_as_bare_integers() {
        let json = serde_json::to_string(&NodeId(4)).unwrap_or_default();
        assert_eq!(json, "4");
        let rid: RequestId = serde_json::from_str("17").unwrap_or(RequestId(0));
        assert_eq!(rid, RequestId(17));
    }

    #[test]
    fn negative_node_id_is_rejected() {
        assert!(serde_json::from_str::<NodeId>("-1").is_err());
    }
}
