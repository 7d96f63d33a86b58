use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! opaque_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Parse from the hyphenated string form. Returns `None` on
            /// malformed input.
            pub fn parse(s: &str) -> Option<Self> {
                Uuid::parse_str(s).ok().map(Self)
            }

            /// The underlying UUID.
            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

opaque_id! {
    /// Unique identifier of a single [`Message`](crate::Message).
    ///
    /// Doubles as the correlation id when the sender registers a pending
    /// response for the message.
    MessageId
}

opaque_id! {
    /// End-to-end identifier propagated across every child message of an
    /// originating request.
    TraceId
}

opaque_id! {
    /// Identifier shared by all members of a transaction batch.
    TransactionId
}

opaque_id! {
    /// Per-send identifier minted for command messages.
    SenderId
}

opaque_id! {
    /// Principal Key Record — the opaque identifier of a principal
    /// (self / friend / resource / subsystem).
    ///
    /// Pkrs are generated at registration and carry no meaning beyond
    /// identity; there is no cryptographic binding.
    Pkr
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_is_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
    }

    #[test]
    fn parse_round_trip() {
        let id = TraceId::generate();
        assert_eq!(TraceId::parse(&id.to_string()), Some(id));
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Pkr::parse("not-a-uuid").is_none());
    }

    #[test]
    fn serde_as_string() {
        let id = MessageId::generate();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id));
        let back: MessageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
