use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// String-keyed context bag carried by commands and event streams.
pub type Items = HashMap<String, String>;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4().to_string())
            }

            /// Returns the identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the identifier, returning the owned string.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_owned())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of an aggregate instance.
    ///
    /// Aggregate ids are opaque strings (`"acct-1"`, a UUID, ...). The mailbox,
    /// the memory cache and the event store are all keyed by this value.
    AggregateId
);

string_id!(
    /// Globally unique identifier of a command, used as the idempotency key.
    CommandId
);

string_id!(
    /// Correlation id of the process manager that issued a command.
    ProcessId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_id_new_creates_unique_ids() {
        let id1 = AggregateId::new();
        let id2 = AggregateId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn aggregate_id_from_str_preserves_value() {
        let id = AggregateId::from("acct-1");
        assert_eq!(id.as_str(), "acct-1");
        assert_eq!(id.to_string(), "acct-1");
    }

    #[test]
    fn ids_serialize_as_plain_strings() {
        let id = CommandId::from("cmd-42");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"cmd-42\"");

        let deserialized: CommandId = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized, id);
    }

    #[test]
    fn process_id_from_uuid() {
        let uuid = Uuid::new_v4();
        let id = ProcessId::from(uuid);
        assert_eq!(id.as_str(), uuid.to_string());
    }
}
