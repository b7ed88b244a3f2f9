//! Aggregate snapshots that shorten replay.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{AggregateId, Version};

/// Serialized aggregate state as of `version`.
///
/// Replay loads the snapshot and then applies only the streams above it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub aggregate_id: AggregateId,
    pub aggregate_type: String,
    /// Last stream version folded into `state`.
    pub version: Version,
    pub timestamp: DateTime<Utc>,
    pub state: serde_json::Value,
}

impl Snapshot {
    /// Captures `state` at `version`.
    pub fn from_state<T: Serialize>(
        aggregate_id: AggregateId,
        aggregate_type: impl Into<String>,
        version: Version,
        state: &T,
    ) -> Result<Self, serde_json::Error> {
        let state = serde_json::to_value(state)?;
        Ok(Self {
            aggregate_id,
            aggregate_type: aggregate_type.into(),
            version,
            timestamp: Utc::now(),
            state,
        })
    }

    /// Decodes the captured state. Fails when the aggregate's shape changed
    /// since the snapshot was taken.
    pub fn into_state<T: DeserializeOwned>(self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.state)
    }
}

/// Keeps the latest snapshot per aggregate. Saving an older version than the
/// stored one is ignored.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, snapshot: Snapshot) -> crate::Result<()>;

    async fn load(&self, aggregate_id: &AggregateId) -> crate::Result<Option<Snapshot>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Balance {
        owner: String,
        cents: i64,
    }

    #[test]
    fn captured_state_decodes_back() {
        let balance = Balance {
            owner: "alice".to_string(),
            cents: 4200,
        };
        let snapshot =
            Snapshot::from_state(AggregateId::from("acct-1"), "Account", Version::new(5), &balance)
                .unwrap();

        assert_eq!(snapshot.state["cents"], 4200);
        assert_eq!(snapshot.into_state::<Balance>().unwrap(), balance);
    }

    #[test]
    fn changed_shape_fails_to_decode() {
        let snapshot =
            Snapshot::from_state(AggregateId::from("acct-1"), "Account", Version::new(5), &7)
                .unwrap();

        assert!(snapshot.into_state::<Balance>().is_err());
    }
}
