//! Tablet location boundary.
//!
//! The location service owns cluster metadata: which tablet serves a key,
//! where its replicas live, and what schema a table carries. The client
//! only consumes it through the [`Locator`] trait; caching and refresh
//! policy live behind the implementation.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{ClientError, Result};
use crate::schema::Schema;

/// Policy for choosing among a tablet's replicas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaSelection {
    /// Only the leader replica. Writes always use this.
    LeaderOnly,
    /// The replica closest to the client, or a random one when all are
    /// equidistant.
    ClosestReplica,
    /// The first replica in the list.
    FirstReplica,
}

/// One serving replica of a tablet.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    pub addr: String,
    pub is_leader: bool,
}

/// Tablet descriptor. Key bounds are encoded primary keys, start
/// inclusive, end exclusive; an empty end key means unbounded.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TabletInfo {
    pub tablet_id: u64,
    pub start_key: Bytes,
    pub end_key: Bytes,
    pub replicas: Vec<ReplicaInfo>,
}

impl TabletInfo {
    pub fn contains_key(&self, key: &[u8]) -> bool {
        key >= self.start_key.as_ref() && (self.end_key.is_empty() || key < self.end_key.as_ref())
    }

    pub fn leader(&self) -> Option<&ReplicaInfo> {
        self.replicas.iter().find(|r| r.is_leader)
    }

    /// Pick a replica per policy. No locality information is modeled, so
    /// "closest" falls back to a uniformly random replica.
    pub(crate) fn pick_replica(&self, selection: ReplicaSelection) -> Result<&ReplicaInfo> {
        let no_replica = || {
            ClientError::TabletNotFound(format!("tablet {} has no usable replica", self.tablet_id))
        };
        match selection {
            ReplicaSelection::LeaderOnly => self.leader().ok_or_else(no_replica),
            ReplicaSelection::FirstReplica => self.replicas.first().ok_or_else(no_replica),
            ReplicaSelection::ClosestReplica => {
                if self.replicas.is_empty() {
                    return Err(no_replica());
                }
                use rand::Rng;
                let idx = rand::thread_rng().gen_range(0..self.replicas.len());
                Ok(&self.replicas[idx])
            }
        }
    }
}

/// Location service consumed by sessions and scanners.
#[async_trait]
pub trait Locator: Send + Sync + 'static {
    /// Schema of a table, as known to the cluster metadata.
    async fn table_schema(&self, table: &str) -> Result<Schema>;

    /// The tablet serving `key` in `table`.
    async fn tablet_for_key(&self, table: &str, key: &[u8]) -> Result<TabletInfo>;

    /// The tablet that starts at or after `prev_end_key`, i.e. the next
    /// tablet in key order. `None` once the keyspace is exhausted.
    async fn tablet_after(&self, table: &str, prev_end_key: &[u8]) -> Result<Option<TabletInfo>>;
}
