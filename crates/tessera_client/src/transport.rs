//! RPC transport boundary.
//!
//! The transport delivers one request to one replica and reports the
//! outcome. Connection pooling, retries and backoff are its business,
//! not the client's; the client adds only a per-call deadline on top.

use async_trait::async_trait;

use crate::error::Result;
use crate::location::ReplicaInfo;
use crate::rpc::{ScanRequest, ScanResponse, WriteRequest, WriteResponse};

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Deliver a grouped write request to a replica.
    async fn write(&self, replica: &ReplicaInfo, request: WriteRequest) -> Result<WriteResponse>;

    /// Deliver a scan open/continue request to a replica.
    async fn scan(&self, replica: &ReplicaInfo, request: ScanRequest) -> Result<ScanResponse>;

    /// Release server-side scanner state. Best effort; callers ignore
    /// failures.
    async fn close_scanner(&self, replica: &ReplicaInfo, scanner_id: u64) -> Result<()>;
}
