// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stream names, event types and fixed limits shared by the manager and workers.

use uuid::Uuid;

const PROJECTIONS_STREAM_PREFIX: &str = "$projections-";

/// Registry stream holding only `$ProjectionCreated`/`$ProjectionDeleted` markers.
pub const PROJECTIONS_REGISTRY_STREAM: &str = "$projections-$all";

/// Stream workers write their responses to and the manager tails.
pub const PROJECTIONS_MASTER_STREAM: &str = "$projections-$master";

/// Shared stream used to announce (re)started response readers to every worker.
pub const PROJECTIONS_CONTROL_STREAM: &str = "$projections-$control";

/// Projection id given to projections that are never written to the registry.
pub const PROJECTION_QUERY_ID: i64 = -2;

/// Number of extra attempts for a `$ProjectionCreated` append.
pub const REGISTRATION_RETRIES: u32 = 1;

/// Page size used when reading the registry stream during bootstrap.
pub const REGISTRY_READ_PAGE_SIZE: usize = 100;

/// Page size used by the control-stream readers.
pub const CONTROL_READ_PAGE_SIZE: usize = 10;

/// Command stream of a worker.
pub fn worker_stream(worker_id: Uuid) -> String {
    format!("{}${}", PROJECTIONS_STREAM_PREFIX, worker_id.simple())
}

/// Definition stream holding the latest persisted state of a projection.
pub fn definition_stream(name: &str) -> String {
    format!("{}{}", PROJECTIONS_STREAM_PREFIX, name)
}

/// Checkpoint stream of a projection.
pub fn checkpoint_stream(name: &str) -> String {
    format!("{}{}-checkpoint", PROJECTIONS_STREAM_PREFIX, name)
}

/// Order stream written by multi-stream projections that emit.
pub fn order_stream(name: &str) -> String {
    format!("{}{}-order", PROJECTIONS_STREAM_PREFIX, name)
}

/// Tracking stream listing every stream a projection emitted to.
pub fn emitted_streams_stream(name: &str) -> String {
    format!("{}{}-emittedstreams", PROJECTIONS_STREAM_PREFIX, name)
}

/// Checkpoint of the emitted-streams tracking stream.
pub fn emitted_streams_checkpoint_stream(name: &str) -> String {
    format!("{}{}-emittedstreams-checkpoint", PROJECTIONS_STREAM_PREFIX, name)
}

/// Default result stream of a projection.
pub fn result_stream(name: &str) -> String {
    format!("{}{}-result", PROJECTIONS_STREAM_PREFIX, name)
}

/// Event types used outside the control-stream message tags.
pub mod event_types {
    /// Sentinel written once to an empty registry.
    pub const PROJECTIONS_INITIALIZED: &str = "$ProjectionsInitialized";
    /// Registry marker for a created projection (body: raw UTF-8 name).
    pub const PROJECTION_CREATED: &str = "$ProjectionCreated";
    /// Registry marker for a deleted projection (body: raw UTF-8 name).
    pub const PROJECTION_DELETED: &str = "$ProjectionDeleted";
    /// Persisted-state snapshot in a definition stream.
    pub const PROJECTION_UPDATED: &str = "$ProjectionUpdated";
    /// Entry in an emitted-streams tracking stream (body: raw UTF-8 stream name).
    pub const STREAM_TRACKED: &str = "$StreamTracked";
    /// Written to the master stream by a response reader before it starts tailing.
    pub const RESPONSE_READER_STARTING: &str = "$response-reader-starting";
    /// Written to the control stream once a response reader has its read position.
    pub const RESPONSE_READER_STARTED: &str = "$response-reader-started";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_per_projection_streams() {
        assert_eq!(definition_stream("orders"), "$projections-orders");
        assert_eq!(checkpoint_stream("orders"), "$projections-orders-checkpoint");
        assert_eq!(order_stream("orders"), "$projections-orders-order");
        assert_eq!(
            emitted_streams_stream("orders"),
            "$projections-orders-emittedstreams"
        );
        assert_eq!(
            emitted_streams_checkpoint_stream("orders"),
            "$projections-orders-emittedstreams-checkpoint"
        );
        assert_eq!(result_stream("orders"), "$projections-orders-result");
    }

    #[test]
    fn test_worker_stream_uses_32_hex_id() {
        let id = Uuid::parse_str("6f9619ff-8b86-d011-b42d-00cf4fc964ff").unwrap();
        assert_eq!(
            worker_stream(id),
            "$projections-$6f9619ff8b86d011b42d00cf4fc964ff"
        );
    }
}
