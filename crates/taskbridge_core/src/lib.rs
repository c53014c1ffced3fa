//! Persistence bridge for the task-tracking model.
//! Keeps an in-memory entity graph in step with a SQLite record store under
//! unit-of-work semantics.

pub mod bridge;
pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod notify;
pub mod store;

pub use bridge::{BridgeError, BridgeResult, IdentityMap, Paged, Session, TrackedCounts};
pub use config::{BridgeConfig, DatabaseLocation};
pub use logging::{default_log_level, init_logging, logging_status, LogContext};
pub use model::collection::LazyRef;
pub use model::entity::{AppOption, Attachment, Entity, Note, Tag, Task, User};
pub use model::field::{Field, FieldMap, FieldShape, FieldValue};
pub use model::graph::{Graph, GraphError, GraphResult};
pub use model::{EntityId, EntityKind, EntityRef};
pub use notify::{ChangeListener, FieldChange, ListenerId, NoopListener, Operation};
pub use store::{
    Filter, Query, RecordHandle, RecordStore, SortDirection, SortField, SqliteRecordStore,
    StoreError, StoreResult,
};

/// Minimal health-check API for early integration.
pub fn ping() -> &'static str {
    "pong"
}

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
