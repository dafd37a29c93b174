//! Cascading soft deletion for SQLite-backed records.
//!
//! Records of soft-deletable models are hidden by stamping a deletion
//! timestamp instead of removing the row. Deleting a record walks the
//! foreign keys that reference it and decides, per dependent record,
//! whether to stamp it, remove it, or leave it alone.

pub mod cleanup;
pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod permissions;
pub mod query;
pub mod record;
pub mod schema;
pub mod signals;
pub mod store;
pub mod time;

pub use collector::{
    Collector, DeleteError, DeletionMethod, DeletionPlan, DeletionReport, Mode, ResolvedRecord,
};
pub use config::{CollectorConfig, PolicyOverrides, Settings};
pub use error::{AppError, AppResult};
pub use permissions::{Action, AllowAll, PermissionGate};
pub use query::{Query, View};
pub use record::{Record, RecordKey};
pub use schema::{
    Association, Capability, DeletionPolicy, ModelDef, OnDelete, Relation, Schema, SchemaDef,
    SchemaError,
};
pub use signals::{Phase, Signal, SignalBus};
