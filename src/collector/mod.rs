//! Cascading logical deletion.
//!
//! A run has three phases, all inside one transaction:
//!
//! 1. [`collect`] walks foreign keys from the roots and builds the
//!    [`DependencyGraph`], noting rows that reference it through a
//!    protecting relation.
//! 2. [`resolve`] assigns each reachable record a [`DeletionMethod`]. A
//!    protected row pointing at a record that will be written aborts the run.
//! 3. The mutator writes the outcome: one bulk update per model for soft
//!    deletions, one bulk delete per model for hard deletions, with
//!    pre/post signals around the statements.
//!
//! Any error rolls the whole run back.

mod error;
mod graph;
mod mutate;
mod order;
mod resolve;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use serde::Serialize;
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{info, warn};

pub use error::DeleteError;
pub use graph::{collect, DependencyGraph};
pub use mutate::MutationStats;
pub use order::deletion_order;
pub use resolve::{resolve, DeletionMethod, Resolution};

use crate::config::{CollectorConfig, PolicyOverrides};
use crate::db::finish_tx;
use crate::permissions::{Action, AllowAll, PermissionGate};
use crate::query::Query;
use crate::record::{Record, RecordKey};
use crate::schema::{DeletionPolicy, ModelDef, Schema};
use crate::signals::SignalBus;
use crate::store;
use crate::time::now_ms;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Soft-delete where the policy allows it.
    Logical,
    /// Physically remove every collected record.
    Purge,
}

impl Mode {
    fn action(self) -> Action {
        match self {
            Mode::Logical => Action::Delete,
            Mode::Purge => Action::Purge,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRecord {
    pub key: RecordKey,
    pub method: DeletionMethod,
}

/// What a completed run did.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionReport {
    pub mode: Mode,
    /// Timestamp written to every soft-deleted row of the run.
    pub deleted_at: i64,
    pub outcomes: Vec<ResolvedRecord>,
    pub stats: MutationStats,
    #[serde(skip)]
    index: HashMap<RecordKey, DeletionMethod>,
}

impl DeletionReport {
    fn new(mode: Mode, deleted_at: i64, resolution: &Resolution, stats: MutationStats) -> Self {
        let outcomes: Vec<ResolvedRecord> = resolution
            .iter()
            .map(|(key, method)| ResolvedRecord {
                key: key.clone(),
                method,
            })
            .collect();
        let index = outcomes
            .iter()
            .map(|outcome| (outcome.key.clone(), outcome.method))
            .collect();
        Self {
            mode,
            deleted_at,
            outcomes,
            stats,
            index,
        }
    }

    pub fn method(&self, key: &RecordKey) -> Option<DeletionMethod> {
        self.index.get(key).copied()
    }

    pub fn count(&self, method: DeletionMethod) -> usize {
        self.outcomes.iter().filter(|o| o.method == method).count()
    }

    /// Mirrors the stored outcome onto an in-memory record.
    pub fn apply(&self, record: &mut Record) {
        let Some(key) = record.key() else {
            return;
        };
        match self.method(&key) {
            Some(DeletionMethod::SoftDelete) => record.deleted_at = Some(self.deleted_at),
            Some(DeletionMethod::HardDelete) => record.pk = None,
            Some(DeletionMethod::Skip) | None => {}
        }
    }
}

/// Outcome of a dry run. Nothing was written.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionPlan {
    pub mode: Mode,
    pub outcomes: Vec<ResolvedRecord>,
    /// Rows that would make the real run fail with a protected reference.
    /// Protections on skipped records are not listed.
    pub protected: Vec<RecordKey>,
}

impl DeletionPlan {
    pub fn count(&self, method: DeletionMethod) -> usize {
        self.outcomes.iter().filter(|o| o.method == method).count()
    }
}

#[derive(Clone)]
pub struct Collector {
    pool: SqlitePool,
    schema: Arc<Schema>,
    signals: SignalBus,
    gate: Arc<dyn PermissionGate>,
    config: CollectorConfig,
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collector")
            .field("signals", &self.signals)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Collector {
    pub fn new(pool: SqlitePool, schema: Arc<Schema>) -> Self {
        Self {
            pool,
            schema,
            signals: SignalBus::new(),
            gate: Arc::new(AllowAll),
            config: CollectorConfig::default(),
        }
    }

    pub fn with_signals(mut self, signals: SignalBus) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_gate(mut self, gate: Arc<dyn PermissionGate>) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_config(mut self, config: CollectorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    /// Query over `model`, restricted to active rows by default.
    pub fn objects(&self, model: &str) -> Result<Query<'_>, DeleteError> {
        let def = self.model_def(model)?;
        Ok(Query::new(self, def))
    }

    /// Effective policy of `model` for one run; `None` for plain models.
    pub fn policy_for(&self, model: &str, overrides: &PolicyOverrides) -> Option<DeletionPolicy> {
        let def = self.schema.model(model)?;
        let own = def.capability.policy()?;
        Some(overrides.get(model).unwrap_or(own))
    }

    pub async fn delete(&self, records: &mut [Record]) -> Result<DeletionReport, DeleteError> {
        self.delete_with(records, &PolicyOverrides::default()).await
    }

    pub async fn delete_with(
        &self,
        records: &mut [Record],
        overrides: &PolicyOverrides,
    ) -> Result<DeletionReport, DeleteError> {
        let roots = root_keys(records)?;
        let report = self.run(roots, Mode::Logical, overrides).await?;
        records.iter_mut().for_each(|record| report.apply(record));
        Ok(report)
    }

    pub async fn delete_keys(&self, model: &str, pks: &[i64]) -> Result<DeletionReport, DeleteError> {
        let roots = pks.iter().map(|pk| RecordKey::new(model, *pk)).collect();
        self.run(roots, Mode::Logical, &PolicyOverrides::default())
            .await
    }

    /// Physically removes the records and everything cascading from them.
    pub async fn purge(&self, records: &mut [Record]) -> Result<DeletionReport, DeleteError> {
        let roots = root_keys(records)?;
        let report = self
            .run(roots, Mode::Purge, &PolicyOverrides::default())
            .await?;
        records.iter_mut().for_each(|record| report.apply(record));
        Ok(report)
    }

    pub async fn purge_keys(&self, model: &str, pks: &[i64]) -> Result<DeletionReport, DeleteError> {
        let roots = pks.iter().map(|pk| RecordKey::new(model, *pk)).collect();
        self.run(roots, Mode::Purge, &PolicyOverrides::default())
            .await
    }

    /// Builds the graph and resolution without writing anything.
    pub async fn plan(
        &self,
        roots: &[RecordKey],
        mode: Mode,
        overrides: &PolicyOverrides,
    ) -> Result<DeletionPlan, DeleteError> {
        self.check_roots(roots, mode.action())?;
        let mut tx = self.pool.begin().await?;
        let graph = self.collect_in(&mut *tx, roots, mode, overrides).await;
        // Reads only; dropping the transaction would roll back as well.
        tx.rollback().await?;
        let graph = graph?;

        let resolution = self.resolution(&graph, mode, overrides);
        let protected = blocking_rows(&graph, &resolution);
        info!(
            target: "softcascade",
            event = "plan",
            mode = ?mode,
            records = resolution.len(),
            protected = protected.len()
        );
        Ok(DeletionPlan {
            mode,
            outcomes: resolution
                .iter()
                .map(|(key, method)| ResolvedRecord {
                    key: key.clone(),
                    method,
                })
                .collect(),
            protected,
        })
    }

    /// Clears the deletion timestamp of the given records only. Records
    /// removed by the same cascade stay deleted.
    pub async fn undelete(&self, records: &mut [Record]) -> Result<u64, DeleteError> {
        let keys = root_keys(records)?;
        let restored = self.undelete_keys(&keys).await?;
        for record in records.iter_mut() {
            record.deleted_at = None;
        }
        Ok(restored)
    }

    pub async fn undelete_keys(&self, keys: &[RecordKey]) -> Result<u64, DeleteError> {
        let mut grouped: HashMap<&str, Vec<i64>> = HashMap::new();
        for key in keys {
            let def = self.model_def(&key.model)?;
            if !def.is_soft_deletable() {
                return Err(DeleteError::invalid(format!(
                    "{} has no deletion timestamp to clear",
                    def.name
                )));
            }
            self.check(Action::Undelete, def)?;
            grouped.entry(def.name.as_str()).or_default().push(key.pk);
        }

        let mut tx = self.pool.begin().await?;
        info!(target: "softcascade", event = "db_tx_begin");
        let result = self.undelete_in(&mut *tx, &grouped).await;
        finish_tx(tx, result).await
    }

    async fn undelete_in(
        &self,
        conn: &mut SqliteConnection,
        grouped: &HashMap<&str, Vec<i64>>,
    ) -> Result<u64, DeleteError> {
        let mut restored = 0;
        for (model, pks) in grouped {
            let def = self.model_def(model)?;
            restored += store::clear_deleted(
                conn,
                &def.table,
                &def.pk_column,
                &def.deleted_at_column,
                pks,
                self.config.batch_size,
            )
            .await?;
        }
        info!(target: "softcascade", event = "undelete", records = restored);
        Ok(restored)
    }

    pub(crate) async fn run(
        &self,
        roots: Vec<RecordKey>,
        mode: Mode,
        overrides: &PolicyOverrides,
    ) -> Result<DeletionReport, DeleteError> {
        self.check_roots(&roots, mode.action())?;
        if roots.is_empty() {
            return Ok(DeletionReport::new(
                mode,
                now_ms(),
                &Resolution::default(),
                MutationStats::default(),
            ));
        }

        let mut tx = self.pool.begin().await?;
        info!(target: "softcascade", event = "db_tx_begin", mode = ?mode, roots = roots.len());
        let result = self.run_in(&mut *tx, &roots, mode, overrides).await;
        finish_tx(tx, result).await
    }

    async fn run_in(
        &self,
        conn: &mut SqliteConnection,
        roots: &[RecordKey],
        mode: Mode,
        overrides: &PolicyOverrides,
    ) -> Result<DeletionReport, DeleteError> {
        let graph = self.collect_in(conn, roots, mode, overrides).await?;
        let resolution = self.resolution(&graph, mode, overrides);
        let blocking = blocking_rows(&graph, &resolution);
        if let Some(first) = blocking.first() {
            warn!(
                target: "softcascade",
                event = "protected_reference",
                blocking = blocking.len(),
                first = %first
            );
            return Err(DeleteError::ProtectedReference { blocking });
        }

        info!(
            target: "softcascade",
            event = "resolve",
            soft = resolution.count(DeletionMethod::SoftDelete),
            hard = resolution.count(DeletionMethod::HardDelete),
            skip = resolution.count(DeletionMethod::Skip)
        );

        let mutated: BTreeSet<&str> = resolution
            .iter()
            .filter(|(_, method)| *method != DeletionMethod::Skip)
            .map(|(key, _)| key.model.as_str())
            .collect();
        for model in mutated {
            self.check(mode.action(), self.model_def(model)?)?;
        }

        let delete_batches: BTreeSet<String> = match mode {
            Mode::Logical => graph
                .records()
                .keys()
                .filter(|model| {
                    self.policy_for(model, overrides)
                        .is_some_and(|policy| policy.delete_batches)
                })
                .cloned()
                .collect(),
            Mode::Purge => BTreeSet::new(),
        };

        let deleted_at = now_ms();
        let ctx = mutate::MutationContext {
            schema: &self.schema,
            signals: &self.signals,
            batch_size: self.config.batch_size,
            deleted_at,
            delete_batches: &delete_batches,
        };
        let stats = mutate::apply(conn, &ctx, &graph, &resolution).await?;
        Ok(DeletionReport::new(mode, deleted_at, &resolution, stats))
    }

    async fn collect_in(
        &self,
        conn: &mut SqliteConnection,
        roots: &[RecordKey],
        mode: Mode,
        overrides: &PolicyOverrides,
    ) -> Result<DependencyGraph, DeleteError> {
        let batch_size = self.config.batch_size;
        match mode {
            // Dependents of a record whose own policy stops the cascade are never resolved.
            Mode::Logical => {
                collect(conn, &self.schema, roots, mode, batch_size, |model| {
                    self.policy_for(model, overrides)
                        .map_or(true, |policy| policy.delete_related)
                })
                .await
            }
            Mode::Purge => collect(conn, &self.schema, roots, mode, batch_size, |_| true).await,
        }
    }

    fn resolution(&self, graph: &DependencyGraph, mode: Mode, overrides: &PolicyOverrides) -> Resolution {
        match mode {
            Mode::Logical => resolve(graph, self.config.default_policy, |model| {
                self.policy_for(model, overrides)
            }),
            Mode::Purge => Resolution::purge(graph),
        }
    }

    fn model_def(&self, model: &str) -> Result<&ModelDef, DeleteError> {
        self.schema
            .model(model)
            .ok_or_else(|| DeleteError::UnknownModel(model.to_string()))
    }

    pub(crate) fn check(&self, action: Action, def: &ModelDef) -> Result<(), DeleteError> {
        if self.gate.allows(action, def) {
            Ok(())
        } else {
            warn!(
                target: "softcascade",
                event = "permission_denied",
                action = %action,
                model = def.name.as_str()
            );
            Err(DeleteError::PermissionDenied {
                action,
                model: def.name.clone(),
            })
        }
    }

    fn check_roots(&self, roots: &[RecordKey], action: Action) -> Result<(), DeleteError> {
        let models: BTreeSet<&str> = roots.iter().map(|key| key.model.as_str()).collect();
        for model in models {
            self.check(action, self.model_def(model)?)?;
        }
        Ok(())
    }
}

/// Protected rows whose target is about to be written. Skipped records and
/// records the resolution never reached stay as they are, so their
/// protections do not count. A row a previous run soft-deleted only blocks
/// the physical removal of its target.
fn blocking_rows(graph: &DependencyGraph, resolution: &Resolution) -> Vec<RecordKey> {
    graph.blocking(|row, target| match resolution.get(target) {
        Some(DeletionMethod::HardDelete) => true,
        Some(DeletionMethod::SoftDelete) => !graph.already_deleted(row),
        Some(DeletionMethod::Skip) | None => false,
    })
}

fn root_keys(records: &[Record]) -> Result<Vec<RecordKey>, DeleteError> {
    records
        .iter()
        .map(|record| {
            record.key().ok_or_else(|| {
                DeleteError::invalid(format!(
                    "{} record has no primary key and cannot be deleted",
                    record.model
                ))
            })
        })
        .collect()
}
