use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};

use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::{DeleteError, Mode};
use crate::record::RecordKey;
use crate::schema::{OnDelete, Schema};
use crate::store;

/// Records affected by a deletion and the edges through which they were reached.
///
/// Roots hang off an implicit "no predecessor" node. Each record and each
/// (source, dependent) edge is stored once, however many paths lead to it.
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    roots: Vec<RecordKey>,
    edges: HashMap<RecordKey, Vec<RecordKey>>,
    seen_edges: HashSet<(RecordKey, RecordKey)>,
    records: BTreeMap<String, BTreeSet<i64>>,
    // (referencing row, protected target)
    protected: BTreeSet<(RecordKey, RecordKey)>,
    // soft-deletable dependents that already carried a deletion timestamp
    already_deleted: HashSet<RecordKey>,
    // model -> models whose rows must be processed before it
    model_dependencies: BTreeMap<String, BTreeSet<String>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the record was not part of the graph yet.
    pub fn add_root(&mut self, key: RecordKey) -> bool {
        if self.roots.contains(&key) {
            return false;
        }
        let fresh = self.insert_record(&key);
        self.roots.push(key);
        fresh
    }

    /// Returns `true` when `dependent` was not part of the graph yet.
    pub fn add_edge(&mut self, source: &RecordKey, dependent: RecordKey) -> bool {
        if !self.seen_edges.insert((source.clone(), dependent.clone())) {
            return false;
        }
        if source.model != dependent.model {
            self.model_dependencies
                .entry(source.model.clone())
                .or_default()
                .insert(dependent.model.clone());
        }
        let fresh = self.insert_record(&dependent);
        self.edges.entry(source.clone()).or_default().push(dependent);
        fresh
    }

    /// Notes that `dependent` points at `target` through a protecting relation.
    pub fn protect(&mut self, dependent: RecordKey, target: RecordKey) {
        self.protected.insert((dependent, target));
    }

    pub fn mark_already_deleted(&mut self, key: RecordKey) {
        self.already_deleted.insert(key);
    }

    /// `true` for rows a previous run soft-deleted.
    pub fn already_deleted(&self, key: &RecordKey) -> bool {
        self.already_deleted.contains(key)
    }

    fn insert_record(&mut self, key: &RecordKey) -> bool {
        self.records
            .entry(key.model.clone())
            .or_default()
            .insert(key.pk)
    }

    pub fn roots(&self) -> &[RecordKey] {
        &self.roots
    }

    pub fn children(&self, key: &RecordKey) -> &[RecordKey] {
        self.edges.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn contains(&self, key: &RecordKey) -> bool {
        self.records
            .get(&key.model)
            .is_some_and(|pks| pks.contains(&key.pk))
    }

    /// Discovered primary keys grouped by model, both in ascending order.
    pub fn records(&self) -> &BTreeMap<String, BTreeSet<i64>> {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn protected(&self) -> impl Iterator<Item = (&RecordKey, &RecordKey)> {
        self.protected.iter().map(|(dependent, target)| (dependent, target))
    }

    /// Referencing rows for which `blocks(row, target)` holds, each once and
    /// in key order.
    pub fn blocking<F>(&self, blocks: F) -> Vec<RecordKey>
    where
        F: Fn(&RecordKey, &RecordKey) -> bool,
    {
        let rows: BTreeSet<&RecordKey> = self
            .protected
            .iter()
            .filter(|(dependent, target)| blocks(dependent, target))
            .map(|(dependent, _)| dependent)
            .collect();
        rows.into_iter().cloned().collect()
    }

    pub fn model_dependencies(&self) -> &BTreeMap<String, BTreeSet<String>> {
        &self.model_dependencies
    }
}

/// Expands `roots` along every cascading relation until no new record turns up.
///
/// Rows referencing the set through a protecting relation land in the
/// protected set and are not expanded further. Rows of models for which
/// `cascades` returns `false` are kept but their dependents are not read.
/// In [`Mode::Logical`] soft-deletable dependents that already carry a
/// deletion timestamp are flagged (see [`DependencyGraph::already_deleted`]);
/// they are still expanded since an unsafe path may have to remove them.
pub async fn collect<F>(
    conn: &mut SqliteConnection,
    schema: &Schema,
    roots: &[RecordKey],
    mode: Mode,
    batch_size: usize,
    cascades: F,
) -> Result<DependencyGraph, DeleteError>
where
    F: Fn(&str) -> bool,
{
    let mut graph = DependencyGraph::new();
    let mut pending: VecDeque<(String, Vec<i64>)> = VecDeque::new();

    for key in roots {
        if graph.add_root(key.clone()) {
            match pending.iter_mut().find(|(model, _)| *model == key.model) {
                Some((_, pks)) => pks.push(key.pk),
                None => pending.push_back((key.model.clone(), vec![key.pk])),
            }
        }
    }

    while let Some((model, pks)) = pending.pop_front() {
        if !cascades(&model) {
            continue;
        }
        for relation in schema.relations_to(&model) {
            if matches!(relation.on_delete, OnDelete::SetNull | OnDelete::DoNothing) {
                continue;
            }
            let dependent = schema
                .model(&relation.model)
                .ok_or_else(|| DeleteError::UnknownModel(relation.model.clone()))?;
            let deleted_at_column = (mode == Mode::Logical && dependent.is_soft_deletable())
                .then_some(dependent.deleted_at_column.as_str());
            let rows = store::fetch_referencing(
                conn,
                &dependent.table,
                &dependent.pk_column,
                &relation.column,
                &pks,
                deleted_at_column,
                batch_size,
            )
            .await?;
            if rows.is_empty() {
                continue;
            }

            debug!(
                target: "softcascade",
                event = "collect_relation",
                model = model.as_str(),
                dependent = relation.model.as_str(),
                column = relation.column.as_str(),
                on_delete = ?relation.on_delete,
                rows = rows.len()
            );

            if relation.on_delete == OnDelete::Protect {
                for (pk, referenced, deleted) in rows {
                    let row = RecordKey::new(relation.model.clone(), pk);
                    if deleted {
                        graph.mark_already_deleted(row.clone());
                    }
                    graph.protect(row, RecordKey::new(model.clone(), referenced));
                }
                continue;
            }

            let mut fresh = Vec::new();
            for (pk, referenced, deleted) in rows {
                let source = RecordKey::new(model.clone(), referenced);
                let row = RecordKey::new(relation.model.clone(), pk);
                if deleted {
                    graph.mark_already_deleted(row.clone());
                }
                if graph.add_edge(&source, row) {
                    fresh.push(pk);
                }
            }
            if !fresh.is_empty() {
                pending.push_back((relation.model.clone(), fresh));
            }
        }
    }

    info!(
        target: "softcascade",
        event = "collect_graph",
        roots = graph.roots().len(),
        records = graph.len(),
        protected = graph.protected.len()
    );
    Ok(graph)
}
