use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::graph::DependencyGraph;
use super::resolve::{DeletionMethod, Resolution};
use super::order::deletion_order;
use crate::record::RecordKey;
use crate::schema::{OnDelete, Schema};
use crate::signals::{Phase, Signal, SignalBus};
use crate::store;

/// Row counts reported by one mutation run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MutationStats {
    pub soft_deleted: u64,
    pub hard_deleted: u64,
    pub links_removed: u64,
    pub references_cleared: u64,
}

pub(crate) struct MutationContext<'a> {
    pub schema: &'a Schema,
    pub signals: &'a SignalBus,
    pub batch_size: usize,
    pub deleted_at: i64,
    /// Models whose association rows go even when their records are kept.
    pub delete_batches: &'a BTreeSet<String>,
}

#[derive(Default)]
struct ModelBatch {
    all: Vec<(i64, DeletionMethod)>,
    soft: Vec<i64>,
    hard: Vec<i64>,
}

fn batches(graph: &DependencyGraph, resolution: &Resolution) -> BTreeMap<String, ModelBatch> {
    let mut grouped: BTreeMap<String, ModelBatch> = BTreeMap::new();
    for (model, pks) in graph.records() {
        for pk in pks {
            let Some(method) = resolution.get(&RecordKey::new(model.clone(), *pk)) else {
                continue;
            };
            let batch = grouped.entry(model.clone()).or_default();
            batch.all.push((*pk, method));
            match method {
                DeletionMethod::SoftDelete => batch.soft.push(*pk),
                DeletionMethod::HardDelete => batch.hard.push(*pk),
                DeletionMethod::Skip => {}
            }
        }
    }
    grouped
}

fn announce(signals: &SignalBus, phase: Phase, order: &[String], grouped: &BTreeMap<String, ModelBatch>, schema: &Schema) {
    if signals.is_empty() {
        return;
    }
    for model in order {
        if schema.model(model).is_some_and(|def| def.auto_created) {
            continue;
        }
        let Some(batch) = grouped.get(model) else {
            continue;
        };
        for (pk, method) in &batch.all {
            signals.send(&Signal {
                phase,
                key: RecordKey::new(model.clone(), *pk),
                method: *method,
            });
        }
    }
}

/// Writes the resolved outcomes: association rows, nulled references,
/// deletion timestamps and physical removals, children before parents.
///
/// Runs on the caller's transaction; any error leaves the rollback to it.
pub(crate) async fn apply(
    conn: &mut SqliteConnection,
    ctx: &MutationContext<'_>,
    graph: &DependencyGraph,
    resolution: &Resolution,
) -> Result<MutationStats, sqlx::Error> {
    let grouped = batches(graph, resolution);
    let order = deletion_order(grouped.keys(), graph.model_dependencies());
    let mut stats = MutationStats::default();

    announce(ctx.signals, Phase::PreDelete, &order, &grouped, ctx.schema);

    for model in &order {
        let Some(batch) = grouped.get(model) else {
            continue;
        };
        let linked: Vec<i64> = if ctx.delete_batches.contains(model) {
            batch.all.iter().map(|(pk, _)| *pk).collect()
        } else {
            batch.hard.clone()
        };
        if linked.is_empty() {
            continue;
        }
        for link in ctx.schema.links_for(model) {
            stats.links_removed +=
                store::delete_where_in(conn, link.table, link.column, &linked, ctx.batch_size).await?;
        }
    }

    for model in &order {
        let (Some(batch), Some(def)) = (grouped.get(model), ctx.schema.model(model)) else {
            continue;
        };

        if !batch.hard.is_empty() {
            for relation in ctx.schema.relations_to(model) {
                if relation.on_delete != OnDelete::SetNull {
                    continue;
                }
                let Some(dependent) = ctx.schema.model(&relation.model) else {
                    continue;
                };
                stats.references_cleared += store::clear_references(
                    conn,
                    &dependent.table,
                    &relation.column,
                    &batch.hard,
                    ctx.batch_size,
                )
                .await?;
            }
        }

        if !batch.soft.is_empty() {
            stats.soft_deleted += store::mark_deleted(
                conn,
                &def.table,
                &def.pk_column,
                &def.deleted_at_column,
                &batch.soft,
                ctx.deleted_at,
                ctx.batch_size,
            )
            .await?;
        }
        if !batch.hard.is_empty() {
            stats.hard_deleted +=
                store::delete_where_in(conn, &def.table, &def.pk_column, &batch.hard, ctx.batch_size)
                    .await?;
        }

        debug!(
            target: "softcascade",
            event = "mutate_model",
            model = model.as_str(),
            soft = batch.soft.len(),
            hard = batch.hard.len(),
            skipped = batch.all.len() - batch.soft.len() - batch.hard.len()
        );
    }

    announce(ctx.signals, Phase::PostDelete, &order, &grouped, ctx.schema);

    info!(
        target: "softcascade",
        event = "mutate_done",
        models = order.len(),
        soft_deleted = stats.soft_deleted,
        hard_deleted = stats.hard_deleted,
        links_removed = stats.links_removed,
        references_cleared = stats.references_cleared
    );
    Ok(stats)
}
