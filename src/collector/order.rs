use std::collections::{BTreeMap, BTreeSet};

use tracing::warn;

/// Orders models so that every model comes after the models whose rows
/// reference it, letting immediate foreign-key checks pass while rows are
/// removed.
///
/// `dependencies[m]` lists the models that must be processed before `m`.
/// Models are taken in name order within a pass; if a reference cycle
/// blocks progress the remaining models are appended in name order.
pub fn deletion_order<'a, I>(models: I, dependencies: &BTreeMap<String, BTreeSet<String>>) -> Vec<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut pending: BTreeSet<&str> = models.into_iter().map(String::as_str).collect();
    let mut ordered: Vec<String> = Vec::with_capacity(pending.len());

    while !pending.is_empty() {
        let ready: Vec<&str> = pending
            .iter()
            .copied()
            .filter(|model| {
                dependencies.get(*model).map_or(true, |deps| {
                    deps.iter()
                        .all(|dep| dep.as_str() == *model || !pending.contains(dep.as_str()))
                })
            })
            .collect();

        if ready.is_empty() {
            warn!(
                target: "softcascade",
                event = "deletion_order_cycle",
                models = ?pending
            );
            ordered.extend(pending.iter().map(|model| model.to_string()));
            break;
        }

        for model in ready {
            pending.remove(model);
            ordered.push(model.to_string());
        }
    }

    ordered
}
