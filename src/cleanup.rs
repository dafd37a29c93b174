//! Physical removal of rows that were already soft-deleted.

use serde::Serialize;
use tracing::info;

use crate::collector::{Collector, DeleteError, MutationStats};
use crate::schema::Schema;

#[derive(Debug, Clone, Serialize)]
pub struct ModelCleanup {
    pub model: String,
    pub stats: MutationStats,
}

/// Resolves the models a cleanup run touches, in the order given (or name
/// order for `all`). Plain models are dropped since they never hold
/// soft-deleted rows.
pub fn select_models(
    schema: &Schema,
    models: &[String],
    exclude: &[String],
    all: bool,
) -> Result<Vec<String>, DeleteError> {
    for name in models.iter().chain(exclude) {
        if schema.model(name).is_none() {
            return Err(DeleteError::UnknownModel(name.clone()));
        }
    }

    let candidates: Vec<&str> = if !models.is_empty() {
        models.iter().map(String::as_str).collect()
    } else if all {
        schema
            .soft_deletable_models()
            .map(|def| def.name.as_str())
            .collect()
    } else {
        return Err(DeleteError::invalid(
            "name at least one model, or pass --all",
        ));
    };

    let mut selected: Vec<String> = Vec::new();
    for name in candidates {
        if exclude.iter().any(|excluded| excluded == name) || selected.iter().any(|s| s == name) {
            continue;
        }
        if schema.model(name).is_some_and(|def| def.is_soft_deletable()) {
            selected.push(name.to_string());
        }
    }
    Ok(selected)
}

/// Purges the soft-deleted rows of each model, cascade included. Each model
/// runs in its own transaction.
pub async fn purge_deleted(
    collector: &Collector,
    models: &[String],
) -> Result<Vec<ModelCleanup>, DeleteError> {
    let mut done = Vec::with_capacity(models.len());
    for model in models {
        let report = collector.objects(model)?.only_deleted().remove().await?;
        info!(
            target: "softcascade",
            event = "cleanup_model",
            model = model.as_str(),
            hard_deleted = report.stats.hard_deleted
        );
        done.push(ModelCleanup {
            model: model.clone(),
            stats: report.stats,
        });
    }
    Ok(done)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{DeletionPolicy, ModelDef, SchemaDef};

    fn schema() -> Schema {
        Schema::from_def(SchemaDef {
            models: vec![
                ModelDef::soft_deletable("post", DeletionPolicy::default()),
                ModelDef::soft_deletable("author", DeletionPolicy::default()),
                ModelDef::plain("tag"),
            ],
            relations: vec![],
            associations: vec![],
        })
        .unwrap()
    }

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn all_selects_soft_deletable_models_minus_excludes() {
        let selected = select_models(&schema(), &[], &names(&["post"]), true).unwrap();
        assert_eq!(selected, names(&["author"]));
    }

    #[test]
    fn explicit_selection_skips_plain_models() {
        let selected = select_models(&schema(), &names(&["tag", "post", "post"]), &[], false).unwrap();
        assert_eq!(selected, names(&["post"]));
    }

    #[test]
    fn empty_selection_without_all_is_rejected() {
        let err = select_models(&schema(), &[], &[], false).unwrap_err();
        assert!(matches!(err, DeleteError::InvalidOperation(_)));
    }

    #[test]
    fn unknown_exclude_is_rejected() {
        let err = select_models(&schema(), &[], &names(&["ghost"]), true).unwrap_err();
        assert!(matches!(err, DeleteError::UnknownModel(name) if name == "ghost"));
    }
}
