//! Type table describing which records exist, how they reference each other,
//! and which of them carry a deletion timestamp.
//!
//! The table is built once at startup, either in code through [`SchemaDef`]
//! or from a JSON document, and is read-only afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

static IDENTIFIER_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier validation pattern to compile")
});

/// Table and column names are interpolated into SQL, so they must be plain identifiers.
pub fn is_identifier(value: &str) -> bool {
    IDENTIFIER_PATTERN.is_match(value)
}

/// Per-type soft-delete policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeletionPolicy {
    /// Cascade into records that reference this one.
    pub delete_related: bool,
    /// When a non-soft-deletable descendant must be either removed or left
    /// alone, leave it alone.
    pub safe_deletion: bool,
    /// Purge association rows even when the record is only soft-deleted.
    pub delete_batches: bool,
}

impl Default for DeletionPolicy {
    fn default() -> Self {
        Self {
            delete_related: true,
            safe_deletion: true,
            delete_batches: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "Option<DeletionPolicy>", into = "Option<DeletionPolicy>")]
pub enum Capability {
    SoftDeletable(DeletionPolicy),
    #[default]
    Plain,
}

impl Capability {
    pub fn policy(&self) -> Option<DeletionPolicy> {
        match self {
            Capability::SoftDeletable(policy) => Some(*policy),
            Capability::Plain => None,
        }
    }

    pub fn is_soft_deletable(&self) -> bool {
        matches!(self, Capability::SoftDeletable(_))
    }
}

impl From<Option<DeletionPolicy>> for Capability {
    fn from(value: Option<DeletionPolicy>) -> Self {
        value.map_or(Capability::Plain, Capability::SoftDeletable)
    }
}

impl From<Capability> for Option<DeletionPolicy> {
    fn from(value: Capability) -> Self {
        value.policy()
    }
}

fn default_pk_column() -> String {
    "id".to_string()
}

fn default_deleted_at_column() -> String {
    "deleted_at".to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelDef {
    pub name: String,
    pub table: String,
    #[serde(default = "default_pk_column")]
    pub pk_column: String,
    #[serde(default = "default_deleted_at_column")]
    pub deleted_at_column: String,
    /// `soft_delete` in JSON: absent for plain models, a policy object otherwise.
    #[serde(default, rename = "soft_delete")]
    pub capability: Capability,
    /// Generated link models never receive lifecycle signals.
    #[serde(default)]
    pub auto_created: bool,
}

impl ModelDef {
    pub fn plain(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            table: name.clone(),
            name,
            pk_column: default_pk_column(),
            deleted_at_column: default_deleted_at_column(),
            capability: Capability::Plain,
            auto_created: false,
        }
    }

    pub fn soft_deletable(name: impl Into<String>, policy: DeletionPolicy) -> Self {
        Self {
            capability: Capability::SoftDeletable(policy),
            ..Self::plain(name)
        }
    }

    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.table = table.into();
        self
    }

    pub fn is_soft_deletable(&self) -> bool {
        self.capability.is_soft_deletable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    Cascade,
    /// Block deletion of the target while any row still references it.
    Protect,
    SetNull,
    DoNothing,
}

/// A foreign key on `model.column` pointing at `target`'s primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relation {
    pub model: String,
    pub column: String,
    pub target: String,
    #[serde(default = "default_on_delete")]
    pub on_delete: OnDelete,
}

fn default_on_delete() -> OnDelete {
    OnDelete::Cascade
}

impl Relation {
    pub fn new(
        model: impl Into<String>,
        column: impl Into<String>,
        target: impl Into<String>,
        on_delete: OnDelete,
    ) -> Self {
        Self {
            model: model.into(),
            column: column.into(),
            target: target.into(),
            on_delete,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSide {
    pub model: String,
    pub column: String,
}

/// Many-to-many link table. Its rows have no lifecycle of their own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Association {
    pub table: String,
    pub left: LinkSide,
    pub right: LinkSide,
}

impl Association {
    pub fn new(
        table: impl Into<String>,
        left: (impl Into<String>, impl Into<String>),
        right: (impl Into<String>, impl Into<String>),
    ) -> Self {
        Self {
            table: table.into(),
            left: LinkSide {
                model: left.0.into(),
                column: left.1.into(),
            },
            right: LinkSide {
                model: right.0.into(),
                column: right.1.into(),
            },
        }
    }

    fn sides(&self) -> [&LinkSide; 2] {
        [&self.left, &self.right]
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaDef {
    pub models: Vec<ModelDef>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub associations: Vec<Association>,
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("model {0} registered twice")]
    DuplicateModel(String),
    #[error("invalid identifier for {what}: {value:?}")]
    InvalidIdentifier { what: &'static str, value: String },
    #[error("{context} references unknown model {name}")]
    UnknownModel { context: String, name: String },
    #[error("failed to read schema file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse schema json: {0}")]
    Parse(#[from] serde_json::Error),
}

/// A column in an association table pointing at one model.
#[derive(Debug, Clone, Copy)]
pub struct LinkRef<'a> {
    pub table: &'a str,
    pub column: &'a str,
}

#[derive(Debug, Clone)]
pub struct Schema {
    models: BTreeMap<String, ModelDef>,
    relations: Vec<Relation>,
    associations: Vec<Association>,
}

impl Schema {
    pub fn from_def(def: SchemaDef) -> Result<Self, SchemaError> {
        let mut models = BTreeMap::new();
        for model in def.models {
            ensure_identifier("table", &model.table)?;
            ensure_identifier("primary key column", &model.pk_column)?;
            ensure_identifier("deleted_at column", &model.deleted_at_column)?;
            if models.contains_key(&model.name) {
                return Err(SchemaError::DuplicateModel(model.name));
            }
            models.insert(model.name.clone(), model);
        }

        let known = |context: String, name: &str| -> Result<(), SchemaError> {
            if models.contains_key(name) {
                Ok(())
            } else {
                Err(SchemaError::UnknownModel {
                    context,
                    name: name.to_string(),
                })
            }
        };

        for relation in &def.relations {
            let context = format!("relation {}.{}", relation.model, relation.column);
            known(context.clone(), &relation.model)?;
            known(context, &relation.target)?;
            ensure_identifier("relation column", &relation.column)?;
        }

        for association in &def.associations {
            ensure_identifier("association table", &association.table)?;
            for side in association.sides() {
                known(format!("association {}", association.table), &side.model)?;
                ensure_identifier("association column", &side.column)?;
            }
        }

        Ok(Self {
            models,
            relations: def.relations,
            associations: def.associations,
        })
    }

    pub fn from_json(source: &str) -> Result<Self, SchemaError> {
        let def: SchemaDef = serde_json::from_str(source)?;
        Self::from_def(def)
    }

    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let source = fs::read_to_string(path).map_err(|source| SchemaError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&source)
    }

    pub fn model(&self, name: &str) -> Option<&ModelDef> {
        self.models.get(name)
    }

    pub fn soft_deletable_models(&self) -> impl Iterator<Item = &ModelDef> {
        self.models.values().filter(|model| model.is_soft_deletable())
    }

    /// Relations whose foreign key points at `target`, in declaration order.
    pub fn relations_to<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a Relation> + 'a {
        self.relations
            .iter()
            .filter(move |relation| relation.target == target)
    }

    /// Link-table columns pointing at `model`.
    pub fn links_for<'a>(&'a self, model: &'a str) -> impl Iterator<Item = LinkRef<'a>> + 'a {
        self.associations.iter().flat_map(move |association| {
            association
                .sides()
                .into_iter()
                .filter(move |side| side.model == model)
                .map(move |side| LinkRef {
                    table: association.table.as_str(),
                    column: side.column.as_str(),
                })
        })
    }
}

fn ensure_identifier(what: &'static str, value: &str) -> Result<(), SchemaError> {
    if is_identifier(value) {
        Ok(())
    } else {
        Err(SchemaError::InvalidIdentifier {
            what,
            value: value.to_string(),
        })
    }
}
