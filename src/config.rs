use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use crate::schema::DeletionPolicy;

pub const DEFAULT_BATCH_SIZE: usize = 500;
const HARD_MAX_BATCH_SIZE: usize = 10_000;

pub const DB_PATH_ENV: &str = "SOFTCASCADE_DB";
pub const SCHEMA_PATH_ENV: &str = "SOFTCASCADE_SCHEMA";
pub const BATCH_SIZE_ENV: &str = "SOFTCASCADE_BATCH_SIZE";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectorConfig {
    /// Upper bound on primary keys bound into a single statement.
    pub batch_size: usize,
    /// Policy in force at the roots, before any model's own policy applies.
    pub default_policy: DeletionPolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            default_policy: DeletionPolicy::default(),
        }
    }
}

impl CollectorConfig {
    pub fn from_env() -> Self {
        let batch_size = env::var(BATCH_SIZE_ENV)
            .ok()
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .map(|value| value.min(HARD_MAX_BATCH_SIZE))
            .unwrap_or(DEFAULT_BATCH_SIZE);

        Self {
            batch_size,
            ..Self::default()
        }
    }
}

/// Per-run replacement policies for soft-deletable models.
///
/// Overrides for plain models are ignored: they cannot gain a deletion
/// timestamp by configuration.
#[derive(Debug, Clone, Default)]
pub struct PolicyOverrides {
    policies: HashMap<String, DeletionPolicy>,
}

impl PolicyOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, model: impl Into<String>, policy: DeletionPolicy) -> Self {
        self.policies.insert(model.into(), policy);
        self
    }

    pub fn get(&self, model: &str) -> Option<DeletionPolicy> {
        self.policies.get(model).copied()
    }
}

/// Locations used by the command line tool. Flags take precedence.
#[derive(Debug, Clone, Default)]
pub struct Settings {
    pub db_path: Option<PathBuf>,
    pub schema_path: Option<PathBuf>,
    pub collector: CollectorConfig,
}

impl Settings {
    pub fn from_env() -> Self {
        Self {
            db_path: env::var_os(DB_PATH_ENV).map(PathBuf::from),
            schema_path: env::var_os(SCHEMA_PATH_ENV).map(PathBuf::from),
            collector: CollectorConfig::from_env(),
        }
    }

    pub fn with_overrides(mut self, db_path: Option<PathBuf>, schema_path: Option<PathBuf>) -> Self {
        if db_path.is_some() {
            self.db_path = db_path;
        }
        if schema_path.is_some() {
            self.schema_path = schema_path;
        }
        self
    }
}
