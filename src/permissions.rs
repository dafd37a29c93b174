use std::fmt;

use serde::Serialize;

use crate::schema::ModelDef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Delete,
    Undelete,
    Purge,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Action::Delete => "delete",
            Action::Undelete => "undelete",
            Action::Purge => "purge",
        };
        f.write_str(name)
    }
}

/// Access-control hook consulted before any statement runs.
pub trait PermissionGate: Send + Sync {
    fn allows(&self, action: Action, model: &ModelDef) -> bool;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl PermissionGate for AllowAll {
    fn allows(&self, _action: Action, _model: &ModelDef) -> bool {
        true
    }
}

impl<F> PermissionGate for F
where
    F: Fn(Action, &ModelDef) -> bool + Send + Sync,
{
    fn allows(&self, action: Action, model: &ModelDef) -> bool {
        self(action, model)
    }
}
