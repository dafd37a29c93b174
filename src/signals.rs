use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::collector::DeletionMethod;
use crate::record::RecordKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreDelete,
    PostDelete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signal {
    pub phase: Phase,
    pub key: RecordKey,
    pub method: DeletionMethod,
}

pub type Receiver = Arc<dyn Fn(&Signal) + Send + Sync>;

/// Lifecycle notifications fired around a deletion batch.
///
/// Receivers run synchronously inside the mutation transaction, in
/// registration order.
#[derive(Clone, Default)]
pub struct SignalBus {
    receivers: Vec<Receiver>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect(&mut self, receiver: Receiver) -> &mut Self {
        self.receivers.push(receiver);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }

    pub(crate) fn send(&self, signal: &Signal) {
        for receiver in &self.receivers {
            receiver(signal);
        }
    }
}

impl fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalBus")
            .field("receivers", &self.receivers.len())
            .finish()
    }
}
