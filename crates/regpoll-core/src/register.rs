use crate::error::CycleFailed;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Device address of a single register.
pub type RegisterKey = u16;

/// Raw device word as last read for a key.
pub type RegisterValue = u16;

/// Which register bank a coordinator polls. Global to one coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterSpace {
    /// Read-only input registers (function 0x04).
    #[default]
    Input,
    /// Read/write holding registers (function 0x03).
    Holding,
}

impl RegisterSpace {
    pub fn as_str(&self) -> &'static str {
        match self {
            RegisterSpace::Input => "input",
            RegisterSpace::Holding => "holding",
        }
    }
}

/// Register values produced by one completed cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Snapshot {
    values: BTreeMap<RegisterKey, RegisterValue>,
}

impl Snapshot {
    pub fn get(&self, key: RegisterKey) -> Option<RegisterValue> {
        self.values.get(&key).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = RegisterKey> + '_ {
        self.values.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (RegisterKey, RegisterValue)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }

    /// True when the snapshot holds exactly the given keys.
    pub fn covers_exactly(&self, keys: &[RegisterKey]) -> bool {
        self.values.len() == keys.len() && keys.iter().all(|k| self.values.contains_key(k))
    }
}

impl FromIterator<(RegisterKey, RegisterValue)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (RegisterKey, RegisterValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

/// Result of one poll cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Every configured register was read fresh.
    Success { snapshot: Snapshot },
    /// Full coverage, but `stale` keys were served from earlier data.
    Partial {
        snapshot: Snapshot,
        stale: BTreeSet<RegisterKey>,
    },
    /// Nothing usable could be produced.
    Failed(CycleFailed),
}

impl CycleOutcome {
    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            CycleOutcome::Success { snapshot } | CycleOutcome::Partial { snapshot, .. } => {
                Some(snapshot)
            }
            CycleOutcome::Failed(_) => None,
        }
    }

    pub fn is_stale(&self, key: RegisterKey) -> bool {
        match self {
            CycleOutcome::Success { .. } => false,
            CycleOutcome::Partial { stale, .. } => stale.contains(&key),
            CycleOutcome::Failed(_) => true,
        }
    }

    pub fn status(&self) -> &'static str {
        match self {
            CycleOutcome::Success { .. } => "success",
            CycleOutcome::Partial { .. } => "partial",
            CycleOutcome::Failed(_) => "failed",
        }
    }
}

/// A pending write, not persisted anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteRequest {
    pub key: RegisterKey,
    pub value: RegisterValue,
}
