//! Subscriber identity and interest sets

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::TaskId;

/// Identity of a subscriber
///
/// Minted by the subscription-serving layer (one per client session or per
/// durable consumer, at its discretion); the delivery core treats it as an
/// opaque key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(String);

impl SubscriberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubscriberId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SubscriberId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which partitions a subscriber wants delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Interest {
    /// Every partition, including ones created after subscribing
    All,

    /// A fixed set of tasks
    Tasks { tasks: HashSet<TaskId> },
}

impl Interest {
    /// Interest in a specific set of tasks
    pub fn tasks(tasks: impl IntoIterator<Item = TaskId>) -> Self {
        Self::Tasks {
            tasks: tasks.into_iter().collect(),
        }
    }

    /// Does this interest cover the given partition?
    pub fn matches(&self, task_id: &TaskId) -> bool {
        match self {
            Self::All => true,
            Self::Tasks { tasks } => tasks.contains(task_id),
        }
    }

    /// Tasks named explicitly by this interest (empty for `All`)
    pub fn named_tasks(&self) -> impl Iterator<Item = &TaskId> {
        match self {
            Self::All => None,
            Self::Tasks { tasks } => Some(tasks.iter()),
        }
        .into_iter()
        .flatten()
    }
}
