use crate::types::{ChangeId, Revision};
use crate::SchemaError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStatus {
    /// Requested, or queued behind the environment's gate.
    Pending,
    Planned,
    PlanFailed,
    Applied,
    ApplyFailed,
    /// The source tree could not be cloned or checked out; the engine never ran.
    SourceUnavailable,
}

impl ChangeStatus {
    pub fn is_failure(self) -> bool {
        matches!(
            self,
            ChangeStatus::PlanFailed | ChangeStatus::ApplyFailed | ChangeStatus::SourceUnavailable
        )
    }
}

impl std::fmt::Display for ChangeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeStatus::Pending => write!(f, "pending"),
            ChangeStatus::Planned => write!(f, "planned"),
            ChangeStatus::PlanFailed => write!(f, "plan_failed"),
            ChangeStatus::Applied => write!(f, "applied"),
            ChangeStatus::ApplyFailed => write!(f, "apply_failed"),
            ChangeStatus::SourceUnavailable => write!(f, "source_unavailable"),
        }
    }
}

/// One requested plan or apply against a specific source revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Change {
    /// Zero until the change log assigns an id on append.
    #[serde(default)]
    pub id: ChangeId,
    pub revision: Revision,
    pub status: ChangeStatus,
    #[serde(default)]
    pub plan_output: String,
    /// Provisioning state snapshot, captured after an apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl Change {
    pub fn pending(revision: impl Into<Revision>) -> Self {
        let now = chrono::Utc::now().to_rfc3339();
        Self {
            id: ChangeId::default(),
            revision: revision.into(),
            status: ChangeStatus::Pending,
            plan_output: String::new(),
            state: None,
            failure: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().to_rfc3339();
    }
}

/// Ordered, id-keyed change history of an environment.
///
/// Ids are monotonic, so key order is insertion order. Serialized as a plain
/// JSON array of changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<Change>", into = "Vec<Change>")]
pub struct ChangeLog {
    entries: BTreeMap<ChangeId, Change>,
    next_id: u64,
}

impl ChangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a change, assigning it the next id. Any id already on the
    /// change is overwritten.
    pub fn append(&mut self, mut change: Change) -> ChangeId {
        self.next_id = self.next_id.max(1);
        let id = ChangeId::new(self.next_id);
        self.next_id += 1;
        change.id = id;
        self.entries.insert(id, change);
        id
    }

    pub fn get(&self, id: ChangeId) -> Option<&Change> {
        self.entries.get(&id)
    }

    pub fn contains(&self, id: ChangeId) -> bool {
        self.entries.contains_key(&id)
    }

    /// The most recently appended change.
    pub fn latest(&self) -> Option<&Change> {
        self.entries.values().next_back()
    }

    /// Replace the stored change carrying the same id.
    pub fn update(&mut self, change: Change) -> Result<(), SchemaError> {
        match self.entries.get_mut(&change.id) {
            Some(slot) => {
                *slot = change;
                Ok(())
            }
            None => Err(SchemaError::UnknownChange(change.id)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &Change> {
        self.entries.values()
    }
}

impl From<Vec<Change>> for ChangeLog {
    fn from(changes: Vec<Change>) -> Self {
        let mut log = ChangeLog::new();
        log.next_id = changes.iter().map(|c| c.id.get()).max().unwrap_or(0) + 1;
        for change in changes {
            if change.id.get() == 0 {
                log.append(change);
            } else {
                log.entries.insert(change.id, change);
            }
        }
        log
    }
}

impl From<ChangeLog> for Vec<Change> {
    fn from(log: ChangeLog) -> Self {
        log.entries.into_values().collect()
    }
}
