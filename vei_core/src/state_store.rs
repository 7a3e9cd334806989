//! State store: entity documents, append-only operation log, receipts,
//! snapshots and diffs.
//!
//! Entities are JSON documents addressed by `(family, id)`. Families are
//! held behind `Arc`, so a snapshot is a cheap clone that keeps sharing
//! every family the router has not touched since.
//!
//! Every `apply` is atomic: the operation runs against a working copy of
//! the head and only replaces it when all preconditions and mutations
//! succeed. `revision` counts successful applies since the last reset.

use crate::canonical::digest;
use crate::error::{KernelError, StoreError};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use vei_env::LogicalTime;

/// One entity family: id -> document.
pub type Family = BTreeMap<String, Value>;

/// All families.
pub type Entities = BTreeMap<String, Arc<Family>>;

/// Address of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRef {
    pub family: String,
    pub id: String,
}

/// A single entity mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Mutation {
    /// Create or replace a document
    Put { family: String, id: String, value: Value },

    /// Shallow-merge fields into an existing object
    Merge {
        family: String,
        id: String,
        fields: Map<String, Value>,
    },

    /// Append to an array field of an existing object (created if absent)
    Push {
        family: String,
        id: String,
        field: String,
        item: Value,
    },
}

impl Mutation {
    /// Family and id this mutation targets.
    pub fn target(&self) -> (&str, &str) {
        match self {
            Mutation::Put { family, id, .. }
            | Mutation::Merge { family, id, .. }
            | Mutation::Push { family, id, .. } => (family, id),
        }
    }

    /// Applies this mutation to a single document (`None` = absent).
    pub(crate) fn apply_to(&self, current: Option<Value>) -> Result<Value, StoreError> {
        let (family, id) = self.target();
        match self {
            Mutation::Put { value, .. } => Ok(value.clone()),
            Mutation::Merge { fields, .. } => {
                let mut doc = current.ok_or_else(|| StoreError::MissingEntity {
                    family: family.to_string(),
                    id: id.to_string(),
                })?;
                let obj = doc.as_object_mut().ok_or_else(|| StoreError::NotAnObject {
                    family: family.to_string(),
                    id: id.to_string(),
                })?;
                for (key, value) in fields {
                    obj.insert(key.clone(), value.clone());
                }
                Ok(doc)
            }
            Mutation::Push { field, item, .. } => {
                let mut doc = current.ok_or_else(|| StoreError::MissingEntity {
                    family: family.to_string(),
                    id: id.to_string(),
                })?;
                let obj = doc.as_object_mut().ok_or_else(|| StoreError::NotAnObject {
                    family: family.to_string(),
                    id: id.to_string(),
                })?;
                let slot = obj
                    .entry(field.clone())
                    .or_insert_with(|| Value::Array(Vec::new()));
                match slot {
                    Value::Array(items) => items.push(item.clone()),
                    _ => {
                        return Err(StoreError::NotAnArray {
                            family: family.to_string(),
                            id: id.to_string(),
                            field: field.clone(),
                        })
                    }
                }
                Ok(doc)
            }
        }
    }
}

/// A tagged batch of mutations applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Domain label, e.g. `slack.send_message` or `mail.deliver`
    pub kind: String,

    /// Entities that must exist before any mutation runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<EntityRef>,

    pub mutations: Vec<Mutation>,
}

impl Operation {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            requires: Vec::new(),
            mutations: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }
}

/// One entity change produced by an apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub family: String,
    pub id: String,
    pub before: Option<Value>,
    pub after: Value,
}

/// A log entry: one successful apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedOperation {
    pub revision: u64,
    pub time_ms: LogicalTime,
    pub kind: String,
    pub changes: Vec<Change>,
}

/// Audit record of one successful tool call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub sequence_no: u64,
    pub time_ms: LogicalTime,
    pub tool: String,
    pub args_digest: String,
    pub response_digest: String,
    pub state_revision: u64,
}

/// Immutable point-in-time view of the store.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub revision: u64,
    pub time_ms: LogicalTime,
    pub entities: Entities,
}

impl Snapshot {
    pub fn get(&self, family: &str, id: &str) -> Option<&Value> {
        self.entities.get(family).and_then(|f| f.get(id))
    }

    pub fn family(&self, family: &str) -> Option<&Family> {
        self.entities.get(family).map(|f| f.as_ref())
    }

    /// Total number of entities across families.
    pub fn entity_count(&self) -> usize {
        self.entities.values().map(|f| f.len()).sum()
    }
}

/// A change tagged with the revision that produced it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RevisionChange {
    pub revision: u64,
    pub kind: String,
    pub family: String,
    pub id: String,
    pub before: Option<Value>,
    pub after: Value,
}

/// Structured change list between two revisions `(from, to]`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StateDiff {
    pub from_revision: u64,
    pub to_revision: u64,
    pub changes: Vec<RevisionChange>,
}

impl StateDiff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Changes touching one family.
    pub fn in_family<'a>(&'a self, family: &'a str) -> impl Iterator<Item = &'a RevisionChange> + 'a {
        self.changes.iter().filter(move |c| c.family == family)
    }
}

/// The session's state store.
#[derive(Debug, Default)]
pub struct StateStore {
    /// Entities at revision 0
    base: Entities,

    /// Entities at the current revision
    head: Entities,

    revision: u64,
    head_time_ms: LogicalTime,
    log: Vec<AppliedOperation>,
    receipts: Vec<Receipt>,
}

fn write_entity(entities: &mut Entities, family: &str, id: &str, value: Value) -> Option<Value> {
    let fam = entities.entry(family.to_string()).or_default();
    Arc::make_mut(fam).insert(id.to_string(), value)
}

fn read_entity<'a>(entities: &'a Entities, family: &str, id: &str) -> Option<&'a Value> {
    entities.get(family).and_then(|f| f.get(id))
}

impl StateStore {
    /// Creates an empty store at revision 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs initial entities. Only valid before the first apply.
    pub fn seed(&mut self, mutations: &[Mutation]) -> Result<(), StoreError> {
        if self.revision != 0 {
            return Err(StoreError::SeedAfterApply(self.revision));
        }
        let mut working = self.head.clone();
        for mutation in mutations {
            let (family, id) = mutation.target();
            let current = read_entity(&working, family, id).cloned();
            let next = mutation.apply_to(current)?;
            write_entity(&mut working, family, id, next);
        }
        self.base = working.clone();
        self.head = working;
        Ok(())
    }

    /// Applies an operation atomically and returns the new revision.
    pub fn apply(&mut self, op: &Operation, time_ms: LogicalTime) -> Result<u64, StoreError> {
        for req in &op.requires {
            if read_entity(&self.head, &req.family, &req.id).is_none() {
                return Err(StoreError::MissingEntity {
                    family: req.family.clone(),
                    id: req.id.clone(),
                });
            }
        }

        // Cloning the map clones Arc pointers only; touched families are
        // copied on write.
        let mut working = self.head.clone();
        let mut changes = Vec::with_capacity(op.mutations.len());
        for mutation in &op.mutations {
            let (family, id) = mutation.target();
            let before = read_entity(&working, family, id).cloned();
            let after = mutation.apply_to(before.clone())?;
            write_entity(&mut working, family, id, after.clone());
            changes.push(Change {
                family: family.to_string(),
                id: id.to_string(),
                before,
                after,
            });
        }

        self.head = working;
        self.revision += 1;
        self.head_time_ms = time_ms;
        self.log.push(AppliedOperation {
            revision: self.revision,
            time_ms,
            kind: op.kind.clone(),
            changes,
        });
        Ok(self.revision)
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Reads one entity at head.
    pub fn read(&self, family: &str, id: &str) -> Option<&Value> {
        read_entity(&self.head, family, id)
    }

    /// Reads one family at head.
    pub fn family(&self, family: &str) -> Option<&Family> {
        self.head.get(family).map(|f| f.as_ref())
    }

    /// Number of entities in a family.
    pub fn count(&self, family: &str) -> usize {
        self.head.get(family).map_or(0, |f| f.len())
    }

    /// Snapshot of the head revision.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            revision: self.revision,
            time_ms: self.head_time_ms,
            entities: self.head.clone(),
        }
    }

    /// Snapshot at a past revision, rebuilt from the base and the log.
    pub fn snapshot_at(&self, revision: u64) -> Result<Snapshot, KernelError> {
        if revision > self.revision {
            return Err(KernelError::RevisionOutOfRange {
                requested: revision,
                head: self.revision,
            });
        }
        if revision == self.revision {
            return Ok(self.snapshot());
        }
        let mut entities = self.base.clone();
        let mut time_ms = 0;
        for applied in self.log.iter().take(revision as usize) {
            for change in &applied.changes {
                write_entity(&mut entities, &change.family, &change.id, change.after.clone());
            }
            time_ms = applied.time_ms;
        }
        Ok(Snapshot {
            revision,
            time_ms,
            entities,
        })
    }

    /// Changes in `(from, to]`.
    pub fn diff(&self, from: u64, to: u64) -> Result<StateDiff, KernelError> {
        if to > self.revision {
            return Err(KernelError::RevisionOutOfRange {
                requested: to,
                head: self.revision,
            });
        }
        if from > to {
            return Err(KernelError::invalid_argument(format!(
                "diff range is reversed: {}..{}",
                from, to
            )));
        }
        let changes = self.log[from as usize..to as usize]
            .iter()
            .flat_map(|applied| {
                applied.changes.iter().map(move |c| RevisionChange {
                    revision: applied.revision,
                    kind: applied.kind.clone(),
                    family: c.family.clone(),
                    id: c.id.clone(),
                    before: c.before.clone(),
                    after: c.after.clone(),
                })
            })
            .collect();
        Ok(StateDiff {
            from_revision: from,
            to_revision: to,
            changes,
        })
    }

    /// Operation log since reset.
    pub fn log(&self) -> &[AppliedOperation] {
        &self.log
    }

    /// Appends a receipt for a completed tool call.
    pub fn append_receipt(
        &mut self,
        time_ms: LogicalTime,
        tool: &str,
        args: &Value,
        response: &Value,
    ) -> Receipt {
        let receipt = Receipt {
            sequence_no: self.receipts.len() as u64 + 1,
            time_ms,
            tool: tool.to_string(),
            args_digest: digest(args),
            response_digest: digest(response),
            state_revision: self.revision,
        };
        self.receipts.push(receipt.clone());
        receipt
    }

    pub fn receipts(&self) -> &[Receipt] {
        &self.receipts
    }

    /// Last `n` receipts, oldest first.
    pub fn receipt_tail(&self, n: usize) -> Vec<Receipt> {
        let start = self.receipts.len().saturating_sub(n);
        self.receipts[start..].to_vec()
    }
}
