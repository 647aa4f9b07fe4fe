//! Schemaless wire types exchanged with the shared store.

use std::cmp::Ordering;

use indexmap::IndexMap;

use crate::clock::Timestamp;

/// Flat field map of a stored document.
pub type Fields = IndexMap<String, FieldValue>;

/// Typed value of a single document field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    /// Boolean flag.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// UTF-8 string.
    Str(String),
    /// Server-assigned or client-provided instant.
    Timestamp(Timestamp),
}

impl FieldValue {
    /// Borrow the value as a boolean.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    /// Borrow the value as an integer.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            FieldValue::Int(value) => Some(*value),
            _ => None,
        }
    }

    /// Borrow the value as a string slice.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(value) => Some(value),
            _ => None,
        }
    }

    /// Borrow the value as a timestamp.
    pub fn as_timestamp(&self) -> Option<Timestamp> {
        match self {
            FieldValue::Timestamp(value) => Some(*value),
            _ => None,
        }
    }

    /// Order two values of the same kind; mixed kinds are unordered.
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Bool(a), FieldValue::Bool(b)) => Some(a.cmp(b)),
            (FieldValue::Int(a), FieldValue::Int(b)) => Some(a.cmp(b)),
            (FieldValue::Str(a), FieldValue::Str(b)) => Some(a.cmp(b)),
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        FieldValue::Bool(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        FieldValue::Int(value)
    }
}

impl From<u32> for FieldValue {
    fn from(value: u32) -> Self {
        FieldValue::Int(i64::from(value))
    }
}

impl From<u8> for FieldValue {
    fn from(value: u8) -> Self {
        FieldValue::Int(i64::from(value))
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Str(value.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Str(value)
    }
}

impl From<Timestamp> for FieldValue {
    fn from(value: Timestamp) -> Self {
        FieldValue::Timestamp(value)
    }
}

/// Snapshot of a stored document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    id: String,
    fields: Fields,
}

impl Document {
    /// Wrap a field map under its document identifier.
    pub fn new(id: impl Into<String>, fields: Fields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }

    /// Document identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Look up a single field.
    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.fields.get(key)
    }

    /// All fields in insertion order.
    pub fn fields(&self) -> &Fields {
        &self.fields
    }
}

/// Mutation applied to a single field by an [`Update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldOp {
    /// Overwrite the field.
    Set(FieldValue),
    /// Remove the field.
    Delete,
    /// Add to an integer field, treating a missing or non-integer field as zero.
    Increment(i64),
    /// Replace with the store's current time.
    ServerTimestamp,
}

/// Condition a field must satisfy for an [`Update`] to apply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Field is present and equal to the value.
    Equals(FieldValue),
    /// Field is absent.
    Absent,
}

impl Precondition {
    /// Evaluate the condition against the current value of a field.
    pub fn holds(&self, current: Option<&FieldValue>) -> bool {
        match self {
            Precondition::Equals(expected) => current == Some(expected),
            Precondition::Absent => current.is_none(),
        }
    }
}

/// Merge-update description: field operations plus optional preconditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Update {
    ops: IndexMap<String, FieldOp>,
    preconditions: Vec<(String, Precondition)>,
}

impl Update {
    /// Empty update.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite `key` with `value`.
    pub fn set(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.ops.insert(key.into(), FieldOp::Set(value.into()));
        self
    }

    /// Remove `key`.
    pub fn delete(mut self, key: impl Into<String>) -> Self {
        self.ops.insert(key.into(), FieldOp::Delete);
        self
    }

    /// Atomically add `delta` to `key`.
    pub fn increment(mut self, key: impl Into<String>, delta: i64) -> Self {
        self.ops.insert(key.into(), FieldOp::Increment(delta));
        self
    }

    /// Stamp `key` with the store's time.
    pub fn server_timestamp(mut self, key: impl Into<String>) -> Self {
        self.ops.insert(key.into(), FieldOp::ServerTimestamp);
        self
    }

    /// Only apply when `key` currently equals `value`.
    pub fn require_equals(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.preconditions
            .push((key.into(), Precondition::Equals(value.into())));
        self
    }

    /// Only apply when `key` is currently absent.
    pub fn require_absent(mut self, key: impl Into<String>) -> Self {
        self.preconditions.push((key.into(), Precondition::Absent));
        self
    }

    /// Field operations in insertion order.
    pub fn ops(&self) -> &IndexMap<String, FieldOp> {
        &self.ops
    }

    /// Attached preconditions.
    pub fn preconditions(&self) -> &[(String, Precondition)] {
        &self.preconditions
    }

    /// Whether the update carries no field operation.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Return the first field whose precondition does not hold.
    pub fn failed_precondition(&self, fields: &Fields) -> Option<&str> {
        self.preconditions
            .iter()
            .find(|(key, condition)| !condition.holds(fields.get(key)))
            .map(|(key, _)| key.as_str())
    }

    /// Apply every operation to `fields`, resolving server timestamps to `now`.
    pub fn apply_to(&self, fields: &mut Fields, now: Timestamp) {
        for (key, op) in &self.ops {
            match op {
                FieldOp::Set(value) => {
                    fields.insert(key.clone(), value.clone());
                }
                FieldOp::Delete => {
                    fields.shift_remove(key);
                }
                FieldOp::Increment(delta) => {
                    let current = fields.get(key).and_then(FieldValue::as_int).unwrap_or(0);
                    fields.insert(key.clone(), FieldValue::Int(current + delta));
                }
                FieldOp::ServerTimestamp => {
                    fields.insert(key.clone(), FieldValue::Timestamp(now));
                }
            }
        }
    }
}

/// Sort direction of a [`Query`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Smallest first.
    Ascending,
    /// Largest first.
    Descending,
}

/// Equality-filtered query over the session collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Query {
    filters: Vec<(String, FieldValue)>,
    order_by: Option<(String, SortOrder)>,
}

impl Query {
    /// Query matching every document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `key == value`.
    pub fn where_eq(mut self, key: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.filters.push((key.into(), value.into()));
        self
    }

    /// Order results by `key`; documents without the field are excluded.
    pub fn order_by(mut self, key: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((key.into(), order));
        self
    }

    /// Equality filters.
    pub fn filters(&self) -> &[(String, FieldValue)] {
        &self.filters
    }

    /// Requested ordering.
    pub fn ordering(&self) -> Option<(&str, SortOrder)> {
        self.order_by
            .as_ref()
            .map(|(key, order)| (key.as_str(), *order))
    }

    /// Whether `fields` satisfies every filter and carries the ordering field.
    pub fn matches(&self, fields: &Fields) -> bool {
        let filters_hold = self
            .filters
            .iter()
            .all(|(key, expected)| fields.get(key) == Some(expected));
        let has_order_field = self
            .order_by
            .as_ref()
            .is_none_or(|(key, _)| fields.contains_key(key));
        filters_hold && has_order_field
    }

    /// Sort matched documents in place according to the ordering clause.
    pub fn sort(&self, documents: &mut [Document]) {
        let Some((key, order)) = self.ordering() else {
            return;
        };
        documents.sort_by(|left, right| {
            let ordering = match (left.get(key), right.get(key)) {
                (Some(a), Some(b)) => a.compare(b).unwrap_or(Ordering::Equal),
                _ => Ordering::Equal,
            };
            match order {
                SortOrder::Ascending => ordering,
                SortOrder::Descending => ordering.reverse(),
            }
        });
    }
}

/// Single write inside a [`Batch`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Merge-update a top-level document.
    Merge {
        /// Target document.
        id: String,
        /// Field operations and preconditions.
        update: Update,
    },
    /// Delete a document of a sub-collection.
    DeleteChild {
        /// Parent document.
        id: String,
        /// Sub-collection name.
        collection: String,
        /// Child document identifier.
        child_id: String,
    },
}

/// Group of writes committed together.
///
/// Preconditions of every merge are checked before anything is written; when one fails
/// the whole batch is rejected.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    ops: Vec<BatchOp>,
}

impl Batch {
    /// Empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a merge-update.
    pub fn merge(mut self, id: impl Into<String>, update: Update) -> Self {
        self.ops.push(BatchOp::Merge {
            id: id.into(),
            update,
        });
        self
    }

    /// Queue a sub-collection document deletion.
    pub fn delete_child(
        mut self,
        id: impl Into<String>,
        collection: impl Into<String>,
        child_id: impl Into<String>,
    ) -> Self {
        self.ops.push(BatchOp::DeleteChild {
            id: id.into(),
            collection: collection.into(),
            child_id: child_id.into(),
        });
        self
    }

    /// Queued operations.
    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    /// Consume the batch into its operations.
    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}
