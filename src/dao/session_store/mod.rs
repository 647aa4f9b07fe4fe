pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use futures::{future::BoxFuture, stream::BoxStream};

use crate::dao::{
    models::{Batch, Document, Fields, Query, Update},
    storage::StoreResult,
};

/// Shared document store both peers of a duel read and write.
///
/// Documents live in a single session collection. Each document may own named
/// sub-collections (the per-round moves). Every operation is independent; grouped writes
/// go through [`SharedStore::commit`].
pub trait SharedStore: Send + Sync {
    /// Fetch a document snapshot, `None` when it does not exist.
    fn get(&self, id: &str) -> BoxFuture<'static, StoreResult<Option<Document>>>;

    /// Create or replace a whole document. Server timestamps in `update` are resolved by
    /// the store.
    fn set(&self, id: &str, update: Update) -> BoxFuture<'static, StoreResult<()>>;

    /// Merge-update an existing document, failing with `NotFound` when absent and
    /// `PreconditionFailed` when a precondition does not hold.
    fn merge(&self, id: &str, update: Update) -> BoxFuture<'static, StoreResult<()>>;

    /// Delete a document and its sub-collections. Returns whether it existed.
    fn delete(&self, id: &str) -> BoxFuture<'static, StoreResult<bool>>;

    /// Run an equality query over the session collection.
    fn query(&self, query: Query) -> BoxFuture<'static, StoreResult<Vec<Document>>>;

    /// Create or replace a document in a sub-collection of `id`.
    fn set_child(
        &self,
        id: &str,
        collection: &str,
        child_id: &str,
        update: Update,
    ) -> BoxFuture<'static, StoreResult<()>>;

    /// List every document of a sub-collection of `id`.
    fn list_children(
        &self,
        id: &str,
        collection: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Document>>>;

    /// Commit a batch: all preconditions are checked first, then every write applies.
    fn commit(&self, batch: Batch) -> BoxFuture<'static, StoreResult<()>>;

    /// Observe a document. The current snapshot is emitted first, then every change;
    /// `None` means the document does not exist (or was deleted).
    fn subscribe(&self, id: &str) -> BoxStream<'static, StoreResult<Option<Document>>>;
}

/// Shorthand used by tests and by the in-memory store to create seeded documents.
pub fn fields_from<I, K, V>(entries: I) -> Fields
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<crate::dao::models::FieldValue>,
{
    entries
        .into_iter()
        .map(|(key, value)| (key.into(), value.into()))
        .collect()
}
