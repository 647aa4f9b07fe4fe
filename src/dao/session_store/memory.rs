use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use futures::{StreamExt, future::BoxFuture, stream::BoxStream};
use indexmap::IndexMap;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::SharedStore;
use crate::{
    clock::{SharedClock, SystemClock},
    dao::{
        models::{Batch, BatchOp, Document, Fields, Query, Update},
        storage::{StoreError, StoreResult},
    },
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

type Children = IndexMap<String, IndexMap<String, Fields>>;

/// Snapshot of a document right after a write; `None` once deleted.
#[derive(Clone)]
struct Change {
    id: String,
    document: Option<Document>,
}

/// Process-local [`SharedStore`], used when no database is configured and by tests.
///
/// Every peer sharing a clone sees the same documents. Each write broadcasts the resulting
/// snapshot, so a slow subscriber still observes every intermediate value in order.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    documents: DashMap<String, Fields>,
    children: DashMap<String, Children>,
    changes: broadcast::Sender<Change>,
    clock: SharedClock,
    write_gate: Mutex<()>,
}

impl MemoryInner {
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_gate
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self, id: &str) -> Option<Document> {
        self.documents
            .get(id)
            .map(|entry| Document::new(id, entry.value().clone()))
    }

    fn notify(&self, id: &str) {
        let change = Change {
            id: id.to_owned(),
            document: self.snapshot(id),
        };
        // No receiver simply means nobody is watching.
        let _ = self.changes.send(change);
    }

    fn check_merge(&self, id: &str, update: &Update) -> StoreResult<()> {
        let entry = self
            .documents
            .get(id)
            .ok_or_else(|| StoreError::NotFound { id: id.to_owned() })?;
        match update.failed_precondition(entry.value()) {
            Some(field) => Err(StoreError::PreconditionFailed {
                id: id.to_owned(),
                field: field.to_owned(),
            }),
            None => Ok(()),
        }
    }

    fn apply_merge(&self, id: &str, update: &Update) {
        let now = self.clock.now();
        if let Some(mut entry) = self.documents.get_mut(id) {
            update.apply_to(entry.value_mut(), now);
        }
    }
}

impl MemoryStore {
    /// Empty store stamping server timestamps with the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Empty store stamping server timestamps with `clock`.
    pub fn with_clock(clock: SharedClock) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(MemoryInner {
                documents: DashMap::new(),
                children: DashMap::new(),
                changes,
                clock,
                write_gate: Mutex::new(()),
            }),
        }
    }

    /// Insert a document verbatim, bypassing server timestamp resolution.
    pub fn seed(&self, id: &str, fields: Fields) {
        let _guard = self.inner.lock();
        self.inner.documents.insert(id.to_owned(), fields);
        self.inner.notify(id);
    }

    /// Number of stored session documents.
    pub fn len(&self) -> usize {
        self.inner.documents.len()
    }

    /// Whether the store holds no session document.
    pub fn is_empty(&self) -> bool {
        self.inner.documents.is_empty()
    }

    fn set_now(&self, id: &str, update: Update) {
        let _guard = self.inner.lock();
        let mut fields = Fields::new();
        update.apply_to(&mut fields, self.inner.clock.now());
        self.inner.documents.insert(id.to_owned(), fields);
        self.inner.notify(id);
    }

    fn merge_now(&self, id: &str, update: Update) -> StoreResult<()> {
        let _guard = self.inner.lock();
        self.inner.check_merge(id, &update)?;
        self.inner.apply_merge(id, &update);
        self.inner.notify(id);
        Ok(())
    }

    fn delete_now(&self, id: &str) -> bool {
        let _guard = self.inner.lock();
        self.inner.children.remove(id);
        let existed = self.inner.documents.remove(id).is_some();
        if existed {
            self.inner.notify(id);
        }
        existed
    }

    fn query_now(&self, query: &Query) -> Vec<Document> {
        let mut matched: Vec<Document> = self
            .inner
            .documents
            .iter()
            .filter(|entry| query.matches(entry.value()))
            .map(|entry| Document::new(entry.key().clone(), entry.value().clone()))
            .collect();
        query.sort(&mut matched);
        matched
    }

    fn set_child_now(&self, id: &str, collection: &str, child_id: &str, update: Update) {
        let _guard = self.inner.lock();
        let mut fields = Fields::new();
        update.apply_to(&mut fields, self.inner.clock.now());
        self.inner
            .children
            .entry(id.to_owned())
            .or_default()
            .entry(collection.to_owned())
            .or_default()
            .insert(child_id.to_owned(), fields);
    }

    fn list_children_now(&self, id: &str, collection: &str) -> Vec<Document> {
        self.inner
            .children
            .get(id)
            .and_then(|children| {
                children.get(collection).map(|documents| {
                    documents
                        .iter()
                        .map(|(child_id, fields)| Document::new(child_id.clone(), fields.clone()))
                        .collect()
                })
            })
            .unwrap_or_default()
    }

    fn commit_now(&self, batch: Batch) -> StoreResult<()> {
        let _guard = self.inner.lock();
        for op in batch.ops() {
            if let BatchOp::Merge { id, update } = op {
                self.inner.check_merge(id, update)?;
            }
        }

        let mut touched: Vec<String> = Vec::new();
        for op in batch.into_ops() {
            match op {
                BatchOp::Merge { id, update } => {
                    self.inner.apply_merge(&id, &update);
                    if !touched.contains(&id) {
                        touched.push(id);
                    }
                }
                BatchOp::DeleteChild {
                    id,
                    collection,
                    child_id,
                } => {
                    if let Some(mut children) = self.inner.children.get_mut(&id) {
                        if let Some(documents) = children.get_mut(&collection) {
                            documents.shift_remove(&child_id);
                        }
                    }
                }
            }
        }

        for id in &touched {
            self.inner.notify(id);
        }
        debug!(documents = touched.len(), "committed batch");
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedStore for MemoryStore {
    fn get(&self, id: &str) -> BoxFuture<'static, StoreResult<Option<Document>>> {
        let snapshot = self.inner.snapshot(id);
        Box::pin(async move { Ok(snapshot) })
    }

    fn set(&self, id: &str, update: Update) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        let id = id.to_owned();
        Box::pin(async move {
            store.set_now(&id, update);
            Ok(())
        })
    }

    fn merge(&self, id: &str, update: Update) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        let id = id.to_owned();
        Box::pin(async move { store.merge_now(&id, update) })
    }

    fn delete(&self, id: &str) -> BoxFuture<'static, StoreResult<bool>> {
        let store = self.clone();
        let id = id.to_owned();
        Box::pin(async move { Ok(store.delete_now(&id)) })
    }

    fn query(&self, query: Query) -> BoxFuture<'static, StoreResult<Vec<Document>>> {
        let store = self.clone();
        Box::pin(async move { Ok(store.query_now(&query)) })
    }

    fn set_child(
        &self,
        id: &str,
        collection: &str,
        child_id: &str,
        update: Update,
    ) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        let (id, collection, child_id) =
            (id.to_owned(), collection.to_owned(), child_id.to_owned());
        Box::pin(async move {
            store.set_child_now(&id, &collection, &child_id, update);
            Ok(())
        })
    }

    fn list_children(
        &self,
        id: &str,
        collection: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Document>>> {
        let store = self.clone();
        let (id, collection) = (id.to_owned(), collection.to_owned());
        Box::pin(async move { Ok(store.list_children_now(&id, &collection)) })
    }

    fn commit(&self, batch: Batch) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.commit_now(batch) })
    }

    fn subscribe(&self, id: &str) -> BoxStream<'static, StoreResult<Option<Document>>> {
        let inner = self.inner.clone();
        let id = id.to_owned();
        // Subscribe before the first snapshot so no change slips in between.
        let mut changes = BroadcastStream::new(inner.changes.subscribe());
        async_stream::stream! {
            yield Ok(inner.snapshot(&id));
            while let Some(change) = changes.next().await {
                match change {
                    Ok(change) if change.id == id => yield Ok(change.document),
                    Ok(_) => continue,
                    // A lagged receiver skips to the current document.
                    Err(_) => yield Ok(inner.snapshot(&id)),
                }
            }
        }
        .boxed()
    }
}
