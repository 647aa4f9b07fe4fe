use std::sync::Arc;

use futures::{StreamExt, TryStreamExt, future::BoxFuture, stream::BoxStream};
use mongodb::{
    Collection, Database, IndexModel,
    bson::{Document as BsonDocument, doc},
    change_stream::event::OperationType,
    options::{FullDocumentType, IndexOptions},
};
use tracing::{debug, warn};

use super::{
    config::MongoConfig,
    connection::open_database,
    error::{MongoDaoError, MongoResult},
    models::{
        CHILD_DATA_FIELD, child_from_bson, child_key, fields_from_bson, guarded_filter,
        merge_operators, query_filter, query_sort, replacement, session_from_bson,
        stamped_replacement,
    },
};
use crate::dao::{
    models::{Batch, BatchOp, Document, Query, Update},
    session_store::SharedStore,
    storage::{StoreError, StoreResult},
};

const SESSION_COLLECTION_NAME: &str = "duel_sessions";
const CHILD_COLLECTION_NAME: &str = "duel_session_children";

/// [`SharedStore`] backed by MongoDB.
///
/// Sessions live in the `duel_sessions` collection keyed by their identifier. Sub-collection
/// documents are flattened into `duel_session_children` and tagged with their parent. Change
/// streams, and therefore [`SharedStore::subscribe`], need a replica set deployment.
#[derive(Clone)]
pub struct MongoSessionStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    database: Database,
}

impl MongoSessionStore {
    /// Connect to MongoDB and make sure the lookup indexes exist.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let database = open_database(&config).await?;
        let store = Self {
            inner: Arc::new(MongoInner { database }),
        };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let lobby_index = IndexModel::builder()
            .keys(doc! { "state": 1, "private": 1, "createdAt": 1 })
            .options(
                IndexOptions::builder()
                    .name(Some("session_lobby_idx".to_owned()))
                    .build(),
            )
            .build();
        self.sessions()
            .create_index(lobby_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: SESSION_COLLECTION_NAME,
                index: "state,private,createdAt",
                source,
            })?;

        let parent_index = IndexModel::builder()
            .keys(doc! { "parent": 1, "collection": 1 })
            .options(
                IndexOptions::builder()
                    .name(Some("child_parent_idx".to_owned()))
                    .build(),
            )
            .build();
        self.children()
            .create_index(parent_index)
            .await
            .map_err(|source| MongoDaoError::EnsureIndex {
                collection: CHILD_COLLECTION_NAME,
                index: "parent,collection",
                source,
            })?;

        Ok(())
    }

    fn sessions(&self) -> Collection<BsonDocument> {
        self.inner
            .database
            .collection::<BsonDocument>(SESSION_COLLECTION_NAME)
    }

    fn children(&self) -> Collection<BsonDocument> {
        self.inner
            .database
            .collection::<BsonDocument>(CHILD_COLLECTION_NAME)
    }

    async fn find(&self, id: &str) -> MongoResult<Option<Document>> {
        let document = self
            .sessions()
            .find_one(doc! { "_id": id })
            .await
            .map_err(|source| MongoDaoError::Load {
                id: id.to_owned(),
                source,
            })?;
        Ok(document.map(|document| session_from_bson(id, &document)))
    }

    async fn replace(&self, id: &str, update: &Update) -> MongoResult<()> {
        let (fields, stamped) = replacement(update);
        self.sessions()
            .update_one(
                doc! { "_id": id },
                stamped_replacement(id, fields, &stamped, None),
            )
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::Write {
                id: id.to_owned(),
                source,
            })?;
        Ok(())
    }

    /// Apply a guarded merge, then tell a missing document apart from a failed precondition.
    async fn merge_guarded(&self, id: &str, update: &Update) -> MongoResult<()> {
        let operators = merge_operators(update);
        let sessions = self.sessions();
        let matched = if operators.is_empty() {
            sessions
                .count_documents(guarded_filter(id, update))
                .await
                .map_err(|source| MongoDaoError::Load {
                    id: id.to_owned(),
                    source,
                })?
        } else {
            sessions
                .update_one(guarded_filter(id, update), operators)
                .await
                .map_err(|source| MongoDaoError::Write {
                    id: id.to_owned(),
                    source,
                })?
                .matched_count
        };
        if matched > 0 {
            return Ok(());
        }
        Err(self.explain_mismatch(id, update).await?)
    }

    async fn explain_mismatch(&self, id: &str, update: &Update) -> MongoResult<MongoDaoError> {
        let Some(current) = self.find(id).await? else {
            return Ok(MongoDaoError::Missing { id: id.to_owned() });
        };
        let field = update
            .failed_precondition(current.fields())
            .or_else(|| update.preconditions().first().map(|(key, _)| key.as_str()))
            .unwrap_or("_id")
            .to_owned();
        Ok(MongoDaoError::Precondition {
            id: id.to_owned(),
            field,
        })
    }

    async fn remove(&self, id: &str) -> MongoResult<bool> {
        self.children()
            .delete_many(doc! { "parent": id })
            .await
            .map_err(|source| MongoDaoError::Delete {
                id: id.to_owned(),
                source,
            })?;
        let result = self
            .sessions()
            .delete_one(doc! { "_id": id })
            .await
            .map_err(|source| MongoDaoError::Delete {
                id: id.to_owned(),
                source,
            })?;
        Ok(result.deleted_count > 0)
    }

    async fn run_query(&self, query: &Query) -> MongoResult<Vec<Document>> {
        let sessions = self.sessions();
        let mut find = sessions.find(query_filter(query));
        if let Some(sort) = query_sort(query) {
            find = find.sort(sort);
        }
        let documents: Vec<BsonDocument> = find
            .await
            .map_err(|source| MongoDaoError::Query { source })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Query { source })?;

        Ok(documents
            .iter()
            .filter_map(|document| {
                document
                    .get_str("_id")
                    .ok()
                    .map(|id| Document::new(id, fields_from_bson(document)))
            })
            .collect())
    }

    async fn write_child(
        &self,
        id: &str,
        collection: &str,
        child_id: &str,
        update: &Update,
    ) -> MongoResult<()> {
        let key = child_key(id, collection, child_id);
        let (data, stamped) = replacement(update);
        let mut body = doc! {
            "parent": id,
            "collection": collection,
            "child": child_id,
        };
        body.insert(CHILD_DATA_FIELD, data);
        self.children()
            .update_one(
                doc! { "_id": key.as_str() },
                stamped_replacement(&key, body, &stamped, Some(CHILD_DATA_FIELD)),
            )
            .upsert(true)
            .await
            .map_err(|source| MongoDaoError::Write { id: key, source })?;
        Ok(())
    }

    async fn read_children(&self, id: &str, collection: &str) -> MongoResult<Vec<Document>> {
        let documents: Vec<BsonDocument> = self
            .children()
            .find(doc! { "parent": id, "collection": collection })
            .await
            .map_err(|source| MongoDaoError::Load {
                id: id.to_owned(),
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Load {
                id: id.to_owned(),
                source,
            })?;
        Ok(documents.iter().filter_map(child_from_bson).collect())
    }

    /// Check every precondition up front, then apply merges before child deletions.
    ///
    /// MongoDB gives no multi-document atomicity without a transaction, so each merge
    /// keeps its guard and a race lost after the initial check still fails the batch.
    async fn apply_batch(&self, batch: Batch) -> MongoResult<()> {
        for op in batch.ops() {
            if let BatchOp::Merge { id, update } = op {
                let current = self.find(id).await?;
                let Some(current) = current else {
                    return Err(MongoDaoError::Missing { id: id.clone() });
                };
                if let Some(field) = update.failed_precondition(current.fields()) {
                    return Err(MongoDaoError::Precondition {
                        id: id.clone(),
                        field: field.to_owned(),
                    });
                }
            }
        }

        let (merges, deletions): (Vec<BatchOp>, Vec<BatchOp>) = batch
            .into_ops()
            .into_iter()
            .partition(|op| matches!(op, BatchOp::Merge { .. }));
        for op in merges.into_iter().chain(deletions) {
            match op {
                BatchOp::Merge { id, update } => self.merge_guarded(&id, &update).await?,
                BatchOp::DeleteChild {
                    id,
                    collection,
                    child_id,
                } => {
                    let key = child_key(&id, &collection, &child_id);
                    self.children()
                        .delete_one(doc! { "_id": key.as_str() })
                        .await
                        .map_err(|source| MongoDaoError::Delete { id: key, source })?;
                }
            }
        }
        Ok(())
    }

    fn watch(&self, id: String) -> BoxStream<'static, StoreResult<Option<Document>>> {
        let store = self.clone();
        async_stream::stream! {
            let sessions = store.sessions();
            let changes = sessions
                .watch()
                .pipeline(vec![doc! { "$match": { "documentKey._id": id.as_str() } }])
                .full_document(FullDocumentType::UpdateLookup)
                .await
                .map_err(|source| MongoDaoError::Watch { id: id.clone(), source });
            let mut changes = match changes {
                Ok(changes) => changes,
                Err(err) => {
                    yield Err(StoreError::from(err));
                    return;
                }
            };

            // Opened before the first read so nothing between the two is lost.
            yield store.find(&id).await.map_err(StoreError::from);

            while let Some(event) = changes.next().await {
                match event {
                    Ok(event) => {
                        if matches!(event.operation_type, OperationType::Delete) {
                            debug!(session = %id, "session deleted");
                            yield Ok(None);
                            continue;
                        }
                        match event.full_document {
                            Some(document) => yield Ok(Some(session_from_bson(&id, &document))),
                            None => yield store.find(&id).await.map_err(StoreError::from),
                        }
                    }
                    Err(source) => {
                        warn!(session = %id, error = %source, "session change stream failed");
                        yield Err(StoreError::from(MongoDaoError::Watch { id: id.clone(), source }));
                        return;
                    }
                }
            }
        }
        .boxed()
    }
}

impl SharedStore for MongoSessionStore {
    fn get(&self, id: &str) -> BoxFuture<'static, StoreResult<Option<Document>>> {
        let store = self.clone();
        let id = id.to_owned();
        Box::pin(async move { store.find(&id).await.map_err(Into::into) })
    }

    fn set(&self, id: &str, update: Update) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        let id = id.to_owned();
        Box::pin(async move { store.replace(&id, &update).await.map_err(Into::into) })
    }

    fn merge(&self, id: &str, update: Update) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        let id = id.to_owned();
        Box::pin(async move { store.merge_guarded(&id, &update).await.map_err(Into::into) })
    }

    fn delete(&self, id: &str) -> BoxFuture<'static, StoreResult<bool>> {
        let store = self.clone();
        let id = id.to_owned();
        Box::pin(async move { store.remove(&id).await.map_err(Into::into) })
    }

    fn query(&self, query: Query) -> BoxFuture<'static, StoreResult<Vec<Document>>> {
        let store = self.clone();
        Box::pin(async move { store.run_query(&query).await.map_err(Into::into) })
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
            store
                .write_child(&id, &collection, &child_id, &update)
                .await
                .map_err(Into::into)
        })
    }

    fn list_children(
        &self,
        id: &str,
        collection: &str,
    ) -> BoxFuture<'static, StoreResult<Vec<Document>>> {
        let store = self.clone();
        let (id, collection) = (id.to_owned(), collection.to_owned());
        Box::pin(async move {
            store
                .read_children(&id, &collection)
                .await
                .map_err(Into::into)
        })
    }

    fn commit(&self, batch: Batch) -> BoxFuture<'static, StoreResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.apply_batch(batch).await.map_err(Into::into) })
    }

    fn subscribe(&self, id: &str) -> BoxStream<'static, StoreResult<Option<Document>>> {
        self.watch(id.to_owned())
    }
}
