use mongodb::bson::{Bson, DateTime, Document as BsonDocument, doc};

use crate::{
    clock::Timestamp,
    dao::models::{Document, FieldOp, FieldValue, Fields, Precondition, Query, SortOrder, Update},
};

/// Sub-document holding the fields of a child document.
pub const CHILD_DATA_FIELD: &str = "data";

pub fn to_bson(value: &FieldValue) -> Bson {
    match value {
        FieldValue::Bool(flag) => Bson::Boolean(*flag),
        FieldValue::Int(number) => Bson::Int64(*number),
        FieldValue::Str(text) => Bson::String(text.clone()),
        FieldValue::Timestamp(stamp) => Bson::DateTime(DateTime::from_millis(stamp.as_millis())),
    }
}

pub fn from_bson(value: &Bson) -> Option<FieldValue> {
    match value {
        Bson::Boolean(flag) => Some(FieldValue::Bool(*flag)),
        Bson::Int32(number) => Some(FieldValue::Int(i64::from(*number))),
        Bson::Int64(number) => Some(FieldValue::Int(*number)),
        Bson::String(text) => Some(FieldValue::Str(text.clone())),
        Bson::DateTime(stamp) => Some(FieldValue::Timestamp(Timestamp::from_millis(
            stamp.timestamp_millis(),
        ))),
        _ => None,
    }
}

/// Convert a stored session document, dropping `_id` and unsupported values.
pub fn fields_from_bson(document: &BsonDocument) -> Fields {
    document
        .iter()
        .filter(|(key, _)| key.as_str() != "_id")
        .filter_map(|(key, value)| from_bson(value).map(|value| (key.clone(), value)))
        .collect()
}

pub fn session_from_bson(id: &str, document: &BsonDocument) -> Document {
    Document::new(id, fields_from_bson(document))
}

pub fn child_from_bson(document: &BsonDocument) -> Option<Document> {
    let child_id = match document.get("child") {
        Some(Bson::String(child)) => child.clone(),
        _ => return None,
    };
    let fields = match document.get(CHILD_DATA_FIELD) {
        Some(Bson::Document(data)) => fields_from_bson(data),
        _ => Fields::new(),
    };
    Some(Document::new(child_id, fields))
}

pub fn child_key(parent: &str, collection: &str, child_id: &str) -> String {
    format!("{parent}/{collection}/{child_id}")
}

/// Split an update into the plain fields of a full replacement and the keys to stamp.
pub fn replacement(update: &Update) -> (BsonDocument, Vec<String>) {
    let mut fields = BsonDocument::new();
    let mut stamped = Vec::new();
    for (key, op) in update.ops() {
        match op {
            FieldOp::Set(value) => {
                fields.insert(key.clone(), to_bson(value));
            }
            FieldOp::Increment(delta) => {
                fields.insert(key.clone(), Bson::Int64(*delta));
            }
            FieldOp::ServerTimestamp => stamped.push(key.clone()),
            FieldOp::Delete => {}
        }
    }
    (fields, stamped)
}

/// Single-statement upsert pipeline: replace the document with `body`, then stamp `keys`
/// (nested under `prefix` when given) with the server clock.
pub fn stamped_replacement(
    id: &str,
    mut body: BsonDocument,
    keys: &[String],
    prefix: Option<&str>,
) -> Vec<BsonDocument> {
    body.insert("_id", id);
    let mut pipeline = vec![doc! { "$replaceWith": { "$literal": body } }];
    if !keys.is_empty() {
        let mut stamps = BsonDocument::new();
        for key in keys {
            let path = match prefix {
                Some(prefix) => format!("{prefix}.{key}"),
                None => key.clone(),
            };
            stamps.insert(path, "$$NOW");
        }
        pipeline.push(doc! { "$set": stamps });
    }
    pipeline
}

/// Update document carrying `$set`, `$unset`, `$inc` and `$currentDate` stages.
pub fn merge_operators(update: &Update) -> BsonDocument {
    let mut set = BsonDocument::new();
    let mut unset = BsonDocument::new();
    let mut inc = BsonDocument::new();
    let mut stamps = BsonDocument::new();
    for (key, op) in update.ops() {
        match op {
            FieldOp::Set(value) => {
                set.insert(key.clone(), to_bson(value));
            }
            FieldOp::Delete => {
                unset.insert(key.clone(), "");
            }
            FieldOp::Increment(delta) => {
                inc.insert(key.clone(), *delta);
            }
            FieldOp::ServerTimestamp => {
                stamps.insert(key.clone(), true);
            }
        }
    }

    let mut operators = BsonDocument::new();
    for (stage, body) in [
        ("$set", set),
        ("$unset", unset),
        ("$inc", inc),
        ("$currentDate", stamps),
    ] {
        if !body.is_empty() {
            operators.insert(stage, body);
        }
    }
    operators
}

/// Filter selecting `id` only while every precondition of `update` holds.
pub fn guarded_filter(id: &str, update: &Update) -> BsonDocument {
    let mut filter = doc! { "_id": id };
    for (key, condition) in update.preconditions() {
        match condition {
            Precondition::Equals(value) => {
                filter.insert(key.clone(), to_bson(value));
            }
            Precondition::Absent => {
                filter.insert(key.clone(), doc! { "$exists": false });
            }
        }
    }
    filter
}

pub fn query_filter(query: &Query) -> BsonDocument {
    let mut filter = BsonDocument::new();
    for (key, value) in query.filters() {
        filter.insert(key.clone(), to_bson(value));
    }
    if let Some((key, _)) = query.ordering() {
        if !filter.contains_key(key) {
            filter.insert(key, doc! { "$exists": true });
        }
    }
    filter
}

pub fn query_sort(query: &Query) -> Option<BsonDocument> {
    query.ordering().map(|(key, order)| {
        let direction = match order {
            SortOrder::Ascending => 1,
            SortOrder::Descending => -1,
        };
        let mut sort = BsonDocument::new();
        sort.insert(key, direction);
        sort
    })
}
