use mongodb::error::Error as MongoError;
use thiserror::Error;

pub type MongoResult<T> = std::result::Result<T, MongoDaoError>;

/// Failures of the MongoDB session store.
#[derive(Debug, Error)]
pub enum MongoDaoError {
    #[error("missing environment variable `{var}`")]
    MissingEnvVar { var: &'static str },
    #[error("failed to parse MongoDB connection URI `{uri}`")]
    InvalidUri {
        uri: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to build MongoDB client from options")]
    ClientConstruction {
        #[source]
        source: MongoError,
    },
    #[error("MongoDB ping failed during initial connection after {attempts} attempt(s)")]
    InitialPing {
        attempts: u32,
        #[source]
        source: MongoError,
    },
    #[error("failed to ensure index `{index}` on collection `{collection}`")]
    EnsureIndex {
        collection: &'static str,
        index: &'static str,
        #[source]
        source: MongoError,
    },
    #[error("failed to load session `{id}`")]
    Load {
        id: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to write session `{id}`")]
    Write {
        id: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to delete session `{id}`")]
    Delete {
        id: String,
        #[source]
        source: MongoError,
    },
    #[error("failed to query sessions")]
    Query {
        #[source]
        source: MongoError,
    },
    #[error("failed to watch session `{id}`")]
    Watch {
        id: String,
        #[source]
        source: MongoError,
    },
    #[error("session `{id}` not found")]
    Missing { id: String },
    #[error("precondition on `{field}` of session `{id}` failed")]
    Precondition { id: String, field: String },
}
