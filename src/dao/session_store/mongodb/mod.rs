mod config;
mod connection;
mod error;
mod models;
mod store;

pub use config::MongoConfig;
pub use error::MongoDaoError;
pub use store::MongoSessionStore;

use crate::dao::storage::StoreError;

impl From<MongoDaoError> for StoreError {
    fn from(err: MongoDaoError) -> Self {
        match err {
            MongoDaoError::Precondition { id, field } => StoreError::PreconditionFailed { id, field },
            MongoDaoError::Missing { id } => StoreError::NotFound { id },
            other => StoreError::unavailable(other.to_string(), other),
        }
    }
}
