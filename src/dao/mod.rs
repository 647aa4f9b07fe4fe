/// Schemaless document, update and query types.
pub mod models;
/// Shared document store contract and its backends.
pub mod session_store;
/// Storage error type shared by every backend.
pub mod storage;
