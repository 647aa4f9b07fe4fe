/// Round Coordinator: the duel lifecycle event loop.
pub mod coordinator;
/// Stable per-installation player identity.
pub mod identity;
/// Heartbeats and two-phase disconnect detection.
pub mod liveness;
/// Session creation, joining, auto matching and garbage collection.
pub mod matchmaking;
/// One-shot broadcasts over the record's `signal` field.
pub mod signal_channel;
