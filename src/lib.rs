//! Library crate for tap-duel, exposing modules for the binary and integration tests.

pub mod clock;
pub mod config;
pub mod dao;
pub mod error;
pub mod services;
pub mod session;
pub mod state;
