//! SwanGate core: a stateless HTTP front for stateful PostgreSQL sessions.

pub mod config;
pub mod encoding;
pub mod engine;
pub mod error;
pub mod service;
pub mod session;
pub mod sql_parser;
