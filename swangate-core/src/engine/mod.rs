//! PostgreSQL engine module - connections and statement execution.
//!
//! This module provides:
//! - `PgConnection`: a session's exclusively owned database connection
//! - `Executor`: dispatch between the raw connection and an open transaction
//! - `JsonParam`: binding of JSON request arguments to statement parameters
//! - `run_with_deadline`: deadline and cancel-on-drop wrapper for driver calls

pub mod connection;
pub mod deadline;
pub mod executor;
pub mod params;

pub use connection::{ConnectOptions, ConnectParams, PgConnection, PgSslMode, QueryCanceller};
pub use deadline::run_with_deadline;
pub use executor::{ExecOutcome, Executor, Queryable, TransactionHandle};
pub use params::{bind, JsonParam};
