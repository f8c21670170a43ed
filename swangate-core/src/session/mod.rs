//! Session management module.
//!
//! This module provides:
//! - `Session`: one leased database connection with its transactions
//! - `SessionRegistry`: the process-wide slot table of live sessions
//! - `TransactionRegistry`: per-session transaction slots and nesting
//! - `SessionId` / `TransactionId` / `SessionToken`: identifiers and secrets

pub mod id;
pub mod lease;
pub mod registry;
pub mod slots;
pub mod transaction;

pub use id::{SessionId, SessionToken, TransactionId};
pub use registry::{SessionRegistry, SessionRegistrySnapshot};
pub use transaction::{Outcome, TransactionRegistry, TransactionState};

use std::time::Duration;

use tracing::{debug, info};

use crate::engine::{Executor, PgConnection, TransactionHandle};
use crate::error::ServerError;
use crate::session::lease::Lease;

/// What the session lifecycle needs from the connection a session owns.
pub trait SessionConnection: Send + Sync + 'static {
    /// Drop the socket. Requests still holding the connection fail.
    fn close(&self);
}

impl SessionConnection for PgConnection {
    fn close(&self) {
        PgConnection::close(self)
    }
}

/// A caller's logical connection: the database connection it owns, the
/// token that proves ownership, its lease, and its open transactions.
pub struct Session<C = PgConnection> {
    id: SessionId,
    token: SessionToken,
    connection: C,
    lease: Lease,
    transactions: TransactionRegistry,
}

impl<C: SessionConnection> Session<C> {
    pub fn new(
        id: SessionId,
        token: SessionToken,
        connection: C,
        lease_window: Duration,
        transaction_capacity: usize,
    ) -> Self {
        debug!(connection_id = %id, "created new session");
        Self {
            id,
            token,
            connection,
            lease: Lease::new(lease_window),
            transactions: TransactionRegistry::new(transaction_capacity),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn token(&self) -> &SessionToken {
        &self.token
    }

    pub fn lease(&self) -> &Lease {
        &self.lease
    }

    pub fn transactions(&self) -> &TransactionRegistry {
        &self.transactions
    }

    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Tear the session down: stop the lease, retire transactions, drop the socket.
    pub fn close(&self) {
        self.lease.revoke();
        let retired = self.transactions.retire_all();
        self.connection.close();
        info!(connection_id = %self.id, retired_transactions = retired, "session closed");
    }
}

impl Session<PgConnection> {
    /// Pick where a request runs.
    ///
    /// A `transaction_id` naming an active transaction of this session runs
    /// there, holding its operation lock until the executor is dropped. Only
    /// the innermost open transaction can take statements: naming an outer
    /// one while savepoints are open above it is rejected, since the work
    /// would land in the savepoint. Unknown or finished ids fall back to the
    /// raw connection.
    pub async fn executor(
        &self,
        transaction_id: Option<TransactionId>,
    ) -> Result<Executor<'_>, ServerError> {
        if let Some(id) = transaction_id {
            if let Some(transaction) = self.transactions.lookup(id) {
                let op = transaction.lock_op().await;
                // It may have been finished while we waited.
                if transaction.is_active() {
                    if !self.transactions.is_innermost(&transaction) {
                        return Err(ServerError::Validation(format!(
                            "transaction {id} has nested transactions open; \
                             use the innermost transaction_id"
                        )));
                    }
                    return Ok(Executor::Transaction(TransactionHandle::new(
                        &self.connection,
                        id,
                        op,
                    )));
                }
            }
            debug!(connection_id = %self.id, transaction_id = %id, "transaction not open, using connection");
        }
        Ok(Executor::Connection(&self.connection))
    }

    pub async fn begin_transaction(&self, timeout: Duration) -> Result<TransactionId, ServerError> {
        self.transactions.begin(&self.connection, timeout).await
    }

    pub async fn finish_transaction(
        &self,
        id: TransactionId,
        outcome: Outcome,
        timeout: Duration,
    ) -> Result<(), ServerError> {
        self.transactions
            .finish(&self.connection, id, outcome, timeout)
            .await
    }
}
