//! Per-session transaction registry.
//!
//! Transactions share the session's single connection, so they nest: the
//! first open transaction is a real `BEGIN`, later ones are savepoints inside
//! it. The registry keeps that stack in step with the database and maps
//! transaction ids onto a bounded slot space.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use tokio_postgres::error::SqlState;
use tracing::{debug, info, instrument, warn};

use crate::engine::{run_with_deadline, PgConnection};
use crate::error::ServerError;
use crate::session::id::TransactionId;
use crate::session::slots::IdProbe;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    RolledBack,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Commit,
    Rollback,
}

impl Outcome {
    fn terminal_state(self) -> TransactionState {
        match self {
            Outcome::Commit => TransactionState::Committed,
            Outcome::Rollback => TransactionState::RolledBack,
        }
    }

    fn operation(self) -> &'static str {
        match self {
            Outcome::Commit => "commit",
            Outcome::Rollback => "rollback",
        }
    }
}

#[derive(Debug)]
pub struct Transaction {
    id: TransactionId,
    /// `None` for the outermost transaction.
    savepoint: Option<String>,
    state: Mutex<TransactionState>,
    op: Arc<tokio::sync::Mutex<()>>,
}

impl Transaction {
    fn new(id: TransactionId, depth: usize) -> Self {
        Self {
            id,
            savepoint: (depth > 0).then(|| format!("swangate_sp_{}", id.id())),
            state: Mutex::new(TransactionState::Active),
            op: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Active
    }

    fn set_state(&self, state: TransactionState) {
        *self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Wait for this transaction's in-flight operation to finish, then hold it off.
    pub async fn lock_op(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.op).lock_owned().await
    }

    fn begin_sql(&self) -> String {
        match &self.savepoint {
            None => "BEGIN".to_string(),
            Some(savepoint) => format!("SAVEPOINT {savepoint}"),
        }
    }

    fn finish_sql(&self, outcome: Outcome) -> String {
        match (outcome, &self.savepoint) {
            (Outcome::Commit, None) => "COMMIT".to_string(),
            (Outcome::Rollback, None) => "ROLLBACK".to_string(),
            (Outcome::Commit, Some(savepoint)) => format!("RELEASE SAVEPOINT {savepoint}"),
            (Outcome::Rollback, Some(savepoint)) => {
                format!("ROLLBACK TO SAVEPOINT {savepoint}; RELEASE SAVEPOINT {savepoint}")
            }
        }
    }
}

#[derive(Default)]
struct RegistryState {
    /// Open transactions, outermost first.
    stack: Vec<Arc<Transaction>>,
    slots: HashMap<usize, Arc<Transaction>>,
}

pub struct TransactionRegistry {
    /// Serialises begin/commit/rollback so the stack matches the database.
    control: tokio::sync::Mutex<()>,
    state: Mutex<RegistryState>,
    probe: IdProbe,
    capacity: usize,
}

impl TransactionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            control: tokio::sync::Mutex::new(()),
            state: Mutex::new(RegistryState::default()),
            probe: IdProbe::new(capacity),
            capacity,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of open transactions, including nested ones.
    pub fn open_count(&self) -> usize {
        self.state().slots.len()
    }

    /// Resolve an id to its transaction while it is still active.
    pub fn lookup(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        let state = self.state();
        state
            .slots
            .get(&id.slot(self.capacity))
            .filter(|transaction| transaction.id == id && transaction.is_active())
            .cloned()
    }

    /// Pick an id for a transaction at `depth` without publishing it.
    fn allocate(&self, depth: usize) -> Result<Transaction, ServerError> {
        let state = self.state();
        let id = self
            .probe
            .probe(|_, index| !state.slots.contains_key(&index))
            .ok_or(ServerError::CapacityExhausted("transaction"))?;
        Ok(Transaction::new(TransactionId::new(id), depth))
    }

    fn install(&self, transaction: Arc<Transaction>) {
        let mut state = self.state();
        state
            .slots
            .insert(transaction.id.slot(self.capacity), Arc::clone(&transaction));
        state.stack.push(transaction);
    }

    /// Open a transaction, or a savepoint inside the innermost open one.
    #[instrument(skip(self, connection, timeout))]
    pub async fn begin(
        &self,
        connection: &PgConnection,
        timeout: Duration,
    ) -> Result<TransactionId, ServerError> {
        let _control = self.control.lock().await;
        // A savepoint must not open underneath a statement still running in
        // the current innermost transaction.
        let parent = self.state().stack.last().cloned();
        let _parent_op = match &parent {
            Some(parent) => Some(parent.lock_op().await),
            None => None,
        };
        let depth = self.state().stack.len();
        let transaction = Arc::new(self.allocate(depth)?);

        let sql = transaction.begin_sql();
        let canceller = connection.canceller();
        run_with_deadline("begin", timeout, move || canceller.cancel(), async {
            connection
                .client()
                .batch_execute(&sql)
                .await
                .map_err(ServerError::from)
        })
        .await?;

        self.install(Arc::clone(&transaction));
        debug!(transaction_id = %transaction.id, depth, "transaction opened");
        Ok(transaction.id)
    }

    /// Commit or roll back `id` and every transaction nested inside it.
    ///
    /// The affected transactions reach their terminal state and leave the
    /// registry whether or not the database accepted the statement.
    #[instrument(skip(self, connection, timeout))]
    pub async fn finish(
        &self,
        connection: &PgConnection,
        id: TransactionId,
        outcome: Outcome,
        timeout: Duration,
    ) -> Result<(), ServerError> {
        let _control = self.control.lock().await;
        let transaction = self.lookup(id).ok_or(ServerError::Unauthorized)?;
        let nested = {
            let state = self.state();
            let position = state
                .stack
                .iter()
                .position(|open| Arc::ptr_eq(open, &transaction));
            match position {
                Some(position) => state.stack[position..].to_vec(),
                None => {
                    drop(state);
                    warn!(transaction_id = %id, "transaction missing from nesting stack");
                    self.retire(&[transaction], TransactionState::RolledBack);
                    return Err(ServerError::Protocol(format!(
                        "transaction {id} is not open on this session"
                    )));
                }
            }
        };

        // Let in-flight operations on the affected transactions drain first.
        let mut _ops = Vec::with_capacity(nested.len());
        for open in &nested {
            _ops.push(open.lock_op().await);
        }

        let canceller = connection.canceller();
        let result = run_with_deadline(
            outcome.operation(),
            timeout,
            move || canceller.cancel(),
            execute_finish(connection, &transaction, outcome),
        )
        .await;

        self.retire(&nested, outcome.terminal_state());
        match &result {
            Ok(()) => debug!(transaction_id = %id, ?outcome, retired = nested.len(), "transaction finished"),
            Err(err) => info!(transaction_id = %id, ?outcome, error = %err, "transaction finish failed; retired anyway"),
        }
        result
    }

    /// Move `transactions` to `terminal` and drop them from the stack and slots.
    fn retire(&self, transactions: &[Arc<Transaction>], terminal: TransactionState) {
        let mut state = self.state();
        for transaction in transactions {
            transaction.set_state(terminal);
            let index = transaction.id.slot(self.capacity);
            if state
                .slots
                .get(&index)
                .is_some_and(|current| Arc::ptr_eq(current, transaction))
            {
                state.slots.remove(&index);
            }
        }
        state
            .stack
            .retain(|open| !transactions.iter().any(|t| Arc::ptr_eq(open, t)));
    }

    /// Whether `transaction` is the innermost open one, the only place
    /// statements may run without landing inside a nested savepoint.
    pub fn is_innermost(&self, transaction: &Arc<Transaction>) -> bool {
        self.state()
            .stack
            .last()
            .is_some_and(|top| Arc::ptr_eq(top, transaction))
    }

    /// Retire every open transaction. Used when the session's connection goes
    /// away, which makes the server roll them back.
    pub fn retire_all(&self) -> usize {
        let mut state = self.state();
        let retired = state.stack.len();
        for transaction in state.stack.drain(..) {
            transaction.set_state(TransactionState::RolledBack);
        }
        for (_, transaction) in state.slots.drain() {
            transaction.set_state(TransactionState::RolledBack);
        }
        retired
    }
}

/// Run the commit or rollback statement for `transaction`.
///
/// A commit first checks that the server has not already aborted the
/// transaction: PostgreSQL answers COMMIT on an aborted transaction with a
/// silent ROLLBACK, and RELEASE of an aborted savepoint fails without undoing
/// it. Either way the work is rolled back and the caller learns the commit
/// did not happen.
async fn execute_finish(
    connection: &PgConnection,
    transaction: &Transaction,
    outcome: Outcome,
) -> Result<(), ServerError> {
    let client = connection.client();
    if outcome == Outcome::Commit {
        if let Err(err) = client.simple_query("SELECT 1").await {
            if err.code() != Some(&SqlState::IN_FAILED_SQL_TRANSACTION) {
                return Err(err.into());
            }
            debug!(transaction_id = %transaction.id, "transaction aborted before commit");
            client
                .batch_execute(&transaction.finish_sql(Outcome::Rollback))
                .await?;
            return Err(ServerError::CommitRolledBack);
        }
    }
    client.batch_execute(&transaction.finish_sql(outcome)).await?;
    Ok(())
}
