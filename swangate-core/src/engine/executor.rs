//! Statement execution against a session's connection or one of its
//! transactions.
//!
//! Both targets share the same client; a transaction target additionally
//! holds the transaction's operation lock for as long as the executor lives,
//! so at most one operation runs inside a transaction at a time.

use std::error::Error;
use std::future::Future;
use std::pin::pin;
use std::time::Duration;

use bytes::Bytes;
use futures::TryStreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::OwnedMutexGuard;
use tokio_postgres::types::{FromSql, Type};
use tokio_postgres::{Client, RowStream, SimpleQueryMessage, Statement};
use tracing::{debug, instrument};

use crate::encoding::{ColumnSpec, ResultEncoder};
use crate::engine::connection::{PgConnection, QueryCanceller};
use crate::engine::deadline::run_with_deadline;
use crate::engine::params::bind;
use crate::error::ServerError;
use crate::session::id::TransactionId;
use crate::sql_parser;

/// Capability shared by everything statements can run against.
pub trait Queryable: Sync {
    fn client(&self) -> &Client;

    fn canceller(&self) -> QueryCanceller;

    fn prepare(&self, sql: &str) -> impl Future<Output = Result<Statement, ServerError>> + Send {
        async move { Ok(self.client().prepare(sql).await?) }
    }

    /// Run a prepared statement and return the affected row count.
    fn exec(
        &self,
        statement: &Statement,
        args: &[Value],
    ) -> impl Future<Output = Result<u64, ServerError>> + Send {
        async move { Ok(self.client().execute_raw(statement, bind(args)).await?) }
    }

    fn query(
        &self,
        statement: &Statement,
        args: &[Value],
    ) -> impl Future<Output = Result<RowStream, ServerError>> + Send {
        async move { Ok(self.client().query_raw(statement, bind(args)).await?) }
    }
}

impl Queryable for PgConnection {
    fn client(&self) -> &Client {
        PgConnection::client(self)
    }

    fn canceller(&self) -> QueryCanceller {
        PgConnection::canceller(self)
    }
}

/// An active transaction, locked for the lifetime of the handle.
pub struct TransactionHandle<'a> {
    connection: &'a PgConnection,
    transaction_id: TransactionId,
    _op: OwnedMutexGuard<()>,
}

impl<'a> TransactionHandle<'a> {
    pub fn new(
        connection: &'a PgConnection,
        transaction_id: TransactionId,
        op: OwnedMutexGuard<()>,
    ) -> Self {
        Self {
            connection,
            transaction_id,
            _op: op,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.transaction_id
    }
}

impl Queryable for TransactionHandle<'_> {
    fn client(&self) -> &Client {
        self.connection.client()
    }

    fn canceller(&self) -> QueryCanceller {
        self.connection.canceller()
    }
}

pub enum Executor<'a> {
    Connection(&'a PgConnection),
    Transaction(TransactionHandle<'a>),
}

impl Queryable for Executor<'_> {
    fn client(&self) -> &Client {
        match self {
            Executor::Connection(connection) => connection.client(),
            Executor::Transaction(handle) => handle.client(),
        }
    }

    fn canceller(&self) -> QueryCanceller {
        match self {
            Executor::Connection(connection) => connection.canceller(),
            Executor::Transaction(handle) => handle.canceller(),
        }
    }
}

/// Per-statement result of an exec batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExecOutcome {
    pub rows_affected: u64,
    pub error: String,
}

impl Executor<'_> {
    pub fn transaction_id(&self) -> Option<TransactionId> {
        match self {
            Executor::Connection(_) => None,
            Executor::Transaction(handle) => Some(handle.transaction_id()),
        }
    }

    /// Run `sql` and encode every row into the binary result payload.
    #[instrument(skip(self, sql, args), fields(transaction_id = ?self.transaction_id()))]
    pub async fn query(
        &self,
        sql: &str,
        args: &[Value],
        timeout: Duration,
    ) -> Result<Bytes, ServerError> {
        let canceller = self.canceller();
        run_with_deadline(
            "query",
            timeout,
            move || canceller.cancel(),
            encode_query(self, sql, args),
        )
        .await
    }

    /// Run each statement in order. A failing statement records its error
    /// and the batch continues.
    #[instrument(skip(self, sqls, args), fields(transaction_id = ?self.transaction_id(), statements = sqls.len()))]
    pub async fn exec_batch(
        &self,
        sqls: &[String],
        args: &[Vec<Value>],
        timeout: Duration,
    ) -> Vec<ExecOutcome> {
        let mut outcomes = Vec::with_capacity(sqls.len());
        for (index, sql) in sqls.iter().enumerate() {
            let args = args.get(index).map(Vec::as_slice).unwrap_or(&[]);
            let canceller = self.canceller();
            let result = run_with_deadline(
                "exec",
                timeout,
                move || canceller.cancel(),
                exec_statement(self, sql, args),
            )
            .await;
            let outcome = match result {
                Ok(rows_affected) => ExecOutcome {
                    rows_affected,
                    error: String::new(),
                },
                Err(err) => {
                    debug!(statement = index, error = %err, "exec statement failed");
                    ExecOutcome {
                        rows_affected: 0,
                        error: err.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }
}

/// Accepts any column type and hands back the undecoded binary value.
struct RawValue<'a>(&'a [u8]);

impl<'a> FromSql<'a> for RawValue<'a> {
    fn from_sql(_ty: &Type, raw: &'a [u8]) -> Result<Self, Box<dyn Error + Sync + Send>> {
        Ok(RawValue(raw))
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }
}

async fn encode_query<Q: Queryable>(
    target: &Q,
    sql: &str,
    args: &[Value],
) -> Result<Bytes, ServerError> {
    let statement = target.prepare(sql).await?;
    let columns = statement
        .columns()
        .iter()
        .map(|column| ColumnSpec::for_type_oid(column.type_().oid()))
        .collect();
    let mut encoder = ResultEncoder::new(columns)?;

    let mut rows = pin!(target.query(&statement, args).await?);
    while let Some(row) = rows.try_next().await? {
        let mut cells = Vec::with_capacity(row.len());
        for index in 0..row.len() {
            let value: Option<RawValue<'_>> = row.try_get(index)?;
            cells.push(value.map(|raw| raw.0));
        }
        encoder.push_row(cells)?;
    }

    debug!(rows = encoder.row_count(), "encoded query result");
    Ok(encoder.finish()?)
}

async fn exec_statement<Q: Queryable>(
    target: &Q,
    sql: &str,
    args: &[Value],
) -> Result<u64, ServerError> {
    // Without arguments the simple protocol is used, which also accepts
    // several `;`-separated statements in one string.
    if args.is_empty() {
        let messages = target.client().simple_query(sql).await?;
        let mut last_count = 0;
        let mut returned_rows = false;
        for message in &messages {
            match message {
                SimpleQueryMessage::CommandComplete(count) => last_count = *count,
                SimpleQueryMessage::Row(_) => returned_rows = true,
                _ => {}
            }
        }
        let select_shaped = sql_parser::is_query(sql).unwrap_or(returned_rows);
        return Ok(if select_shaped { 0 } else { last_count });
    }

    let statement = target.prepare(sql).await?;
    let rows_affected = target.exec(&statement, args).await?;
    let select_shaped =
        !statement.columns().is_empty() && sql_parser::is_query(sql).unwrap_or(true);
    Ok(if select_shaped { 0 } else { rows_affected })
}
