//! Lightweight statement classification.
//!
//! SQL text is forwarded to PostgreSQL verbatim; parsing here only decides
//! how a statement's outcome is reported (row count vs. result rows).

use sqlparser::ast::Statement;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

pub struct ParsedStatement {
    statement: Statement,
}

impl ParsedStatement {
    /// Parse SQL text.
    ///
    /// For multi-statement SQL, keeps the last statement (which determines the result type).
    /// Returns `None` if the SQL cannot be parsed.
    pub fn parse(sql: &str) -> Option<Self> {
        let dialect = PostgreSqlDialect {};
        let statements = Parser::parse_sql(&dialect, sql).ok()?;

        Some(Self {
            statement: statements.into_iter().last()?,
        })
    }

    /// Check if this is a query statement (returns results).
    ///
    /// True for SELECT, VALUES, TABLE, WITH ... SELECT, SHOW and EXPLAIN.
    /// False for INSERT, UPDATE, DELETE, DDL, and session commands.
    pub fn is_query(&self) -> bool {
        matches!(
            self.statement,
            Statement::Query(_)
                | Statement::ShowTables { .. }
                | Statement::ShowColumns { .. }
                | Statement::ShowCreate { .. }
                | Statement::ShowVariable { .. }
                | Statement::ShowVariables { .. }
                | Statement::Explain { .. }
                | Statement::ExplainTable { .. }
        )
    }
}

/// Whether `sql` classifies as a query statement. `None` when it does not parse.
pub fn is_query(sql: &str) -> Option<bool> {
    ParsedStatement::parse(sql).map(|parsed| parsed.is_query())
}
