// ============================================================================
// Database interface (consumed)
// ============================================================================
//
// Connection acquisition, driver configuration, statement preparation, and
// parameter binding primitives are out of scope (SPEC_FULL.md §1): the
// engine only consumes this contract. Grounded directly on
// `src/interface.rs`'s `DatabaseClient`/`DatabaseFactory` pair in the teacher
// repository — same `async_trait` shape, generalized from "the in-memory
// database" to "any relational database the embedding application wires up".

use std::collections::HashMap;

use async_trait::async_trait;

use crate::error::Result;
use crate::value::Value;

/// One row of a result set, keyed by column name.
pub type Row = HashMap<String, Value>;

/// A prepared statement: bind parameters by name, then run it once.
#[async_trait]
pub trait Statement: Send + Sync {
    async fn bind(&mut self, name: &str, value: Value) -> Result<()>;

    /// Runs a statement expected to return rows (SELECT).
    async fn query(&mut self) -> Result<Vec<Row>>;

    /// Runs a statement that modifies data (INSERT/UPDATE/DELETE); returns
    /// the affected row count.
    async fn execute(&mut self) -> Result<u64>;

    async fn close(&mut self) -> Result<()>;
}

/// The external relational database the engine writes through. An
/// application wraps its driver of choice (or the in-process `MockDatabase`
/// used by this crate's own tests) in an implementation of this trait.
#[async_trait]
pub trait Database: Send + Sync {
    /// Parses `sql`, returning a handle that supports parameter binding,
    /// execution, row fetching, and close.
    async fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>>;

    /// Executes non-parameterized DDL/DML; returns affected rows.
    async fn exec(&self, sql: &str) -> Result<u64>;

    async fn begin_transaction(&self) -> Result<()>;
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
    async fn in_transaction(&self) -> Result<bool>;

    /// Most recent auto-increment id, as a string (dialects disagree on
    /// whether this is numeric or textual; the engine parses it lazily).
    async fn last_insert_id(&self) -> Result<String>;

    /// Dialect-correct string literal escaping, used only for diagnostics —
    /// statements bind parameters by name and never quote values themselves.
    fn quote(&self, s: &str) -> String;
}
