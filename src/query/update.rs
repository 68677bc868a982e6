// ============================================================================
// UPDATE builder
// ============================================================================

use crate::database::Database;
use crate::error::{OrmError, Result};
use crate::param_bag::{BoundValue, ParameterBag};
use crate::value::Value;

use super::clause::{validate_identifier, Comparison, Direction, JoinSpec, JoinType, Link, SqlCache, WhereClause};

#[derive(Debug, Clone)]
enum Assignment {
    Set(String, BoundValue),
    Increment(String, Value),
    Decrement(String, Value),
}

#[derive(Debug, Clone, Default)]
pub struct Update {
    table: Option<String>,
    assignments: Vec<Assignment>,
    joins: Vec<JoinSpec>,
    where_clause: WhereClause,
    order_by: Vec<(String, Direction)>,
    limit: Option<u64>,
    cache: SqlCache,
}

impl Update {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table(&mut self, table: impl Into<String>) -> &mut Self {
        self.table = Some(table.into());
        self.cache.invalidate();
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<BoundValue>) -> Result<&mut Self> {
        let column = column.into();
        validate_identifier(&column)?;
        self.assignments.push(Assignment::Set(column, value.into()));
        self.cache.invalidate();
        Ok(self)
    }

    pub fn increment(&mut self, column: impl Into<String>, by: Value) -> Result<&mut Self> {
        let column = column.into();
        validate_identifier(&column)?;
        self.assignments.push(Assignment::Increment(column, by));
        self.cache.invalidate();
        Ok(self)
    }

    pub fn decrement(&mut self, column: impl Into<String>, by: Value) -> Result<&mut Self> {
        let column = column.into();
        validate_identifier(&column)?;
        self.assignments.push(Assignment::Decrement(column, by));
        self.cache.invalidate();
        Ok(self)
    }

    pub fn join(
        &mut self,
        kind: JoinType,
        table: impl Into<String>,
        left: Option<&str>,
        right: Option<&str>,
    ) -> &mut Self {
        self.joins.push(JoinSpec {
            kind,
            table: table.into(),
            left: left.map(str::to_string),
            right: right.map(str::to_string),
            alias: None,
        });
        self.cache.invalidate();
        self
    }

    pub fn r#where(
        &mut self,
        column: impl Into<String>,
        value: impl Into<BoundValue>,
        comparison: Comparison,
        link: Link,
    ) -> &mut Self {
        self.where_clause.push(column, value, comparison, link);
        self.cache.invalidate();
        self
    }

    pub fn order_by(&mut self, column: impl Into<String>, direction: &str) -> &mut Self {
        self.order_by.push((column.into(), Direction::parse(direction)));
        self.cache.invalidate();
        self
    }

    pub fn limit(&mut self, n: i64) -> &mut Self {
        self.limit = Some(n.max(0) as u64);
        self.cache.invalidate();
        self
    }

    fn build(&self) -> Result<(String, ParameterBag)> {
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| OrmError::builder("UPDATE requires table()"))?;
        validate_identifier(table)?;
        if self.assignments.is_empty() {
            return Err(OrmError::builder("UPDATE requires at least one set()/increment()/decrement()"));
        }

        let mut bag = ParameterBag::new();
        let mut sql = format!("UPDATE {table}");
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(&join.to_sql()?);
        }

        let rendered: Vec<String> = self
            .assignments
            .iter()
            .map(|assignment| match assignment {
                Assignment::Set(col, value) => format!("{col} = {}", bag.render(value.clone())),
                Assignment::Increment(col, by) => format!("{col} = {col} + {}", bag.bind(by.clone())),
                Assignment::Decrement(col, by) => format!("{col} = {col} - {}", bag.bind(by.clone())),
            })
            .collect();
        sql.push_str(" SET ");
        sql.push_str(&rendered.join(", "));

        if !self.where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_clause.to_sql(&mut bag)?);
        }

        if !self.order_by.is_empty() {
            let rendered: Vec<String> = self
                .order_by
                .iter()
                .map(|(col, dir)| {
                    let dir_sql = match dir {
                        Direction::Asc => "ASC",
                        Direction::Desc => "DESC",
                    };
                    format!("{col} {dir_sql}")
                })
                .collect();
            sql.push_str(" ORDER BY ");
            sql.push_str(&rendered.join(", "));
        }

        if let Some(limit) = self.limit {
            if limit > 0 {
                sql.push_str(&format!(" LIMIT {limit}"));
            }
        }

        Ok((sql, bag))
    }

    pub fn to_sql(&self) -> Result<String> {
        Ok(self.cache.get_or_build(|| self.build())?.0)
    }

    pub fn parameters(&self) -> Result<ParameterBag> {
        Ok(self.cache.get_or_build(|| self.build())?.1)
    }

    pub async fn execute(&self, db: &dyn Database) -> Result<u64> {
        let (sql, bag) = self.cache.get_or_build(|| self.build())?;
        let mut stmt = db.prepare(&sql).await?;
        for (name, value) in bag.entries() {
            stmt.bind(name, value.clone()).await?;
        }
        stmt.execute().await
    }
}
