// ============================================================================
// DELETE builder
// ============================================================================

use crate::database::Database;
use crate::error::{OrmError, Result};
use crate::param_bag::{BoundValue, ParameterBag};
use crate::value::Value;

use super::clause::{validate_identifier, Comparison, Direction, JoinSpec, JoinType, Link, SqlCache, WhereClause};

#[derive(Debug, Clone, Default)]
pub struct Delete {
    table: Option<String>,
    joins: Vec<JoinSpec>,
    where_clause: WhereClause,
    order_by: Vec<(String, Direction)>,
    limit: Option<u64>,
    cache: SqlCache,
}

impl Delete {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from(&mut self, table: impl Into<String>) -> &mut Self {
        self.table = Some(table.into());
        self.cache.invalidate();
        self
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

    pub fn where_in(&mut self, column: impl Into<String>, values: Vec<Value>, link: Link) -> &mut Self {
        self.where_clause.push_in(column, values, false, link);
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
            .ok_or_else(|| OrmError::builder("DELETE requires from()"))?;
        validate_identifier(table)?;
        if self.where_clause.is_empty() {
            return Err(OrmError::builder(
                "DELETE without a where() clause would remove every row; call where() explicitly",
            ));
        }

        let mut bag = ParameterBag::new();
        let mut sql = format!("DELETE FROM {table}");
        for join in &self.joins {
            sql.push(' ');
            sql.push_str(&join.to_sql()?);
        }

        sql.push_str(" WHERE ");
        sql.push_str(&self.where_clause.to_sql(&mut bag)?);

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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_requires_a_where_clause() {
        let mut delete = Delete::new();
        delete.from("users");
        assert!(delete.to_sql().is_err());
    }

    #[test]
    fn where_and_limit_render() {
        let mut delete = Delete::new();
        delete
            .from("users")
            .r#where("active", Value::Bool(false), Comparison::Eq, Link::And)
            .limit(5);
        assert_eq!(
            delete.to_sql().unwrap(),
            "DELETE FROM users WHERE active = :p1 LIMIT 5"
        );
    }

    #[test]
    fn where_in_renders_multiple_placeholders() {
        let mut delete = Delete::new();
        delete.from("users").where_in("id", vec![Value::Int(1), Value::Int(2)], Link::And);
        assert_eq!(
            delete.to_sql().unwrap(),
            "DELETE FROM users WHERE id IN (:p1, :p2)"
        );
    }
}
