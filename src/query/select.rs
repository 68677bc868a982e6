// ============================================================================
// SELECT builder
// ============================================================================

use crate::database::{Database, Row};
use crate::error::{OrmError, Result};
use crate::param_bag::{rename_placeholders, BoundValue, ParameterBag};
use crate::value::Value;

use super::clause::{Comparison, Direction, JoinSpec, JoinType, Link, SqlCache, WhereClause};

#[derive(Debug, Clone)]
enum FromSource {
    Table { name: String, alias: Option<String> },
    Subquery { select: Box<Select>, alias: String },
}

#[derive(Debug, Clone)]
struct UnionBranch {
    select: Select,
    all: bool,
}

#[derive(Debug, Clone, Default)]
pub struct Select {
    columns: Vec<String>,
    distinct: bool,
    from: Vec<FromSource>,
    joins: Vec<JoinSpec>,
    where_clause: WhereClause,
    group_by: Vec<String>,
    with_rollup: bool,
    having: WhereClause,
    order_by: Vec<(String, Direction)>,
    limit: Option<u64>,
    offset: Option<u64>,
    unions: Vec<UnionBranch>,
    cache: SqlCache,
}

impl Select {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn select(&mut self, columns: &[&str]) -> &mut Self {
        self.columns.extend(columns.iter().map(|c| c.to_string()));
        self.cache.invalidate();
        self
    }

    pub fn distinct(&mut self) -> &mut Self {
        self.distinct = true;
        self.cache.invalidate();
        self
    }

    pub fn from(&mut self, table: impl Into<String>, alias: Option<&str>) -> &mut Self {
        self.from.push(FromSource::Table {
            name: table.into(),
            alias: alias.map(str::to_string),
        });
        self.cache.invalidate();
        self
    }

    pub fn from_subquery(&mut self, select: Select, alias: impl Into<String>) -> &mut Self {
        self.from.push(FromSource::Subquery {
            select: Box::new(select),
            alias: alias.into(),
        });
        self.cache.invalidate();
        self
    }

    pub fn join(
        &mut self,
        kind: JoinType,
        table: impl Into<String>,
        left: Option<&str>,
        right: Option<&str>,
        alias: Option<&str>,
    ) -> &mut Self {
        self.joins.push(JoinSpec {
            kind,
            table: table.into(),
            left: left.map(str::to_string),
            right: right.map(str::to_string),
            alias: alias.map(str::to_string),
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

    pub fn where_group(
        &mut self,
        link: Link,
        build: impl FnOnce(&mut WhereClause),
    ) -> &mut Self {
        let mut inner = WhereClause::default();
        build(&mut inner);
        self.where_clause.push_group(inner, link);
        self.cache.invalidate();
        self
    }

    pub fn where_in(
        &mut self,
        column: impl Into<String>,
        values: Vec<Value>,
        link: Link,
    ) -> &mut Self {
        self.where_clause.push_in(column, values, false, link);
        self.cache.invalidate();
        self
    }

    pub fn where_not_in(
        &mut self,
        column: impl Into<String>,
        values: Vec<Value>,
        link: Link,
    ) -> &mut Self {
        self.where_clause.push_in(column, values, true, link);
        self.cache.invalidate();
        self
    }

    pub fn where_between(
        &mut self,
        column: impl Into<String>,
        low: Value,
        high: Value,
        link: Link,
    ) -> &mut Self {
        self.where_clause.push_between(column, low, high, false, link);
        self.cache.invalidate();
        self
    }

    pub fn where_null(&mut self, column: impl Into<String>, link: Link) -> &mut Self {
        self.where_clause.push_null(column, false, link);
        self.cache.invalidate();
        self
    }

    pub fn where_not_null(&mut self, column: impl Into<String>, link: Link) -> &mut Self {
        self.where_clause.push_null(column, true, link);
        self.cache.invalidate();
        self
    }

    pub fn where_raw(&mut self, fragment: impl Into<String>, link: Link) -> &mut Self {
        self.where_clause.push_raw(fragment, link);
        self.cache.invalidate();
        self
    }

    pub fn group_by(&mut self, columns: &[&str]) -> &mut Self {
        self.group_by.extend(columns.iter().map(|c| c.to_string()));
        self.cache.invalidate();
        self
    }

    pub fn with_rollup(&mut self) -> &mut Self {
        self.with_rollup = true;
        self.cache.invalidate();
        self
    }

    pub fn having(
        &mut self,
        column: impl Into<String>,
        value: impl Into<BoundValue>,
        comparison: Comparison,
        link: Link,
    ) -> &mut Self {
        self.having.push(column, value, comparison, link);
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

    pub fn offset(&mut self, page: Option<u64>, manual: u64) -> Result<&mut Self> {
        let limit = self.limit.filter(|l| *l > 0).ok_or_else(|| {
            OrmError::builder("offset() requires a prior positive limit()")
        })?;
        self.offset = Some(match page {
            Some(page) if page >= 1 => (page - 1) * limit,
            _ => manual,
        });
        self.cache.invalidate();
        Ok(self)
    }

    pub fn union(&mut self, other: Select) -> &mut Self {
        self.unions.push(UnionBranch { select: other, all: false });
        self.cache.invalidate();
        self
    }

    pub fn union_all(&mut self, other: Select) -> &mut Self {
        self.unions.push(UnionBranch { select: other, all: true });
        self.cache.invalidate();
        self
    }

    fn build(&self) -> Result<(String, ParameterBag)> {
        if self.from.is_empty() {
            return Err(OrmError::builder("SELECT requires at least one from()"));
        }
        let mut bag = ParameterBag::new();
        let mut sql = String::from("SELECT ");
        if self.distinct {
            sql.push_str("DISTINCT ");
        }
        if self.columns.is_empty() {
            sql.push('*');
        } else {
            sql.push_str(&self.columns.join(", "));
        }

        let mut from_parts = Vec::with_capacity(self.from.len());
        for source in &self.from {
            match source {
                FromSource::Table { name, alias } => match alias {
                    Some(alias) => from_parts.push(format!("{name} AS {alias}")),
                    None => from_parts.push(name.clone()),
                },
                FromSource::Subquery { select, alias } => {
                    let (inner_sql, inner_bag) = select.build()?;
                    let mapping = bag.merge(inner_bag);
                    let inner_sql = rename_placeholders(&inner_sql, &mapping);
                    from_parts.push(format!("({inner_sql}) AS {alias}"));
                }
            }
        }
        sql.push_str(" FROM ");
        sql.push_str(&from_parts.join(", "));

        for join in &self.joins {
            sql.push(' ');
            sql.push_str(&join.to_sql()?);
        }

        if !self.where_clause.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&self.where_clause.to_sql(&mut bag)?);
        }

        if !self.group_by.is_empty() {
            sql.push_str(" GROUP BY ");
            sql.push_str(&self.group_by.join(", "));
            if self.with_rollup {
                sql.push_str(" WITH ROLLUP");
            }
        }

        if !self.having.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&self.having.to_sql(&mut bag)?);
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
        if let Some(offset) = self.offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }

        for branch in &self.unions {
            let (branch_sql, branch_bag) = branch.select.build()?;
            let mapping = bag.merge(branch_bag);
            let branch_sql = rename_placeholders(&branch_sql, &mapping);
            sql.push_str(if branch.all { " UNION ALL " } else { " UNION " });
            sql.push_str(&branch_sql);
        }

        Ok((sql, bag))
    }

    pub fn to_sql(&self) -> Result<String> {
        Ok(self.cache.get_or_build(|| self.build())?.0)
    }

    pub fn parameters(&self) -> Result<ParameterBag> {
        Ok(self.cache.get_or_build(|| self.build())?.1)
    }

    pub async fn fetch_all(&self, db: &dyn Database) -> Result<Vec<Row>> {
        let (sql, bag) = self.cache.get_or_build(|| self.build())?;
        let mut stmt = db.prepare(&sql).await?;
        for (name, value) in bag.entries() {
            stmt.bind(name, value.clone()).await?;
        }
        stmt.query().await
    }

    pub async fn fetch_one(&self, db: &dyn Database) -> Result<Option<Row>> {
        Ok(self.fetch_all(db).await?.into_iter().next())
    }

    pub async fn fetch_scalar(&self, db: &dyn Database, column: &str) -> Result<Option<Value>> {
        Ok(self
            .fetch_one(db)
            .await?
            .and_then(|row| row.get(column).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_select_renders_star_with_no_columns() {
        let mut select = Select::new();
        select.from("users", None);
        assert_eq!(select.to_sql().unwrap(), "SELECT * FROM users");
    }

    #[test]
    fn where_and_order_and_limit_compose() {
        let mut select = Select::new();
        select
            .select(&["id", "username"])
            .from("users", None)
            .r#where("active", Value::Bool(true), Comparison::Eq, Link::And)
            .order_by("id", "DESC")
            .limit(10);
        let sql = select.to_sql().unwrap();
        assert_eq!(
            sql,
            "SELECT id, username FROM users WHERE active = :p1 ORDER BY id DESC LIMIT 10"
        );
    }

    #[test]
    fn to_sql_is_pure_between_calls() {
        let mut select = Select::new();
        select.from("users", None).r#where(
            "id",
            Value::Int(1),
            Comparison::Eq,
            Link::And,
        );
        let first = select.to_sql().unwrap();
        let second = select.to_sql().unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn offset_requires_a_prior_positive_limit() {
        let mut select = Select::new();
        select.from("users", None);
        assert!(select.offset(Some(2), 0).is_err());
        select.limit(20);
        assert!(select.offset(Some(2), 0).is_ok());
        assert!(select.to_sql().unwrap().contains("OFFSET 20"));
    }

    #[test]
    fn missing_from_is_a_builder_error() {
        let select = Select::new();
        assert!(select.to_sql().is_err());
    }

    #[test]
    fn union_all_merges_parameters_from_both_branches() {
        let mut left = Select::new();
        left.from("users", None)
            .r#where("id", Value::Int(1), Comparison::Eq, Link::And);
        let mut right = Select::new();
        right
            .from("users", None)
            .r#where("id", Value::Int(2), Comparison::Eq, Link::And);
        left.union_all(right);
        let sql = left.to_sql().unwrap();
        assert!(sql.contains("UNION ALL"));

        let bag = left.parameters().unwrap();
        assert_eq!(bag.len(), 2);
        // Each placeholder in the rendered SQL must resolve to the value its
        // own branch bound, not to whichever branch happened to reuse `:p1`.
        assert_eq!(
            sql,
            "SELECT * FROM users WHERE id = :p1 UNION ALL SELECT * FROM users WHERE id = :p2"
        );
        assert_eq!(bag.entries()[0], (":p1".to_string(), Value::Int(1)));
        assert_eq!(bag.entries()[1], (":p2".to_string(), Value::Int(2)));
    }
}
