// ============================================================================
// Shared clause helpers
// ============================================================================
//
// Small pieces shared by all four builders: predicate comparisons, AND/OR
// linkage, join types, sort direction, identifier validation, and a
// dirty-flag SQL cache so `to_sql()` is idempotent without recomputing work
// on repeated calls between mutations.

use std::cell::RefCell;

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{OrmError, Result};
use crate::param_bag::{BoundValue, ParameterBag};
use crate::value::Value;

fn identifier_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap())
}

/// DML builders (Insert/Update/Delete) require bare identifiers; Select
/// accepts richer forms (`table.col`, `col AS alias`, `*`, function calls)
/// and is not run through this check.
pub fn validate_identifier(name: &str) -> Result<()> {
    if identifier_pattern().is_match(name) {
        Ok(())
    } else {
        Err(OrmError::builder(format!("invalid identifier: '{name}'")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Eq,
    Ne,
    Lt,
    Lte,
    Gt,
    Gte,
    Like,
    NotLike,
}

impl Comparison {
    fn as_sql(self) -> &'static str {
        match self {
            Comparison::Eq => "=",
            Comparison::Ne => "<>",
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
            Comparison::Like => "LIKE",
            Comparison::NotLike => "NOT LIKE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    And,
    Or,
}

impl Link {
    fn as_sql(self) -> &'static str {
        match self {
            Link::And => "AND",
            Link::Or => "OR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Cross,
}

impl JoinType {
    fn as_sql(self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
            JoinType::Right => "RIGHT JOIN",
            JoinType::Cross => "CROSS JOIN",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

impl Direction {
    /// Any string other than an exact, case-sensitive `"DESC"` coerces to
    /// ascending, per §4.4's `order_by` contract.
    pub fn parse(direction: &str) -> Self {
        if direction == "DESC" {
            Direction::Desc
        } else {
            Direction::Asc
        }
    }

    fn as_sql(self) -> &'static str {
        match self {
            Direction::Asc => "ASC",
            Direction::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct JoinSpec {
    pub kind: JoinType,
    pub table: String,
    pub left: Option<String>,
    pub right: Option<String>,
    pub alias: Option<String>,
}

impl JoinSpec {
    pub fn to_sql(&self) -> Result<String> {
        let table = match &self.alias {
            Some(alias) => format!("{} AS {}", self.table, alias),
            None => self.table.clone(),
        };
        match (self.kind, &self.left, &self.right) {
            (JoinType::Cross, _, _) => Ok(format!("{} {}", self.kind.as_sql(), table)),
            (_, Some(left), Some(right)) => {
                Ok(format!("{} {} ON {} = {}", self.kind.as_sql(), table, left, right))
            }
            _ => Err(OrmError::builder(format!(
                "join on '{}' is missing its ON condition",
                self.table
            ))),
        }
    }
}

#[derive(Debug, Clone)]
enum Predicate {
    Simple {
        link: Link,
        column: String,
        comparison: Comparison,
        value: BoundValue,
    },
    Null {
        link: Link,
        column: String,
        negate: bool,
    },
    InList {
        link: Link,
        column: String,
        values: Vec<Value>,
        negate: bool,
    },
    Between {
        link: Link,
        column: String,
        low: Value,
        high: Value,
        negate: bool,
    },
    Raw {
        link: Link,
        fragment: String,
    },
    Group {
        link: Link,
        inner: WhereClause,
    },
}

/// A parenthesized, linked sequence of predicates; reused for `WHERE` and
/// `HAVING`.
#[derive(Debug, Clone, Default)]
pub struct WhereClause {
    predicates: Vec<Predicate>,
}

impl WhereClause {
    pub fn is_empty(&self) -> bool {
        self.predicates.is_empty()
    }

    pub fn push(
        &mut self,
        column: impl Into<String>,
        value: impl Into<BoundValue>,
        comparison: Comparison,
        link: Link,
    ) -> &mut Self {
        self.predicates.push(Predicate::Simple {
            link,
            column: column.into(),
            comparison,
            value: value.into(),
        });
        self
    }

    pub fn push_null(&mut self, column: impl Into<String>, negate: bool, link: Link) -> &mut Self {
        self.predicates.push(Predicate::Null {
            link,
            column: column.into(),
            negate,
        });
        self
    }

    pub fn push_in(
        &mut self,
        column: impl Into<String>,
        values: Vec<Value>,
        negate: bool,
        link: Link,
    ) -> &mut Self {
        self.predicates.push(Predicate::InList {
            link,
            column: column.into(),
            values,
            negate,
        });
        self
    }

    pub fn push_between(
        &mut self,
        column: impl Into<String>,
        low: Value,
        high: Value,
        negate: bool,
        link: Link,
    ) -> &mut Self {
        self.predicates.push(Predicate::Between {
            link,
            column: column.into(),
            low,
            high,
            negate,
        });
        self
    }

    pub fn push_raw(&mut self, fragment: impl Into<String>, link: Link) -> &mut Self {
        self.predicates.push(Predicate::Raw {
            link,
            fragment: fragment.into(),
        });
        self
    }

    pub fn push_group(&mut self, inner: WhereClause, link: Link) -> &mut Self {
        self.predicates.push(Predicate::Group { link, inner });
        self
    }

    pub fn to_sql(&self, bag: &mut ParameterBag) -> Result<String> {
        let mut parts = Vec::with_capacity(self.predicates.len());
        for (idx, predicate) in self.predicates.iter().enumerate() {
            let link = match predicate {
                Predicate::Simple { link, .. }
                | Predicate::Null { link, .. }
                | Predicate::InList { link, .. }
                | Predicate::Between { link, .. }
                | Predicate::Raw { link, .. }
                | Predicate::Group { link, .. } => *link,
            };
            let rendered = self.render_predicate(predicate, bag)?;
            if idx == 0 {
                parts.push(rendered);
            } else {
                parts.push(format!("{} {}", link.as_sql(), rendered));
            }
        }
        Ok(parts.join(" "))
    }

    fn render_predicate(&self, predicate: &Predicate, bag: &mut ParameterBag) -> Result<String> {
        Ok(match predicate {
            Predicate::Simple {
                column,
                comparison,
                value,
                ..
            } => {
                let rendered = bag.render(value.clone());
                format!("{} {} {}", column, comparison.as_sql(), rendered)
            }
            Predicate::Null { column, negate, .. } => {
                format!("{} IS {}NULL", column, if *negate { "NOT " } else { "" })
            }
            Predicate::InList {
                column,
                values,
                negate,
                ..
            } => {
                if values.is_empty() {
                    return Err(OrmError::builder(format!(
                        "IN/NOT IN on '{column}' requires at least one value"
                    )));
                }
                let placeholders: Vec<String> =
                    values.iter().map(|v| bag.bind(v.clone())).collect();
                format!(
                    "{} {}IN ({})",
                    column,
                    if *negate { "NOT " } else { "" },
                    placeholders.join(", ")
                )
            }
            Predicate::Between {
                column,
                low,
                high,
                negate,
                ..
            } => {
                let low_ph = bag.bind(low.clone());
                let high_ph = bag.bind(high.clone());
                format!(
                    "{} {}BETWEEN {} AND {}",
                    column,
                    if *negate { "NOT " } else { "" },
                    low_ph,
                    high_ph
                )
            }
            Predicate::Raw { fragment, .. } => fragment.clone(),
            Predicate::Group { inner, .. } => format!("({})", inner.to_sql(bag)?),
        })
    }
}

/// Holds the last rendered SQL + parameter bag. Every mutator on a builder
/// must call `invalidate()`; `to_sql()` recomputes only when dirty, keeping
/// repeated calls between mutations byte-identical and cheap.
#[derive(Debug, Default)]
pub struct SqlCache {
    cached: RefCell<Option<(String, ParameterBag)>>,
}

impl SqlCache {
    pub fn invalidate(&self) {
        *self.cached.borrow_mut() = None;
    }

    pub fn get_or_build(
        &self,
        build: impl FnOnce() -> Result<(String, ParameterBag)>,
    ) -> Result<(String, ParameterBag)> {
        if let Some(cached) = self.cached.borrow().as_ref() {
            return Ok(cached.clone());
        }
        let built = build()?;
        *self.cached.borrow_mut() = Some(built.clone());
        Ok(built)
    }
}

impl Clone for SqlCache {
    fn clone(&self) -> Self {
        SqlCache {
            cached: RefCell::new(self.cached.borrow().clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_identifiers_pass() {
        assert!(validate_identifier("username").is_ok());
        assert!(validate_identifier("_private").is_ok());
    }

    #[test]
    fn invalid_identifiers_are_rejected() {
        assert!(validate_identifier("users; DROP TABLE users").is_err());
        assert!(validate_identifier("1col").is_err());
    }

    #[test]
    fn where_clause_links_predicates_with_and_by_default() {
        let mut clause = WhereClause::default();
        clause.push("id", Value::Int(1), Comparison::Eq, Link::And);
        clause.push("active", Value::Bool(true), Comparison::Eq, Link::And);
        let mut bag = ParameterBag::new();
        let sql = clause.to_sql(&mut bag).unwrap();
        assert_eq!(sql, "id = :p1 AND active = :p2");
    }

    #[test]
    fn empty_in_list_is_a_builder_error() {
        let mut clause = WhereClause::default();
        clause.push_in("id", Vec::new(), false, Link::And);
        let mut bag = ParameterBag::new();
        assert!(clause.to_sql(&mut bag).is_err());
    }

    #[test]
    fn direction_parse_coerces_unknown_strings_to_ascending() {
        assert_eq!(Direction::parse("DESC"), Direction::Desc);
        assert_eq!(Direction::parse("sideways"), Direction::Asc);
    }
}
