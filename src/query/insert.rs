// ============================================================================
// INSERT builder
// ============================================================================

use crate::database::Database;
use crate::error::{OrmError, Result};
use crate::param_bag::{rename_placeholders, BoundValue, ParameterBag};
use crate::value::Value;

use super::clause::{validate_identifier, SqlCache};
use super::select::Select;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConflictMode {
    None,
    Ignore,
    Replace,
}

#[derive(Debug, Clone)]
enum RowSource {
    Values(Vec<Vec<(String, BoundValue)>>),
    FromSelect { columns: Vec<String>, select: Box<Select> },
}

#[derive(Debug, Clone)]
pub struct Insert {
    table: Option<String>,
    rows: Option<RowSource>,
    conflict: ConflictMode,
    on_duplicate_key_update: Vec<(String, BoundValue)>,
    cache: SqlCache,
}

impl Default for Insert {
    fn default() -> Self {
        Self {
            table: None,
            rows: None,
            conflict: ConflictMode::None,
            on_duplicate_key_update: Vec::new(),
            cache: SqlCache::default(),
        }
    }
}

impl Insert {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into(&mut self, table: impl Into<String>) -> &mut Self {
        self.table = Some(table.into());
        self.cache.invalidate();
        self
    }

    /// Adds one row. Repeated calls append additional rows for a
    /// multi-row `INSERT ... VALUES (...), (...)`.
    pub fn set(&mut self, assignments: Vec<(&str, Value)>) -> Result<&mut Self> {
        let mut row = Vec::with_capacity(assignments.len());
        for (column, value) in assignments {
            validate_identifier(column)?;
            row.push((column.to_string(), BoundValue::from(value)));
        }
        match &mut self.rows {
            Some(RowSource::Values(existing)) => existing.push(row),
            Some(RowSource::FromSelect { .. }) => {
                return Err(OrmError::builder(
                    "cannot mix set()/batch_values() with from_select()",
                ))
            }
            None => self.rows = Some(RowSource::Values(vec![row])),
        }
        self.cache.invalidate();
        Ok(self)
    }

    pub fn batch_values(&mut self, rows: Vec<Vec<(&str, Value)>>) -> Result<&mut Self> {
        for row in rows {
            self.set(row)?;
        }
        Ok(self)
    }

    pub fn from_select(&mut self, columns: &[&str], select: Select) -> &mut Self {
        self.rows = Some(RowSource::FromSelect {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            select: Box::new(select),
        });
        self.cache.invalidate();
        self
    }

    pub fn ignore(&mut self) -> &mut Self {
        self.conflict = ConflictMode::Ignore;
        self.cache.invalidate();
        self
    }

    pub fn replace(&mut self) -> &mut Self {
        self.conflict = ConflictMode::Replace;
        self.cache.invalidate();
        self
    }

    pub fn on_duplicate_key_update(&mut self, assignments: Vec<(&str, Value)>) -> Result<&mut Self> {
        for (column, value) in assignments {
            validate_identifier(column)?;
            self.on_duplicate_key_update
                .push((column.to_string(), BoundValue::from(value)));
        }
        self.cache.invalidate();
        Ok(self)
    }

    fn build(&self) -> Result<(String, ParameterBag)> {
        let table = self
            .table
            .as_ref()
            .ok_or_else(|| OrmError::builder("INSERT requires into()"))?;
        validate_identifier(table)?;
        let rows = self
            .rows
            .as_ref()
            .ok_or_else(|| OrmError::builder("INSERT requires at least one row via set()"))?;

        if self.conflict == ConflictMode::Replace && !self.on_duplicate_key_update.is_empty() {
            return Err(OrmError::builder(
                "replace() and on_duplicate_key_update() are mutually exclusive",
            ));
        }

        let mut bag = ParameterBag::new();
        let verb = match self.conflict {
            ConflictMode::Replace => "REPLACE INTO",
            ConflictMode::Ignore => "INSERT IGNORE INTO",
            ConflictMode::None => "INSERT INTO",
        };

        let mut sql = match rows {
            RowSource::Values(rows) => {
                // Column list is the union of keys across all rows, in
                // first-seen order; a row missing a column gets an explicit
                // bound NULL for it rather than rejecting the batch.
                let mut columns: Vec<String> = Vec::new();
                for row in rows {
                    for (column, _) in row {
                        if !columns.contains(column) {
                            columns.push(column.clone());
                        }
                    }
                }
                let mut value_groups = Vec::with_capacity(rows.len());
                for row in rows {
                    let placeholders: Vec<String> = columns
                        .iter()
                        .map(|column| {
                            let bound = row
                                .iter()
                                .find(|(c, _)| c == column)
                                .map(|(_, value)| value.clone())
                                .unwrap_or_else(|| BoundValue::from(Value::Null));
                            bag.render(bound)
                        })
                        .collect();
                    value_groups.push(format!("({})", placeholders.join(", ")));
                }
                format!(
                    "{verb} {table} ({}) VALUES {}",
                    columns.join(", "),
                    value_groups.join(", ")
                )
            }
            RowSource::FromSelect { columns, select } => {
                let select_sql = select.to_sql()?;
                let select_bag = select.parameters()?;
                let mapping = bag.merge(select_bag);
                let select_sql = rename_placeholders(&select_sql, &mapping);
                format!("{verb} {table} ({}) {select_sql}", columns.join(", "))
            }
        };

        if !self.on_duplicate_key_update.is_empty() {
            let assignments: Vec<String> = self
                .on_duplicate_key_update
                .iter()
                .map(|(col, value)| format!("{col} = {}", bag.render(value.clone())))
                .collect();
            sql.push_str(" ON DUPLICATE KEY UPDATE ");
            sql.push_str(&assignments.join(", "));
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
