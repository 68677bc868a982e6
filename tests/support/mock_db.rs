// ============================================================================
// MockDatabase
// ============================================================================
//
// An in-process `Database`/`Statement` pair for the scenario tests: tables
// are plain `Vec<Row>` behind a mutex, each with a naive auto-increment
// counter. The engine only ever emits the small set of statement shapes its
// own query builders produce, so this interprets that shape with a few
// regexes rather than carrying a real SQL parser.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use regex::Regex;
use rustorm::database::{Database, Row, Statement};
use rustorm::error::{OrmError, Result};
use rustorm::value::Value;

#[derive(Default)]
struct Table {
    rows: Vec<Row>,
    next_id: i64,
}

/// One executed statement, captured for test assertions: the rendered SQL
/// plus whatever values got bound to its placeholders.
#[derive(Debug, Clone)]
pub struct Executed {
    pub sql: String,
    pub bound: HashMap<String, Value>,
}

#[derive(Clone, Default)]
pub struct MockDatabase {
    tables: Arc<Mutex<HashMap<String, Table>>>,
    last_insert_id: Arc<Mutex<i64>>,
    log: Arc<Mutex<Vec<Executed>>>,
}

impl MockDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every row currently in `table`, for test assertions.
    pub fn rows_of(&self, table: &str) -> Vec<Row> {
        self.tables
            .lock()
            .unwrap()
            .get(table)
            .map(|t| t.rows.clone())
            .unwrap_or_default()
    }

    /// Every statement executed so far, in emission order.
    pub fn log(&self) -> Vec<Executed> {
        self.log.lock().unwrap().clone()
    }

    pub fn clear_log(&self) {
        self.log.lock().unwrap().clear();
    }
}

fn insert_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:INSERT INTO|INSERT IGNORE INTO|REPLACE INTO) (\w+) \(([^)]+)\) VALUES \(([^)]+)\)").unwrap()
    })
}

fn update_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^UPDATE (\w+) SET (.+) WHERE (.+)$").unwrap())
}

fn delete_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^DELETE FROM (\w+) WHERE (.+)$").unwrap())
}

fn select_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^SELECT (?:.+) FROM (\w+)(?: WHERE (.+?))?(?: ORDER BY (\w+) (ASC|DESC))?(?: LIMIT (\d+))?$",
        )
        .unwrap()
    })
}

fn assignment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+) = (:p\d+)$").unwrap())
}

fn predicate_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\w+) = (:p\d+)$").unwrap())
}

fn resolve(placeholder: &str, bound: &HashMap<String, Value>) -> Result<Value> {
    bound
        .get(placeholder)
        .cloned()
        .ok_or_else(|| OrmError::database(format!("mock database: unbound placeholder {placeholder}")))
}

fn row_matches(row: &Row, conditions: &[(String, Value)]) -> bool {
    conditions.iter().all(|(column, value)| row.get(column) == Some(value))
}

pub struct MockStatement {
    sql: String,
    tables: Arc<Mutex<HashMap<String, Table>>>,
    last_insert_id: Arc<Mutex<i64>>,
    log: Arc<Mutex<Vec<Executed>>>,
    bound: HashMap<String, Value>,
}

impl MockStatement {
    fn new(
        sql: String,
        tables: Arc<Mutex<HashMap<String, Table>>>,
        last_insert_id: Arc<Mutex<i64>>,
        log: Arc<Mutex<Vec<Executed>>>,
    ) -> Self {
        Self { sql, tables, last_insert_id, log, bound: HashMap::new() }
    }

    fn record(&self) {
        self.log.lock().unwrap().push(Executed { sql: self.sql.clone(), bound: self.bound.clone() });
    }

    fn run_insert(&self) -> Result<u64> {
        let caps = insert_re()
            .captures(&self.sql)
            .ok_or_else(|| OrmError::database(format!("mock database: cannot parse INSERT: {}", self.sql)))?;
        let table_name = caps.get(1).unwrap().as_str().to_string();
        let columns: Vec<&str> = caps.get(2).unwrap().as_str().split(", ").collect();
        let placeholders: Vec<&str> = caps.get(3).unwrap().as_str().split(", ").collect();

        let mut tables = self.tables.lock().unwrap();
        let table = tables.entry(table_name).or_default();
        table.next_id += 1;
        let assigned_id = table.next_id;

        let mut row: Row = HashMap::new();
        for (column, placeholder) in columns.iter().zip(placeholders.iter()) {
            let value = resolve(placeholder, &self.bound)?;
            row.insert(column.to_string(), value);
        }
        row.entry("id".to_string()).or_insert(Value::Int(assigned_id));
        table.rows.push(row);

        *self.last_insert_id.lock().unwrap() = assigned_id;
        Ok(1)
    }

    fn run_update(&self) -> Result<u64> {
        let caps = update_re()
            .captures(&self.sql)
            .ok_or_else(|| OrmError::database(format!("mock database: cannot parse UPDATE: {}", self.sql)))?;
        let table_name = caps.get(1).unwrap().as_str();
        let assignments = parse_assignments(caps.get(2).unwrap().as_str(), &self.bound)?;
        let conditions = parse_conditions(caps.get(3).unwrap().as_str(), &self.bound)?;

        let mut tables = self.tables.lock().unwrap();
        let Some(table) = tables.get_mut(table_name) else {
            return Ok(0);
        };
        let mut affected = 0;
        for row in &mut table.rows {
            if row_matches(row, &conditions) {
                for (column, value) in &assignments {
                    row.insert(column.clone(), value.clone());
                }
                affected += 1;
            }
        }
        Ok(affected)
    }

    fn run_delete(&self) -> Result<u64> {
        let caps = delete_re()
            .captures(&self.sql)
            .ok_or_else(|| OrmError::database(format!("mock database: cannot parse DELETE: {}", self.sql)))?;
        let table_name = caps.get(1).unwrap().as_str();
        let conditions = parse_conditions(caps.get(2).unwrap().as_str(), &self.bound)?;

        let mut tables = self.tables.lock().unwrap();
        let Some(table) = tables.get_mut(table_name) else {
            return Ok(0);
        };
        let before = table.rows.len();
        table.rows.retain(|row| !row_matches(row, &conditions));
        Ok((before - table.rows.len()) as u64)
    }

    fn run_select(&self) -> Result<Vec<Row>> {
        let caps = select_re()
            .captures(&self.sql)
            .ok_or_else(|| OrmError::database(format!("mock database: cannot parse SELECT: {}", self.sql)))?;
        let table_name = caps.get(1).unwrap().as_str();
        let conditions = match caps.get(2) {
            Some(where_clause) => parse_conditions(where_clause.as_str(), &self.bound)?,
            None => Vec::new(),
        };

        let tables = self.tables.lock().unwrap();
        let mut rows: Vec<Row> = tables
            .get(table_name)
            .map(|t| t.rows.iter().filter(|row| row_matches(row, &conditions)).cloned().collect())
            .unwrap_or_default();

        if let (Some(column), Some(direction)) = (caps.get(3), caps.get(4)) {
            let column = column.as_str();
            let ascending = direction.as_str() == "ASC";
            rows.sort_by(|a, b| {
                let ordering = a.get(column).cmp(&b.get(column));
                if ascending {
                    ordering
                } else {
                    ordering.reverse()
                }
            });
        }

        if let Some(limit) = caps.get(5) {
            let limit: usize = limit.as_str().parse().unwrap_or(rows.len());
            rows.truncate(limit);
        }

        Ok(rows)
    }
}

fn parse_assignments(text: &str, bound: &HashMap<String, Value>) -> Result<Vec<(String, Value)>> {
    text.split(", ")
        .map(|part| {
            let caps = assignment_re()
                .captures(part)
                .ok_or_else(|| OrmError::database(format!("mock database: cannot parse assignment: {part}")))?;
            let column = caps.get(1).unwrap().as_str().to_string();
            let value = resolve(caps.get(2).unwrap().as_str(), bound)?;
            Ok((column, value))
        })
        .collect()
}

fn parse_conditions(text: &str, bound: &HashMap<String, Value>) -> Result<Vec<(String, Value)>> {
    text.split(" AND ")
        .map(|part| {
            let caps = predicate_re()
                .captures(part)
                .ok_or_else(|| OrmError::database(format!("mock database: cannot parse predicate: {part}")))?;
            let column = caps.get(1).unwrap().as_str().to_string();
            let value = resolve(caps.get(2).unwrap().as_str(), bound)?;
            Ok((column, value))
        })
        .collect()
}

#[async_trait]
impl Statement for MockStatement {
    async fn bind(&mut self, name: &str, value: Value) -> Result<()> {
        self.bound.insert(name.to_string(), value);
        Ok(())
    }

    async fn query(&mut self) -> Result<Vec<Row>> {
        self.record();
        self.run_select()
    }

    async fn execute(&mut self) -> Result<u64> {
        self.record();
        let trimmed = self.sql.trim_start();
        if trimmed.starts_with("INSERT") || trimmed.starts_with("REPLACE") {
            self.run_insert()
        } else if trimmed.starts_with("UPDATE") {
            self.run_update()
        } else if trimmed.starts_with("DELETE") {
            self.run_delete()
        } else {
            Err(OrmError::database(format!("mock database: unsupported statement: {}", self.sql)))
        }
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl Database for MockDatabase {
    async fn prepare(&self, sql: &str) -> Result<Box<dyn Statement>> {
        Ok(Box::new(MockStatement::new(
            sql.to_string(),
            self.tables.clone(),
            self.last_insert_id.clone(),
            self.log.clone(),
        )))
    }

    async fn exec(&self, sql: &str) -> Result<u64> {
        let mut stmt = self.prepare(sql).await?;
        stmt.execute().await
    }

    async fn begin_transaction(&self) -> Result<()> {
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        Ok(())
    }

    async fn in_transaction(&self) -> Result<bool> {
        Ok(false)
    }

    async fn last_insert_id(&self) -> Result<String> {
        Ok(self.last_insert_id.lock().unwrap().to_string())
    }

    fn quote(&self, s: &str) -> String {
        format!("'{}'", s.replace('\'', "''"))
    }
}
