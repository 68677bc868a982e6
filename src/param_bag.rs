// ============================================================================
// Parameter bag
// ============================================================================
//
// Collects typed named parameters during SQL construction and binds them to
// a prepared statement at execution time. Placeholders are `:p<monotonic>`;
// no value a caller supplies is ever spliced into the SQL string directly,
// which is what keeps the query builder free of injection.

use std::sync::OnceLock;

use regex::Regex;

use crate::value::Value;

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r":p\d+").unwrap())
}

/// Rewrites every `:pN` placeholder appearing in `sql` per `mapping` (the
/// `(old, new)` pairs `ParameterBag::merge` returns). Callers that splice a
/// child builder's already-rendered SQL into their own — subqueries, UNION
/// branches — merge its bag under freshly numbered placeholders and must
/// rewrite that SQL to match, or the text and the bag disagree on what each
/// `:pN` means.
///
/// Matches are located with a single regex pass rather than sequential
/// string replacement, since `:p1` is a textual prefix of `:p10`: replacing
/// one at a time would corrupt placeholders with more than nine params.
pub fn rename_placeholders(sql: &str, mapping: &[(String, String)]) -> String {
    if mapping.is_empty() {
        return sql.to_string();
    }
    placeholder_pattern()
        .replace_all(sql, |caps: &regex::Captures| {
            let found = &caps[0];
            mapping
                .iter()
                .find(|(old, _)| old == found)
                .map(|(_, new)| new.clone())
                .unwrap_or_else(|| found.to_string())
        })
        .into_owned()
}

/// A literal SQL fragment spliced verbatim where a value is expected —
/// `NOW()`, `col + 1`, or any other expression that should not be bound as a
/// parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raw(pub String);

impl Raw {
    pub fn new(fragment: impl Into<String>) -> Self {
        Raw(fragment.into())
    }
}

/// Anything that can appear on the value side of a builder call.
#[derive(Debug, Clone)]
pub enum BoundValue {
    Value(Value),
    Raw(Raw),
}

impl From<Value> for BoundValue {
    fn from(v: Value) -> Self {
        BoundValue::Value(v)
    }
}

impl From<Raw> for BoundValue {
    fn from(v: Raw) -> Self {
        BoundValue::Raw(v)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParameterBag {
    params: Vec<(String, Value)>,
    next_id: u32,
}

impl ParameterBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves the next placeholder and records its value; returns the
    /// placeholder text (`:p1`, `:p2`, ...) to splice into the SQL string.
    pub fn bind(&mut self, value: Value) -> String {
        self.next_id += 1;
        let placeholder = format!(":p{}", self.next_id);
        self.params.push((placeholder.clone(), value));
        placeholder
    }

    /// Renders a `BoundValue` to SQL text, binding a parameter only for the
    /// `Value` case; `Raw` fragments are spliced verbatim and bind nothing.
    pub fn render(&mut self, value: BoundValue) -> String {
        match value {
            BoundValue::Value(v) => self.bind(v),
            BoundValue::Raw(r) => r.0,
        }
    }

    pub fn entries(&self) -> &[(String, Value)] {
        &self.params
    }

    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }

    pub fn len(&self) -> usize {
        self.params.len()
    }

    /// Merges `other`'s bound values in under freshly allocated placeholder
    /// names (this bag's numbering may already be past `other`'s), returning
    /// the `(old_name, new_name)` pairs so the caller can rewrite `other`'s
    /// already-rendered SQL text with [`rename_placeholders`] to match.
    #[must_use]
    pub fn merge(&mut self, other: ParameterBag) -> Vec<(String, String)> {
        other
            .params
            .into_iter()
            .map(|(old, value)| {
                let new = self.bind(value);
                (old, new)
            })
            .collect()
    }
}
