//! JSON filter language shared by the storage engines.
//!
//! `{ "field": value }` is implicit equality; `{ "field": { "$op": value } }`
//! applies an operator; `$and`, `$or` and `$not` combine clauses. Fields may be
//! dotted paths into nested objects.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Record, StorageError};

/// Raw filter as received from the business layer. `null` matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterSpec(pub Value);

impl FilterSpec {
    pub fn all() -> Self {
        Self(Value::Null)
    }

    pub fn new(value: Value) -> Self {
        Self(value)
    }

    pub fn parse(&self) -> Result<Filter, StorageError> {
        Filter::parse(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
    Exists,
    Like,
}

impl FilterOp {
    fn from_key(key: &str) -> Result<Self, StorageError> {
        Ok(match key {
            "$eq" => FilterOp::Eq,
            "$ne" | "$neq" => FilterOp::Ne,
            "$gt" => FilterOp::Gt,
            "$gte" => FilterOp::Gte,
            "$lt" => FilterOp::Lt,
            "$lte" => FilterOp::Lte,
            "$in" => FilterOp::In,
            "$nin" => FilterOp::Nin,
            "$exists" => FilterOp::Exists,
            "$like" => FilterOp::Like,
            other => return Err(StorageError::InvalidFilter(format!("Unsupported operator: {}", other))),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Field { path: String, op: FilterOp, value: Value },
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
}

/// Parsed filter; a conjunction of conditions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn parse(value: &Value) -> Result<Self, StorageError> {
        match value {
            Value::Null => Ok(Self::default()),
            Value::Object(_) => Ok(Self { conditions: Self::parse_clause(value)? }),
            _ => Err(StorageError::InvalidFilter("filter must be an object".to_string())),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    fn parse_clause(value: &Value) -> Result<Vec<Condition>, StorageError> {
        let obj = value
            .as_object()
            .ok_or_else(|| StorageError::InvalidFilter("clause must be an object".to_string()))?;

        let mut conditions = Vec::new();
        for (key, value) in obj {
            match key.as_str() {
                "$and" | "$or" => {
                    let arr = value
                        .as_array()
                        .ok_or_else(|| StorageError::InvalidFilter(format!("{} requires array", key)))?;
                    let parts = arr
                        .iter()
                        .map(|v| Self::parse_clause(v).map(Condition::And))
                        .collect::<Result<Vec<_>, _>>()?;
                    conditions.push(if key == "$and" { Condition::And(parts) } else { Condition::Or(parts) });
                }
                "$not" => {
                    let inner = Condition::And(Self::parse_clause(value)?);
                    conditions.push(Condition::Not(Box::new(inner)));
                }
                k if k.starts_with('$') => {
                    return Err(StorageError::InvalidFilter(format!("Unsupported operator: {}", k)));
                }
                field => {
                    validate_field_path(field)?;
                    conditions.extend(Self::parse_field(field, value)?);
                }
            }
        }
        Ok(conditions)
    }

    fn parse_field(field: &str, value: &Value) -> Result<Vec<Condition>, StorageError> {
        match value {
            Value::Object(ops) if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() => ops
                .iter()
                .map(|(op_key, op_val)| {
                    let op = FilterOp::from_key(op_key)?;
                    if matches!(op, FilterOp::In | FilterOp::Nin) && !op_val.is_array() {
                        return Err(StorageError::InvalidFilter(format!("{} requires array", op_key)));
                    }
                    if op == FilterOp::Like && !op_val.is_string() {
                        return Err(StorageError::InvalidFilter("$like requires a string pattern".to_string()));
                    }
                    Ok(Condition::Field { path: field.to_string(), op, value: op_val.clone() })
                })
                .collect(),
            // Implicit equality: { field: value }
            _ => Ok(vec![Condition::Field { path: field.to_string(), op: FilterOp::Eq, value: value.clone() }]),
        }
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| c.matches(record))
    }

    /// Render as a SQL predicate over the JSONB `data` column. Placeholders
    /// are numbered from `first_param`.
    pub fn to_sql(&self, first_param: usize) -> Result<(String, Vec<Value>), StorageError> {
        let mut builder = SqlBuilder { params: Vec::new(), first_param };
        let clause = builder.conjunction(&self.conditions)?;
        Ok((clause, builder.params))
    }
}

impl Condition {
    fn matches(&self, record: &Record) -> bool {
        match self {
            Condition::And(parts) => parts.iter().all(|c| c.matches(record)),
            Condition::Or(parts) => parts.iter().any(|c| c.matches(record)),
            Condition::Not(inner) => !inner.matches(record),
            Condition::Field { path, op, value } => {
                let found = lookup(record, path);
                match op {
                    FilterOp::Eq => values_equal(found, value),
                    FilterOp::Ne => !values_equal(found, value),
                    FilterOp::Gt => compare(found, value) == Some(Ordering::Greater),
                    FilterOp::Gte => matches!(compare(found, value), Some(Ordering::Greater | Ordering::Equal)),
                    FilterOp::Lt => compare(found, value) == Some(Ordering::Less),
                    FilterOp::Lte => matches!(compare(found, value), Some(Ordering::Less | Ordering::Equal)),
                    FilterOp::In => value
                        .as_array()
                        .map_or(false, |vs| vs.iter().any(|v| values_equal(found, v))),
                    FilterOp::Nin => value
                        .as_array()
                        .map_or(true, |vs| !vs.iter().any(|v| values_equal(found, v))),
                    FilterOp::Exists => found.is_some() == value.as_bool().unwrap_or(true),
                    FilterOp::Like => match (found, value) {
                        (Some(Value::String(s)), Value::String(pattern)) => like(s, pattern),
                        _ => false,
                    },
                }
            }
        }
    }
}

struct SqlBuilder {
    params: Vec<Value>,
    first_param: usize,
}

impl SqlBuilder {
    fn param(&mut self, value: Value) -> String {
        self.params.push(value);
        format!("${}", self.first_param + self.params.len() - 1)
    }

    fn conjunction(&mut self, conditions: &[Condition]) -> Result<String, StorageError> {
        if conditions.is_empty() {
            return Ok("1=1".to_string());
        }
        let parts = conditions
            .iter()
            .map(|c| self.condition(c))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(parts.join(" AND "))
    }

    fn condition(&mut self, condition: &Condition) -> Result<String, StorageError> {
        match condition {
            Condition::And(parts) => Ok(format!("({})", self.conjunction(parts)?)),
            Condition::Or(parts) => {
                if parts.is_empty() {
                    return Ok("1=0".to_string());
                }
                let sql = parts
                    .iter()
                    .map(|c| self.condition(c))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(format!("({})", sql.join(" OR ")))
            }
            Condition::Not(inner) => Ok(format!("NOT ({})", self.condition(inner)?)),
            Condition::Field { path, op, value } => {
                let column = json_path(path)?;
                Ok(match op {
                    FilterOp::Eq if value.is_null() => format!("({c} IS NULL OR {c} = 'null'::jsonb)", c = column),
                    FilterOp::Ne if value.is_null() => format!("({c} IS NOT NULL AND {c} <> 'null'::jsonb)", c = column),
                    FilterOp::Eq => format!("{} = {}::jsonb", column, self.param(value.clone())),
                    FilterOp::Ne => format!("({c} IS NULL OR {c} <> {p}::jsonb)", c = column, p = self.param(value.clone())),
                    FilterOp::Gt => format!("{} > {}::jsonb", column, self.param(value.clone())),
                    FilterOp::Gte => format!("{} >= {}::jsonb", column, self.param(value.clone())),
                    FilterOp::Lt => format!("{} < {}::jsonb", column, self.param(value.clone())),
                    FilterOp::Lte => format!("{} <= {}::jsonb", column, self.param(value.clone())),
                    FilterOp::In | FilterOp::Nin => {
                        let values = value.as_array().cloned().unwrap_or_default();
                        let negate = *op == FilterOp::Nin;
                        if values.is_empty() {
                            return Ok(if negate { "1=1" } else { "1=0" }.to_string());
                        }
                        let params: Vec<String> = values
                            .into_iter()
                            .map(|v| format!("{}::jsonb", self.param(v)))
                            .collect();
                        if negate {
                            format!("({c} IS NULL OR {c} NOT IN ({p}))", c = column, p = params.join(", "))
                        } else {
                            format!("{} IN ({})", column, params.join(", "))
                        }
                    }
                    FilterOp::Exists => {
                        if value.as_bool().unwrap_or(true) {
                            format!("{} IS NOT NULL", column)
                        } else {
                            format!("{} IS NULL", column)
                        }
                    }
                    FilterOp::Like => {
                        let text_column = json_text_path(path)?;
                        // Bound as a JSON string, unwrapped to text server-side
                        format!("{} LIKE ({}::jsonb #>> '{{}}')", text_column, self.param(value.clone()))
                    }
                })
            }
        }
    }
}

/// Field paths: dot-separated identifiers.
pub fn validate_field_path(path: &str) -> Result<(), StorageError> {
    let valid = !path.is_empty()
        && path.split('.').all(|seg| {
            !seg.is_empty() && seg.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidFilter(format!("Invalid field name: {}", path)))
    }
}

/// `data #> '{a,b}'` for `a.b`; path segments are validated identifiers.
pub fn json_path(path: &str) -> Result<String, StorageError> {
    validate_field_path(path)?;
    Ok(format!("data #> '{{{}}}'", path.replace('.', ",")))
}

fn json_text_path(path: &str) -> Result<String, StorageError> {
    validate_field_path(path)?;
    Ok(format!("data #>> '{{{}}}'", path.replace('.', ",")))
}

/// Resolve a dotted path inside a record.
pub fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let mut current = record.get(segments.next()?)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn values_equal(found: Option<&Value>, expected: &Value) -> bool {
    match (found, expected) {
        (None, Value::Null) | (Some(Value::Null), Value::Null) => true,
        (None, _) => false,
        (Some(a), b) => compare(Some(a), b) == Some(Ordering::Equal) || a == b,
    }
}

/// Ordering between values of the same JSON type; `None` across types.
pub fn compare(found: Option<&Value>, expected: &Value) -> Option<Ordering> {
    match (found?, expected) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

/// Total order used for sorting: missing < null < bool < number < string <
/// array < object, then by value within a type.
pub fn total_cmp(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None => 0,
            Some(Value::Null) => 1,
            Some(Value::Bool(_)) => 2,
            Some(Value::Number(_)) => 3,
            Some(Value::String(_)) => 4,
            Some(Value::Array(_)) => 5,
            Some(Value::Object(_)) => 6,
        }
    }
    rank(a).cmp(&rank(b)).then_with(|| match (a, b) {
        (Some(x), Some(y)) => compare(Some(x), y).unwrap_or_else(|| x.to_string().cmp(&y.to_string())),
        _ => Ordering::Equal,
    })
}

/// SQL LIKE semantics: `%` any run, `_` any single character.
fn like(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    let (mut t, mut p) = (0, 0);
    let (mut star, mut mark) = (None, 0);
    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '_' || pattern[p] == text[t]) {
            t += 1;
            p += 1;
        } else if p < pattern.len() && pattern[p] == '%' {
            star = Some(p);
            mark = t;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            mark += 1;
            t = mark;
        } else {
            return false;
        }
    }
    while p < pattern.len() && pattern[p] == '%' {
        p += 1;
    }
    p == pattern.len()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    #[default]
    Asc,
    Desc,
}

impl SortDirection {
    pub fn to_sql(&self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub field: String,
    pub direction: SortDirection,
}

/// Ordering and paging for `find`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FindOptions {
    #[serde(default)]
    pub order: Vec<SortKey>,
    pub limit: Option<u64>,
    pub offset: Option<u64>,
}

impl FindOptions {
    /// Parse `"name desc, created_at"` style order strings.
    pub fn parse_order(order: &str) -> Result<Vec<SortKey>, StorageError> {
        let mut keys = Vec::new();
        for part in order.split(',') {
            let trimmed = part.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut it = trimmed.split_whitespace();
            if let Some(field) = it.next() {
                validate_field_path(field)?;
                let direction = match it.next() {
                    Some(dir) if dir.eq_ignore_ascii_case("desc") => SortDirection::Desc,
                    Some(dir) if dir.eq_ignore_ascii_case("asc") => SortDirection::Asc,
                    None => SortDirection::Asc,
                    Some(other) => {
                        return Err(StorageError::InvalidFilter(format!("Invalid sort direction: {}", other)))
                    }
                };
                keys.push(SortKey { field: field.to_string(), direction });
            }
        }
        Ok(keys)
    }

    pub fn order_by(mut self, field: impl Into<String>, direction: SortDirection) -> Self {
        self.order.push(SortKey { field: field.into(), direction });
        self
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    /// Apply ordering and paging to records already in memory.
    pub fn apply(&self, mut records: Vec<Record>) -> Vec<Record> {
        sort_records(&mut records, &self.order);
        let offset = self.offset.unwrap_or(0) as usize;
        let limit = self.limit.map(|l| l as usize).unwrap_or(usize::MAX);
        records.into_iter().skip(offset).take(limit).collect()
    }

    pub fn to_sql(&self) -> Result<String, StorageError> {
        let mut clauses = Vec::new();
        if self.order.is_empty() {
            clauses.push("ORDER BY created_at, id".to_string());
        } else {
            let parts = self
                .order
                .iter()
                .map(|k| Ok(format!("{} {}", json_path(&k.field)?, k.direction.to_sql())))
                .collect::<Result<Vec<_>, StorageError>>()?;
            clauses.push(format!("ORDER BY {}", parts.join(", ")));
        }
        if let Some(limit) = self.limit {
            clauses.push(format!("LIMIT {}", limit));
        }
        if let Some(offset) = self.offset {
            clauses.push(format!("OFFSET {}", offset));
        }
        Ok(clauses.join(" "))
    }
}

pub fn sort_records(records: &mut [Record], keys: &[SortKey]) {
    if keys.is_empty() {
        return;
    }
    // Stable, so ties keep insertion order
    records.sort_by(|a, b| {
        keys.iter()
            .map(|k| {
                let ord = total_cmp(lookup(a, &k.field), lookup(b, &k.field));
                match k.direction {
                    SortDirection::Asc => ord,
                    SortDirection::Desc => ord.reverse(),
                }
            })
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });
}
