//! Aggregate pipelines evaluated over records.
//!
//! Supported stages: `$match`, `$sort`, `$skip`, `$limit`, `$project`,
//! `$count` and `$group` (accumulators `$sum`, `$avg`, `$min`, `$max`,
//! `$count`). Engines may push a leading `$match` down to their backend and
//! evaluate the rest here.

use serde::Deserialize;
use serde_json::{Map, Number, Value};

use super::filter::{lookup, sort_records, total_cmp, validate_field_path, Filter, SortDirection, SortKey};
use super::{Record, StorageError};

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(Filter),
    Sort(Vec<SortKey>),
    Skip(usize),
    Limit(usize),
    Project { fields: Vec<String>, include: bool },
    Count(String),
    Group { key: Operand, accumulators: Vec<(String, Accumulator)> },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Field(String),
    Literal(Value),
}

impl Operand {
    fn parse(value: &Value) -> Result<Self, StorageError> {
        match value {
            Value::String(s) if s.starts_with('$') => {
                let path = &s[1..];
                validate_field_path(path)?;
                Ok(Operand::Field(path.to_string()))
            }
            other => Ok(Operand::Literal(other.clone())),
        }
    }

    fn eval(&self, record: &Record) -> Value {
        match self {
            Operand::Field(path) => lookup(record, path).cloned().unwrap_or(Value::Null),
            Operand::Literal(v) => v.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Accumulator {
    Sum(Operand),
    Avg(Operand),
    Min(Operand),
    Max(Operand),
    Count,
}

impl Accumulator {
    fn parse(name: &str, value: &Value) -> Result<Self, StorageError> {
        let spec = value
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| StorageError::InvalidFilter(format!("accumulator '{}' must have one operator", name)))?;
        let (op, arg) = spec.iter().next().ok_or_else(|| StorageError::InvalidFilter(name.to_string()))?;
        Ok(match op.as_str() {
            "$sum" => Accumulator::Sum(Operand::parse(arg)?),
            "$avg" => Accumulator::Avg(Operand::parse(arg)?),
            "$min" => Accumulator::Min(Operand::parse(arg)?),
            "$max" => Accumulator::Max(Operand::parse(arg)?),
            "$count" => Accumulator::Count,
            other => return Err(StorageError::InvalidFilter(format!("Unsupported accumulator: {}", other))),
        })
    }
}

/// A parsed aggregate pipeline.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(try_from = "Value")]
pub struct PipelineSpec {
    stages: Vec<Stage>,
}

impl TryFrom<Value> for PipelineSpec {
    type Error = StorageError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        PipelineSpec::parse(&value)
    }
}

impl PipelineSpec {
    pub fn parse(value: &Value) -> Result<Self, StorageError> {
        let stages = value
            .as_array()
            .ok_or_else(|| StorageError::InvalidFilter("pipeline must be an array".to_string()))?
            .iter()
            .map(Self::parse_stage)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stages })
    }

    fn parse_stage(value: &Value) -> Result<Stage, StorageError> {
        let obj = value
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| StorageError::InvalidFilter("each stage must have exactly one operator".to_string()))?;
        let (name, arg) = obj
            .iter()
            .next()
            .ok_or_else(|| StorageError::InvalidFilter("empty stage".to_string()))?;

        match name.as_str() {
            "$match" => Ok(Stage::Match(Filter::parse(arg)?)),
            "$sort" => {
                let spec = arg
                    .as_object()
                    .ok_or_else(|| StorageError::InvalidFilter("$sort requires an object".to_string()))?;
                let keys = spec
                    .iter()
                    .map(|(field, dir)| {
                        validate_field_path(field)?;
                        let direction = match dir.as_i64() {
                            Some(1) => SortDirection::Asc,
                            Some(-1) => SortDirection::Desc,
                            _ => return Err(StorageError::InvalidFilter(format!("$sort direction for '{}' must be 1 or -1", field))),
                        };
                        Ok(SortKey { field: field.clone(), direction })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Stage::Sort(keys))
            }
            "$skip" => Ok(Stage::Skip(Self::count_arg(name, arg)?)),
            "$limit" => Ok(Stage::Limit(Self::count_arg(name, arg)?)),
            "$project" => {
                let spec = arg
                    .as_object()
                    .filter(|o| !o.is_empty())
                    .ok_or_else(|| StorageError::InvalidFilter("$project requires a non-empty object".to_string()))?;
                let include = spec.values().all(Self::truthy);
                if !include && spec.values().any(Self::truthy) {
                    return Err(StorageError::InvalidFilter("$project cannot mix inclusion and exclusion".to_string()));
                }
                let fields = spec
                    .keys()
                    .map(|f| validate_field_path(f).map(|_| f.clone()))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Stage::Project { fields, include })
            }
            "$count" => {
                let field = arg
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| StorageError::InvalidFilter("$count requires a field name".to_string()))?;
                Ok(Stage::Count(field.to_string()))
            }
            "$group" => {
                let spec = arg
                    .as_object()
                    .ok_or_else(|| StorageError::InvalidFilter("$group requires an object".to_string()))?;
                let key = Operand::parse(spec.get("_id").unwrap_or(&Value::Null))?;
                let accumulators = spec
                    .iter()
                    .filter(|(k, _)| k.as_str() != "_id")
                    .map(|(k, v)| Ok((k.clone(), Accumulator::parse(k, v)?)))
                    .collect::<Result<Vec<_>, StorageError>>()?;
                Ok(Stage::Group { key, accumulators })
            }
            other => Err(StorageError::InvalidFilter(format!("Unsupported pipeline stage: {}", other))),
        }
    }

    fn count_arg(name: &str, arg: &Value) -> Result<usize, StorageError> {
        arg.as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| StorageError::InvalidFilter(format!("{} requires a non-negative integer", name)))
    }

    fn truthy(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Number(n) => n.as_f64().map_or(false, |f| f != 0.0),
            _ => false,
        }
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Split off a leading `$match` so a backend can evaluate it natively.
    pub fn split_leading_match(&self) -> (Option<&Filter>, &[Stage]) {
        match self.stages.split_first() {
            Some((Stage::Match(filter), rest)) => (Some(filter), rest),
            _ => (None, &self.stages),
        }
    }

    pub fn run(&self, records: Vec<Record>) -> Vec<Record> {
        run_stages(&self.stages, records)
    }
}

pub fn run_stages(stages: &[Stage], mut records: Vec<Record>) -> Vec<Record> {
    for stage in stages {
        records = match stage {
            Stage::Match(filter) => records.into_iter().filter(|r| filter.matches(r)).collect(),
            Stage::Sort(keys) => {
                sort_records(&mut records, keys);
                records
            }
            Stage::Skip(n) => records.into_iter().skip(*n).collect(),
            Stage::Limit(n) => records.into_iter().take(*n).collect(),
            Stage::Project { fields, include } => records
                .into_iter()
                .map(|r| project(r, fields, *include))
                .collect(),
            Stage::Count(field) => {
                let mut out = Record::new();
                out.insert(field.clone(), Value::from(records.len() as u64));
                vec![out]
            }
            Stage::Group { key, accumulators } => group(records, key, accumulators),
        };
    }
    records
}

fn project(record: Record, fields: &[String], include: bool) -> Record {
    if include {
        let mut out = Record::new();
        // id is kept unless explicitly listed otherwise
        if let Some(id) = record.get("id") {
            out.insert("id".to_string(), id.clone());
        }
        for field in fields {
            if let Some(v) = lookup(&record, field) {
                out.insert(field.clone(), v.clone());
            }
        }
        out
    } else {
        let mut out = record;
        for field in fields {
            out.remove(field);
        }
        out
    }
}

#[derive(Debug)]
enum AccState {
    Sum { total: f64, integral: bool },
    Avg { total: f64, n: u64 },
    Min(Option<Value>),
    Max(Option<Value>),
    Count(u64),
}

impl AccState {
    fn new(acc: &Accumulator) -> Self {
        match acc {
            Accumulator::Sum(_) => AccState::Sum { total: 0.0, integral: true },
            Accumulator::Avg(_) => AccState::Avg { total: 0.0, n: 0 },
            Accumulator::Min(_) => AccState::Min(None),
            Accumulator::Max(_) => AccState::Max(None),
            Accumulator::Count => AccState::Count(0),
        }
    }

    fn feed(&mut self, acc: &Accumulator, record: &Record) {
        match (self, acc) {
            (AccState::Sum { total, integral }, Accumulator::Sum(op)) => {
                if let Value::Number(n) = op.eval(record) {
                    *integral &= n.is_i64() || n.is_u64();
                    *total += n.as_f64().unwrap_or(0.0);
                }
            }
            (AccState::Avg { total, n }, Accumulator::Avg(op)) => {
                if let Some(f) = op.eval(record).as_f64() {
                    *total += f;
                    *n += 1;
                }
            }
            (AccState::Min(current), Accumulator::Min(op)) => {
                let v = op.eval(record);
                if !v.is_null() && current.as_ref().map_or(true, |c| total_cmp(Some(&v), Some(c)).is_lt()) {
                    *current = Some(v);
                }
            }
            (AccState::Max(current), Accumulator::Max(op)) => {
                let v = op.eval(record);
                if !v.is_null() && current.as_ref().map_or(true, |c| total_cmp(Some(&v), Some(c)).is_gt()) {
                    *current = Some(v);
                }
            }
            (AccState::Count(n), Accumulator::Count) => *n += 1,
            _ => {}
        }
    }

    fn finish(self) -> Value {
        match self {
            AccState::Sum { total, integral: true } => Value::from(total as i64),
            AccState::Sum { total, .. } => float(total),
            AccState::Avg { n: 0, .. } => Value::Null,
            AccState::Avg { total, n } => float(total / n as f64),
            AccState::Min(v) | AccState::Max(v) => v.unwrap_or(Value::Null),
            AccState::Count(n) => Value::from(n),
        }
    }
}

fn float(f: f64) -> Value {
    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
}

fn group(records: Vec<Record>, key: &Operand, accumulators: &[(String, Accumulator)]) -> Vec<Record> {
    // Groups are emitted in order of first appearance
    let mut groups: Vec<(Value, Vec<AccState>)> = Vec::new();
    for record in &records {
        let k = key.eval(record);
        let idx = match groups.iter().position(|(gk, _)| *gk == k) {
            Some(idx) => idx,
            None => {
                groups.push((k, accumulators.iter().map(|(_, a)| AccState::new(a)).collect()));
                groups.len() - 1
            }
        };
        for (state, (_, acc)) in groups[idx].1.iter_mut().zip(accumulators) {
            state.feed(acc, record);
        }
    }

    groups
        .into_iter()
        .map(|(k, states)| {
            let mut out = Map::new();
            out.insert("_id".to_string(), k);
            for (state, (name, _)) in states.into_iter().zip(accumulators) {
                out.insert(name.clone(), state.finish());
            }
            out
        })
        .collect()
}
