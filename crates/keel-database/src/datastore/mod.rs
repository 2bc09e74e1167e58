//! Document-oriented storage for control-plane records.
//!
//! Every record kind is stored as a JSON document keyed by id and carrying a
//! version that is bumped on each write. [`DataStore::update`] is a
//! compare-and-swap on that version; callers wanting read-modify-write
//! semantics go through [`crate::repos::Collection::update`], which retries on
//! conflicts.
mod memory;
mod postgres;

use std::{cmp::Ordering, fmt};

use async_trait::async_trait;
use serde_json::Value;

pub use memory::MemoryDataStore;
pub use postgres::PostgresDataStore;

use crate::error::{KeelDatabaseError, KeelDatabaseResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    Application,
    Deployment,
    Command,
    Event,
    Piped,
    Environment,
    DeploymentChain,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Application => "application",
            Kind::Deployment => "deployment",
            Kind::Command => "command",
            Kind::Event => "event",
            Kind::Piped => "piped",
            Kind::Environment => "environment",
            Kind::DeploymentChain => "deployment_chain",
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub version: i64,
    pub data: Value,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    NotEq,
    In,
    Gt,
    Gte,
    Lt,
    Lte,
}

/// A condition on a document field. `field` is a dotted path into the
/// document, e.g. `sync_state.status`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub operator: Operator,
    pub value: Value,
}

impl Filter {
    pub fn new(field: &str, operator: Operator, value: impl Into<Value>) -> Self {
        Self {
            field: field.to_string(),
            operator,
            value: value.into(),
        }
    }

    pub fn eq(field: &str, value: impl Into<Value>) -> Self {
        Self::new(field, Operator::Eq, value)
    }

    pub(crate) fn path(&self) -> KeelDatabaseResult<Vec<&str>> {
        field_path(&self.field)
    }

    /// Evaluates the filter against a document body.
    pub fn matches(&self, data: &Value) -> bool {
        let actual = lookup(data, &self.field);
        let actual = actual.unwrap_or(&Value::Null);
        match self.operator {
            Operator::Eq => values_equal(actual, &self.value),
            Operator::NotEq => !values_equal(actual, &self.value),
            Operator::In => match &self.value {
                Value::Array(items) => items.iter().any(|v| values_equal(actual, v)),
                _ => false,
            },
            Operator::Gt => compare_values(actual, &self.value) == Some(Ordering::Greater),
            Operator::Gte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Operator::Lt => compare_values(actual, &self.value) == Some(Ordering::Less),
            Operator::Lte => matches!(
                compare_values(actual, &self.value),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub field: String,
    pub direction: Direction,
}

/// Filters, ordering and limit of a list call. Results tied on every order
/// field come back sorted by id ascending; a zero limit means unbounded.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListOptions {
    pub filters: Vec<Filter>,
    pub orders: Vec<Order>,
    pub limit: usize,
}

impl ListOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, field: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::eq(field, value))
    }

    pub fn order(mut self, field: &str, direction: Direction) -> Self {
        self.orders.push(Order {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub(crate) fn validate(&self) -> KeelDatabaseResult {
        for f in &self.filters {
            f.path()?;
            if f.operator == Operator::In && !f.value.is_array() {
                return Err(KeelDatabaseError::InvalidArgument(format!(
                    "filter on {} with IN operator requires an array",
                    f.field
                )));
            }
        }
        for o in &self.orders {
            field_path(&o.field)?;
        }
        Ok(())
    }

    /// Orders `docs` in place according to `orders`, falling back to id.
    pub(crate) fn sort(&self, docs: &mut [Document]) {
        docs.sort_by(|a, b| {
            for o in &self.orders {
                let av = lookup(&a.data, &o.field).unwrap_or(&Value::Null);
                let bv = lookup(&b.data, &o.field).unwrap_or(&Value::Null);
                let ord = compare_values(av, bv).unwrap_or(Ordering::Equal);
                let ord = match o.direction {
                    Direction::Asc => ord,
                    Direction::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.id.cmp(&b.id)
        });
    }
}

#[async_trait]
pub trait DataStore: Send + Sync + 'static {
    async fn get(&self, kind: Kind, id: &str) -> KeelDatabaseResult<Document>;

    /// Inserts a new document, failing with `AlreadyExists` when the id is taken.
    async fn create(&self, kind: Kind, id: &str, data: Value) -> KeelDatabaseResult<Document>;

    /// Inserts or overwrites a document regardless of its version.
    async fn put(&self, kind: Kind, id: &str, data: Value) -> KeelDatabaseResult<Document>;

    /// Overwrites a document only when its stored version equals `version`.
    async fn update(
        &self,
        kind: Kind,
        id: &str,
        version: i64,
        data: Value,
    ) -> KeelDatabaseResult<Document>;

    async fn list(&self, kind: Kind, opts: &ListOptions) -> KeelDatabaseResult<Vec<Document>>;
}

fn field_path(field: &str) -> KeelDatabaseResult<Vec<&str>> {
    let parts: Vec<&str> = field.split('.').collect();
    let valid = parts.iter().all(|p| {
        !p.is_empty() && p.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    });
    if !valid {
        return Err(KeelDatabaseError::InvalidArgument(format!(
            "invalid field name {:?}",
            field
        )));
    }
    Ok(parts)
}

fn lookup<'a>(data: &'a Value, field: &str) -> Option<&'a Value> {
    field.split('.').try_fold(data, |v, key| v.get(key))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => compare_values(a, b) == Some(Ordering::Equal),
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => x.as_f64()?.partial_cmp(&y.as_f64()?),
        },
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}
