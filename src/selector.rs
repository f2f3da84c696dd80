//! Field selections and filters of a subscription.
//!
//! Field selections use GraphQL notation (`{ id name organization { id } }`)
//! and pick which parts of an item snapshot are delivered. Filters use the
//! where-input notation of the model API (`{ "status": "open", "amount_gt": 10 }`)
//! and decide which changes are delivered at all.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};

use crate::error::SelectorError;

/// Deepest nesting accepted in field selections and filters.
pub const MAX_NESTING_DEPTH: usize = 32;

fn check_depth(depth: usize) -> Result<(), SelectorError> {
    if depth > MAX_NESTING_DEPTH {
        return Err(SelectorError::TooDeep { limit: MAX_NESTING_DEPTH });
    }
    Ok(())
}

/// Canonical form of a field selection string.
///
/// Wraps bare selections in braces and normalises spacing:
/// `"id  name{ id }"` becomes `"{ id name { id } }"`.
pub fn normalize_fields_string(fields: &str) -> String {
    let trimmed = fields.trim();
    let wrapped = if trimmed.is_empty() {
        "{}".to_string()
    } else if !trimmed.starts_with('{') {
        format!("{{{}}}", trimmed)
    } else {
        trimmed.to_string()
    };

    let mut expanded = String::with_capacity(wrapped.len() * 2);
    for ch in wrapped.chars() {
        match ch {
            '{' | '}' => {
                expanded.push(' ');
                expanded.push(ch);
                expanded.push(' ');
            }
            ',' => expanded.push(' '),
            _ => expanded.push(ch),
        }
    }

    expanded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Parsed field selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSelector {
    fields: BTreeMap<String, Option<FieldSelector>>,
}

impl FieldSelector {
    pub fn parse(input: &str) -> Result<Self, SelectorError> {
        let normalized = normalize_fields_string(input);
        let mut tokens = normalized.split(' ').peekable();

        match tokens.next() {
            Some("{") => {}
            Some(other) => return Err(SelectorError::UnexpectedToken(other.to_string())),
            None => return Err(SelectorError::EmptySelection),
        }

        let selector = Self::parse_block(&mut tokens, 1)?;
        if let Some(extra) = tokens.next() {
            return Err(SelectorError::UnexpectedToken(extra.to_string()));
        }
        Ok(selector)
    }

    fn parse_block<'a, I>(tokens: &mut std::iter::Peekable<I>, depth: usize) -> Result<Self, SelectorError>
    where
        I: Iterator<Item = &'a str>,
    {
        let mut fields = BTreeMap::new();
        loop {
            let Some(token) = tokens.next() else {
                return Err(SelectorError::Unbalanced);
            };
            match token {
                "}" => break,
                "{" => return Err(SelectorError::UnexpectedToken(token.to_string())),
                name => {
                    if !is_identifier(name) {
                        return Err(SelectorError::UnexpectedToken(name.to_string()));
                    }
                    let nested = if tokens.peek() == Some(&"{") {
                        tokens.next();
                        check_depth(depth + 1)?;
                        Some(Self::parse_block(tokens, depth + 1)?)
                    } else {
                        None
                    };
                    fields.insert(name.to_string(), nested);
                }
            }
        }

        if fields.is_empty() {
            return Err(SelectorError::EmptySelection);
        }
        Ok(Self { fields })
    }

    /// Top-level field names.
    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Keep only the selected parts of `value`. Missing fields become `null`.
    pub fn project(&self, value: &Value) -> Value {
        match value {
            Value::Object(object) => {
                let mut projected = Map::new();
                for (name, nested) in &self.fields {
                    let field = object.get(name).unwrap_or(&Value::Null);
                    let field = match nested {
                        Some(selector) => selector.project(field),
                        None => field.clone(),
                    };
                    projected.insert(name.clone(), field);
                }
                Value::Object(projected)
            }
            Value::Array(items) => Value::Array(items.iter().map(|item| self.project(item)).collect()),
            other => other.clone(),
        }
    }
}

impl fmt::Display for FieldSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (name, nested) in &self.fields {
            write!(f, " {}", name)?;
            if let Some(nested) = nested {
                write!(f, " {}", nested)?;
            }
        }
        f.write_str(" }")
    }
}

fn is_identifier(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Comparison applied to one field.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterOp {
    Eq(Value),
    Not(Value),
    In(Vec<Value>),
    NotIn(Vec<Value>),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    Contains(String),
    IsNull(bool),
    /// Filter on a related object.
    Nested(Box<ChangeFilter>),
}

/// Parsed where-input filter.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeFilter {
    All(Vec<ChangeFilter>),
    Any(Vec<ChangeFilter>),
    Field { field: String, op: FilterOp },
}

// Longest suffixes first: `_not_in` must win over `_in`.
const SUFFIXES: [&str; 9] = ["_not_in", "_is_null", "_contains", "_gte", "_lte", "_not", "_in", "_gt", "_lt"];

impl ChangeFilter {
    /// A filter that matches every change.
    pub fn everything() -> Self {
        ChangeFilter::All(Vec::new())
    }

    pub fn parse(value: &Value) -> Result<Self, SelectorError> {
        Self::parse_at(value, 1)
    }

    fn parse_at(value: &Value, depth: usize) -> Result<Self, SelectorError> {
        check_depth(depth)?;
        match value {
            Value::Null => Ok(Self::everything()),
            Value::Object(object) => {
                let mut clauses = Vec::with_capacity(object.len());
                for (key, value) in object {
                    clauses.push(Self::parse_clause(key, value, depth)?);
                }
                Ok(ChangeFilter::All(clauses))
            }
            other => Err(SelectorError::InvalidFilter(format!("expected object, got {}", other))),
        }
    }

    fn parse_clause(key: &str, value: &Value, depth: usize) -> Result<Self, SelectorError> {
        match key {
            "AND" | "OR" => {
                let Value::Array(items) = value else {
                    return Err(SelectorError::InvalidFilter(format!("{} expects an array", key)));
                };
                let parsed = items
                    .iter()
                    .map(|item| Self::parse_at(item, depth + 1))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if key == "AND" { ChangeFilter::All(parsed) } else { ChangeFilter::Any(parsed) })
            }
            _ => {
                let (field, op) = parse_field_op(key, value, depth)?;
                Ok(ChangeFilter::Field { field, op })
            }
        }
    }

    /// Field names referenced at the top level of the filter.
    pub fn field_names(&self) -> Vec<&str> {
        let mut names = Vec::new();
        self.collect_names(&mut names);
        names
    }

    fn collect_names<'a>(&'a self, names: &mut Vec<&'a str>) {
        match self {
            ChangeFilter::All(items) | ChangeFilter::Any(items) => {
                for item in items {
                    item.collect_names(names);
                }
            }
            ChangeFilter::Field { field, .. } => names.push(field.as_str()),
        }
    }

    pub fn matches(&self, data: &Value) -> bool {
        match self {
            ChangeFilter::All(items) => items.iter().all(|item| item.matches(data)),
            ChangeFilter::Any(items) => items.iter().any(|item| item.matches(data)),
            ChangeFilter::Field { field, op } => {
                let actual = data.get(field).unwrap_or(&Value::Null);
                op.matches(actual)
            }
        }
    }
}

fn parse_field_op(key: &str, value: &Value, depth: usize) -> Result<(String, FilterOp), SelectorError> {
    for suffix in SUFFIXES {
        let Some(field) = key.strip_suffix(suffix) else { continue };
        if field.is_empty() {
            continue;
        }
        let op = match suffix {
            "_not_in" => FilterOp::NotIn(expect_array(key, value)?),
            "_in" => FilterOp::In(expect_array(key, value)?),
            "_is_null" => FilterOp::IsNull(
                value.as_bool().ok_or_else(|| SelectorError::InvalidFilter(format!("{} expects a boolean", key)))?,
            ),
            "_contains" => FilterOp::Contains(
                value
                    .as_str()
                    .ok_or_else(|| SelectorError::InvalidFilter(format!("{} expects a string", key)))?
                    .to_string(),
            ),
            "_gte" => FilterOp::Gte(value.clone()),
            "_lte" => FilterOp::Lte(value.clone()),
            "_gt" => FilterOp::Gt(value.clone()),
            "_lt" => FilterOp::Lt(value.clone()),
            _ => FilterOp::Not(value.clone()),
        };
        return Ok((field.to_string(), op));
    }

    let op = match value {
        Value::Object(_) => FilterOp::Nested(Box::new(ChangeFilter::parse_at(value, depth + 1)?)),
        other => FilterOp::Eq(other.clone()),
    };
    Ok((key.to_string(), op))
}

fn expect_array(key: &str, value: &Value) -> Result<Vec<Value>, SelectorError> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        _ => Err(SelectorError::InvalidFilter(format!("{} expects an array", key))),
    }
}

impl FilterOp {
    fn matches(&self, actual: &Value) -> bool {
        match self {
            FilterOp::Eq(expected) => actual == expected,
            FilterOp::Not(expected) => actual != expected,
            FilterOp::In(options) => options.contains(actual),
            FilterOp::NotIn(options) => !options.contains(actual),
            FilterOp::Gt(bound) => compare(actual, bound) == Some(Ordering::Greater),
            FilterOp::Gte(bound) => matches!(compare(actual, bound), Some(Ordering::Greater | Ordering::Equal)),
            FilterOp::Lt(bound) => compare(actual, bound) == Some(Ordering::Less),
            FilterOp::Lte(bound) => matches!(compare(actual, bound), Some(Ordering::Less | Ordering::Equal)),
            FilterOp::Contains(needle) => actual.as_str().map(|s| s.contains(needle.as_str())).unwrap_or(false),
            FilterOp::IsNull(expected) => actual.is_null() == *expected,
            FilterOp::Nested(filter) => actual.is_object() && filter.matches(actual),
        }
    }
}

// Numbers compare numerically, strings lexicographically (ISO timestamps
// included). Mixed types never match.
fn compare(actual: &Value, bound: &Value) -> Option<Ordering> {
    match (actual, bound) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.as_str().cmp(b.as_str())),
        _ => None,
    }
}
