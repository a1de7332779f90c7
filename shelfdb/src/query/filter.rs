// Predicates over records: conjunctions of field comparisons

use crate::error::{Result, ShelfError};
use crate::schema::{as_f64, FieldType, Record, Schema, PRIMARY_KEY};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    /// Value is one of a list.
    In,
    /// String match with `%` wildcards at either end.
    Like,
}

impl Op {
    pub fn parse(op: &str) -> Option<Op> {
        let op = match op.trim().to_ascii_lowercase().as_str() {
            "=" | "==" => Op::Eq,
            "!=" | "<>" => Op::Ne,
            ">" => Op::Gt,
            ">=" => Op::Gte,
            "<" => Op::Lt,
            "<=" => Op::Lte,
            "in" => Op::In,
            "like" => Op::Like,
            _ => return None,
        };
        Some(op)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub field: String,
    pub op: Op,
    pub value: Value,
}

/// All conditions must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.op(field, Op::Eq, value)
    }

    pub fn op(mut self, field: impl Into<String>, op: Op, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition {
            field: field.into(),
            op,
            value: value.into(),
        });
        self
    }

    /// Filter from a JSON object. Plain values mean equality; a two-element
    /// array whose first element is an operator means a comparison:
    ///
    /// ```
    /// # use shelfdb::query::Filter;
    /// let filter = Filter::from_json(&serde_json::json!({ "age": [">", 20], "name": "Tom" })).unwrap();
    /// assert_eq!(filter.conditions().len(), 2);
    /// ```
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value
            .as_object()
            .ok_or_else(|| ShelfError::Other("filter must be a JSON object".to_string()))?;
        let mut filter = Filter::new();
        for (field, predicate) in object {
            filter = match predicate {
                Value::Array(parts) if parts.len() == 2 => {
                    match parts[0].as_str().and_then(Op::parse) {
                        Some(op) => filter.op(field.clone(), op, parts[1].clone()),
                        None => filter.eq(field.clone(), predicate.clone()),
                    }
                }
                other => filter.eq(field.clone(), other.clone()),
            };
        }
        Ok(filter)
    }

    /// Equality on every field of `record`.
    pub fn from_record(record: &Record) -> Self {
        record
            .iter()
            .fold(Filter::new(), |f, (field, value)| f.eq(field.clone(), value.clone()))
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }

    pub(crate) fn merge(mut self, other: Filter) -> Self {
        self.conditions.extend(other.conditions);
        self
    }

    /// Predicate values converted to the stored form of their fields, so that
    /// `"2024-01-31"` compares against an epoch and `"18"` against a number.
    ///
    /// A value the field could never hold matches no record: `None` when such a
    /// value sits in an equality or range condition, the condition dropped for
    /// `!=`, and the item dropped from an `in` list.
    pub(crate) fn normalized(&self, schema: &Schema) -> Option<Filter> {
        let mut conditions = Vec::with_capacity(self.conditions.len());
        for c in &self.conditions {
            let value = match (c.op, schema.field(&c.field)) {
                (Op::Like, _) | (_, None) => c.value.clone(),
                (Op::In, Some(_)) => match &c.value {
                    Value::Array(items) => Value::Array(
                        items
                            .iter()
                            .filter_map(|v| normalize_value(schema, &c.field, v))
                            .collect(),
                    ),
                    other => match normalize_value(schema, &c.field, other) {
                        Some(v) => v,
                        None => Value::Array(Vec::new()),
                    },
                },
                (op, Some(_)) => match normalize_value(schema, &c.field, &c.value) {
                    Some(v) => v,
                    None if op == Op::Ne => continue,
                    None => return None,
                },
            };
            conditions.push(Condition {
                field: c.field.clone(),
                op: c.op,
                value,
            });
        }
        Some(Filter { conditions })
    }

    /// An equality on `_id` or on a unique field that can be answered by a
    /// point lookup.
    pub(crate) fn point_lookup<'f>(&'f self, schema: &Schema) -> Option<(&'f str, &'f Value)> {
        let eq = |c: &&'f Condition| c.op == Op::Eq && !c.value.is_null() && !c.value.is_array();
        self.conditions
            .iter()
            .filter(eq)
            .find(|c| c.field == PRIMARY_KEY)
            .or_else(|| {
                self.conditions
                    .iter()
                    .filter(eq)
                    .find(|c| schema.field(&c.field).map(|d| d.is_unique()).unwrap_or(false))
            })
            .map(|c| (c.field.as_str(), &c.value))
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.conditions.iter().all(|c| {
            let actual = record.get(&c.field).unwrap_or(&Value::Null);
            condition_holds(c.op, actual, &c.value)
        })
    }
}

fn normalize_value(schema: &Schema, field: &str, value: &Value) -> Option<Value> {
    let Some(def) = schema.field(field) else {
        return Some(value.clone());
    };
    match def.field_type {
        // Stored as given, or digested/hashed, so compare against the raw value
        FieldType::Text | FieldType::Password => Some(value.clone()),
        _ => match schema.convert(field, value) {
            Ok(v) => Some(v),
            Err(e) => {
                log::debug!("filter on {field} matches nothing: {e}");
                None
            }
        },
    }
}

fn condition_holds(op: Op, actual: &Value, expected: &Value) -> bool {
    match op {
        Op::Eq => values_equal(actual, expected),
        Op::Ne => !values_equal(actual, expected),
        Op::Gt => compare_values(actual, expected) == Some(Ordering::Greater),
        Op::Gte => matches!(
            compare_values(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Op::Lt => compare_values(actual, expected) == Some(Ordering::Less),
        Op::Lte => matches!(
            compare_values(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Op::In => match expected {
            Value::Array(options) => options.iter().any(|o| values_equal(actual, o)),
            other => values_equal(actual, other),
        },
        Op::Like => match (actual.as_str(), expected.as_str()) {
            (Some(s), Some(pattern)) => like(s, pattern),
            _ => false,
        },
    }
}

/// Equality that treats `18` and `18.0` as the same value. A scalar matches
/// an array field that contains it.
fn values_equal(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Array(items), e) if !e.is_array() => items.iter().any(|i| values_equal(i, e)),
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

fn like(s: &str, pattern: &str) -> bool {
    let starts = pattern.starts_with('%');
    let ends = pattern.len() > 1 && pattern.ends_with('%');
    let core = pattern.trim_start_matches('%').trim_end_matches('%');
    match (starts, ends) {
        (true, true) => s.contains(core),
        (true, false) => s.ends_with(core),
        (false, true) => s.starts_with(core),
        (false, false) => s == pattern,
    }
}

/// Total-ish order used for sorting and range predicates. Null sorts first;
/// numbers compare numerically, including numeric strings against numbers.
/// Values of unrelated kinds are incomparable.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Null, _) => Some(Ordering::Less),
        (_, Value::Null) => Some(Ordering::Greater),
        (Value::Number(_), _) | (_, Value::Number(_)) => {
            let (x, y) = (as_f64(a)?, as_f64(b)?);
            x.partial_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDefinition;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_from_json() {
        let filter = Filter::from_json(&json!({
            "age": [">", 20],
            "name": "Tom",
            "tags": ["a", "b", "c"],
            "role": ["in", [1, 2]],
        }))
        .unwrap();
        let ops: Vec<(&str, Op)> = filter
            .conditions()
            .iter()
            .map(|c| (c.field.as_str(), c.op))
            .collect();
        assert_eq!(
            ops,
            vec![("age", Op::Gt), ("name", Op::Eq), ("role", Op::In), ("tags", Op::Eq)]
        );
        assert!(Filter::from_json(&json!([1])).is_err());
    }

    #[test]
    fn test_matches() {
        let r = record(json!({ "age": 22, "name": "David", "tags": ["x", "y"], "score": 1.5 }));

        assert!(Filter::new().matches(&r));
        assert!(Filter::new().op("age", Op::Gt, 20).eq("name", "David").matches(&r));
        assert!(!Filter::new().op("age", Op::Gt, 22).matches(&r));
        assert!(Filter::new().op("age", Op::Lte, 22.0).matches(&r));
        assert!(Filter::new().eq("age", 22.0).matches(&r));
        assert!(Filter::new().op("age", Op::Ne, 18).matches(&r));
        assert!(Filter::new().op("age", Op::In, json!([18, 22])).matches(&r));
        assert!(Filter::new().eq("tags", "y").matches(&r));
        assert!(Filter::new().op("name", Op::Like, "Dav%").matches(&r));
        assert!(Filter::new().op("name", Op::Like, "%vid").matches(&r));
        assert!(Filter::new().op("name", Op::Like, "%avi%").matches(&r));
        assert!(!Filter::new().op("name", Op::Like, "avi").matches(&r));
        // missing fields are null
        assert!(Filter::new().eq("email", Value::Null).matches(&r));
        assert!(!Filter::new().op("email", Op::Gt, 1).matches(&r));
    }

    #[test]
    fn test_compare_values() {
        assert_eq!(compare_values(&json!(2), &json!("10")), Some(Ordering::Less));
        assert_eq!(compare_values(&json!("b"), &json!("a")), Some(Ordering::Greater));
        assert_eq!(compare_values(&Value::Null, &json!(0)), Some(Ordering::Less));
        assert_eq!(compare_values(&json!(true), &json!("x")), None);
    }

    #[test]
    fn test_normalized_against_schema() {
        let schema = Schema::new([
            ("born", FieldDefinition::date()),
            ("age", FieldDefinition::int()),
            ("email", FieldDefinition::email().unique()),
        ])
        .unwrap();
        let filter = Filter::new()
            .eq("born", "2024-03-05")
            .op("age", Op::In, json!(["18", 22]))
            .eq("email", "a@x.com");
        let normalized = filter.normalized(&schema).unwrap();
        assert_eq!(normalized.conditions()[0].value, json!(1709596800000i64));
        assert_eq!(normalized.conditions()[1].value, json!([18, 22]));

        assert_eq!(
            normalized.point_lookup(&schema),
            Some(("email", &json!("a@x.com")))
        );
        let by_id = Filter::new().eq("age", 3).eq(PRIMARY_KEY, "abc");
        assert_eq!(by_id.point_lookup(&schema).map(|(f, _)| f), Some(PRIMARY_KEY));
        assert_eq!(Filter::new().eq("age", 3).point_lookup(&schema), None);
    }

    #[test]
    fn test_unconvertible_values_match_nothing() {
        let schema = Schema::new([("age", FieldDefinition::int())]).unwrap();
        assert_eq!(Filter::new().eq("age", "old").normalized(&schema), None);
        assert_eq!(Filter::new().op("age", Op::Gt, "old").normalized(&schema), None);

        let ne = Filter::new().op("age", Op::Ne, "old").normalized(&schema).unwrap();
        assert!(ne.is_empty());

        let within = Filter::new()
            .op("age", Op::In, json!(["old", "22"]))
            .normalized(&schema)
            .unwrap();
        assert_eq!(within.conditions()[0].value, json!([22]));
        let r = record(json!({ "age": 22 }));
        assert!(within.matches(&r));
    }
}
