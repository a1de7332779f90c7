use super::types::{FieldDefinition, FieldType, Record};
use serde_json::Value;

/// Display values of a record plus the original values of every field whose
/// displayed form differs from storage.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Presentation {
    pub values: Record,
    pub raw: Record,
}

pub(crate) fn present_value(field: &FieldDefinition, value: &Value, record: &Record) -> Value {
    let mut shown = match field.domain() {
        Some(domain) => match (&field.field_type, value) {
            (FieldType::Array(_), Value::Array(items)) => Value::Array(
                items
                    .iter()
                    .map(|item| describe_or_keep(domain.describe(item), item))
                    .collect(),
            ),
            _ => describe_or_keep(domain.describe(value), value),
        },
        None => value.clone(),
    };

    if let Some(format) = &field.format {
        shown = format(&shown, record);
    }

    if (field.prefix.is_some() || field.suffix.is_some()) && !shown.is_null() {
        shown = Value::String(format!(
            "{}{}{}",
            field.prefix.as_deref().unwrap_or(""),
            display_string(&shown),
            field.suffix.as_deref().unwrap_or("")
        ));
    }

    shown
}

fn describe_or_keep(description: Option<&str>, value: &Value) -> Value {
    description
        .map(|d| Value::String(d.to_string()))
        .unwrap_or_else(|| value.clone())
}

fn display_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
