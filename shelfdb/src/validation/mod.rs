use crate::error::InvalidMessages;
use crate::schema::{
    as_f64, as_i64, is_absent, parse_epoch_millis, FieldDefinition, FieldType, Record, Schema,
    PRIMARY_KEY,
};
use regex::Regex;
use serde_json::Value;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::OnceLock;

/// Which fields a validation pass covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Every declared field; missing required fields are reported.
    Insert,
    /// Only fields present in the payload. Read-only fields are skipped
    /// because they are ignored on update anyway.
    Update,
}

/// Check `record` against `schema`, collecting one message per failing field.
pub fn validate_record(schema: &Schema, record: &Record, mode: ValidationMode) -> InvalidMessages {
    let mut messages = InvalidMessages::new();

    for (name, field) in schema.fields() {
        if field.is_system() || field.is_alias() {
            continue;
        }
        if mode == ValidationMode::Update && (field.is_read_only() || !record.contains_key(name)) {
            continue;
        }

        let value = record.get(name);
        let label = field.label_or(name);

        let Some(value) = value.filter(|v| !is_absent(Some(v))) else {
            if field.required {
                messages.add(name, format!("{label} is required"));
            }
            continue;
        };

        if let Some(message) = check_value(label, field, value) {
            messages.add(name, message);
            continue;
        }

        if let Some(validate) = &field.validate {
            if let Some(message) = validate(value, record) {
                messages.add(name, message);
            }
        }
    }

    messages
}

fn check_value(label: &str, field: &FieldDefinition, value: &Value) -> Option<String> {
    let type_error = match &field.field_type {
        FieldType::String | FieldType::Text | FieldType::Password => {
            expect_string(label, value, "a string", |_| true)
        }
        FieldType::Int | FieldType::AutoIncrement => match as_i64(value) {
            Some(n) if value.as_f64().map_or(true, |f| f.fract() == 0.0) => {
                check_range(label, field, n as f64)
            }
            _ => Some(format!("{label} must be an integer")),
        },
        FieldType::Float { .. } => match as_f64(value) {
            Some(f) => check_range(label, field, f),
            None => Some(format!("{label} must be a number")),
        },
        FieldType::Boolean => match value {
            Value::Bool(_) | Value::Number(_) | Value::String(_) => None,
            _ => Some(format!("{label} must be a boolean")),
        },
        FieldType::Enum(domain) | FieldType::Map(domain) => {
            if value.is_array() || value.is_object() {
                Some(format!("{label} must be a single value"))
            } else if !domain.is_empty() && !domain.contains(value) {
                Some(format!("{label} is not one of the allowed values"))
            } else {
                None
            }
        }
        FieldType::Array(domain) => match value.as_array() {
            Some(items) if domain.is_empty() || items.iter().all(|i| domain.contains(i)) => None,
            Some(_) => Some(format!("{label} contains a value that is not allowed")),
            None => Some(format!("{label} must be a list")),
        },
        t if t.is_temporal() => match parse_epoch_millis(value) {
            Some(_) => None,
            None => Some(format!("{label} must be a date")),
        },
        FieldType::Email => expect_string(label, value, "a valid email address", is_email),
        FieldType::Url => expect_string(label, value, "a valid URL", is_url),
        FieldType::Uuid => expect_string(label, value, "a valid UUID", |s| {
            uuid::Uuid::parse_str(s).is_ok()
        }),
        FieldType::Alpha => expect_string(label, value, "letters only", |s| {
            !s.is_empty() && s.chars().all(char::is_alphabetic)
        }),
        FieldType::Numeric => match value {
            Value::Number(_) => None,
            _ => expect_string(label, value, "numeric", is_numeric),
        },
        FieldType::Alphanumeric => expect_string(label, value, "letters and digits only", |s| {
            !s.is_empty() && s.chars().all(char::is_alphanumeric)
        }),
        FieldType::Ip => expect_string(label, value, "a valid IP address", |s| {
            s.parse::<IpAddr>().is_ok()
        }),
        FieldType::Ipv4 => expect_string(label, value, "a valid IPv4 address", |s| {
            s.parse::<Ipv4Addr>().is_ok()
        }),
        FieldType::Ipv6 => expect_string(label, value, "a valid IPv6 address", |s| {
            s.parse::<Ipv6Addr>().is_ok()
        }),
        FieldType::CreditCard => expect_string(label, value, "a valid credit card number", |s| {
            luhn_valid(s)
        }),
        FieldType::Ref { .. } => match value {
            Value::String(_) | Value::Number(_) => None,
            Value::Object(obj) if obj.get(PRIMARY_KEY).map_or(false, |id| id.is_string()) => None,
            _ => Some(format!("{label} must reference a record id")),
        },
        FieldType::Object => match value {
            Value::Object(_) | Value::Array(_) => None,
            _ => Some(format!("{label} must be an object")),
        },
        _ => None,
    };
    if type_error.is_some() {
        return type_error;
    }

    if let Some(s) = value.as_str() {
        return check_string(label, field, s);
    }
    None
}

fn expect_string<F>(label: &str, value: &Value, what: &str, accept: F) -> Option<String>
where
    F: Fn(&str) -> bool,
{
    match value.as_str() {
        Some(s) if accept(s) => None,
        _ => Some(format!("{label} must be {what}")),
    }
}

fn check_string(label: &str, field: &FieldDefinition, s: &str) -> Option<String> {
    let len = s.chars().count();
    if let Some(length) = field.length {
        if len != length {
            return Some(format!("{label} must be exactly {length} characters"));
        }
    }
    if let Some(min) = field.min {
        if len < min {
            return Some(format!("{label} must be at least {min} characters"));
        }
    }
    if let Some(max) = field.max {
        if len > max {
            return Some(format!("{label} must be at most {max} characters"));
        }
    }
    if let Some(pattern) = &field.pattern {
        if !pattern.is_match(s) {
            return Some(format!("{label} has an invalid format"));
        }
    }
    None
}

fn check_range(label: &str, field: &FieldDefinition, n: f64) -> Option<String> {
    if let Some(min) = field.min_value {
        if n < min {
            return Some(format!("{label} must be at least {min}"));
        }
    }
    if let Some(max) = field.max_value {
        if n > max {
            return Some(format!("{label} must be at most {max}"));
        }
    }
    if let Some(step) = field.step.filter(|s| *s > 0.0) {
        let base = field.min_value.unwrap_or(0.0);
        let steps = (n - base) / step;
        if (steps - steps.round()).abs() > 1e-9 {
            return Some(format!("{label} must be a multiple of {step}"));
        }
    }
    None
}

fn luhn_valid(s: &str) -> bool {
    let digits: Vec<u32> = s
        .chars()
        .filter(|c| !matches!(c, ' ' | '-'))
        .map(|c| c.to_digit(10))
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default();
    if !(13..=19).contains(&digits.len()) {
        return false;
    }
    let sum: u32 = digits
        .iter()
        .rev()
        .enumerate()
        .map(|(i, &d)| {
            if i % 2 == 1 {
                let doubled = d * 2;
                if doubled > 9 {
                    doubled - 9
                } else {
                    doubled
                }
            } else {
                d
            }
        })
        .sum();
    sum % 10 == 0
}

const EMAIL_PATTERN: &str = r"^[A-Za-z0-9._%+\-]+@[A-Za-z0-9\-]+(\.[A-Za-z0-9\-]+)*\.[A-Za-z]{2,}$";
const URL_PATTERN: &str = r"^(https?|ftp)://[^\s/$.?#][^\s]*$";
const NUMERIC_PATTERN: &str = r"^[-+]?[0-9]+(\.[0-9]+)?$";

static EMAIL: OnceLock<Option<Regex>> = OnceLock::new();
static URL: OnceLock<Option<Regex>> = OnceLock::new();
static NUMERIC: OnceLock<Option<Regex>> = OnceLock::new();

/// Compiled once per process. A pattern that fails to compile matches nothing.
fn pattern_matches(cell: &'static OnceLock<Option<Regex>>, pattern: &str, s: &str) -> bool {
    cell.get_or_init(|| Regex::new(pattern).ok())
        .as_ref()
        .is_some_and(|re| re.is_match(s))
}

fn is_email(s: &str) -> bool {
    pattern_matches(&EMAIL, EMAIL_PATTERN, s)
}

fn is_url(s: &str) -> bool {
    pattern_matches(&URL, URL_PATTERN, s)
}

fn is_numeric(s: &str) -> bool {
    pattern_matches(&NUMERIC, NUMERIC_PATTERN, s)
}
