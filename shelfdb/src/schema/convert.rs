// Conversion between in-memory field values and their stored representation

use super::types::{FieldDefinition, FieldType, PRIMARY_KEY};
use crate::error::{InvalidMessages, Result, ShelfError};
use crate::util;
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use serde_json::Value;

const DATE_FORMAT: &str = "%Y-%m-%d";
const NAIVE_DATETIME_FORMATS: [&str; 3] = ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"];

/// Map a validated value to what is written to disk.
pub fn convert_value(name: &str, field: &FieldDefinition, value: &Value) -> Result<Value> {
    if value.is_null() {
        return Ok(Value::Null);
    }

    let converted = match &field.field_type {
        t if t.is_temporal() => parse_epoch_millis(value).map(Value::from),
        FieldType::Int | FieldType::AutoIncrement => as_i64(value).map(Value::from),
        FieldType::Float { decimals } => as_f64(value).map(|f| Value::from(round_to(f, *decimals))),
        FieldType::Boolean => Some(Value::Bool(is_truthy(value))),
        FieldType::Password => match value.as_str() {
            Some(s) => Some(Value::String(util::hash_password(s)?)),
            None => None,
        },
        FieldType::Ref { .. } => match value {
            Value::Object(obj) => obj.get(PRIMARY_KEY).cloned(),
            other => Some(other.clone()),
        },
        FieldType::Text => match value.as_str() {
            Some(s) => Some(Value::String(util::text_digest(s))),
            None => None,
        },
        _ => Some(value.clone()),
    };

    converted.ok_or_else(|| {
        let mut messages = InvalidMessages::new();
        messages.add(
            name,
            format!(
                "{} cannot be stored as {}",
                field.label_or(name),
                field.field_type.name()
            ),
        );
        ShelfError::Validation(messages)
    })
}

/// Partial inverse of [`convert_value`], applied on read.
pub fn convert_back_value(field: &FieldDefinition, value: &Value) -> Value {
    let millis = match value.as_i64() {
        Some(m) => m,
        None => return value.clone(),
    };
    let Some(at) = DateTime::<Utc>::from_timestamp_millis(millis) else {
        return value.clone();
    };

    match field.field_type {
        FieldType::Date => Value::String(at.format(DATE_FORMAT).to_string()),
        FieldType::Datetime => Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)),
        _ => value.clone(),
    }
}

/// Epoch milliseconds from an integer, an RFC 3339 string, a `YYYY-MM-DD`
/// date or a naive date-time (taken as UTC).
pub fn parse_epoch_millis(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(millis) = s.parse::<i64>() {
                return Some(millis);
            }
            if let Ok(at) = DateTime::parse_from_rfc3339(s) {
                return Some(at.timestamp_millis());
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, DATE_FORMAT) {
                let midnight = date.and_hms_opt(0, 0, 0)?;
                return Some(Utc.from_utc_datetime(&midnight).timestamp_millis());
            }
            NAIVE_DATETIME_FORMATS.iter().find_map(|fmt| {
                NaiveDateTime::parse_from_str(s, fmt)
                    .ok()
                    .map(|dt| Utc.from_utc_datetime(&dt).timestamp_millis())
            })
        }
        _ => None,
    }
}

/// Integer from a JSON number or a numeric string. Numbers with a fraction
/// are truncated; strings must hold a whole number (`"12"` or `"12.0"`).
pub fn as_i64(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite() && f.fract() == 0.0)
                    .map(|f| f as i64)
            })
        }
        _ => None,
    }
}

pub fn as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    }
}

/// Round to `decimals` places. Values too large to scale are already
/// coarser than the requested precision and come back unchanged.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    let scaled = value * factor;
    if !scaled.is_finite() {
        return value;
    }
    scaled.round() / factor
}

/// `true`, `1`, `"1"`, `"on"` and `"true"` are true; everything else is false.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64() == Some(1.0),
        Value::String(s) => matches!(s.trim().to_ascii_lowercase().as_str(), "1" | "on" | "true"),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_date_roundtrip() {
        let field = FieldDefinition::date();
        let stored = convert_value("birthday", &field, &json!("2024-03-05")).unwrap();
        assert_eq!(stored, json!(1_709_596_800_000i64));
        assert_eq!(convert_back_value(&field, &stored), json!("2024-03-05"));
    }

    #[test]
    fn test_datetime_roundtrip_keeps_millis() {
        let field = FieldDefinition::datetime();
        let stored = convert_value("at", &field, &json!("2024-03-05T10:20:30.123Z")).unwrap();
        assert_eq!(
            convert_back_value(&field, &stored),
            json!("2024-03-05T10:20:30.123Z")
        );

        // offsets normalize to UTC
        let stored = convert_value("at", &field, &json!("2024-03-05T12:20:30+02:00")).unwrap();
        assert_eq!(
            convert_back_value(&field, &stored),
            json!("2024-03-05T10:20:30.000Z")
        );
    }

    #[test]
    fn test_numeric_strings() {
        assert_eq!(
            convert_value("age", &FieldDefinition::int(), &json!(" 42 ")).unwrap(),
            json!(42)
        );
        assert_eq!(
            convert_value("balance", &FieldDefinition::float(2), &json!("3.14159")).unwrap(),
            json!(3.14)
        );
        assert_eq!(
            convert_value("ratio", &FieldDefinition::float(1), &json!(0.25)).unwrap(),
            json!(0.3)
        );
        let err = convert_value("age", &FieldDefinition::int(), &json!("old")).unwrap_err();
        assert!(err.invalid_messages().unwrap().contains("age"));
    }

    #[test]
    fn test_int_strings_are_not_truncated() {
        assert_eq!(as_i64(&json!("12.0")), Some(12));
        assert_eq!(as_i64(&json!("12.5")), None);
        assert!(convert_value("age", &FieldDefinition::int(), &json!("12.5")).is_err());
    }

    #[test]
    fn test_large_floats_survive_rounding() {
        let stored = convert_value("x", &FieldDefinition::float(2), &json!(1e307)).unwrap();
        assert_eq!(stored, json!(1e307));
        assert_eq!(round_to(f64::MAX, 15), f64::MAX);
        assert_eq!(round_to(1.005e3, 0), 1005.0);
    }

    #[test]
    fn test_truthy_tokens() {
        let field = FieldDefinition::boolean();
        for token in [json!(1), json!("1"), json!("on"), json!("true"), json!(true)] {
            assert_eq!(convert_value("f", &field, &token).unwrap(), json!(true));
        }
        for token in [json!(0), json!("off"), json!("yes"), json!(false), json!([])] {
            assert_eq!(convert_value("f", &field, &token).unwrap(), json!(false));
        }
    }

    #[test]
    fn test_ref_object_becomes_id() {
        let field = FieldDefinition::reference("user");
        let value = json!({ "_id": "abc", "name": "Tom" });
        assert_eq!(convert_value("author", &field, &value).unwrap(), json!("abc"));
        assert_eq!(convert_value("author", &field, &json!("abc")).unwrap(), json!("abc"));
    }

    #[test]
    fn test_password_and_text_are_one_way() {
        let password = convert_value("pw", &FieldDefinition::password(), &json!("s3cret")).unwrap();
        assert!(util::verify_password(password.as_str().unwrap(), "s3cret"));
        assert_eq!(convert_back_value(&FieldDefinition::password(), &password), password);

        let text = convert_value("body", &FieldDefinition::text_field(), &json!("hello")).unwrap();
        assert_eq!(text, json!(util::text_digest("hello")));
    }
}
