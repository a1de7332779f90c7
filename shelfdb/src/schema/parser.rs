use super::types::{FieldDefinition, FieldType, ValueDomain, DEFAULT_DECIMALS, EVENT_SENTINEL};
use super::SchemaBuilder;
use crate::error::{Result, ShelfError};
use regex::Regex;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Data-only attributes of a field as written in YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct RawFieldDefinition {
    #[serde(rename = "type")]
    field_type: Option<String>,
    text: Option<String>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    unique: bool,
    #[serde(default)]
    read_only: bool,
    #[serde(default)]
    index: bool,
    #[serde(default)]
    fake: bool,
    default: Option<serde_json::Value>,
    prefix: Option<String>,
    suffix: Option<String>,
    #[serde(alias = "size")]
    length: Option<usize>,
    min: Option<usize>,
    max: Option<usize>,
    min_value: Option<f64>,
    max_value: Option<f64>,
    step: Option<f64>,
    pattern: Option<String>,
    decimals: Option<u32>,
    values: Option<RawValues>,
    #[serde(rename = "ref")]
    target: Option<String>,
    counter: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RawValues {
    List(Vec<String>),
    Map(BTreeMap<String, String>),
}

impl RawValues {
    fn into_domain(self) -> ValueDomain {
        match self {
            RawValues::List(values) => ValueDomain::from_list(values),
            RawValues::Map(pairs) => ValueDomain::from_pairs(pairs),
        }
    }
}

/// Parse a YAML schema file into a builder.
pub fn parse_schema(path: &Path) -> Result<SchemaBuilder> {
    let content = std::fs::read_to_string(path)?;
    parse_schema_str(&content)
}

/// Parse a YAML mapping of field name to definition. Field order is kept.
/// Callables are attached afterwards through [`SchemaBuilder::configure`]
/// and [`SchemaBuilder::event`].
pub fn parse_schema_str(content: &str) -> Result<SchemaBuilder> {
    let mapping: serde_yaml::Mapping = serde_yaml::from_str(content)?;
    let mut builder = SchemaBuilder::default();

    for (key, value) in mapping {
        let name = key
            .as_str()
            .ok_or_else(|| ShelfError::schema(format!("{key:?}"), "field names must be strings"))?
            .to_string();
        if name.starts_with(EVENT_SENTINEL) {
            return Err(ShelfError::schema(
                name,
                "event hooks must be callables and cannot be declared in YAML",
            ));
        }
        let raw: RawFieldDefinition = serde_yaml::from_value(value)
            .map_err(|e| ShelfError::schema(name.clone(), e.to_string()))?;
        let definition = into_definition(&name, raw)?;
        builder = builder.field(name, definition);
    }

    Ok(builder)
}

fn into_definition(name: &str, raw: RawFieldDefinition) -> Result<FieldDefinition> {
    let type_name = raw
        .field_type
        .as_deref()
        .ok_or_else(|| ShelfError::schema(name, "missing required key 'type'"))?;
    let domain = || raw.values.clone().map(RawValues::into_domain).unwrap_or_default();

    let field_type = match type_name {
        "string" => FieldType::String,
        "int" | "integer" => FieldType::Int,
        "float" => FieldType::Float {
            decimals: raw.decimals.unwrap_or(DEFAULT_DECIMALS),
        },
        "boolean" | "bool" => FieldType::Boolean,
        "enum" => FieldType::Enum(domain()),
        "map" | "hash" => FieldType::Map(domain()),
        "array" => FieldType::Array(domain()),
        "password" => FieldType::Password,
        "date" => FieldType::Date,
        "datetime" => FieldType::Datetime,
        "timestamp" => FieldType::Timestamp,
        "created" => FieldType::Created,
        "modified" => FieldType::Modified,
        "text" => FieldType::Text,
        "ref" => FieldType::Ref {
            table: raw
                .target
                .clone()
                .ok_or_else(|| ShelfError::schema(name, "ref field requires a 'ref' target table"))?,
            counter: raw.counter.clone(),
        },
        "primary" => FieldType::Primary,
        "random" => FieldType::Random,
        "autoIncrement" | "increment" => FieldType::AutoIncrement,
        "alias" => FieldType::Alias,
        "email" => FieldType::Email,
        "url" => FieldType::Url,
        "uuid" => FieldType::Uuid,
        "alpha" => FieldType::Alpha,
        "numeric" => FieldType::Numeric,
        "alphanumeric" => FieldType::Alphanumeric,
        "ip" => FieldType::Ip,
        "ipv4" | "ip4" => FieldType::Ipv4,
        "ipv6" | "ip6" => FieldType::Ipv6,
        "creditCard" => FieldType::CreditCard,
        "object" => FieldType::Object,
        other => {
            return Err(ShelfError::schema(
                name,
                format!("unknown field type '{other}'"),
            ))
        }
    };

    let pattern = match &raw.pattern {
        Some(p) => Some(
            Regex::new(p).map_err(|e| ShelfError::schema(name, format!("invalid pattern: {e}")))?,
        ),
        None => None,
    };

    let mut def = FieldDefinition::new(field_type);
    def.text = raw.text;
    def.required = raw.required;
    def.unique = raw.unique;
    def.read_only = raw.read_only;
    def.index = raw.index;
    def.fake = raw.fake;
    def.default = raw.default.map(super::DefaultValue::Literal);
    def.prefix = raw.prefix;
    def.suffix = raw.suffix;
    def.length = raw.length;
    def.min = raw.min;
    def.max = raw.max;
    def.min_value = raw.min_value;
    def.max_value = raw.max_value;
    def.step = raw.step;
    def.pattern = pattern;
    Ok(def)
}
