use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A record as held in memory and on disk: field name to JSON value.
pub type Record = serde_json::Map<String, Value>;

/// Name of the primary identifier field every table carries.
pub const PRIMARY_KEY: &str = "_id";

/// Leading character that marks a schema entry as an event hook.
pub const EVENT_SENTINEL: char = '$';

/// Presentation function: `(value, record) -> displayed value`.
pub type FormatFn = Arc<dyn Fn(&Value, &Record) -> Value + Send + Sync>;

/// Derivation function for alias fields: `record -> value`.
pub type LogicFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;

/// Custom validator returning an error message when the value is rejected.
pub type ValidateFn = Arc<dyn Fn(&Value, &Record) -> Option<String> + Send + Sync>;

/// Generator for computed default values.
pub type DefaultFn = Arc<dyn Fn() -> Value + Send + Sync>;

/// Lifecycle hook invoked with the in-memory record.
pub type EventHook = Arc<dyn Fn(&mut Record) + Send + Sync>;

/// A default is either a fixed value or a generator called on each use.
#[derive(Clone)]
pub enum DefaultValue {
    Literal(Value),
    Generator(DefaultFn),
}

impl DefaultValue {
    pub fn resolve(&self) -> Value {
        match self {
            DefaultValue::Literal(v) => v.clone(),
            DefaultValue::Generator(f) => f(),
        }
    }
}

impl fmt::Debug for DefaultValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DefaultValue::Literal(v) => write!(f, "Literal({v})"),
            DefaultValue::Generator(_) => write!(f, "Generator(..)"),
        }
    }
}

/// Declared value domain of enum, map and array fields: stored key to description.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueDomain(Vec<(String, String)>);

impl ValueDomain {
    /// Domain from a plain list. Keys are the list positions, as `values: [a, b]`
    /// declares `0 -> a, 1 -> b`.
    pub fn from_list<I, S>(values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ValueDomain(
            values
                .into_iter()
                .enumerate()
                .map(|(i, v)| (i.to_string(), v.into()))
                .collect(),
        )
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        ValueDomain(
            pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Accepts either a declared key or, for list domains, the description itself.
    pub fn contains(&self, value: &Value) -> bool {
        match domain_key(value) {
            Some(key) => self.0.iter().any(|(k, d)| *k == key || *d == key),
            None => false,
        }
    }

    pub fn describe(&self, value: &Value) -> Option<&str> {
        let key = domain_key(value)?;
        self.0
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, d)| d.as_str())
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(k, _)| k.as_str())
    }
}

fn domain_key(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// The closed set of field kinds. Each variant carries only what it needs.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldType {
    String,
    Int,
    Float { decimals: u32 },
    Boolean,
    Enum(ValueDomain),
    Map(ValueDomain),
    Array(ValueDomain),
    Password,
    Date,
    Datetime,
    Timestamp,
    Created,
    Modified,
    Text,
    Ref { table: String, counter: Option<String> },
    Primary,
    Random,
    AutoIncrement,
    Alias,
    Email,
    Url,
    Uuid,
    Alpha,
    Numeric,
    Alphanumeric,
    Ip,
    Ipv4,
    Ipv6,
    CreditCard,
    Object,
}

/// Precision of `float` fields that do not declare `decimals`.
pub const DEFAULT_DECIMALS: u32 = 2;

/// Largest precision a `float` field may declare; beyond it `f64` has no digits left.
pub const MAX_DECIMALS: u32 = 15;

impl FieldType {
    pub fn name(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Int => "int",
            FieldType::Float { .. } => "float",
            FieldType::Boolean => "boolean",
            FieldType::Enum(_) => "enum",
            FieldType::Map(_) => "map",
            FieldType::Array(_) => "array",
            FieldType::Password => "password",
            FieldType::Date => "date",
            FieldType::Datetime => "datetime",
            FieldType::Timestamp => "timestamp",
            FieldType::Created => "created",
            FieldType::Modified => "modified",
            FieldType::Text => "text",
            FieldType::Ref { .. } => "ref",
            FieldType::Primary => "primary",
            FieldType::Random => "random",
            FieldType::AutoIncrement => "autoIncrement",
            FieldType::Alias => "alias",
            FieldType::Email => "email",
            FieldType::Url => "url",
            FieldType::Uuid => "uuid",
            FieldType::Alpha => "alpha",
            FieldType::Numeric => "numeric",
            FieldType::Alphanumeric => "alphanumeric",
            FieldType::Ip => "ip",
            FieldType::Ipv4 => "ipv4",
            FieldType::Ipv6 => "ipv6",
            FieldType::CreditCard => "creditCard",
            FieldType::Object => "object",
        }
    }

    /// Stored as epoch milliseconds.
    pub fn is_temporal(&self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Datetime
                | FieldType::Timestamp
                | FieldType::Created
                | FieldType::Modified
        )
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            FieldType::Int | FieldType::Float { .. } | FieldType::AutoIncrement
        )
    }
}

/// Definition of a single field. Built with the chaining methods below or
/// parsed from YAML by [`crate::schema::parse_schema_str`].
#[derive(Clone)]
pub struct FieldDefinition {
    pub field_type: FieldType,
    pub text: Option<String>,
    pub required: bool,
    pub unique: bool,
    pub read_only: bool,
    pub index: bool,
    pub fake: bool,
    pub default: Option<DefaultValue>,
    pub format: Option<FormatFn>,
    pub logic: Option<LogicFn>,
    pub validate: Option<ValidateFn>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub length: Option<usize>,
    pub min: Option<usize>,
    pub max: Option<usize>,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
    pub step: Option<f64>,
    pub pattern: Option<Regex>,
}

impl FieldDefinition {
    pub fn new(field_type: FieldType) -> Self {
        FieldDefinition {
            field_type,
            text: None,
            required: false,
            unique: false,
            read_only: false,
            index: false,
            fake: false,
            default: None,
            format: None,
            logic: None,
            validate: None,
            prefix: None,
            suffix: None,
            length: None,
            min: None,
            max: None,
            min_value: None,
            max_value: None,
            step: None,
            pattern: None,
        }
    }

    pub fn string() -> Self {
        Self::new(FieldType::String)
    }

    pub fn int() -> Self {
        Self::new(FieldType::Int)
    }

    pub fn float(decimals: u32) -> Self {
        Self::new(FieldType::Float { decimals })
    }

    pub fn boolean() -> Self {
        Self::new(FieldType::Boolean)
    }

    pub fn text_field() -> Self {
        Self::new(FieldType::Text)
    }

    pub fn password() -> Self {
        Self::new(FieldType::Password)
    }

    pub fn date() -> Self {
        Self::new(FieldType::Date)
    }

    pub fn datetime() -> Self {
        Self::new(FieldType::Datetime)
    }

    pub fn created() -> Self {
        Self::new(FieldType::Created)
    }

    pub fn modified() -> Self {
        Self::new(FieldType::Modified)
    }

    pub fn random(length: usize) -> Self {
        Self::new(FieldType::Random).length(length)
    }

    pub fn auto_increment() -> Self {
        Self::new(FieldType::AutoIncrement)
    }

    pub fn email() -> Self {
        Self::new(FieldType::Email)
    }

    pub fn enumeration(domain: ValueDomain) -> Self {
        Self::new(FieldType::Enum(domain))
    }

    pub fn reference(table: impl Into<String>) -> Self {
        Self::new(FieldType::Ref {
            table: table.into(),
            counter: None,
        })
    }

    /// A reference whose insert/remove keeps `counter` on the target record in step.
    pub fn counter_reference(table: impl Into<String>, counter: impl Into<String>) -> Self {
        Self::new(FieldType::Ref {
            table: table.into(),
            counter: Some(counter.into()),
        })
    }

    pub fn alias<F>(logic: F) -> Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        Self::new(FieldType::Alias).logic(logic)
    }

    pub fn label(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    pub fn index(mut self) -> Self {
        self.index = true;
        self
    }

    pub fn fake(mut self) -> Self {
        self.fake = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Literal(value.into()));
        self
    }

    pub fn default_with<F>(mut self, generator: F) -> Self
    where
        F: Fn() -> Value + Send + Sync + 'static,
    {
        self.default = Some(DefaultValue::Generator(Arc::new(generator)));
        self
    }

    pub fn format<F>(mut self, format: F) -> Self
    where
        F: Fn(&Value, &Record) -> Value + Send + Sync + 'static,
    {
        self.format = Some(Arc::new(format));
        self
    }

    pub fn logic<F>(mut self, logic: F) -> Self
    where
        F: Fn(&Record) -> Value + Send + Sync + 'static,
    {
        self.logic = Some(Arc::new(logic));
        self
    }

    pub fn validate<F>(mut self, validate: F) -> Self
    where
        F: Fn(&Value, &Record) -> Option<String> + Send + Sync + 'static,
    {
        self.validate = Some(Arc::new(validate));
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn suffix(mut self, suffix: impl Into<String>) -> Self {
        self.suffix = Some(suffix.into());
        self
    }

    pub fn length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    pub fn min(mut self, min: usize) -> Self {
        self.min = Some(min);
        self
    }

    pub fn max(mut self, max: usize) -> Self {
        self.max = Some(max);
        self
    }

    pub fn min_value(mut self, min_value: f64) -> Self {
        self.min_value = Some(min_value);
        self
    }

    pub fn max_value(mut self, max_value: f64) -> Self {
        self.max_value = Some(max_value);
        self
    }

    pub fn step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    // ── Classification ────────────────────────────────────────────

    pub fn is_unique(&self) -> bool {
        self.unique || self.field_type == FieldType::AutoIncrement
    }

    pub fn is_index(&self) -> bool {
        self.index
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only || self.field_type == FieldType::AutoIncrement
    }

    pub fn is_system(&self) -> bool {
        matches!(
            self.field_type,
            FieldType::Primary
                | FieldType::Created
                | FieldType::Modified
                | FieldType::Random
                | FieldType::AutoIncrement
        )
    }

    pub fn is_alias(&self) -> bool {
        self.field_type == FieldType::Alias && self.logic.is_some()
    }

    pub fn is_counter_reference(&self) -> bool {
        matches!(&self.field_type, FieldType::Ref { counter: Some(c), .. } if !c.is_empty())
    }

    pub fn is_map(&self) -> bool {
        matches!(&self.field_type, FieldType::Map(d) if !d.is_empty())
    }

    pub fn is_enum(&self) -> bool {
        matches!(&self.field_type, FieldType::Enum(d) if !d.is_empty())
    }

    pub fn is_array(&self) -> bool {
        matches!(&self.field_type, FieldType::Array(d) if !d.is_empty())
    }

    /// Value domain of enum, map and array fields.
    pub fn domain(&self) -> Option<&ValueDomain> {
        match &self.field_type {
            FieldType::Enum(d) | FieldType::Map(d) | FieldType::Array(d) if !d.is_empty() => {
                Some(d)
            }
            _ => None,
        }
    }

    /// `(table, counter)` for counter references.
    pub fn counter_target(&self) -> Option<(&str, &str)> {
        match &self.field_type {
            FieldType::Ref {
                table,
                counter: Some(counter),
            } if !counter.is_empty() => Some((table.as_str(), counter.as_str())),
            _ => None,
        }
    }

    /// Human-readable label used in messages.
    pub fn label_or<'a>(&'a self, name: &'a str) -> &'a str {
        self.text.as_deref().unwrap_or(name)
    }
}

impl fmt::Debug for FieldDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FieldDefinition")
            .field("field_type", &self.field_type)
            .field("text", &self.text)
            .field("required", &self.required)
            .field("unique", &self.unique)
            .field("read_only", &self.read_only)
            .field("index", &self.index)
            .field("fake", &self.fake)
            .field("default", &self.default)
            .field("has_format", &self.format.is_some())
            .field("has_logic", &self.logic.is_some())
            .field("has_validate", &self.validate.is_some())
            .finish_non_exhaustive()
    }
}

/// Lifecycle events a schema can hook into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    BeforeInsert,
    AfterInsert,
    BeforeUpdate,
    AfterUpdate,
    BeforeRemove,
    AfterRemove,
}

impl EventKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "$beforeInsert" => Some(EventKind::BeforeInsert),
            "$afterInsert" => Some(EventKind::AfterInsert),
            "$beforeUpdate" => Some(EventKind::BeforeUpdate),
            "$afterUpdate" => Some(EventKind::AfterUpdate),
            "$beforeRemove" => Some(EventKind::BeforeRemove),
            "$afterRemove" => Some(EventKind::AfterRemove),
            _ => None,
        }
    }
}
