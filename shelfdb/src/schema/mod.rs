pub mod convert;
pub mod parser;
pub mod present;
pub mod types;

pub use convert::{as_f64, as_i64, is_truthy, parse_epoch_millis};
pub use parser::{parse_schema, parse_schema_str};
pub use present::Presentation;
pub use types::*;

use crate::error::{InvalidMessages, Result, ShelfError};
use crate::sequence::SequenceProvider;
use crate::util;
use crate::validation::{self, ValidationMode};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Generators consulted while filling system fields.
pub struct SystemContext<'a> {
    pub sequence: &'a dyn SequenceProvider,
    pub id_length: usize,
    pub random_length: usize,
}

impl<'a> SystemContext<'a> {
    pub fn new(sequence: &'a dyn SequenceProvider) -> Self {
        SystemContext {
            sequence,
            id_length: 24,
            random_length: 8,
        }
    }
}

/// Field definitions and event hooks of one table. Immutable once built.
#[derive(Clone)]
pub struct Schema {
    fields: Vec<(String, FieldDefinition)>,
    events: HashMap<EventKind, Vec<EventHook>>,
}

/// Collects fields and hooks, then checks them in [`SchemaBuilder::build`].
#[derive(Default)]
pub struct SchemaBuilder {
    fields: Vec<(String, FieldDefinition)>,
    events: Vec<(String, EventHook)>,
    unknown: Vec<String>,
}

impl SchemaBuilder {
    /// Add a field, replacing an earlier definition with the same name.
    pub fn field(mut self, name: impl Into<String>, definition: FieldDefinition) -> Self {
        let name = name.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = definition,
            None => self.fields.push((name, definition)),
        }
        self
    }

    /// Rework an already added field, e.g. to attach a formatter to a field
    /// parsed from YAML. Unknown names are left for `build` to report.
    pub fn configure<F>(mut self, name: &str, f: F) -> Self
    where
        F: FnOnce(FieldDefinition) -> FieldDefinition,
    {
        if let Some(pos) = self.fields.iter().position(|(n, _)| n == name) {
            let (n, def) = self.fields.remove(pos);
            self.fields.insert(pos, (n, f(def)));
        } else {
            self.unknown.push(name.to_string());
        }
        self
    }

    /// Register a lifecycle hook under its `$`-prefixed event name.
    pub fn event<F>(mut self, name: impl Into<String>, hook: F) -> Self
    where
        F: Fn(&mut Record) + Send + Sync + 'static,
    {
        self.events.push((name.into(), Arc::new(hook)));
        self
    }

    pub fn build(self) -> Result<Schema> {
        if let Some(name) = self.unknown.into_iter().next() {
            return Err(ShelfError::schema(name, "configured field is not declared"));
        }

        let mut fields = Vec::with_capacity(self.fields.len() + 1);
        let mut primary_seen = false;

        for (name, def) in self.fields {
            if name.is_empty() {
                return Err(ShelfError::schema(name, "field name must not be empty"));
            }
            if name.starts_with(EVENT_SENTINEL) {
                return Err(ShelfError::schema(
                    name,
                    "event hooks must be callables, register them with `event`",
                ));
            }
            if name.contains(['/', '\\']) || name == "." || name == ".." {
                return Err(ShelfError::schema(name, "field name is not a valid directory name"));
            }
            match &def.field_type {
                FieldType::Primary if name != PRIMARY_KEY => {
                    return Err(ShelfError::schema(
                        name,
                        format!("primary field must be named '{PRIMARY_KEY}'"),
                    ));
                }
                FieldType::Primary => primary_seen = true,
                other if name == PRIMARY_KEY => {
                    return Err(ShelfError::schema(
                        name,
                        format!("'{PRIMARY_KEY}' must be of type primary, got {}", other.name()),
                    ));
                }
                FieldType::Float { decimals } if *decimals > MAX_DECIMALS => {
                    return Err(ShelfError::schema(
                        name,
                        format!("decimals must be at most {MAX_DECIMALS}"),
                    ));
                }
                FieldType::Ref { table, counter } => {
                    if table.is_empty() {
                        return Err(ShelfError::schema(name, "ref field requires a target table"));
                    }
                    if counter.as_deref() == Some("") {
                        return Err(ShelfError::schema(name, "counter name must not be empty"));
                    }
                }
                _ => {}
            }
            fields.push((name, def));
        }

        if !primary_seen {
            fields.insert(
                0,
                (
                    PRIMARY_KEY.to_string(),
                    FieldDefinition::new(FieldType::Primary).label(PRIMARY_KEY),
                ),
            );
        }

        let mut events: HashMap<EventKind, Vec<EventHook>> = HashMap::new();
        for (name, hook) in self.events {
            if !name.starts_with(EVENT_SENTINEL) {
                return Err(ShelfError::schema(
                    name,
                    "not a declared field and not a `$` event name",
                ));
            }
            let kind = EventKind::from_name(&name)
                .ok_or_else(|| ShelfError::schema(name.clone(), "unknown event"))?;
            events.entry(kind).or_default().push(hook);
        }

        Ok(Schema { fields, events })
    }
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Schema from plain field definitions, without hooks.
    pub fn new<I, S>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, FieldDefinition)>,
        S: Into<String>,
    {
        fields
            .into_iter()
            .fold(SchemaBuilder::default(), |b, (name, def)| b.field(name, def))
            .build()
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldDefinition)> {
        self.fields.iter().map(|(n, d)| (n.as_str(), d))
    }

    pub fn field(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, d)| d)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    pub fn primary_key(&self) -> &str {
        PRIMARY_KEY
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = (&str, &FieldDefinition)> {
        self.fields().filter(|(_, d)| d.is_unique())
    }

    /// `(field, target table, counter field)` for every counter reference.
    pub fn counter_fields(&self) -> impl Iterator<Item = (&str, &str, &str)> {
        self.fields()
            .filter_map(|(n, d)| d.counter_target().map(|(t, c)| (n, t, c)))
    }

    pub fn auto_increment_fields(&self) -> impl Iterator<Item = &str> {
        self.fields()
            .filter(|(_, d)| d.field_type == FieldType::AutoIncrement)
            .map(|(n, _)| n)
    }

    pub fn has_events(&self, kind: EventKind) -> bool {
        self.events.get(&kind).map(|h| !h.is_empty()).unwrap_or(false)
    }

    pub(crate) fn fire(&self, kind: EventKind, record: &mut Record) {
        if let Some(hooks) = self.events.get(&kind) {
            for hook in hooks {
                hook(record);
            }
        }
    }

    // ── Value pipeline ────────────────────────────────────────────

    pub fn add_default_values(&self, data: &mut Record) {
        for (name, def) in self.fields() {
            let Some(default) = &def.default else { continue };
            if is_absent(data.get(name)) {
                data.insert(name.to_string(), default.resolve());
            }
        }
    }

    /// Fill system fields. `modified` is always refreshed and never moves backwards.
    pub fn add_system_values(&self, data: &mut Record, ctx: &SystemContext<'_>) {
        let now = util::now_millis();
        for (name, def) in self.fields() {
            let absent = is_absent(data.get(name));
            let value = match def.field_type {
                FieldType::Primary if absent => Value::String(util::hex_token(ctx.id_length)),
                FieldType::Random if absent => Value::String(util::alphanumeric_token(
                    def.length.unwrap_or(ctx.random_length),
                )),
                FieldType::AutoIncrement if absent => Value::from(ctx.sequence.next_value(name)),
                FieldType::Created if absent => Value::from(now),
                FieldType::Modified => {
                    let previous = data.get(name).and_then(parse_epoch_millis);
                    Value::from(previous.map_or(now, |p| now.max(p + 1)))
                }
                _ => continue,
            };
            data.insert(name.to_string(), value);
        }
    }

    pub fn add_alias_values(&self, data: &mut Record) {
        for (name, def) in self.fields() {
            if !def.is_alias() {
                continue;
            }
            if let Some(logic) = &def.logic {
                let value = logic(data);
                data.insert(name.to_string(), value);
            }
        }
    }

    /// Defaults, then system values, then aliases, on a copy of `data`.
    pub fn add_values(&self, data: &Record, ctx: &SystemContext<'_>) -> Record {
        let mut record = data.clone();
        self.add_default_values(&mut record);
        self.add_system_values(&mut record, ctx);
        self.add_alias_values(&mut record);
        record
    }

    // ── Conversion ────────────────────────────────────────────────

    /// Stored representation of one value. Undeclared fields pass through.
    /// Text fields yield their content digest.
    pub fn convert(&self, name: &str, value: &Value) -> Result<Value> {
        match self.field(name) {
            Some(def) => convert::convert_value(name, def, value),
            None => Ok(value.clone()),
        }
    }

    /// Value written to the canonical record. Same as [`Schema::convert`]
    /// except that text keeps its content; its digest only serves change detection.
    pub fn to_stored(&self, name: &str, value: &Value) -> Result<Value> {
        match self.field(name) {
            Some(def) if def.field_type == FieldType::Text => Ok(value.clone()),
            _ => self.convert(name, value),
        }
    }

    pub fn to_stored_record(&self, record: &Record) -> Result<Record> {
        let mut stored = Record::new();
        for (name, value) in record {
            stored.insert(name.clone(), self.to_stored(name, value)?);
        }
        Ok(stored)
    }

    pub fn convert_back(&self, name: &str, value: &Value) -> Value {
        match self.field(name) {
            Some(def) => convert::convert_back_value(def, value),
            None => value.clone(),
        }
    }

    pub fn convert_back_record(&self, stored: &Record) -> Record {
        stored
            .iter()
            .map(|(name, value)| (name.clone(), self.convert_back(name, value)))
            .collect()
    }

    // ── Change detection and filtering ────────────────────────────

    /// Input fields whose stored form would differ from `stored`.
    /// Read-only, system, alias and fake fields never count as changed.
    pub fn get_changed_fields(&self, input: &Record, stored: &Record) -> Result<Record> {
        let mut changed = Record::new();
        for (name, value) in input {
            let Some(def) = self.field(name) else { continue };
            if def.is_read_only() || def.is_system() || def.is_alias() || def.fake {
                continue;
            }
            let old = stored.get(name).unwrap_or(&Value::Null);
            let differs = match def.field_type {
                FieldType::Password => match (value.as_str(), old.as_str()) {
                    (Some(candidate), Some(hash)) => !util::verify_password(hash, candidate),
                    _ => value != old,
                },
                FieldType::Text => self.convert(name, value)? != self.convert(name, old)?,
                _ => self.convert(name, value)? != *old,
            };
            if differs {
                changed.insert(name.clone(), value.clone());
            }
        }
        Ok(changed)
    }

    /// Keep only declared fields a caller may set. Fake fields stay for validation.
    pub fn filter_data(&self, input: &Record) -> Record {
        input
            .iter()
            .filter(|(name, _)| {
                self.field(name)
                    .map(|d| !d.is_system() && !d.is_alias())
                    .unwrap_or(false)
            })
            .map(|(n, v)| (n.clone(), v.clone()))
            .collect()
    }

    pub fn clear_fake_fields(&self, record: &mut Record) {
        for (name, def) in self.fields() {
            if def.fake {
                record.remove(name);
            }
        }
    }

    pub fn validate(&self, record: &Record, mode: ValidationMode) -> InvalidMessages {
        validation::validate_record(self, record, mode)
    }

    // ── Presentation ──────────────────────────────────────────────

    pub fn present(&self, record: &Record) -> Presentation {
        let mut presentation = Presentation::default();
        for (name, value) in record {
            let shown = match self.field(name) {
                Some(def) => present::present_value(def, value, record),
                None => value.clone(),
            };
            if shown != *value {
                presentation.raw.insert(name.clone(), value.clone());
            }
            presentation.values.insert(name.clone(), shown);
        }
        presentation
    }

    pub fn present_all(&self, records: &[Record]) -> Vec<Presentation> {
        records.iter().map(|r| self.present(r)).collect()
    }

    pub fn is_valid_password(&self, stored_hash: &str, candidate: &str) -> bool {
        util::verify_password(stored_hash, candidate)
    }
}

impl fmt::Debug for SchemaBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaBuilder")
            .field("fields", &self.fields)
            .field("events", &self.events.iter().map(|(n, _)| n).collect::<Vec<_>>())
            .field("unknown", &self.unknown)
            .finish()
    }
}

impl fmt::Debug for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema")
            .field("fields", &self.fields)
            .field("events", &self.events.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Null and the empty string count as absent.
pub(crate) fn is_absent(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.is_empty(),
        _ => false,
    }
}
