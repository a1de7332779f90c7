// belongsTo / hasMany resolution at read time

use super::filter::{compare_values, Filter};
use crate::error::Result;
use crate::schema::{as_i64, Record, Schema, PRIMARY_KEY};
use crate::table::Table;
use serde_json::Value;
use std::cmp::Ordering;

/// Key under which [`format_record`] keeps the stored values of fields whose
/// presentation differs.
pub const RAW_KEY: &str = "_raw";

/// A relation to resolve on every result record.
#[derive(Debug, Clone)]
pub enum Reference<'a> {
    /// Replace the foreign key in `field` with the referenced record of `table`.
    BelongsTo { table: &'a Table, field: String },
    /// Attach the records of `table` whose `field` points at this record, under
    /// the related table's name. With `count`, attach only how many there are.
    HasMany {
        table: &'a Table,
        field: String,
        count: bool,
    },
}

/// Post-processing shared by [`super::Query`] and [`super::Finder`].
#[derive(Debug, Clone, Default)]
pub struct ReadOptions<'a> {
    pub select: Option<Vec<String>>,
    pub format: bool,
    pub references: Vec<Reference<'a>>,
}

impl<'a> ReadOptions<'a> {
    /// Parse a comma separated field list.
    pub fn set_select(&mut self, fields: &str) {
        let fields: Vec<String> = fields
            .split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::to_string)
            .collect();
        self.select = (!fields.is_empty()).then_some(fields);
    }

    /// Turn a stored record into a result: read form, optional presentation,
    /// resolved references, then projection.
    pub(crate) fn finish(&self, owner: &Table, stored: &Record) -> Result<Record> {
        let (source, mut out) = self.prepare(owner.schema(), stored);
        for reference in &self.references {
            reference.populate(owner, &source, &mut out)?;
        }
        Ok(self.project(out))
    }

    pub(crate) async fn finish_async(&self, owner: &Table, stored: &Record) -> Result<Record> {
        let (source, mut out) = self.prepare(owner.schema(), stored);
        for reference in &self.references {
            reference.populate_async(owner, &source, &mut out).await?;
        }
        Ok(self.project(out))
    }

    fn prepare(&self, schema: &Schema, stored: &Record) -> (Record, Record) {
        let source = schema.convert_back_record(stored);
        let out = if self.format {
            format_record(schema, &source)
        } else {
            source.clone()
        };
        (source, out)
    }

    fn project(&self, mut record: Record) -> Record {
        let Some(fields) = &self.select else {
            return record;
        };
        let mut keep: Vec<&str> = fields.iter().map(String::as_str).collect();
        for reference in &self.references {
            if let Reference::HasMany { table, .. } = reference {
                keep.push(table.name());
            }
        }

        if let Some(Value::Object(raw)) = record.get_mut(RAW_KEY) {
            raw.retain(|k, _| keep.contains(&k.as_str()));
            if raw.is_empty() {
                record.remove(RAW_KEY);
            }
        }
        record.retain(|k, _| k == RAW_KEY || keep.contains(&k.as_str()));
        record
    }
}

/// Presentation values of a record, with the stored values of every changed
/// field under [`RAW_KEY`].
pub fn format_record(schema: &Schema, record: &Record) -> Record {
    let presentation = schema.present(record);
    let mut out = presentation.values;
    if !presentation.raw.is_empty() {
        out.insert(RAW_KEY.to_string(), Value::Object(presentation.raw));
    }
    out
}

impl<'a> Reference<'a> {
    fn populate(&self, owner: &Table, source: &Record, out: &mut Record) -> Result<()> {
        match self {
            Reference::BelongsTo { table, field } => {
                let Some(id) = foreign_key(source, field) else {
                    return Ok(());
                };
                match table.connection().find(table.name(), &id)? {
                    Some(stored) => {
                        let related = table.schema().convert_back_record(&stored);
                        out.insert(field.clone(), Value::Object(related));
                    }
                    None => log::debug!("{}.{field} -> {id} not found", owner.name()),
                }
            }
            Reference::HasMany {
                table,
                field,
                count,
            } => {
                let Some(id) = source.get(PRIMARY_KEY).cloned() else {
                    return Ok(());
                };
                if *count {
                    if let Some(n) = counter_value(owner, table, field, source) {
                        out.insert(table.name().to_string(), Value::from(n));
                        return Ok(());
                    }
                }
                let rows = table.connection().find_all(table.name())?;
                let related = children(table, field, &id, rows)?;
                out.insert(table.name().to_string(), attach(related, *count));
            }
        }
        Ok(())
    }

    async fn populate_async(&self, owner: &Table, source: &Record, out: &mut Record) -> Result<()> {
        match self {
            Reference::BelongsTo { table, field } => {
                let Some(id) = foreign_key(source, field) else {
                    return Ok(());
                };
                match table.connection().find_async(table.name(), &id).await? {
                    Some(stored) => {
                        let related = table.schema().convert_back_record(&stored);
                        out.insert(field.clone(), Value::Object(related));
                    }
                    None => log::debug!("{}.{field} -> {id} not found", owner.name()),
                }
            }
            Reference::HasMany {
                table,
                field,
                count,
            } => {
                let Some(id) = source.get(PRIMARY_KEY).cloned() else {
                    return Ok(());
                };
                if *count {
                    if let Some(n) = counter_value(owner, table, field, source) {
                        out.insert(table.name().to_string(), Value::from(n));
                        return Ok(());
                    }
                }
                let rows = table.connection().find_all_async(table.name()).await?;
                let related = children(table, field, &id, rows)?;
                out.insert(table.name().to_string(), attach(related, *count));
            }
        }
        Ok(())
    }
}

fn foreign_key(source: &Record, field: &str) -> Option<String> {
    match source.get(field)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Object(obj) => obj.get(PRIMARY_KEY)?.as_str().map(str::to_string),
        _ => None,
    }
}

/// Maintained count on `source` when `field` of `related` is a counter
/// reference back to `owner`.
fn counter_value(owner: &Table, related: &Table, field: &str, source: &Record) -> Option<i64> {
    let (target, counter) = related.schema().field(field)?.counter_target()?;
    if target != owner.name() {
        return None;
    }
    Some(source.get(counter).and_then(as_i64).unwrap_or(0))
}

/// Records of `table` whose `field` equals `id`, in id order, in read form.
fn children(table: &Table, field: &str, id: &Value, rows: Vec<Record>) -> Result<Vec<Record>> {
    let Some(filter) = Filter::new().eq(field, id.clone()).normalized(table.schema()) else {
        return Ok(Vec::new());
    };
    let mut related: Vec<Record> = rows.into_iter().filter(|r| filter.matches(r)).collect();
    related.sort_by(|a, b| by_id(a, b));
    Ok(related
        .iter()
        .map(|r| table.schema().convert_back_record(r))
        .collect())
}

fn attach(related: Vec<Record>, count: bool) -> Value {
    if count {
        Value::from(related.len())
    } else {
        Value::Array(related.into_iter().map(Value::Object).collect())
    }
}

pub(crate) fn by_id(a: &Record, b: &Record) -> Ordering {
    compare_values(
        a.get(PRIMARY_KEY).unwrap_or(&Value::Null),
        b.get(PRIMARY_KEY).unwrap_or(&Value::Null),
    )
    .unwrap_or(Ordering::Equal)
}
