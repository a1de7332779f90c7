use super::filter::Filter;
use super::reference::{by_id, ReadOptions, Reference};
use crate::error::Result;
use crate::schema::{Record, PRIMARY_KEY};
use crate::storage;
use crate::table::Table;
use serde_json::Value;

#[derive(Debug, Clone)]
enum Target {
    Id(String),
    Field(String, Value),
}

/// Lookup of a single record, by id or by field value.
///
/// Unique fields are answered through their index entry; any other field
/// falls back to a scan and yields the match with the lowest id.
#[derive(Debug, Clone)]
pub struct Finder<'a> {
    table: &'a Table,
    target: Target,
    options: ReadOptions<'a>,
}

impl<'a> Finder<'a> {
    pub(crate) fn by_id(table: &'a Table, id: &str) -> Self {
        Self {
            table,
            target: Target::Id(id.to_string()),
            options: ReadOptions::default(),
        }
    }

    pub(crate) fn by_field(table: &'a Table, field: &str, value: Value) -> Self {
        let target = if field == PRIMARY_KEY {
            Target::Id(storage::index_key(&value).unwrap_or_default())
        } else {
            Target::Field(field.to_string(), value)
        };
        Self {
            table,
            target,
            options: ReadOptions::default(),
        }
    }

    /// Keep only the listed fields, e.g. `"name, email"`.
    pub fn select(mut self, fields: &str) -> Self {
        self.options.set_select(fields);
        self
    }

    /// Return presentation values, with stored values under `_raw`.
    pub fn format(mut self) -> Self {
        self.options.format = true;
        self
    }

    pub fn belongs_to(mut self, table: &'a Table, field: &str) -> Self {
        self.options.references.push(Reference::BelongsTo {
            table,
            field: field.to_string(),
        });
        self
    }

    pub fn has_many(mut self, table: &'a Table, field: &str) -> Self {
        self.options.references.push(Reference::HasMany {
            table,
            field: field.to_string(),
            count: false,
        });
        self
    }

    pub fn has_many_count(mut self, table: &'a Table, field: &str) -> Self {
        self.options.references.push(Reference::HasMany {
            table,
            field: field.to_string(),
            count: true,
        });
        self
    }

    pub fn exec(&self) -> Result<Option<Record>> {
        let conn = self.table.connection();
        let name = self.table.name();
        let stored = match &self.target {
            Target::Id(id) => conn.find(name, id)?,
            Target::Field(field, value) => match self.stored_value(field, value) {
                None => None,
                Some(value) if self.is_unique(field) => conn
                    .find_by(name, field, &value)?
                    .filter(|r| holds(r, field, &value)),
                Some(value) => first_match(conn.find_all(name)?, field, value),
            },
        };
        stored
            .map(|record| self.options.finish(self.table, &record))
            .transpose()
    }

    pub async fn exec_async(&self) -> Result<Option<Record>> {
        let conn = self.table.connection();
        let name = self.table.name();
        let stored = match &self.target {
            Target::Id(id) => conn.find_async(name, id).await?,
            Target::Field(field, value) => match self.stored_value(field, value) {
                None => None,
                Some(value) if self.is_unique(field) => conn
                    .find_by_async(name, field, &value)
                    .await?
                    .filter(|r| holds(r, field, &value)),
                Some(value) => first_match(conn.find_all_async(name).await?, field, value),
            },
        };
        match stored {
            Some(record) => Ok(Some(self.options.finish_async(self.table, &record).await?)),
            None => Ok(None),
        }
    }

    fn is_unique(&self, field: &str) -> bool {
        self.table
            .schema()
            .field(field)
            .map(|def| def.is_unique())
            .unwrap_or(false)
    }

    /// The value as it would be stored. A value the field cannot hold matches
    /// nothing.
    fn stored_value(&self, field: &str, value: &Value) -> Option<Value> {
        match self.table.schema().to_stored(field, value) {
            Ok(stored) => Some(stored),
            Err(e) => {
                log::debug!("{}.{field}: {e}", self.table.name());
                None
            }
        }
    }
}

/// An index entry may outlive the value it was made for; only a record that
/// still holds `value` counts as found.
fn holds(record: &Record, field: &str, value: &Value) -> bool {
    let held = Filter::new().eq(field, value.clone()).matches(record);
    if !held {
        log::warn!("stale index entry {field} -> {:?}", record.get(PRIMARY_KEY));
    }
    held
}

fn first_match(rows: Vec<Record>, field: &str, value: Value) -> Option<Record> {
    let filter = Filter::new().eq(field, value);
    rows.into_iter()
        .filter(|r| filter.matches(r))
        .min_by(by_id)
}
