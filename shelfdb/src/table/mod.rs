mod reconcile;

pub use reconcile::{IndexIssue, ReconcileReport};

use crate::config::StoreConfig;
use crate::error::{InvalidMessages, Result, ShelfError};
use crate::query::{Filter, Finder, Query};
use crate::schema::{as_i64, EventKind, Record, Schema, SystemContext, PRIMARY_KEY};
use crate::sequence::{MemorySequence, SequenceProvider};
use crate::storage::{self, Connection};
use crate::validation::ValidationMode;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// `(field, stored value)` pairs of unique fields.
type UniqueValues = Vec<(String, Value)>;

/// A named collection of records governed by one schema.
///
/// Writes keep the unique index in step with the canonical record: new index
/// entries are linked first, then the record is written, then entries for
/// replaced values are removed. A failure after the first link unlinks what
/// was created. Nothing here is transactional across files; see
/// [`Table::reconcile`] for cleaning up after a crash.
#[derive(Clone)]
pub struct Table {
    name: String,
    schema: Arc<Schema>,
    conn: Connection,
    sequence: Arc<dyn SequenceProvider>,
    id_length: usize,
    random_length: usize,
}

impl Table {
    /// Open (and initialize if needed) a table. Auto-increment fields continue
    /// from the largest value already stored.
    pub fn open(conn: Connection, name: &str, schema: Schema, config: &StoreConfig) -> Result<Self> {
        check_table_name(name)?;
        conn.create_table_paths(name, &schema)?;
        let records = conn.find_all(name)?;
        let sequence = MemorySequence::seeded(&records, schema.auto_increment_fields());
        Self::open_with_sequence(conn, name, schema, config, Arc::new(sequence))
    }

    pub async fn open_async(
        conn: Connection,
        name: &str,
        schema: Schema,
        config: &StoreConfig,
    ) -> Result<Self> {
        check_table_name(name)?;
        conn.create_table_paths_async(name, &schema).await?;
        let records = conn.find_all_async(name).await?;
        let sequence = MemorySequence::seeded(&records, schema.auto_increment_fields());
        Self::open_with_sequence(conn, name, schema, config, Arc::new(sequence))
    }

    /// Open a table whose auto-increment values come from `sequence`.
    pub fn open_with_sequence(
        conn: Connection,
        name: &str,
        schema: Schema,
        config: &StoreConfig,
        sequence: Arc<dyn SequenceProvider>,
    ) -> Result<Self> {
        check_table_name(name)?;
        conn.create_table_paths(name, &schema)?;
        log::debug!("opened table {name}");
        Ok(Table {
            name: name.to_string(),
            schema: Arc::new(schema),
            conn,
            sequence,
            id_length: config.id_length,
            random_length: config.random_length,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    // ── Reads ─────────────────────────────────────────────────────

    /// Point lookup by primary id.
    pub fn find(&self, id: &str) -> Finder<'_> {
        Finder::by_id(self, id)
    }

    /// Point lookup by field value. Unique fields resolve through the index,
    /// other fields fall back to a scan and return the first match by id.
    pub fn find_by(&self, field: &str, value: impl Into<Value>) -> Finder<'_> {
        Finder::by_field(self, field, value.into())
    }

    pub fn query(&self) -> Query<'_> {
        Query::new(self)
    }

    pub fn count(&self, filter: Filter) -> Result<usize> {
        self.query().filter(filter).count()
    }

    pub async fn count_async(&self, filter: Filter) -> Result<usize> {
        self.query().filter(filter).count_async().await
    }

    // ── Insert ────────────────────────────────────────────────────

    /// Validate, store and index a new record. Returns the stored record in
    /// read form.
    pub fn insert(&self, data: &Record) -> Result<Record> {
        let (id, stored) = self.prepare_insert(data)?;
        let values = self.claimable(self.unique_values(&stored), &id)?;

        self.link_values(&id, &values)?;
        if let Err(e) = self.conn.save(&self.name, &id, &stored) {
            self.unlink_quietly(&values);
            return Err(e);
        }

        self.adjust_counters(None, Some(&stored))?;
        Ok(self.after(EventKind::AfterInsert, &stored))
    }

    pub async fn insert_async(&self, data: &Record) -> Result<Record> {
        let (id, stored) = self.prepare_insert(data)?;
        let values = self
            .claimable_async(self.unique_values(&stored), &id)
            .await?;

        self.link_values_async(&id, &values).await?;
        if let Err(e) = self.conn.save_async(&self.name, &id, &stored).await {
            self.unlink_quietly_async(&values).await;
            return Err(e);
        }

        self.adjust_counters_async(None, Some(&stored)).await?;
        Ok(self.after(EventKind::AfterInsert, &stored))
    }

    /// Insert records one by one, stopping at the first failure. Records
    /// inserted before the failure stay.
    pub fn insert_all(&self, data: &[Record]) -> Result<Vec<Record>> {
        data.iter().map(|record| self.insert(record)).collect()
    }

    pub async fn insert_all_async(&self, data: &[Record]) -> Result<Vec<Record>> {
        let mut inserted = Vec::with_capacity(data.len());
        for record in data {
            inserted.push(self.insert_async(record).await?);
        }
        Ok(inserted)
    }

    fn prepare_insert(&self, data: &Record) -> Result<(String, Record)> {
        // Callers never choose system or alias values
        let input = self.schema.filter_data(data);
        let mut record = self.schema.add_values(&input, &self.context());
        self.schema.fire(EventKind::BeforeInsert, &mut record);

        let messages = self.schema.validate(&record, ValidationMode::Insert);
        if !messages.is_empty() {
            return Err(ShelfError::Validation(messages));
        }

        self.schema.clear_fake_fields(&mut record);
        let stored = self.schema.to_stored_record(&record)?;
        let id = record_id(&stored)?;
        Ok((id, stored))
    }

    // ── Update ────────────────────────────────────────────────────

    /// Apply the changed fields of `data` to record `id`. Read-only and system
    /// fields in `data` are ignored.
    pub fn update(&self, id: &str, data: &Record) -> Result<Record> {
        let existing = self
            .conn
            .find(&self.name, id)?
            .ok_or_else(|| self.not_found(id))?;
        let stored = self.prepare_update(&existing, data)?;

        let (old_values, new_values) = self.moved_values(&existing, &stored);
        let claimed = self.claimable(new_values, id)?;

        self.link_values(id, &claimed)?;
        if let Err(e) = self.conn.save(&self.name, id, &stored) {
            self.unlink_quietly(&claimed);
            return Err(e);
        }
        self.release_values(id, &old_values);

        self.adjust_counters(Some(&existing), Some(&stored))?;
        Ok(self.after(EventKind::AfterUpdate, &stored))
    }

    pub async fn update_async(&self, id: &str, data: &Record) -> Result<Record> {
        let existing = self
            .conn
            .find_async(&self.name, id)
            .await?
            .ok_or_else(|| self.not_found(id))?;
        let stored = self.prepare_update(&existing, data)?;

        let (old_values, new_values) = self.moved_values(&existing, &stored);
        let claimed = self.claimable_async(new_values, id).await?;

        self.link_values_async(id, &claimed).await?;
        if let Err(e) = self.conn.save_async(&self.name, id, &stored).await {
            self.unlink_quietly_async(&claimed).await;
            return Err(e);
        }
        self.release_values_async(id, &old_values).await;

        self.adjust_counters_async(Some(&existing), Some(&stored))
            .await?;
        Ok(self.after(EventKind::AfterUpdate, &stored))
    }

    /// Update every record matching `filter` with the same data.
    pub fn update_all(&self, filter: Filter, data: &Record) -> Result<Vec<Record>> {
        let ids = self.query().filter(filter).matching_ids()?;
        ids.iter().map(|id| self.update(id, data)).collect()
    }

    pub async fn update_all_async(&self, filter: Filter, data: &Record) -> Result<Vec<Record>> {
        let ids = self.query().filter(filter).matching_ids_async().await?;
        let mut updated = Vec::with_capacity(ids.len());
        for id in &ids {
            updated.push(self.update_async(id, data).await?);
        }
        Ok(updated)
    }

    /// Stored form of `existing` with the changes in `data` applied.
    fn prepare_update(&self, existing: &Record, data: &Record) -> Result<Record> {
        let mut input = self.schema.filter_data(data);
        self.schema.fire(EventKind::BeforeUpdate, &mut input);

        let messages = self.schema.validate(&input, ValidationMode::Update);
        if !messages.is_empty() {
            return Err(ShelfError::Validation(messages));
        }

        self.schema.clear_fake_fields(&mut input);
        let changed = self.schema.get_changed_fields(&input, existing)?;

        // Re-run the value pipeline on the merged record so `modified` and
        // aliases are refreshed
        let mut merged = self.schema.convert_back_record(existing);
        merged.extend(changed.clone());
        let merged = self.schema.add_values(&merged, &self.context());

        let mut stored = existing.clone();
        for (name, value) in &merged {
            let refreshed = self
                .schema
                .field(name)
                .map(|def| def.is_system() || def.is_alias())
                .unwrap_or(false);
            if changed.contains_key(name) || refreshed || !existing.contains_key(name) {
                stored.insert(name.clone(), self.schema.to_stored(name, value)?);
            }
        }
        Ok(stored)
    }

    /// Unique values replaced by an update: `(old, new)`.
    fn moved_values(&self, existing: &Record, stored: &Record) -> (UniqueValues, UniqueValues) {
        let mut old_values = Vec::new();
        let mut new_values = Vec::new();
        for (field, _) in self.schema.unique_fields() {
            let old = existing.get(field).cloned().unwrap_or(Value::Null);
            let new = stored.get(field).cloned().unwrap_or(Value::Null);
            if storage::index_key(&old) == storage::index_key(&new) {
                continue;
            }
            if storage::index_key(&old).is_some() {
                old_values.push((field.to_string(), old));
            }
            if storage::index_key(&new).is_some() {
                new_values.push((field.to_string(), new));
            }
        }
        (old_values, new_values)
    }

    // ── Remove ────────────────────────────────────────────────────

    /// Delete record `id` and its index entries. Returns the removed record.
    pub fn remove(&self, id: &str) -> Result<Record> {
        let existing = self
            .conn
            .find(&self.name, id)?
            .ok_or_else(|| self.not_found(id))?;
        let mut view = self.schema.convert_back_record(&existing);
        self.schema.fire(EventKind::BeforeRemove, &mut view);

        self.conn.remove(&self.name, id)?;
        self.release_values(id, &self.unique_values(&existing));

        self.adjust_counters(Some(&existing), None)?;
        Ok(self.after(EventKind::AfterRemove, &existing))
    }

    pub async fn remove_async(&self, id: &str) -> Result<Record> {
        let existing = self
            .conn
            .find_async(&self.name, id)
            .await?
            .ok_or_else(|| self.not_found(id))?;
        let mut view = self.schema.convert_back_record(&existing);
        self.schema.fire(EventKind::BeforeRemove, &mut view);

        self.conn.remove_async(&self.name, id).await?;
        self.release_values_async(id, &self.unique_values(&existing))
            .await;

        self.adjust_counters_async(Some(&existing), None).await?;
        Ok(self.after(EventKind::AfterRemove, &existing))
    }

    /// Remove every record matching `filter`. Returns how many were removed.
    pub fn remove_all(&self, filter: Filter) -> Result<usize> {
        let ids = self.query().filter(filter).matching_ids()?;
        for id in &ids {
            self.remove(id)?;
        }
        Ok(ids.len())
    }

    pub async fn remove_all_async(&self, filter: Filter) -> Result<usize> {
        let ids = self.query().filter(filter).matching_ids_async().await?;
        for id in &ids {
            self.remove_async(id).await?;
        }
        Ok(ids.len())
    }

    // ── Index maintenance ─────────────────────────────────────────

    fn unique_values(&self, stored: &Record) -> UniqueValues {
        self.schema
            .unique_fields()
            .filter_map(|(field, _)| {
                let value = stored.get(field)?;
                storage::index_key(value).map(|_| (field.to_string(), value.clone()))
            })
            .collect()
    }

    /// Values not yet held by `own_id`. Fails with every field whose value
    /// belongs to another record.
    fn claimable(&self, values: UniqueValues, own_id: &str) -> Result<UniqueValues> {
        let mut taken = InvalidMessages::new();
        let mut claimable = Vec::with_capacity(values.len());
        for (field, value) in values {
            match self.conn.resolve_unique(&self.name, &field, &value)? {
                Some(holder) if holder == own_id => {}
                Some(_) => taken.add(field.as_str(), self.duplicate_message(&field)),
                None => claimable.push((field, value)),
            }
        }
        if taken.is_empty() {
            Ok(claimable)
        } else {
            Err(ShelfError::Duplicate(taken))
        }
    }

    async fn claimable_async(&self, values: UniqueValues, own_id: &str) -> Result<UniqueValues> {
        let mut taken = InvalidMessages::new();
        let mut claimable = Vec::with_capacity(values.len());
        for (field, value) in values {
            match self
                .conn
                .resolve_unique_async(&self.name, &field, &value)
                .await?
            {
                Some(holder) if holder == own_id => {}
                Some(_) => taken.add(field.as_str(), self.duplicate_message(&field)),
                None => claimable.push((field, value)),
            }
        }
        if taken.is_empty() {
            Ok(claimable)
        } else {
            Err(ShelfError::Duplicate(taken))
        }
    }

    fn link_values(&self, id: &str, values: &[(String, Value)]) -> Result<()> {
        for (i, (field, value)) in values.iter().enumerate() {
            if let Err(e) = self.conn.link_unique_file(&self.name, field, id, value) {
                // Lost a race or hit an I/O error: drop what this call linked
                self.unlink_quietly(&values[..i]);
                return Err(self.relabel(e));
            }
        }
        Ok(())
    }

    async fn link_values_async(&self, id: &str, values: &[(String, Value)]) -> Result<()> {
        for (i, (field, value)) in values.iter().enumerate() {
            if let Err(e) = self
                .conn
                .link_unique_file_async(&self.name, field, id, value)
                .await
            {
                self.unlink_quietly_async(&values[..i]).await;
                return Err(self.relabel(e));
            }
        }
        Ok(())
    }

    fn unlink_quietly(&self, values: &[(String, Value)]) {
        for (field, value) in values {
            if let Err(e) = self.conn.unlink_unique_file(&self.name, field, value) {
                log::warn!("failed to unlink {}/{}: {}", self.name, field, e);
            }
        }
    }

    async fn unlink_quietly_async(&self, values: &[(String, Value)]) {
        for (field, value) in values {
            if let Err(e) = self
                .conn
                .unlink_unique_file_async(&self.name, field, value)
                .await
            {
                log::warn!("failed to unlink {}/{}: {}", self.name, field, e);
            }
        }
    }

    /// Unlink entries of `id` that are no longer wanted. Entries that another
    /// live record holds are left alone.
    fn release_values(&self, id: &str, values: &[(String, Value)]) {
        for (field, value) in values {
            match self.conn.resolve_unique(&self.name, field, value) {
                Ok(Some(holder)) if holder != id => continue,
                Ok(_) => self.unlink_quietly(std::slice::from_ref(&(field.clone(), value.clone()))),
                Err(e) => log::warn!("failed to resolve {}/{}: {}", self.name, field, e),
            }
        }
    }

    async fn release_values_async(&self, id: &str, values: &[(String, Value)]) {
        for (field, value) in values {
            match self
                .conn
                .resolve_unique_async(&self.name, field, value)
                .await
            {
                Ok(Some(holder)) if holder != id => continue,
                Ok(_) => {
                    self.unlink_quietly_async(std::slice::from_ref(&(field.clone(), value.clone())))
                        .await
                }
                Err(e) => log::warn!("failed to resolve {}/{}: {}", self.name, field, e),
            }
        }
    }

    fn duplicate_message(&self, field: &str) -> String {
        let label = self
            .schema
            .field(field)
            .map(|def| def.label_or(field))
            .unwrap_or(field);
        format!("{label} already exists")
    }

    fn relabel(&self, err: ShelfError) -> ShelfError {
        match err {
            ShelfError::Duplicate(messages) => {
                let mut relabeled = InvalidMessages::new();
                for field in messages.fields() {
                    relabeled.add(field, self.duplicate_message(field));
                }
                ShelfError::Duplicate(relabeled)
            }
            other => other,
        }
    }

    // ── Counters ──────────────────────────────────────────────────

    /// Move counter references from `old` to `new` targets.
    fn adjust_counters(&self, old: Option<&Record>, new: Option<&Record>) -> Result<()> {
        for (field, target, counter, before, after) in self.counter_moves(old, new) {
            if let Some(id) = before {
                self.bump_counter(target, counter, &id, -1)?;
            }
            if let Some(id) = after {
                self.bump_counter(target, counter, &id, 1)?;
            }
            log::debug!("adjusted {target}.{counter} for {}.{field}", self.name);
        }
        Ok(())
    }

    async fn adjust_counters_async(&self, old: Option<&Record>, new: Option<&Record>) -> Result<()> {
        for (field, target, counter, before, after) in self.counter_moves(old, new) {
            if let Some(id) = before {
                self.bump_counter_async(target, counter, &id, -1).await?;
            }
            if let Some(id) = after {
                self.bump_counter_async(target, counter, &id, 1).await?;
            }
            log::debug!("adjusted {target}.{counter} for {}.{field}", self.name);
        }
        Ok(())
    }

    #[allow(clippy::type_complexity)]
    fn counter_moves<'s>(
        &'s self,
        old: Option<&Record>,
        new: Option<&Record>,
    ) -> Vec<(&'s str, &'s str, &'s str, Option<String>, Option<String>)> {
        self.schema
            .counter_fields()
            .filter_map(|(field, target, counter)| {
                let before = old.and_then(|r| r.get(field)).and_then(storage::index_key);
                let after = new.and_then(|r| r.get(field)).and_then(storage::index_key);
                (before != after).then_some((field, target, counter, before, after))
            })
            .collect()
    }

    fn bump_counter(&self, table: &str, counter: &str, id: &str, delta: i64) -> Result<()> {
        let Some(mut target) = self.conn.find(table, id)? else {
            log::warn!("counter target {table}/{id} not found, skipping {counter}");
            return Ok(());
        };
        apply_delta(&mut target, counter, delta);
        self.conn.save(table, id, &target)
    }

    async fn bump_counter_async(&self, table: &str, counter: &str, id: &str, delta: i64) -> Result<()> {
        let Some(mut target) = self.conn.find_async(table, id).await? else {
            log::warn!("counter target {table}/{id} not found, skipping {counter}");
            return Ok(());
        };
        apply_delta(&mut target, counter, delta);
        self.conn.save_async(table, id, &target).await
    }

    // ── Helpers ───────────────────────────────────────────────────

    fn context(&self) -> SystemContext<'_> {
        SystemContext {
            sequence: self.sequence.as_ref(),
            id_length: self.id_length,
            random_length: self.random_length,
        }
    }

    /// Read form of a stored record, passed through an after-event hook.
    fn after(&self, kind: EventKind, stored: &Record) -> Record {
        let mut record = self.schema.convert_back_record(stored);
        self.schema.fire(kind, &mut record);
        record
    }

    fn not_found(&self, id: &str) -> ShelfError {
        ShelfError::NotFound {
            table: self.name.clone(),
            id: id.to_string(),
        }
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("name", &self.name)
            .field("root", &self.conn.root())
            .field("schema", &self.schema)
            .finish()
    }
}

fn check_table_name(name: &str) -> Result<()> {
    if storage::is_valid_name(name) {
        Ok(())
    } else {
        Err(ShelfError::Other(format!("invalid table name '{name}'")))
    }
}

fn record_id(stored: &Record) -> Result<String> {
    match stored.get(PRIMARY_KEY).and_then(Value::as_str) {
        Some(id) if storage::is_valid_name(id) => Ok(id.to_string()),
        _ => Err(ShelfError::Other(format!(
            "record has no usable '{PRIMARY_KEY}'"
        ))),
    }
}

fn apply_delta(record: &mut Record, counter: &str, delta: i64) {
    let current = record.get(counter).and_then(as_i64).unwrap_or(0);
    record.insert(counter.to_string(), Value::from((current + delta).max(0)));
}
