// On-disk layout of tables: canonical record files plus symlinked unique-index entries

use crate::error::{InvalidMessages, Result, ShelfError};
use crate::schema::{Record, Schema, PRIMARY_KEY};
use crate::util;
use serde_json::Value;
use std::io;
use std::path::{Path, PathBuf};

/// One entry of a unique-field directory, as seen by reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueEntry {
    pub path: PathBuf,
    /// Record id the link points at, if the link target has the expected shape.
    pub target: Option<String>,
    /// Whether the target record file exists.
    pub live: bool,
}

/// Maps table, record and unique-field operations onto a directory tree:
///
/// ```text
/// <root>/<table>/_id/<id>.<ext>            canonical record
/// <root>/<table>/<field>/<digest>.<ext>    symlink to ../_id/<id>.<ext>
/// ```
///
/// "Entry does not exist" is reported as `Ok(None)`. Every other I/O failure
/// propagates.
#[derive(Debug, Clone)]
pub struct Connection {
    root: PathBuf,
    extension: String,
}

impl Connection {
    pub fn new(root: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Connection {
            root: root.into(),
            extension: extension.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    // ── Paths ─────────────────────────────────────────────────────

    pub fn table_path(&self, table: &str) -> PathBuf {
        self.root.join(table)
    }

    pub fn id_path(&self, table: &str) -> PathBuf {
        self.table_path(table).join(PRIMARY_KEY)
    }

    pub fn id_file(&self, table: &str, id: &str) -> PathBuf {
        self.id_path(table).join(self.file_name(id))
    }

    pub fn unique_path(&self, table: &str, field: &str) -> PathBuf {
        self.table_path(table).join(field)
    }

    /// Index entry for `value`, or `None` for values that are never indexed (null, "").
    pub fn unique_file(&self, table: &str, field: &str, value: &Value) -> Option<PathBuf> {
        let key = index_key(value)?;
        Some(
            self.unique_path(table, field)
                .join(self.file_name(&util::index_digest(&key))),
        )
    }

    fn file_name(&self, stem: &str) -> String {
        format!("{stem}.{}", self.extension)
    }

    fn link_target(&self, id: &str) -> PathBuf {
        Path::new("..").join(PRIMARY_KEY).join(self.file_name(id))
    }

    /// Id encoded in a record file or link target name.
    fn id_from_path(&self, path: &Path) -> Option<String> {
        if path.extension()?.to_str()? != self.extension {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        is_valid_name(stem).then(|| stem.to_string())
    }

    // ── Table directories ─────────────────────────────────────────

    /// Create the table root, the record directory and one directory per unique
    /// field. Safe to call on an initialized table.
    pub fn create_table_paths(&self, table: &str, schema: &Schema) -> Result<()> {
        std::fs::create_dir_all(self.id_path(table))?;
        for (field, _) in schema.unique_fields() {
            std::fs::create_dir_all(self.unique_path(table, field))?;
        }
        Ok(())
    }

    pub async fn create_table_paths_async(&self, table: &str, schema: &Schema) -> Result<()> {
        tokio::fs::create_dir_all(self.id_path(table)).await?;
        for (field, _) in schema.unique_fields() {
            tokio::fs::create_dir_all(self.unique_path(table, field)).await?;
        }
        Ok(())
    }

    /// Remove a table directory with everything in it. Missing tables are fine.
    pub fn drop_table(&self, table: &str) -> Result<()> {
        log::debug!("dropping table {table}");
        match std::fs::remove_dir_all(self.table_path(table)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    pub async fn drop_table_async(&self, table: &str) -> Result<()> {
        log::debug!("dropping table {table}");
        match tokio::fs::remove_dir_all(self.table_path(table)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }

    // ── Reads ─────────────────────────────────────────────────────

    pub fn find(&self, table: &str, id: &str) -> Result<Option<Record>> {
        if !is_valid_name(id) {
            return Ok(None);
        }
        read_record(&self.id_file(table, id))
    }

    pub async fn find_async(&self, table: &str, id: &str) -> Result<Option<Record>> {
        if !is_valid_name(id) {
            return Ok(None);
        }
        read_record_async(&self.id_file(table, id)).await
    }

    /// Record holding `value` in a unique field. A dangling entry reads as `None`.
    pub fn find_by(&self, table: &str, field: &str, value: &Value) -> Result<Option<Record>> {
        match self.unique_file(table, field, value) {
            Some(path) => read_record(&path),
            None => Ok(None),
        }
    }

    pub async fn find_by_async(
        &self,
        table: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<Record>> {
        match self.unique_file(table, field, value) {
            Some(path) => read_record_async(&path).await,
            None => Ok(None),
        }
    }

    /// Id of the live record holding `value` in a unique field.
    pub fn resolve_unique(&self, table: &str, field: &str, value: &Value) -> Result<Option<String>> {
        let Some(path) = self.unique_file(table, field, value) else {
            return Ok(None);
        };
        let target = match std::fs::read_link(&path) {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        match self.id_from_path(&target) {
            Some(id) if self.id_file(table, &id).exists() => Ok(Some(id)),
            _ => Ok(None),
        }
    }

    pub async fn resolve_unique_async(
        &self,
        table: &str,
        field: &str,
        value: &Value,
    ) -> Result<Option<String>> {
        let Some(path) = self.unique_file(table, field, value) else {
            return Ok(None);
        };
        let target = match tokio::fs::read_link(&path).await {
            Ok(target) => target,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let Some(id) = self.id_from_path(&target) else {
            return Ok(None);
        };
        match tokio::fs::metadata(self.id_file(table, &id)).await {
            Ok(_) => Ok(Some(id)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every record file of a table, in directory order. Files with another
    /// extension, temp files and unreadable records are skipped.
    pub fn find_all(&self, table: &str) -> Result<Vec<Record>> {
        let dir = self.id_path(table);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if self.id_from_path(&path).is_none() {
                continue;
            }
            match read_record(&path) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => log::warn!("skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }

    pub async fn find_all_async(&self, table: &str) -> Result<Vec<Record>> {
        let dir = self.id_path(table);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if self.id_from_path(&path).is_none() {
                continue;
            }
            match read_record_async(&path).await {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => log::warn!("skipping unreadable record {}: {}", path.display(), e),
            }
        }
        Ok(records)
    }

    // ── Writes ────────────────────────────────────────────────────

    /// Create or replace the canonical record file. The write goes to a temp
    /// file first and is renamed into place, so index links never see a
    /// half-written record.
    pub fn save(&self, table: &str, id: &str, data: &Record) -> Result<()> {
        check_id(id)?;
        let path = self.id_file(table, id);
        let tmp = temp_path(&path);
        let bytes = serde_json::to_vec(data)?;

        std::fs::write(&tmp, bytes)?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(e.into());
        }
        log::debug!("saved {table}/{id}");
        Ok(())
    }

    pub async fn save_async(&self, table: &str, id: &str, data: &Record) -> Result<()> {
        check_id(id)?;
        let path = self.id_file(table, id);
        let tmp = temp_path(&path);
        let bytes = serde_json::to_vec(data)?;

        tokio::fs::write(&tmp, bytes).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        log::debug!("saved {table}/{id}");
        Ok(())
    }

    /// Delete the canonical record file. A missing file is an `Io` error.
    pub fn remove(&self, table: &str, id: &str) -> Result<()> {
        check_id(id)?;
        std::fs::remove_file(self.id_file(table, id))?;
        log::debug!("removed {table}/{id}");
        Ok(())
    }

    pub async fn remove_async(&self, table: &str, id: &str) -> Result<()> {
        check_id(id)?;
        tokio::fs::remove_file(self.id_file(table, id)).await?;
        log::debug!("removed {table}/{id}");
        Ok(())
    }

    /// Claim `value` for record `id` in a unique field.
    ///
    /// Fails with [`ShelfError::Duplicate`] when a live entry already exists.
    /// A dangling entry left behind by an interrupted operation is removed and
    /// the link retried once. Null and empty values are not indexed.
    pub fn link_unique_file(&self, table: &str, field: &str, id: &str, value: &Value) -> Result<()> {
        check_id(id)?;
        let Some(path) = self.unique_file(table, field, value) else {
            return Ok(());
        };
        let target = self.link_target(id);

        for attempt in 0..2 {
            match symlink(&target, &path) {
                Ok(()) => {
                    log::debug!("linked {table}/{field} -> {id}");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && is_dangling(&path)? {
                        log::warn!("removing dangling index entry {}", path.display());
                        remove_if_exists(&path)?;
                        continue;
                    }
                    return Err(duplicate(field));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(duplicate(field))
    }

    pub async fn link_unique_file_async(
        &self,
        table: &str,
        field: &str,
        id: &str,
        value: &Value,
    ) -> Result<()> {
        check_id(id)?;
        let Some(path) = self.unique_file(table, field, value) else {
            return Ok(());
        };
        let target = self.link_target(id);

        for attempt in 0..2 {
            match symlink_async(&target, &path).await {
                Ok(()) => {
                    log::debug!("linked {table}/{field} -> {id}");
                    return Ok(());
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if attempt == 0 && is_dangling_async(&path).await? {
                        log::warn!("removing dangling index entry {}", path.display());
                        remove_if_exists_async(&path).await?;
                        continue;
                    }
                    return Err(duplicate(field));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(duplicate(field))
    }

    /// Release the index entry for `value`. Missing entries are a no-op.
    pub fn unlink_unique_file(&self, table: &str, field: &str, value: &Value) -> Result<()> {
        if let Some(path) = self.unique_file(table, field, value) {
            remove_if_exists(&path)?;
            log::debug!("unlinked {table}/{field}");
        }
        Ok(())
    }

    pub async fn unlink_unique_file_async(
        &self,
        table: &str,
        field: &str,
        value: &Value,
    ) -> Result<()> {
        if let Some(path) = self.unique_file(table, field, value) {
            remove_if_exists_async(&path).await?;
            log::debug!("unlinked {table}/{field}");
        }
        Ok(())
    }

    /// Entries of one unique-field directory with the record each resolves to.
    pub fn unique_entries(&self, table: &str, field: &str) -> Result<Vec<UniqueEntry>> {
        let entries = match std::fs::read_dir(self.unique_path(table, field)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut out = Vec::new();
        for entry in entries {
            let path = entry?.path();
            let target = std::fs::read_link(&path)
                .ok()
                .and_then(|t| self.id_from_path(&t));
            let live = target
                .as_deref()
                .map(|id| self.id_file(table, id).exists())
                .unwrap_or(false);
            out.push(UniqueEntry { path, target, live });
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(out)
    }

    /// Remove an index entry found by [`Connection::unique_entries`].
    pub fn remove_entry(&self, entry: &UniqueEntry) -> Result<()> {
        remove_if_exists(&entry.path)
    }
}

/// String form of a value as it is digested for the index.
/// Null and the empty string have no index entry.
pub fn index_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

pub(crate) fn is_valid_name(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.starts_with('.') && !id.contains(['/', '\\'])
}

fn check_id(id: &str) -> Result<()> {
    if is_valid_name(id) {
        Ok(())
    } else {
        Err(ShelfError::Other(format!("invalid record id '{id}'")))
    }
}

fn duplicate(field: &str) -> ShelfError {
    let mut messages = InvalidMessages::new();
    messages.add(field, format!("{field} already exists"));
    ShelfError::Duplicate(messages)
}

fn temp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.tmp"))
}

fn parse_record(path: &Path, content: &str) -> Result<Record> {
    serde_json::from_str(content).map_err(|e| {
        log::debug!("corrupt record {}: {}", path.display(), e);
        ShelfError::Json(e)
    })
}

fn read_record(path: &Path) -> Result<Option<Record>> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_record(path, &content).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn read_record_async(path: &Path) -> Result<Option<Record>> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => parse_record(path, &content).map(Some),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn remove_if_exists_async(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

/// The link itself exists but its target does not.
fn is_dangling(path: &Path) -> Result<bool> {
    match std::fs::metadata(path) {
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(std::fs::symlink_metadata(path).is_ok()),
        Err(e) => Err(e.into()),
    }
}

async fn is_dangling_async(path: &Path) -> Result<bool> {
    match tokio::fs::metadata(path).await {
        Ok(_) => Ok(false),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            Ok(tokio::fs::symlink_metadata(path).await.is_ok())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(unix)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(target, link)
}

#[cfg(unix)]
async fn symlink_async(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink(target, link).await
}

#[cfg(windows)]
async fn symlink_async(target: &Path, link: &Path) -> io::Result<()> {
    tokio::fs::symlink_file(target, link).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FieldDefinition;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Connection, Schema) {
        let tmp = TempDir::new().unwrap();
        let conn = Connection::new(tmp.path(), "json");
        let schema = Schema::new([
            ("email", FieldDefinition::email().unique()),
            ("name", FieldDefinition::string()),
        ])
        .unwrap();
        conn.create_table_paths("user", &schema).unwrap();
        (tmp, conn, schema)
    }

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn test_create_table_paths_is_idempotent() {
        let (_tmp, conn, schema) = setup();
        conn.create_table_paths("user", &schema).unwrap();
        assert!(conn.id_path("user").is_dir());
        assert!(conn.unique_path("user", "email").is_dir());
        assert!(!conn.unique_path("user", "name").exists());
    }

    #[test]
    fn test_save_find_remove() {
        let (_tmp, conn, _schema) = setup();
        let data = record(json!({ "_id": "a1", "name": "Tom" }));

        assert_eq!(conn.find("user", "a1").unwrap(), None);
        conn.save("user", "a1", &data).unwrap();
        assert_eq!(conn.find("user", "a1").unwrap(), Some(data));

        conn.remove("user", "a1").unwrap();
        assert_eq!(conn.find("user", "a1").unwrap(), None);
        assert!(matches!(conn.remove("user", "a1"), Err(ShelfError::Io(_))));
    }

    #[test]
    fn test_ids_cannot_escape_the_table() {
        let (_tmp, conn, _schema) = setup();
        let data = Record::new();
        assert!(conn.save("user", "../x", &data).is_err());
        assert!(conn.save("user", "..", &data).is_err());
        assert_eq!(conn.find("user", "../../etc").unwrap(), None);
    }

    #[test]
    fn test_link_enforces_uniqueness() {
        let (_tmp, conn, _schema) = setup();
        let email = json!("tom@hello.com");
        conn.save("user", "a1", &record(json!({ "_id": "a1", "email": "tom@hello.com" })))
            .unwrap();

        conn.link_unique_file("user", "email", "a1", &email).unwrap();
        let err = conn.link_unique_file("user", "email", "b2", &email).unwrap_err();
        assert!(matches!(err, ShelfError::Duplicate(ref m) if m.contains("email")));

        let found = conn.find_by("user", "email", &email).unwrap().unwrap();
        assert_eq!(found["_id"], json!("a1"));
        assert_eq!(
            conn.resolve_unique("user", "email", &email).unwrap(),
            Some("a1".to_string())
        );

        conn.unlink_unique_file("user", "email", &email).unwrap();
        conn.unlink_unique_file("user", "email", &email).unwrap();
        assert_eq!(conn.find_by("user", "email", &email).unwrap(), None);
    }

    #[test]
    fn test_dangling_entry_reads_as_none_and_is_replaced() {
        let (_tmp, conn, _schema) = setup();
        let email = json!("tom@hello.com");
        conn.save("user", "a1", &record(json!({ "_id": "a1" }))).unwrap();
        conn.link_unique_file("user", "email", "a1", &email).unwrap();
        conn.remove("user", "a1").unwrap();

        assert_eq!(conn.find_by("user", "email", &email).unwrap(), None);
        assert_eq!(conn.resolve_unique("user", "email", &email).unwrap(), None);

        conn.save("user", "b2", &record(json!({ "_id": "b2" }))).unwrap();
        conn.link_unique_file("user", "email", "b2", &email).unwrap();
        assert_eq!(
            conn.resolve_unique("user", "email", &email).unwrap(),
            Some("b2".to_string())
        );
    }

    #[test]
    fn test_null_values_are_not_indexed() {
        let (_tmp, conn, _schema) = setup();
        conn.link_unique_file("user", "email", "a1", &Value::Null).unwrap();
        conn.link_unique_file("user", "email", "a2", &json!("")).unwrap();
        assert!(conn.unique_entries("user", "email").unwrap().is_empty());
    }

    #[test]
    fn test_find_all_skips_foreign_and_corrupt_files() {
        let (_tmp, conn, _schema) = setup();
        conn.save("user", "a1", &record(json!({ "_id": "a1" }))).unwrap();
        conn.save("user", "b2", &record(json!({ "_id": "b2" }))).unwrap();
        std::fs::write(conn.id_path("user").join("notes.txt"), "hi").unwrap();
        std::fs::write(conn.id_path("user").join("c3.json"), "{ not json").unwrap();

        let mut ids: Vec<String> = conn
            .find_all("user")
            .unwrap()
            .iter()
            .map(|r| r["_id"].as_str().unwrap().to_string())
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["a1", "b2"]);

        assert!(conn.find_all("missing").unwrap().is_empty());
    }

    #[test]
    fn test_unique_entries_report_targets() {
        let (_tmp, conn, _schema) = setup();
        conn.save("user", "a1", &record(json!({ "_id": "a1" }))).unwrap();
        conn.link_unique_file("user", "email", "a1", &json!("a@x.com")).unwrap();
        conn.link_unique_file("user", "email", "zz", &json!("b@x.com")).unwrap();

        let entries = conn.unique_entries("user", "email").unwrap();
        assert_eq!(entries.len(), 2);
        let live: Vec<(Option<String>, bool)> =
            entries.iter().map(|e| (e.target.clone(), e.live)).collect();
        assert!(live.contains(&(Some("a1".to_string()), true)));
        assert!(live.contains(&(Some("zz".to_string()), false)));
    }

    #[test]
    fn test_drop_table() {
        let (_tmp, conn, _schema) = setup();
        conn.drop_table("user").unwrap();
        assert!(!conn.table_path("user").exists());
        conn.drop_table("user").unwrap();
    }

    #[tokio::test]
    async fn test_async_primitives() {
        let (_tmp, conn, schema) = setup();
        conn.create_table_paths_async("user", &schema).await.unwrap();
        let data = record(json!({ "_id": "a1", "email": "tom@hello.com" }));
        let email = json!("tom@hello.com");

        conn.save_async("user", "a1", &data).await.unwrap();
        conn.link_unique_file_async("user", "email", "a1", &email).await.unwrap();
        assert!(conn
            .link_unique_file_async("user", "email", "b2", &email)
            .await
            .is_err());

        assert_eq!(conn.find_async("user", "a1").await.unwrap(), Some(data.clone()));
        assert_eq!(conn.find_by_async("user", "email", &email).await.unwrap(), Some(data));
        assert_eq!(
            conn.resolve_unique_async("user", "email", &email).await.unwrap(),
            Some("a1".to_string())
        );
        assert_eq!(conn.find_all_async("user").await.unwrap().len(), 1);

        conn.unlink_unique_file_async("user", "email", &email).await.unwrap();
        conn.remove_async("user", "a1").await.unwrap();
        assert_eq!(conn.find_async("user", "a1").await.unwrap(), None);
        conn.drop_table_async("user").await.unwrap();
    }
}
