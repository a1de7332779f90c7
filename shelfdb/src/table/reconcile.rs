// Maintenance scan that checks unique-index entries against canonical records

use super::Table;
use crate::error::Result;
use crate::schema::{Record, PRIMARY_KEY};
use crate::storage::{self, UniqueEntry};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

/// A disagreement between a unique-field directory and the records.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexIssue {
    /// The entry points at a record that does not exist.
    Dangling {
        field: String,
        entry: PathBuf,
        target: Option<String>,
    },
    /// The entry points at a live record whose value no longer matches it.
    Stale {
        field: String,
        entry: PathBuf,
        id: String,
    },
    /// A record value with no entry pointing back at the record.
    Missing {
        field: String,
        id: String,
        value: Value,
    },
    /// Two live records hold the same value; the entry belongs to `holder`.
    Conflict {
        field: String,
        id: String,
        holder: String,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileReport {
    pub issues: Vec<IndexIssue>,
    /// Entries removed plus entries created when repairing.
    pub repaired: usize,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.issues.is_empty()
    }
}

impl Table {
    /// Compare every unique-field directory with the stored records.
    ///
    /// With `repair`, dangling and stale entries are removed and missing ones
    /// are linked. Conflicts are only reported since there is no way to tell
    /// which record should keep the value.
    pub fn reconcile(&self, repair: bool) -> Result<ReconcileReport> {
        let records: HashMap<String, Record> = self
            .conn
            .find_all(&self.name)?
            .into_iter()
            .filter_map(|r| {
                let id = r.get(PRIMARY_KEY)?.as_str()?.to_string();
                Some((id, r))
            })
            .collect();
        let mut ids: Vec<&String> = records.keys().collect();
        ids.sort();

        let mut report = ReconcileReport::default();
        let fields: Vec<String> = self
            .schema
            .unique_fields()
            .map(|(f, _)| f.to_string())
            .collect();

        for field in &fields {
            let entries = self.conn.unique_entries(&self.name, field)?;
            let mut bad: Vec<&UniqueEntry> = Vec::new();

            for entry in &entries {
                let issue = match (&entry.target, entry.live) {
                    (Some(id), true) => {
                        let expected = records
                            .get(id)
                            .and_then(|r| r.get(field))
                            .and_then(|v| self.conn.unique_file(&self.name, field, v));
                        if expected.as_ref() == Some(&entry.path) {
                            continue;
                        }
                        IndexIssue::Stale {
                            field: field.clone(),
                            entry: entry.path.clone(),
                            id: id.clone(),
                        }
                    }
                    (target, _) => IndexIssue::Dangling {
                        field: field.clone(),
                        entry: entry.path.clone(),
                        target: target.clone(),
                    },
                };
                report.issues.push(issue);
                bad.push(entry);
            }

            let bad_paths: HashSet<&PathBuf> = bad.iter().map(|e| &e.path).collect();
            let by_path: HashMap<&PathBuf, &UniqueEntry> =
                entries.iter().map(|e| (&e.path, e)).collect();
            let mut missing = Vec::new();

            for id in &ids {
                let Some(value) = records[*id].get(field) else { continue };
                let Some(path) = self.conn.unique_file(&self.name, field, value) else {
                    continue;
                };
                match by_path.get(&path) {
                    Some(entry) if entry.target.as_deref() == Some(id.as_str()) => {}
                    Some(entry) if !bad_paths.contains(&path) => {
                        report.issues.push(IndexIssue::Conflict {
                            field: field.clone(),
                            id: (*id).clone(),
                            holder: entry.target.clone().unwrap_or_default(),
                        });
                    }
                    _ => {
                        report.issues.push(IndexIssue::Missing {
                            field: field.clone(),
                            id: (*id).clone(),
                            value: value.clone(),
                        });
                        missing.push(((*id).clone(), value.clone()));
                    }
                }
            }

            if repair {
                for entry in bad {
                    log::warn!("removing bad index entry {}", entry.path.display());
                    self.conn.remove_entry(entry)?;
                    report.repaired += 1;
                }
                for (id, value) in missing {
                    if storage::index_key(&value).is_none() {
                        continue;
                    }
                    log::warn!("relinking {}/{} for {}", self.name, field, id);
                    self.conn.link_unique_file(&self.name, field, &id, &value)?;
                    report.repaired += 1;
                }
            }
        }

        Ok(report)
    }
}
