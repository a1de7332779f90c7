use crate::schema::{as_i64, Record};
use parking_lot::Mutex;
use std::collections::HashMap;

/// Source of auto-increment values, one independent sequence per field.
pub trait SequenceProvider: Send + Sync {
    /// Next value for `field`. Values are strictly increasing per field.
    fn next_value(&self, field: &str) -> i64;
}

/// In-process sequence, seeded from the records already on disk.
#[derive(Debug, Default)]
pub struct MemorySequence {
    counters: Mutex<HashMap<String, i64>>,
}

impl MemorySequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed each field in `fields` with the largest value found in `records`.
    pub fn seeded<'a, I>(records: &[Record], fields: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let sequence = Self::new();
        for field in fields {
            let max = records
                .iter()
                .filter_map(|r| r.get(field).and_then(as_i64))
                .max()
                .unwrap_or(0);
            sequence.observe(field, max);
        }
        sequence
    }

    /// Make sure the next value handed out for `field` is above `value`.
    pub fn observe(&self, field: &str, value: i64) {
        let mut counters = self.counters.lock();
        let current = counters.entry(field.to_string()).or_insert(0);
        if value > *current {
            *current = value;
        }
    }

    pub fn current(&self, field: &str) -> i64 {
        self.counters.lock().get(field).copied().unwrap_or(0)
    }
}

impl SequenceProvider for MemorySequence {
    fn next_value(&self, field: &str) -> i64 {
        let mut counters = self.counters.lock();
        let current = counters.entry(field.to_string()).or_insert(0);
        *current += 1;
        *current
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fields_are_independent() {
        let seq = MemorySequence::new();
        assert_eq!(seq.next_value("no"), 1);
        assert_eq!(seq.next_value("no"), 2);
        assert_eq!(seq.next_value("ticket"), 1);
    }

    #[test]
    fn test_seeded_from_records() {
        let records: Vec<Record> = vec![
            json!({ "no": 3 }).as_object().unwrap().clone(),
            json!({ "no": "7" }).as_object().unwrap().clone(),
            json!({ "other": 1 }).as_object().unwrap().clone(),
        ];
        let seq = MemorySequence::seeded(&records, ["no", "ticket"]);
        assert_eq!(seq.current("no"), 7);
        assert_eq!(seq.next_value("no"), 8);
        assert_eq!(seq.next_value("ticket"), 1);

        seq.observe("no", 5);
        assert_eq!(seq.next_value("no"), 9);
    }
}
