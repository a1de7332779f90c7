use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ShelfError {
    #[error("Schema error in field '{field}': {message}")]
    SchemaDefinition { field: String, message: String },

    #[error("Validation error: {0}")]
    Validation(InvalidMessages),

    #[error("Duplicate value: {0}")]
    Duplicate(InvalidMessages),

    #[error("Record not found: {table}/{id}")]
    NotFound { table: String, id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Password hashing error: {0}")]
    Password(String),

    #[error("{0}")]
    Other(String),
}

impl ShelfError {
    pub(crate) fn schema(field: impl Into<String>, message: impl Into<String>) -> Self {
        ShelfError::SchemaDefinition {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Stable numeric code, one per error family.
    pub fn code(&self) -> u32 {
        match self {
            ShelfError::SchemaDefinition { .. } => 1000,
            ShelfError::Validation(_) => 1100,
            ShelfError::Duplicate(_) => 1101,
            ShelfError::NotFound { .. } => 1200,
            ShelfError::Io(_) | ShelfError::Json(_) | ShelfError::Yaml(_) => 1300,
            ShelfError::Password(_) => 1301,
            ShelfError::Other(_) => 1900,
        }
    }

    /// True for errors caused by the caller's data rather than the environment.
    pub fn is_invalid(&self) -> bool {
        matches!(self, ShelfError::Validation(_) | ShelfError::Duplicate(_))
    }

    /// Per-field messages for validation and duplicate errors.
    pub fn invalid_messages(&self) -> Option<&InvalidMessages> {
        match self {
            ShelfError::Validation(m) | ShelfError::Duplicate(m) => Some(m),
            _ => None,
        }
    }
}

/// Field name to human-readable message, shared by validation and duplicate errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidMessages(BTreeMap<String, String>);

impl InvalidMessages {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a message for `field`. The first message for a field wins.
    pub fn add(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.entry(field.into()).or_insert_with(|| message.into());
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn merge(&mut self, other: InvalidMessages) {
        for (field, message) in other.0 {
            self.add(field, message);
        }
    }
}

impl fmt::Display for InvalidMessages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|(field, message)| format!("{field}: {message}"))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

pub type Result<T> = std::result::Result<T, ShelfError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_messages_keep_first() {
        let mut messages = InvalidMessages::new();
        messages.add("email", "Email is required");
        messages.add("email", "Email is not a valid email address");
        messages.add("age", "Age is required");

        assert_eq!(messages.len(), 2);
        assert_eq!(messages.get("email"), Some("Email is required"));
        assert_eq!(messages.to_string(), "age: Age is required; email: Email is required");
    }

    #[test]
    fn test_error_codes_and_invalid_marker() {
        let err = ShelfError::Duplicate(InvalidMessages::new());
        assert_eq!(err.code(), 1101);
        assert!(err.is_invalid());
        assert!(err.invalid_messages().is_some());

        let err = ShelfError::NotFound {
            table: "user".into(),
            id: "abc".into(),
        };
        assert_eq!(err.code(), 1200);
        assert!(!err.is_invalid());
        assert!(err.invalid_messages().is_none());
    }
}
