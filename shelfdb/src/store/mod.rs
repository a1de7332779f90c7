use crate::config::StoreConfig;
use crate::error::Result;
use crate::schema::{parse_schema, Schema};
use crate::sequence::SequenceProvider;
use crate::storage::Connection;
use crate::table::Table;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// The main entry point for shelfdb.
/// Owns a data directory and its settings, and opens table handles on it.
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    config: StoreConfig,
    conn: Connection,
}

impl Store {
    /// Open a store at the given data directory, creating it if needed.
    /// Settings come from `shelf.yaml` inside the directory when present.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let config = StoreConfig::load(&root)?;
        Self::open_with(root, config)
    }

    /// Open a store with explicit settings, ignoring any `shelf.yaml`.
    pub fn open_with(path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(&root)?;
        let conn = Connection::new(&root, config.extension.clone());
        log::debug!("opened store at {}", root.display());
        Ok(Store { root, config, conn })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Open (and initialize if needed) a table with the given schema.
    pub fn table(&self, name: &str, schema: Schema) -> Result<Table> {
        Table::open(self.conn.clone(), name, schema, &self.config)
    }

    pub async fn table_async(&self, name: &str, schema: Schema) -> Result<Table> {
        Table::open_async(self.conn.clone(), name, schema, &self.config).await
    }

    pub fn table_with_sequence(
        &self,
        name: &str,
        schema: Schema,
        sequence: Arc<dyn SequenceProvider>,
    ) -> Result<Table> {
        Table::open_with_sequence(self.conn.clone(), name, schema, &self.config, sequence)
    }

    /// Open a table whose schema is declared in a YAML file.
    pub fn table_from_yaml(&self, name: &str, path: impl AsRef<Path>) -> Result<Table> {
        let schema = parse_schema(path.as_ref())?.build()?;
        self.table(name, schema)
    }

    /// Delete a table with all its records and index entries.
    pub fn drop_table(&self, name: &str) -> Result<()> {
        self.conn.drop_table(name)
    }

    pub async fn drop_table_async(&self, name: &str) -> Result<()> {
        self.conn.drop_table_async(name).await
    }

    /// Delete the whole data directory.
    pub fn destroy(self) -> Result<()> {
        log::debug!("destroying store at {}", self.root.display());
        match std::fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
