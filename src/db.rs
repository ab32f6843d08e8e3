use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::{fmt::Debug, io};

use rocksdb::{Options, DB as Rocks};
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::Mutex;
use tracing::info;

pub use event_db::EventDb;

mod event_db;

/// A KV store over rocksdb, keyed with string prefixes and JSON-encoded
/// values.
#[derive(Debug, Clone)]
pub struct DB {
    rocks: Arc<Rocks>,
    // serializes read-modify-write index assignment for new events
    index_lock: Arc<Mutex<()>>,
}

impl From<Rocks> for DB {
    fn from(rocks: Rocks) -> Self {
        Self {
            rocks: Arc::new(rocks),
            index_lock: Arc::new(Mutex::new(())),
        }
    }
}

/// DB Error type
#[derive(thiserror::Error, Debug)]
pub enum DbError {
    /// Rocks DB Error
    #[error("{0}")]
    RockError(#[from] rocksdb::Error),
    #[error("Failed to open {path}, canonicalized as {canonicalized}: {source}")]
    /// Error opening the database
    OpeningError {
        /// Rocksdb error during opening
        #[source]
        source: rocksdb::Error,
        /// Raw database path provided
        path: PathBuf,
        /// Parsed path used
        canonicalized: PathBuf,
    },
    /// Could not parse the provided database path string
    #[error("Invalid database path supplied {1:?}; {0}")]
    InvalidDbPath(#[source] io::Error, String),
    /// Stored value could not be encoded or decoded
    #[error("{0}")]
    Codec(#[from] serde_json::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;

impl DB {
    /// Opens db at `db_path` and creates if missing
    #[tracing::instrument(err)]
    pub fn from_path(db_path: &Path) -> DbResult<DB> {
        let path = {
            let mut path = db_path
                .parent()
                .unwrap_or(Path::new("."))
                .canonicalize()
                .map_err(|e| DbError::InvalidDbPath(e, db_path.to_string_lossy().into()))?;
            if let Some(file_name) = db_path.file_name() {
                path.push(file_name);
            }
            path
        };

        if path.is_dir() {
            info!(path=%path.to_string_lossy(), "Opening existing db")
        } else {
            info!(path=%path.to_string_lossy(), "Creating db")
        }

        let mut opts = Options::default();
        opts.create_if_missing(true);

        Rocks::open(&opts, &path)
            .map_err(|e| DbError::OpeningError {
                source: e,
                path: db_path.into(),
                canonicalized: path,
            })
            .map(Into::into)
    }

    /// Store a raw value in the DB
    pub fn store(&self, key: &[u8], value: &[u8]) -> DbResult<()> {
        Ok(self.rocks.put(key, value)?)
    }

    /// Retrieve a raw value from the DB
    pub fn retrieve(&self, key: &[u8]) -> DbResult<Option<Vec<u8>>> {
        Ok(self.rocks.get(key)?)
    }

    pub(crate) fn index_lock(&self) -> &Mutex<()> {
        &self.index_lock
    }

    /// Store a JSON-encoded value under `<prefix><key>`
    pub fn store_value_by_key<V: Serialize>(
        &self,
        prefix: &str,
        key: impl AsRef<[u8]>,
        value: &V,
    ) -> DbResult<()> {
        let encoded = serde_json::to_vec(value)?;
        self.store(&prefixed_key(prefix, key), &encoded)
    }

    /// Retrieve a JSON-encoded value from `<prefix><key>`
    pub fn retrieve_value_by_key<V: DeserializeOwned>(
        &self,
        prefix: &str,
        key: impl AsRef<[u8]>,
    ) -> DbResult<Option<V>> {
        let raw = self.retrieve(&prefixed_key(prefix, key))?;
        raw.map(|bytes| serde_json::from_slice(&bytes))
            .transpose()
            .map_err(Into::into)
    }
}

fn prefixed_key(prefix: &str, key: impl AsRef<[u8]>) -> Vec<u8> {
    let mut full_key = prefix.as_bytes().to_vec();
    full_key.extend(key.as_ref());
    full_key
}
