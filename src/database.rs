//! Databases a query can run against.

use std::path::{Path, PathBuf};

use thiserror::Error;

const DATASET_PREFIX: &str = "db-";
const SCHEMA_EXTENSION: &str = "dbscheme";
const METADATA_FILES: &[&str] = &["codeql-database.yml", ".dbinfo"];

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database not found: {0}")]
    NotFound(PathBuf),
    #[error("{0} does not contain a dataset directory")]
    MissingDataset(PathBuf),
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// What the evaluation pipeline needs to know about a database.
pub trait DatabaseMetadata: Send + Sync {
    fn name(&self) -> &str;
    /// Root directory, used as the database's identity.
    fn database_path(&self) -> &Path;
    /// Dataset directory passed to the server.
    fn dataset_path(&self) -> &Path;
    /// Schema the dataset was built with, if one was found.
    fn schema_path(&self) -> Option<&Path>;
    /// Whether the database carries a metadata file, which enables
    /// source-archive features downstream.
    fn has_metadata_file(&self) -> bool;
}

/// A database unpacked on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDatabase {
    name: String,
    path: PathBuf,
    dataset: PathBuf,
    schema: Option<PathBuf>,
    has_metadata_file: bool,
}

impl LocalDatabase {
    /// Inspects `path`: the dataset is the first `db-*` child directory and
    /// the schema the first `*.dbscheme` file inside it.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DatabaseError> {
        let path = path.as_ref().to_path_buf();
        let is_dir = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false);
        if !is_dir {
            return Err(DatabaseError::NotFound(path));
        }

        let dataset = first_child(&path, |p, is_dir| {
            is_dir
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(DATASET_PREFIX))
        })
        .await?
        .ok_or_else(|| DatabaseError::MissingDataset(path.clone()))?;

        let schema = first_child(&dataset, |p, is_dir| {
            !is_dir && p.extension().and_then(|e| e.to_str()) == Some(SCHEMA_EXTENSION)
        })
        .await?;

        let mut has_metadata_file = false;
        for file in METADATA_FILES {
            if tokio::fs::try_exists(path.join(file)).await.unwrap_or(false) {
                has_metadata_file = true;
                break;
            }
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        Ok(Self {
            name,
            path,
            dataset,
            schema,
            has_metadata_file,
        })
    }
}

/// First entry of `dir` (in name order) accepted by `accept(path, is_dir)`.
async fn first_child<F>(dir: &Path, accept: F) -> Result<Option<PathBuf>, DatabaseError>
where
    F: Fn(&Path, bool) -> bool,
{
    let io = |source| DatabaseError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = tokio::fs::read_dir(dir).await.map_err(io)?;
    let mut matches = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(io)? {
        let is_dir = entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
        let path = entry.path();
        if accept(&path, is_dir) {
            matches.push(path);
        }
    }
    matches.sort();
    Ok(matches.into_iter().next())
}

impl DatabaseMetadata for LocalDatabase {
    fn name(&self) -> &str {
        &self.name
    }

    fn database_path(&self) -> &Path {
        &self.path
    }

    fn dataset_path(&self) -> &Path {
        &self.dataset
    }

    fn schema_path(&self) -> Option<&Path> {
        self.schema.as_deref()
    }

    fn has_metadata_file(&self) -> bool {
        self.has_metadata_file
    }
}
