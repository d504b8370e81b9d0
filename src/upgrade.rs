//! Database schema upgrades.
//!
//! A query is compiled against the schema its library declares. When the
//! database was built with an older schema, a chain of upgrade scripts must be
//! compiled and applied at evaluation time. Schemas are compared by content
//! hash, never by path.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, warn};

use crate::server::{
    CancellationContext, CompileUpgradeSequenceParams, ProgressSink, QueryServer, ServerError,
};

/// Name of the descriptor file inside each upgrade directory.
pub const UPGRADE_PROPERTIES: &str = "upgrade.properties";

#[derive(Debug, Error)]
pub enum UpgradeError {
    #[error(
        "Cannot upgrade from {database_schema} to {query_schema}: no upgrade path reaches the query's schema"
    )]
    NoUpgradePath {
        query_schema: PathBuf,
        database_schema: PathBuf,
    },
    #[error("Compilation of upgrades failed: {0}")]
    Compilation(String),
    #[error("invalid upgrade descriptor {path}: {message}")]
    InvalidDescriptor { path: PathBuf, message: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Server(#[from] ServerError),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> UpgradeError + '_ {
    move |source| UpgradeError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Content hash of a schema file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SchemaHash(String);

impl SchemaHash {
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(blake3::hash(bytes).to_hex().to_string())
    }

    pub async fn of_file(path: &Path) -> Result<Self, UpgradeError> {
        let bytes = tokio::fs::read(path).await.map_err(io_error(path))?;
        Ok(Self::of_bytes(&bytes))
    }

    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into().trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Scripts that move a database forward, and the schema they end on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedUpgrades {
    pub scripts: Vec<PathBuf>,
    pub final_schema: PathBuf,
}

/// Source of upgrade paths for a database schema.
#[async_trait]
pub trait UpgradeCatalog: Send + Sync {
    /// Longest chain of upgrades applicable to `current_schema`.
    async fn resolve_upgrades(&self, current_schema: &Path) -> Result<ResolvedUpgrades, UpgradeError>;
}

/// Catalog that never offers upgrades.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUpgrades;

#[async_trait]
impl UpgradeCatalog for NoUpgrades {
    async fn resolve_upgrades(&self, current_schema: &Path) -> Result<ResolvedUpgrades, UpgradeError> {
        Ok(ResolvedUpgrades {
            scripts: Vec::new(),
            final_schema: current_schema.to_path_buf(),
        })
    }
}

/// Upgrades laid out as directories, each holding an `upgrade.properties`
/// with `from=<schema hash>` and `to=<schema file relative to the directory>`.
#[derive(Debug, Clone)]
pub struct DirectoryUpgradeCatalog {
    roots: Vec<PathBuf>,
}

struct UpgradeStep {
    dir: PathBuf,
    to_schema: PathBuf,
}

impl DirectoryUpgradeCatalog {
    pub fn new(roots: Vec<PathBuf>) -> Self {
        Self { roots }
    }

    async fn load_steps(&self) -> Result<HashMap<SchemaHash, UpgradeStep>, UpgradeError> {
        let mut steps = HashMap::new();
        for root in &self.roots {
            let mut entries = match tokio::fs::read_dir(root).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    debug!(root = %root.display(), "upgrade root missing");
                    continue;
                }
                Err(err) => return Err(io_error(root)(err)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(io_error(root))? {
                let dir = entry.path();
                let properties = dir.join(UPGRADE_PROPERTIES);
                let text = match tokio::fs::read_to_string(&properties).await {
                    Ok(text) => text,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => return Err(io_error(&properties)(err)),
                };
                let (from, to) = parse_properties(&properties, &text)?;
                let step = UpgradeStep {
                    to_schema: dir.join(to),
                    dir,
                };
                if steps.insert(from.clone(), step).is_some() {
                    warn!(from = %from, "duplicate upgrade for schema; keeping the last one found");
                }
            }
        }
        Ok(steps)
    }
}

fn parse_properties(path: &Path, text: &str) -> Result<(SchemaHash, String), UpgradeError> {
    let mut from = None;
    let mut to = None;
    for line in text.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) if key.trim() == "from" => from = Some(SchemaHash::from_hex(value)),
            Some((key, value)) if key.trim() == "to" => to = Some(value.trim().to_string()),
            _ => {}
        }
    }
    match (from, to) {
        (Some(from), Some(to)) if !to.is_empty() => Ok((from, to)),
        _ => Err(UpgradeError::InvalidDescriptor {
            path: path.to_path_buf(),
            message: "expected both 'from' and 'to' keys".into(),
        }),
    }
}

#[async_trait]
impl UpgradeCatalog for DirectoryUpgradeCatalog {
    async fn resolve_upgrades(&self, current_schema: &Path) -> Result<ResolvedUpgrades, UpgradeError> {
        let steps = self.load_steps().await?;
        let mut scripts = Vec::new();
        let mut schema = current_schema.to_path_buf();
        let mut hash = SchemaHash::of_file(&schema).await?;
        let mut seen = HashSet::new();
        while let Some(step) = steps.get(&hash) {
            if !seen.insert(hash.clone()) {
                warn!(schema = %hash, "upgrade cycle detected");
                break;
            }
            scripts.push(step.dir.clone());
            schema = step.to_schema.clone();
            hash = SchemaHash::of_file(&schema).await?;
        }
        Ok(ResolvedUpgrades {
            scripts,
            final_schema: schema,
        })
    }
}

/// What has to happen before a query can run against a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeDecision {
    NotNeeded,
    Required,
    NoUpgradePath,
}

/// `current` is the database's schema, `required` the query's, `reachable`
/// the schema at the end of the available upgrade chain.
pub fn decide(current: &SchemaHash, required: &SchemaHash, reachable: &SchemaHash) -> UpgradeDecision {
    if current == required {
        UpgradeDecision::NotNeeded
    } else if reachable == required {
        UpgradeDecision::Required
    } else {
        UpgradeDecision::NoUpgradePath
    }
}

/// The upgrade plan for one evaluation, plus the scratch directory its
/// compiled form lives in. Dropping or [`release`](Self::release)-ing the
/// descriptor removes the scratch directory.
#[derive(Debug)]
pub struct UpgradeDescriptor {
    pub database_schema: PathBuf,
    pub query_schema: PathBuf,
    pub scripts: Vec<PathBuf>,
    compiled: Option<PathBuf>,
    scratch: Option<TempDir>,
}

impl UpgradeDescriptor {
    /// Builds the plan from precomputed hashes.
    pub fn resolve(
        database_schema: &Path,
        query_schema: &Path,
        current: &SchemaHash,
        required: &SchemaHash,
        reachable: &SchemaHash,
        available: ResolvedUpgrades,
    ) -> Result<Self, UpgradeError> {
        let scripts = match decide(current, required, reachable) {
            UpgradeDecision::NotNeeded => Vec::new(),
            UpgradeDecision::Required => available.scripts,
            UpgradeDecision::NoUpgradePath => {
                return Err(UpgradeError::NoUpgradePath {
                    query_schema: query_schema.to_path_buf(),
                    database_schema: database_schema.to_path_buf(),
                })
            }
        };
        Ok(Self {
            database_schema: database_schema.to_path_buf(),
            query_schema: query_schema.to_path_buf(),
            scripts,
            compiled: None,
            scratch: None,
        })
    }

    pub fn needs_upgrade(&self) -> bool {
        !self.scripts.is_empty()
    }

    /// Schema the query should be compiled against.
    pub fn target_schema(&self) -> &Path {
        if self.needs_upgrade() {
            &self.query_schema
        } else {
            &self.database_schema
        }
    }

    pub fn compiled_upgrade(&self) -> Option<&Path> {
        self.compiled.as_deref()
    }

    pub fn scratch_dir(&self) -> Option<&Path> {
        self.scratch.as_ref().map(TempDir::path)
    }

    /// Removes the scratch directory, logging rather than failing.
    pub fn release(mut self) {
        if let Some(scratch) = self.scratch.take() {
            let path = scratch.path().to_path_buf();
            if let Err(err) = scratch.close() {
                warn!(path = %path.display(), error = %err, "failed to remove upgrade scratch directory");
            }
        }
    }
}

/// Resolves and compiles upgrades using an [`UpgradeCatalog`].
#[derive(Clone)]
pub struct UpgradeResolver {
    catalog: Arc<dyn UpgradeCatalog>,
    scratch_root: PathBuf,
}

impl UpgradeResolver {
    pub fn new(catalog: Arc<dyn UpgradeCatalog>, scratch_root: impl Into<PathBuf>) -> Self {
        Self {
            catalog,
            scratch_root: scratch_root.into(),
        }
    }

    /// Works out whether `database_schema` must be upgraded to run a query
    /// written against `query_schema`.
    pub async fn resolve(
        &self,
        database_schema: &Path,
        query_schema: &Path,
    ) -> Result<UpgradeDescriptor, UpgradeError> {
        let current = SchemaHash::of_file(database_schema).await?;
        let required = SchemaHash::of_file(query_schema).await?;
        if current == required {
            return UpgradeDescriptor::resolve(
                database_schema,
                query_schema,
                &current,
                &required,
                &current,
                ResolvedUpgrades::default(),
            );
        }
        let available = self.catalog.resolve_upgrades(database_schema).await?;
        let reachable = SchemaHash::of_file(&available.final_schema).await?;
        debug!(
            scripts = available.scripts.len(),
            reachable = %reachable,
            required = %required,
            "resolved upgrade chain"
        );
        UpgradeDescriptor::resolve(
            database_schema,
            query_schema,
            &current,
            &required,
            &reachable,
            available,
        )
    }

    /// Compiles the descriptor's scripts into a scratch directory. A no-op
    /// when no upgrade is needed.
    pub async fn compile(
        &self,
        server: &dyn QueryServer,
        descriptor: &mut UpgradeDescriptor,
        cancel: &CancellationContext,
        progress: Option<Arc<dyn ProgressSink>>,
    ) -> Result<(), UpgradeError> {
        if !descriptor.needs_upgrade() {
            return Ok(());
        }
        tokio::fs::create_dir_all(&self.scratch_root)
            .await
            .map_err(io_error(&self.scratch_root))?;
        let scratch = tempfile::Builder::new()
            .prefix("upgrade_")
            .tempdir_in(&self.scratch_root)
            .map_err(io_error(&self.scratch_root))?;
        let params = CompileUpgradeSequenceParams {
            upgrade_temp_dir: scratch.path().display().to_string(),
            upgrade_paths: descriptor
                .scripts
                .iter()
                .map(|p| p.display().to_string())
                .collect(),
        };
        // Hand the scratch dir to the descriptor before awaiting so it is
        // cleaned up with the descriptor whatever the outcome.
        descriptor.scratch = Some(scratch);

        let result = server.compile_upgrade_sequence(params, cancel, progress).await?;
        match result.compiled_upgrade {
            Some(compiled) => {
                descriptor.compiled = Some(PathBuf::from(compiled));
                Ok(())
            }
            None => Err(UpgradeError::Compilation(
                result
                    .error
                    .unwrap_or_else(|| "[no error message available]".into()),
            )),
        }
    }
}
