use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use chrono::Utc;
use lazy_static::lazy_static;
use serde_json::{json, Map, Value};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_OUTPUT_DIR: &str = "reconflow-out";
pub const RESULTS_FILE: &str = "results.json";

lazy_static! {
    /// One writer lock per results file, shared by every store in the process.
    static ref FILE_LOCKS: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> =
        std::sync::Mutex::new(HashMap::new());
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

fn lock_for(path: &Path) -> Arc<Mutex<()>> {
    let mut locks = FILE_LOCKS.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(path.to_path_buf()).or_default())
}

/// Absolute form of `path` without touching the filesystem, so a store built
/// before its directory exists keys the same lock as one built after.
fn absolute(path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        return path;
    }
    match std::env::current_dir() {
        Ok(cwd) => cwd.join(path),
        Err(_) => path,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse existing results in {}: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("existing results in {} are not a JSON object", .path.display())]
    NotAnObject { path: PathBuf },

    #[error("failed to encode results: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Incremental JSON result document keyed by tool name.
///
/// Every operation is a full read-modify-write under a lock keyed by the
/// results file, so concurrent writers with distinct keys never lose each
/// other's entries, even through separate `ResultStore` values.
#[derive(Debug)]
pub struct ResultStore {
    dir: PathBuf,
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl ResultStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let path = dir.join(RESULTS_FILE);
        let lock = lock_for(&absolute(path.clone()));
        Self { dir, path, lock }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Set the entry for `tool`, overwriting whatever a previous run stored.
    pub async fn persist(&self, tool: &str, payload: &Value) -> StoreResult<()> {
        let _guard = self.lock.lock().await;

        let mut document = self.read_document().await?;
        document.insert(tool.to_string(), payload.clone());
        self.write_document(&document).await?;

        debug!(tool, path = %self.path.display(), entries = document.len(), "persisted result");
        Ok(())
    }

    /// Current document, empty when nothing was persisted yet.
    pub async fn load(&self) -> StoreResult<Map<String, Value>> {
        let _guard = self.lock.lock().await;
        self.read_document().await
    }

    /// Start a fresh document for `target`, discarding previous results.
    pub async fn reset(&self, target: &str) -> StoreResult<()> {
        let _guard = self.lock.lock().await;

        let mut document = Map::new();
        document.insert("target".to_string(), Value::String(target.to_string()));
        document.insert("meta".to_string(), json!({ "started_at": Utc::now() }));
        self.write_document(&document).await
    }

    async fn read_document(&self) -> StoreResult<Map<String, Value>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Map::new()),
            Err(source) => {
                return Err(StoreError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Map::new());
        }

        match serde_json::from_slice(&bytes) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(_) => Err(StoreError::NotAnObject {
                path: self.path.clone(),
            }),
            Err(source) => Err(StoreError::Corrupt {
                path: self.path.clone(),
                source,
            }),
        }
    }

    async fn write_document(&self, document: &Map<String, Value>) -> StoreResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|source| StoreError::Io {
                path: self.dir.clone(),
                source,
            })?;

        let encoded = serde_json::to_vec_pretty(document)?;

        // Write next to the target and rename so readers never see a torn file.
        let tmp = self.dir.join(format!(
            ".{RESULTS_FILE}.{}.{}.tmp",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, &encoded)
            .await
            .map_err(|source| StoreError::Io {
                path: tmp.clone(),
                source,
            })?;
        if let Err(source) = fs::rename(&tmp, &self.path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::Io {
                path: self.path.clone(),
                source,
            });
        }
        Ok(())
    }
}
