//! Backing stores for the shared document.
//!
//! Persistence is a whole-buffer overwrite: one flat file per document, no
//! log, no versioning. The in-memory document stays authoritative; a failed
//! write only means the file lags until the next successful one.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Extension every document file carries.
pub const DOCUMENT_EXTENSION: &str = ".txt";

/// Storage errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to create {path}: {source}")]
    Create { path: PathBuf, source: io::Error },

    #[error("failed to read {path}: {source}")]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to write {path}: {source}")]
    Write { path: PathBuf, source: io::Error },

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Where a document's persistent copy lives.
pub trait DocumentBacking: Send {
    /// Read the persisted content, creating an empty copy if none exists.
    fn load(&self) -> Result<Vec<u8>, StoreError>;

    /// Overwrite the persisted copy with `content`.
    fn store(&self, content: &[u8]) -> Result<(), StoreError>;

    /// Human-readable location, for logs.
    fn location(&self) -> String;
}

/// Append the document extension unless the name already ends with it.
pub fn normalize_document_name(name: &str) -> String {
    if name.ends_with(DOCUMENT_EXTENSION) {
        name.to_string()
    } else {
        format!("{name}{DOCUMENT_EXTENSION}")
    }
}

/// Flat-file backing: `<dir>/<name>.txt`, rewritten wholesale.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Open the file for document `name` under `dir`.
    ///
    /// The name is normalized to end with `.txt`. Nothing touches the disk
    /// until [`DocumentBacking::load`] runs.
    pub fn new(dir: impl AsRef<Path>, name: &str) -> Self {
        Self {
            path: dir.as_ref().join(normalize_document_name(name)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl DocumentBacking for FileStore {
    fn load(&self) -> Result<Vec<u8>, StoreError> {
        match fs::read(&self.path) {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                fs::write(&self.path, b"").map_err(|source| StoreError::Create {
                    path: self.path.clone(),
                    source,
                })?;
                log::info!("Created empty document file {}", self.path.display());
                Ok(Vec::new())
            }
            Err(source) => Err(StoreError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }

    fn store(&self, content: &[u8]) -> Result<(), StoreError> {
        fs::write(&self.path, content).map_err(|source| StoreError::Write {
            path: self.path.clone(),
            source,
        })
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// In-memory backing, for servers run without a document directory.
///
/// Clones share the same buffer, so a test can keep one to inspect what the
/// document persisted.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    content: Arc<Mutex<Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_content(content: impl Into<Vec<u8>>) -> Self {
        Self {
            content: Arc::new(Mutex::new(content.into())),
        }
    }

    /// Current persisted bytes.
    pub fn contents(&self) -> Vec<u8> {
        self.content.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

impl DocumentBacking for MemoryStore {
    fn load(&self) -> Result<Vec<u8>, StoreError> {
        self.content
            .lock()
            .map(|c| c.clone())
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    fn store(&self, content: &[u8]) -> Result<(), StoreError> {
        let mut guard = self
            .content
            .lock()
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        guard.clear();
        guard.extend_from_slice(content);
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}
