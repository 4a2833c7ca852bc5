//! # cowrite-core - the shared plain-text document
//!
//! Owns the authoritative byte buffer that every connected editor mutates,
//! and the flat-file backing that mirrors it on disk.
//!
//! ```text
//!   Edit::Insert / Edit::Delete
//!              │
//!              ▼
//!   ┌──────────────────────┐  whole-buffer rewrite  ┌──────────────┐
//!   │ Document (in memory) │ ─────────────────────► │ <name>.txt   │
//!   │ authoritative        │   (failures logged)    │ FileStore    │
//!   └──────────────────────┘                        └──────────────┘
//! ```
//!
//! The document has no concurrency of its own. Callers serialize access;
//! in `cowrite-collab` that is the single command processor task.

pub mod document;
pub mod edit;
pub mod storage;

pub use document::{Document, DocumentError};
pub use edit::Edit;
pub use storage::{normalize_document_name, DocumentBacking, FileStore, MemoryStore, StoreError};
