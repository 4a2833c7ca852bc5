//! The authoritative document buffer.
//!
//! Every accepted edit is range-checked against the length *at application
//! time*, spliced into the buffer, and then the whole buffer is written to the
//! backing store. Write failures are logged and counted; they never roll back
//! the in-memory content.

use crate::edit::Edit;
use crate::storage::{DocumentBacking, MemoryStore, StoreError};

/// Errors raised by document operations.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("insert at {start} is outside a document of length {len}")]
    InsertOutOfRange { start: i64, len: usize },

    #[error("delete of [{start}, {end}) is outside a document of length {len}")]
    DeleteOutOfRange { start: i64, end: i64, len: usize },

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl DocumentError {
    /// Whether this is a range rejection (as opposed to a storage failure).
    pub fn is_range(&self) -> bool {
        matches!(
            self,
            DocumentError::InsertOutOfRange { .. } | DocumentError::DeleteOutOfRange { .. }
        )
    }
}

/// The shared plain-text document.
pub struct Document {
    name: String,
    content: Vec<u8>,
    backing: Box<dyn DocumentBacking>,
    persist_failures: u64,
}

impl Document {
    /// Load a document from its backing store.
    pub fn load(name: impl Into<String>, backing: Box<dyn DocumentBacking>) -> Result<Self, DocumentError> {
        let name = name.into();
        let content = backing.load()?;
        log::info!(
            "Loaded document {name} ({} bytes) from {}",
            content.len(),
            backing.location()
        );
        Ok(Self {
            name,
            content,
            backing,
            persist_failures: 0,
        })
    }

    /// Empty document kept only in memory.
    pub fn in_memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: Vec::new(),
            backing: Box::new(MemoryStore::new()),
            persist_failures: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// Borrow the current content.
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    /// Point-in-time copy of the content.
    pub fn snapshot(&self) -> Vec<u8> {
        self.content.clone()
    }

    /// Snapshot as text for the wire. Byte offsets may split a multi-byte
    /// character, so invalid sequences are replaced rather than rejected.
    pub fn snapshot_text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }

    /// Number of whole-buffer writes that failed since load.
    pub fn persist_failures(&self) -> u64 {
        self.persist_failures
    }

    /// Splice `text` in at byte offset `start`.
    ///
    /// `start == len` appends. An empty `text` is accepted and skips the write.
    pub fn insert(&mut self, start: i64, text: &[u8]) -> Result<(), DocumentError> {
        let len = self.content.len();
        let at = usize::try_from(start)
            .ok()
            .filter(|at| *at <= len)
            .ok_or(DocumentError::InsertOutOfRange { start, len })?;

        if text.is_empty() {
            return Ok(());
        }

        self.content.splice(at..at, text.iter().copied());
        log::debug!("{}: inserted {} bytes at {at}", self.name, text.len());
        self.persist();
        Ok(())
    }

    /// Remove the half-open byte range `[start, end)`.
    ///
    /// `start == end` is a valid no-op.
    pub fn delete(&mut self, start: i64, end: i64) -> Result<(), DocumentError> {
        let len = self.content.len();
        let range = match (usize::try_from(start), usize::try_from(end)) {
            (Ok(s), Ok(e)) if s <= e && e <= len => s..e,
            _ => return Err(DocumentError::DeleteOutOfRange { start, end, len }),
        };

        if range.is_empty() {
            return Ok(());
        }

        log::debug!("{}: removed [{}, {})", self.name, range.start, range.end);
        self.content.drain(range);
        self.persist();
        Ok(())
    }

    /// Apply an [`Edit`].
    pub fn apply(&mut self, edit: &Edit) -> Result<(), DocumentError> {
        match edit {
            Edit::Insert { start, text } => self.insert(*start, text),
            Edit::Delete { start, end } => self.delete(*start, *end),
        }
    }

    /// 0-based line containing byte offset `offset`, or `None` when the
    /// offset lies outside `[0, len]`.
    pub fn line_of(&self, offset: i64) -> Option<usize> {
        let at = usize::try_from(offset).ok().filter(|at| *at <= self.content.len())?;
        Some(self.content[..at].iter().filter(|b| **b == b'\n').count())
    }

    fn persist(&mut self) {
        if let Err(e) = self.backing.store(&self.content) {
            self.persist_failures += 1;
            log::error!(
                "Failed to write {} to {}: {e}",
                self.name,
                self.backing.location()
            );
        }
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("name", &self.name)
            .field("len", &self.content.len())
            .field("backing", &self.backing.location())
            .field("persist_failures", &self.persist_failures)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FileStore;

    /// Backing whose writes always fail.
    struct BrokenStore;

    impl DocumentBacking for BrokenStore {
        fn load(&self) -> Result<Vec<u8>, StoreError> {
            Ok(b"seed".to_vec())
        }

        fn store(&self, _content: &[u8]) -> Result<(), StoreError> {
            Err(StoreError::Unavailable("disk on fire".into()))
        }

        fn location(&self) -> String {
            "broken".into()
        }
    }

    fn doc_with(content: &str) -> (Document, MemoryStore) {
        let store = MemoryStore::with_content(content);
        let doc = Document::load("test", Box::new(store.clone())).unwrap();
        (doc, store)
    }

    #[test]
    fn test_hello_world_scenario() {
        let mut doc = Document::in_memory("test");
        doc.insert(0, b"Hello, ").unwrap();
        doc.insert(7, b"world!").unwrap();
        assert_eq!(doc.content(), b"Hello, world!");

        doc.delete(5, 7).unwrap();
        assert_eq!(doc.content(), b"Helloworld!");
    }

    #[test]
    fn test_insert_at_end_appends() {
        let (mut doc, _) = doc_with("abc");
        doc.insert(3, b"def").unwrap();
        assert_eq!(doc.content(), b"abcdef");
    }

    #[test]
    fn test_insert_past_end_is_rejected() {
        let (mut doc, store) = doc_with("abc");
        let err = doc.insert(4, b"x").unwrap_err();

        assert!(matches!(err, DocumentError::InsertOutOfRange { start: 4, len: 3 }));
        assert!(err.is_range());
        assert_eq!(doc.content(), b"abc");
        assert_eq!(store.contents(), b"abc");
    }

    #[test]
    fn test_insert_negative_is_rejected() {
        let (mut doc, _) = doc_with("abc");
        assert!(doc.insert(-1, b"x").is_err());
        assert_eq!(doc.content(), b"abc");
    }

    #[test]
    fn test_empty_insert_is_noop() {
        let (mut doc, store) = doc_with("abc");
        store.store(b"stale").unwrap();

        doc.insert(1, b"").unwrap();
        assert_eq!(doc.content(), b"abc");
        // no write for a no-op
        assert_eq!(store.contents(), b"stale");
    }

    #[test]
    fn test_delete_empty_range_is_noop() {
        let (mut doc, _) = doc_with("abc");
        doc.delete(2, 2).unwrap();
        assert_eq!(doc.content(), b"abc");

        doc.delete(3, 3).unwrap();
        assert_eq!(doc.content(), b"abc");
    }

    #[test]
    fn test_delete_reversed_range_is_rejected() {
        let (mut doc, _) = doc_with("abcdef");
        let err = doc.delete(4, 2).unwrap_err();
        assert!(matches!(err, DocumentError::DeleteOutOfRange { start: 4, end: 2, len: 6 }));
        assert_eq!(doc.content(), b"abcdef");
    }

    #[test]
    fn test_delete_bounds() {
        let (mut doc, _) = doc_with("abcdef");
        assert!(doc.delete(-1, 2).is_err());
        assert!(doc.delete(0, 7).is_err());

        doc.delete(0, 6).unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_range_checked_against_current_length() {
        let (mut doc, _) = doc_with("");
        // Valid only once the first insert has landed.
        assert!(doc.insert(3, b"x").is_err());
        doc.insert(0, b"abc").unwrap();
        doc.insert(3, b"x").unwrap();
        assert_eq!(doc.content(), b"abcx");
    }

    #[test]
    fn test_every_mutation_persists() {
        let (mut doc, store) = doc_with("");
        doc.insert(0, b"one two").unwrap();
        assert_eq!(store.contents(), b"one two");

        doc.delete(3, 7).unwrap();
        assert_eq!(store.contents(), b"one");
    }

    #[test]
    fn test_persist_failure_keeps_memory_authoritative() {
        let mut doc = Document::load("broken", Box::new(BrokenStore)).unwrap();
        doc.insert(4, b"!").unwrap();
        doc.delete(0, 1).unwrap();

        assert_eq!(doc.content(), b"eed!");
        assert_eq!(doc.persist_failures(), 2);
    }

    #[test]
    fn test_file_backed_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut doc = Document::load("notes", Box::new(FileStore::new(dir.path(), "notes"))).unwrap();
            doc.insert(0, b"line one\nline two").unwrap();
        }
        let doc = Document::load("notes", Box::new(FileStore::new(dir.path(), "notes.txt"))).unwrap();
        assert_eq!(doc.content(), b"line one\nline two");
    }

    #[test]
    fn test_snapshot_is_detached_copy() {
        let (mut doc, _) = doc_with("abc");
        let snap = doc.snapshot();
        doc.insert(0, b"z").unwrap();
        assert_eq!(snap, b"abc");
        assert_eq!(doc.snapshot_text(), "zabc");
    }

    #[test]
    fn test_line_of() {
        let (doc, _) = doc_with("ab\ncd\n\nef");
        assert_eq!(doc.line_of(0), Some(0));
        assert_eq!(doc.line_of(2), Some(0));
        assert_eq!(doc.line_of(3), Some(1));
        assert_eq!(doc.line_of(6), Some(2));
        assert_eq!(doc.line_of(7), Some(3));
        assert_eq!(doc.line_of(9), Some(3));
        assert_eq!(doc.line_of(10), None);
        assert_eq!(doc.line_of(-1), None);
    }

    #[test]
    fn test_apply_edit() {
        let mut doc = Document::in_memory("test");
        doc.apply(&Edit::insert(0, "hello")).unwrap();
        doc.apply(&Edit::delete(0, 1)).unwrap();
        assert_eq!(doc.content(), b"ello");
        assert!(doc.apply(&Edit::delete(3, 9)).is_err());
    }
}
