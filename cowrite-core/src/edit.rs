use std::fmt;

/// A single positional edit against the document.
///
/// Offsets are signed so that out-of-range values coming off the wire are
/// rejected by the document's range checks rather than by a conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Edit {
    /// Splice `text` in at byte offset `start`.
    Insert { start: i64, text: Vec<u8> },
    /// Remove the half-open byte range `[start, end)`.
    Delete { start: i64, end: i64 },
}

impl Edit {
    pub fn insert(start: i64, text: impl Into<Vec<u8>>) -> Self {
        Edit::Insert { start, text: text.into() }
    }

    pub fn delete(start: i64, end: i64) -> Self {
        Edit::Delete { start, end }
    }
}

impl fmt::Display for Edit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Edit::Insert { start, text } => write!(f, "insert {} bytes at {start}", text.len()),
            Edit::Delete { start, end } => write!(f, "delete [{start}, {end})"),
        }
    }
}
