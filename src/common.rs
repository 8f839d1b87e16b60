use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Byte range into the document a parsed item was extracted from.
#[derive(Debug, PartialEq, Default, Clone, Serialize, Deserialize)]
pub struct Span {
    pub range: Range<usize>,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { range: start..end }
    }
}

/// Length of the active part of a line, up to the first unescaped `%`.
pub(crate) fn active_len(line: &str) -> usize {
    let mut chars = line.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '%' => return i,
            _ => {}
        }
    }
    line.len()
}
