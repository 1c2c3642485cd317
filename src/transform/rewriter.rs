//! Per-cell rewrite rule.

use std::borrow::Cow;

/// Default field separator.
pub const FIELD_SEPARATOR: char = ',';

/// Default marker prepended to non-empty data cells.
pub const DEFAULT_MARKER: &str = "x-";

/// One logical row, split into fields.
///
/// Fields borrow from the reassembled line until a rewrite replaces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<'a> {
    pub fields: Vec<Cow<'a, str>>,
    pub is_header: bool,
}

impl<'a> Record<'a> {
    /// Split a line on `separator`. No quoting or escaping is recognised.
    pub fn parse(line: &'a str, separator: char, is_header: bool) -> Self {
        Self {
            fields: line.split(separator).map(Cow::Borrowed).collect(),
            is_header,
        }
    }

    /// Append the fields joined by `separator`, followed by `terminator`.
    pub fn write_to(&self, out: &mut Vec<u8>, separator: char, terminator: u8) {
        let mut sep = [0u8; 4];
        let sep = separator.encode_utf8(&mut sep).as_bytes();
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                out.extend_from_slice(sep);
            }
            out.extend_from_slice(field.as_bytes());
        }
        out.push(terminator);
    }
}

/// Prefixes every non-blank data cell with a fixed marker.
///
/// Header records and blank cells pass through untouched. The rewriter keeps
/// no state between records.
#[derive(Debug, Clone)]
pub struct CellRewriter {
    marker: String,
}

impl Default for CellRewriter {
    fn default() -> Self {
        Self::new(DEFAULT_MARKER)
    }
}

impl CellRewriter {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    /// Rewrite a single cell value.
    pub fn rewrite_cell<'a>(&self, value: Cow<'a, str>) -> Cow<'a, str> {
        if value.trim().is_empty() {
            value
        } else {
            let mut marked = String::with_capacity(self.marker.len() + value.len());
            marked.push_str(&self.marker);
            marked.push_str(&value);
            Cow::Owned(marked)
        }
    }

    /// Rewrite every field of a non-header record.
    pub fn rewrite<'a>(&self, record: Record<'a>) -> Record<'a> {
        if record.is_header {
            return record;
        }
        Record {
            fields: record
                .fields
                .into_iter()
                .map(|field| self.rewrite_cell(field))
                .collect(),
            is_header: false,
        }
    }
}
