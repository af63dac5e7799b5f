//! PostgreSQL COPY text format.
//!
//! One row per line, columns separated by tabs, `\N` for null. Backslash,
//! tab, newline and carriage return inside values are escaped.

use bytes::{BufMut, BytesMut};

use crate::core::value::{Row, NULL_MARKER};

/// Escape a value for COPY text format.
pub fn escape_copy_text(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => result.push_str("\\\\"),
            '\t' => result.push_str("\\t"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            _ => result.push(c),
        }
    }
    result
}

/// Decode one COPY text field. `\N` is null.
pub fn unescape_copy_text(field: &str) -> Option<String> {
    if field == NULL_MARKER {
        return None;
    }
    if !field.contains('\\') {
        return Some(field.to_string());
    }

    let mut out = String::with_capacity(field.len());
    let mut chars = field.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('b') => out.push('\u{8}'),
            Some('f') => out.push('\u{c}'),
            Some('v') => out.push('\u{b}'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    Some(out)
}

/// Append one row, newline terminated.
pub fn encode_row(row: &Row, buf: &mut BytesMut) {
    for (i, value) in row.iter().enumerate() {
        if i > 0 {
            buf.put_u8(b'\t');
        }
        match value {
            Some(v) => buf.put_slice(escape_copy_text(v).as_bytes()),
            None => buf.put_slice(NULL_MARKER.as_bytes()),
        }
    }
    buf.put_u8(b'\n');
}

/// Splits COPY output chunks into rows.
///
/// Chunks from the server do not align with row boundaries, so partial lines
/// are kept until the rest arrives.
#[derive(Debug)]
pub struct LineParser {
    buf: BytesMut,
    columns: usize,
}

impl LineParser {
    pub fn new(columns: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            columns,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Next complete row, if one is buffered.
    pub fn next_row(&mut self) -> Result<Option<Row>, String> {
        let Some(end) = self.buf.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let line = self.buf.split_to(end + 1);
        let text = std::str::from_utf8(&line[..end])
            .map_err(|e| format!("COPY output is not valid UTF-8: {e}"))?;

        let row: Row = text.split('\t').map(unescape_copy_text).collect();
        if row.len() != self.columns {
            return Err(format!(
                "COPY row has {} columns, expected {}",
                row.len(),
                self.columns
            ));
        }
        Ok(Some(row))
    }

    /// Whether bytes of an unterminated line remain.
    pub fn has_remainder(&self) -> bool {
        !self.buf.is_empty()
    }
}
