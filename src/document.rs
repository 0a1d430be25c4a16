//! Hierarchical document trees.
//!
//! A document is a node holding an ordered list of `key="value"` attributes
//! and an ordered list of named child nodes. The text form is a block
//! format:
//!
//! ```text
//! key="value"
//! [child]
//!     key="value"
//! [/child]
//! ```
//!
//! A literal quote inside a value is written as `""`; values may span
//! lines. The gzipped form is the text form passed through a gzip stream,
//! and is both the on-disk pack representation and the wire payload.

use std::io::{Read, Write};
use std::path::Path;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("document is not valid utf-8")]
    Utf8,

    #[error("parse error at line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("document exceeds size limit of {limit} bytes")]
    TooLarge { limit: usize },
}

impl DocumentError {
    fn parse(line: usize, reason: impl Into<String>) -> Self {
        DocumentError::Parse {
            line,
            reason: reason.into(),
        }
    }
}

/// A document node: ordered attributes plus ordered named children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    attrs: Vec<(String, String)>,
    children: Vec<(String, Document)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- attributes ----

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// The attribute value, or `""` when absent.
    pub fn attr_or_empty(&self, key: &str) -> &str {
        self.attr(key).unwrap_or("")
    }

    pub fn has_attr(&self, key: &str) -> bool {
        self.attrs.iter().any(|(k, _)| k == key)
    }

    /// Boolean attribute; absent or unparseable values fall back to `default`.
    pub fn attr_bool(&self, key: &str, default: bool) -> bool {
        match self.attr(key) {
            Some("true") | Some("yes") | Some("on") | Some("1") => true,
            Some("false") | Some("no") | Some("off") | Some("0") => false,
            _ => default,
        }
    }

    pub fn attr_i64(&self, key: &str, default: i64) -> i64 {
        self.attr(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn attr_u64(&self, key: &str, default: u64) -> u64 {
        self.attr(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    /// Sets an attribute, replacing an existing value for the same key.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.attrs.iter_mut().find(|(k, _)| *k == key) {
            Some((_, v)) => *v = value,
            None => self.attrs.push((key, value)),
        }
        self
    }

    pub fn remove_attr(&mut self, key: &str) {
        self.attrs.retain(|(k, _)| k != key);
    }

    pub fn remove_attrs(&mut self, keys: &[&str]) {
        self.attrs.retain(|(k, _)| !keys.contains(&k.as_str()));
    }

    pub fn attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Copies the named attributes from `other`, skipping absent ones.
    pub fn copy_attrs(&mut self, other: &Document, keys: &[&str]) {
        for key in keys {
            if let Some(value) = other.attr(key) {
                self.set_attr(*key, value);
            }
        }
    }

    // ---- children ----

    pub fn child(&self, name: &str) -> Option<&Document> {
        self.children
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn child_mut(&mut self, name: &str) -> Option<&mut Document> {
        self.children
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn children<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Document> {
        self.children
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn children_mut<'a>(&'a mut self, name: &'a str) -> impl Iterator<Item = &'a mut Document> {
        self.children
            .iter_mut()
            .filter(move |(n, _)| n == name)
            .map(|(_, c)| c)
    }

    pub fn all_children(&self) -> impl Iterator<Item = (&str, &Document)> {
        self.children.iter().map(|(n, c)| (n.as_str(), c))
    }

    pub fn first_child(&self) -> Option<(&str, &Document)> {
        self.children.first().map(|(n, c)| (n.as_str(), c))
    }

    /// Appends an empty child and returns a handle to it.
    pub fn add_child(&mut self, name: impl Into<String>) -> &mut Document {
        self.children.push((name.into(), Document::new()));
        &mut self.children.last_mut().expect("just pushed").1
    }

    pub fn append_child(&mut self, name: impl Into<String>, child: Document) {
        self.children.push((name.into(), child));
    }

    /// Removes every `name` child for which `pred` returns true.
    pub fn remove_children(&mut self, name: &str, mut pred: impl FnMut(&Document) -> bool) {
        self.children.retain(|(n, c)| n != name || !pred(c));
    }

    pub fn clear_children(&mut self, name: &str) {
        self.children.retain(|(n, _)| n != name);
    }

    /// Moves the first `name` child out of the tree.
    pub fn take_child(&mut self, name: &str) -> Option<Document> {
        let idx = self.children.iter().position(|(n, _)| n == name)?;
        Some(self.children.remove(idx).1)
    }

    /// Appends the attributes and children of `other` onto this node.
    /// Attribute conflicts resolve in favor of `other`.
    pub fn append(&mut self, other: Document) {
        for (k, v) in other.attrs {
            self.set_attr(k, v);
        }
        self.children.extend(other.children);
    }

    pub fn is_empty(&self) -> bool {
        self.attrs.is_empty() && self.children.is_empty()
    }

    // ---- text codec ----

    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        for (key, value) in &self.attrs {
            indent(out, depth);
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&value.replace('"', "\"\""));
            out.push_str("\"\n");
        }
        for (name, child) in &self.children {
            indent(out, depth);
            out.push('[');
            out.push_str(name);
            out.push_str("]\n");
            child.render_into(out, depth + 1);
            indent(out, depth);
            out.push_str("[/");
            out.push_str(name);
            out.push_str("]\n");
        }
    }

    pub fn parse(text: &str) -> Result<Document, DocumentError> {
        Parser::new(text).run()
    }

    // ---- gzip codec ----

    pub fn to_gz_bytes(&self, level: u32) -> Result<Vec<u8>, DocumentError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(level));
        encoder.write_all(self.render().as_bytes())?;
        Ok(encoder.finish()?)
    }

    /// Decodes a gzipped document, refusing payloads that inflate past
    /// `size_limit` bytes.
    pub fn from_gz_bytes(bytes: &[u8], size_limit: usize) -> Result<Document, DocumentError> {
        let mut text = Vec::new();
        let mut decoder = GzDecoder::new(bytes).take(size_limit as u64 + 1);
        decoder.read_to_end(&mut text)?;
        if text.len() > size_limit {
            return Err(DocumentError::TooLarge { limit: size_limit });
        }
        let text = String::from_utf8(text).map_err(|_| DocumentError::Utf8)?;
        Document::parse(&text)
    }

    pub fn read_gz_file(path: &Path, size_limit: usize) -> Result<Document, DocumentError> {
        let bytes = std::fs::read(path)?;
        Document::from_gz_bytes(&bytes, size_limit)
    }

    /// Reads an uncompressed text document from disk.
    pub fn read_file(path: &Path) -> Result<Document, DocumentError> {
        let bytes = std::fs::read(path)?;
        let text = String::from_utf8(bytes).map_err(|_| DocumentError::Utf8)?;
        Document::parse(&text)
    }
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '+'
}

/// Iterative block-format parser; nesting is tracked on an explicit stack
/// so hostile input cannot exhaust the call stack.
struct Parser<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            chars: text.chars().peekable(),
            line: 1,
        }
    }

    fn run(mut self) -> Result<Document, DocumentError> {
        let mut stack: Vec<(String, Document)> = Vec::new();
        let mut current = Document::new();

        loop {
            self.skip_whitespace();
            let Some(&c) = self.chars.peek() else {
                break;
            };

            if c == '[' {
                self.chars.next();
                if self.chars.peek() == Some(&'/') {
                    self.chars.next();
                    let name = self.read_name()?;
                    self.expect(']')?;
                    let (open_name, parent) = stack.pop().ok_or_else(|| {
                        DocumentError::parse(self.line, format!("unmatched [/{name}]"))
                    })?;
                    if open_name != name {
                        return Err(DocumentError::parse(
                            self.line,
                            format!("[/{name}] closes [{open_name}]"),
                        ));
                    }
                    let child = std::mem::replace(&mut current, parent);
                    current.append_child(open_name, child);
                } else {
                    let name = self.read_name()?;
                    self.expect(']')?;
                    stack.push((name, std::mem::take(&mut current)));
                }
            } else if is_key_char(c) {
                let key = self.read_name()?;
                self.skip_inline_space();
                self.expect('=')?;
                self.skip_inline_space();
                let value = self.read_quoted()?;
                current.set_attr(key, value);
            } else {
                return Err(DocumentError::parse(
                    self.line,
                    format!("unexpected character {c:?}"),
                ));
            }
        }

        if let Some((name, _)) = stack.last() {
            return Err(DocumentError::parse(self.line, format!("unclosed [{name}]")));
        }
        Ok(current)
    }

    fn skip_whitespace(&mut self) {
        while let Some(&c) = self.chars.peek() {
            if c == '\n' {
                self.line += 1;
            } else if !c.is_whitespace() {
                break;
            }
            self.chars.next();
        }
    }

    fn skip_inline_space(&mut self) {
        while matches!(self.chars.peek(), Some(' ') | Some('\t')) {
            self.chars.next();
        }
    }

    fn read_name(&mut self) -> Result<String, DocumentError> {
        let mut name = String::new();
        while let Some(&c) = self.chars.peek() {
            if is_key_char(c) {
                name.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        if name.is_empty() {
            return Err(DocumentError::parse(self.line, "expected a name"));
        }
        Ok(name)
    }

    fn expect(&mut self, want: char) -> Result<(), DocumentError> {
        match self.chars.next() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(DocumentError::parse(
                self.line,
                format!("expected {want:?}, found {c:?}"),
            )),
            None => Err(DocumentError::parse(
                self.line,
                format!("expected {want:?}, found end of input"),
            )),
        }
    }

    fn read_quoted(&mut self) -> Result<String, DocumentError> {
        self.expect('"')?;
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some('"') => {
                    // A doubled quote is a literal quote; a single one closes.
                    if self.chars.peek() == Some(&'"') {
                        self.chars.next();
                        value.push('"');
                    } else {
                        return Ok(value);
                    }
                }
                Some(c) => {
                    if c == '\n' {
                        self.line += 1;
                    }
                    value.push(c);
                }
                None => {
                    return Err(DocumentError::parse(self.line, "unterminated quoted value"));
                }
            }
        }
    }
}
