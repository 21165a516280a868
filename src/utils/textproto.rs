//! Structured writer and reader for the sandbox engine's configuration grammar.
//!
//! nsjail reads its configuration in protobuf text format. The subset used
//! here is line oriented:
//!
//! ```text
//! name: "quilt-jail"
//! time_limit: 600
//! rlimit_as_type: HARD
//!
//! mount {
//!   src: "/bin"
//!   dst: "/bin"
//!   is_bind: true
//!   rw: false
//! }
//! ```
//!
//! Scalars are `key: value` pairs. Strings are double-quoted and escaped,
//! booleans, integers and enum identifiers are written bare. Bytes that are
//! not valid UTF-8 (a path with a Latin-1 name, say) are written as `\ooo`
//! octal escapes, which the engine reads back as the same raw bytes. Blocks are a name
//! followed by `{`, their entries one per line, and a closing `}`.
//!
//! Building a [`Document`] and calling [`Document::render`] guarantees that
//! every value goes through the same quoting rules. [`Document::parse`] reads
//! back exactly the subset the writer produces, plus `#` comments.
//!
//! # Examples
//!
//! ```
//! use quilt_jail::utils::textproto::{Document, Value};
//!
//! # fn main() -> anyhow::Result<()> {
//! let mut mount = Document::new();
//! mount.push_field("dst", Value::from("/tmp"));
//! mount.push_field("fstype", Value::from("tmpfs"));
//!
//! let mut doc = Document::new();
//! doc.push_field("hostname", Value::from("builder"));
//! doc.push_block("mount", mount);
//!
//! let text = doc.render();
//! assert!(text.starts_with("hostname: \"builder\"\n"));
//! assert_eq!(Document::parse(&text)?, doc);
//! # Ok(())
//! # }
//! ```

use std::ffi::OsStr;
use std::fmt;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::{anyhow, bail, Result};

/// A scalar value in the configuration grammar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Quoted string.
    Str(String),
    /// Quoted string holding bytes that are not valid UTF-8.
    Bytes(Vec<u8>),
    /// Bare `true` or `false`.
    Bool(bool),
    /// Bare unsigned integer.
    Int(u64),
    /// Bare enum identifier such as `HARD`.
    Ident(String),
}

impl Value {
    /// The text of a quoted value that is valid UTF-8.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Raw bytes of a quoted value, whether or not it is valid UTF-8.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Str(s) => Some(s.as_bytes()),
            Value::Bytes(b) => Some(b),
            _ => None,
        }
    }

    /// A quoted value read as a host path, byte for byte.
    pub fn as_path(&self) -> Option<&Path> {
        self.as_bytes().map(|b| Path::new(OsStr::from_bytes(b)))
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<&Path> for Value {
    /// Keeps the exact bytes of `path`; only non-UTF-8 paths become [`Value::Bytes`].
    fn from(path: &Path) -> Self {
        match path.to_str() {
            Some(s) => Value::Str(s.to_string()),
            None => Value::Bytes(path.as_os_str().as_bytes().to_vec()),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<u64> for Value {
    fn from(n: u64) -> Self {
        Value::Int(n)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Str(s) => write!(f, "\"{}\"", escape(s)),
            Value::Bytes(b) => write!(f, "\"{}\"", escape_bytes(b)),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(n) => write!(f, "{n}"),
            Value::Ident(id) => f.write_str(id),
        }
    }
}

/// One line (or one nested block) of a [`Document`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Field { key: String, value: Value },
    Block { name: String, body: Document },
}

/// An ordered list of scalar fields and nested blocks.
///
/// Keys may repeat; order is preserved on render and on parse.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    entries: Vec<Entry>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a `key: value` line.
    pub fn push_field(&mut self, key: impl Into<String>, value: Value) {
        self.entries.push(Entry::Field {
            key: key.into(),
            value,
        });
    }

    /// Appends a `name { ... }` block holding `body`.
    pub fn push_block(&mut self, name: impl Into<String>, body: Document) {
        self.entries.push(Entry::Block {
            name: name.into(),
            body,
        });
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Returns the value of the first field named `key` at this level.
    pub fn field(&self, key: &str) -> Option<&Value> {
        self.entries.iter().find_map(|entry| match entry {
            Entry::Field { key: k, value } if k == key => Some(value),
            _ => None,
        })
    }

    /// Iterates over the bodies of every block named `name` at this level.
    pub fn blocks<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Document> + 'a {
        self.entries.iter().filter_map(move |entry| match entry {
            Entry::Block { name: n, body } if n == name => Some(body),
            _ => None,
        })
    }

    /// Renders the document as configuration text.
    ///
    /// Top-level blocks are separated from what precedes them by a blank line.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        for entry in &self.entries {
            match entry {
                Entry::Field { key, value } => {
                    out.push_str(&format!("{indent}{key}: {value}\n"));
                }
                Entry::Block { name, body } => {
                    if depth == 0 && !out.is_empty() {
                        out.push('\n');
                    }
                    out.push_str(&format!("{indent}{name} {{\n"));
                    body.render_into(out, depth + 1);
                    out.push_str(&format!("{indent}}}\n"));
                }
            }
        }
    }

    /// Parses configuration text produced by [`Document::render`].
    ///
    /// # Errors
    ///
    /// Returns an error naming the offending line if a line is neither a
    /// field, a block opener, a block closer, a comment, nor blank, or if
    /// braces are unbalanced.
    pub fn parse(text: &str) -> Result<Self> {
        // Stack of (block name, body) for blocks still open.
        let mut stack: Vec<(String, Document)> = Vec::new();
        let mut root = Document::new();

        for (idx, raw) in text.lines().enumerate() {
            let lineno = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if line == "}" {
                let (name, body) = stack
                    .pop()
                    .ok_or_else(|| anyhow!("line {lineno}: unexpected '}}'"))?;
                let parent = stack.last_mut().map(|(_, d)| d).unwrap_or(&mut root);
                parent.push_block(name, body);
                continue;
            }

            if let Some(name) = line.strip_suffix('{') {
                let name = name.trim();
                if !is_identifier(name) {
                    bail!("line {lineno}: invalid block name '{name}'");
                }
                stack.push((name.to_string(), Document::new()));
                continue;
            }

            let (key, value) = line
                .split_once(':')
                .ok_or_else(|| anyhow!("line {lineno}: expected 'key: value', got '{line}'"))?;
            let key = key.trim();
            if !is_identifier(key) {
                bail!("line {lineno}: invalid key '{key}'");
            }
            let value = parse_value(value.trim())
                .map_err(|e| anyhow!("line {lineno}: {e}"))?;
            let target = stack.last_mut().map(|(_, d)| d).unwrap_or(&mut root);
            target.push_field(key, value);
        }

        if let Some((name, _)) = stack.last() {
            bail!("unterminated block '{name}'");
        }
        Ok(root)
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn parse_value(raw: &str) -> Result<Value> {
    if let Some(inner) = raw.strip_prefix('"') {
        let inner = inner
            .strip_suffix('"')
            .ok_or_else(|| anyhow!("unterminated string {raw}"))?;
        let bytes = unescape(inner)?;
        return Ok(match String::from_utf8(bytes) {
            Ok(s) => Value::Str(s),
            Err(e) => Value::Bytes(e.into_bytes()),
        });
    }
    match raw {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        _ => {}
    }
    if !raw.is_empty() && raw.bytes().all(|b| b.is_ascii_digit()) {
        return raw
            .parse()
            .map(Value::Int)
            .map_err(|e| anyhow!("invalid integer {raw}: {e}"));
    }
    if is_identifier(raw) {
        return Ok(Value::Ident(raw.to_string()));
    }
    bail!("invalid value '{raw}'")
}

/// Escapes a string for use between double quotes.
fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 || c as u32 == 0x7f => {
                out.push_str(&format!("\\{:03o}", c as u32));
            }
            c => out.push(c),
        }
    }
    out
}

/// Escapes raw bytes: valid UTF-8 runs as in [`escape`], every other byte
/// as a three-digit octal escape.
fn escape_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(&escape(chunk.valid()));
        for byte in chunk.invalid() {
            out.push_str(&format!("\\{byte:03o}"));
        }
    }
    out
}

/// Reverses [`escape`] and [`escape_bytes`]. Octal escapes denote single bytes.
fn unescape(s: &str) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '"' {
            bail!("unescaped quote in string");
        }
        if c != '\\' {
            let mut buf = [0u8; 4];
            out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        match chars.next() {
            Some('\\') => out.push(b'\\'),
            Some('"') => out.push(b'"'),
            Some('n') => out.push(b'\n'),
            Some('t') => out.push(b'\t'),
            Some('r') => out.push(b'\r'),
            Some(d @ '0'..='7') => {
                let mut code = d.to_digit(8).unwrap_or(0);
                for _ in 0..2 {
                    let next = chars
                        .next()
                        .and_then(|c| c.to_digit(8))
                        .ok_or_else(|| anyhow!("truncated octal escape"))?;
                    code = code * 8 + next;
                }
                out.push(u8::try_from(code).map_err(|_| anyhow!("octal escape \\{code:o} out of range"))?);
            }
            Some(other) => bail!("unknown escape '\\{other}'"),
            None => bail!("dangling backslash"),
        }
    }
    Ok(out)
}
