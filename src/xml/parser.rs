//! Recursive-descent XML parser producing the tree shape described in the
//! module docs. Covers the subset the order exports actually use: elements,
//! attributes, text, CDATA, comments, and the five standard entities.

use std::borrow::Cow;

use serde_json::{Map, Value};

use super::XmlError;

/// Parse a document into `{ "<RootTag>": <element> }`, then collapse
/// single-element arrays at each configured foldable path.
///
/// Some upstream exporters emit a `utf-16` declaration on bytes that are
/// really utf-8; the prologue is rewritten before parsing.
pub fn parse_document(input: &str, foldable: &[String]) -> Result<Value, XmlError> {
    let text = normalize_prolog(input);
    let mut parser = Parser::new(text.as_bytes());
    parser.skip_misc();
    if parser.at_end() {
        return Err(XmlError::NoRoot);
    }
    let (tag, element) = parser.parse_element()?;
    parser.skip_misc();

    let mut root = Map::new();
    root.insert(tag, element);
    let mut doc = Value::Object(root);
    for path in foldable {
        fold_path(&mut doc, path);
    }
    Ok(doc)
}

/// Collapse a single-element array at a dotted path (root tag included,
/// e.g. `"Order.Case.Patient"`). Arrays met along the way are traversed
/// element-wise. Missing paths and longer arrays are left alone.
pub fn fold_path(value: &mut Value, path: &str) {
    let segments: Vec<&str> = path.split('.').collect();
    fold_at(value, &segments);
}

fn fold_at(value: &mut Value, segments: &[&str]) {
    match value {
        Value::Array(items) => {
            for item in items {
                fold_at(item, segments);
            }
        }
        Value::Object(map) => {
            let Some((first, rest)) = segments.split_first() else {
                return;
            };
            let Some(entry) = map.get_mut(*first) else {
                return;
            };
            if rest.is_empty() {
                if let Value::Array(items) = entry {
                    if items.len() == 1 {
                        *entry = items.remove(0);
                    }
                }
            } else {
                fold_at(entry, rest);
            }
        }
        _ => {}
    }
}

/// Rewrite a known-wrong `encoding="utf-16"` declaration to utf-8.
fn normalize_prolog(input: &str) -> Cow<'_, str> {
    let trimmed = input.trim_start();
    if !trimmed.starts_with("<?xml") {
        return Cow::Borrowed(input);
    }
    if let Some(end) = input.find("?>") {
        let prolog = &input[..end];
        if prolog.to_ascii_lowercase().contains("utf-16") {
            let fixed = prolog.replace("utf-16", "utf-8").replace("UTF-16", "utf-8");
            return Cow::Owned(format!("{fixed}{}", &input[end..]));
        }
    }
    Cow::Borrowed(input)
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn starts_with(&self, pat: &str) -> bool {
        self.bytes[self.pos..].starts_with(pat.as_bytes())
    }

    fn expect(&mut self, pat: &str) -> Result<(), XmlError> {
        if self.starts_with(pat) {
            self.pos += pat.len();
            Ok(())
        } else if self.at_end() {
            Err(XmlError::UnexpectedEof(self.pos))
        } else {
            Err(XmlError::Expected {
                expected: format!("`{pat}`"),
                at: self.pos,
            })
        }
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(b' ' | b'\t' | b'\r' | b'\n')) {
            self.pos += 1;
        }
    }

    /// Skip whitespace, XML declarations/processing instructions, comments,
    /// and DOCTYPE — everything allowed around the root element.
    fn skip_misc(&mut self) {
        loop {
            self.skip_ws();
            if self.starts_with("<?") {
                self.skip_until("?>");
            } else if self.starts_with("<!--") {
                self.skip_until("-->");
            } else if self.starts_with("<!") {
                self.skip_until(">");
            } else {
                return;
            }
        }
    }

    fn skip_until(&mut self, terminator: &str) {
        match find_from(self.bytes, self.pos, terminator) {
            Some(idx) => self.pos = idx + terminator.len(),
            None => self.pos = self.bytes.len(),
        }
    }

    fn parse_name(&mut self) -> Result<String, XmlError> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            let ok = c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.' | b':');
            if !ok {
                break;
            }
            self.pos += 1;
        }
        if self.pos == start {
            if self.at_end() {
                return Err(XmlError::UnexpectedEof(start));
            }
            return Err(XmlError::Expected {
                expected: "a name".into(),
                at: start,
            });
        }
        Ok(String::from_utf8_lossy(&self.bytes[start..self.pos]).into_owned())
    }

    fn parse_element(&mut self) -> Result<(String, Value), XmlError> {
        self.expect("<")?;
        let tag = self.parse_name()?;
        let mut map = Map::new();

        // Attributes until `/>` or `>`.
        loop {
            self.skip_ws();
            if self.starts_with("/>") {
                self.pos += 2;
                return Ok((tag, Value::Object(map)));
            }
            if self.peek() == Some(b'>') {
                self.pos += 1;
                break;
            }
            let name = self.parse_name()?;
            self.skip_ws();
            self.expect("=")?;
            self.skip_ws();
            let value = self.parse_attr_value()?;
            map.insert(name, Value::String(value));
        }

        // Content until the matching close tag.
        let mut text = String::new();
        loop {
            if self.starts_with("</") {
                self.pos += 2;
                let close = self.parse_name()?;
                if close != tag {
                    return Err(XmlError::MismatchedTag {
                        expected: tag,
                        found: close,
                    });
                }
                self.skip_ws();
                self.expect(">")?;
                break;
            } else if self.starts_with("<!--") {
                self.skip_until("-->");
            } else if self.starts_with("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let end = find_from(self.bytes, self.pos, "]]>")
                    .ok_or(XmlError::UnexpectedEof(self.pos))?;
                text.push_str(&String::from_utf8_lossy(&self.bytes[self.pos..end]));
                self.pos = end + 3;
            } else if self.peek() == Some(b'<') {
                let (child_tag, child) = self.parse_element()?;
                match map.get_mut(&child_tag) {
                    Some(Value::Array(items)) => items.push(child),
                    // First child under this tag. A child element sharing
                    // its name with an attribute displaces the attribute.
                    _ => {
                        map.insert(child_tag, Value::Array(vec![child]));
                    }
                }
            } else if self.at_end() {
                return Err(XmlError::UnexpectedEof(self.pos));
            } else {
                let start = self.pos;
                while let Some(c) = self.peek() {
                    if c == b'<' {
                        break;
                    }
                    self.pos += 1;
                }
                text.push_str(&unescape(&String::from_utf8_lossy(
                    &self.bytes[start..self.pos],
                )));
            }
        }

        let trimmed = text.trim();
        if !trimmed.is_empty() {
            map.insert("#text".into(), Value::String(trimmed.to_string()));
        }
        Ok((tag, Value::Object(map)))
    }

    fn parse_attr_value(&mut self) -> Result<String, XmlError> {
        let quote = match self.peek() {
            Some(q @ (b'"' | b'\'')) => q,
            Some(_) => {
                return Err(XmlError::Expected {
                    expected: "a quoted attribute value".into(),
                    at: self.pos,
                })
            }
            None => return Err(XmlError::UnexpectedEof(self.pos)),
        };
        self.pos += 1;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == quote {
                let raw = String::from_utf8_lossy(&self.bytes[start..self.pos]);
                self.pos += 1;
                return Ok(unescape(&raw));
            }
            self.pos += 1;
        }
        Err(XmlError::UnexpectedEof(self.pos))
    }
}

fn find_from(haystack: &[u8], from: usize, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| from + i)
}

fn unescape(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        rest = &rest[amp..];
        let Some(semi) = rest.find(';') else {
            out.push_str(rest);
            return out;
        };
        let entity = &rest[1..semi];
        match entity {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            _ => {
                let parsed = entity
                    .strip_prefix("#x")
                    .and_then(|h| u32::from_str_radix(h, 16).ok())
                    .or_else(|| entity.strip_prefix('#').and_then(|d| d.parse().ok()))
                    .and_then(char::from_u32);
                match parsed {
                    Some(c) => out.push(c),
                    // Unknown entity: keep it verbatim.
                    None => out.push_str(&rest[..=semi]),
                }
            }
        }
        rest = &rest[semi + 1..];
    }
    out.push_str(rest);
    out
}
