//! Placeholder parsing and JSON path evaluation.
//!
//! A placeholder `{{steps[j].outputs.PATH}}` reads `PATH` from the output of
//! step `j`. Paths are evaluated literally from the output root: key
//! segments only match objects, index segments only match arrays.

use std::fmt;
use std::ops::Range;
use std::sync::LazyLock;

use regex::{Captures, Regex};
use serde_json::Value;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{\{\s*steps\[(\d+)\]\.outputs((?:[.\[][^}\s]*)?)\s*\}\}")
        .expect("valid placeholder regex")
});

/// One segment of a JSON path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// A parsed path such as `orders[1].customer.id`. Empty means the root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JsonPath {
    segments: Vec<PathSegment>,
}

/// Outcome of evaluating a path. `Found(&Value::Null)` is a real null.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resolved<'a> {
    Found(&'a Value),
    NotFound,
}

impl<'a> Resolved<'a> {
    pub fn found(self) -> Option<&'a Value> {
        match self {
            Self::Found(v) => Some(v),
            Self::NotFound => None,
        }
    }
}

impl JsonPath {
    /// Parse a dotted/bracketed path. A leading `.` is allowed.
    /// Returns `None` for malformed paths (empty keys, unclosed or
    /// non-numeric brackets).
    pub fn parse(path: &str) -> Option<Self> {
        let path = path.strip_prefix('.').unwrap_or(path);
        let mut segments = Vec::new();
        let mut chars = path.chars().peekable();
        let mut key = String::new();
        // True right after a `]`, where a key needs a `.` first.
        let mut after_index = false;

        while let Some(c) = chars.next() {
            match c {
                '.' => {
                    if key.is_empty() && !after_index {
                        return None;
                    }
                    if !key.is_empty() {
                        segments.push(PathSegment::Key(std::mem::take(&mut key)));
                    }
                    after_index = false;
                    if chars.peek().is_none_or(|c| *c == '.' || *c == '[') {
                        return None;
                    }
                }
                '[' => {
                    if !key.is_empty() {
                        segments.push(PathSegment::Key(std::mem::take(&mut key)));
                    }
                    let mut digits = String::new();
                    loop {
                        match chars.next() {
                            Some(']') => break,
                            Some(d) if d.is_ascii_digit() => digits.push(d),
                            _ => return None,
                        }
                    }
                    segments.push(PathSegment::Index(digits.parse().ok()?));
                    after_index = true;
                }
                ']' => return None,
                c => {
                    if after_index {
                        return None;
                    }
                    key.push(c);
                }
            }
        }
        if !key.is_empty() {
            segments.push(PathSegment::Key(key));
        }
        Some(Self { segments })
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.segments
    }

    /// Walk the path from `root`. Wrong node kinds and out-of-range
    /// indices resolve to `NotFound`.
    pub fn resolve<'a>(&self, root: &'a Value) -> Resolved<'a> {
        let mut current = root;
        for segment in &self.segments {
            let next = match (segment, current) {
                (PathSegment::Key(key), Value::Object(map)) => map.get(key),
                (PathSegment::Index(i), Value::Array(items)) => items.get(*i),
                _ => None,
            };
            match next {
                Some(value) => current = value,
                None => return Resolved::NotFound,
            }
        }
        Resolved::Found(current)
    }
}

impl fmt::Display for JsonPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if i == 0 => write!(f, "{key}")?,
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(idx) => write!(f, "[{idx}]")?,
            }
        }
        Ok(())
    }
}

/// Evaluate a path string against a value. Malformed paths are `NotFound`.
pub fn resolve_path<'a>(root: &'a Value, path: &str) -> Resolved<'a> {
    match JsonPath::parse(path) {
        Some(path) => path.resolve(root),
        None => Resolved::NotFound,
    }
}

/// A parsed `{{steps[j].outputs.PATH}}` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placeholder {
    pub step: usize,
    /// Path text as written, without the leading `.`.
    pub raw_path: String,
    /// `None` when `raw_path` is malformed; such a placeholder never resolves.
    pub path: Option<JsonPath>,
}

impl Placeholder {
    fn from_captures(caps: &Captures<'_>) -> Option<Self> {
        let step = step_index(caps.get(1)?.as_str());
        let raw = caps.get(2).map_or("", |m| m.as_str());
        Some(Self {
            step,
            raw_path: raw.strip_prefix('.').unwrap_or(raw).to_string(),
            path: JsonPath::parse(raw),
        })
    }

    /// Evaluate against the referenced step's output.
    pub fn resolve<'a>(&self, output: &'a Value) -> Resolved<'a> {
        match &self.path {
            Some(path) => path.resolve(output),
            None => Resolved::NotFound,
        }
    }
}

/// Indices too large for `usize` saturate, so they still count as forward
/// references.
fn step_index(digits: &str) -> usize {
    digits.parse().unwrap_or(usize::MAX)
}

/// All placeholders in a string, with their byte ranges.
pub fn find_placeholders(text: &str) -> Vec<(Range<usize>, Placeholder)> {
    PLACEHOLDER_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let range = caps.get(0)?.range();
            Placeholder::from_captures(&caps).map(|p| (range, p))
        })
        .collect()
}

/// Step indices referenced anywhere inside `value`, in order of appearance.
pub fn references(value: &Value) -> Vec<usize> {
    let mut found = Vec::new();
    collect_references(value, &mut found);
    found
}

fn collect_references(value: &Value, found: &mut Vec<usize>) {
    match value {
        Value::String(s) => found.extend(find_placeholders(s).into_iter().map(|(_, p)| p.step)),
        Value::Array(items) => items.iter().for_each(|v| collect_references(v, found)),
        Value::Object(map) => map.values().for_each(|v| collect_references(v, found)),
        _ => {}
    }
}

/// Rewrite the step index of every placeholder inside `value`.
pub fn rewrite_references(value: &mut Value, remap: &impl Fn(usize) -> usize) {
    match value {
        Value::String(s) => {
            let rewritten = PLACEHOLDER_RE.replace_all(s, |caps: &Captures<'_>| {
                match caps.get(1).map(|m| step_index(m.as_str())) {
                    Some(step) => {
                        let path = caps.get(2).map_or("", |m| m.as_str());
                        format!("{{{{steps[{}].outputs{path}}}}}", remap(step))
                    }
                    None => caps[0].to_string(),
                }
            });
            if let std::borrow::Cow::Owned(new) = rewritten {
                *s = new;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(|v| rewrite_references(v, remap)),
        Value::Object(map) => map.values_mut().for_each(|v| rewrite_references(v, remap)),
        _ => {}
    }
}

/// Replace every placeholder inside `value` using `lookup`.
///
/// A string that is exactly one placeholder becomes the looked-up value
/// with its JSON type intact. Placeholders embedded in longer strings are
/// interpolated as text: strings unquoted, anything else as compact JSON.
/// Object keys are never substituted.
pub fn substitute<E>(
    value: &Value,
    lookup: &mut impl FnMut(&Placeholder) -> Result<Value, E>,
) -> Result<Value, E> {
    match value {
        Value::String(s) => substitute_str(s, lookup),
        Value::Array(items) => items
            .iter()
            .map(|v| substitute(v, lookup))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (key, v) in map {
                out.insert(key.clone(), substitute(v, lookup)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn substitute_str<E>(
    s: &str,
    lookup: &mut impl FnMut(&Placeholder) -> Result<Value, E>,
) -> Result<Value, E> {
    let found = find_placeholders(s);
    if found.is_empty() {
        return Ok(Value::String(s.to_string()));
    }
    if let [(range, placeholder)] = found.as_slice()
        && s[..range.start].trim().is_empty()
        && s[range.end..].trim().is_empty()
    {
        return lookup(placeholder);
    }

    let mut out = String::with_capacity(s.len());
    let mut last = 0;
    for (range, placeholder) in &found {
        out.push_str(&s[last..range.start]);
        match lookup(placeholder)? {
            Value::String(text) => out.push_str(&text),
            other => out.push_str(&other.to_string()),
        }
        last = range.end;
    }
    out.push_str(&s[last..]);
    Ok(Value::String(out))
}
