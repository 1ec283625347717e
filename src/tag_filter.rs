//! Compilation of a single tag predicate into a row prefix plus matcher.

use crate::encoding::{
    marshal_common_prefix, marshal_composite_tag_key, marshal_tag_value,
    marshal_tag_value_no_trailing_separator, unescape_into, NS_TAG_TO_TSIDS, TAG_SEPARATOR_CHAR,
};
use crate::error::IndexError;
use regex::bytes::Regex;
use std::fmt;

const REGEX_META: &[char] = &[
    '.', '+', '*', '?', '(', ')', '|', '[', ']', '{', '}', '^', '$', '\\',
];

/// Alternations with more values than this are scanned through the slow path instead.
const MAX_OR_SUFFIXES: usize = 100;

/// A compiled `key op value` predicate for one measurement.
///
/// `prefix` selects every `tag -> tsids` row of `(name, key)`. When `or_suffixes` is
/// non-empty the filter matches exactly those escaped values and is answered by point
/// scans; otherwise `match_suffix` decides per row.
#[derive(Debug, Clone)]
pub struct TagFilter {
    pub name: Vec<u8>,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub is_negative: bool,
    pub is_regexp: bool,

    /// `NS ++ esc(composite(name, key)) ++ SEP`.
    pub prefix: Vec<u8>,
    /// Where the slow-path scan starts; `prefix` possibly extended by a literal head of the
    /// regex. Rows not starting with it cannot match.
    pub seek_prefix: Vec<u8>,
    /// Escaped literal values (no trailing separator).
    pub or_suffixes: Vec<Vec<u8>>,

    regex: Option<Regex>,
}

impl TagFilter {
    pub fn new(
        name: &[u8],
        key: &[u8],
        value: &[u8],
        is_negative: bool,
        is_regexp: bool,
    ) -> Result<Self, IndexError> {
        let mut composite = Vec::with_capacity(name.len() + key.len() + 4);
        marshal_composite_tag_key(&mut composite, name, key);
        let mut prefix = Vec::with_capacity(composite.len() + 4);
        marshal_common_prefix(&mut prefix, NS_TAG_TO_TSIDS);
        marshal_tag_value(&mut prefix, &composite);

        let mut tf = TagFilter {
            name: name.to_vec(),
            key: key.to_vec(),
            value: value.to_vec(),
            is_negative,
            is_regexp,
            seek_prefix: prefix.clone(),
            prefix,
            or_suffixes: Vec::new(),
            regex: None,
        };

        // `key = ''` selects series lacking the tag: the complement of `key =~ /.+/`.
        if !is_regexp && value.is_empty() {
            tf.is_negative = !is_negative;
            tf.is_regexp = true;
            tf.value = b".+".to_vec();
        }

        if !tf.is_regexp {
            let mut s = Vec::with_capacity(tf.value.len());
            marshal_tag_value_no_trailing_separator(&mut s, &tf.value);
            tf.or_suffixes.push(s);
            return Ok(tf);
        }

        let pattern = String::from_utf8_lossy(&tf.value).into_owned();
        let re = Regex::new(&pattern).map_err(|source| IndexError::InvalidRegex {
            pattern: pattern.clone(),
            source,
        })?;
        tf.regex = Some(re);

        if let Some(values) = extract_or_values(&pattern) {
            if values.len() <= MAX_OR_SUFFIXES {
                tf.or_suffixes = values
                    .iter()
                    .map(|v| {
                        let mut s = Vec::with_capacity(v.len());
                        marshal_tag_value_no_trailing_separator(&mut s, v.as_bytes());
                        s
                    })
                    .collect();
                return Ok(tf);
            }
        }

        if let Some(lit) = literal_head(&pattern) {
            marshal_tag_value_no_trailing_separator(&mut tf.seek_prefix, lit.as_bytes());
        }
        Ok(tf)
    }

    /// Decides whether a row suffix (`esc(value) ++ SEP`) satisfies the filter.
    pub fn match_suffix(&self, suffix: &[u8]) -> Result<bool, IndexError> {
        let escaped = match suffix.split_last() {
            Some((&TAG_SEPARATOR_CHAR, body)) => body,
            _ => {
                return Err(IndexError::corruption(
                    "tag value suffix must end with the tag separator",
                    suffix,
                ))
            }
        };
        let mut raw = Vec::with_capacity(escaped.len());
        unescape_into(&mut raw, escaped)?;
        let ok = match &self.regex {
            Some(re) => re.is_match(&raw),
            None => raw == self.value,
        };
        Ok(ok != self.is_negative)
    }

    /// Same filter with the negation flag cleared.
    pub fn positive(&self) -> TagFilter {
        let mut tf = self.clone();
        tf.is_negative = false;
        tf
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match (self.is_negative, self.is_regexp) {
            (false, false) => "=",
            (true, false) => "!=",
            (false, true) => "=~",
            (true, true) => "!~",
        };
        write!(
            f,
            "{}.{} {} {:?}",
            String::from_utf8_lossy(&self.name),
            String::from_utf8_lossy(&self.key),
            op,
            String::from_utf8_lossy(&self.value)
        )
    }
}

// --- regex literal extraction ---

/// Top-level alternatives of `pattern`, or `None` for unbalanced groups.
fn split_top_level(pattern: &str) -> Option<Vec<&str>> {
    let mut out = Vec::new();
    let mut depth = 0i32;
    let mut in_class = false;
    let mut start = 0;
    let mut chars = pattern.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '\\' => {
                chars.next();
            }
            '[' if !in_class => in_class = true,
            ']' if in_class => in_class = false,
            '(' if !in_class => depth += 1,
            ')' if !in_class => {
                depth -= 1;
                if depth < 0 {
                    return None;
                }
            }
            '|' if !in_class && depth == 0 => {
                out.push(&pattern[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    if depth != 0 || in_class {
        return None;
    }
    out.push(&pattern[start..]);
    Some(out)
}

/// Decodes a run of literal characters; `None` when any metacharacter shows up.
fn literal(s: &str) -> Option<String> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let next = chars.next()?;
            if !next.is_ascii_punctuation() {
                return None;
            }
            out.push(next);
        } else if REGEX_META.contains(&c) {
            return None;
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Strips `^ ... $`, respecting an escaped trailing dollar.
fn strip_anchors(s: &str) -> Option<&str> {
    let body = s.strip_prefix('^')?.strip_suffix('$')?;
    let trailing_backslashes = body.chars().rev().take_while(|&c| c == '\\').count();
    if trailing_backslashes % 2 == 1 {
        return None;
    }
    Some(body)
}

/// `pre(a|b|c)post` or a plain literal, without anchors.
fn group_values(body: &str) -> Option<Vec<String>> {
    let open = match find_unescaped(body, '(') {
        None => return literal(body).map(|l| vec![l]),
        Some(i) => i,
    };
    let pre = literal(&body[..open])?;
    let rest = &body[open + 1..];
    let close = find_unescaped(rest, ')')?;
    let mut inner = &rest[..close];
    if find_unescaped(inner, '(').is_some() {
        return None;
    }
    if let Some(stripped) = inner.strip_prefix("?:") {
        inner = stripped;
    }
    let post = literal(&rest[close + 1..])?;
    inner
        .split('|')
        .map(|alt| literal(alt).map(|a| format!("{}{}{}", pre, a, post)))
        .collect()
}

fn find_unescaped(s: &str, needle: char) -> Option<usize> {
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        if c == '\\' {
            chars.next();
        } else if c == needle {
            return Some(i);
        }
    }
    None
}

/// Exact values matched by a fully anchored literal alternation:
/// `^(a|b)$`, `^a$|^b$`, `^pre(a|b)post$` and `^literal$`.
pub(crate) fn extract_or_values(pattern: &str) -> Option<Vec<String>> {
    let alts = split_top_level(pattern)?;
    if alts.len() > 1 {
        return alts
            .iter()
            .map(|alt| strip_anchors(alt).and_then(literal))
            .collect();
    }
    group_values(strip_anchors(pattern)?)
}

/// Longest literal every match must start with, for `^literal...` patterns.
pub(crate) fn literal_head(pattern: &str) -> Option<String> {
    let body = pattern.strip_prefix('^')?;
    if split_top_level(pattern)?.len() > 1 {
        return None;
    }
    let mut out = String::new();
    let mut chars = body.chars().peekable();
    while let Some(&c) = chars.peek() {
        let lit = if c == '\\' {
            chars.next();
            match chars.peek() {
                Some(&n) if n.is_ascii_punctuation() => n,
                _ => break,
            }
        } else if REGEX_META.contains(&c) {
            break;
        } else {
            c
        };
        chars.next();
        // A quantifier may make the last literal optional.
        if matches!(chars.peek(), Some('?') | Some('*') | Some('{')) {
            break;
        }
        out.push(lit);
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}
