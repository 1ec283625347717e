//! Row and key codec for the tag index: namespace prefixes, escaped tag values, composite tag
//! keys, big-endian TSID lists and encoded series keys.
//!
//! Row layouts (all keys live in one sorted key space):
//!
//! ```text
//! tag -> tsids : NS_TAG_TO_TSIDS  esc(composite) SEP esc(value) SEP tsid_be*
//! key -> tsid  : NS_KEY_TO_TSID   esc(series_key) KV_SEP tsid_be
//! tsid -> key  : NS_TSID_TO_KEY   tsid_be series_key
//! ```

use crate::error::IndexError;
use crate::series_set::SeriesIdSet;
use crate::types::{canonicalize_tags, PointTags, Tag, Tsid};

use crc32fast::Hasher as Crc32;

/// Namespace of `series key -> TSID` rows.
pub const NS_KEY_TO_TSID: u8 = 0;
/// Namespace of `tag -> TSID list` rows.
pub const NS_TAG_TO_TSIDS: u8 = 1;
/// Namespace of `TSID -> series key` rows.
pub const NS_TSID_TO_KEY: u8 = 2;

pub const ESCAPE_CHAR: u8 = 0;
pub const TAG_SEPARATOR_CHAR: u8 = 1;
pub const KV_SEPARATOR_CHAR: u8 = 2;

/// First byte of every composite tag key.
pub const COMPOSITE_TAG_KEY_PREFIX: u8 = 0xFE;

/// Upper bound of TSIDs stored in one `tag -> tsids` row.
pub const MAX_TSIDS_PER_ROW: usize = 64;

pub const TSID_SIZE: usize = 8;

/// Size of the generation/version trailer of a stored series key.
pub const VERSION_SIZE: usize = 2;

#[inline]
pub fn marshal_common_prefix(dst: &mut Vec<u8>, ns: u8) {
    dst.push(ns);
}

/// Appends the escaped `src` followed by the tag separator.
pub fn marshal_tag_value(dst: &mut Vec<u8>, src: &[u8]) {
    marshal_tag_value_no_trailing_separator(dst, src);
    dst.push(TAG_SEPARATOR_CHAR);
}

/// Appends the escaped `src` without a terminating separator (used for prefix seeks).
pub fn marshal_tag_value_no_trailing_separator(dst: &mut Vec<u8>, src: &[u8]) {
    for &b in src {
        match b {
            ESCAPE_CHAR => dst.extend_from_slice(&[ESCAPE_CHAR, b'0']),
            TAG_SEPARATOR_CHAR => dst.extend_from_slice(&[ESCAPE_CHAR, b'1']),
            KV_SEPARATOR_CHAR => dst.extend_from_slice(&[ESCAPE_CHAR, b'2']),
            _ => dst.push(b),
        }
    }
}

/// Decodes one escaped value terminated by the tag separator from `src`, appending the raw
/// bytes to `dst`. Returns the remainder after the separator.
pub fn unmarshal_tag_value<'a>(dst: &mut Vec<u8>, src: &'a [u8]) -> Result<&'a [u8], IndexError> {
    let n = src
        .iter()
        .position(|&b| b == TAG_SEPARATOR_CHAR)
        .ok_or_else(|| {
            IndexError::corruption(
                format!("cannot find tag separator {} in escaped value", TAG_SEPARATOR_CHAR),
                src,
            )
        })?;
    unescape_into(dst, &src[..n])?;
    Ok(&src[n + 1..])
}

/// Unescapes a separator-free escaped byte string.
pub fn unescape_into(dst: &mut Vec<u8>, src: &[u8]) -> Result<(), IndexError> {
    let mut i = 0;
    while i < src.len() {
        let b = src[i];
        if b != ESCAPE_CHAR {
            dst.push(b);
            i += 1;
            continue;
        }
        let raw = match src.get(i + 1) {
            Some(b'0') => ESCAPE_CHAR,
            Some(b'1') => TAG_SEPARATOR_CHAR,
            Some(b'2') => KV_SEPARATOR_CHAR,
            _ => {
                return Err(IndexError::corruption(
                    format!("invalid escape sequence at offset {}", i),
                    src,
                ))
            }
        };
        dst.push(raw);
        i += 2;
    }
    Ok(())
}

/// `0xFE varint(len(name)) name`: the composite key shared by every tag of a measurement.
pub fn marshal_composite_name_prefix(dst: &mut Vec<u8>, name: &[u8]) {
    dst.push(COMPOSITE_TAG_KEY_PREFIX);
    write_var_u64(dst, name.len() as u64);
    dst.extend_from_slice(name);
}

/// `0xFE varint(len(name)) name key`.
pub fn marshal_composite_tag_key(dst: &mut Vec<u8>, name: &[u8], key: &[u8]) {
    marshal_composite_name_prefix(dst, name);
    dst.extend_from_slice(key);
}

/// Splits a raw (unescaped) composite tag key into `(measurement, tag key)`.
pub fn unmarshal_composite_tag_key(src: &[u8]) -> Result<(&[u8], &[u8]), IndexError> {
    if src.first() != Some(&COMPOSITE_TAG_KEY_PREFIX) {
        return Err(IndexError::corruption(
            "composite tag key must start with 0xFE",
            src,
        ));
    }
    let (n, rest) = read_var_u64(&src[1..])
        .ok_or_else(|| IndexError::corruption("truncated composite key length", src))?;
    let n = n as usize;
    if rest.len() < n {
        return Err(IndexError::corruption(
            format!("composite key name length {} exceeds {} bytes", n, rest.len()),
            src,
        ));
    }
    Ok((&rest[..n], &rest[n..]))
}

/// Prefix of every `tag -> tsids` row for `(name, key)`, including the trailing separator.
pub fn tag_key_prefix(dst: &mut Vec<u8>, name: &[u8], key: &[u8], scratch: &mut Vec<u8>) {
    scratch.clear();
    marshal_composite_tag_key(scratch, name, key);
    marshal_common_prefix(dst, NS_TAG_TO_TSIDS);
    marshal_tag_value(dst, scratch);
}

#[inline]
pub fn marshal_tsid(dst: &mut Vec<u8>, tsid: Tsid) {
    dst.extend_from_slice(&tsid.to_be_bytes());
}

/// Reads a big-endian TSID from the first 8 bytes of `src`.
pub fn unmarshal_tsid(src: &[u8]) -> Result<Tsid, IndexError> {
    let b: [u8; TSID_SIZE] = src
        .get(..TSID_SIZE)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| IndexError::corruption("truncated TSID", src))?;
    Ok(Tsid::from_be_bytes(b))
}

/// Turns `key` (which must end with the tag separator) into the smallest key sorting after
/// every key that starts with it.
///
/// Used to jump over all rows of one tag value. The byte is incremented in place; a
/// trailing byte that is not the separator, or that cannot be incremented, is corruption.
pub fn separator_successor(key: &mut [u8]) -> Result<(), IndexError> {
    match key.last_mut() {
        Some(last) if *last == TAG_SEPARATOR_CHAR && *last < 0xFF => {
            *last += 1;
            Ok(())
        }
        _ => Err(IndexError::corruption(
            format!(
                "data corruption: the last char of the skip key must be {:#04x}",
                TAG_SEPARATOR_CHAR
            ),
            key,
        )),
    }
}

pub fn write_u16_be(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn read_u16_be(src: &[u8]) -> Option<(u16, &[u8])> {
    let b: [u8; 2] = src.get(..2)?.try_into().ok()?;
    Some((u16::from_be_bytes(b), &src[2..]))
}

pub fn write_var_u64(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

/// Decodes a LEB128 varint, returning the value and the remaining bytes.
pub fn read_var_u64(src: &[u8]) -> Option<(u64, &[u8])> {
    let mut out: u64 = 0;
    let mut shift: u32 = 0;
    for (i, &byte) in src.iter().enumerate().take(10) {
        out |= ((byte & 0x7F) as u64) << shift;
        if (byte & 0x80) == 0 {
            return Some((out, &src[i + 1..]));
        }
        shift += 7;
    }
    None
}

#[inline]
pub fn crc32(bytes: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(bytes);
    h.finalize()
}

// --- tag -> tsids row parser ---

/// Reusable parser for `tag -> tsids` rows. Owned by one search at a time.
#[derive(Debug, Default)]
pub struct TagToTsidsRowParser {
    /// Parsed TSIDs of the current row, valid after [`Self::parse_tsids`].
    pub tsids: Vec<Tsid>,
    /// Raw composite tag key of the current row (set by [`Self::init`]).
    pub composite_key: Vec<u8>,
    /// Raw tag value of the current row (set by [`Self::init`]).
    pub value: Vec<u8>,
    tail: Vec<u8>,
}

impl TagToTsidsRowParser {
    pub fn reset(&mut self) {
        self.tsids.clear();
        self.composite_key.clear();
        self.value.clear();
        self.tail.clear();
    }

    /// Fully parses `item`: namespace byte, composite key, value and TSID tail.
    pub fn init(&mut self, item: &[u8], ns: u8) -> Result<(), IndexError> {
        self.composite_key.clear();
        self.value.clear();
        match item.first() {
            Some(&b) if b == ns => {}
            _ => {
                return Err(IndexError::corruption(
                    format!("invalid namespace prefix; want {}", ns),
                    item,
                ))
            }
        }
        let rest = unmarshal_tag_value(&mut self.composite_key, &item[1..])?;
        let tail = unmarshal_tag_value(&mut self.value, rest)?;
        self.init_only_tail(item, tail)
    }

    /// Initialises the parser from the TSID tail of `item` only.
    pub fn init_only_tail(&mut self, item: &[u8], tail: &[u8]) -> Result<(), IndexError> {
        self.tsids.clear();
        if tail.is_empty() {
            return Err(IndexError::corruption("missing TSIDs in tag->tsids row", item));
        }
        if tail.len() % TSID_SIZE != 0 {
            return Err(IndexError::corruption(
                format!(
                    "invalid tail length in tag->tsids row; got {} bytes; must be a multiple of {}",
                    tail.len(),
                    TSID_SIZE
                ),
                item,
            ));
        }
        self.tail.clear();
        self.tail.extend_from_slice(tail);
        Ok(())
    }

    /// Number of TSIDs in the current row without decoding them.
    #[inline]
    pub fn tsids_len(&self) -> usize {
        self.tail.len() / TSID_SIZE
    }

    pub fn parse_tsids(&mut self) {
        self.tsids.clear();
        self.tsids.extend(
            self.tail
                .chunks_exact(TSID_SIZE)
                .map(|c| Tsid::from_be_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])),
        );
    }

    /// True when any parsed TSID is a member of `filter`.
    pub fn has_common_tsids(&self, filter: &SeriesIdSet) -> bool {
        self.tsids.iter().any(|id| filter.contains(*id))
    }

    /// True when the row carries at least one live TSID that is also eligible.
    pub fn is_expected_tag(&mut self, deleted: &SeriesIdSet, eligible: Option<&SeriesIdSet>) -> bool {
        self.parse_tsids();
        self.tsids
            .iter()
            .any(|id| !deleted.contains(*id) && eligible.map_or(true, |e| e.contains(*id)))
    }
}

// --- series keys ---

/// Encodes `name` and `tags` as a series key:
/// `u16 size | u16 len(name) name | u16 n | (u16 klen k u16 vlen v)*`.
///
/// Tags are canonicalised first so that equivalent sets produce identical keys.
pub fn marshal_series_key(dst: &mut Vec<u8>, name: &str, tags: &PointTags) -> Result<(), IndexError> {
    let mut sorted = tags.clone();
    canonicalize_tags(&mut sorted);

    let start = dst.len();
    write_u16_be(dst, 0);
    write_len_prefixed(dst, name.as_bytes())?;
    let n: u16 = sorted
        .len()
        .try_into()
        .map_err(|_| IndexError::InvalidExpr(format!("too many tags: {}", sorted.len())))?;
    write_u16_be(dst, n);
    for t in &sorted {
        write_len_prefixed(dst, t.key.as_bytes())?;
        write_len_prefixed(dst, t.value.as_bytes())?;
    }
    let size: u16 = (dst.len() - start - 2)
        .try_into()
        .map_err(|_| IndexError::InvalidExpr("series key too large".to_string()))?;
    dst[start..start + 2].copy_from_slice(&size.to_be_bytes());
    Ok(())
}

fn write_len_prefixed(dst: &mut Vec<u8>, b: &[u8]) -> Result<(), IndexError> {
    let n: u16 = b
        .len()
        .try_into()
        .map_err(|_| IndexError::InvalidExpr(format!("identifier too long: {} bytes", b.len())))?;
    write_u16_be(dst, n);
    dst.extend_from_slice(b);
    Ok(())
}

fn read_len_prefixed<'a>(src: &'a [u8], key: &[u8]) -> Result<(&'a [u8], &'a [u8]), IndexError> {
    let (n, rest) =
        read_u16_be(src).ok_or_else(|| IndexError::corruption("truncated series key", key))?;
    let n = n as usize;
    if rest.len() < n {
        return Err(IndexError::corruption("truncated series key field", key));
    }
    Ok((&rest[..n], &rest[n..]))
}

/// Measurement name of an encoded series key (with or without version trailer).
pub fn measurement_name(key: &[u8]) -> Result<&[u8], IndexError> {
    let (_, rest) =
        read_u16_be(key).ok_or_else(|| IndexError::corruption("truncated series key", key))?;
    let (name, _) = read_len_prefixed(rest, key)?;
    Ok(name)
}

/// Decodes an encoded series key (with or without version trailer).
pub fn parse_series_key(key: &[u8]) -> Result<(String, PointTags), IndexError> {
    let (size, rest) =
        read_u16_be(key).ok_or_else(|| IndexError::corruption("truncated series key", key))?;
    let body = rest
        .get(..size as usize)
        .ok_or_else(|| IndexError::corruption("series key shorter than its size field", key))?;
    let (name, rest) = read_len_prefixed(body, key)?;
    let (n, mut rest) =
        read_u16_be(rest).ok_or_else(|| IndexError::corruption("missing tag count", key))?;
    let mut tags = Vec::with_capacity(n as usize);
    for _ in 0..n {
        let (k, r) = read_len_prefixed(rest, key)?;
        let (v, r) = read_len_prefixed(r, key)?;
        tags.push(Tag::new(utf8(k, key)?, utf8(v, key)?));
        rest = r;
    }
    Ok((utf8(name, key)?, tags))
}

fn utf8(b: &[u8], key: &[u8]) -> Result<String, IndexError> {
    String::from_utf8(b.to_vec())
        .map_err(|e| IndexError::corruption(format!("invalid UTF-8 in series key: {}", e), key))
}

#[inline]
pub fn append_version(dst: &mut Vec<u8>, version: u16) {
    write_u16_be(dst, version);
}

/// Splits a stored series key into `(key, version)`.
pub fn split_version(stored: &[u8]) -> Result<(&[u8], u16), IndexError> {
    if stored.len() < VERSION_SIZE {
        return Err(IndexError::corruption(
            "stored series key shorter than its version trailer",
            stored,
        ));
    }
    let (key, v) = stored.split_at(stored.len() - VERSION_SIZE);
    Ok((key, u16::from_be_bytes([v[0], v[1]])))
}
