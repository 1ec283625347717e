//! Series id containers and lazy id iterators.

use crate::error::IndexError;
use crate::expr::Expr;
use crate::types::Tsid;
use roaring::RoaringTreemap;
use std::iter::Peekable;
use std::sync::Arc;

/// Sorted, deduplicated set of TSIDs backed by a roaring treemap.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesIdSet {
    bitmap: RoaringTreemap,
}

impl SeriesIdSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn add(&mut self, id: Tsid) {
        self.bitmap.insert(id);
    }

    /// Appends `id`, taking the cheap path when ids arrive in ascending order.
    #[inline]
    pub fn push(&mut self, id: Tsid) {
        if !self.bitmap.push(id) {
            self.bitmap.insert(id);
        }
    }

    pub fn extend_from_slice(&mut self, ids: &[Tsid]) {
        for &id in ids {
            self.push(id);
        }
    }

    #[inline]
    pub fn contains(&self, id: Tsid) -> bool {
        self.bitmap.contains(id)
    }

    pub fn len(&self) -> u64 {
        self.bitmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bitmap.is_empty()
    }

    pub fn union(&self, other: &SeriesIdSet) -> SeriesIdSet {
        SeriesIdSet {
            bitmap: &self.bitmap | &other.bitmap,
        }
    }

    pub fn intersect(&self, other: &SeriesIdSet) -> SeriesIdSet {
        SeriesIdSet {
            bitmap: &self.bitmap & &other.bitmap,
        }
    }

    /// `self \ other`
    pub fn subtract(&self, other: &SeriesIdSet) -> SeriesIdSet {
        SeriesIdSet {
            bitmap: &self.bitmap - &other.bitmap,
        }
    }

    /// True when the sets share at least one member.
    pub fn has_common(&self, other: &SeriesIdSet) -> bool {
        !self.bitmap.is_disjoint(&other.bitmap)
    }

    pub fn iter(&self) -> impl Iterator<Item = Tsid> + '_ {
        self.bitmap.iter()
    }

    pub fn to_vec(&self) -> Vec<Tsid> {
        self.bitmap.iter().collect()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, IndexError> {
        let mut out = Vec::with_capacity(self.bitmap.serialized_size());
        self.bitmap
            .serialize_into(&mut out)
            .map_err(|e| IndexError::Serialization(format!("tsid set: {}", e)))?;
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IndexError> {
        let bitmap = RoaringTreemap::deserialize_from(bytes).map_err(|e| IndexError::Corruption {
            details: format!("invalid tsid set payload: {}", e),
            key: None,
        })?;
        Ok(Self { bitmap })
    }
}

impl FromIterator<Tsid> for SeriesIdSet {
    fn from_iter<I: IntoIterator<Item = Tsid>>(iter: I) -> Self {
        let mut s = SeriesIdSet::new();
        for id in iter {
            s.push(id);
        }
        s
    }
}

/// One resolved series id plus the residual filter that still has to be applied to it
/// (e.g. a field comparison). `expr == None` means the series matches unconditionally.
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesIdElem {
    pub id: Tsid,
    pub expr: Option<Expr>,
}

impl SeriesIdElem {
    pub fn new(id: Tsid) -> Self {
        Self { id, expr: None }
    }
}

fn and_exprs(a: Option<Expr>, b: Option<Expr>) -> Option<Expr> {
    match (a, b) {
        (None, e) | (e, None) => e,
        (Some(a), Some(b)) => Some(Expr::and(a, b)),
    }
}

/// Lazy, ascending stream of [`SeriesIdElem`]s.
///
/// Combinators are linear merges over their (already ascending) inputs.
#[derive(Debug)]
pub enum SeriesIdIterator {
    /// Plain set, every element unconditional.
    Set { ids: Vec<Tsid>, pos: usize },
    /// Attaches `expr` (AND-combined) to every element of `inner`.
    Expr {
        inner: Box<SeriesIdIterator>,
        expr: Expr,
    },
    Intersect {
        lhs: Box<Peekable<SeriesIdIterator>>,
        rhs: Box<Peekable<SeriesIdIterator>>,
    },
    Union {
        lhs: Box<Peekable<SeriesIdIterator>>,
        rhs: Box<Peekable<SeriesIdIterator>>,
    },
    /// Drops every id contained in `deleted`.
    Exclude {
        inner: Box<SeriesIdIterator>,
        deleted: Arc<SeriesIdSet>,
    },
}

impl SeriesIdIterator {
    pub fn from_set(set: &SeriesIdSet) -> Self {
        SeriesIdIterator::Set {
            ids: set.to_vec(),
            pos: 0,
        }
    }

    pub fn empty() -> Self {
        SeriesIdIterator::Set {
            ids: Vec::new(),
            pos: 0,
        }
    }

    /// `set` with a residual filter on every element.
    pub fn with_expr(set: &SeriesIdSet, expr: Expr) -> Self {
        SeriesIdIterator::Expr {
            inner: Box::new(Self::from_set(set)),
            expr,
        }
    }

    /// Attaches `expr` to an arbitrary iterator.
    pub fn filtered(self, expr: Expr) -> Self {
        SeriesIdIterator::Expr {
            inner: Box::new(self),
            expr,
        }
    }

    pub fn intersect(lhs: SeriesIdIterator, rhs: SeriesIdIterator) -> Self {
        SeriesIdIterator::Intersect {
            lhs: Box::new(lhs.peekable()),
            rhs: Box::new(rhs.peekable()),
        }
    }

    pub fn union(lhs: SeriesIdIterator, rhs: SeriesIdIterator) -> Self {
        SeriesIdIterator::Union {
            lhs: Box::new(lhs.peekable()),
            rhs: Box::new(rhs.peekable()),
        }
    }

    pub fn exclude(self, deleted: Arc<SeriesIdSet>) -> Self {
        if deleted.is_empty() {
            return self;
        }
        SeriesIdIterator::Exclude {
            inner: Box::new(self),
            deleted,
        }
    }

    /// Drains the iterator into a set, dropping residual filters.
    pub fn into_ids(self) -> SeriesIdSet {
        self.map(|e| e.id).collect()
    }
}

impl Iterator for SeriesIdIterator {
    type Item = SeriesIdElem;

    fn next(&mut self) -> Option<SeriesIdElem> {
        match self {
            SeriesIdIterator::Set { ids, pos } => {
                let id = *ids.get(*pos)?;
                *pos += 1;
                Some(SeriesIdElem::new(id))
            }
            SeriesIdIterator::Expr { inner, expr } => {
                let mut e = inner.next()?;
                e.expr = and_exprs(e.expr.take(), Some(expr.clone()));
                Some(e)
            }
            SeriesIdIterator::Intersect { lhs, rhs } => loop {
                let (a, b) = match (lhs.peek(), rhs.peek()) {
                    (Some(a), Some(b)) => (a.id, b.id),
                    _ => return None,
                };
                if a < b {
                    lhs.next();
                } else if b < a {
                    rhs.next();
                } else {
                    let l = lhs.next()?;
                    let r = rhs.next()?;
                    return Some(SeriesIdElem {
                        id: l.id,
                        expr: and_exprs(l.expr, r.expr),
                    });
                }
            },
            SeriesIdIterator::Union { lhs, rhs } => {
                let order = match (lhs.peek(), rhs.peek()) {
                    (None, None) => return None,
                    (Some(_), None) => std::cmp::Ordering::Less,
                    (None, Some(_)) => std::cmp::Ordering::Greater,
                    (Some(a), Some(b)) => a.id.cmp(&b.id),
                };
                match order {
                    std::cmp::Ordering::Less => lhs.next(),
                    std::cmp::Ordering::Greater => rhs.next(),
                    std::cmp::Ordering::Equal => {
                        let l = lhs.next()?;
                        let r = rhs.next()?;
                        let expr = match (l.expr, r.expr) {
                            (Some(a), Some(b)) => Some(Expr::or(a, b)),
                            _ => None,
                        };
                        Some(SeriesIdElem { id: l.id, expr })
                    }
                }
            }
            SeriesIdIterator::Exclude { inner, deleted } => loop {
                let e = inner.next()?;
                if !deleted.contains(e.id) {
                    return Some(e);
                }
            },
        }
    }
}
