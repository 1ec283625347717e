//! Predicate evaluation: turns an AND/OR/paren tree of tag comparisons into TSID sets or
//! lazy series id iterators.

use crate::error::IndexError;
use crate::expr::{BinaryOp, Expr, VarKind};
use crate::scanner::IndexSearch;
use crate::series_set::{SeriesIdIterator, SeriesIdSet};
use crate::tag_filter::TagFilter;
use crate::telemetry::IndexEvent;
use crate::types::{TimeRange, Tsid};

/// Outcome of resolving a sub-expression through the index.
#[derive(Debug)]
pub enum Resolution {
    Resolved(SeriesIdIterator),
    /// The expression cannot be answered from tag rows (e.g. a field comparison); the
    /// caller must attach it as a residual filter.
    Deferred,
}

/// Resolved operands of a `key op value` leaf.
enum Leaf<'e> {
    Filter(TagFilter),
    /// `tag op tag`; `true` for equality.
    TagVsTag {
        key: &'e str,
        other: &'e str,
        equal: bool,
    },
    NotATag,
    Unsupported,
}

fn classify_leaf<'e>(name: &[u8], op: BinaryOp, lhs: &'e Expr, rhs: &'e Expr) -> Result<Leaf<'e>, IndexError> {
    let (key, kind, value) = match (lhs, rhs) {
        (Expr::VarRef { name: k, kind }, v) => (k.as_str(), *kind, v),
        (v, Expr::VarRef { name: k, kind }) => (k.as_str(), *kind, v),
        _ => return Ok(Leaf::Unsupported),
    };
    if kind != VarKind::Tag {
        return Ok(Leaf::NotATag);
    }
    let leaf = match (value, op) {
        (Expr::StringLiteral(v), BinaryOp::Eq | BinaryOp::Neq) => Leaf::Filter(TagFilter::new(
            name,
            key.as_bytes(),
            v.as_bytes(),
            op == BinaryOp::Neq,
            false,
        )?),
        (Expr::RegexLiteral(v), BinaryOp::EqRegex | BinaryOp::NeqRegex) => {
            Leaf::Filter(TagFilter::new(
                name,
                key.as_bytes(),
                v.as_bytes(),
                op == BinaryOp::NeqRegex,
                true,
            )?)
        }
        (Expr::VarRef { name: other, .. }, BinaryOp::Eq | BinaryOp::Neq) => Leaf::TagVsTag {
            key,
            other: other.as_str(),
            equal: op == BinaryOp::Eq,
        },
        _ => Leaf::Unsupported,
    };
    Ok(leaf)
}

impl IndexSearch<'_> {
    fn all_series<'s>(
        &mut self,
        name: &[u8],
        all: &'s mut Option<SeriesIdSet>,
    ) -> Result<&'s SeriesIdSet, IndexError> {
        if all.is_none() {
            *all = Some(self.get_tsids_by_measurement_name(name)?);
        }
        all.as_ref()
            .ok_or_else(|| IndexError::Internal("all-series set missing".to_string()))
    }

    fn all_series_iter(
        &mut self,
        name: &[u8],
        all: &mut Option<SeriesIdSet>,
        expr: Option<&Expr>,
    ) -> Result<SeriesIdIterator, IndexError> {
        let set = self.all_series(name, all)?;
        Ok(match expr {
            Some(e) => SeriesIdIterator::with_expr(set, e.clone()),
            None => SeriesIdIterator::from_set(set),
        })
    }

    /// Series having both tags with equal values (`equal`) or having `key` but not `other`.
    ///
    /// Values are not compared; both tag universes are scanned and combined as sets.
    fn series_by_tag_vs_tag(
        &mut self,
        name: &[u8],
        key: &str,
        other: &str,
        equal: bool,
    ) -> Result<SeriesIdSet, IndexError> {
        let tf1 = TagFilter::new(name, key.as_bytes(), b".*", false, true)?;
        let tf2 = TagFilter::new(name, other.as_bytes(), b".*", false, true)?;
        let set1 = self.get_tsids_by_tag_filter(&tf1)?;
        let set2 = self.get_tsids_by_tag_filter(&tf2)?;
        Ok(if equal {
            set1.intersect(&set2)
        } else {
            set1.subtract(&set2)
        })
    }

    // --- pure set path ---

    /// Resolves `expr` into a TSID set. Anything the index cannot evaluate widens to every
    /// series of the measurement.
    pub fn search_tsids_internal(
        &mut self,
        name: &[u8],
        expr: Option<&Expr>,
    ) -> Result<SeriesIdSet, IndexError> {
        let expr = match expr {
            None => return self.get_tsids_by_measurement_name(name),
            Some(e) => e,
        };
        match expr {
            Expr::Binary {
                op: op @ (BinaryOp::And | BinaryOp::Or),
                lhs,
                rhs,
            } => {
                let l = self.search_tsids_internal(name, Some(&**lhs))?;
                let r = self.search_tsids_internal(name, Some(&**rhs))?;
                Ok(if *op == BinaryOp::And {
                    l.intersect(&r)
                } else {
                    l.union(&r)
                })
            }
            Expr::Binary { op, lhs, rhs } => self.search_tsids_by_binary_expr(name, expr, *op, lhs, rhs),
            Expr::Paren(inner) => self.search_tsids_internal(name, Some(&**inner)),
            Expr::BooleanLiteral(true) => self.get_tsids_by_measurement_name(name),
            Expr::BooleanLiteral(false) => Ok(SeriesIdSet::new()),
            _ => self.get_tsids_by_measurement_name(name),
        }
    }

    fn search_tsids_by_binary_expr(
        &mut self,
        name: &[u8],
        whole: &Expr,
        op: BinaryOp,
        lhs: &Expr,
        rhs: &Expr,
    ) -> Result<SeriesIdSet, IndexError> {
        if lhs.is_binary() || rhs.is_binary() {
            self.listener.on_event(IndexEvent::NestedComparisonFallback {
                measurement: String::from_utf8_lossy(name).into_owned(),
                expr: whole.to_string(),
            });
            return self.get_tsids_by_measurement_name(name);
        }
        match classify_leaf(name, op, lhs, rhs)? {
            Leaf::Filter(tf) => self.get_tsids_by_tag_filter(&tf),
            Leaf::TagVsTag { key, other, equal } => {
                self.series_by_tag_vs_tag(name, key, other, equal)
            }
            Leaf::NotATag | Leaf::Unsupported => self.get_tsids_by_measurement_name(name),
        }
    }

    // --- iterator path ---

    /// Resolves `expr` into a lazy iterator whose elements may carry residual filters.
    ///
    /// `all` caches the measurement's full series set; in single-series mode the caller
    /// seeds it with the one known TSID, which then stands in for every tag lookup.
    pub fn series_by_expr_iterator(
        &mut self,
        name: &[u8],
        expr: Option<&Expr>,
        all: &mut Option<SeriesIdSet>,
        single_series: bool,
    ) -> Result<Resolution, IndexError> {
        let expr = match expr {
            None => return Ok(Resolution::Resolved(self.all_series_iter(name, all, None)?)),
            Some(e) => e,
        };
        match expr {
            Expr::Binary {
                op: op @ (BinaryOp::And | BinaryOp::Or),
                lhs,
                rhs,
            } => {
                let l = self.series_by_expr_iterator(name, Some(&**lhs), all, single_series)?;
                let r = self.series_by_expr_iterator(name, Some(&**rhs), all, single_series)?;
                if *op == BinaryOp::And {
                    self.intersect_resolutions(name, all, lhs, rhs, l, r)
                } else {
                    let litr = match l {
                        Resolution::Resolved(it) => it,
                        Resolution::Deferred => {
                            self.all_series_iter(name, all, Some(lhs.as_binary_expr()?))?
                        }
                    };
                    let ritr = match r {
                        Resolution::Resolved(it) => it,
                        Resolution::Deferred => {
                            self.all_series_iter(name, all, Some(rhs.as_binary_expr()?))?
                        }
                    };
                    Ok(Resolution::Resolved(SeriesIdIterator::union(litr, ritr)))
                }
            }
            Expr::Binary { .. } => self.series_by_binary_expr(name, expr, all, single_series),
            Expr::Paren(inner) => self.series_by_expr_iterator(name, Some(&**inner), all, single_series),
            Expr::BooleanLiteral(true) => Ok(Resolution::Resolved(self.all_series_iter(name, all, None)?)),
            _ => Ok(Resolution::Resolved(SeriesIdIterator::empty())),
        }
    }

    fn intersect_resolutions(
        &mut self,
        name: &[u8],
        all: &mut Option<SeriesIdSet>,
        lhs: &Expr,
        rhs: &Expr,
        l: Resolution,
        r: Resolution,
    ) -> Result<Resolution, IndexError> {
        let it = match (l, r) {
            (Resolution::Resolved(l), Resolution::Resolved(r)) => SeriesIdIterator::intersect(l, r),
            // The deferred side only narrows what the resolved side already selected.
            (Resolution::Deferred, Resolution::Resolved(r)) => r.filtered(lhs.as_binary_expr()?.clone()),
            (Resolution::Resolved(l), Resolution::Deferred) => l.filtered(rhs.as_binary_expr()?.clone()),
            (Resolution::Deferred, Resolution::Deferred) => {
                let both = Expr::and(lhs.as_binary_expr()?.clone(), rhs.as_binary_expr()?.clone());
                self.all_series_iter(name, all, Some(&both))?
            }
        };
        Ok(Resolution::Resolved(it))
    }

    fn series_by_binary_expr(
        &mut self,
        name: &[u8],
        n: &Expr,
        all: &mut Option<SeriesIdSet>,
        single_series: bool,
    ) -> Result<Resolution, IndexError> {
        let (op, lhs, rhs) = n.as_binary()?;
        if lhs.is_binary() || rhs.is_binary() {
            return Ok(Resolution::Resolved(self.all_series_iter(name, all, Some(n))?));
        }
        let leaf = classify_leaf(name, op, lhs, rhs)?;
        if let Leaf::NotATag = leaf {
            // Field comparisons narrow nothing on their own.
            return Ok(Resolution::Deferred);
        }
        if single_series {
            return Ok(Resolution::Resolved(self.all_series_iter(name, all, None)?));
        }
        let ids = match leaf {
            Leaf::Filter(tf) => self.get_tsids_by_tag_filter(&tf)?,
            Leaf::TagVsTag { key, other, equal } => self.series_by_tag_vs_tag(name, key, other, equal)?,
            Leaf::NotATag | Leaf::Unsupported => {
                return Ok(Resolution::Resolved(self.all_series_iter(name, all, Some(n))?))
            }
        };
        Ok(Resolution::Resolved(SeriesIdIterator::from_set(&ids)))
    }

    /// Lazy series of `name` matching `expr`, tombstones excluded. `None` when the
    /// measurement does not exist.
    ///
    /// With `single_series`, the given TSID replaces every tag lookup.
    pub fn measurement_series_by_expr_iterator(
        &mut self,
        name: &[u8],
        expr: Option<&Expr>,
        tr: TimeRange,
        single_series: Option<Tsid>,
    ) -> Result<Option<SeriesIdIterator>, IndexError> {
        let _tr = tr.normalized();
        if !self.contains_measurement(name)? {
            return Ok(None);
        }

        let mut all = single_series.map(|id| [id].into_iter().collect::<SeriesIdSet>());
        let it = match self.series_by_expr_iterator(name, expr, &mut all, single_series.is_some())? {
            Resolution::Resolved(it) => it,
            Resolution::Deferred => {
                let whole = match expr {
                    Some(e) => e.as_binary_expr()?,
                    None => {
                        return Err(IndexError::Internal(
                            "empty condition cannot be deferred".to_string(),
                        ))
                    }
                };
                self.all_series_iter(name, &mut all, Some(whole))?
            }
        };
        Ok(Some(it.exclude(std::sync::Arc::clone(&self.deleted))))
    }

    /// TSIDs of `name` matching `expr`, tombstones excluded; empty for unknown measurements.
    pub fn search_tsids(
        &mut self,
        name: &[u8],
        expr: Option<&Expr>,
        tr: TimeRange,
    ) -> Result<SeriesIdSet, IndexError> {
        let _tr = tr.normalized();
        if !self.contains_measurement(name)? {
            return Ok(SeriesIdSet::new());
        }
        let tsids = self.search_tsids_internal(name, expr)?;
        Ok(tsids.subtract(&self.deleted))
    }
}

impl Expr {
    /// The binary expression under any parentheses, as needed for a residual filter.
    pub(crate) fn as_binary_expr(&self) -> Result<&Expr, IndexError> {
        let inner = self.unparen();
        if inner.is_binary() {
            Ok(inner)
        } else {
            Err(IndexError::InvalidExpr(format!(
                "cannot convert {} to a binary expression",
                self
            )))
        }
    }
}
