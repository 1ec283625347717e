//! Grouped series results for `GROUP BY` style consumers, backed by a bounded pool.

use crate::buffer::{ObjectPool, Reset};
use crate::expr::Expr;
use crate::types::{PointTags, Tsid};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

/// Series of one group, as parallel arrays indexed together.
#[derive(Debug, Default)]
pub struct TagSetInfo {
    pub ids: Vec<Tsid>,
    /// Residual filter per series; `None` when it matches unconditionally.
    pub filters: Vec<Option<Expr>>,
    /// Encoded series keys (no version trailer).
    pub series_keys: Vec<Vec<u8>>,
    pub tags_vec: Vec<PointTags>,
    /// Group key built from the grouping dimensions.
    pub key: Vec<u8>,
}

impl TagSetInfo {
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn append(&mut self, id: Tsid, series_key: Vec<u8>, filter: Option<Expr>, tags: PointTags) {
        self.ids.push(id);
        self.filters.push(filter);
        self.series_keys.push(series_key);
        self.tags_vec.push(tags);
    }

    /// Sorts all four arrays by series key, keeping rows together.
    pub fn sort_by_series_key(&mut self) {
        let n = self.len();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| self.series_keys[a].cmp(&self.series_keys[b]));
        if order.iter().enumerate().all(|(i, &o)| i == o) {
            return;
        }
        self.ids = order.iter().map(|&i| self.ids[i]).collect();
        self.filters = order.iter().map(|&i| self.filters[i].take()).collect();
        self.series_keys = order
            .iter()
            .map(|&i| std::mem::take(&mut self.series_keys[i]))
            .collect();
        self.tags_vec = order
            .iter()
            .map(|&i| std::mem::take(&mut self.tags_vec[i]))
            .collect();
    }

    pub fn reverse(&mut self) {
        self.ids.reverse();
        self.filters.reverse();
        self.series_keys.reverse();
        self.tags_vec.reverse();
    }
}

impl Reset for TagSetInfo {
    fn reset(&mut self) {
        self.ids.clear();
        self.filters.clear();
        self.series_keys.clear();
        self.tags_vec.clear();
        self.key.clear();
    }
}

impl fmt::Display for TagSetInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (id, key) in self.ids.iter().zip(&self.series_keys) {
            writeln!(f, "{} -> {}", id, String::from_utf8_lossy(key))?;
        }
        Ok(())
    }
}

/// Pool of [`TagSetInfo`]s owned by one index instance.
#[derive(Debug, Clone)]
pub struct TagSetPool {
    inner: Arc<ObjectPool<TagSetInfo>>,
}

impl TagSetPool {
    pub fn new(capacity: usize, overflow: usize) -> Self {
        Self {
            inner: Arc::new(ObjectPool::new(capacity, overflow)),
        }
    }

    pub fn get(&self) -> PooledTagSet {
        PooledTagSet {
            set: self.inner.get(),
            pool: Arc::clone(&self.inner),
        }
    }

    /// Tag sets currently parked in the pool.
    pub fn idle(&self) -> usize {
        self.inner.idle()
    }
}

impl Default for TagSetPool {
    fn default() -> Self {
        Self {
            inner: Arc::new(ObjectPool::with_default_capacity()),
        }
    }
}

/// A [`TagSetInfo`] on loan from a [`TagSetPool`]; goes back (reset) when dropped.
///
/// Wrap it in an `Arc` (see [`PooledTagSet::into_shared`]) to hand it to several stages: the
/// set returns to the pool exactly once, when the last holder lets go.
#[derive(Debug)]
pub struct PooledTagSet {
    set: TagSetInfo,
    pool: Arc<ObjectPool<TagSetInfo>>,
}

impl PooledTagSet {
    pub fn into_shared(self) -> Arc<PooledTagSet> {
        Arc::new(self)
    }
}

impl Deref for PooledTagSet {
    type Target = TagSetInfo;

    fn deref(&self) -> &TagSetInfo {
        &self.set
    }
}

impl DerefMut for PooledTagSet {
    fn deref_mut(&mut self) -> &mut TagSetInfo {
        &mut self.set
    }
}

impl Drop for PooledTagSet {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.set));
    }
}

/// Groups of series, one [`TagSetInfo`] per distinct group key.
#[derive(Debug, Default)]
pub struct GroupSeries(pub Vec<PooledTagSet>);

impl GroupSeries {
    /// Sorts groups by key and each group's series by series key.
    pub fn sort(&mut self) {
        self.0.sort_by(|a, b| a.key.cmp(&b.key));
        for set in &mut self.0 {
            set.sort_by_series_key();
        }
    }

    /// Reverses group order and the series order inside every group.
    pub fn reverse(&mut self) {
        self.0.reverse();
        for set in &mut self.0 {
            set.reverse();
        }
    }

    pub fn series_count(&self) -> usize {
        self.0.iter().map(|s| s.len()).sum()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_shared(self) -> Vec<Arc<PooledTagSet>> {
        self.0.into_iter().map(PooledTagSet::into_shared).collect()
    }
}

impl Deref for GroupSeries {
    type Target = [PooledTagSet];

    fn deref(&self) -> &[PooledTagSet] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tags_from_pairs;

    fn filled(pool: &TagSetPool, key: &str, rows: &[(Tsid, &str)]) -> PooledTagSet {
        let mut s = pool.get();
        s.key.extend_from_slice(key.as_bytes());
        for &(id, sk) in rows {
            s.append(
                id,
                sk.as_bytes().to_vec(),
                Some(Expr::tag_eq("id", &id.to_string())),
                tags_from_pairs(&[("k", sk)]),
            );
        }
        s
    }

    fn assert_lockstep(s: &TagSetInfo) {
        for i in 0..s.len() {
            let sk = String::from_utf8(s.series_keys[i].clone()).unwrap();
            assert_eq!(s.tags_vec[i][0].value, sk);
            assert_eq!(
                s.filters[i],
                Some(Expr::tag_eq("id", &s.ids[i].to_string()))
            );
        }
    }

    #[test]
    fn sort_and_reverse_keep_arrays_in_lockstep() {
        let pool = TagSetPool::new(4, 0);
        let mut gs = GroupSeries(vec![
            filled(&pool, "g2", &[(3, "c"), (1, "a")]),
            filled(&pool, "g1", &[(9, "z"), (5, "m"), (7, "b")]),
        ]);
        gs.sort();
        assert_eq!(gs[0].key, b"g1");
        assert_eq!(gs[0].ids, vec![7, 5, 9]);
        assert_lockstep(&gs[0]);
        assert_eq!(gs.series_count(), 5);

        gs.reverse();
        assert_eq!(gs[0].key, b"g2");
        assert_eq!(gs[0].ids, vec![3, 1]);
        assert_eq!(gs[1].ids, vec![9, 5, 7]);
        assert_lockstep(&gs[1]);
    }

    #[test]
    fn shared_set_returns_to_pool_once_after_last_holder() {
        let pool = TagSetPool::new(4, 0);
        let shared = filled(&pool, "g", &[(1, "a")]).into_shared();
        let other = Arc::clone(&shared);
        drop(shared);
        assert_eq!(pool.idle(), 0);
        assert_eq!(other.ids, vec![1]);
        drop(other);
        assert_eq!(pool.idle(), 1);

        let reused = pool.get();
        assert!(reused.is_empty());
        assert!(reused.key.is_empty());
    }
}
