//! Row scanning over the substrate: tag filter resolution, measurement lookups and
//! series key retrieval. One [`IndexSearch`] serves one query and owns its cursor.

use crate::buffer::{BufferPool, ObjectPool, PooledBuf, Reset};
use crate::encoding::{
    marshal_common_prefix, marshal_composite_name_prefix, marshal_composite_tag_key,
    marshal_tag_value, marshal_tag_value_no_trailing_separator, marshal_tsid, measurement_name,
    separator_successor, split_version, unmarshal_tsid, TagToTsidsRowParser, KV_SEPARATOR_CHAR,
    MAX_TSIDS_PER_ROW, NS_KEY_TO_TSID, NS_TAG_TO_TSIDS, NS_TSID_TO_KEY, TAG_SEPARATOR_CHAR,
    TSID_SIZE,
};
use crate::error::IndexError;
use crate::series_set::SeriesIdSet;
use crate::storage::{Substrate, TableCursor};
use crate::tag_filter::TagFilter;
use crate::telemetry::{index_metrics, IndexEventListener};
use crate::types::Tsid;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Per-query scratch buffers, leased from the index and returned when the search drops.
#[derive(Debug, Default)]
pub struct SearchScratch {
    kb: Vec<u8>,
    composite: Vec<u8>,
    prev_matching_suffix: Vec<u8>,
    mp: TagToTsidsRowParser,
}

impl Reset for SearchScratch {
    fn reset(&mut self) {
        self.kb.clear();
        self.composite.clear();
        self.prev_matching_suffix.clear();
        self.mp.reset();
    }
}

/// Per-index pools backing [`IndexSearch`]: whole scratch sets plus loose key buffers.
#[derive(Debug)]
pub struct ScratchPool {
    scratch: ObjectPool<SearchScratch>,
    buffers: BufferPool,
}

impl ScratchPool {
    pub fn new(capacity: usize, overflow_cap: usize) -> Self {
        Self {
            scratch: ObjectPool::new(capacity, overflow_cap),
            buffers: BufferPool::new(capacity, overflow_cap),
        }
    }

    pub fn get(&self) -> SearchScratch {
        self.scratch.get()
    }

    pub fn put(&self, s: SearchScratch) {
        self.scratch.put(s);
    }

    /// Scratch sets currently parked.
    pub fn idle(&self) -> usize {
        self.scratch.idle()
    }

    pub fn buffers(&self) -> &BufferPool {
        &self.buffers
    }
}

/// Measurement name -> current series key version.
pub type MeasurementVersions = HashMap<String, u16>;

/// State of one query against the index.
pub struct IndexSearch<'a> {
    ts: Box<dyn TableCursor + Send + 'a>,
    scratch: SearchScratch,
    pool: &'a ScratchPool,
    max_tsids_per_row: usize,
    pub(crate) deleted: Arc<SeriesIdSet>,
    pub(crate) versions: Arc<MeasurementVersions>,
    pub(crate) listener: Arc<dyn IndexEventListener>,
}

impl Drop for IndexSearch<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.scratch));
    }
}

fn find_separator(item: &[u8], tail: &[u8]) -> Result<usize, IndexError> {
    tail.iter()
        .position(|&b| b == TAG_SEPARATOR_CHAR)
        .ok_or_else(|| {
            IndexError::corruption(
                format!(
                    "invalid tag->tsids row: cannot find tag separator {}",
                    TAG_SEPARATOR_CHAR
                ),
                item,
            )
        })
}

impl<'a> IndexSearch<'a> {
    pub fn new(
        substrate: &'a dyn Substrate,
        pool: &'a ScratchPool,
        deleted: Arc<SeriesIdSet>,
        versions: Arc<MeasurementVersions>,
        listener: Arc<dyn IndexEventListener>,
    ) -> Self {
        Self {
            ts: substrate.cursor(),
            scratch: pool.get(),
            pool,
            max_tsids_per_row: MAX_TSIDS_PER_ROW,
            deleted,
            versions,
            listener,
        }
    }

    /// Row capacity the writer chunks TSID lists by; drives the skip-ahead heuristics.
    pub fn with_max_tsids_per_row(mut self, n: usize) -> Self {
        self.max_tsids_per_row = n.max(1);
        self
    }

    fn cursor_error(&mut self, prefix: &[u8]) -> Result<(), IndexError> {
        match self.ts.error() {
            Some(e) => Err(IndexError::substrate(prefix, e)),
            None => Ok(()),
        }
    }

    // --- tag filters ---

    /// Resolves `tf`, answering a negative filter as `all(measurement) \ positive`.
    pub fn get_tsids_by_tag_filter(&mut self, tf: &TagFilter) -> Result<SeriesIdSet, IndexError> {
        if !tf.is_negative {
            return self.search_tsids_by_tag_filter(tf);
        }
        let all = self.get_tsids_by_measurement_name(&tf.name)?;
        let matched = self.search_tsids_by_tag_filter(&tf.positive())?;
        Ok(all.subtract(&matched))
    }

    /// Resolves a positive tag filter through the fast or slow path.
    pub fn search_tsids_by_tag_filter(&mut self, tf: &TagFilter) -> Result<SeriesIdSet, IndexError> {
        if tf.is_negative {
            return Err(IndexError::Internal(format!(
                "negative tag filter passed to the row scanner: {}",
                tf
            )));
        }
        let mut tsids = SeriesIdSet::new();
        if !tf.or_suffixes.is_empty() {
            self.update_tsids_by_or_suffixes(tf, &mut tsids)?;
            return Ok(tsids);
        }
        self.get_tsids_for_tag_filter_slow(tf, None, |id| tsids.add(id))?;
        Ok(tsids)
    }

    /// Scans every row under `tf.prefix` and calls `f` for each TSID of a matching value.
    ///
    /// With a `filter`, rows sharing no TSID with it are skipped without evaluating the
    /// matcher, and only TSIDs in the filter are reported.
    pub fn get_tsids_for_tag_filter_slow(
        &mut self,
        tf: &TagFilter,
        filter: Option<&SeriesIdSet>,
        mut f: impl FnMut(Tsid),
    ) -> Result<(), IndexError> {
        if !tf.or_suffixes.is_empty() {
            return Err(IndexError::Internal(format!(
                "slow path called for a filter with literal values: {}",
                tf
            )));
        }

        let full_row = self.max_tsids_per_row;
        let SearchScratch {
            kb,
            prev_matching_suffix,
            mp,
            ..
        } = &mut self.scratch;
        mp.reset();
        prev_matching_suffix.clear();
        let mut prev_match = false;
        let mut rows = 0u64;
        let mut skips = 0u64;

        let prefix = &tf.prefix;
        self.ts.seek(&tf.seek_prefix);
        while self.ts.next_item() {
            let item = self.ts.item();
            if !item.starts_with(&tf.seek_prefix) {
                break;
            }
            rows += 1;
            let tail = &item[prefix.len()..];
            let n = find_separator(item, tail)?;
            let suffix = &tail[..n + 1];
            let tail = &tail[n + 1..];
            mp.init_only_tail(item, tail)?;
            mp.parse_tsids();

            if prev_match && suffix == prev_matching_suffix.as_slice() {
                // Same value as the previous matching row.
                for &id in &mp.tsids {
                    if filter.map_or(true, |flt| flt.contains(id)) {
                        f(id);
                    }
                }
                continue;
            }
            if let Some(flt) = filter {
                if !mp.has_common_tsids(flt) {
                    continue;
                }
            }

            if !tf.match_suffix(suffix)? {
                prev_match = false;
                if mp.tsids_len() < full_row / 2 {
                    // A short row is likely the last one of its value.
                    continue;
                }
                kb.clear();
                kb.extend_from_slice(&item[..item.len() - tail.len()]);
                separator_successor(kb)?;
                skips += 1;
                self.ts.seek(kb);
                continue;
            }

            prev_match = true;
            prev_matching_suffix.clear();
            prev_matching_suffix.extend_from_slice(suffix);
            for &id in &mp.tsids {
                if filter.map_or(true, |flt| flt.contains(id)) {
                    f(id);
                }
            }
        }
        index_metrics::record_slow_path_scan(rows, skips);
        self.cursor_error(&tf.prefix)
    }

    fn update_tsids_by_or_suffixes(
        &mut self,
        tf: &TagFilter,
        tsids: &mut SeriesIdSet,
    ) -> Result<(), IndexError> {
        let mut kb = std::mem::take(&mut self.scratch.kb);
        let mut res = Ok(());
        for suffix in &tf.or_suffixes {
            kb.clear();
            kb.extend_from_slice(&tf.prefix);
            kb.extend_from_slice(suffix);
            kb.push(TAG_SEPARATOR_CHAR);
            res = self.update_tsids_by_or_suffix(&kb, tsids);
            if res.is_err() {
                break;
            }
        }
        self.scratch.kb = kb;
        index_metrics::record_fast_path_scan(tf.or_suffixes.len() as u64);
        res
    }

    /// Collects the TSIDs of every row starting with `prefix` (`prefix ++ esc(value) ++ SEP`).
    fn update_tsids_by_or_suffix(
        &mut self,
        prefix: &[u8],
        tsids: &mut SeriesIdSet,
    ) -> Result<(), IndexError> {
        let mp = &mut self.scratch.mp;
        mp.reset();
        self.ts.seek(prefix);
        while self.ts.next_item() {
            let item = self.ts.item();
            if !item.starts_with(prefix) {
                break;
            }
            mp.init_only_tail(item, &item[prefix.len()..])?;
            mp.parse_tsids();
            tsids.extend_from_slice(&mp.tsids);
        }
        self.cursor_error(prefix)
    }

    /// Collects the TSIDs of every row under `prefix`, skipping `tag_seps` separators before
    /// the TSID list.
    pub fn update_tsids_for_prefix(
        &mut self,
        prefix: &[u8],
        tsids: &mut SeriesIdSet,
        tag_seps: usize,
    ) -> Result<(), IndexError> {
        let mp = &mut self.scratch.mp;
        self.ts.seek(prefix);
        while self.ts.next_item() {
            let item = self.ts.item();
            if !item.starts_with(prefix) {
                break;
            }
            let mut tail = &item[prefix.len()..];
            for _ in 0..tag_seps {
                let n = find_separator(item, tail)?;
                tail = &tail[n + 1..];
            }
            mp.init_only_tail(item, tail)?;
            mp.parse_tsids();
            tsids.extend_from_slice(&mp.tsids);
        }
        self.cursor_error(prefix)
    }

    // --- measurements ---

    fn measurement_prefix(&mut self, name: &[u8], trailing_separator: bool) -> PooledBuf<'a> {
        let pool: &'a ScratchPool = self.pool;
        let mut prefix = pool.buffers().lease();
        let composite = &mut self.scratch.composite;
        composite.clear();
        marshal_composite_name_prefix(composite, name);
        marshal_common_prefix(&mut prefix, NS_TAG_TO_TSIDS);
        if trailing_separator {
            marshal_tag_value(&mut prefix, composite);
        } else {
            marshal_tag_value_no_trailing_separator(&mut prefix, composite);
        }
        prefix
    }

    /// Every TSID of the measurement, taken from all of its tag rows.
    pub fn get_tsids_by_measurement_name(&mut self, name: &[u8]) -> Result<SeriesIdSet, IndexError> {
        let prefix = self.measurement_prefix(name, false);
        let mut tsids = SeriesIdSet::new();
        self.update_tsids_for_prefix(&prefix, &mut tsids, 2)?;
        Ok(tsids)
    }

    pub fn contains_measurement(&mut self, name: &[u8]) -> Result<bool, IndexError> {
        let prefix = self.measurement_prefix(name, false);
        self.ts.seek(&prefix);
        if self.ts.next_item() {
            return Ok(self.ts.item().starts_with(&prefix));
        }
        self.cursor_error(&prefix)?;
        Ok(false)
    }

    /// Number of TSIDs in the measurement rows (empty tag key) of `name`.
    pub fn series_count(&mut self, name: &[u8]) -> Result<u64, IndexError> {
        let prefix = self.measurement_prefix(name, true);
        self.get_series_count(&prefix)
    }

    fn get_series_count(&mut self, prefix: &[u8]) -> Result<u64, IndexError> {
        let mp = &mut self.scratch.mp;
        self.ts.seek(prefix);
        let mut count = 0u64;
        while self.ts.next_item() {
            let item = self.ts.item();
            if !item.starts_with(prefix) {
                break;
            }
            let tail = &item[prefix.len()..];
            let n = find_separator(item, tail)?;
            mp.init_only_tail(item, &tail[n + 1..])?;
            count += mp.tsids_len() as u64;
        }
        self.cursor_error(prefix)?;
        Ok(count)
    }

    // --- series keys ---

    /// TSID of a stored (versioned) series key; `NotFound` when absent.
    pub fn get_tsid_by_series_key(&mut self, stored_key: &[u8]) -> Result<Tsid, IndexError> {
        let kb = &mut self.scratch.kb;
        kb.clear();
        marshal_common_prefix(kb, NS_KEY_TO_TSID);
        marshal_tag_value_no_trailing_separator(kb, stored_key);
        kb.push(KV_SEPARATOR_CHAR);
        self.ts.seek(kb);
        if self.ts.next_item() {
            let item = self.ts.item();
            if item.starts_with(kb) {
                return unmarshal_tsid(&item[kb.len()..]);
            }
        } else {
            let kb = kb.clone();
            self.cursor_error(&kb)?;
        }
        Err(IndexError::NotFound(
            "no TSID for the given series key".to_string(),
        ))
    }

    /// Stored series key (with version trailer) of `tsid`; `NotFound` when absent.
    pub fn search_series_key(&mut self, tsid: Tsid) -> Result<Vec<u8>, IndexError> {
        let kb = &mut self.scratch.kb;
        kb.clear();
        marshal_common_prefix(kb, NS_TSID_TO_KEY);
        marshal_tsid(kb, tsid);
        self.ts.seek(kb);
        if self.ts.next_item() {
            let item = self.ts.item();
            if item.starts_with(kb) {
                return Ok(item[kb.len()..].to_vec());
            }
        } else {
            let kb = kb.clone();
            self.cursor_error(&kb)?;
        }
        Err(IndexError::NotFound(format!("series key for tsid {}", tsid)))
    }

    /// Every live series key (version trailer stripped), skipping tombstoned TSIDs and keys
    /// written under an older measurement version.
    pub fn get_all_series_keys(&mut self) -> Result<Vec<Vec<u8>>, IndexError> {
        let prefix = [NS_TSID_TO_KEY];
        let mut keys = Vec::with_capacity(1024);
        self.ts.seek(&prefix);
        while self.ts.next_item() {
            let item = self.ts.item();
            if !item.starts_with(&prefix) {
                break;
            }
            let tail = &item[1..];
            let tsid = unmarshal_tsid(tail)?;
            if self.deleted.contains(tsid) {
                continue;
            }
            let (key, key_version) = split_version(&tail[TSID_SIZE..])?;
            let name = measurement_name(key)?;
            let current = std::str::from_utf8(name)
                .ok()
                .and_then(|n| self.versions.get(n));
            if let Some(&version) = current {
                if key_version != version {
                    continue;
                }
            }
            keys.push(key.to_vec());
        }
        self.cursor_error(&prefix)?;
        Ok(keys)
    }

    // --- tag values ---

    /// Distinct values of `tag_key` in `name` that still have a live, eligible series.
    pub fn search_tag_values_by_single_key(
        &mut self,
        name: &[u8],
        tag_key: &[u8],
        eligible: Option<&SeriesIdSet>,
    ) -> Result<BTreeSet<String>, IndexError> {
        let deleted = Arc::clone(&self.deleted);
        let full_row = self.max_tsids_per_row;
        let pool: &'a ScratchPool = self.pool;
        let mut prefix = pool.buffers().lease();
        let SearchScratch {
            kb, composite, mp, ..
        } = &mut self.scratch;
        mp.reset();
        composite.clear();
        marshal_composite_tag_key(composite, name, tag_key);
        marshal_common_prefix(&mut prefix, NS_TAG_TO_TSIDS);
        marshal_tag_value(&mut prefix, composite);

        let mut values = BTreeSet::new();
        self.ts.seek(&prefix);
        while self.ts.next_item() {
            let item = self.ts.item();
            if !item.starts_with(&prefix) {
                break;
            }
            mp.init(item, NS_TAG_TO_TSIDS)?;
            if !mp.is_expected_tag(&deleted, eligible) {
                continue;
            }
            values.insert(String::from_utf8_lossy(&mp.value).into_owned());

            if mp.tsids_len() < full_row {
                continue;
            }
            // Following rows may repeat this value; jump past them.
            kb.clear();
            kb.extend_from_slice(&prefix);
            marshal_tag_value(kb, &mp.value);
            separator_successor(kb)?;
            self.ts.seek(kb);
        }
        self.cursor_error(&prefix)?;
        Ok(values)
    }
}
