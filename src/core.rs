//! Index facade: configuration, snapshot lifecycle and the public query surface.

use crate::buffer::default_pool_capacity;
use crate::encoding::{parse_series_key, split_version};
use crate::error::IndexError;
use crate::expr::Expr;
use crate::index::IndexBuilder;
use crate::persistence::{IndexMeta, IndexSnapshotter};
use crate::scanner::{IndexSearch, ScratchPool};
use crate::series_set::SeriesIdIterator;
use crate::storage::MemTable;
use crate::tagset::{GroupSeries, PooledTagSet, TagSetPool};
use crate::telemetry::{index_metrics, noop_event_listener, IndexEvent, IndexEventListener};
use crate::types::{PointTags, TimeRange, Tsid};

use rayon::prelude::*;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Configuration options for [`TsIndex`].
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Directory for index snapshots (`<data_dir>/index`).
    pub data_dir: PathBuf,
    /// Whether snapshots are loaded on open and can be written with [`TsIndex::snapshot`].
    pub enable_snapshots: bool,
    /// Number of snapshot files kept after a successful snapshot.
    pub snapshots_to_keep: usize,
    /// Upper bound of TSIDs packed into one written `tag -> tsids` row.
    pub max_tsids_per_row: usize,
    /// First TSID handed out by an empty index.
    pub first_tsid: Tsid,
    /// Lock-free capacity of the tag set pool; the overflow list has the same bound.
    pub tag_set_pool_capacity: usize,
    /// Capacity of the per-query scratch pool.
    pub scratch_pool_capacity: usize,
    /// Structured event hook for observability (no-op by default).
    pub event_listener: Arc<dyn IndexEventListener>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        IndexConfig {
            data_dir: PathBuf::from("./data"),
            enable_snapshots: false,
            snapshots_to_keep: 2,
            max_tsids_per_row: crate::encoding::MAX_TSIDS_PER_ROW,
            first_tsid: 1,
            tag_set_pool_capacity: default_pool_capacity(),
            scratch_pool_capacity: default_pool_capacity(),
            event_listener: noop_event_listener(),
        }
    }
}

/// Partial configuration read from a TOML file. Missing keys keep their defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IndexFileConfig {
    pub data_dir: Option<PathBuf>,
    pub enable_snapshots: Option<bool>,
    pub snapshots_to_keep: Option<usize>,
    pub max_tsids_per_row: Option<usize>,
    pub first_tsid: Option<Tsid>,
    pub tag_set_pool_capacity: Option<usize>,
    pub scratch_pool_capacity: Option<usize>,
}

impl IndexConfig {
    /// Applies the keys present in `file` on top of `self`.
    pub fn merge(mut self, file: IndexFileConfig) -> Result<Self, IndexError> {
        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = file.enable_snapshots {
            self.enable_snapshots = v;
        }
        if let Some(v) = file.snapshots_to_keep {
            self.snapshots_to_keep = v;
        }
        if let Some(v) = file.max_tsids_per_row {
            self.max_tsids_per_row = v;
        }
        if let Some(v) = file.first_tsid {
            self.first_tsid = v;
        }
        if let Some(v) = file.tag_set_pool_capacity {
            self.tag_set_pool_capacity = v;
        }
        if let Some(v) = file.scratch_pool_capacity {
            self.scratch_pool_capacity = v;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn from_toml_str(s: &str) -> Result<Self, IndexError> {
        let file: IndexFileConfig = toml::from_str(s)
            .map_err(|e| IndexError::ConfigError(format!("invalid index config: {}", e)))?;
        IndexConfig::default().merge(file)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, IndexError> {
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            IndexError::ConfigError(format!(
                "failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        if self.max_tsids_per_row == 0 {
            return Err(IndexError::ConfigError(
                "max_tsids_per_row must be at least 1".to_string(),
            ));
        }
        if self.enable_snapshots && self.snapshots_to_keep == 0 {
            return Err(IndexError::ConfigError(
                "snapshots_to_keep must be at least 1 when snapshots are enabled".to_string(),
            ));
        }
        Ok(())
    }
}

/// Options of a grouped series search.
#[derive(Debug, Clone)]
pub struct SeriesSearchOptions {
    pub condition: Option<Expr>,
    /// Tag keys that form the group key, in order.
    pub dimensions: Vec<String>,
    pub ascending: bool,
    pub time_range: TimeRange,
}

impl Default for SeriesSearchOptions {
    fn default() -> Self {
        Self {
            condition: None,
            dimensions: Vec::new(),
            ascending: true,
            time_range: TimeRange::all(),
        }
    }
}

/// Tag-based inverted index over an in-memory sorted table.
#[derive(Debug)]
pub struct TsIndex {
    table: Arc<MemTable>,
    builder: IndexBuilder,
    scratch: ScratchPool,
    tag_sets: TagSetPool,
    snapshotter: Option<IndexSnapshotter>,
    /// Timestamp of the newest snapshot; file names must stay strictly increasing.
    last_snapshot_ts: AtomicU64,
    config: IndexConfig,
}

impl TsIndex {
    /// Creates an index with the provided configuration.
    ///
    /// When snapshots are enabled the newest snapshot under `<data_dir>/index` is loaded.
    ///
    /// # Errors
    /// Returns an error if the configuration is invalid, the snapshot directory cannot be
    /// created, or the newest snapshot is unreadable or corrupt.
    pub fn with_config(config: IndexConfig) -> Result<Self, IndexError> {
        config.validate()?;
        let mut index = Self::build(config);
        if index.config.enable_snapshots {
            let dir = index.config.data_dir.join("index");
            index.snapshotter = Some(IndexSnapshotter::new(dir)?);
            index.load_latest_snapshot()?;
        }
        Ok(index)
    }

    /// Memory-only index with default settings.
    pub fn in_memory() -> Self {
        Self::build(IndexConfig::default())
    }

    fn build(config: IndexConfig) -> Self {
        let builder = IndexBuilder::new(
            config.first_tsid,
            config.max_tsids_per_row,
            Arc::clone(&config.event_listener),
        );
        Self {
            table: Arc::new(MemTable::new()),
            builder,
            scratch: ScratchPool::new(config.scratch_pool_capacity, config.scratch_pool_capacity),
            tag_sets: TagSetPool::new(config.tag_set_pool_capacity, config.tag_set_pool_capacity),
            snapshotter: None,
            last_snapshot_ts: AtomicU64::new(0),
            config,
        }
    }

    fn load_latest_snapshot(&self) -> Result<(), IndexError> {
        let Some(snap) = &self.snapshotter else {
            return Ok(());
        };
        let Some(loaded) = snap.load_latest_snapshot()? else {
            return Ok(());
        };
        let items = loaded.items.len() as u64;
        self.last_snapshot_ts.fetch_max(loaded.timestamp, Ordering::SeqCst);
        self.table.replace(loaded.items);
        self.builder.restore(
            loaded.meta.next_tsid,
            loaded.meta.versions_map(),
            loaded.meta.deleted_set()?,
        )?;
        self.config.event_listener.on_event(IndexEvent::SnapshotLoaded {
            path: loaded.path,
            items,
        });
        Ok(())
    }

    fn search(&self) -> Result<IndexSearch<'_>, IndexError> {
        Ok(IndexSearch::new(
            &*self.table,
            &self.scratch,
            self.builder.deleted_snapshot()?,
            self.builder.versions_snapshot()?,
            Arc::clone(&self.config.event_listener),
        )
        .with_max_tsids_per_row(self.config.max_tsids_per_row))
    }

    /// Registers series that are not indexed yet; returns the TSID of every input row.
    pub fn create_index_if_not_exists(&self, rows: &[(String, PointTags)]) -> Result<Vec<Tsid>, IndexError> {
        self.builder
            .create_index_if_not_exists(&self.table, &self.scratch, rows)
    }

    /// TSIDs (ascending) of `name` whose tags satisfy `condition`.
    ///
    /// Parts of the condition the index cannot evaluate (field comparisons, unsupported
    /// operators) widen to every series, so the result is a superset the caller refines.
    /// Tombstoned TSIDs are never returned. An unknown measurement yields an empty list.
    pub fn search_series_ids(
        &self,
        name: &str,
        condition: Option<&Expr>,
        tr: TimeRange,
    ) -> Result<Vec<Tsid>, IndexError> {
        let start = Instant::now();
        let ids = self.search()?.search_tsids(name.as_bytes(), condition, tr)?;
        index_metrics::record_query(start.elapsed());
        Ok(ids.to_vec())
    }

    /// Number of series of `name`; with a condition, the number of live matching series.
    ///
    /// Without a condition this counts the TSIDs of the measurement rows, tombstoned ones
    /// included.
    pub fn series_cardinality(
        &self,
        name: &str,
        condition: Option<&Expr>,
        tr: TimeRange,
    ) -> Result<u64, IndexError> {
        let mut is = self.search()?;
        match condition {
            None => is.series_count(name.as_bytes()),
            Some(c) => Ok(is.search_tsids(name.as_bytes(), Some(c), tr)?.len()),
        }
    }

    /// Sorted distinct values for each of `tag_keys`, restricted to live series matching
    /// `condition`. Keys are scanned in parallel, each worker with its own cursor.
    pub fn search_tag_values(
        &self,
        name: &str,
        tag_keys: &[&str],
        condition: Option<&Expr>,
    ) -> Result<Vec<Vec<String>>, IndexError> {
        let eligible = match condition {
            Some(c) => {
                let set = self.search()?.search_tsids_internal(name.as_bytes(), Some(c))?;
                if set.is_empty() {
                    return Ok(vec![Vec::new(); tag_keys.len()]);
                }
                Some(set)
            }
            None => None,
        };
        tag_keys
            .par_iter()
            .map(|key| {
                let mut is = self.search()?;
                let values =
                    is.search_tag_values_by_single_key(name.as_bytes(), key.as_bytes(), eligible.as_ref())?;
                Ok(values.into_iter().collect())
            })
            .collect()
    }

    /// Number of distinct live values of `tag_key` in `name`.
    pub fn search_tag_values_cardinality(&self, name: &str, tag_key: &str) -> Result<u64, IndexError> {
        let values = self
            .search()?
            .search_tag_values_by_single_key(name.as_bytes(), tag_key.as_bytes(), None)?;
        Ok(values.len() as u64)
    }

    /// Every live series key in the index (no version trailer).
    pub fn search_all_series_keys(&self) -> Result<Vec<Vec<u8>>, IndexError> {
        self.search()?.get_all_series_keys()
    }

    /// Series keys (no version trailer) of the live series of `name` matching `condition`.
    pub fn search_series_keys(&self, name: &str, condition: Option<&Expr>) -> Result<Vec<Vec<u8>>, IndexError> {
        let mut is = self.search()?;
        let ids = is.search_tsids(name.as_bytes(), condition, TimeRange::all())?;
        let mut keys = Vec::with_capacity(ids.len() as usize);
        for id in ids.iter() {
            match is.search_series_key(id) {
                Ok(stored) => keys.push(split_version(&stored)?.0.to_vec()),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(keys)
    }

    /// TSID of the live series `(name, tags)`.
    ///
    /// # Errors
    /// [`IndexError::NotFound`] when the series was never registered under the current
    /// measurement version or has been deleted.
    pub fn get_series_id_by_series_key(&self, name: &str, tags: &PointTags) -> Result<Tsid, IndexError> {
        let mut is = self.search()?;
        let mut canonical: PointTags = tags
            .iter()
            .filter(|t| !t.key.is_empty() && !t.value.is_empty())
            .cloned()
            .collect();
        crate::types::canonicalize_tags(&mut canonical);
        let stored = self
            .builder
            .stored_series_key(name, &canonical, &is.versions)?;
        let id = is.get_tsid_by_series_key(&stored)?;
        if is.deleted.contains(id) {
            return Err(IndexError::NotFound(format!("series {} of {} is deleted", id, name)));
        }
        Ok(id)
    }

    /// Lazy series of `name` matching `condition`, each carrying the residual filter the
    /// caller still has to apply. `None` when the measurement does not exist.
    pub fn measurement_series_by_expr_iterator(
        &self,
        name: &str,
        condition: Option<&Expr>,
        tr: TimeRange,
        single_series: Option<Tsid>,
    ) -> Result<Option<SeriesIdIterator>, IndexError> {
        self.search()?
            .measurement_series_by_expr_iterator(name.as_bytes(), condition, tr, single_series)
    }

    /// Resolves the series of `name` and groups them by `opts.dimensions`.
    ///
    /// Groups are ordered by group key and series by series key, both reversed when
    /// `opts.ascending` is false. Every [`PooledTagSet`] returns to the index pool on drop.
    pub fn search_series_with_opts(
        &self,
        name: &str,
        opts: &SeriesSearchOptions,
    ) -> Result<GroupSeries, IndexError> {
        let mut is = self.search()?;
        let Some(it) = is.measurement_series_by_expr_iterator(
            name.as_bytes(),
            opts.condition.as_ref(),
            opts.time_range,
            None,
        )?
        else {
            return Ok(GroupSeries::default());
        };

        let mut groups: HashMap<Vec<u8>, PooledTagSet> = HashMap::new();
        let mut group_key = Vec::new();
        for elem in it {
            let stored = match is.search_series_key(elem.id) {
                Ok(k) => k,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let (key, _) = split_version(&stored)?;
            let (_, tags) = parse_series_key(key)?;

            group_key.clear();
            for (i, dim) in opts.dimensions.iter().enumerate() {
                if i > 0 {
                    group_key.push(b',');
                }
                group_key.extend_from_slice(dim.as_bytes());
                group_key.push(b'=');
                if let Some(t) = tags.iter().find(|t| &t.key == dim) {
                    group_key.extend_from_slice(t.value.as_bytes());
                }
            }

            let set = groups.entry(group_key.clone()).or_insert_with(|| {
                let mut s = self.tag_sets.get();
                s.key.extend_from_slice(&group_key);
                s
            });
            set.append(elem.id, key.to_vec(), elem.expr, tags);
        }

        let mut gs = GroupSeries(groups.into_values().collect());
        gs.sort();
        if !opts.ascending {
            gs.reverse();
        }
        Ok(gs)
    }

    /// Tombstones the live series of `name` matching `condition`. Returns the number of
    /// newly deleted TSIDs.
    pub fn delete_tsids(&self, name: &str, condition: Option<&Expr>, tr: TimeRange) -> Result<u64, IndexError> {
        let ids = self.search()?.search_tsids(name.as_bytes(), condition, tr)?;
        self.builder.delete(name, &ids)
    }

    pub fn advance_measurement_version(&self, name: &str) -> Result<u16, IndexError> {
        self.builder.advance_measurement_version(name)
    }

    /// Deletes every series of `name` and advances its version.
    pub fn drop_measurement(&self, name: &str) -> Result<u64, IndexError> {
        self.builder
            .drop_measurement(&self.table, &self.scratch, name)
    }

    /// Writes a snapshot of rows and metadata, then prunes old snapshots.
    ///
    /// # Errors
    /// `ConfigError` when snapshots are disabled; I/O and serialization errors otherwise.
    pub fn snapshot(&self) -> Result<PathBuf, IndexError> {
        let Some(snap) = &self.snapshotter else {
            return Err(IndexError::ConfigError("Snapshots are not enabled".to_string()));
        };
        let res = self.write_snapshot(snap);
        match &res {
            Ok((path, items)) => self.config.event_listener.on_event(IndexEvent::SnapshotWritten {
                path: path.clone(),
                items: *items,
            }),
            Err(e) => self
                .config
                .event_listener
                .on_event(IndexEvent::SnapshotFailed { error: e.to_string() }),
        }
        res.map(|(path, _)| path)
    }

    fn write_snapshot(&self, snap: &IndexSnapshotter) -> Result<(PathBuf, u64), IndexError> {
        // Rows first: metadata read afterwards can only be ahead of them.
        let items = self.table.snapshot()?;
        let versions = self.builder.versions_snapshot()?;
        let deleted = self.builder.deleted_snapshot()?;
        let meta = IndexMeta::new(self.builder.next_tsid(), &*versions, &*deleted)?;
        let ts = self.next_snapshot_ts();
        let path = snap.create_snapshot(&items, &meta, ts)?;
        snap.prune(self.config.snapshots_to_keep)?;
        Ok((path, items.len() as u64))
    }

    fn next_snapshot_ts(&self) -> u64 {
        let now = now_ns();
        let prev = self
            .last_snapshot_ts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(now.max(last + 1)))
            .unwrap_or(now);
        now.max(prev + 1)
    }

    /// The underlying sorted table.
    pub fn substrate(&self) -> &MemTable {
        &self.table
    }

    pub fn get_config(&self) -> &IndexConfig {
        &self.config
    }
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::tags_from_pairs;

    #[test]
    fn toml_overrides_defaults() {
        let cfg = IndexConfig::from_toml_str(
            r#"
            data_dir = "/tmp/tsi"
            max_tsids_per_row = 16
            enable_snapshots = true
            "#,
        )
        .unwrap();
        assert_eq!(cfg.data_dir, PathBuf::from("/tmp/tsi"));
        assert_eq!(cfg.max_tsids_per_row, 16);
        assert!(cfg.enable_snapshots);
        assert_eq!(cfg.first_tsid, 1);
    }

    #[test]
    fn bad_config_is_rejected() {
        assert!(matches!(
            IndexConfig::from_toml_str("max_tsids_per_row = 0"),
            Err(IndexError::ConfigError(_))
        ));
        assert!(matches!(
            IndexConfig::from_toml_str("no_such_key = 1"),
            Err(IndexError::ConfigError(_))
        ));
    }

    #[test]
    fn snapshot_requires_configuration() {
        let idx = TsIndex::in_memory();
        assert!(matches!(idx.snapshot(), Err(IndexError::ConfigError(_))));
    }

    #[test]
    fn grouped_search_orders_groups_and_series() {
        let idx = TsIndex::in_memory();
        idx.create_index_if_not_exists(&[
            ("cpu".to_string(), tags_from_pairs(&[("host", "b"), ("dc", "x")])),
            ("cpu".to_string(), tags_from_pairs(&[("host", "a"), ("dc", "y")])),
            ("cpu".to_string(), tags_from_pairs(&[("host", "c"), ("dc", "x")])),
        ])
        .unwrap();
        let opts = SeriesSearchOptions {
            dimensions: vec!["dc".to_string()],
            ..Default::default()
        };
        let gs = idx.search_series_with_opts("cpu", &opts).unwrap();
        assert_eq!(gs.len(), 2);
        assert_eq!(gs[0].key, b"dc=x");
        assert_eq!(gs[0].len(), 2);
        assert_eq!(gs.series_count(), 3);

        let desc = idx
            .search_series_with_opts(
                "cpu",
                &SeriesSearchOptions {
                    ascending: false,
                    ..opts
                },
            )
            .unwrap();
        assert_eq!(desc[0].key, b"dc=y");
        assert_eq!(desc[1].ids, gs[0].ids.iter().rev().copied().collect::<Vec<_>>());
    }
}
