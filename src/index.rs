//! Write side of the index: series registration, TSID allocation, measurement versions and
//! tombstones.

use crate::encoding::{
    append_version, marshal_common_prefix, marshal_series_key, marshal_tag_value,
    marshal_tag_value_no_trailing_separator, marshal_tsid, tag_key_prefix, KV_SEPARATOR_CHAR,
    NS_KEY_TO_TSID, NS_TSID_TO_KEY,
};
use crate::error::IndexError;
use crate::scanner::{IndexSearch, MeasurementVersions, ScratchPool};
use crate::series_set::SeriesIdSet;
use crate::storage::MemTable;
use crate::telemetry::{index_metrics, IndexEvent, IndexEventListener};
use crate::types::{canonicalize_tags, PointTags, Tsid};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Registers series and owns the mutable metadata queries read as snapshots.
///
/// Versions and tombstones are copy-on-write: a query clones the current `Arc` once and
/// keeps a consistent view while writers install new ones.
#[derive(Debug)]
pub struct IndexBuilder {
    next_tsid: AtomicU64,
    write_lock: Mutex<()>,
    versions: RwLock<Arc<MeasurementVersions>>,
    deleted: RwLock<Arc<SeriesIdSet>>,
    max_tsids_per_row: usize,
    listener: Arc<dyn IndexEventListener>,
}

impl IndexBuilder {
    pub fn new(first_tsid: Tsid, max_tsids_per_row: usize, listener: Arc<dyn IndexEventListener>) -> Self {
        Self {
            next_tsid: AtomicU64::new(first_tsid),
            write_lock: Mutex::new(()),
            versions: RwLock::new(Arc::new(MeasurementVersions::new())),
            deleted: RwLock::new(Arc::new(SeriesIdSet::new())),
            max_tsids_per_row: max_tsids_per_row.max(1),
            listener,
        }
    }

    pub fn next_tsid(&self) -> Tsid {
        self.next_tsid.load(Ordering::SeqCst)
    }

    pub fn deleted_snapshot(&self) -> Result<Arc<SeriesIdSet>, IndexError> {
        Ok(Arc::clone(&*self.deleted.read()?))
    }

    pub fn versions_snapshot(&self) -> Result<Arc<MeasurementVersions>, IndexError> {
        Ok(Arc::clone(&*self.versions.read()?))
    }

    /// Restores metadata loaded from a snapshot.
    pub(crate) fn restore(
        &self,
        next_tsid: Tsid,
        versions: MeasurementVersions,
        deleted: SeriesIdSet,
    ) -> Result<(), IndexError> {
        let _w = self.write_lock.lock()?;
        self.next_tsid.store(next_tsid, Ordering::SeqCst);
        *self.versions.write()? = Arc::new(versions);
        *self.deleted.write()? = Arc::new(deleted);
        Ok(())
    }

    /// Encoded series key with the measurement's current version appended.
    pub fn stored_series_key(
        &self,
        name: &str,
        tags: &PointTags,
        versions: &MeasurementVersions,
    ) -> Result<Vec<u8>, IndexError> {
        let mut key = Vec::with_capacity(64);
        marshal_series_key(&mut key, name, tags)?;
        append_version(&mut key, versions.get(name).copied().unwrap_or(0));
        Ok(key)
    }

    /// Registers every `(measurement, tags)` pair not yet indexed and returns the TSID of
    /// each input row, in order.
    ///
    /// Tags with an empty key or value are not indexed. New TSIDs sharing a tag value in
    /// this batch are packed into rows of at most `max_tsids_per_row`.
    pub fn create_index_if_not_exists(
        &self,
        table: &MemTable,
        scratch: &ScratchPool,
        rows: &[(String, PointTags)],
    ) -> Result<Vec<Tsid>, IndexError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let _w = self.write_lock.lock()?;
        let versions = self.versions_snapshot()?;
        let mut is = IndexSearch::new(
            table,
            scratch,
            self.deleted_snapshot()?,
            Arc::clone(&versions),
            Arc::clone(&self.listener),
        )
        .with_max_tsids_per_row(self.max_tsids_per_row);

        let mut out = Vec::with_capacity(rows.len());
        let mut pending: HashMap<Vec<u8>, Tsid> = HashMap::new();
        // (measurement, tag key, tag value) -> new TSIDs
        let mut postings: BTreeMap<(String, String, String), Vec<Tsid>> = BTreeMap::new();
        let mut items: Vec<Vec<u8>> = Vec::new();
        let mut created: BTreeMap<String, u64> = BTreeMap::new();

        for (name, tags) in rows {
            let mut tags: PointTags = tags
                .iter()
                .filter(|t| !t.key.is_empty() && !t.value.is_empty())
                .cloned()
                .collect();
            canonicalize_tags(&mut tags);
            let stored = self.stored_series_key(name, &tags, &versions)?;

            if let Some(&id) = pending.get(&stored) {
                out.push(id);
                continue;
            }
            match is.get_tsid_by_series_key(&stored) {
                Ok(id) => {
                    out.push(id);
                    continue;
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }

            let id = self.next_tsid.fetch_add(1, Ordering::SeqCst);
            pending.insert(stored.clone(), id);
            out.push(id);
            *created.entry(name.clone()).or_default() += 1;

            let mut kv = Vec::with_capacity(stored.len() + 16);
            marshal_common_prefix(&mut kv, NS_KEY_TO_TSID);
            marshal_tag_value_no_trailing_separator(&mut kv, &stored);
            kv.push(KV_SEPARATOR_CHAR);
            marshal_tsid(&mut kv, id);
            items.push(kv);

            let mut rev = Vec::with_capacity(stored.len() + 9);
            marshal_common_prefix(&mut rev, NS_TSID_TO_KEY);
            marshal_tsid(&mut rev, id);
            rev.extend_from_slice(&stored);
            items.push(rev);

            postings
                .entry((name.clone(), String::new(), name.clone()))
                .or_default()
                .push(id);
            for t in &tags {
                postings
                    .entry((name.clone(), t.key.clone(), t.value.clone()))
                    .or_default()
                    .push(id);
            }
        }
        drop(is);

        let mut scratch_key = Vec::new();
        for ((name, key, value), ids) in &postings {
            let mut head = Vec::with_capacity(name.len() + key.len() + value.len() + 8);
            tag_key_prefix(&mut head, name.as_bytes(), key.as_bytes(), &mut scratch_key);
            marshal_tag_value(&mut head, value.as_bytes());
            for chunk in ids.chunks(self.max_tsids_per_row) {
                let mut row = Vec::with_capacity(head.len() + chunk.len() * 8);
                row.extend_from_slice(&head);
                for &id in chunk {
                    marshal_tsid(&mut row, id);
                }
                items.push(row);
            }
        }

        table.add_items(items)?;

        for (measurement, count) in created {
            index_metrics::record_series_created(count);
            self.listener
                .on_event(IndexEvent::SeriesCreated { measurement, count });
        }
        Ok(out)
    }

    /// Adds `ids` to the tombstone set. Running queries keep the snapshot they started with.
    pub fn delete(&self, measurement: &str, ids: &SeriesIdSet) -> Result<u64, IndexError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut guard = self.deleted.write()?;
        let before = guard.len();
        let merged = guard.union(ids);
        let count = merged.len() - before;
        *guard = Arc::new(merged);
        drop(guard);

        index_metrics::record_tsids_deleted(count);
        self.listener.on_event(IndexEvent::TsidsDeleted {
            measurement: measurement.to_string(),
            count,
        });
        Ok(count)
    }

    /// Bumps the series key version of `name`; keys stored under older versions stop being
    /// listed and re-registering the same tags allocates fresh TSIDs.
    pub fn advance_measurement_version(&self, name: &str) -> Result<u16, IndexError> {
        let mut guard = self.versions.write()?;
        let mut next = (**guard).clone();
        let v = next.entry(name.to_string()).or_insert(0);
        *v = v.wrapping_add(1);
        let version = *v;
        *guard = Arc::new(next);
        drop(guard);

        self.listener.on_event(IndexEvent::MeasurementVersionAdvanced {
            measurement: name.to_string(),
            version,
        });
        Ok(version)
    }

    /// Tombstones every series of `name` and advances its version. Returns the number of
    /// newly deleted TSIDs.
    pub fn drop_measurement(
        &self,
        table: &MemTable,
        scratch: &ScratchPool,
        name: &str,
    ) -> Result<u64, IndexError> {
        let _w = self.write_lock.lock()?;
        let ids = {
            let mut is = IndexSearch::new(
                table,
                scratch,
                self.deleted_snapshot()?,
                self.versions_snapshot()?,
                Arc::clone(&self.listener),
            )
            .with_max_tsids_per_row(self.max_tsids_per_row);
            is.get_tsids_by_measurement_name(name.as_bytes())?
        };
        let count = self.delete(name, &ids)?;
        self.advance_measurement_version(name)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telemetry::noop_event_listener;
    use crate::types::tags_from_pairs;

    fn builder(max_per_row: usize) -> IndexBuilder {
        IndexBuilder::new(1, max_per_row, noop_event_listener())
    }

    #[test]
    fn existing_series_keep_their_tsid() {
        let table = MemTable::new();
        let pool = ScratchPool::new(2, 0);
        let b = builder(64);
        let rows = vec![
            ("cpu".to_string(), tags_from_pairs(&[("host", "a"), ("region", "eu")])),
            ("cpu".to_string(), tags_from_pairs(&[("region", "eu"), ("host", "a")])),
            ("cpu".to_string(), tags_from_pairs(&[("host", "b")])),
        ];
        let first = b.create_index_if_not_exists(&table, &pool, &rows).unwrap();
        assert_eq!(first, vec![1, 1, 2]);
        let again = b.create_index_if_not_exists(&table, &pool, &rows).unwrap();
        assert_eq!(again, first);
        assert_eq!(b.next_tsid(), 3);
    }

    #[test]
    fn postings_are_chunked() {
        let table = MemTable::new();
        let pool = ScratchPool::new(2, 0);
        let b = builder(4);
        let rows: Vec<_> = (0..10)
            .map(|i| {
                (
                    "m".to_string(),
                    tags_from_pairs(&[("k", "v"), ("id", i.to_string().as_str())]),
                )
            })
            .collect();
        b.create_index_if_not_exists(&table, &pool, &rows).unwrap();
        let mut is = IndexSearch::new(
            &table,
            &pool,
            b.deleted_snapshot().unwrap(),
            b.versions_snapshot().unwrap(),
            noop_event_listener(),
        );
        assert_eq!(is.get_tsids_by_measurement_name(b"m").unwrap().len(), 10);
        assert_eq!(is.series_count(b"m").unwrap(), 10);
    }

    #[test]
    fn version_advance_reallocates() {
        let table = MemTable::new();
        let pool = ScratchPool::new(2, 0);
        let b = builder(64);
        let rows = vec![("cpu".to_string(), tags_from_pairs(&[("host", "a")]))];
        let before = b.create_index_if_not_exists(&table, &pool, &rows).unwrap();
        assert_eq!(b.drop_measurement(&table, &pool, "cpu").unwrap(), 1);
        assert_eq!(b.versions_snapshot().unwrap().get("cpu"), Some(&1));
        let after = b.create_index_if_not_exists(&table, &pool, &rows).unwrap();
        assert_ne!(before, after);
        assert!(b.deleted_snapshot().unwrap().contains(before[0]));
    }

    #[test]
    fn running_query_keeps_its_tombstone_snapshot() {
        let b = builder(64);
        let snap = b.deleted_snapshot().unwrap();
        let ids: SeriesIdSet = [5].into_iter().collect();
        assert_eq!(b.delete("cpu", &ids).unwrap(), 1);
        assert!(!snap.contains(5));
        assert!(b.deleted_snapshot().unwrap().contains(5));
        assert_eq!(b.delete("cpu", &ids).unwrap(), 0);
    }
}
