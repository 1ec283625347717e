use std::io;
use std::sync::Arc;

use ugnos_tsi::encoding::{marshal_tag_value, marshal_tsid, tag_key_prefix};
use ugnos_tsi::error::SubstrateError;
use ugnos_tsi::scanner::{MeasurementVersions, ScratchPool};
use ugnos_tsi::telemetry::noop_event_listener;
use ugnos_tsi::types::tags_from_pairs;
use ugnos_tsi::{
    Expr, IndexConfig, IndexError, IndexSearch, MemTable, SeriesIdSet, Substrate, TableCursor,
    TagFilter, TimeRange, TsIndex, Tsid,
};

/// Cursor over a fixed item list that fails once `fail_after` items were handed out.
struct FaultyCursor {
    items: Arc<Vec<Vec<u8>>>,
    next: usize,
    current: usize,
    served: usize,
    fail_after: usize,
    failed: bool,
}

impl TableCursor for FaultyCursor {
    fn seek(&mut self, prefix: &[u8]) {
        self.next = self.items.partition_point(|it| it.as_slice() < prefix);
    }

    fn next_item(&mut self) -> bool {
        if self.served >= self.fail_after {
            self.failed = true;
            return false;
        }
        if self.next >= self.items.len() {
            return false;
        }
        self.current = self.next;
        self.next += 1;
        self.served += 1;
        true
    }

    fn item(&self) -> &[u8] {
        &self.items[self.current]
    }

    fn error(&mut self) -> Option<SubstrateError> {
        if self.failed {
            Some(Box::new(io::Error::new(io::ErrorKind::Other, "read failed")))
        } else {
            None
        }
    }
}

struct FaultyTable {
    items: Arc<Vec<Vec<u8>>>,
    fail_after: usize,
}

impl Substrate for FaultyTable {
    fn cursor(&self) -> Box<dyn TableCursor + Send + '_> {
        Box::new(FaultyCursor {
            items: Arc::clone(&self.items),
            next: 0,
            current: 0,
            served: 0,
            fail_after: self.fail_after,
            failed: false,
        })
    }
}

fn search<'a>(t: &'a dyn Substrate, pool: &'a ScratchPool) -> IndexSearch<'a> {
    IndexSearch::new(
        t,
        pool,
        Arc::new(SeriesIdSet::new()),
        Arc::new(MeasurementVersions::new()),
        noop_event_listener(),
    )
}

fn tag_row(name: &str, key: &str, value: &str, tsids: &[Tsid]) -> Vec<u8> {
    let mut scratch = Vec::new();
    let mut row = Vec::new();
    tag_key_prefix(&mut row, name.as_bytes(), key.as_bytes(), &mut scratch);
    marshal_tag_value(&mut row, value.as_bytes());
    for &id in tsids {
        marshal_tsid(&mut row, id);
    }
    row
}

/// 300 series spread over three hosts, so every host value spans several rows.
fn wide_index(max_tsids_per_row: usize) -> TsIndex {
    let idx = TsIndex::with_config(IndexConfig {
        max_tsids_per_row,
        ..Default::default()
    })
    .unwrap();
    let rows: Vec<_> = (0..300)
        .map(|i| {
            let host = format!("h{}", i % 3);
            let pod = format!("p{}", i);
            ("k8s".to_string(), tags_from_pairs(&[("host", host.as_str()), ("pod", pod.as_str())]))
        })
        .collect();
    idx.create_index_if_not_exists(&rows).unwrap();
    idx
}

#[test]
fn test_chunked_rows_resolve_like_single_rows() {
    let packed = wide_index(64);
    let spread = wide_index(1);
    for cond in [
        Expr::tag_eq("host", "h1"),
        Expr::tag_match("host", "h[02]"),
        Expr::tag_not_match("host", "h[02]"),
        Expr::tag_match("pod", "p1.5"),
    ] {
        let a = packed.search_series_ids("k8s", Some(&cond), TimeRange::all()).unwrap();
        let b = spread.search_series_ids("k8s", Some(&cond), TimeRange::all()).unwrap();
        assert_eq!(a, b, "{cond}");
    }
    let h1 = packed
        .search_series_ids("k8s", Some(&Expr::tag_eq("host", "h1")), TimeRange::all())
        .unwrap();
    assert_eq!(h1.len(), 100);
    assert!(h1.iter().all(|id| (id - 1) % 3 == 1));
}

#[test]
fn test_skip_ahead_with_filter_matches_full_scan() {
    let idx = wide_index(64);
    let pool = ScratchPool::new(2, 0);
    let mut is = search(idx.substrate(), &pool);

    // Only the last third of the series is eligible.
    let filter: SeriesIdSet = (201..=300).collect();
    let tf = TagFilter::new(b"k8s", b"host", b"h[12]", false, true).unwrap();
    assert!(tf.or_suffixes.is_empty());

    let mut filtered = SeriesIdSet::new();
    is.get_tsids_for_tag_filter_slow(&tf, Some(&filter), |id| filtered.add(id))
        .unwrap();

    let mut full = SeriesIdSet::new();
    is.get_tsids_for_tag_filter_slow(&tf, None, |id| full.add(id)).unwrap();

    assert_eq!(filtered.to_vec(), full.intersect(&filter).to_vec());
    assert_eq!(full.len(), 200);
}

#[test]
fn test_fast_and_slow_paths_agree_on_indexed_data() {
    let idx = wide_index(64);
    let pool = ScratchPool::new(2, 0);
    let mut is = search(idx.substrate(), &pool);

    let fast = TagFilter::new(b"k8s", b"host", b"^(h0|h2)$", false, true).unwrap();
    assert_eq!(fast.or_suffixes.len(), 2);
    let slow = TagFilter::new(b"k8s", b"host", b"^h[02]$", false, true).unwrap();
    assert!(slow.or_suffixes.is_empty());

    let a = is.search_tsids_by_tag_filter(&fast).unwrap();
    let b = is.search_tsids_by_tag_filter(&slow).unwrap();
    assert_eq!(a.to_vec(), b.to_vec());
    assert_eq!(a.len(), 200);
}

#[test]
fn test_substrate_error_surfaces_with_prefix() {
    let idx = wide_index(64);
    let items = idx.substrate().snapshot().unwrap();
    let pool = ScratchPool::new(2, 0);

    let broken = FaultyTable {
        items: Arc::clone(&items),
        fail_after: 3,
    };
    let mut is = search(&broken, &pool);
    let err = is.get_tsids_by_measurement_name(b"k8s").unwrap_err();
    assert!(matches!(err, IndexError::Substrate { .. }), "{err}");

    let healthy = FaultyTable {
        items,
        fail_after: usize::MAX,
    };
    let mut is = search(&healthy, &pool);
    assert_eq!(is.get_tsids_by_measurement_name(b"k8s").unwrap().len(), 300);
}

#[test]
fn test_row_without_separator_is_corruption() {
    let mut scratch = Vec::new();
    let mut bad = Vec::new();
    tag_key_prefix(&mut bad, b"cpu", b"host", &mut scratch);
    bad.extend_from_slice(b"noseparator");
    let t = MemTable::from_items(vec![tag_row("cpu", "", "cpu", &[1]), bad]);
    let pool = ScratchPool::new(1, 0);
    let mut is = search(&t, &pool);

    let tf = TagFilter::new(b"cpu", b"host", b"sep", false, true).unwrap();
    let err = is.search_tsids_by_tag_filter(&tf).unwrap_err();
    assert!(matches!(err, IndexError::Corruption { key: Some(_), .. }), "{err}");
}

#[test]
fn test_truncated_tsid_tail_is_corruption() {
    let mut row = tag_row("cpu", "host", "a", &[1, 2]);
    row.truncate(row.len() - 3);
    let t = MemTable::from_items(vec![tag_row("cpu", "", "cpu", &[1, 2]), row]);
    let pool = ScratchPool::new(1, 0);
    let mut is = search(&t, &pool);

    let tf = TagFilter::new(b"cpu", b"host", b"a", false, false).unwrap();
    assert!(matches!(
        is.search_tsids_by_tag_filter(&tf),
        Err(IndexError::Corruption { .. })
    ));
}

#[test]
fn test_unknown_key_lookups_are_not_found() {
    let idx = wide_index(64);
    let pool = ScratchPool::new(1, 0);
    let mut is = search(idx.substrate(), &pool);
    assert!(is.search_series_key(10_000).unwrap_err().is_not_found());
    assert!(is.get_tsid_by_series_key(b"not a key").unwrap_err().is_not_found());
    assert!(idx
        .get_series_id_by_series_key("k8s", &tags_from_pairs(&[("host", "h9")]))
        .unwrap_err()
        .is_not_found());
}

#[test]
fn test_skip_ahead_uses_configured_row_size() {
    // 50 full rows of 2 per host value; a scan that never skips reads all 150 of them.
    let idx = wide_index(2);
    let items = idx.substrate().snapshot().unwrap();
    let pool = ScratchPool::new(2, 0);
    let budget = FaultyTable {
        items,
        fail_after: 60,
    };

    let mut is = search(&budget, &pool).with_max_tsids_per_row(2);
    let vals = is.search_tag_values_by_single_key(b"k8s", b"host", None).unwrap();
    assert_eq!(vals.into_iter().collect::<Vec<_>>(), vec!["h0", "h1", "h2"]);

    let mut is = search(&budget, &pool).with_max_tsids_per_row(2);
    let tf = TagFilter::new(b"k8s", b"host", b"h[2]", false, true).unwrap();
    let mut got = SeriesIdSet::new();
    is.get_tsids_for_tag_filter_slow(&tf, None, |id| got.add(id)).unwrap();
    assert_eq!(got.len(), 100);

    // Same scan with the default row size never skips and runs out of budget.
    let mut is = search(&budget, &pool);
    assert!(matches!(
        is.get_tsids_for_tag_filter_slow(&tf, None, |_| {}),
        Err(IndexError::Substrate { .. })
    ));
}
