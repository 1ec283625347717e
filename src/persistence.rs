use crate::encoding::crc32;
use crate::error::IndexError;
use crate::scanner::MeasurementVersions;
use crate::series_set::SeriesIdSet;
use crate::types::Tsid;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const SNAP_MAGIC: &[u8; 8] = b"UGNTSI01";
const SNAP_VERSION: u32 = 1;
const SNAP_PREFIX: &str = "index_";
const SNAP_SUFFIX: &str = ".snap";

/// Index metadata persisted next to the rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexMeta {
    pub next_tsid: Tsid,
    pub versions: Vec<(String, u16)>,
    /// Serialized tombstone set.
    pub deleted: Vec<u8>,
}

impl IndexMeta {
    pub fn new(
        next_tsid: Tsid,
        versions: &MeasurementVersions,
        deleted: &SeriesIdSet,
    ) -> Result<Self, IndexError> {
        let mut v: Vec<(String, u16)> = versions.iter().map(|(k, v)| (k.clone(), *v)).collect();
        v.sort();
        Ok(Self {
            next_tsid,
            versions: v,
            deleted: deleted.to_bytes()?,
        })
    }

    pub fn versions_map(&self) -> MeasurementVersions {
        self.versions.iter().cloned().collect()
    }

    pub fn deleted_set(&self) -> Result<SeriesIdSet, IndexError> {
        if self.deleted.is_empty() {
            return Ok(SeriesIdSet::new());
        }
        SeriesIdSet::from_bytes(&self.deleted)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotPayload {
    meta: IndexMeta,
    items: Vec<Vec<u8>>,
}

/// Contents of a loaded snapshot.
#[derive(Debug)]
pub struct LoadedSnapshot {
    pub path: PathBuf,
    pub timestamp: u64,
    pub meta: IndexMeta,
    pub items: Vec<Vec<u8>>,
}

/// Writes and reads index snapshots.
///
/// File layout: `magic | u32 version | u64 timestamp | u64 payload len | u32 crc32 | payload`
/// with a bincode payload. Files are installed atomically (tmp file, fsync, rename, fsync dir).
#[derive(Debug)]
pub struct IndexSnapshotter {
    snapshot_dir: PathBuf,
}

impl IndexSnapshotter {
    pub fn new<P: AsRef<Path>>(snapshot_dir: P) -> Result<Self, IndexError> {
        let dir_path = snapshot_dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir_path)?;
        Ok(Self {
            snapshot_dir: dir_path,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.snapshot_dir
    }

    pub fn create_snapshot(
        &self,
        items: &[Vec<u8>],
        meta: &IndexMeta,
        timestamp: u64,
    ) -> Result<PathBuf, IndexError> {
        let payload = bincode::serialize(&SnapshotPayload {
            meta: meta.clone(),
            items: items.to_vec(),
        })
        .map_err(|e| IndexError::Serialization(e.to_string()))?;
        let crc = crc32(&payload);

        let final_path = self
            .snapshot_dir
            .join(format!("{}{:020}{}", SNAP_PREFIX, timestamp, SNAP_SUFFIX));
        let tmp_path = self
            .snapshot_dir
            .join(format!(".tmp_{}{:020}{}", SNAP_PREFIX, timestamp, SNAP_SUFFIX));

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut w = BufWriter::new(file);
        w.write_all(SNAP_MAGIC)?;
        w.write_all(&SNAP_VERSION.to_le_bytes())?;
        w.write_all(&timestamp.to_le_bytes())?;
        w.write_all(&(payload.len() as u64).to_le_bytes())?;
        w.write_all(&crc.to_le_bytes())?;
        w.write_all(&payload)?;
        w.flush()?;
        w.get_ref().sync_data()?;
        drop(w);

        fs::rename(&tmp_path, &final_path)?;
        sync_dir(&self.snapshot_dir)?;
        Ok(final_path)
    }

    /// Loads the newest snapshot, `None` when there is none.
    pub fn load_latest_snapshot(&self) -> Result<Option<LoadedSnapshot>, IndexError> {
        let snaps = list_snapshots(&self.snapshot_dir)?;
        match snaps.last() {
            Some((_, path)) => read_snapshot(path).map(Some),
            None => Ok(None),
        }
    }

    /// Deletes all but the `keep` newest snapshots. Returns how many were removed.
    pub fn prune(&self, keep: usize) -> Result<usize, IndexError> {
        let snaps = list_snapshots(&self.snapshot_dir)?;
        let excess = snaps.len().saturating_sub(keep);
        for (_, path) in &snaps[..excess] {
            fs::remove_file(path)?;
        }
        Ok(excess)
    }
}

fn corruption(details: String) -> IndexError {
    IndexError::Corruption { details, key: None }
}

/// `read_exact` for header fields: running out of bytes means a truncated file.
fn read_header_field<R: Read>(reader: &mut R, buf: &mut [u8], path: &Path) -> Result<(), IndexError> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => corruption(format!("Truncated snapshot header in {:?}", path)),
        _ => IndexError::Io(e),
    })
}

fn read_snapshot(path: &Path) -> Result<LoadedSnapshot, IndexError> {
    let mut reader = BufReader::new(File::open(path)?);

    let mut magic = [0u8; 8];
    read_header_field(&mut reader, &mut magic, path)?;
    if &magic != SNAP_MAGIC {
        return Err(corruption(format!("Bad snapshot magic in {:?}", path)));
    }
    let mut b4 = [0u8; 4];
    read_header_field(&mut reader, &mut b4, path)?;
    let version = u32::from_le_bytes(b4);
    if version != SNAP_VERSION {
        return Err(corruption(format!(
            "Unsupported snapshot version {} in {:?}",
            version, path
        )));
    }
    let mut b8 = [0u8; 8];
    read_header_field(&mut reader, &mut b8, path)?;
    let timestamp = u64::from_le_bytes(b8);
    read_header_field(&mut reader, &mut b8, path)?;
    let payload_len = u64::from_le_bytes(b8) as usize;
    read_header_field(&mut reader, &mut b4, path)?;
    let expected_crc = u32::from_le_bytes(b4);

    let mut payload = Vec::new();
    reader.read_to_end(&mut payload)?;
    if payload.len() != payload_len {
        return Err(corruption(format!(
            "Snapshot payload length mismatch in {:?}: header says {}, found {}",
            path,
            payload_len,
            payload.len()
        )));
    }
    if crc32(&payload) != expected_crc {
        return Err(corruption(format!(
            "Snapshot payload CRC mismatch in {:?}",
            path
        )));
    }
    let decoded: SnapshotPayload = bincode::deserialize(&payload)
        .map_err(|e| corruption(format!("Undecodable snapshot payload in {:?}: {}", path, e)))?;
    Ok(LoadedSnapshot {
        path: path.to_path_buf(),
        timestamp,
        meta: decoded.meta,
        items: decoded.items,
    })
}

fn sync_dir(dir: &Path) -> Result<(), IndexError> {
    let d = File::open(dir)?;
    d.sync_data()?;
    Ok(())
}

/// Snapshot files in `dir`, oldest first.
fn list_snapshots(dir: &Path) -> Result<Vec<(u64, PathBuf)>, IndexError> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let ts = name
            .strip_prefix(SNAP_PREFIX)
            .and_then(|rest| rest.strip_suffix(SNAP_SUFFIX))
            .and_then(|ts| ts.parse::<u64>().ok());
        if let Some(ts) = ts {
            out.push((ts, entry.path()));
        }
    }
    out.sort_by_key(|(ts, _)| *ts);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn meta() -> IndexMeta {
        let mut versions = MeasurementVersions::new();
        versions.insert("cpu".to_string(), 3);
        let deleted: SeriesIdSet = [4, 9].into_iter().collect();
        IndexMeta::new(42, &versions, &deleted).unwrap()
    }

    #[test]
    fn snapshot_round_trip_picks_latest() {
        let dir = tempdir().unwrap();
        let snap = IndexSnapshotter::new(dir.path()).unwrap();
        assert!(snap.load_latest_snapshot().unwrap().is_none());

        snap.create_snapshot(&[b"old".to_vec()], &IndexMeta::default(), 1)
            .unwrap();
        snap.create_snapshot(&[b"a".to_vec(), b"b".to_vec()], &meta(), 2)
            .unwrap();

        let loaded = snap.load_latest_snapshot().unwrap().unwrap();
        assert_eq!(loaded.timestamp, 2);
        assert_eq!(loaded.items, vec![b"a".to_vec(), b"b".to_vec()]);
        assert_eq!(loaded.meta.next_tsid, 42);
        assert_eq!(loaded.meta.versions_map().get("cpu"), Some(&3));
        assert_eq!(loaded.meta.deleted_set().unwrap().to_vec(), vec![4, 9]);

        assert_eq!(snap.prune(1).unwrap(), 1);
        assert_eq!(list_snapshots(dir.path()).unwrap().len(), 1);
    }

    #[test]
    fn flipped_payload_byte_is_corruption() {
        let dir = tempdir().unwrap();
        let snap = IndexSnapshotter::new(dir.path()).unwrap();
        let path = snap.create_snapshot(&[b"row".to_vec()], &meta(), 7).unwrap();

        let mut bytes = fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&path, &bytes).unwrap();

        let err = snap.load_latest_snapshot().unwrap_err();
        assert!(matches!(err, IndexError::Corruption { .. }), "{err}");
    }

    #[test]
    fn bad_magic_is_corruption() {
        let dir = tempdir().unwrap();
        let snap = IndexSnapshotter::new(dir.path()).unwrap();
        fs::write(
            dir.path().join(format!("{}{:020}{}", SNAP_PREFIX, 1, SNAP_SUFFIX)),
            b"NOTASNAPSHOTFILE-------------",
        )
        .unwrap();
        assert!(matches!(
            snap.load_latest_snapshot(),
            Err(IndexError::Corruption { .. })
        ));
    }

    #[test]
    fn truncated_header_is_corruption() {
        let dir = tempdir().unwrap();
        let snap = IndexSnapshotter::new(dir.path()).unwrap();
        let path = snap.create_snapshot(&[b"row".to_vec()], &meta(), 3).unwrap();
        let bytes = fs::read(&path).unwrap();
        for cut in [4, 10, 20, 30] {
            fs::write(&path, &bytes[..cut]).unwrap();
            let err = snap.load_latest_snapshot().unwrap_err();
            assert!(matches!(err, IndexError::Corruption { .. }), "cut {cut}: {err}");
        }
    }
}
