//! Stat record file format.
//!
//! One append-only file per (MSID, interval kind) with the `.stats`
//! extension, holding fixed-width records in interval-index order:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (20 bytes)                                      │
//! │  - Magic: "TSTA" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - Kind: u8 (0 = 5min, 1 = daily)                            │
//! │  - Layout: u8 (0 = numeric, 1 = state)                       │
//! │  - State count: u16 (2 bytes)                                │
//! │  - Reserved: 2 bytes                                         │
//! │  - Record length: u32 (4 bytes)                              │
//! │  - Header CRC32: u32 (4 bytes)                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Records (record length × N bytes)                           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Numeric records hold `index i64, n u32, midval/min/max/mean/std f64`,
//! with seven percentile `f64` fields appended for the daily kind. State
//! records hold `index i64, n u32, midval f64` followed by one `u32` count
//! per state code, in state-table order. Sample counts are 32-bit unsigned
//! throughout.

use crate::error::{ArchiveError, Result};
use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use super::StatKind;

/// Magic bytes for stat file header: "TSTA"
pub const STAT_MAGIC: [u8; 4] = *b"TSTA";

/// Current stat file format version.
pub const STAT_VERSION: u16 = 1;

/// Header size in bytes.
pub const STAT_HEADER_SIZE: u64 = 20;

/// Percent levels of the daily percentile fields.
pub const PERCENTS: [u8; 7] = [1, 5, 16, 50, 84, 95, 99];

/// Field layout of a stat record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatLayout {
    /// min/max/mean/std (+ daily percentiles) for numeric MSIDs.
    Numeric,
    /// Per-state sample counts for state-valued MSIDs.
    State,
}

impl StatLayout {
    fn code(self) -> u8 {
        match self {
            StatLayout::Numeric => 0,
            StatLayout::State => 1,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StatLayout::Numeric),
            1 => Some(StatLayout::State),
            _ => None,
        }
    }
}

/// One aggregate record over a mission-global interval.
#[derive(Debug, Clone, PartialEq)]
pub struct StatRecord {
    /// Interval index, `floor(window start / Δ)`.
    pub index: i64,
    /// Number of good samples summarized (always ≥ 3).
    pub n: u32,
    /// Value of the sample nearest the window midpoint.
    pub midval: f64,
    /// Minimum value (numeric layout).
    pub min: f64,
    /// Maximum value (numeric layout).
    pub max: f64,
    /// Time-weighted mean (numeric layout).
    pub mean: f64,
    /// Time-weighted standard deviation (numeric layout).
    pub std: f64,
    /// Daily percentiles at [`PERCENTS`] levels (daily numeric only).
    pub percentiles: Option<[f64; 7]>,
    /// Per-state sample counts in state-table order (state layout only).
    pub state_counts: Option<Vec<u32>>,
}

impl StatRecord {
    /// A record with only the common fields set.
    pub fn new(index: i64, n: u32, midval: f64) -> Self {
        Self {
            index,
            n,
            midval,
            min: 0.0,
            max: 0.0,
            mean: 0.0,
            std: 0.0,
            percentiles: None,
            state_counts: None,
        }
    }
}

fn record_len(kind: StatKind, layout: StatLayout, n_states: u16) -> u32 {
    match layout {
        StatLayout::Numeric => match kind {
            StatKind::FiveMin => 8 + 4 + 5 * 8,
            StatKind::Daily => 8 + 4 + 5 * 8 + 7 * 8,
        },
        StatLayout::State => 8 + 4 + 8 + 4 * n_states as u32,
    }
}

fn header_bytes(kind: StatKind, layout: StatLayout, n_states: u16) -> [u8; STAT_HEADER_SIZE as usize] {
    let mut buf = [0u8; STAT_HEADER_SIZE as usize];
    buf[0..4].copy_from_slice(&STAT_MAGIC);
    buf[4..6].copy_from_slice(&STAT_VERSION.to_le_bytes());
    buf[6] = kind.code();
    buf[7] = layout.code();
    buf[8..10].copy_from_slice(&n_states.to_le_bytes());
    // Bytes 10..12 reserved.
    buf[12..16].copy_from_slice(&record_len(kind, layout, n_states).to_le_bytes());
    let crc = crc32fast::hash(&buf[0..16]);
    buf[16..20].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Handle to one on-disk stat record file.
#[derive(Debug)]
pub struct StatStore {
    file: std::fs::File,
    path: PathBuf,
    kind: StatKind,
    layout: StatLayout,
    n_states: u16,
    record_len: u32,
    n_records: u64,
}

impl StatStore {
    /// Creates a new empty stat store.
    pub fn create(path: &Path, kind: StatKind, layout: StatLayout, n_states: u16) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&header_bytes(kind, layout, n_states))?;
        file.sync_all()?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            kind,
            layout,
            n_states,
            record_len: record_len(kind, layout, n_states),
            n_records: 0,
        })
    }

    /// Opens an existing stat store, validating the header.
    pub fn open(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut buf = [0u8; STAT_HEADER_SIZE as usize];
        file.read_exact(&mut buf)?;

        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != STAT_MAGIC {
            return Err(ArchiveError::InvalidMagic { expected: STAT_MAGIC, actual: magic });
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version > STAT_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }
        let expected = u32::from_le_bytes(buf[16..20].try_into().unwrap());
        let actual = crc32fast::hash(&buf[0..16]);
        if expected != actual {
            return Err(ArchiveError::ChecksumMismatch { expected, actual });
        }
        let kind = StatKind::from_code(buf[6]).ok_or(ArchiveError::UnsupportedVersion(buf[6] as u16))?;
        let layout =
            StatLayout::from_code(buf[7]).ok_or(ArchiveError::UnsupportedVersion(buf[7] as u16))?;
        let n_states = u16::from_le_bytes(buf[8..10].try_into().unwrap());
        let rec_len = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        if rec_len != record_len(kind, layout, n_states) {
            return Err(ArchiveError::Integrity(format!(
                "stat store {} record length {} does not match layout",
                path.display(),
                rec_len
            )));
        }
        let data_len = file.metadata()?.len().saturating_sub(STAT_HEADER_SIZE);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            kind,
            layout,
            n_states,
            record_len: rec_len,
            n_records: data_len / rec_len as u64,
        })
    }

    /// Opens the store, creating it if absent.
    pub fn open_or_create(
        path: &Path,
        kind: StatKind,
        layout: StatLayout,
        n_states: u16,
    ) -> Result<Self> {
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path, kind, layout, n_states)
        }
    }

    /// Interval kind of this store.
    pub fn kind(&self) -> StatKind {
        self.kind
    }

    /// Record layout of this store.
    pub fn layout(&self) -> StatLayout {
        self.layout
    }

    /// Number of records stored.
    pub fn len(&self) -> u64 {
        self.n_records
    }

    /// Returns true if no records are stored.
    pub fn is_empty(&self) -> bool {
        self.n_records == 0
    }

    fn encode(&self, rec: &StatRecord) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.record_len as usize);
        buf.extend_from_slice(&rec.index.to_le_bytes());
        buf.extend_from_slice(&rec.n.to_le_bytes());
        buf.extend_from_slice(&rec.midval.to_le_bytes());
        match self.layout {
            StatLayout::Numeric => {
                buf.extend_from_slice(&rec.min.to_le_bytes());
                buf.extend_from_slice(&rec.max.to_le_bytes());
                buf.extend_from_slice(&rec.mean.to_le_bytes());
                buf.extend_from_slice(&rec.std.to_le_bytes());
                if self.kind == StatKind::Daily {
                    let ps = rec.percentiles.unwrap_or_default();
                    for p in ps {
                        buf.extend_from_slice(&p.to_le_bytes());
                    }
                }
            }
            StatLayout::State => {
                for i in 0..self.n_states as usize {
                    let count = rec
                        .state_counts
                        .as_ref()
                        .and_then(|c| c.get(i).copied())
                        .unwrap_or(0);
                    buf.extend_from_slice(&count.to_le_bytes());
                }
            }
        }
        buf
    }

    fn decode(&self, buf: &[u8]) -> StatRecord {
        let index = i64::from_le_bytes(buf[0..8].try_into().unwrap());
        let n = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        let midval = f64::from_le_bytes(buf[12..20].try_into().unwrap());
        let mut rec = StatRecord::new(index, n, midval);
        match self.layout {
            StatLayout::Numeric => {
                rec.min = f64::from_le_bytes(buf[20..28].try_into().unwrap());
                rec.max = f64::from_le_bytes(buf[28..36].try_into().unwrap());
                rec.mean = f64::from_le_bytes(buf[36..44].try_into().unwrap());
                rec.std = f64::from_le_bytes(buf[44..52].try_into().unwrap());
                if self.kind == StatKind::Daily {
                    let mut ps = [0.0; 7];
                    for (i, p) in ps.iter_mut().enumerate() {
                        let off = 52 + i * 8;
                        *p = f64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
                    }
                    rec.percentiles = Some(ps);
                }
            }
            StatLayout::State => {
                let mut counts = Vec::with_capacity(self.n_states as usize);
                for i in 0..self.n_states as usize {
                    let off = 20 + i * 4;
                    counts.push(u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()));
                }
                rec.state_counts = Some(counts);
            }
        }
        rec
    }

    /// Appends records (which must be in increasing index order).
    pub fn append(&mut self, records: &[StatRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let mut buf = Vec::with_capacity(records.len() * self.record_len as usize);
        for rec in records {
            buf.extend_from_slice(&self.encode(rec));
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf)?;
        self.n_records += records.len() as u64;
        Ok(())
    }

    /// Reads the half-open record range `[rec_lo, rec_hi)`.
    pub fn read_range(&mut self, rec_lo: u64, rec_hi: u64) -> Result<Vec<StatRecord>> {
        if rec_lo > rec_hi || rec_hi > self.n_records {
            return Err(ArchiveError::OutOfRange {
                row_lo: rec_lo,
                row_hi: rec_hi,
                rows: self.n_records,
            });
        }
        let len = self.record_len as u64;
        self.file
            .seek(SeekFrom::Start(STAT_HEADER_SIZE + rec_lo * len))?;
        let mut buf = vec![0u8; ((rec_hi - rec_lo) * len) as usize];
        self.file.read_exact(&mut buf)?;
        Ok(buf
            .chunks_exact(self.record_len as usize)
            .map(|chunk| self.decode(chunk))
            .collect())
    }

    /// Interval index of the last record, if any.
    pub fn last_index(&mut self) -> Result<Option<i64>> {
        if self.n_records == 0 {
            return Ok(None);
        }
        let rec = self.read_range(self.n_records - 1, self.n_records)?;
        Ok(Some(rec[0].index))
    }

    /// Position of the first record with `index >= target` (records are in
    /// index order, so this is a binary search).
    pub fn find_index(&mut self, target: i64) -> Result<u64> {
        let mut lo = 0u64;
        let mut hi = self.n_records;
        while lo < hi {
            let mid = (lo + hi) / 2;
            let rec = self.read_range(mid, mid + 1)?;
            if rec[0].index < target {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Keeps only the first `keep` records. Durable before returning.
    pub fn truncate_records(&mut self, keep: u64) -> Result<()> {
        if keep >= self.n_records {
            return Ok(());
        }
        self.file
            .set_len(STAT_HEADER_SIZE + keep * self.record_len as u64)?;
        self.file.sync_all()?;
        self.n_records = keep;
        Ok(())
    }

    /// Removes all records with `index >= target`.
    pub fn truncate_after_index(&mut self, target: i64) -> Result<()> {
        let pos = self.find_index(target)?;
        self.truncate_records(pos)
    }

    /// Removes all records whose window could reach past `t_cut`, with one
    /// interval of margin so the next update cleanly recomputes the edge.
    pub fn truncate_after_time(&mut self, t_cut: f64) -> Result<()> {
        let index0 = (t_cut / self.kind.dt()).floor() as i64 - 1;
        self.truncate_after_index(index0)
    }

    /// Flushes all buffered writes to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Path of this store.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn numeric_record(index: i64) -> StatRecord {
        StatRecord {
            index,
            n: 10,
            midval: 1.5,
            min: 1.0,
            max: 2.0,
            mean: 1.4,
            std: 0.2,
            percentiles: None,
            state_counts: None,
        }
    }

    #[test]
    fn test_round_trip_numeric() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("A.stats");
        let mut store =
            StatStore::create(&path, StatKind::FiveMin, StatLayout::Numeric, 0).unwrap();
        store.append(&[numeric_record(5), numeric_record(6)]).unwrap();
        drop(store);

        let mut store = StatStore::open(&path).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.last_index().unwrap(), Some(6));
        let recs = store.read_range(0, 2).unwrap();
        assert_eq!(recs[0], numeric_record(5));
        assert_eq!(recs[1], numeric_record(6));
    }

    #[test]
    fn test_daily_percentiles_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("A.stats");
        let mut store = StatStore::create(&path, StatKind::Daily, StatLayout::Numeric, 0).unwrap();
        let mut rec = numeric_record(1);
        rec.percentiles = Some([1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0]);
        store.append(std::slice::from_ref(&rec)).unwrap();
        let read = store.read_range(0, 1).unwrap();
        assert_eq!(read[0], rec);
    }

    #[test]
    fn test_state_counts_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("S.stats");
        let mut store = StatStore::create(&path, StatKind::FiveMin, StatLayout::State, 3).unwrap();
        let mut rec = StatRecord::new(2, 8, 1.0);
        rec.state_counts = Some(vec![3, 0, 5]);
        store.append(std::slice::from_ref(&rec)).unwrap();
        let read = store.read_range(0, 1).unwrap();
        assert_eq!(read[0].state_counts, Some(vec![3, 0, 5]));
    }

    #[test]
    fn test_find_index_and_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("A.stats");
        let mut store =
            StatStore::create(&path, StatKind::FiveMin, StatLayout::Numeric, 0).unwrap();
        store
            .append(&[numeric_record(1), numeric_record(3), numeric_record(4)])
            .unwrap();
        assert_eq!(store.find_index(3).unwrap(), 1);
        assert_eq!(store.find_index(2).unwrap(), 1);
        assert_eq!(store.find_index(9).unwrap(), 3);

        store.truncate_after_index(3).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.last_index().unwrap(), Some(1));
    }
}
