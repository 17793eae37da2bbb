//! Value column file format.
//!
//! Each MSID is persisted as an append-only array of fixed-width elements
//! with the `.col` extension. The format is:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  File Header (16 bytes)                                      │
//! │  - Magic: "TCOL" (4 bytes)                                   │
//! │  - Version: u16 (2 bytes) = 1                                │
//! │  - DType code: u8 (1 byte)                                   │
//! │  - Element width: u8 (1 byte)                                │
//! │  - Reserved: 4 bytes                                         │
//! │  - Header CRC32: u32 (4 bytes)                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Elements (width × N bytes, little-endian)                   │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Row count is derived from the file length, so append and truncate are
//! single `write`/`set_len` operations and range reads are O(1) seeks.

use crate::error::{ArchiveError, Result};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Magic bytes for column file header: "TCOL"
pub const COLUMN_MAGIC: [u8; 4] = *b"TCOL";

/// Current column file format version.
pub const COLUMN_VERSION: u16 = 1;

/// Header size in bytes.
pub const COLUMN_HEADER_SIZE: u64 = 16;

/// Scalar element type of a column.
///
/// The type is fixed at first create; appending with a different type fails
/// with [`ArchiveError::SchemaMismatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    /// Unsigned 8-bit integer.
    U8,
    /// Signed 16-bit integer.
    I16,
    /// Signed 32-bit integer.
    I32,
    /// Signed 64-bit integer.
    I64,
    /// IEEE 754 single-precision float.
    F32,
    /// IEEE 754 double-precision float.
    F64,
    /// Fixed-width byte string of the given width.
    Str(u8),
}

impl DType {
    /// Element width in bytes.
    pub fn width(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::I16 => 2,
            DType::I32 => 4,
            DType::I64 => 8,
            DType::F32 => 4,
            DType::F64 => 8,
            DType::Str(w) => w as usize,
        }
    }

    /// On-disk type code.
    pub fn code(self) -> u8 {
        match self {
            DType::U8 => 0,
            DType::I16 => 1,
            DType::I32 => 2,
            DType::I64 => 3,
            DType::F32 => 4,
            DType::F64 => 5,
            DType::Str(_) => 6,
        }
    }

    /// Reconstructs a DType from its code and width bytes.
    pub fn from_code(code: u8, width: u8) -> Option<Self> {
        match code {
            0 => Some(DType::U8),
            1 => Some(DType::I16),
            2 => Some(DType::I32),
            3 => Some(DType::I64),
            4 => Some(DType::F32),
            5 => Some(DType::F64),
            6 if width > 0 => Some(DType::Str(width)),
            _ => None,
        }
    }

    /// Returns true for integer and float types (everything but strings).
    pub fn is_numeric(self) -> bool {
        !matches!(self, DType::Str(_))
    }
}

/// In-memory slice of column elements, one variant per [`DType`].
#[derive(Debug, Clone, PartialEq)]
pub enum ColumnData {
    /// Unsigned 8-bit values.
    U8(Vec<u8>),
    /// Signed 16-bit values.
    I16(Vec<i16>),
    /// Signed 32-bit values.
    I32(Vec<i32>),
    /// Signed 64-bit values.
    I64(Vec<i64>),
    /// Single-precision values.
    F32(Vec<f32>),
    /// Double-precision values.
    F64(Vec<f64>),
    /// Fixed-width byte strings, stored back to back.
    Str {
        /// Width of each element in bytes.
        width: u8,
        /// Raw element bytes, `width × len` long.
        raw: Vec<u8>,
    },
}

impl ColumnData {
    /// Element type of this data.
    pub fn dtype(&self) -> DType {
        match self {
            ColumnData::U8(_) => DType::U8,
            ColumnData::I16(_) => DType::I16,
            ColumnData::I32(_) => DType::I32,
            ColumnData::I64(_) => DType::I64,
            ColumnData::F32(_) => DType::F32,
            ColumnData::F64(_) => DType::F64,
            ColumnData::Str { width, .. } => DType::Str(*width),
        }
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        match self {
            ColumnData::U8(v) => v.len(),
            ColumnData::I16(v) => v.len(),
            ColumnData::I32(v) => v.len(),
            ColumnData::I64(v) => v.len(),
            ColumnData::F32(v) => v.len(),
            ColumnData::F64(v) => v.len(),
            ColumnData::Str { width, raw } => raw.len() / (*width as usize).max(1),
        }
    }

    /// Returns true if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// An empty buffer of the given type.
    pub fn empty(dtype: DType) -> Self {
        match dtype {
            DType::U8 => ColumnData::U8(Vec::new()),
            DType::I16 => ColumnData::I16(Vec::new()),
            DType::I32 => ColumnData::I32(Vec::new()),
            DType::I64 => ColumnData::I64(Vec::new()),
            DType::F32 => ColumnData::F32(Vec::new()),
            DType::F64 => ColumnData::F64(Vec::new()),
            DType::Str(w) => ColumnData::Str { width: w, raw: Vec::new() },
        }
    }

    /// `n` zero-valued elements of the given type. Used to backfill columns
    /// that appear mid-mission in a content type.
    pub fn zeros(dtype: DType, n: usize) -> Self {
        match dtype {
            DType::U8 => ColumnData::U8(vec![0; n]),
            DType::I16 => ColumnData::I16(vec![0; n]),
            DType::I32 => ColumnData::I32(vec![0; n]),
            DType::I64 => ColumnData::I64(vec![0; n]),
            DType::F32 => ColumnData::F32(vec![0.0; n]),
            DType::F64 => ColumnData::F64(vec![0.0; n]),
            DType::Str(w) => ColumnData::Str { width: w, raw: vec![b' '; w as usize * n] },
        }
    }

    /// Serializes all elements as little-endian bytes.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            ColumnData::U8(v) => v.clone(),
            ColumnData::I16(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ColumnData::I32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ColumnData::I64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ColumnData::F32(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ColumnData::F64(v) => v.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ColumnData::Str { raw, .. } => raw.clone(),
        }
    }

    /// Deserializes elements from little-endian bytes.
    pub fn decode(dtype: DType, bytes: &[u8]) -> Self {
        fn chunks<const W: usize>(bytes: &[u8]) -> impl Iterator<Item = [u8; W]> + '_ {
            bytes.chunks_exact(W).map(|c| c.try_into().unwrap())
        }
        match dtype {
            DType::U8 => ColumnData::U8(bytes.to_vec()),
            DType::I16 => ColumnData::I16(chunks::<2>(bytes).map(i16::from_le_bytes).collect()),
            DType::I32 => ColumnData::I32(chunks::<4>(bytes).map(i32::from_le_bytes).collect()),
            DType::I64 => ColumnData::I64(chunks::<8>(bytes).map(i64::from_le_bytes).collect()),
            DType::F32 => ColumnData::F32(chunks::<4>(bytes).map(f32::from_le_bytes).collect()),
            DType::F64 => ColumnData::F64(chunks::<8>(bytes).map(f64::from_le_bytes).collect()),
            DType::Str(w) => ColumnData::Str { width: w, raw: bytes.to_vec() },
        }
    }

    /// Numeric view of the elements as `f64`.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Unsupported`] for string columns.
    pub fn as_f64(&self) -> Result<Vec<f64>> {
        match self {
            ColumnData::U8(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            ColumnData::I16(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            ColumnData::I32(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            ColumnData::I64(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            ColumnData::F32(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            ColumnData::F64(v) => Ok(v.clone()),
            ColumnData::Str { .. } => Err(ArchiveError::Unsupported(
                "string column has no numeric view".into(),
            )),
        }
    }

    /// Integer view of the elements as `i64` (raw state codes).
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Unsupported`] for float and string columns.
    pub fn as_i64(&self) -> Result<Vec<i64>> {
        match self {
            ColumnData::U8(v) => Ok(v.iter().map(|&x| x as i64).collect()),
            ColumnData::I16(v) => Ok(v.iter().map(|&x| x as i64).collect()),
            ColumnData::I32(v) => Ok(v.iter().map(|&x| x as i64).collect()),
            ColumnData::I64(v) => Ok(v.clone()),
            _ => Err(ArchiveError::Unsupported(
                "column has no integer view".into(),
            )),
        }
    }

    /// String view of a fixed-width string column, with trailing spaces and
    /// NULs trimmed.
    pub fn as_strings(&self) -> Result<Vec<String>> {
        match self {
            ColumnData::Str { width, raw } => Ok(raw
                .chunks_exact(*width as usize)
                .map(|chunk| {
                    String::from_utf8_lossy(chunk)
                        .trim_end_matches(['\0', ' '])
                        .to_string()
                })
                .collect()),
            _ => Err(ArchiveError::Unsupported(
                "numeric column has no string view".into(),
            )),
        }
    }

    /// Copies the half-open element range `[lo, hi)`.
    pub fn slice(&self, lo: usize, hi: usize) -> Self {
        match self {
            ColumnData::U8(v) => ColumnData::U8(v[lo..hi].to_vec()),
            ColumnData::I16(v) => ColumnData::I16(v[lo..hi].to_vec()),
            ColumnData::I32(v) => ColumnData::I32(v[lo..hi].to_vec()),
            ColumnData::I64(v) => ColumnData::I64(v[lo..hi].to_vec()),
            ColumnData::F32(v) => ColumnData::F32(v[lo..hi].to_vec()),
            ColumnData::F64(v) => ColumnData::F64(v[lo..hi].to_vec()),
            ColumnData::Str { width, raw } => {
                let w = *width as usize;
                ColumnData::Str { width: *width, raw: raw[lo * w..hi * w].to_vec() }
            }
        }
    }

    /// Keeps only the elements at positions where `keep` is true.
    pub fn filtered(&self, keep: &[bool]) -> Self {
        fn pick<T: Copy>(v: &[T], keep: &[bool]) -> Vec<T> {
            v.iter()
                .zip(keep)
                .filter_map(|(x, &k)| k.then_some(*x))
                .collect()
        }
        match self {
            ColumnData::U8(v) => ColumnData::U8(pick(v, keep)),
            ColumnData::I16(v) => ColumnData::I16(pick(v, keep)),
            ColumnData::I32(v) => ColumnData::I32(pick(v, keep)),
            ColumnData::I64(v) => ColumnData::I64(pick(v, keep)),
            ColumnData::F32(v) => ColumnData::F32(pick(v, keep)),
            ColumnData::F64(v) => ColumnData::F64(pick(v, keep)),
            ColumnData::Str { width, raw } => {
                let w = *width as usize;
                let mut out = Vec::new();
                for (chunk, &k) in raw.chunks_exact(w).zip(keep) {
                    if k {
                        out.extend_from_slice(chunk);
                    }
                }
                ColumnData::Str { width: *width, raw: out }
            }
        }
    }

    /// Selects elements by index, in order (used by nearest-neighbor
    /// interpolation).
    pub fn take(&self, indexes: &[usize]) -> Self {
        fn pick<T: Copy>(v: &[T], idx: &[usize]) -> Vec<T> {
            idx.iter().map(|&i| v[i]).collect()
        }
        match self {
            ColumnData::U8(v) => ColumnData::U8(pick(v, indexes)),
            ColumnData::I16(v) => ColumnData::I16(pick(v, indexes)),
            ColumnData::I32(v) => ColumnData::I32(pick(v, indexes)),
            ColumnData::I64(v) => ColumnData::I64(pick(v, indexes)),
            ColumnData::F32(v) => ColumnData::F32(pick(v, indexes)),
            ColumnData::F64(v) => ColumnData::F64(pick(v, indexes)),
            ColumnData::Str { width, raw } => {
                let w = *width as usize;
                let mut out = Vec::with_capacity(indexes.len() * w);
                for &i in indexes {
                    out.extend_from_slice(&raw[i * w..(i + 1) * w]);
                }
                ColumnData::Str { width: *width, raw: out }
            }
        }
    }
}

/// Open mode for a column file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only access.
    Read,
    /// Read-write access for appends.
    Append,
    /// Read-write access for truncation.
    Truncate,
}

impl OpenMode {
    fn writable(self) -> bool {
        !matches!(self, OpenMode::Read)
    }
}

fn header_bytes(dtype: DType) -> [u8; COLUMN_HEADER_SIZE as usize] {
    let mut buf = [0u8; COLUMN_HEADER_SIZE as usize];
    buf[0..4].copy_from_slice(&COLUMN_MAGIC);
    buf[4..6].copy_from_slice(&COLUMN_VERSION.to_le_bytes());
    buf[6] = dtype.code();
    buf[7] = dtype.width() as u8;
    // Bytes 8..12 reserved.
    let crc = crc32fast::hash(&buf[0..12]);
    buf[12..16].copy_from_slice(&crc.to_le_bytes());
    buf
}

/// Handle to one on-disk value column.
#[derive(Debug)]
pub struct ColumnFile {
    file: File,
    path: PathBuf,
    dtype: DType,
    rows: u64,
}

impl ColumnFile {
    /// Creates a new empty column of the given element type.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or the header cannot
    /// be written.
    pub fn create(path: &Path, dtype: DType) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.write_all(&header_bytes(dtype))?;
        file.sync_all()?;
        Ok(Self { file, path: path.to_path_buf(), dtype, rows: 0 })
    }

    /// Opens an existing column, validating magic, version and header CRC.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidMagic`], [`ArchiveError::UnsupportedVersion`]
    /// or [`ArchiveError::ChecksumMismatch`] for a damaged header.
    pub fn open(path: &Path, mode: OpenMode) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(mode.writable())
            .open(path)?;
        let mut buf = [0u8; COLUMN_HEADER_SIZE as usize];
        file.read_exact(&mut buf)?;

        let magic: [u8; 4] = buf[0..4].try_into().unwrap();
        if magic != COLUMN_MAGIC {
            return Err(ArchiveError::InvalidMagic { expected: COLUMN_MAGIC, actual: magic });
        }
        let version = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        if version > COLUMN_VERSION {
            return Err(ArchiveError::UnsupportedVersion(version));
        }
        let expected = u32::from_le_bytes(buf[12..16].try_into().unwrap());
        let actual = crc32fast::hash(&buf[0..12]);
        if expected != actual {
            return Err(ArchiveError::ChecksumMismatch { expected, actual });
        }
        let dtype = DType::from_code(buf[6], buf[7])
            .ok_or(ArchiveError::UnsupportedVersion(buf[6] as u16))?;

        let data_len = file.metadata()?.len().saturating_sub(COLUMN_HEADER_SIZE);
        let rows = data_len / dtype.width() as u64;
        Ok(Self { file, path: path.to_path_buf(), dtype, rows })
    }

    /// Opens the column, creating it with `dtype` if it does not exist.
    pub fn open_or_create(path: &Path, dtype: DType, mode: OpenMode) -> Result<Self> {
        if path.exists() {
            let col = Self::open(path, mode)?;
            if col.dtype != dtype {
                return Err(ArchiveError::SchemaMismatch {
                    path: path.to_path_buf(),
                    on_disk: col.dtype,
                    requested: dtype,
                });
            }
            Ok(col)
        } else {
            Self::create(path, dtype)
        }
    }

    /// Element type recorded in the header.
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Number of rows currently stored.
    pub fn len(&self) -> u64 {
        self.rows
    }

    /// Returns true if the column has no rows.
    pub fn is_empty(&self) -> bool {
        self.rows == 0
    }

    /// Appends elements to the end of the column.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::SchemaMismatch`] if the data's element type
    /// differs from the column's.
    pub fn append(&mut self, data: &ColumnData) -> Result<()> {
        if data.dtype() != self.dtype {
            return Err(ArchiveError::SchemaMismatch {
                path: self.path.clone(),
                on_disk: self.dtype,
                requested: data.dtype(),
            });
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&data.encode())?;
        self.rows += data.len() as u64;
        Ok(())
    }

    /// Reads the half-open row range `[row_lo, row_hi)` with an O(1) seek.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::OutOfRange`] if the range extends past the
    /// stored rows.
    pub fn read_range(&mut self, row_lo: u64, row_hi: u64) -> Result<ColumnData> {
        if row_lo > row_hi || row_hi > self.rows {
            return Err(ArchiveError::OutOfRange { row_lo, row_hi, rows: self.rows });
        }
        let width = self.dtype.width() as u64;
        self.file
            .seek(SeekFrom::Start(COLUMN_HEADER_SIZE + row_lo * width))?;
        let mut buf = vec![0u8; ((row_hi - row_lo) * width) as usize];
        self.file.read_exact(&mut buf)?;
        Ok(ColumnData::decode(self.dtype, &buf))
    }

    /// Shrinks the column to `row_keep` rows. Durable before returning.
    pub fn truncate(&mut self, row_keep: u64) -> Result<()> {
        if row_keep >= self.rows {
            return Ok(());
        }
        let width = self.dtype.width() as u64;
        self.file
            .set_len(COLUMN_HEADER_SIZE + row_keep * width)?;
        self.file.sync_all()?;
        self.rows = row_keep;
        Ok(())
    }

    /// Flushes all buffered writes to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_append_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("A.col");
        let mut col = ColumnFile::create(&path, DType::F64).unwrap();
        col.append(&ColumnData::F64(vec![1.0, 2.0, 3.0])).unwrap();
        col.append(&ColumnData::F64(vec![4.0])).unwrap();
        assert_eq!(col.len(), 4);

        let data = col.read_range(1, 3).unwrap();
        assert_eq!(data, ColumnData::F64(vec![2.0, 3.0]));
    }

    #[test]
    fn test_reopen_preserves_rows_and_dtype() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("A.col");
        {
            let mut col = ColumnFile::create(&path, DType::I32).unwrap();
            col.append(&ColumnData::I32(vec![7, 8, 9])).unwrap();
            col.sync().unwrap();
        }
        let mut col = ColumnFile::open(&path, OpenMode::Read).unwrap();
        assert_eq!(col.dtype(), DType::I32);
        assert_eq!(col.len(), 3);
        assert_eq!(col.read_range(0, 3).unwrap(), ColumnData::I32(vec![7, 8, 9]));
    }

    #[test]
    fn test_schema_mismatch() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("A.col");
        let mut col = ColumnFile::create(&path, DType::F32).unwrap();
        let err = col.append(&ColumnData::F64(vec![1.0])).unwrap_err();
        assert!(matches!(err, ArchiveError::SchemaMismatch { .. }));

        let err = ColumnFile::open_or_create(&path, DType::F64, OpenMode::Append).unwrap_err();
        assert!(matches!(err, ArchiveError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_truncate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("A.col");
        let mut col = ColumnFile::create(&path, DType::I64).unwrap();
        col.append(&ColumnData::I64((0..10).collect())).unwrap();
        col.truncate(4).unwrap();
        assert_eq!(col.len(), 4);
        assert_eq!(col.read_range(0, 4).unwrap(), ColumnData::I64(vec![0, 1, 2, 3]));
        assert!(col.read_range(0, 5).is_err());
    }

    #[test]
    fn test_str_column() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("S.col");
        let mut col = ColumnFile::create(&path, DType::Str(4)).unwrap();
        col.append(&ColumnData::Str { width: 4, raw: b"ON  OFF ".to_vec() })
            .unwrap();
        assert_eq!(col.len(), 2);
        let strings = col.read_range(0, 2).unwrap().as_strings().unwrap();
        assert_eq!(strings, vec!["ON", "OFF"]);
    }

    #[test]
    fn test_corrupt_header_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("A.col");
        ColumnFile::create(&path, DType::F64).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[6] = 99; // clobber the dtype code
        std::fs::write(&path, bytes).unwrap();
        let err = ColumnFile::open(&path, OpenMode::Read).unwrap_err();
        assert!(matches!(err, ArchiveError::ChecksumMismatch { .. }));
    }
}
