//! Per-content directory of value columns sharing one TIME column.
//!
//! The on-disk layout under the archive data root is:
//!
//! ```text
//! data/<content>/TIME.col            shared time column (f64 seconds)
//! data/<content>/TIME.qual
//! data/<content>/<MSID>.col          one pair per MSID in the content
//! data/<content>/<MSID>.qual
//! data/<content>/archfiles.db        ingest catalog
//! data/<content>/5min/<MSID>.stats   statistics stores
//! data/<content>/daily/<MSID>.stats
//! ```

use crate::error::{ArchiveError, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::column::{ColumnData, ColumnFile, DType, OpenMode};
use super::quality::QualityFile;

/// Reserved column name for the shared time base of a content type.
pub const TIME_COLUMN: &str = "TIME";

/// One MSID's value column and its parallel quality bitmap.
#[derive(Debug)]
pub struct MsidColumn {
    content: String,
    msid: String,
    values: ColumnFile,
    quality: QualityFile,
}

impl MsidColumn {
    /// Appends `values` and `bads` together. Both must have the same length.
    pub fn append(&mut self, values: &ColumnData, bads: &[bool]) -> Result<()> {
        if values.len() != bads.len() {
            return Err(ArchiveError::Integrity(format!(
                "append to {}/{} with {} values but {} quality flags",
                self.content,
                self.msid,
                values.len(),
                bads.len()
            )));
        }
        self.values.append(values)?;
        self.quality.append(bads)?;
        Ok(())
    }

    /// Reads the half-open row range from both arrays.
    pub fn read_range(&mut self, row_lo: u64, row_hi: u64) -> Result<(ColumnData, Vec<bool>)> {
        let values = self.values.read_range(row_lo, row_hi)?;
        let bads = self.quality.read_range(row_lo, row_hi)?;
        Ok((values, bads))
    }

    /// Row count, verified against the quality bitmap.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::LengthDrift`] if the two arrays disagree,
    /// which signals prior corruption.
    pub fn len(&self) -> Result<u64> {
        if self.values.len() != self.quality.len() {
            return Err(ArchiveError::LengthDrift {
                content: self.content.clone(),
                msid: self.msid.clone(),
                rows: self.quality.len(),
                expected: self.values.len(),
            });
        }
        Ok(self.values.len())
    }

    /// Returns true if the column has no rows.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Element type of the value column.
    pub fn dtype(&self) -> DType {
        self.values.dtype()
    }

    /// Shrinks both arrays to `row_keep` rows, durably.
    pub fn truncate(&mut self, row_keep: u64) -> Result<()> {
        self.values.truncate(row_keep)?;
        self.quality.truncate(row_keep)?;
        Ok(())
    }

    /// Flushes both arrays to stable storage.
    pub fn sync(&mut self) -> Result<()> {
        self.values.sync()?;
        self.quality.sync()?;
        Ok(())
    }
}

/// Path-building and column access for one content type's directory.
#[derive(Debug, Clone)]
pub struct ContentStore {
    dir: PathBuf,
    content: String,
}

impl ContentStore {
    /// Creates a store rooted at `data_root/<content>`.
    pub fn new(data_root: &Path, content: &str) -> Self {
        Self { dir: data_root.join(content), content: content.to_string() }
    }

    /// Content type name.
    pub fn content(&self) -> &str {
        &self.content
    }

    /// The content directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Creates the content directory if needed.
    pub fn ensure_dir(&self) -> Result<()> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir)?;
        }
        Ok(())
    }

    /// Path of the value column for `msid`.
    pub fn col_path(&self, msid: &str) -> PathBuf {
        self.dir.join(format!("{msid}.col"))
    }

    /// Path of the quality bitmap for `msid`.
    pub fn qual_path(&self, msid: &str) -> PathBuf {
        self.dir.join(format!("{msid}.qual"))
    }

    /// Path of the archfiles catalog database.
    pub fn catalog_path(&self) -> PathBuf {
        self.dir.join("archfiles.db")
    }

    /// Directory holding stat stores of the given kind (`5min`/`daily`).
    pub fn stats_dir(&self, kind: &str) -> PathBuf {
        self.dir.join(kind)
    }

    /// Returns true if a column for `msid` has been created.
    pub fn has_column(&self, msid: &str) -> bool {
        self.col_path(msid).exists()
    }

    /// Opens an existing column pair for `msid`.
    pub fn open_column(&self, msid: &str, mode: OpenMode) -> Result<MsidColumn> {
        let values = ColumnFile::open(&self.col_path(msid), mode)?;
        let quality = QualityFile::open(&self.qual_path(msid), mode)?;
        Ok(MsidColumn {
            content: self.content.clone(),
            msid: msid.to_string(),
            values,
            quality,
        })
    }

    /// Opens the column pair for `msid`, creating it with `dtype` if absent.
    pub fn open_or_create_column(
        &self,
        msid: &str,
        dtype: DType,
        mode: OpenMode,
    ) -> Result<MsidColumn> {
        self.ensure_dir()?;
        let values = ColumnFile::open_or_create(&self.col_path(msid), dtype, mode)?;
        let quality = QualityFile::open_or_create(&self.qual_path(msid), mode)?;
        Ok(MsidColumn {
            content: self.content.clone(),
            msid: msid.to_string(),
            values,
            quality,
        })
    }

    /// Opens the shared TIME column.
    pub fn open_time(&self, mode: OpenMode) -> Result<MsidColumn> {
        self.open_column(TIME_COLUMN, mode)
    }

    /// Opens the shared TIME column, creating it if absent.
    pub fn open_or_create_time(&self, mode: OpenMode) -> Result<MsidColumn> {
        self.open_or_create_column(TIME_COLUMN, DType::F64, mode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_joint_append_and_drift() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path(), "thermal");
        let mut col = store
            .open_or_create_column("TEMP1", DType::F32, OpenMode::Append)
            .unwrap();
        col.append(&ColumnData::F32(vec![1.0, 2.0]), &[false, true]).unwrap();
        assert_eq!(col.len().unwrap(), 2);

        let err = col
            .append(&ColumnData::F32(vec![3.0]), &[false, false])
            .unwrap_err();
        assert!(matches!(err, ArchiveError::Integrity(_)));
    }

    #[test]
    fn test_time_column_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = ContentStore::new(dir.path(), "thermal");
        let mut time = store.open_or_create_time(OpenMode::Append).unwrap();
        time.append(&ColumnData::F64(vec![0.0, 1.0, 2.0]), &[false; 3]).unwrap();
        drop(time);

        let mut time = store.open_time(OpenMode::Read).unwrap();
        let (vals, bads) = time.read_range(0, 3).unwrap();
        assert_eq!(vals, ColumnData::F64(vec![0.0, 1.0, 2.0]));
        assert_eq!(bads, vec![false; 3]);
    }
}
