//! Archfiles catalog: the per-content relational record of every ingested
//! source file.
//!
//! One SQLite database per content type (`archfiles.db`) with primary key
//! `filename` and a secondary index on `filetime`. The catalog drives
//! idempotent replay, gap detection, fetch row location and truncation.
//! Its `max(rowstop)` is also the readers' visibility horizon: rows beyond
//! it exist only if a crash interrupted an ingest, and the next ingest's
//! recovery sweep removes them.

use crate::error::Result;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS archfiles (
  filename     TEXT PRIMARY KEY,
  filetime     INTEGER NOT NULL,
  tstart       REAL NOT NULL,
  tstop        REAL NOT NULL,
  rowstart     INTEGER NOT NULL,
  rowstop      INTEGER NOT NULL,
  revision     INTEGER NOT NULL,
  ingest_date  TEXT NOT NULL,
  decom_ver    TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_archfiles_filetime ON archfiles (filetime);
";

/// One catalog row describing a successfully ingested source file.
///
/// `rowstart..rowstop` is the half-open interval of column rows the file
/// contributed.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchfileRecord {
    /// Source file name (primary key).
    pub filename: String,
    /// File timestamp used for ordering, from the upstream naming scheme.
    pub filetime: i64,
    /// First sample time in the file (mission seconds).
    pub tstart: f64,
    /// Projected stop time of the file (mission seconds).
    pub tstop: f64,
    /// First column row contributed by this file.
    pub rowstart: u64,
    /// One past the last column row contributed by this file.
    pub rowstop: u64,
    /// Upstream processing revision.
    pub revision: i64,
    /// Date string recorded at ingest time.
    pub ingest_date: String,
    /// Decom software version string from the source file.
    pub decom_ver: String,
}

/// Handle to one content type's archfiles catalog.
#[derive(Debug)]
pub struct Catalog {
    conn: Connection,
}

impl Catalog {
    /// Opens (or creates) the catalog database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Returns true if `filename` was already ingested.
    pub fn has(&self, filename: &str) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT count(*) FROM archfiles WHERE filename = ?1",
            params![filename],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Returns true if a file with this `filetime` was already ingested.
    pub fn has_filetime(&self, filetime: i64) -> Result<bool> {
        let n: i64 = self.conn.query_row(
            "SELECT count(*) FROM archfiles WHERE filetime = ?1",
            params![filetime],
            |row| row.get(0),
        )?;
        Ok(n > 0)
    }

    /// Tail row index: `max(rowstop)`, or 0 for an empty catalog. This is
    /// where the next append starts and how far readers may look.
    pub fn last_row(&self) -> Result<u64> {
        let row: Option<i64> = self.conn.query_row(
            "SELECT max(rowstop) FROM archfiles",
            [],
            |row| row.get(0),
        )?;
        Ok(row.unwrap_or(0) as u64)
    }

    /// Projected stop time of the most recently ingested file (by filetime).
    pub fn last_tstop(&self) -> Result<Option<f64>> {
        Ok(self
            .conn
            .query_row(
                "SELECT tstop FROM archfiles ORDER BY filetime DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Filename of the most recently ingested file (by filetime).
    pub fn last_filename(&self) -> Result<Option<String>> {
        Ok(self
            .conn
            .query_row(
                "SELECT filename FROM archfiles ORDER BY filetime DESC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Seconds between the previous file's tstop and a candidate tstart.
    /// `None` for an empty catalog (no gap to measure).
    pub fn gap_to(&self, tstart: f64) -> Result<Option<f64>> {
        Ok(self.last_tstop()?.map(|tstop| tstart - tstop))
    }

    /// Inserts a record. Must only be called after the column appends for
    /// this file have been flushed to stable storage.
    pub fn record(&self, rec: &ArchfileRecord) -> Result<()> {
        self.conn.execute(
            "INSERT INTO archfiles
               (filename, filetime, tstart, tstop, rowstart, rowstop,
                revision, ingest_date, decom_ver)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                rec.filename,
                rec.filetime,
                rec.tstart,
                rec.tstop,
                rec.rowstart as i64,
                rec.rowstop as i64,
                rec.revision,
                rec.ingest_date,
                rec.decom_ver,
            ],
        )?;
        Ok(())
    }

    /// Deletes all records with `tstart >= t_cut` and returns the first
    /// `rowstart` among them; the caller truncates the columns to that row.
    pub fn delete_after(&self, t_cut: f64) -> Result<Option<u64>> {
        let rowstart: Option<i64> = self.conn.query_row(
            "SELECT min(rowstart) FROM archfiles WHERE tstart >= ?1",
            params![t_cut],
            |row| row.get(0),
        )?;
        let Some(rowstart) = rowstart else {
            return Ok(None);
        };
        self.conn
            .execute("DELETE FROM archfiles WHERE tstart >= ?1", params![t_cut])?;
        Ok(Some(rowstart as u64))
    }

    /// Approximate row slice enclosing `[tstart, tstop)`, built from the
    /// nearest archfiles on either side. The caller refines the slice with
    /// a binary search of the TIME column.
    pub fn row_span(&self, tstart: f64, tstop: f64) -> Result<(u64, u64)> {
        let row_lo: Option<i64> = self
            .conn
            .query_row(
                "SELECT rowstart FROM archfiles WHERE tstart <= ?1
                 ORDER BY tstart DESC LIMIT 1",
                params![tstart],
                |row| row.get(0),
            )
            .optional()?;
        let row_hi: Option<i64> = self
            .conn
            .query_row(
                "SELECT rowstop FROM archfiles WHERE tstop >= ?1
                 ORDER BY tstop ASC LIMIT 1",
                params![tstop],
                |row| row.get(0),
            )
            .optional()?;
        let last = self.last_row()?;
        Ok((
            row_lo.map(|r| r as u64).unwrap_or(0),
            row_hi.map(|r| r as u64).unwrap_or(last).min(last),
        ))
    }

    /// All records ordered by `rowstart`, for integrity verification.
    pub fn all(&self) -> Result<Vec<ArchfileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT filename, filetime, tstart, tstop, rowstart, rowstop,
                    revision, ingest_date, decom_ver
             FROM archfiles ORDER BY rowstart",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(ArchfileRecord {
                filename: row.get(0)?,
                filetime: row.get(1)?,
                tstart: row.get(2)?,
                tstop: row.get(3)?,
                rowstart: row.get::<_, i64>(4)? as u64,
                rowstop: row.get::<_, i64>(5)? as u64,
                revision: row.get(6)?,
                ingest_date: row.get(7)?,
                decom_ver: row.get(8)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Number of records in the catalog.
    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT count(*) FROM archfiles", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(filename: &str, filetime: i64, tstart: f64, tstop: f64, rows: (u64, u64)) -> ArchfileRecord {
        ArchfileRecord {
            filename: filename.to_string(),
            filetime,
            tstart,
            tstop,
            rowstart: rows.0,
            rowstop: rows.1,
            revision: 1,
            ingest_date: "2024:001:00:00:00".to_string(),
            decom_ver: "8.4".to_string(),
        }
    }

    #[test]
    fn test_record_and_lookups() {
        let dir = TempDir::new().unwrap();
        let cat = Catalog::open(&dir.path().join("archfiles.db")).unwrap();
        assert_eq!(cat.last_row().unwrap(), 0);
        assert_eq!(cat.gap_to(5.0).unwrap(), None);

        cat.record(&record("f1.fits", 0, 0.0, 100.0, (0, 100))).unwrap();
        cat.record(&record("f2.fits", 100, 100.0, 200.0, (100, 200))).unwrap();

        assert!(cat.has("f1.fits").unwrap());
        assert!(!cat.has("f3.fits").unwrap());
        assert!(cat.has_filetime(100).unwrap());
        assert_eq!(cat.last_row().unwrap(), 200);
        assert_eq!(cat.gap_to(205.0).unwrap(), Some(5.0));
    }

    #[test]
    fn test_delete_after() {
        let dir = TempDir::new().unwrap();
        let cat = Catalog::open(&dir.path().join("archfiles.db")).unwrap();
        cat.record(&record("f1.fits", 0, 0.0, 100.0, (0, 100))).unwrap();
        cat.record(&record("f2.fits", 100, 100.0, 200.0, (100, 200))).unwrap();

        assert_eq!(cat.delete_after(100.0).unwrap(), Some(100));
        assert_eq!(cat.count().unwrap(), 1);
        assert_eq!(cat.last_row().unwrap(), 100);
        assert_eq!(cat.delete_after(500.0).unwrap(), None);
    }

    #[test]
    fn test_row_span() {
        let dir = TempDir::new().unwrap();
        let cat = Catalog::open(&dir.path().join("archfiles.db")).unwrap();
        cat.record(&record("f1.fits", 0, 0.0, 100.0, (0, 100))).unwrap();
        cat.record(&record("f2.fits", 100, 100.0, 200.0, (100, 200))).unwrap();
        cat.record(&record("f3.fits", 200, 200.0, 300.0, (200, 300))).unwrap();

        assert_eq!(cat.row_span(120.0, 180.0).unwrap(), (100, 200));
        assert_eq!(cat.row_span(50.0, 250.0).unwrap(), (0, 300));
        // Ranges beyond the data clamp to the catalog tail.
        assert_eq!(cat.row_span(400.0, 500.0).unwrap(), (200, 300));
    }
}
