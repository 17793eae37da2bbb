//! Ingest pipeline: turns an ordered stream of decom source files for one
//! content type into correct, idempotent column appends.
//!
//! The durability discipline per source file is:
//!
//! ```text
//! decom → validate → append all columns → fsync → catalog insert → event
//! ```
//!
//! The catalog row is committed only after every column fsync, so readers
//! using the catalog tail as their visibility horizon observe either the
//! whole file or none of it. A crash between append and commit leaves
//! orphan rows past the catalog tail; the recovery sweep at the start of
//! the next ingest truncates them away.

use crate::catalog::{ArchfileRecord, Catalog};
use crate::error::{ArchiveError, Result};
use crate::msid::{ContentMeta, MsidRegistry};
use crate::stats::store::StatStore;
use crate::stats::StatKind;
use crate::store::{ColumnData, ContentStore, MsidColumn, OpenMode};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Hard upper bound on an acceptable inter-file gap (seconds). Beyond this
/// the file is rejected and the operator must truncate or backfill.
pub const HARD_GAP_LIMIT: f64 = 1.0e6;

/// Decoded contents of one source file: row-aligned columns for every MSID
/// of the content plus file-level metadata.
#[derive(Debug, Clone)]
pub struct DecomProduct {
    /// Source file name (catalog primary key).
    pub filename: String,
    /// File timestamp from the upstream naming scheme.
    pub filetime: i64,
    /// First sample time (mission seconds).
    pub tstart: f64,
    /// Projected stop time (mission seconds).
    pub tstop: f64,
    /// Upstream processing revision.
    pub revision: i64,
    /// Decom software version string.
    pub decom_version: String,
    /// Shared time column for all rows of the file.
    pub times: Vec<f64>,
    /// Per-MSID values and quality flags, all of length `times.len()`.
    pub columns: BTreeMap<String, (ColumnData, Vec<bool>)>,
}

/// Abstract reader for upstream decom products. The archive core does not
/// care about the physical file format.
pub trait DecomReader {
    /// Decodes one source file into row-aligned columns.
    fn decom(&self, path: &Path) -> Result<DecomProduct>;
}

/// Options controlling gap handling during ingest.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Accept gaps between `max_gap` and the hard limit without stopping.
    pub allow_gap: bool,
    /// Reject outright any gap larger than this (seconds).
    pub hard_gap_limit: f64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self { allow_gap: false, hard_gap_limit: HARD_GAP_LIMIT }
    }
}

/// Post-append notification consumed by the statistics engine.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendEvent {
    /// Content type that grew.
    pub content: String,
    /// First new row.
    pub rowstart: u64,
    /// One past the last new row.
    pub rowstop: u64,
    /// First new sample time.
    pub tstart: f64,
    /// Projected stop time of the appended span.
    pub tstop: f64,
}

/// Single writer for one or more content types.
#[derive(Debug)]
pub struct IngestPipeline<'a> {
    registry: &'a MsidRegistry,
    data_root: PathBuf,
    config: IngestConfig,
}

impl<'a> IngestPipeline<'a> {
    /// Creates a pipeline with default gap handling.
    pub fn new(registry: &'a MsidRegistry, data_root: &Path) -> Self {
        Self::with_config(registry, data_root, IngestConfig::default())
    }

    /// Creates a pipeline with explicit gap handling options.
    pub fn with_config(
        registry: &'a MsidRegistry,
        data_root: &Path,
        config: IngestConfig,
    ) -> Self {
        Self { registry, data_root: data_root.to_path_buf(), config }
    }

    /// Ingests a batch of source files for `content`, in order.
    ///
    /// Files already in the catalog append nothing. A file that fails to
    /// decode is skipped without advancing the catalog. A gap above the
    /// content's limit stops the batch (the remaining files stay pending
    /// for a later run) unless `allow_gap` is set; a gap above the hard
    /// limit or an overlap is an error.
    pub fn ingest_files(
        &self,
        content: &str,
        files: &[PathBuf],
        reader: &dyn DecomReader,
    ) -> Result<Vec<AppendEvent>> {
        let meta = self.registry.content(content)?;
        let store = ContentStore::new(&self.data_root, content);
        store.ensure_dir()?;
        let catalog = Catalog::open(&store.catalog_path())?;

        self.recovery_sweep(&store, &catalog, meta)?;

        let mut events = Vec::new();
        for path in files {
            let product = match reader.decom(path) {
                Ok(product) => product,
                Err(ArchiveError::SourceDecom { filename, reason }) => {
                    warn!(filename = %filename, reason = %reason, "skipping undecodable source file");
                    continue;
                }
                Err(err) => return Err(err),
            };
            match self.ingest_product(&store, &catalog, meta, product)? {
                IngestOutcome::Appended(event) => events.push(event),
                IngestOutcome::AlreadyIngested => {}
                IngestOutcome::GapStop => break,
            }
        }
        Ok(events)
    }

    /// Ingests one already-decoded product (used directly by the derived
    /// parameter engine).
    pub fn ingest_product_for(
        &self,
        content: &str,
        product: DecomProduct,
    ) -> Result<Option<AppendEvent>> {
        let meta = self.registry.content(content)?;
        let store = ContentStore::new(&self.data_root, content);
        store.ensure_dir()?;
        let catalog = Catalog::open(&store.catalog_path())?;
        self.recovery_sweep(&store, &catalog, meta)?;
        match self.ingest_product(&store, &catalog, meta, product)? {
            IngestOutcome::Appended(event) => Ok(Some(event)),
            _ => Ok(None),
        }
    }

    fn ingest_product(
        &self,
        store: &ContentStore,
        catalog: &Catalog,
        meta: &ContentMeta,
        product: DecomProduct,
    ) -> Result<IngestOutcome> {
        // Replay safety: identical reruns produce zero appends.
        if catalog.has(&product.filename)? {
            debug!(filename = %product.filename, "file already in archfiles - skipping");
            return Ok(IngestOutcome::AlreadyIngested);
        }
        if catalog.has_filetime(product.filetime)? {
            return Err(ArchiveError::OverlappingFile {
                content: meta.name.clone(),
                filename: product.filename,
                filetime: product.filetime,
            });
        }

        let row_bads = validate_times(&product)?;

        // Gap policy against the previous file's projected tstop.
        if let Some(gap) = catalog.gap_to(product.tstart)? {
            if gap < 0.0 || gap > self.config.hard_gap_limit {
                return Err(ArchiveError::Gap {
                    content: meta.name.clone(),
                    filename: product.filename,
                    gap_secs: gap,
                });
            }
            if gap > meta.max_gap {
                warn!(
                    content = %meta.name,
                    filename = %product.filename,
                    gap_secs = gap,
                    "gap between archive files exceeds content limit"
                );
                if !self.config.allow_gap {
                    return Ok(IngestOutcome::GapStop);
                }
            }
        }

        // All column lengths must match before anything is appended so a
        // bad product cannot leave the content partially extended.
        let n = product.times.len();
        for (msid, (values, bads)) in &product.columns {
            if values.len() != n || bads.len() != n {
                return Err(ArchiveError::SourceDecom {
                    filename: product.filename.clone(),
                    reason: format!(
                        "column {msid} has {} values / {} flags for {n} rows",
                        values.len(),
                        bads.len()
                    ),
                });
            }
        }

        let rowstart = catalog.last_row()?;
        let rowstop = rowstart + n as u64;

        // Append the shared TIME column and then every MSID of the content
        // with the same N. MSIDs missing from this product (a channel added
        // upstream mid-mission) are backfilled with bad rows.
        let mut columns: Vec<MsidColumn> = Vec::with_capacity(meta.msids.len() + 1);
        let mut time_col = store.open_or_create_time(OpenMode::Append)?;
        time_col.append(&ColumnData::F64(product.times.clone()), &row_bads)?;
        columns.push(time_col);

        for msid in &meta.msids {
            let msid_meta = self.registry.get(msid)?;
            let mut col =
                store.open_or_create_column(msid, msid_meta.dtype, OpenMode::Append)?;
            match product.columns.get(msid) {
                Some((values, bads)) => {
                    let merged: Vec<bool> = bads
                        .iter()
                        .zip(&row_bads)
                        .map(|(&b, &r)| b || r)
                        .collect();
                    col.append(values, &merged)?;
                }
                None => {
                    debug!(msid = %msid, filename = %product.filename, "backfilling absent column");
                    col.append(&ColumnData::zeros(msid_meta.dtype, n), &vec![true; n])?;
                }
            }
            columns.push(col);
        }
        for name in product.columns.keys() {
            if !meta.msids.contains(name) {
                warn!(msid = %name, content = %meta.name, "ignoring unregistered column");
            }
        }

        // fsync every column before the catalog commit; the commit order is
        // what makes a torn append recoverable.
        for col in &mut columns {
            col.sync()?;
        }

        catalog.record(&ArchfileRecord {
            filename: product.filename.clone(),
            filetime: product.filetime,
            tstart: product.tstart,
            tstop: product.tstop,
            rowstart,
            rowstop,
            revision: product.revision,
            ingest_date: ingest_date(),
            decom_ver: product.decom_version,
        })?;

        info!(
            content = %meta.name,
            filename = %product.filename,
            rows = n,
            "ingested source file"
        );
        Ok(IngestOutcome::Appended(AppendEvent {
            content: meta.name.clone(),
            rowstart,
            rowstop,
            tstart: product.tstart,
            tstop: product.tstop,
        }))
    }

    /// Truncates every column past the catalog tail. Repairs a crash that
    /// happened between column fsync and catalog commit.
    fn recovery_sweep(
        &self,
        store: &ContentStore,
        catalog: &Catalog,
        meta: &ContentMeta,
    ) -> Result<()> {
        let last_row = catalog.last_row()?;
        let mut names: Vec<&str> = vec![crate::store::TIME_COLUMN];
        names.extend(meta.msids.iter().map(String::as_str));
        for name in names {
            if !store.has_column(name) {
                continue;
            }
            let mut col = store.open_column(name, OpenMode::Truncate)?;
            let rows = col.len()?;
            if rows > last_row {
                warn!(
                    content = %meta.name,
                    msid = name,
                    rows,
                    last_row,
                    "recovery sweep truncating orphan rows"
                );
                col.truncate(last_row)?;
            }
        }
        Ok(())
    }

    /// Operator repair: removes all data with `tstart >= t_cut`.
    ///
    /// Columns are truncated to the first row of the earliest archfile at
    /// or after the cutoff, matching catalog rows are deleted, and the stat
    /// stores are cut back past the cutoff so the next statistics run
    /// recomputes them.
    pub fn truncate(&self, content: &str, t_cut: f64) -> Result<()> {
        let meta = self.registry.content(content)?;
        let store = ContentStore::new(&self.data_root, content);
        if !store.catalog_path().exists() {
            return Ok(());
        }
        let catalog = Catalog::open(&store.catalog_path())?;

        let Some(rowstart) = catalog.delete_after(t_cut)? else {
            debug!(content, "no archfiles at or after cutoff - nothing to truncate");
            return Ok(());
        };
        info!(content, t_cut, rowstart, "truncating content");

        let mut names: Vec<&str> = vec![crate::store::TIME_COLUMN];
        names.extend(meta.msids.iter().map(String::as_str));
        for name in names {
            if store.has_column(name) {
                store
                    .open_column(name, OpenMode::Truncate)?
                    .truncate(rowstart)?;
            }
        }

        for msid in &meta.msids {
            for kind in [StatKind::FiveMin, StatKind::Daily] {
                let path = store.stats_dir(kind.dir_name()).join(format!("{msid}.stats"));
                if path.exists() {
                    StatStore::open(&path)?.truncate_after_time(t_cut)?;
                }
            }
        }
        Ok(())
    }

    /// Checks the content's structural invariants: equal column lengths
    /// matching the catalog tail, ordered TIME, and archfile row spans
    /// consistent with their recorded time spans.
    pub fn verify(&self, content: &str) -> Result<()> {
        let meta = self.registry.content(content)?;
        let store = ContentStore::new(&self.data_root, content);
        let catalog = Catalog::open(&store.catalog_path())?;
        let last_row = catalog.last_row()?;

        let mut time_col = store.open_time(OpenMode::Read)?;
        if time_col.len()? != last_row {
            return Err(ArchiveError::Integrity(format!(
                "{content}: TIME has {} rows, catalog tail is {last_row}",
                time_col.len()?
            )));
        }
        for msid in &meta.msids {
            let col = store.open_column(msid, OpenMode::Read)?;
            let rows = col.len()?;
            if rows != last_row {
                return Err(ArchiveError::LengthDrift {
                    content: content.to_string(),
                    msid: msid.clone(),
                    rows,
                    expected: last_row,
                });
            }
        }

        let (times, time_bads) = time_col.read_range(0, last_row)?;
        let times = times.as_f64()?;
        let mut last_good: Option<f64> = None;
        for (i, (&t, &bad)) in times.iter().zip(&time_bads).enumerate() {
            if i > 0 && t < times[i - 1] {
                return Err(ArchiveError::Integrity(format!(
                    "{content}: TIME decreases at row {i}"
                )));
            }
            if !bad {
                if let Some(prev) = last_good {
                    if t <= prev {
                        return Err(ArchiveError::Integrity(format!(
                            "{content}: duplicate good TIME {t} at row {i}"
                        )));
                    }
                }
                last_good = Some(t);
            }
        }

        let mut prev_stop = 0u64;
        for rec in catalog.all()? {
            if rec.rowstart != prev_stop {
                return Err(ArchiveError::Integrity(format!(
                    "{content}: archfile {} starts at row {} but previous stopped at {}",
                    rec.filename, rec.rowstart, prev_stop
                )));
            }
            for &t in &times[rec.rowstart as usize..rec.rowstop as usize] {
                if t < rec.tstart || t > rec.tstop {
                    return Err(ArchiveError::Integrity(format!(
                        "{content}: time {t} outside archfile {} span [{}, {}]",
                        rec.filename, rec.tstart, rec.tstop
                    )));
                }
            }
            prev_stop = rec.rowstop;
        }
        Ok(())
    }
}

enum IngestOutcome {
    Appended(AppendEvent),
    AlreadyIngested,
    GapStop,
}

/// Checks the product's time column and returns the per-row bad mask from
/// the duplicate-timestamp tie rule: equal-timestamp rows keep the first
/// and mark the rest bad.
fn validate_times(product: &DecomProduct) -> Result<Vec<bool>> {
    let times = &product.times;
    if times.is_empty() {
        return Err(ArchiveError::SourceDecom {
            filename: product.filename.clone(),
            reason: "no rows".to_string(),
        });
    }
    let mut row_bads = vec![false; times.len()];
    for i in 1..times.len() {
        if times[i] < times[i - 1] {
            return Err(ArchiveError::SourceDecom {
                filename: product.filename.clone(),
                reason: format!("time column decreases at row {i}"),
            });
        }
        if times[i] == times[i - 1] {
            row_bads[i] = true;
        }
    }
    Ok(row_bads)
}

fn ingest_date() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs.to_string()
}
