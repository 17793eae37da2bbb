//! Ordered data sources for fetch.
//!
//! A fetch can draw from several sources: the columnar archive itself
//! plus any secondary source (e.g. a live-telemetry proxy) able to answer
//! `(msid, tstart, tstop) → samples`. Sources are tried in order; a
//! source that does not know an MSID is skipped, and time ranges not
//! covered by earlier sources forward to later ones. Results record which
//! source contributed which range.

use crate::catalog::Catalog;
use crate::error::{ArchiveError, Result};
use crate::msid::{MsidMeta, MsidRegistry};
use crate::store::{ColumnData, ContentStore, OpenMode};
use std::path::{Path, PathBuf};
use tracing::debug;

use super::Values;

/// Raw full-resolution samples in storage units.
#[derive(Debug, Clone)]
pub struct RawSamples {
    /// Sample times (mission seconds).
    pub times: Vec<f64>,
    /// Sample values, unconverted.
    pub vals: Values,
    /// Per-sample quality flags.
    pub bads: Vec<bool>,
}

impl RawSamples {
    /// An empty sample set carrying the given value variant.
    pub fn empty(vals: Values) -> Self {
        Self { times: Vec::new(), vals, bads: Vec::new() }
    }

    fn append(&mut self, other: RawSamples) -> Result<()> {
        if self.times.is_empty() {
            *self = other;
            return Ok(());
        }
        match (&mut self.vals, other.vals) {
            (Values::Float(a), Values::Float(b)) => a.extend(b),
            (Values::Int(a), Values::Int(b)) => a.extend(b),
            (Values::Text(a), Values::Text(b)) => a.extend(b),
            (
                Values::State { raw: ra, labels: la },
                Values::State { raw: rb, labels: lb },
            ) => {
                ra.extend(rb);
                la.extend(lb);
            }
            _ => {
                return Err(ArchiveError::Unsupported(
                    "data sources returned mismatched value kinds".into(),
                ))
            }
        }
        self.times.extend(other.times);
        self.bads.extend(other.bads);
        Ok(())
    }
}

/// Per-range provenance entry on a fetch result.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceSpan {
    /// Name of the contributing source.
    pub source: String,
    /// First sample time contributed.
    pub tstart: f64,
    /// Last sample time contributed.
    pub tstop: f64,
}

/// One queryable telemetry source.
pub trait DataSource {
    /// Short name recorded in provenance spans.
    fn name(&self) -> &str;

    /// Returns true if this source can answer queries for `msid`.
    fn knows(&self, msid: &str) -> bool;

    /// Fetches raw samples in `[tstart, tstop)`, or `None` when the source
    /// has nothing in range.
    fn fetch_raw(&self, msid: &str, tstart: f64, tstop: f64) -> Result<Option<RawSamples>>;
}

/// The columnar archive as a data source.
#[derive(Debug)]
pub struct ArchiveSource<'a> {
    registry: &'a MsidRegistry,
    data_root: PathBuf,
}

impl<'a> ArchiveSource<'a> {
    /// Creates an archive source over `data_root`.
    pub fn new(registry: &'a MsidRegistry, data_root: &Path) -> Self {
        Self { registry, data_root: data_root.to_path_buf() }
    }
}

impl DataSource for ArchiveSource<'_> {
    fn name(&self) -> &str {
        "archive"
    }

    fn knows(&self, msid: &str) -> bool {
        self.registry.contains(msid)
    }

    fn fetch_raw(&self, msid: &str, tstart: f64, tstop: f64) -> Result<Option<RawSamples>> {
        let meta = self.registry.get(msid)?;
        let samples = read_archive_raw(&self.data_root, meta, tstart, tstop)?;
        Ok(if samples.times.is_empty() { None } else { Some(samples) })
    }
}

/// Ordered list of data sources built per query or per session.
#[derive(Default)]
pub struct Sources<'a> {
    list: Vec<Box<dyn DataSource + 'a>>,
}

impl<'a> Sources<'a> {
    /// An empty source list.
    pub fn new() -> Self {
        Self::default()
    }

    /// A source list containing only the archive.
    pub fn archive(registry: &'a MsidRegistry, data_root: &Path) -> Self {
        Self::new().with(ArchiveSource::new(registry, data_root))
    }

    /// Appends a source at the end of the try order.
    pub fn with(mut self, source: impl DataSource + 'a) -> Self {
        self.list.push(Box::new(source));
        self
    }

    /// Number of sources.
    pub fn len(&self) -> usize {
        self.list.len()
    }

    /// Returns true if no sources are configured.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Queries the sources in order, forwarding uncovered trailing ranges
    /// to later sources. Returns the merged samples and provenance spans.
    pub fn fetch(&self, msid: &str, tstart: f64, tstop: f64) -> Result<(RawSamples, Vec<SourceSpan>)> {
        let mut merged: Option<RawSamples> = None;
        let mut spans = Vec::new();
        let mut cursor = tstart;

        for source in &self.list {
            if !source.knows(msid) {
                debug!(source = source.name(), msid, "source does not know MSID");
                continue;
            }
            if cursor >= tstop {
                break;
            }
            let Some(mut samples) = source.fetch_raw(msid, cursor, tstop)? else {
                continue;
            };
            // Keep only samples past what earlier sources contributed.
            if let Some(prev) = &merged {
                if let Some(&last) = prev.times.last() {
                    let keep: Vec<bool> = samples.times.iter().map(|&t| t > last).collect();
                    if keep.iter().any(|&k| !k) {
                        let mut it = keep.iter();
                        samples.times.retain(|_| *it.next().unwrap());
                        samples.vals.retain(&keep);
                        let mut it = keep.iter();
                        samples.bads.retain(|_| *it.next().unwrap());
                    }
                }
            }
            if samples.times.is_empty() {
                continue;
            }
            spans.push(SourceSpan {
                source: source.name().to_string(),
                tstart: samples.times[0],
                tstop: *samples.times.last().unwrap(),
            });
            cursor = *samples.times.last().unwrap();
            match &mut merged {
                Some(prev) => prev.append(samples)?,
                None => merged = Some(samples),
            }
        }

        Ok((
            merged.unwrap_or_else(|| RawSamples::empty(Values::Float(Vec::new()))),
            spans,
        ))
    }
}

/// Reads raw full-resolution samples for one MSID from the archive.
///
/// The visibility horizon is the archfiles catalog tail; rows past it
/// belong to an interrupted ingest and are never returned. Rows whose
/// shared TIME sample is flagged bad are excluded outright (this happens
/// only around duplicate-timestamp collapse).
pub fn read_archive_raw(
    data_root: &Path,
    meta: &MsidMeta,
    tstart: f64,
    tstop: f64,
) -> Result<RawSamples> {
    let store = ContentStore::new(data_root, &meta.content);
    let empty = RawSamples::empty(empty_values(meta));
    if !store.catalog_path().exists() || !store.has_column(&meta.name) {
        return Ok(empty);
    }
    let catalog = Catalog::open(&store.catalog_path())?;
    let (row_lo, row_hi) = catalog.row_span(tstart, tstop)?;
    if row_lo >= row_hi {
        return Ok(empty);
    }

    let mut time_col = store.open_time(OpenMode::Read)?;
    let (times, time_bads) = time_col.read_range(row_lo, row_hi)?;
    let mut times = times.as_f64()?;

    let mut col = store.open_column(&meta.name, OpenMode::Read)?;
    let (mut vals, mut bads) = col.read_range(row_lo, row_hi)?;

    if time_bads.iter().any(|&b| b) {
        let keep: Vec<bool> = time_bads.iter().map(|&b| !b).collect();
        let mut it = keep.iter();
        times.retain(|_| *it.next().unwrap());
        vals = vals.filtered(&keep);
        let mut it = keep.iter();
        bads.retain(|_| *it.next().unwrap());
    }

    // The catalog gave an approximate slice; cut to the exact range.
    let i0 = times.partition_point(|&t| t < tstart);
    let i1 = times.partition_point(|&t| t < tstop);
    let times = times[i0..i1].to_vec();
    let vals = vals.slice(i0, i1);
    let bads = bads[i0..i1].to_vec();

    Ok(RawSamples { times, vals: make_values(meta, vals)?, bads })
}

fn empty_values(meta: &MsidMeta) -> Values {
    if meta.is_state() {
        Values::State { raw: Vec::new(), labels: Vec::new() }
    } else if matches!(meta.dtype, crate::store::DType::Str(_)) {
        Values::Text(Vec::new())
    } else if matches!(meta.dtype, crate::store::DType::F32 | crate::store::DType::F64) {
        Values::Float(Vec::new())
    } else {
        Values::Int(Vec::new())
    }
}

/// Shapes raw column data into fetch values: state codes resolve through
/// the state-code table, strings become text, floats and integers pass
/// through in storage units.
pub fn make_values(meta: &MsidMeta, data: ColumnData) -> Result<Values> {
    if let Some(codes) = &meta.state_codes {
        let raw = data.as_i64()?;
        let labels = raw
            .iter()
            .map(|code| {
                codes
                    .iter()
                    .find(|(c, _)| c == code)
                    .map(|(_, s)| s.clone())
                    .unwrap_or_else(|| code.to_string())
            })
            .collect();
        return Ok(Values::State { raw, labels });
    }
    match data {
        ColumnData::Str { .. } => Ok(Values::Text(data.as_strings()?)),
        ColumnData::F32(_) | ColumnData::F64(_) => Ok(Values::Float(data.as_f64()?)),
        other => Ok(Values::Int(other.as_i64()?)),
    }
}
