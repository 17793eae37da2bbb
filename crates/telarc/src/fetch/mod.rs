//! Fetch engine: time-range queries over the archive.
//!
//! A query names one MSID (or a glob) plus a time range and returns a
//! [`Msid`] result whose payload is a tagged sum over the requested
//! resolution: full-resolution samples or 5-minute/daily aggregate
//! series. Multi-MSID queries return a [`MsidSet`] which can be
//! interpolated onto a common time grid.
//!
//! Readers never look past the archfiles catalog tail, so a fetch sees
//! either the whole effect of a source file's ingest or none of it.

pub mod interpolate;
pub mod intervals;
pub mod sources;

use crate::error::{ArchiveError, Result};
use crate::msid::{MsidMeta, MsidRegistry};
use crate::stats::store::{StatLayout, StatStore};
use crate::stats::StatKind;
use crate::store::ContentStore;
use crate::units::UnitSystem;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub use interpolate::InterpOptions;
pub use intervals::Interval;
pub use sources::{DataSource, RawSamples, SourceSpan, Sources};

/// Options for a fetch query.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Requested resolution: `None` for full resolution, or a stat kind.
    pub stat: Option<StatKind>,
    /// Drop bad samples from full-resolution output.
    pub filter_bad: bool,
    /// Unit system override; the engine default applies when `None`.
    pub unit_system: Option<UnitSystem>,
}

impl FetchOptions {
    /// Full-resolution query keeping bad samples.
    pub fn full() -> Self {
        Self::default()
    }

    /// Full-resolution query dropping bad samples.
    pub fn full_filtered() -> Self {
        Self { filter_bad: true, ..Self::default() }
    }

    /// Aggregate query of the given kind.
    pub fn stat(kind: StatKind) -> Self {
        Self { stat: Some(kind), ..Self::default() }
    }
}

/// Engine-level configuration.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Default unit system for results.
    pub unit_system: UnitSystem,
    /// Maximum MSIDs one set query may expand to.
    pub max_glob_matches: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self { unit_system: UnitSystem::Cxc, max_glob_matches: 10 }
    }
}

/// Sample values of one MSID, shaped by its element type.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    /// Numeric values (floats, or integers after unit conversion).
    Float(Vec<f64>),
    /// Raw integer values with no conversion.
    Int(Vec<i64>),
    /// Fixed-width string values.
    Text(Vec<String>),
    /// State-valued MSID: raw codes plus resolved state strings.
    State {
        /// Raw integer codes as stored.
        raw: Vec<i64>,
        /// State strings resolved through the state-code table.
        labels: Vec<String>,
    },
}

impl Values {
    /// Number of samples.
    pub fn len(&self) -> usize {
        match self {
            Values::Float(v) => v.len(),
            Values::Int(v) => v.len(),
            Values::Text(v) => v.len(),
            Values::State { raw, .. } => raw.len(),
        }
    }

    /// Returns true if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Numeric view as `f64` (raw codes for state MSIDs).
    pub fn as_f64(&self) -> Result<Vec<f64>> {
        match self {
            Values::Float(v) => Ok(v.clone()),
            Values::Int(v) => Ok(v.iter().map(|&x| x as f64).collect()),
            Values::State { raw, .. } => Ok(raw.iter().map(|&x| x as f64).collect()),
            Values::Text(_) => Err(ArchiveError::Unsupported(
                "string values have no numeric view".into(),
            )),
        }
    }

    fn retain(&mut self, keep: &[bool]) {
        fn apply<T>(v: &mut Vec<T>, keep: &[bool]) {
            let mut it = keep.iter();
            v.retain(|_| *it.next().unwrap());
        }
        match self {
            Values::Float(v) => apply(v, keep),
            Values::Int(v) => apply(v, keep),
            Values::Text(v) => apply(v, keep),
            Values::State { raw, labels } => {
                apply(raw, keep);
                apply(labels, keep);
            }
        }
    }

    fn take(&self, indexes: &[usize]) -> Self {
        fn pick<T: Clone>(v: &[T], idx: &[usize]) -> Vec<T> {
            idx.iter().map(|&i| v[i].clone()).collect()
        }
        match self {
            Values::Float(v) => Values::Float(pick(v, indexes)),
            Values::Int(v) => Values::Int(pick(v, indexes)),
            Values::Text(v) => Values::Text(pick(v, indexes)),
            Values::State { raw, labels } => Values::State {
                raw: pick(raw, indexes),
                labels: pick(labels, indexes),
            },
        }
    }
}

/// Full-resolution payload of a fetch result.
#[derive(Debug, Clone)]
pub struct FullResData {
    /// Sample times (mission seconds).
    pub times: Vec<f64>,
    /// Sample values.
    pub vals: Values,
    /// Per-sample quality; `None` once bad samples have been filtered.
    pub bads: Option<Vec<bool>>,
    /// Original pre-interpolation timestamps, set by interpolation.
    pub times0: Option<Vec<f64>>,
}

impl FullResData {
    /// Number of samples.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    /// Returns true if there are no samples.
    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub(crate) fn retain(&mut self, keep: &[bool]) {
        let mut it = keep.iter();
        self.times.retain(|_| *it.next().unwrap());
        self.vals.retain(keep);
        if let Some(bads) = &mut self.bads {
            let mut it = keep.iter();
            bads.retain(|_| *it.next().unwrap());
        }
        if let Some(times0) = &mut self.times0 {
            let mut it = keep.iter();
            times0.retain(|_| *it.next().unwrap());
        }
    }
}

/// Daily percentile series.
#[derive(Debug, Clone, Default)]
pub struct PercentileSeries {
    /// 1st percentile per interval.
    pub p01s: Vec<f64>,
    /// 5th percentile per interval.
    pub p05s: Vec<f64>,
    /// 16th percentile per interval.
    pub p16s: Vec<f64>,
    /// Median per interval.
    pub p50s: Vec<f64>,
    /// 84th percentile per interval.
    pub p84s: Vec<f64>,
    /// 95th percentile per interval.
    pub p95s: Vec<f64>,
    /// 99th percentile per interval.
    pub p99s: Vec<f64>,
}

/// Aggregate payload for numeric MSIDs.
#[derive(Debug, Clone, Default)]
pub struct StatSeries {
    /// Mission-global interval indices.
    pub indexes: Vec<i64>,
    /// Window midpoint times `(index + 0.5)·Δ`.
    pub times: Vec<f64>,
    /// Good-sample counts.
    pub n_samples: Vec<u32>,
    /// Window midpoint sample values.
    pub midvals: Vec<f64>,
    /// Window minima.
    pub mins: Vec<f64>,
    /// Window maxima.
    pub maxes: Vec<f64>,
    /// Time-weighted means.
    pub means: Vec<f64>,
    /// Time-weighted standard deviations.
    pub stds: Vec<f64>,
    /// Percentile series (daily kind only).
    pub percentiles: Option<PercentileSeries>,
}

impl StatSeries {
    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Returns true if there are no intervals.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    fn retain(&mut self, keep: &[bool]) {
        fn apply<T>(v: &mut Vec<T>, keep: &[bool]) {
            let mut it = keep.iter();
            v.retain(|_| *it.next().unwrap());
        }
        apply(&mut self.indexes, keep);
        apply(&mut self.times, keep);
        apply(&mut self.n_samples, keep);
        apply(&mut self.midvals, keep);
        apply(&mut self.mins, keep);
        apply(&mut self.maxes, keep);
        apply(&mut self.means, keep);
        apply(&mut self.stds, keep);
        if let Some(ps) = &mut self.percentiles {
            apply(&mut ps.p01s, keep);
            apply(&mut ps.p05s, keep);
            apply(&mut ps.p16s, keep);
            apply(&mut ps.p50s, keep);
            apply(&mut ps.p84s, keep);
            apply(&mut ps.p95s, keep);
            apply(&mut ps.p99s, keep);
        }
    }
}

/// Aggregate payload for state-valued MSIDs.
#[derive(Debug, Clone, Default)]
pub struct StateSeries {
    /// Mission-global interval indices.
    pub indexes: Vec<i64>,
    /// Window midpoint times `(index + 0.5)·Δ`.
    pub times: Vec<f64>,
    /// Good-sample counts.
    pub n_samples: Vec<u32>,
    /// Window midpoint raw codes.
    pub midvals: Vec<i64>,
    /// Per-state counts: `(raw code, state string, counts per interval)`.
    pub counts: Vec<(i64, String, Vec<u32>)>,
}

impl StateSeries {
    /// Number of intervals.
    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    /// Returns true if there are no intervals.
    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    fn retain(&mut self, keep: &[bool]) {
        fn apply<T>(v: &mut Vec<T>, keep: &[bool]) {
            let mut it = keep.iter();
            v.retain(|_| *it.next().unwrap());
        }
        apply(&mut self.indexes, keep);
        apply(&mut self.times, keep);
        apply(&mut self.n_samples, keep);
        apply(&mut self.midvals, keep);
        for (_, _, counts) in &mut self.counts {
            apply(counts, keep);
        }
    }
}

/// Payload of a fetch result, by requested resolution and element kind.
#[derive(Debug, Clone)]
pub enum FetchData {
    /// Full-resolution samples.
    FullRes(FullResData),
    /// 5-minute aggregates of a numeric MSID.
    Stat5Min(StatSeries),
    /// Daily aggregates of a numeric MSID, including percentiles.
    StatDaily(StatSeries),
    /// Aggregates of a state-valued MSID (either kind).
    StatState(StateSeries),
}

impl FetchData {
    /// Number of samples or intervals.
    pub fn len(&self) -> usize {
        match self {
            FetchData::FullRes(d) => d.len(),
            FetchData::Stat5Min(s) | FetchData::StatDaily(s) => s.len(),
            FetchData::StatState(s) => s.len(),
        }
    }

    /// Returns true if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample or interval-midpoint times.
    pub fn times(&self) -> &[f64] {
        match self {
            FetchData::FullRes(d) => &d.times,
            FetchData::Stat5Min(s) | FetchData::StatDaily(s) => &s.times,
            FetchData::StatState(s) => &s.times,
        }
    }

    pub(crate) fn retain(&mut self, keep: &[bool]) {
        match self {
            FetchData::FullRes(d) => d.retain(keep),
            FetchData::Stat5Min(s) | FetchData::StatDaily(s) => s.retain(keep),
            FetchData::StatState(s) => s.retain(keep),
        }
    }
}

/// Result of a single-MSID query.
#[derive(Debug, Clone)]
pub struct Msid {
    /// Canonical MSID name.
    pub msid: String,
    /// Owning content type.
    pub content: String,
    /// Query start time.
    pub tstart: f64,
    /// Query stop time.
    pub tstop: f64,
    /// Unit label in the selected unit system.
    pub unit: Option<String>,
    /// Payload.
    pub data: FetchData,
    /// Which data source contributed which time range.
    pub sources: Vec<SourceSpan>,
}

impl Msid {
    /// Number of samples or intervals.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if the result is empty.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Drops bad samples and clears the quality array. No effect on
    /// aggregate payloads (their samples were pre-filtered).
    pub fn filter_bad(&mut self) {
        if let FetchData::FullRes(d) = &mut self.data {
            if let Some(bads) = d.bads.take() {
                if bads.iter().any(|&b| b) {
                    let keep: Vec<bool> = bads.iter().map(|&b| !b).collect();
                    d.retain(&keep);
                }
            }
        }
    }
}

/// Answers range queries against the archive.
#[derive(Debug)]
pub struct FetchEngine<'a> {
    registry: &'a MsidRegistry,
    data_root: PathBuf,
    config: FetchConfig,
}

impl<'a> FetchEngine<'a> {
    /// Creates an engine with default configuration.
    pub fn new(registry: &'a MsidRegistry, data_root: &Path) -> Self {
        Self::with_config(registry, data_root, FetchConfig::default())
    }

    /// Creates an engine with explicit configuration.
    pub fn with_config(registry: &'a MsidRegistry, data_root: &Path, config: FetchConfig) -> Self {
        Self { registry, data_root: data_root.to_path_buf(), config }
    }

    /// The MSID registry backing this engine.
    pub fn registry(&self) -> &MsidRegistry {
        self.registry
    }

    /// Fetches one MSID over `[tstart, tstop)`.
    ///
    /// The pattern may be a glob but must resolve to exactly one MSID. A
    /// range intersecting no data yields an empty result, not an error.
    pub fn fetch(
        &self,
        pattern: &str,
        tstart: f64,
        tstop: f64,
        options: &FetchOptions,
    ) -> Result<Msid> {
        let meta = self.registry.resolve_one(pattern)?;
        self.fetch_meta(meta, tstart, tstop, options)
    }

    /// Fetches one MSID through an ordered list of data sources. Sources
    /// are tried in order; ranges not covered by earlier sources forward
    /// to later ones, and per-range provenance is recorded on the result.
    pub fn fetch_with_sources(
        &self,
        pattern: &str,
        tstart: f64,
        tstop: f64,
        options: &FetchOptions,
        sources: &Sources,
    ) -> Result<Msid> {
        let meta = self.registry.resolve_one(pattern)?;
        if options.stat.is_some() {
            return Err(ArchiveError::Unsupported(
                "data sources answer full-resolution queries only".into(),
            ));
        }
        let (raw, spans) = sources.fetch(&meta.name, tstart, tstop)?;
        let system = options.unit_system.unwrap_or(self.config.unit_system);
        let mut msid = self.finish_full_res(meta, tstart, tstop, raw, system)?;
        msid.sources = spans;
        if options.filter_bad {
            msid.filter_bad();
        }
        Ok(msid)
    }

    /// Fetches a set of MSIDs given by glob patterns.
    ///
    /// With `filter_bad`, MSIDs sharing a content type keep their common
    /// time axis: a row is dropped from every member of the content group
    /// if any member is bad there.
    pub fn fetch_set(
        &self,
        patterns: &[&str],
        tstart: f64,
        tstop: f64,
        options: &FetchOptions,
    ) -> Result<MsidSet> {
        let mut names: Vec<String> = Vec::new();
        for pattern in patterns {
            for name in self
                .registry
                .resolve_glob(pattern, self.config.max_glob_matches)?
            {
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        if names.len() > self.config.max_glob_matches {
            return Err(ArchiveError::GlobOverMatch {
                pattern: patterns.join(","),
                matches: names.len(),
                limit: self.config.max_glob_matches,
            });
        }

        let fetch_options = FetchOptions { filter_bad: false, ..options.clone() };
        let mut msids = BTreeMap::new();
        for name in &names {
            let meta = self.registry.get(name)?;
            msids.insert(name.clone(), self.fetch_meta(meta, tstart, tstop, &fetch_options)?);
        }
        let mut set = MsidSet { tstart, tstop, times: None, names, msids };
        if options.filter_bad && options.stat.is_none() {
            set.filter_bad_concordant();
        }
        Ok(set)
    }

    fn fetch_meta(
        &self,
        meta: &MsidMeta,
        tstart: f64,
        tstop: f64,
        options: &FetchOptions,
    ) -> Result<Msid> {
        let system = options.unit_system.unwrap_or(self.config.unit_system);
        match options.stat {
            Some(kind) => self.fetch_stat(meta, tstart, tstop, kind, system),
            None => {
                let raw = retry_io(|| {
                    sources::read_archive_raw(&self.data_root, meta, tstart, tstop)
                })?;
                let spans = if raw.times.is_empty() {
                    Vec::new()
                } else {
                    vec![SourceSpan {
                        source: "archive".to_string(),
                        tstart: raw.times[0],
                        tstop: *raw.times.last().unwrap(),
                    }]
                };
                let mut msid = self.finish_full_res(meta, tstart, tstop, raw, system)?;
                msid.sources = spans;
                if options.filter_bad {
                    msid.filter_bad();
                }
                Ok(msid)
            }
        }
    }

    fn finish_full_res(
        &self,
        meta: &MsidMeta,
        tstart: f64,
        tstop: f64,
        raw: RawSamples,
        system: UnitSystem,
    ) -> Result<Msid> {
        let conv = meta.units.conv(system);
        let vals = match raw.vals {
            Values::Float(mut v) => {
                conv.apply_all(&mut v);
                Values::Float(v)
            }
            Values::Int(v) => {
                if conv.is_identity() {
                    Values::Int(v)
                } else {
                    let mut out: Vec<f64> = v.iter().map(|&x| x as f64).collect();
                    conv.apply_all(&mut out);
                    Values::Float(out)
                }
            }
            other => other,
        };
        Ok(Msid {
            msid: meta.name.clone(),
            content: meta.content.clone(),
            tstart,
            tstop,
            unit: meta.units.label(system).map(str::to_string),
            data: FetchData::FullRes(FullResData {
                times: raw.times,
                vals,
                bads: Some(raw.bads),
                times0: None,
            }),
            sources: Vec::new(),
        })
    }

    fn fetch_stat(
        &self,
        meta: &MsidMeta,
        tstart: f64,
        tstop: f64,
        kind: StatKind,
        system: UnitSystem,
    ) -> Result<Msid> {
        let store = ContentStore::new(&self.data_root, &meta.content);
        let path = store
            .stats_dir(kind.dir_name())
            .join(format!("{}.stats", meta.name));
        let conv = meta.units.conv(system);

        let data = if path.exists() {
            let mut stats = StatStore::open(&path)?;
            // Windows whose index range intersects [tstart, tstop); a stop
            // exactly on a window boundary excludes that window.
            let i_hi = kind.index_of(tstop);
            let i_hi = if i_hi as f64 * kind.dt() >= tstop { i_hi } else { i_hi + 1 };
            let rec_lo = stats.find_index(kind.index_of(tstart))?;
            let rec_hi = stats.find_index(i_hi)?;
            let records = stats.read_range(rec_lo, rec_hi)?;
            debug!(msid = %meta.name, kind = kind.dir_name(), n = records.len(), "stat fetch");
            match stats.layout() {
                StatLayout::State => {
                    let codes = meta.state_codes.clone().unwrap_or_default();
                    let mut series = StateSeries {
                        counts: codes
                            .iter()
                            .map(|(raw, label)| (*raw, label.clone(), Vec::new()))
                            .collect(),
                        ..StateSeries::default()
                    };
                    for rec in &records {
                        series.indexes.push(rec.index);
                        series.times.push((rec.index as f64 + 0.5) * kind.dt());
                        series.n_samples.push(rec.n);
                        series.midvals.push(rec.midval as i64);
                        let counts = rec.state_counts.clone().unwrap_or_default();
                        for (i, (_, _, column)) in series.counts.iter_mut().enumerate() {
                            column.push(counts.get(i).copied().unwrap_or(0));
                        }
                    }
                    FetchData::StatState(series)
                }
                StatLayout::Numeric => {
                    let mut series = StatSeries::default();
                    if kind == StatKind::Daily {
                        series.percentiles = Some(PercentileSeries::default());
                    }
                    for rec in &records {
                        series.indexes.push(rec.index);
                        series.times.push((rec.index as f64 + 0.5) * kind.dt());
                        series.n_samples.push(rec.n);
                        series.midvals.push(conv.apply(rec.midval));
                        series.mins.push(conv.apply(rec.min));
                        series.maxes.push(conv.apply(rec.max));
                        series.means.push(conv.apply(rec.mean));
                        // Spread quantities scale but do not shift.
                        series.stds.push(rec.std * conv.scale.abs());
                        if let (Some(ps), Some(recp)) =
                            (series.percentiles.as_mut(), rec.percentiles)
                        {
                            ps.p01s.push(conv.apply(recp[0]));
                            ps.p05s.push(conv.apply(recp[1]));
                            ps.p16s.push(conv.apply(recp[2]));
                            ps.p50s.push(conv.apply(recp[3]));
                            ps.p84s.push(conv.apply(recp[4]));
                            ps.p95s.push(conv.apply(recp[5]));
                            ps.p99s.push(conv.apply(recp[6]));
                        }
                    }
                    match kind {
                        StatKind::FiveMin => FetchData::Stat5Min(series),
                        StatKind::Daily => FetchData::StatDaily(series),
                    }
                }
            }
        } else if meta.is_state() {
            FetchData::StatState(StateSeries::default())
        } else {
            match kind {
                StatKind::FiveMin => FetchData::Stat5Min(StatSeries::default()),
                StatKind::Daily => FetchData::StatDaily(StatSeries::default()),
            }
        };

        Ok(Msid {
            msid: meta.name.clone(),
            content: meta.content.clone(),
            tstart,
            tstop,
            unit: meta.units.label(system).map(str::to_string),
            data,
            sources: vec![SourceSpan {
                source: "archive".to_string(),
                tstart,
                tstop,
            }],
        })
    }
}

/// Result of a multi-MSID query.
#[derive(Debug, Clone)]
pub struct MsidSet {
    /// Query start time.
    pub tstart: f64,
    /// Query stop time.
    pub tstop: f64,
    /// Common time grid, set after interpolation.
    pub times: Option<Vec<f64>>,
    names: Vec<String>,
    msids: BTreeMap<String, Msid>,
}

impl MsidSet {
    /// Member names in query order.
    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Looks up one member by canonical name.
    pub fn get(&self, name: &str) -> Option<&Msid> {
        self.msids.get(&name.to_uppercase())
    }

    /// Mutable member lookup.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut Msid> {
        self.msids.get_mut(&name.to_uppercase())
    }

    /// Iterates members in name order.
    pub fn iter(&self) -> impl Iterator<Item = &Msid> {
        self.msids.values()
    }

    /// Mutable iteration in name order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Msid> {
        self.msids.values_mut()
    }

    /// Same-content concordance filter: for each content group, drops a
    /// row from every member if any member is bad there, preserving the
    /// group's common time axis.
    pub fn filter_bad_concordant(&mut self) {
        let mut by_content: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for msid in self.msids.values() {
            by_content
                .entry(msid.content.clone())
                .or_default()
                .push(msid.msid.clone());
        }
        for members in by_content.values() {
            let mut union: Option<Vec<bool>> = None;
            for name in members {
                if let FetchData::FullRes(d) = &self.msids[name].data {
                    if let Some(bads) = &d.bads {
                        match &mut union {
                            None => union = Some(bads.clone()),
                            Some(u) if u.len() == bads.len() => {
                                for (u, &b) in u.iter_mut().zip(bads) {
                                    *u |= b;
                                }
                            }
                            // Length drift between members means they no
                            // longer share a time axis; fall back to
                            // per-MSID filtering.
                            Some(_) => {
                                union = None;
                                break;
                            }
                        }
                    }
                }
            }
            match union {
                Some(union) => {
                    let keep: Vec<bool> = union.iter().map(|&b| !b).collect();
                    for name in members {
                        let msid = self.msids.get_mut(name).unwrap();
                        if let FetchData::FullRes(d) = &mut msid.data {
                            d.retain(&keep);
                            d.bads = None;
                        }
                    }
                }
                None => {
                    for name in members {
                        self.msids.get_mut(name).unwrap().filter_bad();
                    }
                }
            }
        }
    }

    /// Applies [`Msid::filter_bad`] to every member independently.
    pub fn filter_bad(&mut self) {
        for msid in self.msids.values_mut() {
            msid.filter_bad();
        }
    }
}

fn retry_io<T>(mut f: impl FnMut() -> Result<T>) -> Result<T> {
    match f() {
        Err(ArchiveError::Io(err)) => {
            debug!(error = %err, "transient I/O error, retrying once");
            f()
        }
        other => other,
    }
}
