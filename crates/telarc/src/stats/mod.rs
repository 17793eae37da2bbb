//! Statistics engine: 5-minute and daily aggregate stores per MSID, kept
//! coherent with the full-resolution columns.
//!
//! Intervals are mission-global: interval `index` covers the half-open
//! window `[index·Δ, (index+1)·Δ)` with Δ exactly 328 s (5min) or 86400 s
//! (daily), so the same index means the same wall-clock window for every
//! MSID. Daily windows are not midnight-aligned; the drift of a few
//! minutes per year is accepted.
//!
//! The update cycle always deletes the tail record before recomputing, so
//! a window summarized while still filling is replaced once more data
//! arrives, and an interrupted run leaves nothing inconsistent behind.

pub mod store;

use crate::catalog::Catalog;
use crate::error::Result;
use crate::msid::{MsidMeta, MsidRegistry};
use crate::store::{ContentStore, OpenMode};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub use store::{StatLayout, StatRecord, StatStore, PERCENTS};

/// Interval kind of a statistics store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatKind {
    /// 328-second intervals.
    FiveMin,
    /// 86400-second intervals.
    Daily,
}

impl StatKind {
    /// Both kinds, in update order.
    pub const ALL: [StatKind; 2] = [StatKind::FiveMin, StatKind::Daily];

    /// Interval width Δ in seconds.
    pub fn dt(self) -> f64 {
        match self {
            StatKind::FiveMin => 328.0,
            StatKind::Daily => 86400.0,
        }
    }

    /// Directory name of this kind's stat stores.
    pub fn dir_name(self) -> &'static str {
        match self {
            StatKind::FiveMin => "5min",
            StatKind::Daily => "daily",
        }
    }

    /// On-disk kind code.
    pub fn code(self) -> u8 {
        match self {
            StatKind::FiveMin => 0,
            StatKind::Daily => 1,
        }
    }

    /// Reconstructs a kind from its code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StatKind::FiveMin),
            1 => Some(StatKind::Daily),
            _ => None,
        }
    }

    /// Mission-global interval index containing time `t`.
    pub fn index_of(self, t: f64) -> i64 {
        (t / self.dt()).floor() as i64
    }
}

/// Options for the statistics engine.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Values with `|v|` above this produce a warning but stay included;
    /// quality flags and the bad-times registry are the exclusion tools.
    pub sanity_limit: f64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self { sanity_limit: 1.0e15 }
    }
}

/// Maintains the 5-minute and daily stores for the MSIDs of a content.
#[derive(Debug)]
pub struct StatsEngine<'a> {
    registry: &'a MsidRegistry,
    data_root: PathBuf,
    config: StatsConfig,
}

impl<'a> StatsEngine<'a> {
    /// Creates an engine with default options.
    pub fn new(registry: &'a MsidRegistry, data_root: &Path) -> Self {
        Self::with_config(registry, data_root, StatsConfig::default())
    }

    /// Creates an engine with explicit options.
    pub fn with_config(registry: &'a MsidRegistry, data_root: &Path, config: StatsConfig) -> Self {
        Self { registry, data_root: data_root.to_path_buf(), config }
    }

    /// Updates both stat kinds for every MSID of `content`. Called after
    /// each ingest of the content.
    pub fn update_content(&self, content: &str) -> Result<()> {
        let meta = self.registry.content(content)?;
        for msid in meta.msids.clone() {
            for kind in StatKind::ALL {
                self.update_msid(&msid, kind)?;
            }
        }
        Ok(())
    }

    /// Brings one (MSID, kind) store up to date with the full-resolution
    /// column. Returns the number of records appended.
    pub fn update_msid(&self, msid: &str, kind: StatKind) -> Result<usize> {
        let meta = self.registry.get(msid)?;
        let msid = meta.name.clone();
        if matches!(meta.dtype, crate::store::DType::Str(_)) && !meta.is_state() {
            // Plain string channels carry no aggregable quantity.
            return Ok(0);
        }
        let store_dir = ContentStore::new(&self.data_root, &meta.content);
        if !store_dir.catalog_path().exists() || !store_dir.has_column(&msid) {
            return Ok(0);
        }
        let catalog = Catalog::open(&store_dir.catalog_path())?;
        let horizon = catalog.last_row()?;
        if horizon == 0 {
            return Ok(0);
        }

        let n_states = meta
            .state_codes
            .as_ref()
            .map(|codes| codes.len() as u16)
            .unwrap_or(0);
        let layout = if meta.is_state() { StatLayout::State } else { StatLayout::Numeric };
        let path = store_dir.stats_dir(kind.dir_name()).join(format!("{msid}.stats"));
        let mut stats = StatStore::open_or_create(&path, kind, layout, n_states)?;

        // Restart point: the last emitted index. Its record is deleted and
        // recomputed because its window may have been incomplete.
        let last_index = stats.last_index()?;
        if let Some(index) = last_index {
            stats.truncate_after_index(index)?;
        }

        // Read the full-resolution tail from a little before the restart
        // window, bounded by the catalog visibility horizon.
        let t0 = last_index.map(|i| i as f64 * kind.dt() - 500.0);
        let (row_lo, _) = match t0 {
            Some(t0) => catalog.row_span(t0, f64::MAX)?,
            None => (0, horizon),
        };

        let (times, vals) = self.read_good_samples(&store_dir, &msid, row_lo, horizon)?;
        if times.is_empty() {
            debug!(msid = %msid, "no good samples for stats update");
            return Ok(0);
        }

        let start_index = last_index.unwrap_or_else(|| kind.index_of(times[0]));
        let end_index = kind.index_of(*times.last().unwrap());

        let mut records = Vec::new();
        for index in start_index..=end_index {
            if let Some(rec) = self.compute_record(meta, kind, index, &times, &vals) {
                records.push(rec);
            }
        }
        let n = records.len();
        stats.append(&records)?;
        stats.sync()?;
        if n > 0 {
            info!(msid = %msid, kind = kind.dir_name(), records = n, "updated stats");
        }
        Ok(n)
    }

    /// Reads `[row_lo, row_hi)` of the MSID and returns the times and
    /// values of the good rows only (bad TIME or bad value excluded).
    fn read_good_samples(
        &self,
        store: &ContentStore,
        msid: &str,
        row_lo: u64,
        row_hi: u64,
    ) -> Result<(Vec<f64>, Vec<f64>)> {
        let mut time_col = store.open_time(OpenMode::Read)?;
        let (times, time_bads) = time_col.read_range(row_lo, row_hi)?;
        let times = times.as_f64()?;

        let mut col = store.open_column(msid, OpenMode::Read)?;
        let (vals, bads) = col.read_range(row_lo, row_hi)?;
        let vals = vals.as_f64()?;

        let mut out_times = Vec::with_capacity(times.len());
        let mut out_vals = Vec::with_capacity(times.len());
        for i in 0..times.len() {
            if !bads[i] && !time_bads[i] {
                out_times.push(times[i]);
                out_vals.push(vals[i]);
            }
        }
        Ok((out_times, out_vals))
    }

    /// Computes one interval's record, or None if fewer than 3 good
    /// samples fall in the window.
    fn compute_record(
        &self,
        meta: &MsidMeta,
        kind: StatKind,
        index: i64,
        times: &[f64],
        vals: &[f64],
    ) -> Option<StatRecord> {
        let dt = kind.dt();
        let t_lo = index as f64 * dt;
        let t_hi = (index + 1) as f64 * dt;
        let lo = times.partition_point(|&t| t < t_lo);
        let hi = times.partition_point(|&t| t < t_hi);
        let n = hi - lo;
        if n < 3 {
            return None;
        }
        let wtimes = &times[lo..hi];
        let wvals = &vals[lo..hi];

        for &v in wvals {
            if v.abs() > self.config.sanity_limit {
                warn!(
                    msid = %meta.name,
                    value = v,
                    limit = self.config.sanity_limit,
                    "sample magnitude above sanity limit"
                );
            }
        }

        // Midpoint sample; an exact tie between neighbors keeps the
        // earlier row.
        let mid_t = t_lo + dt / 2.0;
        let mut mid_i = 0;
        let mut best = f64::INFINITY;
        for (i, &t) in wtimes.iter().enumerate() {
            let d = (t - mid_t).abs();
            if d < best {
                best = d;
                mid_i = i;
            }
        }

        let mut rec = StatRecord::new(index, n as u32, wvals[mid_i]);

        if let Some(codes) = &meta.state_codes {
            rec.state_counts = Some(
                codes
                    .iter()
                    .map(|(raw, _)| wvals.iter().filter(|&&v| v == *raw as f64).count() as u32)
                    .collect(),
            );
            return Some(rec);
        }

        // Dwell width per sample: half the distance to each neighbor,
        // clipped to [0.001, 300]. The low bound guards identical time
        // stamps, the high bound caps the weight of samples next to gaps
        // at five minutes.
        let mut weights = vec![0.0f64; n];
        weights[0] = wtimes[1] - wtimes[0];
        weights[n - 1] = wtimes[n - 1] - wtimes[n - 2];
        for i in 1..n - 1 {
            weights[i] = (wtimes[i + 1] - wtimes[i - 1]) / 2.0;
        }
        for w in &mut weights {
            *w = w.clamp(0.001, 300.0);
        }
        let sum_w: f64 = weights.iter().sum();

        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        let mut wsum = 0.0f64;
        for (&v, &w) in wvals.iter().zip(&weights) {
            min = min.min(v);
            max = max.max(v);
            wsum += v * w;
        }
        let mean = wsum / sum_w;
        let var: f64 = wvals
            .iter()
            .zip(&weights)
            .map(|(&v, &w)| w * (v - mean) * (v - mean))
            .sum::<f64>()
            / sum_w;

        rec.min = min;
        rec.max = max;
        rec.mean = mean;
        rec.std = var.sqrt();

        if kind == StatKind::Daily {
            let mut sorted = wvals.to_vec();
            sorted.sort_by(|a, b| a.total_cmp(b));
            let mut ps = [0.0; 7];
            for (slot, &pct) in ps.iter_mut().zip(PERCENTS.iter()) {
                let pos = ((n - 1) as f64 * pct as f64 / 100.0).round() as usize;
                *slot = sorted[pos];
            }
            rec.percentiles = Some(ps);
        }
        Some(rec)
    }
}
