//! Nearest-neighbor interpolation of an [`MsidSet`] onto a uniform grid.
//!
//! Two policy flags control how bad samples interact with the grid:
//!
//! | `filter_bad` | `bad_union` | effect |
//! |---|---|---|
//! | true  | false | bad samples of each MSID removed before interpolation |
//! | true  | true  | interpolate first, then drop rows where any MSID is bad |
//! | false | false | keep bads; each MSID's bads reflect only its own state |
//! | false | true  | keep bads; every MSID's bads become the union |
//!
//! The strict-coincidence mode (`true`/`true`) is the right choice for
//! quantities that must be sampled together, like attitude quaternion
//! components.

use crate::error::{ArchiveError, Result};

use super::{FetchData, MsidSet};

/// Options for [`MsidSet::interpolate`].
#[derive(Debug, Clone)]
pub struct InterpOptions {
    /// Uniform grid step in seconds (ignored when `times` is given).
    pub dt: f64,
    /// Explicit grid times; overrides `dt`/`start`/`stop`.
    pub times: Option<Vec<f64>>,
    /// Grid start; defaults to the set's query start.
    pub start: Option<f64>,
    /// Grid stop (exclusive); defaults to the set's query stop.
    pub stop: Option<f64>,
    /// Remove bad samples (see the module table).
    pub filter_bad: bool,
    /// Couple bad samples across MSIDs (see the module table).
    pub bad_union: bool,
}

impl Default for InterpOptions {
    fn default() -> Self {
        Self {
            dt: 328.0,
            times: None,
            start: None,
            stop: None,
            filter_bad: true,
            bad_union: false,
        }
    }
}

impl InterpOptions {
    /// Options with a grid step and the default policies.
    pub fn dt(dt: f64) -> Self {
        Self { dt, ..Self::default() }
    }

    /// Sets both policy flags.
    pub fn policies(mut self, filter_bad: bool, bad_union: bool) -> Self {
        self.filter_bad = filter_bad;
        self.bad_union = bad_union;
        self
    }
}

/// For each grid time, the index of the nearest source sample. Both
/// inputs must be sorted; an exact tie keeps the earlier sample.
pub fn nearest_indexes(data_times: &[f64], grid: &[f64]) -> Vec<usize> {
    debug_assert!(!data_times.is_empty());
    let mut out = Vec::with_capacity(grid.len());
    let mut j = 0usize;
    for &g in grid {
        while j + 1 < data_times.len()
            && (data_times[j + 1] - g).abs() < (data_times[j] - g).abs()
        {
            j += 1;
        }
        out.push(j);
    }
    out
}

impl MsidSet {
    /// Interpolates every member onto a common uniform time grid.
    ///
    /// Each member records its pre-interpolation timestamps as `times0`.
    /// The set's `times` field holds the final grid.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::Unsupported`] for aggregate members or
    /// members with no samples at all.
    pub fn interpolate(&mut self, options: &InterpOptions) -> Result<()> {
        let grid: Vec<f64> = match &options.times {
            Some(times) => times.clone(),
            None => {
                let start = options.start.unwrap_or(self.tstart);
                let stop = options.stop.unwrap_or(self.tstop);
                let n = ((stop - start) / options.dt).ceil().max(0.0) as usize;
                (0..n).map(|i| start + i as f64 * options.dt).collect()
            }
        };

        for msid in self.iter_mut() {
            if options.filter_bad && !options.bad_union {
                msid.filter_bad();
            }
            let FetchData::FullRes(data) = &mut msid.data else {
                return Err(ArchiveError::Unsupported(format!(
                    "cannot interpolate aggregate result for {}",
                    msid.msid
                )));
            };
            if data.times.is_empty() {
                return Err(ArchiveError::Unsupported(format!(
                    "cannot interpolate {} with no samples",
                    msid.msid
                )));
            }
            let idx = nearest_indexes(&data.times, &grid);
            data.times0 = Some(idx.iter().map(|&i| data.times[i]).collect());
            data.vals = data.vals.take(&idx);
            data.bads = data
                .bads
                .as_ref()
                .map(|bads| idx.iter().map(|&i| bads[i]).collect());
            data.times = grid.clone();
        }

        if options.bad_union {
            let mut union = vec![false; grid.len()];
            for msid in self.iter() {
                if let FetchData::FullRes(data) = &msid.data {
                    if let Some(bads) = &data.bads {
                        for (u, &b) in union.iter_mut().zip(bads) {
                            *u |= b;
                        }
                    }
                }
            }
            if options.filter_bad {
                let keep: Vec<bool> = union.iter().map(|&b| !b).collect();
                for msid in self.iter_mut() {
                    if let FetchData::FullRes(data) = &mut msid.data {
                        data.retain(&keep);
                        data.bads = None;
                    }
                }
                self.times = Some(
                    grid.iter()
                        .zip(&keep)
                        .filter_map(|(&t, &k)| k.then_some(t))
                        .collect(),
                );
                return Ok(());
            }
            for msid in self.iter_mut() {
                if let FetchData::FullRes(data) = &mut msid.data {
                    data.bads = Some(union.clone());
                }
            }
        }

        self.times = Some(grid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nearest_indexes_basic() {
        let data = [0.0, 1.0, 2.0, 3.0];
        let grid = [0.2, 0.9, 2.4, 5.0];
        assert_eq!(nearest_indexes(&data, &grid), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_nearest_tie_keeps_earlier() {
        let data = [0.0, 2.0];
        let grid = [1.0];
        assert_eq!(nearest_indexes(&data, &grid), vec![0]);
    }

    #[test]
    fn test_grid_before_and_after_data() {
        let data = [10.0, 11.0];
        let grid = [0.0, 10.4, 20.0];
        assert_eq!(nearest_indexes(&data, &grid), vec![0, 0, 1]);
    }
}
