//! Interval selection and removal on fetch results.
//!
//! Both operations build a merged, sorted interval union and sweep it
//! against the (sorted) result times with two pointers, so a large table
//! of intervals costs one sort plus a single pass over the samples.

use super::{Msid, MsidSet};

/// One half-open time interval `[tstart, tstop)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    /// Interval start (mission seconds, inclusive).
    pub tstart: f64,
    /// Interval stop (mission seconds, exclusive).
    pub tstop: f64,
}

impl Interval {
    /// Creates an interval.
    pub fn new(tstart: f64, tstop: f64) -> Self {
        Self { tstart, tstop }
    }

    /// Widens the interval by `pad` seconds on each side.
    pub fn padded(self, pad: f64) -> Self {
        Self { tstart: self.tstart - pad, tstop: self.tstop + pad }
    }
}

/// Sorts intervals and merges overlapping or touching neighbors.
pub fn merge_intervals(intervals: &[Interval]) -> Vec<Interval> {
    let mut sorted: Vec<Interval> = intervals
        .iter()
        .copied()
        .filter(|iv| iv.tstop > iv.tstart)
        .collect();
    sorted.sort_by(|a, b| a.tstart.total_cmp(&b.tstart));

    let mut merged: Vec<Interval> = Vec::with_capacity(sorted.len());
    for iv in sorted {
        match merged.last_mut() {
            Some(last) if iv.tstart <= last.tstop => {
                last.tstop = last.tstop.max(iv.tstop);
            }
            _ => merged.push(iv),
        }
    }
    merged
}

/// For each time, whether it falls inside the interval union. `times`
/// must be sorted.
pub fn in_intervals_mask(times: &[f64], intervals: &[Interval]) -> Vec<bool> {
    let merged = merge_intervals(intervals);
    let mut mask = vec![false; times.len()];
    let mut j = 0usize;
    for (i, &t) in times.iter().enumerate() {
        while j < merged.len() && merged[j].tstop <= t {
            j += 1;
        }
        if j < merged.len() && merged[j].tstart <= t {
            mask[i] = true;
        }
    }
    mask
}

impl Msid {
    /// Keeps only samples (or stat intervals) inside the interval union.
    pub fn select_intervals(&mut self, intervals: &[Interval]) {
        let mask = in_intervals_mask(self.data.times(), intervals);
        self.data.retain(&mask);
    }

    /// Removes samples (or stat intervals) inside the interval union.
    pub fn remove_intervals(&mut self, intervals: &[Interval]) {
        let mask: Vec<bool> = in_intervals_mask(self.data.times(), intervals)
            .into_iter()
            .map(|b| !b)
            .collect();
        self.data.retain(&mask);
    }

    /// Copying variant of [`select_intervals`](Self::select_intervals).
    pub fn select_intervals_copy(&self, intervals: &[Interval]) -> Msid {
        let mut out = self.clone();
        out.select_intervals(intervals);
        out
    }

    /// Copying variant of [`remove_intervals`](Self::remove_intervals).
    pub fn remove_intervals_copy(&self, intervals: &[Interval]) -> Msid {
        let mut out = self.clone();
        out.remove_intervals(intervals);
        out
    }
}

impl MsidSet {
    /// Applies [`Msid::select_intervals`] to every member, and to the
    /// common time grid if interpolation set one.
    pub fn select_intervals(&mut self, intervals: &[Interval]) {
        for msid in self.iter_mut() {
            msid.select_intervals(intervals);
        }
        self.retain_times(intervals, false);
    }

    /// Applies [`Msid::remove_intervals`] to every member, and to the
    /// common time grid if interpolation set one.
    pub fn remove_intervals(&mut self, intervals: &[Interval]) {
        for msid in self.iter_mut() {
            msid.remove_intervals(intervals);
        }
        self.retain_times(intervals, true);
    }

    fn retain_times(&mut self, intervals: &[Interval], invert: bool) {
        if let Some(times) = &mut self.times {
            let mask = in_intervals_mask(times, intervals);
            let mut it = mask.iter();
            times.retain(|_| *it.next().unwrap() != invert);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_overlapping() {
        let merged = merge_intervals(&[
            Interval::new(5.0, 7.0),
            Interval::new(0.0, 2.0),
            Interval::new(1.0, 3.0),
            Interval::new(4.0, 4.0),
        ]);
        assert_eq!(merged, vec![Interval::new(0.0, 3.0), Interval::new(5.0, 7.0)]);
    }

    #[test]
    fn test_mask_half_open() {
        let times = [0.0, 1.0, 2.0, 3.0, 4.0];
        let mask = in_intervals_mask(&times, &[Interval::new(1.0, 3.0)]);
        assert_eq!(mask, vec![false, true, true, false, false]);
    }

    #[test]
    fn test_select_remove_partition() {
        let times: Vec<f64> = (0..10).map(|i| i as f64).collect();
        let intervals = [Interval::new(2.0, 5.0), Interval::new(7.5, 9.5)];
        let mask = in_intervals_mask(&times, &intervals);
        let selected: Vec<f64> = times
            .iter()
            .zip(&mask)
            .filter_map(|(&t, &m)| m.then_some(t))
            .collect();
        let removed: Vec<f64> = times
            .iter()
            .zip(&mask)
            .filter_map(|(&t, &m)| (!m).then_some(t))
            .collect();
        assert_eq!(selected.len() + removed.len(), times.len());
        assert_eq!(selected, vec![2.0, 3.0, 4.0, 8.0, 9.0]);
    }
}
