//! Bad-times registry: a user-policy overlay excluding time intervals
//! from fetch results without touching stored data.
//!
//! The registry maps an MSID name or glob to a list of exclusion
//! intervals, loaded from whitespace-separated text tables and
//! augmentable at runtime:
//!
//! ```text
//! # MSID_or_glob  tstart                 tstop
//! AOGBIAS1        2008:292:00:00:00      2008:297:00:00:00
//! AORATE*         673737600.0            673742000.0
//! ```
//!
//! Lines beginning with `#` and blank lines are ignored. Matching is
//! case-insensitive. Times are raw mission seconds or
//! `YYYY:DOY[:HH[:MM[:SS.sss]]]` strings.
//!
//! Construction and mutation are serial operations owned by the caller;
//! the registry is never mutated during a fetch.

use crate::error::{ArchiveError, Result};
use crate::fetch::{Interval, Msid, MsidSet};
use globset::{GlobBuilder, GlobMatcher};
use std::path::Path;

/// Mission epoch year: stored times count seconds of Terrestrial Time
/// since 1998-01-01T00:00:00.
pub const MISSION_EPOCH_YEAR: i64 = 1998;

fn is_leap(year: i64) -> bool {
    (year % 4 == 0 && year % 100 != 0) || year % 400 == 0
}

fn year_days(year: i64) -> i64 {
    if is_leap(year) {
        366
    } else {
        365
    }
}

/// Parses a time string: either raw mission seconds or a
/// `YYYY:DOY[:HH[:MM[:SS.sss]]]` date, converted arithmetically from the
/// mission epoch. TT has no leap seconds, so day arithmetic is exact.
pub fn parse_time(s: &str) -> Result<f64> {
    if let Ok(secs) = s.parse::<f64>() {
        return Ok(secs);
    }
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 2 || parts.len() > 5 {
        return Err(ArchiveError::Unsupported(format!("unparseable time {s:?}")));
    }
    let bad = || ArchiveError::Unsupported(format!("unparseable time {s:?}"));
    let year: i64 = parts[0].parse().map_err(|_| bad())?;
    let doy: i64 = parts[1].parse().map_err(|_| bad())?;
    if year < MISSION_EPOCH_YEAR || doy < 1 || doy > year_days(year) {
        return Err(ArchiveError::Unsupported(format!("time out of range {s:?}")));
    }
    let mut days = doy - 1;
    for y in MISSION_EPOCH_YEAR..year {
        days += year_days(y);
    }
    let hh: f64 = parts.get(2).map_or(Ok(0.0), |p| p.parse().map_err(|_| bad()))?;
    let mm: f64 = parts.get(3).map_or(Ok(0.0), |p| p.parse().map_err(|_| bad()))?;
    let ss: f64 = parts.get(4).map_or(Ok(0.0), |p| p.parse().map_err(|_| bad()))?;
    Ok(days as f64 * 86400.0 + hh * 3600.0 + mm * 60.0 + ss)
}

#[derive(Debug)]
struct Entry {
    pattern: String,
    matcher: Option<GlobMatcher>,
    interval: Interval,
}

impl Entry {
    fn matches(&self, msid: &str) -> bool {
        match &self.matcher {
            Some(matcher) => matcher.is_match(msid),
            None => self.pattern.eq_ignore_ascii_case(msid),
        }
    }
}

/// Registry of per-MSID exclusion intervals.
#[derive(Debug, Default)]
pub struct BadTimes {
    entries: Vec<Entry>,
}

impl BadTimes {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of registered exclusions.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes all exclusions.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Adds one exclusion for an MSID name or glob pattern.
    pub fn add(&mut self, msid_or_glob: &str, tstart: f64, tstop: f64) -> Result<()> {
        let pattern = msid_or_glob.to_uppercase();
        let matcher = if pattern.contains(['*', '?', '[']) {
            Some(
                GlobBuilder::new(&pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ArchiveError::Pattern(e.to_string()))?
                    .compile_matcher(),
            )
        } else {
            None
        };
        self.entries.push(Entry {
            pattern,
            matcher,
            interval: Interval::new(tstart, tstop),
        });
        Ok(())
    }

    /// Reads exclusion records from a text table. Returns the number of
    /// records added. Overlapping records for the same MSID are fine.
    pub fn read_table(&mut self, text: &str) -> Result<usize> {
        let mut added = 0;
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 3 {
                return Err(ArchiveError::Unsupported(format!(
                    "bad-times record needs 3 fields: {line:?}"
                )));
            }
            self.add(fields[0], parse_time(fields[1])?, parse_time(fields[2])?)?;
            added += 1;
        }
        Ok(added)
    }

    /// Reads exclusion records from a file.
    pub fn read_file(&mut self, path: &Path) -> Result<usize> {
        let text = std::fs::read_to_string(path)?;
        self.read_table(&text)
    }

    /// All exclusion intervals matching `msid`.
    pub fn intervals_for(&self, msid: &str) -> Vec<Interval> {
        let msid = msid.to_uppercase();
        self.entries
            .iter()
            .filter(|entry| entry.matches(&msid))
            .map(|entry| entry.interval)
            .collect()
    }
}

impl Msid {
    /// Removes all samples whose timestamp falls inside a matching
    /// bad-times interval.
    pub fn filter_bad_times(&mut self, registry: &BadTimes) {
        let intervals = registry.intervals_for(&self.msid);
        if !intervals.is_empty() {
            self.remove_intervals(&intervals);
        }
    }
}

impl MsidSet {
    /// Applies [`Msid::filter_bad_times`] to every member.
    pub fn filter_bad_times(&mut self, registry: &BadTimes) {
        for msid in self.iter_mut() {
            msid.filter_bad_times(registry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_time_seconds() {
        assert_eq!(parse_time("12345.5").unwrap(), 12345.5);
    }

    #[test]
    fn test_parse_time_epoch_start() {
        assert_eq!(parse_time("1998:001:00:00:00").unwrap(), 0.0);
        assert_eq!(parse_time("1998:002").unwrap(), 86400.0);
    }

    #[test]
    fn test_parse_time_leap_years() {
        // 1998 + 1999 = 730 days to 2000:001; 2000 is a leap year.
        assert_eq!(parse_time("2000:001").unwrap(), 730.0 * 86400.0);
        assert_eq!(parse_time("2000:366").unwrap(), (730.0 + 365.0) * 86400.0);
        assert_eq!(parse_time("2001:001").unwrap(), (730.0 + 366.0) * 86400.0);
    }

    #[test]
    fn test_parse_time_fractional() {
        let t = parse_time("1998:001:01:02:03.500").unwrap();
        assert!((t - 3723.5).abs() < 1e-9);
    }

    #[test]
    fn test_parse_time_rejects_garbage() {
        assert!(parse_time("not-a-time").is_err());
        assert!(parse_time("1998:400").is_err());
    }

    #[test]
    fn test_table_parsing_and_matching() {
        let mut bt = BadTimes::new();
        let added = bt
            .read_table(
                "# comment\n\
                 AOGBIAS1  1998:002  1998:003\n\
                 \n\
                 aorate*   100.0     200.0\n",
            )
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(bt.intervals_for("aogbias1").len(), 1);
        assert_eq!(bt.intervals_for("AORATE3").len(), 1);
        assert_eq!(bt.intervals_for("AOGYRO1").len(), 0);
    }
}
