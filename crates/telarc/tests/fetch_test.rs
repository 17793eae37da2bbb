//! Integration tests for the fetch engine: unit systems, MSIDset
//! concordance, interpolation policies, interval filters, bad times and
//! ordered data sources.

mod common;

use common::{counting_product, product_f64, MapReader};
use proptest::prelude::*;
use telarc::fetch::sources::{DataSource, RawSamples};
use telarc::fetch::{intervals, Interval};
use telarc::{
    Archive, ArchiveError, DType, FetchData, FetchOptions, InterpOptions, MsidMeta, MsidRegistry,
    Result, UnitSystem, UnitTable, Values,
};
use tempfile::TempDir;

fn two_content_registry() -> MsidRegistry {
    let mut registry = MsidRegistry::new();
    registry.register_content("pcad");
    registry.register_content("thermal");
    registry
        .register(MsidMeta::new("AORATE1", "pcad", DType::F64))
        .unwrap();
    registry
        .register(MsidMeta::new("AORATE2", "pcad", DType::F64))
        .unwrap();
    registry
        .register(
            MsidMeta::new("TEPHIN", "thermal", DType::F64).with_units(UnitTable::kelvin()),
        )
        .unwrap();
    registry
}

fn ingest_pcad(archive: &Archive, bads1: Vec<bool>, bads2: Vec<bool>) {
    let n = bads1.len();
    let times: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let vals1: Vec<f64> = (0..n).map(|i| i as f64 * 10.0).collect();
    let vals2: Vec<f64> = (0..n).map(|i| i as f64 * 100.0).collect();
    let mut reader = MapReader::new();
    let path = reader.insert(product_f64(
        "pcad1.fits",
        0,
        0.0,
        n as f64,
        times,
        &[("AORATE1", vals1, bads1), ("AORATE2", vals2, bads2)],
    ));
    archive.ingest("pcad", &[path], &reader).unwrap();
}

#[test]
fn test_unit_system_selection() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(temp_dir.path(), two_content_registry());
    let mut reader = MapReader::new();
    let path = reader.insert(product_f64(
        "t1.fits",
        0,
        0.0,
        2.0,
        vec![0.0, 1.0],
        &[("TEPHIN", vec![273.15, 373.15], vec![false, false])],
    ));
    archive.ingest("thermal", &[path], &reader).unwrap();

    let cxc = archive.fetch("TEPHIN", 0.0, 2.0, &FetchOptions::full()).unwrap();
    assert_eq!(cxc.unit.as_deref(), Some("K"));

    let sci = archive
        .fetch(
            "TEPHIN",
            0.0,
            2.0,
            &FetchOptions { unit_system: Some(UnitSystem::Sci), ..FetchOptions::full() },
        )
        .unwrap();
    assert_eq!(sci.unit.as_deref(), Some("DEGC"));
    let FetchData::FullRes(data) = &sci.data else { panic!() };
    let Values::Float(vals) = &data.vals else { panic!() };
    assert!((vals[0] - 0.0).abs() < 1e-9);
    assert!((vals[1] - 100.0).abs() < 1e-9);

    let eng = archive
        .fetch(
            "TEPHIN",
            0.0,
            2.0,
            &FetchOptions { unit_system: Some(UnitSystem::Eng), ..FetchOptions::full() },
        )
        .unwrap();
    let FetchData::FullRes(data) = &eng.data else { panic!() };
    let Values::Float(vals) = &data.vals else { panic!() };
    assert!((vals[0] - 32.0).abs() < 1e-6);
    assert!((vals[1] - 212.0).abs() < 1e-6);
}

#[test]
fn test_empty_range_is_not_an_error() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(temp_dir.path(), two_content_registry());
    ingest_pcad(&archive, vec![false; 10], vec![false; 10]);

    let dat = archive
        .fetch("AORATE1", 5000.0, 6000.0, &FetchOptions::full())
        .unwrap();
    assert!(dat.is_empty());

    let err = archive.fetch("NOPE", 0.0, 1.0, &FetchOptions::full()).unwrap_err();
    assert!(matches!(err, ArchiveError::UnknownMsid(_)));
}

#[test]
fn test_glob_set_expansion_and_cap() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(temp_dir.path(), two_content_registry());
    ingest_pcad(&archive, vec![false; 4], vec![false; 4]);

    let set = archive
        .fetch_set(&["aorate*"], 0.0, 4.0, &FetchOptions::full())
        .unwrap();
    assert_eq!(set.names(), &["AORATE1".to_string(), "AORATE2".to_string()]);

    // A single-MSID fetch must not accept a multi-match pattern.
    let err = archive.fetch("aorate*", 0.0, 4.0, &FetchOptions::full()).unwrap_err();
    assert!(matches!(err, ArchiveError::GlobOverMatch { .. }));
}

#[test]
fn test_msidset_same_content_concordance() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(temp_dir.path(), two_content_registry());
    // AORATE1 bad at row 1, AORATE2 bad at row 3.
    ingest_pcad(
        &archive,
        vec![false, true, false, false, false],
        vec![false, false, false, true, false],
    );

    let set = archive
        .fetch_set(&["AORATE1", "AORATE2"], 0.0, 5.0, &FetchOptions::full_filtered())
        .unwrap();
    let a1 = set.get("AORATE1").unwrap();
    let a2 = set.get("AORATE2").unwrap();
    let (FetchData::FullRes(d1), FetchData::FullRes(d2)) = (&a1.data, &a2.data) else {
        panic!()
    };
    // Rows 1 and 3 drop from both members; the time axis stays common.
    assert_eq!(d1.times, vec![0.0, 2.0, 4.0]);
    assert_eq!(d2.times, vec![0.0, 2.0, 4.0]);
    assert!(d1.bads.is_none());
    assert!(d2.bads.is_none());
}

fn interp_archive() -> (TempDir, Archive) {
    // X at 1 s cadence with one bad sample, Y at 4 s cadence, in
    // different content types.
    let mut registry = MsidRegistry::new();
    registry.register_content("fast");
    registry.register_content("slow");
    registry.register(MsidMeta::new("X", "fast", DType::F64)).unwrap();
    registry.register(MsidMeta::new("Y", "slow", DType::F64)).unwrap();
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(temp_dir.path(), registry);

    let n = 16;
    let times: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let vals: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let mut bads = vec![false; n];
    bads[6] = true;
    let mut reader = MapReader::new();
    let p1 = reader.insert(product_f64("x1.fits", 0, 0.0, n as f64, times, &[("X", vals, bads)]));
    archive.ingest("fast", &[p1], &reader).unwrap();

    let times: Vec<f64> = (0..4).map(|i| i as f64 * 4.0).collect();
    let vals: Vec<f64> = times.iter().map(|t| t * 100.0).collect();
    let p2 = reader.insert(product_f64(
        "y1.fits",
        0,
        0.0,
        16.0,
        times,
        &[("Y", vals, vec![false; 4])],
    ));
    archive.ingest("slow", &[p2], &reader).unwrap();
    (temp_dir, archive)
}

#[test]
fn test_interpolate_bad_union_strict_coincidence() {
    let (_dir, archive) = interp_archive();
    let mut set = archive
        .fetch_set(&["X", "Y"], 0.0, 16.0, &FetchOptions::full())
        .unwrap();
    set.interpolate(&InterpOptions::dt(2.0).policies(true, true)).unwrap();

    // Grid 0,2,...,14: the point at t=6 takes X's bad sample at t=6, so
    // that row drops from both MSIDs under strict coincidence.
    let x = archive_set_times(&set);
    assert!(!x.contains(&6.0));
    let mx = set.get("X").unwrap();
    let my = set.get("Y").unwrap();
    let (FetchData::FullRes(dx), FetchData::FullRes(dy)) = (&mx.data, &my.data) else {
        panic!()
    };
    // Both MSIDs lose exactly the union-bad rows and stay aligned.
    assert_eq!(dx.times, dy.times);
    assert_eq!(dx.times.len(), 7);
    assert!(dx.bads.is_none() && dy.bads.is_none());
}

fn archive_set_times(set: &telarc::MsidSet) -> Vec<f64> {
    set.times.clone().unwrap()
}

#[test]
fn test_interpolate_policy_matrix() {
    let (_dir, archive) = interp_archive();

    // false/false: everyone keeps their own bads on the common grid.
    let mut set = archive
        .fetch_set(&["X", "Y"], 0.0, 16.0, &FetchOptions::full())
        .unwrap();
    set.interpolate(&InterpOptions::dt(2.0).policies(false, false)).unwrap();
    let dx = match &set.get("X").unwrap().data {
        FetchData::FullRes(d) => d.clone(),
        _ => panic!(),
    };
    let dy = match &set.get("Y").unwrap().data {
        FetchData::FullRes(d) => d.clone(),
        _ => panic!(),
    };
    assert_eq!(dx.times.len(), 8);
    assert_eq!(dx.bads.as_ref().unwrap().iter().filter(|&&b| b).count(), 1);
    assert_eq!(dy.bads.as_ref().unwrap().iter().filter(|&&b| b).count(), 0);
    // times0 records where each interpolated sample really came from.
    assert_eq!(dx.times0.as_ref().unwrap()[3], 6.0);

    // false/true: bads become the union on every member.
    let mut set = archive
        .fetch_set(&["X", "Y"], 0.0, 16.0, &FetchOptions::full())
        .unwrap();
    set.interpolate(&InterpOptions::dt(2.0).policies(false, true)).unwrap();
    let bx = match &set.get("X").unwrap().data {
        FetchData::FullRes(d) => d.bads.clone().unwrap(),
        _ => panic!(),
    };
    let by = match &set.get("Y").unwrap().data {
        FetchData::FullRes(d) => d.bads.clone().unwrap(),
        _ => panic!(),
    };
    assert_eq!(bx, by);
    assert_eq!(bx.iter().filter(|&&b| b).count(), 1);

    // true/false: bads removed per MSID before interpolation, gap-free.
    let mut set = archive
        .fetch_set(&["X", "Y"], 0.0, 16.0, &FetchOptions::full())
        .unwrap();
    set.interpolate(&InterpOptions::dt(2.0).policies(true, false)).unwrap();
    let dx = match &set.get("X").unwrap().data {
        FetchData::FullRes(d) => d.clone(),
        _ => panic!(),
    };
    assert_eq!(dx.times.len(), 8);
    assert!(dx.bads.is_none());
    // The bad sample at t=6 was dropped pre-interpolation, so grid t=6
    // falls back to the equidistant neighbors at 5 and 7; earlier wins.
    assert_eq!(dx.times0.as_ref().unwrap()[3], 5.0);
}

#[test]
fn test_select_remove_intervals_partition() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(temp_dir.path(), two_content_registry());
    ingest_pcad(&archive, vec![false; 20], vec![false; 20]);

    let intervals = [Interval::new(3.0, 7.0), Interval::new(12.0, 15.0)];
    let dat = archive.fetch("AORATE1", 0.0, 20.0, &FetchOptions::full()).unwrap();

    let selected = dat.select_intervals_copy(&intervals);
    let removed = dat.remove_intervals_copy(&intervals);
    assert_eq!(selected.len() + removed.len(), dat.len());
    let FetchData::FullRes(sel) = &selected.data else { panic!() };
    assert_eq!(sel.times, vec![3.0, 4.0, 5.0, 6.0, 12.0, 13.0, 14.0]);
}

proptest! {
    /// select_intervals and remove_intervals partition any result: their
    /// union is the original and their intersection is empty.
    #[test]
    fn prop_interval_partition(
        times in proptest::collection::vec(0.0f64..1000.0, 1..80),
        raw in proptest::collection::vec((0.0f64..1000.0, 0.0f64..50.0), 0..8),
    ) {
        let mut times = times;
        times.sort_by(f64::total_cmp);
        times.dedup();
        let ivs: Vec<Interval> = raw.iter().map(|&(t0, w)| Interval::new(t0, t0 + w)).collect();

        let mask = intervals::in_intervals_mask(&times, &ivs);
        let selected: Vec<f64> = times.iter().zip(&mask).filter_map(|(&t, &m)| m.then_some(t)).collect();
        let removed: Vec<f64> = times.iter().zip(&mask).filter_map(|(&t, &m)| (!m).then_some(t)).collect();

        prop_assert_eq!(selected.len() + removed.len(), times.len());
        let mut rebuilt = [selected, removed].concat();
        rebuilt.sort_by(f64::total_cmp);
        prop_assert_eq!(rebuilt, times);
    }
}

#[test]
fn test_bad_times_overlay() {
    let temp_dir = TempDir::new().unwrap();
    let mut archive = Archive::open(temp_dir.path(), two_content_registry());
    ingest_pcad(&archive, vec![false; 10], vec![false; 10]);

    archive
        .bad_times_mut()
        .read_table("AORATE1 2.0 5.0\naorate* 8.0 9.0\n")
        .unwrap();

    let mut dat = archive.fetch("AORATE1", 0.0, 10.0, &FetchOptions::full()).unwrap();
    dat.filter_bad_times(archive.bad_times());
    let FetchData::FullRes(data) = &dat.data else { panic!() };
    assert_eq!(data.times, vec![0.0, 1.0, 5.0, 6.0, 7.0, 9.0]);

    // AORATE2 only matches the glob entry.
    let mut dat = archive.fetch("AORATE2", 0.0, 10.0, &FetchOptions::full()).unwrap();
    dat.filter_bad_times(archive.bad_times());
    assert_eq!(dat.len(), 9);
}

/// A fake live-telemetry source serving a fixed tail range for AORATE1.
struct LiveSource {
    tstart: f64,
    tstop: f64,
}

impl DataSource for LiveSource {
    fn name(&self) -> &str {
        "live"
    }

    fn knows(&self, msid: &str) -> bool {
        msid == "AORATE1"
    }

    fn fetch_raw(&self, _msid: &str, tstart: f64, tstop: f64) -> Result<Option<RawSamples>> {
        let lo = tstart.max(self.tstart).ceil() as i64;
        let hi = tstop.min(self.tstop).ceil() as i64;
        if lo >= hi {
            return Ok(None);
        }
        let times: Vec<f64> = (lo..hi).map(|i| i as f64).collect();
        let vals: Vec<f64> = times.iter().map(|t| t * 10.0).collect();
        let n = times.len();
        Ok(Some(RawSamples { times, vals: Values::Float(vals), bads: vec![false; n] }))
    }
}

#[test]
fn test_ordered_sources_with_provenance() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(temp_dir.path(), two_content_registry());
    // Archive holds [0, 10); live source serves [0, 30).
    ingest_pcad(&archive, vec![false; 10], vec![false; 10]);

    let sources = archive.sources().with(LiveSource { tstart: 0.0, tstop: 30.0 });
    let dat = archive
        .fetch_with_sources("AORATE1", 0.0, 20.0, &FetchOptions::full(), &sources)
        .unwrap();

    // 10 archive samples + 10 live samples past the archive tail.
    assert_eq!(dat.len(), 20);
    assert_eq!(dat.sources.len(), 2);
    assert_eq!(dat.sources[0].source, "archive");
    assert_eq!(dat.sources[1].source, "live");
    assert!(dat.sources[1].tstart > dat.sources[0].tstop);

    let FetchData::FullRes(data) = &dat.data else { panic!() };
    assert_eq!(data.times.len(), 20);
    assert_eq!(data.times[10], 10.0);
}
