//! Integration tests for the statistics engine: window arithmetic,
//! time-weighted aggregates, state counts, restartability.

mod common;

use common::{counting_product, product_f64, MapReader};
use telarc::{
    Archive, ColumnData, DType, DecomProduct, FetchData, FetchOptions, MsidMeta, MsidRegistry,
    StatKind,
};
use tempfile::TempDir;

fn registry_with(msid: MsidMeta) -> MsidRegistry {
    let mut registry = MsidRegistry::new();
    registry.register_content("thermal");
    registry.register(msid).unwrap();
    registry
}

#[test]
fn test_five_minute_windows() {
    // Scenario: 600 samples at 1 s spacing, A equal to its sample index.
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(
        temp_dir.path(),
        registry_with(MsidMeta::new("A", "thermal", DType::F64)),
    );

    let mut reader = MapReader::new();
    let path = reader.insert(counting_product("f1.fits", "A", 0.0, 600, 1.0));
    archive.ingest("thermal", &[path], &reader).unwrap();

    let dat = archive
        .fetch("A", 0.0, 1e9, &FetchOptions::stat(StatKind::FiveMin))
        .unwrap();
    let FetchData::Stat5Min(stats) = &dat.data else {
        panic!("expected 5min stats");
    };

    assert_eq!(stats.indexes, vec![0, 1]);
    // Window [0, 328): samples 0..=327.
    assert_eq!(stats.n_samples[0], 328);
    assert_eq!(stats.mins[0], 0.0);
    assert_eq!(stats.maxes[0], 327.0);
    assert_eq!(stats.midvals[0], 164.0);
    assert!((stats.means[0] - 163.5).abs() < 1e-9);
    // Window [328, 656): samples 328..=599.
    assert_eq!(stats.n_samples[1], 272);
    assert_eq!(stats.mins[1], 328.0);
    assert_eq!(stats.maxes[1], 599.0);
}

#[test]
fn test_bad_samples_excluded_and_min_count() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(
        temp_dir.path(),
        registry_with(MsidMeta::new("A", "thermal", DType::F64)),
    );

    // Window 0 has only 2 good samples (no record); window 1 has 4.
    let times: Vec<f64> = vec![0.0, 10.0, 20.0, 330.0, 340.0, 350.0, 360.0];
    let vals: Vec<f64> = vec![1.0, 2.0, 3.0, 10.0, 20.0, 30.0, 40.0];
    let bads = vec![false, true, false, false, false, false, false];
    let mut reader = MapReader::new();
    let path = reader.insert(product_f64(
        "f1.fits",
        0,
        0.0,
        361.0,
        times,
        &[("A", vals, bads)],
    ));
    archive.ingest("thermal", &[path], &reader).unwrap();

    let dat = archive
        .fetch("A", 0.0, 1e9, &FetchOptions::stat(StatKind::FiveMin))
        .unwrap();
    let FetchData::Stat5Min(stats) = &dat.data else { panic!() };
    assert_eq!(stats.indexes, vec![1]);
    assert_eq!(stats.n_samples, vec![4]);
    assert_eq!(stats.mins[0], 10.0);
    assert_eq!(stats.maxes[0], 40.0);
}

#[test]
fn test_daily_percentiles_by_sort() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(
        temp_dir.path(),
        registry_with(MsidMeta::new("A", "thermal", DType::F64)),
    );

    // 101 samples with values 0..=100 scrambled across the day: the
    // percentiles of the sorted values are exactly their levels.
    let n = 101;
    let times: Vec<f64> = (0..n).map(|i| i as f64 * 600.0).collect();
    let vals: Vec<f64> = (0..n).map(|i| ((i * 37) % n) as f64).collect();
    let mut reader = MapReader::new();
    let path = reader.insert(product_f64(
        "f1.fits",
        0,
        0.0,
        (n as f64) * 600.0,
        times,
        &[("A", vals, vec![false; n])],
    ));
    archive.ingest("thermal", &[path], &reader).unwrap();

    let dat = archive
        .fetch("A", 0.0, 86400.0, &FetchOptions::stat(StatKind::Daily))
        .unwrap();
    let FetchData::StatDaily(stats) = &dat.data else {
        panic!("expected daily stats");
    };
    assert_eq!(stats.indexes, vec![0]);
    // All 101 samples land in the first day window, and with values being
    // a permutation of 0..=100 the sorted percentiles equal their levels.
    assert_eq!(stats.n_samples, vec![101]);
    let ps = stats.percentiles.as_ref().unwrap();
    assert_eq!(ps.p01s, vec![1.0]);
    assert_eq!(ps.p05s, vec![5.0]);
    assert_eq!(ps.p16s, vec![16.0]);
    assert_eq!(ps.p50s, vec![50.0]);
    assert_eq!(ps.p84s, vec![84.0]);
    assert_eq!(ps.p95s, vec![95.0]);
    assert_eq!(ps.p99s, vec![99.0]);
    assert_eq!(stats.means[0], 50.0);
    assert!(stats.stds[0] > 0.0);
}

#[test]
fn test_state_counts() {
    let meta = MsidMeta::new("MODE", "thermal", DType::I16)
        .with_state_codes(vec![(0, "OFF"), (1, "ON"), (2, "STBY")]);
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(temp_dir.path(), registry_with(meta));

    let n = 10;
    let times: Vec<f64> = (0..n).map(|i| i as f64).collect();
    let codes: Vec<i16> = vec![0, 0, 1, 1, 1, 2, 0, 1, 2, 2];
    let mut reader = MapReader::new();
    let path = reader.insert(DecomProduct {
        filename: "f1.fits".to_string(),
        filetime: 0,
        tstart: 0.0,
        tstop: n as f64,
        revision: 1,
        decom_version: "8.4.2".to_string(),
        times,
        columns: [(
            "MODE".to_string(),
            (ColumnData::I16(codes), vec![false; n]),
        )]
        .into_iter()
        .collect(),
    });
    archive.ingest("thermal", &[path], &reader).unwrap();

    let dat = archive
        .fetch("MODE", 0.0, 1e9, &FetchOptions::stat(StatKind::FiveMin))
        .unwrap();
    let FetchData::StatState(stats) = &dat.data else {
        panic!("expected state stats");
    };
    assert_eq!(stats.indexes, vec![0]);
    assert_eq!(stats.n_samples, vec![10]);
    let by_label: Vec<(&str, u32)> = stats
        .counts
        .iter()
        .map(|(_, label, counts)| (label.as_str(), counts[0]))
        .collect();
    assert_eq!(by_label, vec![("OFF", 3), ("ON", 4), ("STBY", 3)]);
}

#[test]
fn test_incremental_update_matches_one_shot() {
    // Determinism and restartability: two ingests followed by stat
    // updates end up identical to one bulk ingest.
    let build = |chunks: &[(String, f64, usize)]| -> Vec<u8> {
        let temp_dir = TempDir::new().unwrap();
        let archive = Archive::open(
            temp_dir.path(),
            registry_with(MsidMeta::new("A", "thermal", DType::F64)),
        );
        let mut reader = MapReader::new();
        let paths: Vec<_> = chunks
            .iter()
            .map(|(name, t0, n)| reader.insert(counting_product(name, "A", *t0, *n, 1.0)))
            .collect();
        for path in paths {
            archive.ingest("thermal", &[path], &reader).unwrap();
        }
        let store = telarc::store::ContentStore::new(temp_dir.path(), "thermal");
        std::fs::read(store.stats_dir("5min").join("A.stats")).unwrap()
    };

    let split = build(&[
        ("f1.fits".to_string(), 0.0, 400),
        ("f2.fits".to_string(), 400.0, 400),
    ]);
    let merged = build(&[("f1.fits".to_string(), 0.0, 800)]);

    // Same samples, same windows, same records; only the file split
    // differs and the stat store cannot see that.
    assert_eq!(split, merged);
}

#[test]
fn test_stat_fetch_time_range() {
    let temp_dir = TempDir::new().unwrap();
    let archive = Archive::open(
        temp_dir.path(),
        registry_with(MsidMeta::new("A", "thermal", DType::F64)),
    );
    let mut reader = MapReader::new();
    let path = reader.insert(counting_product("f1.fits", "A", 0.0, 2000, 1.0));
    archive.ingest("thermal", &[path], &reader).unwrap();

    // Full store holds windows 0..=6 (2000 s of data, tail included).
    let dat = archive
        .fetch("A", 328.0, 984.0, &FetchOptions::stat(StatKind::FiveMin))
        .unwrap();
    let FetchData::Stat5Min(stats) = &dat.data else { panic!() };
    assert_eq!(stats.indexes, vec![1, 2]);
    // Stat times are window midpoints.
    assert!((stats.times[0] - 1.5 * 328.0).abs() < 1e-9);
}
