//! Shared scaffolding for integration tests: an in-memory decom reader
//! and product builders for synthetic content.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use telarc::{ArchiveError, ColumnData, DecomProduct, DecomReader, Result};

/// Decom reader backed by a map of pre-built products, keyed by path.
#[derive(Default)]
pub struct MapReader {
    products: BTreeMap<PathBuf, DecomProduct>,
}

impl MapReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a product under a synthetic path and returns that path.
    pub fn insert(&mut self, product: DecomProduct) -> PathBuf {
        let path = PathBuf::from(format!("/stage/{}", product.filename));
        self.products.insert(path.clone(), product);
        path
    }
}

impl DecomReader for MapReader {
    fn decom(&self, path: &Path) -> Result<DecomProduct> {
        self.products
            .get(path)
            .cloned()
            .ok_or_else(|| ArchiveError::SourceDecom {
                filename: path.display().to_string(),
                reason: "not staged".to_string(),
            })
    }
}

/// Builds a product with f64 value columns. `tstop` is the projected
/// start of the next file, as upstream decom reports it.
pub fn product_f64(
    filename: &str,
    filetime: i64,
    tstart: f64,
    tstop: f64,
    times: Vec<f64>,
    columns: &[(&str, Vec<f64>, Vec<bool>)],
) -> DecomProduct {
    DecomProduct {
        filename: filename.to_string(),
        filetime,
        tstart,
        tstop,
        revision: 1,
        decom_version: "8.4.2".to_string(),
        times,
        columns: columns
            .iter()
            .map(|(name, vals, bads)| {
                (
                    name.to_string(),
                    (ColumnData::F64(vals.clone()), bads.clone()),
                )
            })
            .collect(),
    }
}

/// A product whose single column counts up with its sample index.
pub fn counting_product(
    filename: &str,
    msid: &str,
    t0: f64,
    n: usize,
    dt: f64,
) -> DecomProduct {
    let times: Vec<f64> = (0..n).map(|i| t0 + i as f64 * dt).collect();
    let vals: Vec<f64> = times.clone();
    product_f64(
        filename,
        t0 as i64,
        t0,
        t0 + n as f64 * dt,
        times,
        &[(msid, vals, vec![false; n])],
    )
}
