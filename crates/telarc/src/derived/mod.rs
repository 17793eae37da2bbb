//! Derived-parameter engine: MSIDs computed as pure functions of other
//! MSIDs on a uniform time grid.
//!
//! A derived parameter is registered as a record (name, content root,
//! root MSIDs, time step, calc function) rather than a subclass. Each
//! `(content_root, time_step)` pair yields one synthetic content type
//! named `dp_<content_root><mnf_step>`, ingested through the ordinary
//! pipeline via pseudo-archfiles named `<content>:<index0>:<index1>`
//! whose indices count grid steps from the mission epoch. The statistics
//! engine then treats derived contents exactly like natural ones.

use crate::error::{ArchiveError, Result};
use crate::fetch::interpolate::nearest_indexes;
use crate::fetch::{FetchData, FetchEngine, FetchOptions};
use crate::ingest::{AppendEvent, DecomProduct, IngestPipeline};
use crate::msid::{MsidMeta, MsidRegistry};
use crate::store::{ColumnData, ContentStore, DType, OpenMode};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Minor-frame duration in seconds; every derived time step is an
/// integer multiple of this.
pub const MNF_TIME: f64 = 0.25625;

/// Time span of one synthetic pseudo-archfile (seconds).
pub const ARCHFILE_TIME_STEP: f64 = 10000.0;

/// Gap limit for synthetic contents, matching the looser cadence of
/// derived products.
pub const DERIVED_MAX_GAP: f64 = 601.0;

/// Margin subtracted from the freshest root time so a derived chunk is
/// only computed once all roots safely cover it.
const ROOT_GUARD: f64 = 1000.0;

/// Root inputs pre-aligned to the uniform grid, handed to calc functions.
#[derive(Debug, Clone)]
pub struct DerivedInput {
    /// Uniform grid times.
    pub times: Vec<f64>,
    roots: BTreeMap<String, Vec<f64>>,
}

impl DerivedInput {
    /// Aligned values of one root MSID.
    ///
    /// # Panics
    ///
    /// Panics if `name` is not a registered root of the derived
    /// parameter, which is a programming error in the calc function.
    pub fn root(&self, name: &str) -> &[f64] {
        let upper = name.to_uppercase();
        self.roots
            .get(&upper)
            .unwrap_or_else(|| panic!("root MSID {upper} not in derived input"))
    }
}

/// Pure function evaluating a derived parameter from aligned inputs.
pub type CalcFn = Box<dyn Fn(&DerivedInput) -> Vec<f64> + Send + Sync>;

/// Registration record for one derived parameter.
pub struct DerivedDef {
    /// Canonical `DP_`-prefixed name.
    pub name: String,
    /// Root of the synthetic content name.
    pub content_root: String,
    /// Root MSIDs fetched and aligned as calc inputs.
    pub rootparams: Vec<String>,
    /// Uniform grid step (seconds), an integer multiple of [`MNF_TIME`].
    pub time_step: f64,
    /// The calc function.
    pub calc: CalcFn,
}

impl std::fmt::Debug for DerivedDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivedDef")
            .field("name", &self.name)
            .field("content_root", &self.content_root)
            .field("rootparams", &self.rootparams)
            .field("time_step", &self.time_step)
            .finish_non_exhaustive()
    }
}

impl DerivedDef {
    /// Creates a definition, canonicalizing the name and checking the
    /// time step.
    pub fn new(
        name: &str,
        content_root: &str,
        rootparams: &[&str],
        time_step: f64,
        calc: CalcFn,
    ) -> Result<Self> {
        let steps = time_step / MNF_TIME;
        if (steps - steps.round()).abs() > 1e-9 || steps < 1.0 {
            return Err(ArchiveError::Unsupported(format!(
                "time step {time_step} is not a positive multiple of the minor frame"
            )));
        }
        let upper = name.to_uppercase();
        let name = if upper.starts_with("DP_") { upper } else { format!("DP_{upper}") };
        Ok(Self {
            name,
            content_root: content_root.to_lowercase(),
            rootparams: rootparams.iter().map(|s| s.to_uppercase()).collect(),
            time_step,
            calc,
        })
    }

    /// Grid step expressed in minor frames.
    pub fn mnf_step(&self) -> u32 {
        (self.time_step / MNF_TIME).round() as u32
    }

    /// Name of the synthetic content holding this parameter.
    pub fn content(&self) -> String {
        format!("dp_{}{}", self.content_root, self.mnf_step())
    }
}

/// Registration table of derived parameters.
#[derive(Debug, Default)]
pub struct DerivedRegistry {
    defs: Vec<DerivedDef>,
}

impl DerivedRegistry {
    /// An empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a derived parameter, creating its synthetic content and
    /// MSID entry in the MSID registry.
    pub fn register(&mut self, def: DerivedDef, msids: &mut MsidRegistry) -> Result<()> {
        let content = def.content();
        msids.register_content_with_gap(&content, DERIVED_MAX_GAP);
        msids.register(MsidMeta::new(&def.name, &content, DType::F64))?;
        self.defs.push(def);
        Ok(())
    }

    /// All registered definitions.
    pub fn defs(&self) -> &[DerivedDef] {
        &self.defs
    }

    /// All synthetic content names, sorted.
    pub fn contents(&self) -> Vec<String> {
        self.defs
            .iter()
            .map(DerivedDef::content)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    fn defs_for_content(&self, content: &str) -> Vec<&DerivedDef> {
        self.defs
            .iter()
            .filter(|def| def.content() == content)
            .collect()
    }
}

/// Scheduled recomputation of derived contents.
#[derive(Debug)]
pub struct DerivedEngine<'a> {
    registry: &'a MsidRegistry,
    derived: &'a DerivedRegistry,
    data_root: PathBuf,
    guard: f64,
}

impl<'a> DerivedEngine<'a> {
    /// Creates an engine over the given registries and data root.
    pub fn new(registry: &'a MsidRegistry, derived: &'a DerivedRegistry, data_root: &Path) -> Self {
        Self {
            registry,
            derived,
            data_root: data_root.to_path_buf(),
            guard: ROOT_GUARD,
        }
    }

    /// Overrides the root-coverage guard (seconds). Mainly for tests and
    /// replay runs where all root data is final.
    pub fn with_guard(mut self, guard: f64) -> Self {
        self.guard = guard;
        self
    }

    /// Brings every synthetic content up to date. Returns the append
    /// events for the statistics engine.
    pub fn update_all(&self, pipeline: &IngestPipeline) -> Result<Vec<AppendEvent>> {
        let mut events = Vec::new();
        for content in self.derived.contents() {
            events.extend(self.update_content(&content, pipeline)?);
        }
        Ok(events)
    }

    /// Computes and ingests the latest interval covered by all root
    /// inputs of one synthetic content.
    pub fn update_content(
        &self,
        content: &str,
        pipeline: &IngestPipeline,
    ) -> Result<Vec<AppendEvent>> {
        let defs = self.derived.defs_for_content(content);
        let Some(first_def) = defs.first() else {
            return Ok(Vec::new());
        };
        let time_step = first_def.time_step;

        // Freshest interval covered by every root content, shortened by a
        // guard so late-arriving root data cannot invalidate the output.
        let mut roots: BTreeSet<&str> = BTreeSet::new();
        for def in &defs {
            roots.extend(def.rootparams.iter().map(String::as_str));
        }
        let Some((roots_first, roots_last)) = self.root_time_span(&roots)? else {
            debug!(content, "root contents empty - skipping derived update");
            return Ok(Vec::new());
        };
        let t_last = roots_last - self.guard;

        // Resume from the synthetic catalog; its last pseudo-archfile name
        // encodes the next grid index.
        let store = ContentStore::new(&self.data_root, content);
        store.ensure_dir()?;
        let catalog = crate::catalog::Catalog::open(&store.catalog_path())?;
        // Snap to the grid with a small tolerance: root times that sit
        // exactly on a grid point must not drift across it through float
        // round-off in the multiply/divide pair.
        let index0 = match catalog.last_filename()? {
            Some(filename) => parse_index1(&filename)?,
            None => (roots_first / time_step - 1e-9).ceil() as i64,
        };
        let index1 = (t_last / time_step + 1e-9).floor() as i64 + 1;
        if index0 >= index1 {
            return Ok(Vec::new());
        }

        let index_step = (ARCHFILE_TIME_STEP / time_step).round() as i64;
        let mut events = Vec::new();
        let mut a = index0;
        while a < index1 {
            let b = (a + index_step).min(index1);
            let product = self.build_product(content, &defs, time_step, a, b)?;
            if let Some(event) = pipeline.ingest_product_for(content, product)? {
                events.push(event);
            }
            a = b;
        }
        info!(content, chunks = events.len(), "updated derived content");
        Ok(events)
    }

    /// First and last times available across all root contents.
    fn root_time_span(&self, roots: &BTreeSet<&str>) -> Result<Option<(f64, f64)>> {
        let mut contents: BTreeSet<String> = BTreeSet::new();
        for root in roots {
            contents.insert(self.registry.get(root)?.content.clone());
        }
        let mut first = f64::NEG_INFINITY;
        let mut last = f64::INFINITY;
        for content in contents {
            let store = ContentStore::new(&self.data_root, &content);
            if !store.catalog_path().exists() {
                return Ok(None);
            }
            let catalog = crate::catalog::Catalog::open(&store.catalog_path())?;
            let horizon = catalog.last_row()?;
            if horizon == 0 {
                return Ok(None);
            }
            let mut time_col = store.open_time(OpenMode::Read)?;
            let (head, _) = time_col.read_range(0, 1)?;
            let (tail, _) = time_col.read_range(horizon - 1, horizon)?;
            first = first.max(head.as_f64()?[0]);
            last = last.min(tail.as_f64()?[0]);
        }
        Ok(Some((first, last)))
    }

    /// Evaluates all definitions of a content over grid `[a, b)` and
    /// packages the result as a synthetic decom product.
    fn build_product(
        &self,
        content: &str,
        defs: &[&DerivedDef],
        time_step: f64,
        a: i64,
        b: i64,
    ) -> Result<DecomProduct> {
        let times: Vec<f64> = (a..b).map(|i| i as f64 * time_step).collect();
        let t0 = times[0] - ROOT_GUARD;
        let t1 = times[times.len() - 1] + ROOT_GUARD;

        // Root alignment rule: bad-filtered nearest-neighbor onto the
        // grid; a grid point with no good root sample within one time
        // step is bad in the derived output.
        let fetch = FetchEngine::new(self.registry, &self.data_root);
        let mut roots: BTreeMap<String, Vec<f64>> = BTreeMap::new();
        let mut bads = vec![false; times.len()];
        let mut all_roots: BTreeSet<&str> = BTreeSet::new();
        for def in defs {
            all_roots.extend(def.rootparams.iter().map(String::as_str));
        }
        for root in all_roots {
            let msid = fetch.fetch(root, t0, t1, &FetchOptions::full_filtered())?;
            let FetchData::FullRes(data) = &msid.data else {
                unreachable!("full-resolution fetch returned aggregate data");
            };
            if data.times.is_empty() {
                roots.insert(msid.msid.clone(), vec![0.0; times.len()]);
                bads.iter_mut().for_each(|b| *b = true);
                continue;
            }
            let vals = data.vals.as_f64()?;
            let idx = nearest_indexes(&data.times, &times);
            let mut aligned = Vec::with_capacity(times.len());
            for (slot, (&i, &grid_t)) in idx.iter().zip(&times).enumerate() {
                aligned.push(vals[i]);
                if (data.times[i] - grid_t).abs() > time_step {
                    bads[slot] = true;
                }
            }
            roots.insert(msid.msid.clone(), aligned);
        }

        let input = DerivedInput { times: times.clone(), roots };
        let mut columns = BTreeMap::new();
        for def in defs {
            let vals = (def.calc)(&input);
            if vals.len() != times.len() {
                return Err(ArchiveError::SourceDecom {
                    filename: format!("{content}:{a}:{b}"),
                    reason: format!(
                        "calc for {} returned {} values for {} grid points",
                        def.name,
                        vals.len(),
                        times.len()
                    ),
                });
            }
            columns.insert(def.name.clone(), (ColumnData::F64(vals), bads.clone()));
        }

        Ok(DecomProduct {
            filename: format!("{content}:{a}:{b}"),
            filetime: times[0] as i64,
            tstart: times[0],
            tstop: times[times.len() - 1],
            revision: 0,
            decom_version: "derived".to_string(),
            times,
            columns,
        })
    }
}

/// Extracts the stop index from a pseudo-archfile name
/// `<content>:<index0>:<index1>`.
fn parse_index1(filename: &str) -> Result<i64> {
    filename
        .rsplit(':')
        .next()
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| {
            ArchiveError::Integrity(format!("malformed derived archfile name {filename:?}"))
        })
}
