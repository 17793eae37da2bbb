//! Top-level archive facade wiring the pipeline, statistics, derived
//! parameters and fetch together over one data root.
//!
//! Per content type the archive assumes a single writer (the ingest and
//! derived update methods) and any number of readers (fetch). Fetch
//! observes a source file's ingest atomically because readers bound
//! themselves by the archfiles catalog tail, and statistics for an
//! interval become visible only after its full-resolution rows.

use crate::badtimes::BadTimes;
use crate::derived::{DerivedDef, DerivedEngine, DerivedRegistry};
use crate::error::Result;
use crate::fetch::{FetchConfig, FetchEngine, FetchOptions, Msid, MsidSet, Sources};
use crate::ingest::{AppendEvent, DecomReader, IngestConfig, IngestPipeline};
use crate::msid::MsidRegistry;
use crate::stats::{StatsConfig, StatsEngine};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// One telemetry archive rooted at a data directory.
pub struct Archive {
    registry: MsidRegistry,
    derived: DerivedRegistry,
    bad_times: BadTimes,
    data_root: PathBuf,
    ingest_config: IngestConfig,
    stats_config: StatsConfig,
    fetch_config: FetchConfig,
    derived_guard: Option<f64>,
}

impl Archive {
    /// Opens an archive over `data_root` with the given MSID registry.
    pub fn open(data_root: &Path, registry: MsidRegistry) -> Self {
        Self {
            registry,
            derived: DerivedRegistry::new(),
            bad_times: BadTimes::new(),
            data_root: data_root.to_path_buf(),
            ingest_config: IngestConfig::default(),
            stats_config: StatsConfig::default(),
            fetch_config: FetchConfig::default(),
            derived_guard: None,
        }
    }

    /// Overrides the ingest options.
    pub fn with_ingest_config(mut self, config: IngestConfig) -> Self {
        self.ingest_config = config;
        self
    }

    /// Overrides the statistics options.
    pub fn with_stats_config(mut self, config: StatsConfig) -> Self {
        self.stats_config = config;
        self
    }

    /// Overrides the fetch options.
    pub fn with_fetch_config(mut self, config: FetchConfig) -> Self {
        self.fetch_config = config;
        self
    }

    /// Overrides the derived-parameter root-coverage guard (seconds).
    pub fn with_derived_guard(mut self, guard: f64) -> Self {
        self.derived_guard = Some(guard);
        self
    }

    /// The MSID registry.
    pub fn registry(&self) -> &MsidRegistry {
        &self.registry
    }

    /// Mutable registry access for setup-time registration.
    pub fn registry_mut(&mut self) -> &mut MsidRegistry {
        &mut self.registry
    }

    /// The data root directory.
    pub fn data_root(&self) -> &Path {
        &self.data_root
    }

    /// The bad-times registry consumed by fetch callers.
    pub fn bad_times(&self) -> &BadTimes {
        &self.bad_times
    }

    /// Mutable bad-times access. Mutation must not overlap a fetch.
    pub fn bad_times_mut(&mut self) -> &mut BadTimes {
        &mut self.bad_times
    }

    /// Registers a derived parameter and its synthetic content.
    pub fn register_derived(&mut self, def: DerivedDef) -> Result<()> {
        self.derived.register(def, &mut self.registry)
    }

    /// Ingests source files for a content type and updates its 5-minute
    /// and daily statistics.
    pub fn ingest(
        &self,
        content: &str,
        files: &[PathBuf],
        reader: &dyn DecomReader,
    ) -> Result<Vec<AppendEvent>> {
        let pipeline =
            IngestPipeline::with_config(&self.registry, &self.data_root, self.ingest_config.clone());
        let events = pipeline.ingest_files(content, files, reader)?;
        if !events.is_empty() {
            self.stats_engine().update_content(content)?;
        }
        Ok(events)
    }

    /// Recomputes all derived contents from their roots, then updates
    /// their statistics.
    pub fn update_derived(&self) -> Result<Vec<AppendEvent>> {
        let pipeline =
            IngestPipeline::with_config(&self.registry, &self.data_root, self.ingest_config.clone());
        let mut engine = DerivedEngine::new(&self.registry, &self.derived, &self.data_root);
        if let Some(guard) = self.derived_guard {
            engine = engine.with_guard(guard);
        }
        let events = engine.update_all(&pipeline)?;

        let contents: BTreeSet<&str> = events.iter().map(|e| e.content.as_str()).collect();
        let stats = self.stats_engine();
        for content in contents {
            stats.update_content(content)?;
        }
        Ok(events)
    }

    /// Operator repair: removes all data of `content` from `t_cut` on.
    /// A later re-ingest of the same source files restores the content
    /// bit-identically.
    pub fn truncate(&self, content: &str, t_cut: f64) -> Result<()> {
        let pipeline =
            IngestPipeline::with_config(&self.registry, &self.data_root, self.ingest_config.clone());
        pipeline.truncate(content, t_cut)
    }

    /// Checks the structural invariants of one content type.
    pub fn verify(&self, content: &str) -> Result<()> {
        IngestPipeline::new(&self.registry, &self.data_root).verify(content)
    }

    /// Re-runs the statistics update for every MSID of a content.
    pub fn update_stats(&self, content: &str) -> Result<()> {
        self.stats_engine().update_content(content)
    }

    /// Fetches one MSID over `[tstart, tstop)`.
    pub fn fetch(
        &self,
        pattern: &str,
        tstart: f64,
        tstop: f64,
        options: &FetchOptions,
    ) -> Result<Msid> {
        self.fetch_engine().fetch(pattern, tstart, tstop, options)
    }

    /// Fetches a set of MSIDs given by glob patterns.
    pub fn fetch_set(
        &self,
        patterns: &[&str],
        tstart: f64,
        tstop: f64,
        options: &FetchOptions,
    ) -> Result<MsidSet> {
        self.fetch_engine().fetch_set(patterns, tstart, tstop, options)
    }

    /// Fetches one MSID through an explicit ordered source list.
    pub fn fetch_with_sources(
        &self,
        pattern: &str,
        tstart: f64,
        tstop: f64,
        options: &FetchOptions,
        sources: &Sources,
    ) -> Result<Msid> {
        self.fetch_engine()
            .fetch_with_sources(pattern, tstart, tstop, options, sources)
    }

    /// The default source list: the archive alone.
    pub fn sources(&self) -> Sources<'_> {
        Sources::archive(&self.registry, &self.data_root)
    }

    fn stats_engine(&self) -> StatsEngine<'_> {
        StatsEngine::with_config(&self.registry, &self.data_root, self.stats_config.clone())
    }

    fn fetch_engine(&self) -> FetchEngine<'_> {
        FetchEngine::with_config(&self.registry, &self.data_root, self.fetch_config.clone())
    }
}
