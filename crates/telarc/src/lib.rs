//! telarc - Columnar Time-Series Telemetry Archive
//!
//! This crate stores spacecraft engineering telemetry (thousands of named
//! channels, called MSIDs, sampled over decades of mission time) as
//! append-only columns with quality bits, and answers quality-aware
//! time-range queries over them.
//!
//! # Components
//!
//! - [`store`]: per-MSID column files and quality bitmaps
//! - [`catalog::Catalog`]: relational record of every ingested source file
//! - [`ingest::IngestPipeline`]: idempotent per-file ingest with gap
//!   handling and crash recovery
//! - [`stats::StatsEngine`]: 5-minute and daily aggregates on a
//!   mission-global interval index
//! - [`derived::DerivedEngine`]: parameters computed from other MSIDs on a
//!   uniform grid
//! - [`fetch::FetchEngine`]: range queries, interpolation, interval
//!   filters, unit systems, ordered data sources
//! - [`badtimes::BadTimes`]: user-policy interval exclusions
//!
//! # Example
//!
//! ```rust,ignore
//! use telarc::{Archive, FetchOptions, MsidMeta, MsidRegistry};
//!
//! let mut registry = MsidRegistry::new();
//! registry.register_content("thermal");
//! registry.register(MsidMeta::new("TEPHIN", "thermal", telarc::DType::F32))?;
//!
//! let archive = Archive::open(data_root, registry);
//! archive.ingest("thermal", &files, &reader)?;
//!
//! let dat = archive.fetch("TEPHIN", tstart, tstop, &FetchOptions::full_filtered())?;
//! ```

#![deny(missing_docs)]

pub mod archive;
pub mod badtimes;
pub mod catalog;
pub mod derived;
pub mod error;
pub mod fetch;
pub mod ingest;
pub mod msid;
pub mod stats;
pub mod store;
pub mod units;

pub use archive::Archive;
pub use badtimes::BadTimes;
pub use catalog::{ArchfileRecord, Catalog};
pub use derived::{DerivedDef, DerivedInput, DerivedRegistry, MNF_TIME};
pub use error::{ArchiveError, Result};
pub use fetch::{
    FetchData, FetchEngine, FetchOptions, Interval, InterpOptions, Msid, MsidSet, Sources, Values,
};
pub use ingest::{AppendEvent, DecomProduct, DecomReader, IngestConfig, IngestPipeline};
pub use msid::{MsidMeta, MsidRegistry};
pub use stats::{StatKind, StatsEngine};
pub use store::{ColumnData, DType, OpenMode};
pub use units::{UnitConv, UnitSystem, UnitTable};
