//! Column store: per-MSID append-only arrays with parallel quality bits.

pub mod column;
pub mod content;
pub mod quality;

pub use column::{ColumnData, ColumnFile, DType, OpenMode};
pub use content::{ContentStore, MsidColumn, TIME_COLUMN};
pub use quality::QualityFile;
