//! MSID and content-type metadata registry.
//!
//! Every channel (MSID) belongs to exactly one content type: a named group
//! of MSIDs sharing the same time base. The registry maps case-insensitive
//! channel names to their element type, unit table, optional state-code
//! table and owning content, and resolves Linux-style glob patterns
//! against the full name set.

use crate::error::{ArchiveError, Result};
use crate::store::DType;
use crate::units::UnitTable;
use globset::GlobBuilder;
use std::collections::{BTreeMap, HashMap};

/// Default maximum time gap (seconds) between consecutive source files of
/// a content type before ingest requires operator attention.
pub const DEFAULT_MAX_GAP: f64 = 32.9;

/// Name prefix of derived-parameter MSIDs.
pub const DP_PREFIX: &str = "DP_";

/// Metadata for one telemetry channel.
#[derive(Debug, Clone)]
pub struct MsidMeta {
    /// Canonical (upper-case) channel name.
    pub name: String,
    /// Owning content type.
    pub content: String,
    /// Scalar element type of the stored column.
    pub dtype: DType,
    /// Unit labels and conversions per unit system.
    pub units: UnitTable,
    /// Raw code → state string table for state-valued MSIDs.
    pub state_codes: Option<Vec<(i64, String)>>,
}

impl MsidMeta {
    /// Creates metadata with no units and no state codes.
    pub fn new(name: &str, content: &str, dtype: DType) -> Self {
        Self {
            name: name.to_uppercase(),
            content: content.to_string(),
            dtype,
            units: UnitTable::none(),
            state_codes: None,
        }
    }

    /// Attaches a unit table.
    pub fn with_units(mut self, units: UnitTable) -> Self {
        self.units = units;
        self
    }

    /// Attaches a state-code table, making this a state-valued MSID.
    pub fn with_state_codes(mut self, codes: Vec<(i64, &str)>) -> Self {
        self.state_codes = Some(
            codes
                .into_iter()
                .map(|(raw, s)| (raw, s.to_string()))
                .collect(),
        );
        self
    }

    /// Returns true if this MSID carries a state-code table.
    pub fn is_state(&self) -> bool {
        self.state_codes.is_some()
    }
}

/// Metadata for one content type.
#[derive(Debug, Clone)]
pub struct ContentMeta {
    /// Content type name.
    pub name: String,
    /// MSIDs belonging to this content, in registration order.
    pub msids: Vec<String>,
    /// Maximum silent inter-file gap in seconds.
    pub max_gap: f64,
}

/// Registry of all known MSIDs and content types.
#[derive(Debug, Default)]
pub struct MsidRegistry {
    msids: HashMap<String, MsidMeta>,
    contents: BTreeMap<String, ContentMeta>,
}

impl MsidRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a content type with the default gap limit.
    pub fn register_content(&mut self, name: &str) {
        self.register_content_with_gap(name, DEFAULT_MAX_GAP);
    }

    /// Registers a content type with an explicit gap limit.
    pub fn register_content_with_gap(&mut self, name: &str, max_gap: f64) {
        self.contents
            .entry(name.to_string())
            .or_insert_with(|| ContentMeta {
                name: name.to_string(),
                msids: Vec::new(),
                max_gap,
            });
    }

    /// Registers an MSID. Its content type must already be registered.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::UnknownMsid`] if the content type is not
    /// registered.
    pub fn register(&mut self, meta: MsidMeta) -> Result<()> {
        let content = self
            .contents
            .get_mut(&meta.content)
            .ok_or_else(|| ArchiveError::UnknownMsid(format!("content {}", meta.content)))?;
        if !content.msids.contains(&meta.name) {
            content.msids.push(meta.name.clone());
        }
        self.msids.insert(meta.name.clone(), meta);
        Ok(())
    }

    /// Looks up one MSID by exact (case-insensitive) name. The `DP_` prefix
    /// may be omitted for derived MSIDs.
    pub fn get(&self, name: &str) -> Result<&MsidMeta> {
        let upper = name.to_uppercase();
        if let Some(meta) = self.msids.get(&upper) {
            return Ok(meta);
        }
        if let Some(meta) = self.msids.get(&format!("{DP_PREFIX}{upper}")) {
            return Ok(meta);
        }
        Err(ArchiveError::UnknownMsid(upper))
    }

    /// Returns true if an MSID with this name is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_ok()
    }

    /// Looks up a content type.
    pub fn content(&self, name: &str) -> Result<&ContentMeta> {
        self.contents
            .get(name)
            .ok_or_else(|| ArchiveError::UnknownMsid(format!("content {name}")))
    }

    /// All registered content types, in name order.
    pub fn contents(&self) -> impl Iterator<Item = &ContentMeta> {
        self.contents.values()
    }

    /// All registered MSID names, unsorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.msids.keys().map(String::as_str)
    }

    /// Expands a glob pattern to the sorted list of matching MSID names.
    ///
    /// Patterns support `*`, `?` and `[...]`, match case-insensitively, and
    /// may omit the `DP_` prefix of derived MSIDs.
    ///
    /// # Errors
    ///
    /// [`ArchiveError::UnknownMsid`] when nothing matches;
    /// [`ArchiveError::GlobOverMatch`] when more than `limit` names match.
    pub fn resolve_glob(&self, pattern: &str, limit: usize) -> Result<Vec<String>> {
        if !pattern.contains(['*', '?', '[']) {
            // Fast path for a plain name.
            return Ok(vec![self.get(pattern)?.name.clone()]);
        }

        let glob = GlobBuilder::new(pattern)
            .case_insensitive(true)
            .build()
            .map_err(|e| ArchiveError::Pattern(e.to_string()))?;
        let matcher = glob.compile_matcher();

        let mut matches: Vec<String> = self
            .msids
            .keys()
            .filter(|name| {
                matcher.is_match(name)
                    || name
                        .strip_prefix(DP_PREFIX)
                        .is_some_and(|bare| matcher.is_match(bare))
            })
            .cloned()
            .collect();
        matches.sort();

        if matches.is_empty() {
            return Err(ArchiveError::UnknownMsid(pattern.to_uppercase()));
        }
        if matches.len() > limit {
            return Err(ArchiveError::GlobOverMatch {
                pattern: pattern.to_string(),
                matches: matches.len(),
                limit,
            });
        }
        Ok(matches)
    }

    /// Resolves a pattern that must name exactly one MSID.
    pub fn resolve_one(&self, pattern: &str) -> Result<&MsidMeta> {
        let names = self.resolve_glob(pattern, 1)?;
        self.get(&names[0])
    }
}
