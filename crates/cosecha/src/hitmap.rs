//! Source-report normalization into line-level hit maps.
//!
//! A raw [`SourceReport`] is a pile of per-range hit and miss token
//! positions. [`normalize`] folds every range of one report into a
//! per-script map of 1-based line to cumulative hit count, then flattens
//! each map into the `[line, count, line, count, ...]` shape consumed by
//! downstream formatters.

use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;

use crate::result::{CollectError, CollectResult};
use crate::service::{Script, SourceReport, VmService};

/// Scheme marking ad-hoc evaluated expressions with no durable source
const EVALUATED_SCHEME: &str = "evaluate:";

/// Line to cumulative hit count, ordered by first touch
pub type LineHits = IndexMap<u32, u64>;

/// The `script` object restated inside every coverage entry.
///
/// Serializes to the fixed-id descriptor downstream formatters expect:
/// `{"type":"@Script","fixedId":true,"id":"libraries/1/scripts/<enc>",...}`.
#[derive(Debug, Clone, Serialize)]
pub struct ScriptDescriptor {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(rename = "fixedId")]
    fixed_id: bool,
    id: String,
    uri: String,
    #[serde(rename = "_kind")]
    script_kind: &'static str,
}

impl ScriptDescriptor {
    /// Build the descriptor for a source URI.
    ///
    /// The synthetic id percent-encodes the URI so it stays stable across
    /// collections of the same script.
    #[must_use]
    pub fn new(uri: &str) -> Self {
        Self {
            kind: "@Script",
            fixed_id: true,
            id: format!("libraries/1/scripts/{}", urlencoding::encode(uri)),
            uri: uri.to_string(),
            script_kind: "library",
        }
    }

    /// The synthetic stable identifier
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

/// One source unit's merged coverage, flattened for output
#[derive(Debug, Clone, Serialize)]
pub struct ScriptCoverageEntry {
    /// Source unit URI
    pub source: String,
    /// Script descriptor with the synthetic stable id
    pub script: ScriptDescriptor,
    /// Alternating `[line, count, line, count, ...]` pairs
    pub hits: Vec<u64>,
}

impl ScriptCoverageEntry {
    /// Flatten a line hit map into an output entry
    #[must_use]
    pub fn from_lines(uri: &str, lines: &LineHits) -> Self {
        let mut hits = Vec::with_capacity(lines.len() * 2);
        for (&line, &count) in lines {
            hits.push(u64::from(line));
            hits.push(count);
        }
        Self {
            source: uri.to_string(),
            script: ScriptDescriptor::new(uri),
            hits,
        }
    }
}

/// Terminal output envelope: `{"type": "CodeCoverage", "coverage": [...]}`
#[derive(Debug, Clone, Serialize)]
pub struct CoverageEnvelope {
    #[serde(rename = "type")]
    kind: &'static str,
    /// Entries in first-encounter order across all isolates
    pub coverage: Vec<ScriptCoverageEntry>,
}

impl CoverageEnvelope {
    /// Wrap accumulated entries in the tagged envelope
    #[must_use]
    pub fn new(coverage: Vec<ScriptCoverageEntry>) -> Self {
        Self {
            kind: "CodeCoverage",
            coverage,
        }
    }
}

/// Normalize one isolate's source report into coverage entries.
///
/// Script metadata is fetched once per distinct script reference and
/// cached for the duration of the call. Ranges over `evaluate:` pseudo
/// scripts and uncompiled ranges are skipped. Hit tokens increment their
/// line's count; miss tokens insert the line with count 0 unless some
/// range already hit it. Tokens the script cannot place on a line are
/// logged and dropped rather than poisoning the whole report.
///
/// Calling this twice for the same isolate double-counts; callers must
/// feed each report exactly once.
///
/// # Errors
///
/// Returns [`CollectError::Service`] if a range points outside the
/// report's script table, or any error from loading script metadata.
pub async fn normalize(
    service: &dyn VmService,
    report: &SourceReport,
) -> CollectResult<Vec<ScriptCoverageEntry>> {
    let mut scripts: HashMap<String, Script> = HashMap::new();
    let mut hit_maps: IndexMap<String, LineHits> = IndexMap::new();

    for range in &report.ranges {
        if !range.compiled {
            continue;
        }
        let Some(coverage) = &range.coverage else {
            continue;
        };
        let script_ref = report.scripts.get(range.script_index).ok_or_else(|| {
            CollectError::Service {
                message: format!(
                    "source report range references unknown script index {}",
                    range.script_index
                ),
            }
        })?;
        if script_ref.uri.starts_with(EVALUATED_SCHEME) {
            continue;
        }

        if !scripts.contains_key(&script_ref.id) {
            let script = service.load_script(script_ref).await?;
            scripts.insert(script_ref.id.clone(), script);
        }
        let script = &scripts[&script_ref.id];
        let lines = hit_maps.entry(script_ref.uri.clone()).or_default();

        for &token in &coverage.hits {
            match script.line_of(token) {
                Some(line) => *lines.entry(line + 1).or_insert(0) += 1,
                None => {
                    tracing::warn!(uri = %script_ref.uri, token, "hit token has no line mapping");
                }
            }
        }
        for &token in &coverage.misses {
            match script.line_of(token) {
                Some(line) => {
                    lines.entry(line + 1).or_insert(0);
                }
                None => {
                    tracing::warn!(uri = %script_ref.uri, token, "miss token has no line mapping");
                }
            }
        }
    }

    Ok(hit_maps
        .iter()
        .map(|(uri, lines)| ScriptCoverageEntry::from_lines(uri, lines))
        .collect())
}
