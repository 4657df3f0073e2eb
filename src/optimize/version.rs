//! Component versions and the "nearest version not newer than mine" lookup.

use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::debug;

use crate::error::{OptimizeError, Result};

/// Directory holding definitions that apply to every version.
pub const SENTINEL_VERSION: &str = "0.1";

/// A dotted numeric version such as `4.2.1` or `4.2.1.0`.
///
/// Missing trailing segments compare as zero, so `1.0` equals `1.0.0`.
/// Anything after the first `-` (a build or release suffix) is ignored.
#[derive(Debug, Clone)]
pub struct ComponentVersion {
    text: String,
    segments: Vec<u64>,
}

impl ComponentVersion {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn segments(&self) -> &[u64] {
        &self.segments
    }
}

impl FromStr for ComponentVersion {
    type Err = OptimizeError;

    fn from_str(s: &str) -> Result<Self> {
        let text = s.trim();
        let core = text.split('-').next().unwrap_or_default();
        let segments = core
            .split('.')
            .map(|seg| seg.parse::<u64>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| OptimizeError::Version(s.to_string()))?;
        if segments.is_empty() {
            return Err(OptimizeError::Version(s.to_string()));
        }
        Ok(Self { text: text.to_string(), segments })
    }
}

impl fmt::Display for ComponentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl Ord for ComponentVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.segments.len().max(other.segments.len());
        (0..len)
            .map(|i| {
                let a = self.segments.get(i).copied().unwrap_or(0);
                let b = other.segments.get(i).copied().unwrap_or(0);
                a.cmp(&b)
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

impl PartialOrd for ComponentVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for ComponentVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ComponentVersion {}

/// Version-named subdirectories of `dir`, highest first.  Entries whose name
/// is not a version are ignored.
pub fn version_dirs(dir: &Path) -> Vec<ComponentVersion> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut versions: Vec<ComponentVersion> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .filter_map(|e| e.file_name().to_str().and_then(|n| n.parse().ok()))
        .collect();
    versions.sort_by(|a, b| b.cmp(a));
    versions
}

/// Find `<root>/<component>/<version>/<filename>`.
///
/// Falls back to the highest sibling version not newer than `version` that
/// has the file, then to the `sentinel` directory.  `None` when nothing
/// matches.
pub fn search_versioned_file(
    root: &Path,
    component: &str,
    version: &ComponentVersion,
    filename: &str,
    sentinel: &str,
) -> Option<PathBuf> {
    let base = root.join(component);

    let exact = base.join(version.as_str()).join(filename);
    if exact.is_file() {
        return Some(exact);
    }

    let nearest = version_dirs(&base)
        .into_iter()
        .filter(|v| v <= version)
        .map(|v| base.join(v.as_str()).join(filename))
        .find(|p| p.is_file());
    if nearest.is_some() {
        return nearest;
    }

    let fallback = base.join(sentinel).join(filename);
    if fallback.is_file() {
        return Some(fallback);
    }

    debug!(component, version = %version, filename, "no versioned file found");
    None
}
