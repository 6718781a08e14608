use std::collections::HashSet;
use std::path::Path;

use crate::utils::paths;

/// Suffixes of in-progress writes; never treated as completed files.
const IGNORED_SUFFIXES: [&str; 5] = [".tmp", ".part", ".crdownload", ".download", ".swp"];

/// Decides which directories are descended into and which files count.
#[derive(Debug, Clone, Default)]
pub struct WatchFilter {
    /// Lowercased dot-prefixed extensions; empty accepts every file.
    extensions: Vec<String>,
    /// Directory base names that are never entered.
    exclude_names: HashSet<String>,
    /// Normalised absolute prefixes that are never entered.
    exclude_prefixes: Vec<String>,
}

impl WatchFilter {
    pub fn new(extensions_raw: &str, exclude: &[String]) -> Self {
        let extensions = extensions_raw
            .split([',', ' ', '\t'])
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
            .collect();

        let mut exclude_names = HashSet::new();
        let mut exclude_prefixes = Vec::new();
        for entry in exclude {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            if Path::new(entry).is_absolute() {
                exclude_prefixes.push(paths::normalise(Path::new(entry)));
            } else {
                exclude_names.insert(entry.to_string());
            }
        }

        Self {
            extensions,
            exclude_names,
            exclude_prefixes,
        }
    }

    /// Directories matching the exclusion set are never subscribed to
    /// and never descended into.
    pub fn dir_excluded(&self, dir: &str) -> bool {
        if let Some(name) = dir.rsplit('/').next() {
            if self.exclude_names.contains(name) {
                return true;
            }
        }
        self.exclude_prefixes
            .iter()
            .any(|prefix| paths::is_under(prefix, dir))
    }

    /// Extension match is case-insensitive; temp suffixes always lose.
    pub fn accepts_file(&self, file: &str) -> bool {
        let lower = file.to_lowercase();
        if IGNORED_SUFFIXES.iter().any(|suffix| lower.ends_with(suffix)) {
            return false;
        }
        if self.extensions.is_empty() {
            return true;
        }
        self.extensions.iter().any(|ext| lower.ends_with(ext))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_extension_list_accepts_all() {
        let filter = WatchFilter::new("", &[]);
        assert!(filter.accepts_file("/w/a.log"));
        assert!(filter.accepts_file("/w/readme"));
    }

    #[test]
    fn extension_match_is_case_insensitive() {
        let filter = WatchFilter::new(".log,.txt", &[]);
        assert!(filter.accepts_file("/w/A.LOG"));
        assert!(filter.accepts_file("/w/b.txt"));
        assert!(!filter.accepts_file("/w/c.csv"));
    }

    #[test]
    fn temp_suffixes_always_rejected() {
        let filter = WatchFilter::new("", &[]);
        for name in [
            "/w/a.tmp",
            "/w/a.part",
            "/w/a.crdownload",
            "/w/a.download",
            "/w/a.swp",
        ] {
            assert!(!filter.accepts_file(name), "{name} should be rejected");
        }
        // Even when the temp suffix is explicitly configured.
        let filter = WatchFilter::new(".tmp", &[]);
        assert!(!filter.accepts_file("/w/a.tmp"));
    }

    #[test]
    fn dir_exclusion_by_name_and_prefix() {
        let filter = WatchFilter::new("", &["node_modules".to_string(), "/w/skip".to_string()]);
        assert!(filter.dir_excluded("/w/app/node_modules"));
        assert!(filter.dir_excluded("/w/skip/deep"));
        assert!(!filter.dir_excluded("/w/app/src"));
    }
}
