//! Sample discovery.
//!
//! Expands the paths given on the command line into the list of sample files
//! to submit, walking directories and skipping hidden entries and oversized
//! files.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, WalkDir};

/// Configuration for sample scanning.
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Files larger than this are skipped.
    pub max_file_size: u64,
    /// Maximum number of samples to return.
    pub max_files: Option<usize>,
    /// Skip dot-files and dot-directories while walking.
    pub skip_hidden: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            max_file_size: 256 * 1024 * 1024,
            max_files: None,
            skip_hidden: true,
        }
    }
}

impl From<&crate::config::GeneralConfig> for ScanConfig {
    fn from(config: &crate::config::GeneralConfig) -> Self {
        Self {
            max_file_size: config.max_file_size,
            ..Self::default()
        }
    }
}

/// A discovered sample.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedSample {
    pub path: PathBuf,
    pub size: u64,
}

pub struct SampleScanner {
    config: ScanConfig,
}

impl SampleScanner {
    pub fn new(config: ScanConfig) -> Self {
        Self { config }
    }

    /// Expand `roots` into samples. A root that does not exist is an error;
    /// unreadable entries below a directory root are skipped.
    pub fn scan(&self, roots: &[PathBuf]) -> Result<Vec<ScannedSample>> {
        let mut samples = Vec::new();

        for root in roots {
            let metadata = fs::metadata(root)
                .with_context(|| format!("Cannot access {}", root.display()))?;

            if metadata.is_file() {
                self.push(&mut samples, root, metadata.len());
            } else {
                self.walk(root, &mut samples);
            }

            if self.limit_reached(&samples) {
                break;
            }
        }

        if let Some(max) = self.config.max_files {
            samples.truncate(max);
        }
        Ok(samples)
    }

    fn walk(&self, root: &Path, samples: &mut Vec<ScannedSample>) {
        let walker = WalkDir::new(root)
            .follow_links(false)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !(self.config.skip_hidden && is_hidden(e)));

        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    debug!("Skipping unreadable entry: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let size = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    debug!("Cannot stat {}: {}", entry.path().display(), e);
                    continue;
                }
            };

            self.push(samples, entry.path(), size);
            if self.limit_reached(samples) {
                break;
            }
        }
    }

    fn push(&self, samples: &mut Vec<ScannedSample>, path: &Path, size: u64) {
        if size > self.config.max_file_size {
            warn!(
                "Skipping {} ({} bytes exceeds the {} byte limit)",
                path.display(),
                size,
                self.config.max_file_size
            );
            return;
        }
        if samples.iter().any(|s| s.path == path) {
            return;
        }
        samples.push(ScannedSample {
            path: path.to_path_buf(),
            size,
        });
    }

    fn limit_reached(&self, samples: &[ScannedSample]) -> bool {
        self.config.max_files.is_some_and(|max| samples.len() >= max)
    }
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .map(|name| name.starts_with('.'))
        .unwrap_or(false)
}
