use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::ScanError;

/// Outcome of looking for the scanner binary.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub binary_path: Option<PathBuf>,
    /// Every path checked, in order.
    pub tried: Vec<PathBuf>,
    pub override_path: Option<PathBuf>,
}

impl Resolution {
    pub fn into_result(self) -> Result<PathBuf, ScanError> {
        self.binary_path
            .ok_or(ScanError::BinaryNotFound { tried: self.tried })
    }
}

/// Finds the scanner: explicit override first, then the conventional
/// install locations around `base_dir`, then sibling directories whose
/// name contains the scanner name.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    override_path: Option<PathBuf>,
    base_dir: PathBuf,
    name: String,
}

impl BinaryLocator {
    pub fn new(override_path: Option<PathBuf>, base_dir: impl Into<PathBuf>, name: &str) -> Self {
        Self {
            override_path,
            base_dir: base_dir.into(),
            name: name.to_string(),
        }
    }

    pub fn resolve(&self) -> Resolution {
        let mut tried = Vec::new();
        let override_path = self.override_path.as_deref().map(absolutize);

        if let Some(path) = &override_path {
            tried.push(path.clone());
            if path.is_file() {
                return Resolution {
                    binary_path: Some(path.clone()),
                    tried,
                    override_path,
                };
            }
        }

        for candidate in self.candidates() {
            tried.push(candidate.clone());
            if candidate.is_file() {
                debug!(binary = %candidate.display(), "resolved scanner binary");
                return Resolution {
                    binary_path: Some(candidate),
                    tried,
                    override_path,
                };
            }
        }

        debug!(tried = tried.len(), "scanner binary not found");
        Resolution {
            binary_path: None,
            tried,
            override_path,
        }
    }

    /// Candidate locations in check order, without duplicates.
    pub fn candidates(&self) -> Vec<PathBuf> {
        let root = absolutize(&self.base_dir);
        let parent = root.parent().map(Path::to_path_buf);
        let grandparent = parent
            .as_deref()
            .and_then(Path::parent)
            .map(Path::to_path_buf);

        let mut out: Vec<PathBuf> = Vec::new();
        for base in [Some(&root), parent.as_ref(), grandparent.as_ref()]
            .into_iter()
            .flatten()
        {
            self.push_layout(&mut out, base);
        }
        for dir in [parent.as_ref(), grandparent.as_ref()].into_iter().flatten() {
            for sibling in self.named_subdirs(dir) {
                self.push_layout(&mut out, &sibling);
            }
        }
        out
    }

    fn push_layout(&self, out: &mut Vec<PathBuf>, base: &Path) {
        let name = self.name.as_str();
        for candidate in [
            base.join(name),
            base.join(name).join(name),
            base.join(name).join("build").join(name),
            base.join("build").join(name),
        ] {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        }
    }

    fn named_subdirs(&self, dir: &Path) -> Vec<PathBuf> {
        let needle = self.name.to_lowercase();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "could not inspect directory");
                return Vec::new();
            }
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter(|entry| {
                entry
                    .file_name()
                    .to_string_lossy()
                    .to_lowercase()
                    .contains(&needle)
            })
            .map(|entry| entry.path())
            .collect();
        // read_dir order is platform dependent
        dirs.sort();
        dirs
    }
}

fn absolutize(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|cwd| cwd.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}
