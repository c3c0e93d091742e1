//! Artifact archival.
//!
//! Copies every file under a workspace root whose relative path matches one
//! of the configured glob patterns into a destination directory, preserving
//! the relative layout, and writes a `MANIFEST.json` describing what was
//! kept. Zero matches is a normal result. Per-file problems are collected in
//! the report instead of aborting the archive.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::domain::error::Result;
use crate::glob::glob_match;

pub const MANIFEST_FILE: &str = "MANIFEST.json";

/// One archived file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchivedArtifact {
    /// Path relative to the workspace root, `/`-separated.
    pub relative_path: String,
    pub size_bytes: u64,
    /// SHA-256 of the file contents, hex encoded.
    pub sha256: String,
}

/// What an archive pass did.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArchiveReport {
    pub destination: PathBuf,
    pub archived: Vec<ArchivedArtifact>,
    /// Patterns that matched no file.
    pub unmatched_patterns: Vec<String>,
    /// Files that matched but could not be copied, and walk errors.
    pub errors: Vec<String>,
}

impl ArchiveReport {
    pub fn count(&self) -> usize {
        self.archived.len()
    }

    pub fn total_bytes(&self) -> u64 {
        self.archived.iter().map(|a| a.size_bytes).sum()
    }
}

/// Copies matching files into durable storage.
pub struct ArtifactArchiver {
    destination: PathBuf,
    excluded: Vec<PathBuf>,
}

impl ArtifactArchiver {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            excluded: Vec::new(),
        }
    }

    /// Never descend into `dir`, e.g. an enclosing archive root.
    pub fn excluding(mut self, dir: impl Into<PathBuf>) -> Self {
        self.excluded.push(dir.into());
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Archive files under `root` matching any of `patterns`.
    ///
    /// Only failing to create the destination directory or to write the
    /// manifest is an error; everything else lands in the report.
    pub fn archive(&self, root: &Path, patterns: &[String]) -> Result<ArchiveReport> {
        fs::create_dir_all(&self.destination)?;
        let destination = fs::canonicalize(&self.destination)?;
        let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
        let mut skipped = vec![destination.clone()];
        skipped.extend(
            self.excluded
                .iter()
                .filter_map(|dir| fs::canonicalize(dir).ok()),
        );

        let mut report = ArchiveReport {
            destination: destination.clone(),
            ..ArchiveReport::default()
        };
        let mut matched_patterns: BTreeSet<usize> = BTreeSet::new();

        if !patterns.is_empty() {
            let walker = WalkDir::new(&root)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| !skipped.iter().any(|dir| e.path() == dir.as_path()));

            for entry in walker {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        report.errors.push(format!("walk error: {e}"));
                        continue;
                    }
                };
                if !entry.file_type().is_file() {
                    continue;
                }
                let rel = match entry.path().strip_prefix(&root) {
                    Ok(rel) => rel.to_string_lossy().replace('\\', "/"),
                    Err(_) => continue,
                };

                let hits: Vec<usize> = patterns
                    .iter()
                    .enumerate()
                    .filter(|(_, p)| glob_match(p, &rel))
                    .map(|(i, _)| i)
                    .collect();
                if hits.is_empty() {
                    continue;
                }
                matched_patterns.extend(hits);

                match copy_with_digest(entry.path(), &destination.join(&rel)) {
                    Ok((size_bytes, sha256)) => {
                        debug!(artifact = %rel, size_bytes, "archived artifact");
                        report.archived.push(ArchivedArtifact {
                            relative_path: rel,
                            size_bytes,
                            sha256,
                        });
                    }
                    Err(e) => {
                        warn!(artifact = %rel, error = %e, "failed to archive artifact");
                        report.errors.push(format!("{rel}: {e}"));
                    }
                }
            }
        }

        report.unmatched_patterns = patterns
            .iter()
            .enumerate()
            .filter(|(i, _)| !matched_patterns.contains(i))
            .map(|(_, p)| p.clone())
            .collect();

        write_manifest(&destination, &report.archived)?;
        Ok(report)
    }
}

/// Stream `src` into `dest` through a temp file, hashing as it goes.
fn copy_with_digest(src: &Path, dest: &Path) -> std::io::Result<(u64, String)> {
    let parent = dest
        .parent()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "no parent"))?;
    fs::create_dir_all(parent)?;

    let mut input = fs::File::open(src)?;
    let mut tmp = NamedTempFile::new_in(parent)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = input.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        tmp.write_all(&buf[..n])?;
        size += n as u64;
    }
    tmp.persist(dest).map_err(|e| e.error)?;
    Ok((size, hex::encode(hasher.finalize())))
}

fn write_manifest(destination: &Path, artifacts: &[ArchivedArtifact]) -> Result<()> {
    let json = serde_json::to_vec_pretty(artifacts)?;
    let mut tmp = NamedTempFile::new_in(destination)?;
    tmp.write_all(&json)?;
    tmp.persist(destination.join(MANIFEST_FILE))
        .map_err(|e| e.error)?;
    Ok(())
}
