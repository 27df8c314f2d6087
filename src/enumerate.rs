use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use glob::Pattern;
use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::{Result, TransferError};
use crate::warnings::WarningSink;

/// Directory names excluded from directory walks unless the caller opts out:
/// virtual environments, package caches, and VCS metadata.
pub const DEFAULT_EXCLUDES: &[&str] = &[
    "venv",
    ".venv",
    "env",
    ".env",
    "virtualenv",
    "__pycache__",
    ".pytest_cache",
    ".tox",
    "node_modules",
    ".npm",
    ".yarn",
    ".git",
    ".svn",
    ".hg",
    "conda-env",
    ".conda",
    ".mypy_cache",
    ".coverage",
    ".cache",
    "target",
];

/// One file in the deterministic transfer manifest.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Where the bytes live on the sending host.
    pub absolute: PathBuf,
    /// Slash-normalized path announced to the receiver.
    pub relative: String,
    pub size: u64,
    pub hash: [u8; 32],
    /// Cumulative size of the preceding entries in sorted order.
    pub offset: u64,
}

/// Walk the input paths into a sorted manifest with per-file sizes, source
/// hashes, and stream offsets.
///
/// File inputs contribute a single `basename` entry. Directory inputs
/// recurse with paths kept relative to the input root's parent, so the root
/// directory name lands as the receiver's top-level component. Exclusion
/// patterns match case-sensitively against each path component. Special and
/// unreadable files are skipped with a warning.
pub fn collect(
    inputs: &[PathBuf],
    excludes: &[String],
    sink: &WarningSink,
) -> Result<Vec<SourceFile>> {
    let patterns = compile_patterns(excludes, sink);
    let mut files: Vec<(PathBuf, String)> = Vec::new();

    for input in inputs {
        let meta = std::fs::metadata(input).map_err(TransferError::Filesystem)?;
        if meta.is_file() {
            let name = input
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| TransferError::PathUnsafe(input.display().to_string()))?;
            files.push((input.clone(), name));
        } else if meta.is_dir() {
            collect_directory(input, &patterns, sink, &mut files);
        } else {
            sink.warn(&format!(
                "skipping {} (not a regular file or directory)",
                input.display()
            ));
        }
    }

    // Hash in a stable order, then dedupe and assign offsets. Manifest paths
    // must be unique; the first occurrence wins.
    files.sort_by(|a, b| a.1.cmp(&b.1));
    files.dedup_by(|a, b| {
        let duplicate = a.1 == b.1;
        if duplicate {
            sink.warn(&format!("duplicate manifest path {} dropped", a.1));
        }
        duplicate
    });

    let mut manifest = Vec::with_capacity(files.len());
    let mut offset = 0u64;
    for (absolute, relative) in files {
        let relative = match validate_relative_path(&relative) {
            Ok(rel) => rel,
            Err(_) => {
                sink.warn(&format!("skipping {} (unsafe manifest path)", relative));
                continue;
            }
        };
        let (size, hash) = match hash_file(&absolute, sink) {
            Ok(pair) => pair,
            Err(err) => {
                sink.warn(&format!(
                    "skipping unreadable file {}: {}",
                    absolute.display(),
                    err
                ));
                continue;
            }
        };
        manifest.push(SourceFile {
            absolute,
            relative,
            size,
            hash,
            offset,
        });
        offset += size;
    }
    Ok(manifest)
}

fn collect_directory(
    root: &Path,
    patterns: &[Pattern],
    sink: &WarningSink,
    out: &mut Vec<(PathBuf, String)>,
) {
    let base = root.parent().unwrap_or_else(|| Path::new("")).to_path_buf();
    let walker = WalkDir::new(root).follow_links(false).into_iter();

    for entry in walker.filter_entry(|e| {
        // Pruning by component name here cuts whole excluded subtrees.
        e.depth() == 0 || !matches_any(&e.file_name().to_string_lossy(), patterns)
    }) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                sink.warn(&format!("skipping unreadable entry: {}", err));
                continue;
            }
        };
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }
        if !file_type.is_file() {
            sink.warn(&format!(
                "skipping {} (not a regular file)",
                entry.path().display()
            ));
            continue;
        }
        let relative = match entry.path().strip_prefix(&base) {
            Ok(rel) => slash_join(rel),
            Err(_) => slash_join(entry.path()),
        };
        out.push((entry.path().to_path_buf(), relative));
    }
}

fn compile_patterns(excludes: &[String], sink: &WarningSink) -> Vec<Pattern> {
    let mut patterns = Vec::with_capacity(excludes.len());
    for raw in excludes {
        match Pattern::new(raw) {
            Ok(p) => patterns.push(p),
            Err(err) => sink.warn(&format!("ignoring invalid exclude pattern {:?}: {}", raw, err)),
        }
    }
    patterns
}

fn matches_any(component: &str, patterns: &[Pattern]) -> bool {
    patterns.iter().any(|p| p.matches(component))
}

fn slash_join(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

/// Validate and normalize a manifest path.
///
/// Rejects absolute roots, `..` segments, drive letters, and empty
/// components; backslashes are treated as separators before checking so a
/// Windows-shaped traversal cannot slip through.
pub fn validate_relative_path(path: &str) -> Result<String> {
    if path.is_empty() {
        return Err(TransferError::PathUnsafe("<empty>".to_string()));
    }
    let normalized = path.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(TransferError::PathUnsafe(path.to_string()));
    }
    let mut components = Vec::new();
    for part in normalized.split('/') {
        if part.is_empty() || part == "." {
            return Err(TransferError::PathUnsafe(path.to_string()));
        }
        if part == ".." {
            return Err(TransferError::PathUnsafe(path.to_string()));
        }
        // A drive letter ("C:") anywhere in a component re-roots the path on
        // Windows targets.
        if part.contains(':') {
            return Err(TransferError::PathUnsafe(path.to_string()));
        }
        components.push(part);
    }
    // The std view of the path must also agree it is purely normal
    // components.
    let as_path = Path::new(&normalized);
    if as_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)))
    {
        return Err(TransferError::PathUnsafe(path.to_string()));
    }
    Ok(components.join("/"))
}

/// Stream a file through SHA-256 once, returning the byte count actually
/// read along with the digest. A size that moved since `stat` is logged and
/// the observed size wins.
fn hash_file(path: &Path, sink: &WarningSink) -> std::io::Result<(u64, [u8; 32])> {
    let mut file = File::open(path)?;
    let stat_size = file.metadata()?.len();

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        total += n as u64;
    }
    if total != stat_size {
        sink.warn(&format!(
            "size of {} changed during enumeration ({} -> {})",
            path.display(),
            stat_size,
            total
        ));
    }
    Ok((total, hasher.finalize().into()))
}
