use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cryptography::parse_hex32;
use crate::framing::Manifest;
use crate::warnings::WarningSink;

pub const LOCK_FILE_NAME: &str = ".transfer_lock.json";
pub const LOCK_VERSION: &str = "1.0";

/// Locks older than this are stale and ignored.
const STALE_AFTER_SECS: i64 = 24 * 3600;

/// Buffered progress updates are flushed at either bound.
const FLUSH_INTERVAL: Duration = Duration::from_secs(2);
const MAX_PENDING_UPDATES: usize = 150;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Per-file resume state as persisted in the lock document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileState {
    pub status: FileStatus,
    pub size: u64,
    /// SHA-256 of the source file, as announced by the sender (lowercase hex).
    pub source_hash: String,
    pub transferred_bytes: u64,
    /// SHA-256 of the first `transferred_bytes` bytes of the part file.
    pub partial_hash: Option<String>,
    pub last_modified: Option<String>,
}

/// Durable resume state for one receiving directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockDocument {
    pub version: String,
    pub session_id: Uuid,
    /// RFC 3339.
    pub timestamp: String,
    pub sender_endpoint: String,
    pub total_files: u64,
    pub total_size: u64,
    pub files: BTreeMap<String, FileState>,
}

/// How an incoming manifest entry relates to persisted state.
#[derive(Debug, Default)]
pub struct ResumePlan {
    /// Entries already on disk with matching source hashes; their byte
    /// ranges are discarded from the stream.
    pub completed: HashSet<String>,
    /// Entries with a plausible part file; verified lazily at first write.
    pub partial: HashMap<String, PartialResume>,
    /// Everything else, transferred from scratch.
    pub fresh: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct PartialResume {
    pub resume_bytes: u64,
    pub partial_hash: Option<[u8; 32]>,
}

/// Sole writer of `.transfer_lock.json`.
///
/// Progress updates are buffered and flushed when 150 updates accumulate,
/// two seconds pass, a file changes status, or the session tears down. Every
/// save goes through a sibling temp file, fsync, and rename, so readers only
/// ever observe complete documents. An unclean shutdown loses at most one
/// flush window; partial-hash verification on resume absorbs that.
pub struct LockManager {
    path: PathBuf,
    doc: Option<LockDocument>,
    pending: usize,
    last_flush: Instant,
}

impl LockManager {
    pub fn new(dir: &Path) -> Self {
        LockManager {
            path: dir.join(LOCK_FILE_NAME),
            doc: None,
            pending: 0,
            last_flush: Instant::now(),
        }
    }

    pub fn document(&self) -> Option<&LockDocument> {
        self.doc.as_ref()
    }

    /// Load an existing lock document if one is present, valid, and fresh.
    ///
    /// Schema violations, version mismatches, and stale timestamps are
    /// logged and treated as an absent lock; nothing here is fatal.
    pub fn load_existing(&mut self, sink: &WarningSink) -> bool {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(_) => return false,
        };
        let doc: LockDocument = match serde_json::from_str(&raw) {
            Ok(doc) => doc,
            Err(err) => {
                sink.warn(&format!("ignoring unreadable lock document: {}", err));
                return false;
            }
        };
        if doc.version != LOCK_VERSION {
            sink.warn(&format!(
                "ignoring lock document with unsupported version {:?}",
                doc.version
            ));
            return false;
        }
        let age_secs = match DateTime::parse_from_rfc3339(&doc.timestamp) {
            Ok(ts) => Utc::now()
                .signed_duration_since(ts.with_timezone(&Utc))
                .num_seconds(),
            Err(err) => {
                sink.warn(&format!("ignoring lock document with bad timestamp: {}", err));
                return false;
            }
        };
        if age_secs > STALE_AFTER_SECS {
            sink.warn(&format!(
                "ignoring stale lock document (age {} hours)",
                age_secs / 3600
            ));
            return false;
        }
        self.doc = Some(doc);
        true
    }

    /// Initialize a fresh lock document for an incoming manifest and persist
    /// it immediately.
    pub fn create(&mut self, sender_endpoint: &str, manifest: &Manifest, sink: &WarningSink) {
        let mut files = BTreeMap::new();
        for entry in &manifest.entries {
            files.insert(
                entry.path.clone(),
                FileState {
                    status: FileStatus::Pending,
                    size: entry.size,
                    source_hash: entry.hash_hex.clone(),
                    transferred_bytes: 0,
                    partial_hash: None,
                    last_modified: None,
                },
            );
        }
        self.doc = Some(LockDocument {
            version: LOCK_VERSION.to_string(),
            session_id: Uuid::new_v4(),
            timestamp: Utc::now().to_rfc3339(),
            sender_endpoint: sender_endpoint.to_string(),
            total_files: manifest.entries.len() as u64,
            total_size: manifest.total_size(),
            files,
        });
        self.save(sink);
        self.pending = 0;
        self.last_flush = Instant::now();
    }

    /// Compare persisted state against an incoming manifest.
    ///
    /// `completed` requires a stored completed status and a matching source
    /// hash; a hash mismatch means the source changed and forces a fresh
    /// transfer. `partial` requires an in-progress entry whose size matches
    /// and whose byte count is strictly inside the file; the part file's
    /// hash is checked lazily by the writer at first write.
    pub fn classify(&self, manifest: &Manifest, sink: &WarningSink) -> ResumePlan {
        let mut plan = ResumePlan::default();
        let Some(doc) = &self.doc else {
            plan.fresh = manifest.entries.iter().map(|e| e.path.clone()).collect();
            return plan;
        };

        for entry in &manifest.entries {
            let Some(state) = doc.files.get(&entry.path) else {
                plan.fresh.push(entry.path.clone());
                continue;
            };
            if state.source_hash != entry.hash_hex {
                sink.warn(&format!(
                    "source changed since last session: {} (retransferring)",
                    entry.path
                ));
                plan.fresh.push(entry.path.clone());
                continue;
            }
            if state.size != entry.size {
                plan.fresh.push(entry.path.clone());
                continue;
            }
            match state.status {
                FileStatus::Completed => {
                    plan.completed.insert(entry.path.clone());
                }
                FileStatus::InProgress
                    if state.transferred_bytes > 0 && state.transferred_bytes < state.size =>
                {
                    plan.partial.insert(
                        entry.path.clone(),
                        PartialResume {
                            resume_bytes: state.transferred_bytes,
                            partial_hash: state.partial_hash.as_deref().and_then(parse_hex32),
                        },
                    );
                }
                _ => plan.fresh.push(entry.path.clone()),
            }
        }
        plan
    }

    /// Align a loaded document with the session's manifest: entries the plan
    /// classified fresh are reset (with the incoming size and hash), paths
    /// the manifest no longer carries are dropped, and the session header is
    /// refreshed. Completed and partial entries keep their resume state.
    pub fn reconcile(
        &mut self,
        sender_endpoint: &str,
        manifest: &Manifest,
        plan: &ResumePlan,
        sink: &WarningSink,
    ) {
        let Some(doc) = self.doc.as_mut() else { return };

        let keep: std::collections::HashSet<&str> =
            manifest.entries.iter().map(|e| e.path.as_str()).collect();
        doc.files.retain(|path, _| keep.contains(path.as_str()));

        for entry in &manifest.entries {
            let preserved =
                plan.completed.contains(&entry.path) || plan.partial.contains_key(&entry.path);
            if !preserved {
                doc.files.insert(
                    entry.path.clone(),
                    FileState {
                        status: FileStatus::Pending,
                        size: entry.size,
                        source_hash: entry.hash_hex.clone(),
                        transferred_bytes: 0,
                        partial_hash: None,
                        last_modified: None,
                    },
                );
            }
        }
        doc.sender_endpoint = sender_endpoint.to_string();
        doc.timestamp = Utc::now().to_rfc3339();
        doc.total_files = manifest.entries.len() as u64;
        doc.total_size = manifest.total_size();

        self.pending += 1;
        self.flush(sink);
    }

    /// Buffered per-chunk progress update. `transferred_bytes` is monotonic
    /// here; only an explicit status reset can lower it.
    pub fn record_progress(
        &mut self,
        path: &str,
        written: u64,
        partial_hash: Option<String>,
        sink: &WarningSink,
    ) {
        let Some(doc) = self.doc.as_mut() else { return };
        let Some(state) = doc.files.get_mut(path) else { return };

        state.transferred_bytes = state.transferred_bytes.max(written);
        if partial_hash.is_some() {
            state.partial_hash = partial_hash;
        }

        self.pending += 1;
        if self.pending >= MAX_PENDING_UPDATES || self.last_flush.elapsed() >= FLUSH_INTERVAL {
            self.flush(sink);
        }
    }

    /// Status transition; always flushed immediately.
    pub fn set_status(
        &mut self,
        path: &str,
        status: FileStatus,
        written: u64,
        partial_hash: Option<String>,
        sink: &WarningSink,
    ) {
        let Some(doc) = self.doc.as_mut() else { return };
        let Some(state) = doc.files.get_mut(path) else { return };

        state.status = status;
        state.transferred_bytes = written;
        state.partial_hash = partial_hash;
        if status == FileStatus::Completed {
            state.last_modified = Some(Utc::now().to_rfc3339());
        }

        self.pending += 1;
        self.flush(sink);
    }

    /// Persist any buffered updates now.
    pub fn flush(&mut self, sink: &WarningSink) {
        if self.pending == 0 {
            return;
        }
        self.save(sink);
        self.pending = 0;
        self.last_flush = Instant::now();
    }

    /// Remove the lock document after a fully successful session.
    pub fn cleanup_on_success(&mut self, sink: &WarningSink) {
        self.doc = None;
        self.pending = 0;
        if self.path.exists() {
            if let Err(err) = std::fs::remove_file(&self.path) {
                sink.warn(&format!("failed to remove lock document: {}", err));
            }
        }
    }

    fn save(&self, sink: &WarningSink) {
        let Some(doc) = &self.doc else { return };
        let result = (|| -> std::io::Result<()> {
            let body = serde_json::to_vec_pretty(doc)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
            let tmp = self.path.with_extension("json.tmp");
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&body)?;
            file.sync_all()?;
            std::fs::rename(&tmp, &self.path)?;
            Ok(())
        })();
        if let Err(err) = result {
            sink.warn(&format!("failed to save lock document: {}", err));
        }
    }
}
