use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::cryptography::hex_string;
use crate::error::{Result, TransferError};
use crate::lock::{FileStatus, LockManager, PartialResume};
use crate::warnings::WarningSink;

/// Why a writer gave up on its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterFailure {
    /// Running hash did not match the announced source hash; retried
    /// in-session via a retry request.
    Integrity,
    /// Disk-level error; not retried in-session, preserved in the lock for a
    /// later run.
    Filesystem,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterState {
    Pending,
    InProgress,
    Completed,
    Failed(WriterFailure),
}

/// Incremental writer for one manifest entry.
///
/// Bytes accumulate in `<target>.part` with a running SHA-256; the
/// descriptor is opened and closed around every chunk, so the receiver's
/// open-descriptor count stays flat no matter how many files a session
/// carries. Completion verifies the hash and atomically renames the part
/// file into place, probing `name_1.ext`, `name_2.ext`, ... on conflicts.
pub struct FileWriter {
    relative: String,
    size: u64,
    source_hash: [u8; 32],
    manifest_offset: u64,
    written: u64,
    hasher: Sha256,
    final_path: PathBuf,
    part_path: PathBuf,
    resolved_path: Option<PathBuf>,
    needs_rehash: bool,
    expected_partial: Option<[u8; 32]>,
    overwrite: bool,
    state: WriterState,
}

impl FileWriter {
    pub fn new(
        root: &Path,
        relative: &str,
        size: u64,
        source_hash: [u8; 32],
        manifest_offset: u64,
        overwrite: bool,
    ) -> Self {
        let final_path = root.join(relative);
        let mut part_os = final_path.clone().into_os_string();
        part_os.push(".part");
        FileWriter {
            relative: relative.to_string(),
            size,
            source_hash,
            manifest_offset,
            written: 0,
            hasher: Sha256::new(),
            final_path,
            part_path: PathBuf::from(part_os),
            resolved_path: None,
            needs_rehash: false,
            expected_partial: None,
            overwrite,
            state: WriterState::Pending,
        }
    }

    pub fn relative(&self) -> &str {
        &self.relative
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn manifest_offset(&self) -> u64 {
        self.manifest_offset
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Final on-disk location, after any conflict suffixing. Only set once
    /// the writer completed.
    pub fn resolved_path(&self) -> Option<&Path> {
        self.resolved_path.as_deref()
    }

    /// Prepare the part file, resuming from `resume` when it is plausible.
    ///
    /// A part file whose size disagrees with the recorded byte count is
    /// discarded with a warning and the file restarts fresh. A resume offset
    /// equal to the declared size short-circuits: the part file's hash is
    /// verified and, on a match, the writer completes without touching the
    /// wire. Directory creation failures are non-recoverable.
    pub fn open(
        &mut self,
        resume: Option<PartialResume>,
        lock: &mut LockManager,
        sink: &WarningSink,
    ) -> Result<()> {
        if let Some(parent) = self.part_path.parent() {
            std::fs::create_dir_all(parent).map_err(TransferError::Filesystem)?;
        }

        let resume_bytes = resume.map(|r| r.resume_bytes).unwrap_or(0);
        if resume_bytes == 0 {
            self.begin_fresh(lock, sink);
            if self.size == 0 {
                // Zero-length entries never receive a data frame; an empty
                // part file gives completion something to rename.
                std::fs::File::create(&self.part_path).map_err(TransferError::Filesystem)?;
            }
            return Ok(());
        }

        let part_size = std::fs::metadata(&self.part_path).map(|m| m.len()).ok();
        if part_size != Some(resume_bytes.min(self.size)) {
            sink.warn(&format!(
                "part file for {} does not match recorded progress ({:?} vs {}); restarting",
                self.relative, part_size, resume_bytes
            ));
            self.begin_fresh(lock, sink);
            return Ok(());
        }

        if resume_bytes >= self.size {
            // Everything is already on disk; verify and finish.
            match self.part_hasher() {
                Ok(hasher) if <[u8; 32]>::from(hasher.clone().finalize()) == self.source_hash => {
                    let digest: [u8; 32] = hasher.finalize().into();
                    self.written = self.size;
                    self.complete_with_digest(digest, lock, sink);
                }
                _ => {
                    sink.warn(&format!(
                        "existing part file for {} failed verification; restarting",
                        self.relative
                    ));
                    self.begin_fresh(lock, sink);
                }
            }
            return Ok(());
        }

        self.written = resume_bytes;
        self.needs_rehash = true;
        self.expected_partial = resume.and_then(|r| r.partial_hash);
        self.state = WriterState::InProgress;
        lock.set_status(
            &self.relative,
            FileStatus::InProgress,
            self.written,
            self.expected_partial.map(|h| hex_string(&h)),
            sink,
        );
        Ok(())
    }

    /// Route a chunk addressed by its position within this file, skipping
    /// any prefix the writer already holds. Non-contiguous data (a gap past
    /// `written`) is dropped; the file then fails verification and is
    /// re-requested rather than aborting the session.
    pub fn feed(
        &mut self,
        file_pos: u64,
        data: &[u8],
        lock: &mut LockManager,
        sink: &WarningSink,
    ) -> Result<()> {
        if matches!(self.state, WriterState::Completed) {
            return Ok(());
        }
        let end = file_pos + data.len() as u64;
        if end <= self.written {
            return Ok(());
        }
        if file_pos > self.written {
            return Ok(());
        }
        let skip = (self.written - file_pos) as usize;
        self.write_chunk(&data[skip..], lock, sink)
    }

    /// Append one chunk: open, write, flush, close. Updates the running
    /// hash and lock progress; completes automatically at the declared size.
    /// Disk errors mark the file failed and the session continues.
    pub fn write_chunk(
        &mut self,
        data: &[u8],
        lock: &mut LockManager,
        sink: &WarningSink,
    ) -> Result<()> {
        if matches!(self.state, WriterState::Completed | WriterState::Failed(_)) {
            return Ok(());
        }

        let resuming = self.needs_rehash;
        let before = self.written;
        self.ensure_resume_hash(lock, sink);
        if resuming && self.written != before {
            // The rehash rejected the old prefix and the file restarted;
            // this chunk belongs at the old offset and is dropped. The file
            // fails verification this round and is re-requested whole.
            return Ok(());
        }

        let take = (self.size - self.written).min(data.len() as u64) as usize;
        if take == 0 {
            return Ok(());
        }
        let chunk = &data[..take];

        let write_result = (|| -> std::io::Result<()> {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.part_path)?;
            file.write_all(chunk)?;
            file.flush()?;
            Ok(())
        })();

        if let Err(err) = write_result {
            sink.warn(&format!(
                "failed to write to {}: {}",
                self.part_path.display(),
                err
            ));
            self.state = WriterState::Failed(WriterFailure::Filesystem);
            lock.set_status(&self.relative, FileStatus::Failed, self.written, None, sink);
            return Ok(());
        }

        if self.state == WriterState::Pending {
            self.state = WriterState::InProgress;
            lock.set_status(&self.relative, FileStatus::InProgress, self.written, None, sink);
        }

        self.hasher.update(chunk);
        self.written += take as u64;
        lock.record_progress(&self.relative, self.written, None, sink);

        if self.written == self.size {
            self.complete(lock, sink);
        }
        Ok(())
    }

    /// Verify the running hash and move the part file into place.
    ///
    /// On a hash mismatch the part file stays on disk and the writer is
    /// marked failed for the retry round.
    pub fn complete(&mut self, lock: &mut LockManager, sink: &WarningSink) {
        if matches!(self.state, WriterState::Completed) {
            return;
        }
        let digest: [u8; 32] = self.hasher.clone().finalize().into();
        if digest != self.source_hash {
            sink.warn(&format!(
                "integrity mismatch for {}: expected {}, got {}",
                self.relative,
                hex_string(&self.source_hash),
                hex_string(&digest)
            ));
            self.state = WriterState::Failed(WriterFailure::Integrity);
            lock.set_status(
                &self.relative,
                FileStatus::Failed,
                self.written,
                Some(hex_string(&digest)),
                sink,
            );
            return;
        }
        self.complete_with_digest(digest, lock, sink);
    }

    fn complete_with_digest(
        &mut self,
        digest: [u8; 32],
        lock: &mut LockManager,
        sink: &WarningSink,
    ) {
        match self.rename_into_place(sink) {
            Ok(resolved) => {
                self.resolved_path = Some(resolved);
                self.state = WriterState::Completed;
                self.written = self.size;
                lock.set_status(
                    &self.relative,
                    FileStatus::Completed,
                    self.size,
                    Some(hex_string(&digest)),
                    sink,
                );
            }
            Err(err) => {
                sink.warn(&format!(
                    "failed to finalize {}: {}",
                    self.relative, err
                ));
                self.state = WriterState::Failed(WriterFailure::Filesystem);
                lock.set_status(&self.relative, FileStatus::Failed, self.written, None, sink);
            }
        }
    }

    /// Deterministic conflict resolution given the directory state at the
    /// moment of completion.
    fn rename_into_place(&self, sink: &WarningSink) -> std::io::Result<PathBuf> {
        if self.overwrite {
            match std::fs::rename(&self.part_path, &self.final_path) {
                Ok(()) => return Ok(self.final_path.clone()),
                Err(err) => {
                    sink.warn(&format!(
                        "overwrite of {} failed ({}); falling back to suffixed name",
                        self.final_path.display(),
                        err
                    ));
                }
            }
        }
        let target = if self.final_path.exists() {
            first_free_slot(&self.final_path)
        } else {
            self.final_path.clone()
        };
        std::fs::rename(&self.part_path, &target)?;
        Ok(target)
    }

    /// Drop the part file and start over; the lock entry returns to pending.
    pub fn reset_for_retry(&mut self, lock: &mut LockManager, sink: &WarningSink) {
        if self.part_path.exists() {
            if let Err(err) = std::fs::remove_file(&self.part_path) {
                sink.warn(&format!(
                    "failed to remove part file {}: {}",
                    self.part_path.display(),
                    err
                ));
            }
        }
        self.hasher = Sha256::new();
        self.written = 0;
        self.needs_rehash = false;
        self.expected_partial = None;
        self.resolved_path = None;
        self.state = WriterState::Pending;
        lock.set_status(&self.relative, FileStatus::Pending, 0, None, sink);
    }

    /// Fold the pre-existing part bytes into the running hasher on the first
    /// write after a resume, verifying the recorded partial hash. A failed
    /// read or a hash mismatch restarts the file.
    fn ensure_resume_hash(&mut self, lock: &mut LockManager, sink: &WarningSink) {
        if !self.needs_rehash {
            return;
        }
        self.needs_rehash = false;

        match self.part_hasher() {
            Ok(hasher) => {
                let digest: [u8; 32] = hasher.clone().finalize().into();
                if let Some(expected) = self.expected_partial {
                    if digest != expected {
                        sink.warn(&format!(
                            "partial hash mismatch for {}; restarting",
                            self.relative
                        ));
                        self.begin_fresh(lock, sink);
                        return;
                    }
                }
                self.hasher = hasher;
                lock.record_progress(
                    &self.relative,
                    self.written,
                    Some(hex_string(&digest)),
                    sink,
                );
            }
            Err(err) => {
                sink.warn(&format!(
                    "could not re-read part file for {}: {}",
                    self.relative, err
                ));
                self.begin_fresh(lock, sink);
            }
        }
    }

    /// Stream the current part file through a fresh hasher.
    fn part_hasher(&self) -> std::io::Result<Sha256> {
        let mut file = std::fs::File::open(&self.part_path)?;
        let mut hasher = Sha256::new();
        let mut buffer = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
        Ok(hasher)
    }

    fn begin_fresh(&mut self, lock: &mut LockManager, sink: &WarningSink) {
        if self.part_path.exists() {
            if let Err(err) = std::fs::remove_file(&self.part_path) {
                sink.warn(&format!(
                    "failed to remove stale part file {}: {}",
                    self.part_path.display(),
                    err
                ));
            }
        }
        self.written = 0;
        self.hasher = Sha256::new();
        self.needs_rehash = false;
        self.expected_partial = None;
        self.state = WriterState::Pending;
        lock.set_status(&self.relative, FileStatus::Pending, 0, None, sink);
    }
}

fn first_free_slot(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = path.extension().map(|e| e.to_string_lossy().into_owned());
    let mut counter = 1u32;
    loop {
        let name = match &extension {
            Some(ext) => format!("{}_{}.{}", stem, counter, ext),
            None => format!("{}_{}", stem, counter),
        };
        let candidate = path.with_file_name(name);
        if !candidate.exists() {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::{Manifest, ManifestEntry, MANIFEST_VERSION};
    use uuid::Uuid;

    fn sha(data: &[u8]) -> [u8; 32] {
        Sha256::digest(data).into()
    }

    fn setup(
        dir: &Path,
        relative: &str,
        contents: &[u8],
    ) -> (LockManager, WarningSink, FileWriter) {
        let sink = WarningSink::new(dir);
        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            session_id: Uuid::new_v4(),
            compression: false,
            entries: vec![ManifestEntry {
                path: relative.to_string(),
                size: contents.len() as u64,
                hash_hex: hex_string(&sha(contents)),
            }],
        };
        let mut lock = LockManager::new(dir);
        lock.create("100.64.1.5", &manifest, &sink);
        let writer = FileWriter::new(dir, relative, contents.len() as u64, sha(contents), 0, false);
        (lock, sink, writer)
    }

    // ============================================================================
    // Fresh Write Tests
    // ============================================================================

    #[test]
    fn test_fresh_write_completes_and_renames() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"the quick brown fox";
        let (mut lock, sink, mut writer) = setup(dir.path(), "out/animal.txt", contents);

        writer.open(None, &mut lock, &sink).unwrap();
        writer.write_chunk(&contents[..10], &mut lock, &sink).unwrap();
        writer.write_chunk(&contents[10..], &mut lock, &sink).unwrap();

        assert_eq!(writer.state(), WriterState::Completed);
        let final_path = dir.path().join("out/animal.txt");
        assert_eq!(std::fs::read(&final_path).unwrap(), contents);
        assert!(!dir.path().join("out/animal.txt.part").exists());
        assert_eq!(writer.resolved_path(), Some(final_path.as_path()));
    }

    #[test]
    fn test_chunks_past_declared_size_are_clamped() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"12345";
        let (mut lock, sink, mut writer) = setup(dir.path(), "five.txt", contents);

        writer.open(None, &mut lock, &sink).unwrap();
        writer.write_chunk(b"12345EXTRA", &mut lock, &sink).unwrap();

        assert_eq!(writer.state(), WriterState::Completed);
        assert_eq!(std::fs::read(dir.path().join("five.txt")).unwrap(), contents);
    }

    #[test]
    fn test_hash_mismatch_marks_failed_and_keeps_part() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"expected contents";
        let (mut lock, sink, mut writer) = setup(dir.path(), "f.bin", contents);

        writer.open(None, &mut lock, &sink).unwrap();
        writer
            .write_chunk(b"corrupted contents", &mut lock, &sink)
            .unwrap();

        assert_eq!(writer.state(), WriterState::Failed(WriterFailure::Integrity));
        assert!(dir.path().join("f.bin.part").exists());
        assert!(!dir.path().join("f.bin").exists());
        assert_eq!(
            lock.document().unwrap().files["f.bin"].status,
            FileStatus::Failed
        );
    }

    // ============================================================================
    // Conflict Resolution Tests
    // ============================================================================

    #[test]
    fn test_conflict_probes_suffixed_names() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"new data";
        std::fs::write(dir.path().join("doc.txt"), b"old data").unwrap();
        std::fs::write(dir.path().join("doc_1.txt"), b"older data").unwrap();

        let (mut lock, sink, mut writer) = setup(dir.path(), "doc.txt", contents);
        writer.open(None, &mut lock, &sink).unwrap();
        writer.write_chunk(contents, &mut lock, &sink).unwrap();

        assert_eq!(writer.state(), WriterState::Completed);
        assert_eq!(std::fs::read(dir.path().join("doc.txt")).unwrap(), b"old data");
        assert_eq!(std::fs::read(dir.path().join("doc_2.txt")).unwrap(), contents);
        assert_eq!(
            writer.resolved_path(),
            Some(dir.path().join("doc_2.txt").as_path())
        );
    }

    #[test]
    fn test_overwrite_mode_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"new data";
        std::fs::write(dir.path().join("doc.txt"), b"old data").unwrap();

        let sink = WarningSink::new(dir.path());
        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            session_id: Uuid::new_v4(),
            compression: false,
            entries: vec![ManifestEntry {
                path: "doc.txt".to_string(),
                size: contents.len() as u64,
                hash_hex: hex_string(&sha(contents)),
            }],
        };
        let mut lock = LockManager::new(dir.path());
        lock.create("100.64.1.5", &manifest, &sink);

        let mut writer =
            FileWriter::new(dir.path(), "doc.txt", contents.len() as u64, sha(contents), 0, true);
        writer.open(None, &mut lock, &sink).unwrap();
        writer.write_chunk(contents, &mut lock, &sink).unwrap();

        assert_eq!(writer.state(), WriterState::Completed);
        assert_eq!(std::fs::read(dir.path().join("doc.txt")).unwrap(), contents);
        assert!(!dir.path().join("doc_1.txt").exists());
    }

    // ============================================================================
    // Resume Tests
    // ============================================================================

    #[test]
    fn test_resume_rehashes_existing_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"0123456789abcdef";
        let (mut lock, sink, mut writer) = setup(dir.path(), "r.bin", contents);

        // Simulate an interrupted session: first 8 bytes already on disk.
        std::fs::write(dir.path().join("r.bin.part"), &contents[..8]).unwrap();
        let resume = PartialResume {
            resume_bytes: 8,
            partial_hash: Some(sha(&contents[..8])),
        };

        writer.open(Some(resume), &mut lock, &sink).unwrap();
        assert_eq!(writer.written(), 8);

        writer.write_chunk(&contents[8..], &mut lock, &sink).unwrap();
        assert_eq!(writer.state(), WriterState::Completed);
        assert_eq!(std::fs::read(dir.path().join("r.bin")).unwrap(), contents);
    }

    #[test]
    fn test_resume_with_wrong_partial_hash_restarts() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"0123456789abcdef";
        let (mut lock, sink, mut writer) = setup(dir.path(), "r.bin", contents);

        std::fs::write(dir.path().join("r.bin.part"), b"XXXXXXXX").unwrap();
        let resume = PartialResume {
            resume_bytes: 8,
            partial_hash: Some(sha(&contents[..8])),
        };

        writer.open(Some(resume), &mut lock, &sink).unwrap();
        writer.write_chunk(&contents[8..], &mut lock, &sink).unwrap();

        // The poisoned prefix was discarded along with this now
        // non-contiguous chunk; the file restarts and cannot complete this
        // round.
        assert_ne!(writer.state(), WriterState::Completed);
        assert_eq!(writer.written(), 0);
        assert!(!dir.path().join("r.bin.part").exists());
    }

    #[test]
    fn test_resume_size_mismatch_restarts_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"0123456789abcdef";
        let (mut lock, sink, mut writer) = setup(dir.path(), "r.bin", contents);

        std::fs::write(dir.path().join("r.bin.part"), &contents[..5]).unwrap();
        let resume = PartialResume {
            resume_bytes: 8,
            partial_hash: None,
        };

        writer.open(Some(resume), &mut lock, &sink).unwrap();
        assert_eq!(writer.written(), 0);
        assert!(!dir.path().join("r.bin.part").exists());

        writer.write_chunk(contents, &mut lock, &sink).unwrap();
        assert_eq!(writer.state(), WriterState::Completed);
    }

    // ============================================================================
    // Feed Routing Tests
    // ============================================================================

    #[test]
    fn test_feed_skips_already_held_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"0123456789abcdef";
        let (mut lock, sink, mut writer) = setup(dir.path(), "r.bin", contents);

        std::fs::write(dir.path().join("r.bin.part"), &contents[..8]).unwrap();
        let resume = PartialResume {
            resume_bytes: 8,
            partial_hash: Some(sha(&contents[..8])),
        };
        writer.open(Some(resume), &mut lock, &sink).unwrap();

        // The sender streams the whole file; the first chunk straddles the
        // resume point and must be sliced.
        writer.feed(0, &contents[..12], &mut lock, &sink).unwrap();
        assert_eq!(writer.written(), 12);
        writer.feed(12, &contents[12..], &mut lock, &sink).unwrap();
        assert_eq!(writer.state(), WriterState::Completed);
        assert_eq!(std::fs::read(dir.path().join("r.bin")).unwrap(), contents);
    }

    #[test]
    fn test_feed_drops_non_contiguous_data() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"0123456789";
        let (mut lock, sink, mut writer) = setup(dir.path(), "g.bin", contents);

        writer.open(None, &mut lock, &sink).unwrap();
        writer.feed(5, &contents[5..], &mut lock, &sink).unwrap();
        assert_eq!(writer.written(), 0);
    }

    // ============================================================================
    // Retry Reset Tests
    // ============================================================================

    #[test]
    fn test_reset_for_retry_then_clean_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let contents = b"expected contents";
        let (mut lock, sink, mut writer) = setup(dir.path(), "f.bin", contents);

        writer.open(None, &mut lock, &sink).unwrap();
        writer
            .write_chunk(b"corrupted contents", &mut lock, &sink)
            .unwrap();
        assert_eq!(writer.state(), WriterState::Failed(WriterFailure::Integrity));

        writer.reset_for_retry(&mut lock, &sink);
        assert_eq!(writer.written(), 0);
        assert!(!dir.path().join("f.bin.part").exists());
        assert_eq!(
            lock.document().unwrap().files["f.bin"].status,
            FileStatus::Pending
        );

        writer.write_chunk(contents, &mut lock, &sink).unwrap();
        assert_eq!(writer.state(), WriterState::Completed);
        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), contents);
    }

    // ============================================================================
    // Descriptor Discipline Tests
    // ============================================================================

    #[test]
    #[cfg(target_os = "linux")]
    fn test_no_descriptor_held_between_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let contents = vec![0xCDu8; 4096];
        let (mut lock, sink, mut writer) = setup(dir.path(), "fd.bin", &contents);
        writer.open(None, &mut lock, &sink).unwrap();

        let before = crate::monitor::open_descriptor_count().unwrap();
        for chunk in contents.chunks(256).take(8) {
            writer.write_chunk(chunk, &mut lock, &sink).unwrap();
            let during = crate::monitor::open_descriptor_count().unwrap();
            assert!(during <= before + 1);
        }
    }
}
