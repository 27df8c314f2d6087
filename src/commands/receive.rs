use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::cryptography::{parse_hex32, CryptoContext};
use crate::enumerate::validate_relative_path;
use crate::error::{Result, TransferError};
use crate::framing::{
    Direction, Frame, FrameCodec, Manifest, ACK_FAILED, ACK_OK, MANIFEST_VERSION,
};
use crate::lock::{LockManager, ResumePlan};
use crate::monitor;
use crate::overlay;
use crate::token;
use crate::warnings::WarningSink;
use crate::writer::{FileWriter, WriterFailure, WriterState};
use crate::{
    CONNECT_TIMEOUT, DATA_READ_TIMEOUT, KEY_SIZE, MANIFEST_READ_TIMEOUT, MAX_RETRY_ATTEMPTS,
};

/// Receiver-side session parameters. `overwrite` and `resume` are the policy
/// flags the CLI passes in place of interactive prompts; resume defaults to
/// continuing from a valid lock.
pub struct ReceiveConfig {
    pub connection: String,
    /// Require the sender to be 127.0.0.1 (containerized overlays).
    pub pod: bool,
    /// Replace conflicting targets instead of probing suffixed names.
    pub overwrite: bool,
    pub resume: bool,
    pub port: u16,
    /// Directory files, the lock document, and the warning log land in.
    pub target_dir: PathBuf,
}

/// A manifest entry's slice of the unified stream, as routed on the
/// receiver. Completed slices are decrypted and discarded without a writer.
struct StreamSlot {
    offset: u64,
    size: u64,
    completed: bool,
    writer_index: Option<usize>,
}

/// Run one receiving session end to end.
pub async fn run(config: ReceiveConfig) -> Result<()> {
    std::fs::create_dir_all(&config.target_dir).map_err(TransferError::Filesystem)?;
    let sink = WarningSink::new(&config.target_dir);

    let (ip, session_token) = parse_connection_string(&config.connection)?;

    if config.pod {
        if ip != Ipv4Addr::LOCALHOST {
            return Err(TransferError::Authentication(format!(
                "pod mode accepts only 127.0.0.1, got {}",
                ip
            )));
        }
        debug!("pod mode: connecting to localhost");
    } else {
        let (authenticated, hostname) = overlay::verify_peer(ip).await;
        if !authenticated {
            return Err(TransferError::Authentication(format!(
                "{} is not an authenticated overlay peer",
                ip
            )));
        }
        info!("peer verified: {} ({})", ip, hostname);
    }

    println!("Connecting to sender...");
    let stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((ip, config.port)))
        .await
        .map_err(|_| TransferError::Network("connect timed out".to_string()))?
        .map_err(TransferError::network)?;
    stream.set_nodelay(true).map_err(TransferError::network)?;
    let (mut read_half, mut write_half) = stream.into_split();

    // Key exchange: the sender's raw public key arrives first.
    let mut crypto = CryptoContext::new();
    let mut peer_public = [0u8; KEY_SIZE];
    read_half
        .read_exact(&mut peer_public)
        .await
        .map_err(TransferError::network)?;
    write_half
        .write_all(&crypto.public_bytes())
        .await
        .map_err(TransferError::network)?;
    crypto.derive_session(&peer_public, &session_token)?;
    debug!("session key derived");

    let mut codec = FrameCodec::new(crypto, Direction::ReceiverToSender);

    let manifest = match timeout(MANIFEST_READ_TIMEOUT, codec.recv(&mut read_half))
        .await
        .map_err(|_| TransferError::Network("timed out waiting for manifest".to_string()))??
    {
        Frame::Manifest(manifest) => manifest,
        _ => {
            return Err(TransferError::Protocol(
                "expected a manifest frame after the handshake".to_string(),
            ));
        }
    };
    validate_manifest(&manifest)?;
    codec.set_compression(manifest.compression);
    info!(
        "manifest: {} files, {} bytes, compression {}",
        manifest.entries.len(),
        manifest.total_size(),
        manifest.compression
    );

    monitor::check_descriptor_headroom(manifest.entries.len(), &sink);

    // Resume planning against the durable lock state.
    let mut lock = LockManager::new(&config.target_dir);
    let plan = if config.resume && lock.load_existing(&sink) {
        let plan = lock.classify(&manifest, &sink);
        info!(
            "resume plan: {} completed, {} partial, {} fresh",
            plan.completed.len(),
            plan.partial.len(),
            plan.fresh.len()
        );
        lock.reconcile(&ip.to_string(), &manifest, &plan, &sink);
        plan
    } else {
        lock.create(&ip.to_string(), &manifest, &sink);
        ResumePlan::default()
    };

    // One writer per non-completed entry; completed slices are dropped.
    let mut writers: Vec<FileWriter> = Vec::new();
    let mut slots: Vec<StreamSlot> = Vec::new();
    for (offset, entry) in manifest.entries_with_offsets() {
        if plan.completed.contains(&entry.path) {
            slots.push(StreamSlot {
                offset,
                size: entry.size,
                completed: true,
                writer_index: None,
            });
            continue;
        }
        // Hash shape was validated with the manifest.
        let source_hash = parse_hex32(&entry.hash_hex)
            .ok_or_else(|| TransferError::Protocol("malformed manifest hash".to_string()))?;
        let mut writer = FileWriter::new(
            &config.target_dir,
            &entry.path,
            entry.size,
            source_hash,
            offset,
            config.overwrite,
        );
        writer.open(plan.partial.get(&entry.path).copied(), &mut lock, &sink)?;
        slots.push(StreamSlot {
            offset,
            size: entry.size,
            completed: false,
            writer_index: Some(writers.len()),
        });
        writers.push(writer);
    }

    let outcome = drive_transfer(
        &mut codec,
        &mut read_half,
        &mut write_half,
        &manifest,
        &slots,
        &mut writers,
        &mut lock,
        &sink,
    )
    .await;

    // Teardown always flushes buffered progress, success or not.
    match outcome {
        Ok(()) => {
            let failed: Vec<String> = writers
                .iter()
                .filter(|w| w.state() != WriterState::Completed)
                .map(|w| w.relative().to_string())
                .collect();
            if failed.is_empty() {
                codec.send(&mut write_half, &Frame::Ack(ACK_OK)).await?;
                lock.cleanup_on_success(&sink);
                println!("Transfer complete!");
                Ok(())
            } else {
                let _ = codec.send(&mut write_half, &Frame::Ack(ACK_FAILED)).await;
                lock.flush(&sink);
                sink.warn(&format!(
                    "transfer finished with {} unrecovered file(s)",
                    failed.len()
                ));
                Err(TransferError::Integrity { files: failed })
            }
        }
        Err(err) => {
            // Session-level failure: the lock survives for a future resume.
            lock.flush(&sink);
            sink.warn(&format!("session aborted: {}", err));
            Err(err)
        }
    }
}

/// The write loop plus up to three selective retry rounds. Only integrity
/// failures are retried; filesystem failures keep their lock state for a
/// later session.
#[allow(clippy::too_many_arguments)]
async fn drive_transfer(
    codec: &mut FrameCodec,
    read_half: &mut OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
    manifest: &Manifest,
    slots: &[StreamSlot],
    writers: &mut [FileWriter],
    lock: &mut LockManager,
    sink: &WarningSink,
) -> Result<()> {
    let total_size = manifest.total_size();
    let bar = ProgressBar::new(total_size);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
            .unwrap(),
    );

    let mut round = 0u32;
    loop {
        receive_stream(
            codec, read_half, slots, writers, lock, sink, total_size,
            if round == 0 { Some(&bar) } else { None },
        )
        .await?;
        if round == 0 {
            bar.finish_with_message("Stream received");
        }

        // Files that never finished are integrity failures for this round.
        for writer in writers.iter_mut() {
            if matches!(writer.state(), WriterState::Pending | WriterState::InProgress) {
                writer.complete(lock, sink);
            }
        }

        let retryable: Vec<String> = writers
            .iter()
            .filter(|w| w.state() == WriterState::Failed(WriterFailure::Integrity))
            .map(|w| w.relative().to_string())
            .collect();
        if retryable.is_empty() {
            return Ok(());
        }
        if round >= MAX_RETRY_ATTEMPTS {
            sink.warn(&format!(
                "{} file(s) still failing after {} retries",
                retryable.len(),
                MAX_RETRY_ATTEMPTS
            ));
            return Ok(());
        }

        round += 1;
        info!("retry round {}: requesting {} files", round, retryable.len());
        for writer in writers.iter_mut() {
            if writer.state() == WriterState::Failed(WriterFailure::Integrity) {
                writer.reset_for_retry(lock, sink);
            }
        }
        codec
            .send(write_half, &Frame::RetryRequest(retryable))
            .await?;
    }
}

/// Read frames until end-of-stream, routing each data frame to the slot
/// whose byte range contains it. Completed ranges are discarded; ranges
/// outside the manifest are protocol violations.
#[allow(clippy::too_many_arguments)]
async fn receive_stream(
    codec: &mut FrameCodec,
    read_half: &mut OwnedReadHalf,
    slots: &[StreamSlot],
    writers: &mut [FileWriter],
    lock: &mut LockManager,
    sink: &WarningSink,
    total_size: u64,
    bar: Option<&ProgressBar>,
) -> Result<()> {
    loop {
        let frame = timeout(DATA_READ_TIMEOUT, codec.recv(read_half))
            .await
            .map_err(|_| TransferError::Network("data stream idle timeout".to_string()))??;
        match frame {
            Frame::EndOfStream => return Ok(()),
            Frame::FileData { offset, data } => {
                let end = offset + data.len() as u64;
                if end > total_size {
                    return Err(TransferError::Protocol(format!(
                        "data frame [{}, {}) beyond stream end {}",
                        offset, end, total_size
                    )));
                }
                let slot = locate_slot(slots, offset).ok_or_else(|| {
                    TransferError::Protocol(format!("data frame at offset {} maps to no file", offset))
                })?;
                if end > slot.offset + slot.size {
                    return Err(TransferError::Protocol(format!(
                        "data frame [{}, {}) crosses a file boundary",
                        offset, end
                    )));
                }
                if let Some(index) = slot.writer_index {
                    writers[index].feed(offset - slot.offset, &data, lock, sink)?;
                } else {
                    debug!(
                        "discarding {} bytes for a completed range at offset {}",
                        data.len(),
                        offset
                    );
                }
                if let Some(bar) = bar {
                    bar.inc(data.len() as u64);
                }
            }
            _ => {
                return Err(TransferError::Protocol(
                    "unexpected frame in the data stream".to_string(),
                ));
            }
        }
    }
}

fn locate_slot(slots: &[StreamSlot], offset: u64) -> Option<&StreamSlot> {
    // Slots are ordered by offset; find the first whose range ends past the
    // target and check containment (zero-length entries never match).
    let index = slots.partition_point(|s| s.offset + s.size <= offset);
    let slot = slots.get(index)?;
    (slot.offset <= offset).then_some(slot)
}

/// Split and validate `ip:word-word`.
pub fn parse_connection_string(connection: &str) -> Result<(Ipv4Addr, String)> {
    let (ip_part, token_part) = connection.split_once(':').ok_or_else(|| {
        TransferError::Protocol(format!(
            "invalid connection string {:?}; expected ip:token",
            connection
        ))
    })?;
    let ip: Ipv4Addr = ip_part.parse().map_err(|_| {
        TransferError::Protocol(format!("invalid IPv4 address {:?}", ip_part))
    })?;
    if !token::is_valid_token(token_part) {
        return Err(TransferError::Protocol(format!(
            "invalid token {:?}; expected word-word",
            token_part
        )));
    }
    Ok((ip, token_part.to_string()))
}

/// Manifest admission control: version, path safety, uniqueness, and hash
/// shape, all checked before anything touches disk.
fn validate_manifest(manifest: &Manifest) -> Result<()> {
    if manifest.version != MANIFEST_VERSION {
        return Err(TransferError::Protocol(format!(
            "unsupported manifest version {:?}",
            manifest.version
        )));
    }
    let mut seen = HashSet::new();
    for entry in &manifest.entries {
        let normalized = validate_relative_path(&entry.path)?;
        if normalized != entry.path {
            return Err(TransferError::PathUnsafe(entry.path.clone()));
        }
        if !seen.insert(entry.path.as_str()) {
            return Err(TransferError::Protocol(format!(
                "duplicate manifest path {:?}",
                entry.path
            )));
        }
        if parse_hex32(&entry.hash_hex).is_none() {
            return Err(TransferError::Protocol(format!(
                "malformed hash for {:?}",
                entry.path
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framing::ManifestEntry;
    use uuid::Uuid;

    #[test]
    fn test_parse_connection_string_valid() {
        let (ip, token) = parse_connection_string("100.64.1.123:ocean-tiger").unwrap();
        assert_eq!(ip, Ipv4Addr::new(100, 64, 1, 123));
        assert_eq!(token, "ocean-tiger");
    }

    #[test]
    fn test_parse_connection_string_invalid() {
        assert!(parse_connection_string("100.64.1.123").is_err());
        assert!(parse_connection_string("not-an-ip:ocean-tiger").is_err());
        assert!(parse_connection_string("100.64.1.123:single").is_err());
        assert!(parse_connection_string("100.64.1.123:Upper-case").is_err());
        assert!(parse_connection_string("999.0.0.1:ocean-tiger").is_err());
    }

    fn manifest_with_paths(paths: &[&str]) -> Manifest {
        Manifest {
            version: MANIFEST_VERSION.to_string(),
            session_id: Uuid::new_v4(),
            compression: false,
            entries: paths
                .iter()
                .map(|p| ManifestEntry {
                    path: p.to_string(),
                    size: 1,
                    hash_hex: "0".repeat(64),
                })
                .collect(),
        }
    }

    #[test]
    fn test_validate_manifest_rejects_traversal() {
        for bad in ["../../evil", "/etc/passwd", "C:\\windows\\cmd.exe", "a/../b"] {
            let manifest = manifest_with_paths(&[bad]);
            assert!(
                matches!(validate_manifest(&manifest), Err(TransferError::PathUnsafe(_))),
                "{} should be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_validate_manifest_rejects_duplicates_and_bad_hashes() {
        let manifest = manifest_with_paths(&["a", "a"]);
        assert!(matches!(
            validate_manifest(&manifest),
            Err(TransferError::Protocol(_))
        ));

        let mut manifest = manifest_with_paths(&["a"]);
        manifest.entries[0].hash_hex = "zz".repeat(32);
        assert!(matches!(
            validate_manifest(&manifest),
            Err(TransferError::Protocol(_))
        ));
    }

    #[test]
    fn test_validate_manifest_accepts_clean_tree() {
        let manifest = manifest_with_paths(&["a/b.txt", "a/c.txt", "top.bin"]);
        assert!(validate_manifest(&manifest).is_ok());
    }

    #[test]
    fn test_locate_slot_by_offset() {
        let slots = vec![
            StreamSlot { offset: 0, size: 10, completed: false, writer_index: Some(0) },
            StreamSlot { offset: 10, size: 0, completed: false, writer_index: Some(1) },
            StreamSlot { offset: 10, size: 5, completed: true, writer_index: None },
        ];
        assert_eq!(locate_slot(&slots, 0).unwrap().offset, 0);
        assert_eq!(locate_slot(&slots, 9).unwrap().offset, 0);
        let at_ten = locate_slot(&slots, 10).unwrap();
        assert!(at_ten.completed);
        assert_eq!(locate_slot(&slots, 14).unwrap().offset, 10);
        assert!(locate_slot(&slots, 15).is_none());
    }
}
