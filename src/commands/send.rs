use std::io::Read;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;

use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::time::timeout;
use uuid::Uuid;

use crate::cryptography::{hex_string, CryptoContext};
use crate::enumerate::{self, SourceFile, DEFAULT_EXCLUDES};
use crate::error::{Result, TransferError};
use crate::framing::{
    Direction, Frame, FrameCodec, Manifest, ManifestEntry, ACK_OK, MANIFEST_VERSION,
};
use crate::monitor;
use crate::overlay;
use crate::token;
use crate::warnings::WarningSink;
use crate::{ACCEPT_TIMEOUT, DATA_CHUNK_SIZE, KEY_SIZE, MAX_RETRY_ATTEMPTS, RETRY_READ_TIMEOUT};

/// Sender-side session parameters. The CLI fills this from flags; tests may
/// pin `port` and `token` instead of the defaults.
pub struct SendConfig {
    pub paths: Vec<PathBuf>,
    /// Bind and accept on 127.0.0.1 only (containerized overlays).
    pub pod: bool,
    pub compress: bool,
    pub excludes: Vec<String>,
    /// Apply the built-in venv/cache exclusion list.
    pub skip_cache_dirs: bool,
    pub port: u16,
    /// Fixed session token; generated when absent.
    pub token: Option<String>,
}

/// Run one sending session: listen, accept a single verified peer, stream
/// the manifest and every file, then service retry requests until the
/// receiver acknowledges.
pub async fn run(config: SendConfig) -> Result<()> {
    let cwd = std::env::current_dir().map_err(TransferError::Filesystem)?;
    let sink = WarningSink::new(&cwd);

    let mut excludes = config.excludes.clone();
    if config.skip_cache_dirs {
        excludes.extend(DEFAULT_EXCLUDES.iter().map(|s| s.to_string()));
    }

    let sources = enumerate::collect(&config.paths, &excludes, &sink)?;
    if sources.is_empty() {
        return Err(TransferError::Protocol(
            "nothing to transfer after exclusions".to_string(),
        ));
    }
    let total_size: u64 = sources.iter().map(|s| s.size).sum();
    debug!("enumerated {} files, {} bytes", sources.len(), total_size);

    monitor::check_descriptor_headroom(sources.len(), &sink);

    let announce_ip = if config.pod {
        Ipv4Addr::LOCALHOST
    } else {
        overlay::local_endpoint().await.ok_or_else(|| {
            TransferError::Network("overlay local endpoint unavailable".to_string())
        })?
    };
    let bind_ip = if config.pod {
        Ipv4Addr::LOCALHOST
    } else {
        Ipv4Addr::UNSPECIFIED
    };

    let listener = TcpListener::bind((bind_ip, config.port))
        .await
        .map_err(TransferError::network)?;
    let session_token = config.token.clone().unwrap_or_else(token::generate_token);

    println!(
        "type into receiver: ferry receive \x1b[1m{}:{}\x1b[0m",
        announce_ip, session_token
    );
    println!("Waiting for receiver to connect...");

    let (stream, peer_addr) = timeout(ACCEPT_TIMEOUT, listener.accept())
        .await
        .map_err(|_| TransferError::Network("timed out waiting for a receiver".to_string()))?
        .map_err(TransferError::network)?;
    stream.set_nodelay(true).map_err(TransferError::network)?;

    let peer_ip = match peer_addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(ip) => {
            return Err(TransferError::Authentication(format!(
                "rejected non-IPv4 peer {}",
                ip
            )));
        }
    };
    if config.pod {
        if peer_ip != Ipv4Addr::LOCALHOST {
            return Err(TransferError::Authentication(format!(
                "pod mode accepts only 127.0.0.1, got {}",
                peer_ip
            )));
        }
        debug!("pod mode: accepting localhost connection");
    } else {
        let (authenticated, hostname) = overlay::verify_peer(peer_ip).await;
        if !authenticated {
            return Err(TransferError::Authentication(format!(
                "{} is not an authenticated overlay peer",
                peer_ip
            )));
        }
        info!("peer verified: {} ({})", peer_ip, hostname);
    }

    // Key exchange: the sender writes its raw public key first.
    let (mut read_half, mut write_half) = stream.into_split();
    let mut crypto = CryptoContext::new();
    write_half
        .write_all(&crypto.public_bytes())
        .await
        .map_err(TransferError::network)?;
    let mut peer_public = [0u8; KEY_SIZE];
    read_half
        .read_exact(&mut peer_public)
        .await
        .map_err(TransferError::network)?;
    crypto.derive_session(&peer_public, &session_token)?;
    debug!("session key derived");

    let mut codec = FrameCodec::new(crypto, Direction::SenderToReceiver);
    codec.set_compression(config.compress);

    let manifest = Manifest {
        version: MANIFEST_VERSION.to_string(),
        session_id: Uuid::new_v4(),
        compression: config.compress,
        entries: sources.iter().map(wire_entry).collect(),
    };
    codec
        .send(&mut write_half, &Frame::Manifest(manifest))
        .await?;

    let bar = ProgressBar::new(total_size);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta}) {msg}")
            .unwrap(),
    );
    for source in &sources {
        stream_file(&mut codec, &mut write_half, source, &sink, Some(&bar)).await?;
    }
    codec.send(&mut write_half, &Frame::EndOfStream).await?;
    bar.finish_with_message("Streaming complete");

    run_retry_service(&mut codec, &mut read_half, &mut write_half, &sources, &sink).await?;

    debug!("session closed");
    Ok(())
}

/// After the first end-of-stream, the receiver drives: either an `Ack`
/// verdict or up to three selective retry requests, each answered by
/// re-streaming the named files at their manifest offsets.
async fn run_retry_service(
    codec: &mut FrameCodec,
    read_half: &mut OwnedReadHalf,
    write_half: &mut OwnedWriteHalf,
    sources: &[SourceFile],
    sink: &WarningSink,
) -> Result<()> {
    let mut rounds = 0u32;
    loop {
        let frame = timeout(RETRY_READ_TIMEOUT, codec.recv(read_half))
            .await
            .map_err(|_| {
                TransferError::Network("timed out waiting for receiver verdict".to_string())
            })??;
        match frame {
            Frame::Ack(status) => {
                if status == ACK_OK {
                    println!("Transfer complete!");
                } else {
                    sink.warn("receiver reported unrecovered files after retries");
                    println!("Transfer finished with receiver-side failures");
                }
                return Ok(());
            }
            Frame::RetryRequest(paths) => {
                rounds += 1;
                if rounds > MAX_RETRY_ATTEMPTS {
                    return Err(TransferError::Protocol(
                        "receiver exceeded the retry budget".to_string(),
                    ));
                }
                info!("retry round {}: re-streaming {} files", rounds, paths.len());
                for path in &paths {
                    match sources.iter().find(|s| &s.relative == path) {
                        Some(source) => {
                            stream_file(codec, write_half, source, sink, None).await?;
                        }
                        None => {
                            sink.warn(&format!("retry requested for unknown path {}", path));
                        }
                    }
                }
                codec.send(write_half, &Frame::EndOfStream).await?;
            }
            other => {
                return Err(TransferError::Protocol(format!(
                    "unexpected frame in retry loop: {:?}",
                    frame_name(&other)
                )));
            }
        }
    }
}

/// Single-pass read, hash, frame, send for one file. Frames carry absolute
/// stream offsets and never span two files; reads are clamped at the
/// enumerated size so a growing source cannot shift later offsets.
async fn stream_file(
    codec: &mut FrameCodec,
    write_half: &mut OwnedWriteHalf,
    source: &SourceFile,
    sink: &WarningSink,
    bar: Option<&ProgressBar>,
) -> Result<()> {
    let mut file = std::fs::File::open(&source.absolute).map_err(TransferError::Filesystem)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; DATA_CHUNK_SIZE];
    let mut sent = 0u64;

    while sent < source.size {
        let want = buffer.len().min((source.size - sent) as usize);
        let n = file
            .read(&mut buffer[..want])
            .map_err(TransferError::Filesystem)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        codec
            .send(
                write_half,
                &Frame::FileData {
                    offset: source.offset + sent,
                    data: buffer[..n].to_vec(),
                },
            )
            .await?;
        sent += n as u64;
        if let Some(bar) = bar {
            bar.inc(n as u64);
        }
    }

    if sent != source.size {
        sink.warn(&format!(
            "{} shrank during streaming ({} of {} bytes sent); receiver will retry",
            source.relative, sent, source.size
        ));
    }
    let digest: [u8; 32] = hasher.finalize().into();
    if digest != source.hash {
        sink.warn(&format!(
            "{} changed since enumeration (hash {} != {}); receiver will request a retry",
            source.relative,
            hex_string(&digest),
            hex_string(&source.hash)
        ));
    }
    Ok(())
}

fn wire_entry(source: &SourceFile) -> ManifestEntry {
    ManifestEntry {
        path: source.relative.clone(),
        size: source.size,
        hash_hex: hex_string(&source.hash),
    }
}

fn frame_name(frame: &Frame) -> &'static str {
    match frame {
        Frame::Manifest(_) => "manifest",
        Frame::FileData { .. } => "file-data",
        Frame::RetryRequest(_) => "retry-request",
        Frame::EndOfStream => "end-of-stream",
        Frame::Ack(_) => "ack",
    }
}
