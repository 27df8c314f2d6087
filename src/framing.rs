use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

use crate::cryptography::CryptoContext;
use crate::error::{Result, TransferError};
use crate::{MAX_DATA_PAYLOAD, MAX_MANIFEST_PAYLOAD, NONCE_SIZE, TAG_SIZE};

pub const TAG_MANIFEST: u8 = 0x01;
pub const TAG_FILE_DATA: u8 = 0x02;
pub const TAG_RETRY_REQUEST: u8 = 0x03;
pub const TAG_END_OF_STREAM: u8 = 0x04;
pub const TAG_ACK: u8 = 0x05;

pub const ACK_OK: u8 = 1;
pub const ACK_FAILED: u8 = 0;

/// Wire manifest version understood by this implementation.
pub const MANIFEST_VERSION: &str = "1";

/// zstd level for the block-compression hook; tuned for speed over ratio.
const COMPRESSION_LEVEL: i32 = 1;

/// One file announced in the manifest. `offset_in_stream` is not carried on
/// the wire; both sides compute it as the cumulative size of the preceding
/// entries in listed order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: String,
    pub size: u64,
    pub hash_hex: String,
}

/// Batch metadata exchanged once per session, as canonical UTF-8 JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub session_id: Uuid,
    pub compression: bool,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.size).sum()
    }

    /// Entries paired with their cumulative stream offsets.
    pub fn entries_with_offsets(&self) -> Vec<(u64, &ManifestEntry)> {
        let mut offset = 0u64;
        let mut out = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            out.push((offset, entry));
            offset += entry.size;
        }
        out
    }
}

/// Which way frames flow. Each direction has an independent nonce counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    SenderToReceiver,
    ReceiverToSender,
}

impl Direction {
    fn wire(self) -> u32 {
        match self {
            Direction::SenderToReceiver => 0,
            Direction::ReceiverToSender => 1,
        }
    }

    fn opposite(self) -> Direction {
        match self {
            Direction::SenderToReceiver => Direction::ReceiverToSender,
            Direction::ReceiverToSender => Direction::SenderToReceiver,
        }
    }
}

/// A decoded frame payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Manifest(Manifest),
    FileData { offset: u64, data: Vec<u8> },
    RetryRequest(Vec<String>),
    EndOfStream,
    Ack(u8),
}

/// Encrypting frame codec over any byte stream.
///
/// Wire layout per frame: `u32 BE ciphertext length | 12-byte nonce |
/// ciphertext || tag`. Nonces are `u32_be(direction) || u64_be(counter)`
/// with the counter starting at zero at session-key derivation, which makes
/// every nonce under a session key unique and lets the receiving side
/// recompute the expected nonce and reject out-of-sequence frames before
/// touching the cipher.
pub struct FrameCodec {
    crypto: CryptoContext,
    send_direction: Direction,
    send_counter: u64,
    recv_counter: u64,
    compression: bool,
}

impl FrameCodec {
    /// Wrap an established crypto context. `send_direction` is the direction
    /// of frames this side emits.
    pub fn new(crypto: CryptoContext, send_direction: Direction) -> Self {
        FrameCodec {
            crypto,
            send_direction,
            send_counter: 0,
            recv_counter: 0,
            compression: false,
        }
    }

    /// Enable or disable the block-compression hook for `FileData` payloads.
    /// Negotiated once in the manifest; never per-frame.
    pub fn set_compression(&mut self, on: bool) {
        self.compression = on;
    }

    pub fn compression(&self) -> bool {
        self.compression
    }

    pub fn build_nonce(direction: u32, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..4].copy_from_slice(&direction.to_be_bytes());
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    pub async fn send<W: AsyncWrite + Unpin>(&mut self, writer: &mut W, frame: &Frame) -> Result<()> {
        let plaintext = self.encode_payload(frame)?;
        let nonce = Self::build_nonce(self.send_direction.wire(), self.send_counter);
        let ciphertext = self.crypto.encrypt(&nonce, &plaintext)?;

        writer
            .write_u32(ciphertext.len() as u32)
            .await
            .map_err(TransferError::network)?;
        writer.write_all(&nonce).await.map_err(TransferError::network)?;
        writer
            .write_all(&ciphertext)
            .await
            .map_err(TransferError::network)?;
        writer.flush().await.map_err(TransferError::network)?;

        self.send_counter += 1;
        Ok(())
    }

    pub async fn recv<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> Result<Frame> {
        let ciphertext_len = reader
            .read_u32()
            .await
            .map_err(TransferError::network)? as usize;
        if ciphertext_len < TAG_SIZE {
            return Err(TransferError::Protocol(format!(
                "frame ciphertext length {} below AEAD tag size",
                ciphertext_len
            )));
        }
        if ciphertext_len > MAX_MANIFEST_PAYLOAD + 1 + TAG_SIZE {
            return Err(TransferError::Protocol(format!(
                "frame ciphertext length {} exceeds cap",
                ciphertext_len
            )));
        }

        let mut nonce = [0u8; NONCE_SIZE];
        reader
            .read_exact(&mut nonce)
            .await
            .map_err(TransferError::network)?;
        let expected = Self::build_nonce(self.send_direction.opposite().wire(), self.recv_counter);
        if nonce != expected {
            return Err(TransferError::Protocol(
                "frame nonce out of sequence".to_string(),
            ));
        }

        let mut ciphertext = vec![0u8; ciphertext_len];
        reader
            .read_exact(&mut ciphertext)
            .await
            .map_err(TransferError::network)?;

        let plaintext = self.crypto.decrypt(&nonce, &ciphertext)?;
        self.recv_counter += 1;
        self.decode_payload(&plaintext)
    }

    fn encode_payload(&self, frame: &Frame) -> Result<Vec<u8>> {
        match frame {
            Frame::Manifest(manifest) => {
                let doc = serde_json::to_vec(manifest)
                    .map_err(|e| TransferError::Protocol(format!("manifest encoding: {}", e)))?;
                if doc.len() > MAX_MANIFEST_PAYLOAD {
                    return Err(TransferError::Protocol(format!(
                        "manifest payload {} exceeds {} byte cap",
                        doc.len(),
                        MAX_MANIFEST_PAYLOAD
                    )));
                }
                let mut payload = Vec::with_capacity(1 + doc.len());
                payload.push(TAG_MANIFEST);
                payload.extend_from_slice(&doc);
                Ok(payload)
            }
            Frame::FileData { offset, data } => {
                if data.len() > MAX_DATA_PAYLOAD {
                    return Err(TransferError::Protocol(format!(
                        "data payload {} exceeds {} byte cap",
                        data.len(),
                        MAX_DATA_PAYLOAD
                    )));
                }
                let body = if self.compression {
                    zstd::encode_all(std::io::Cursor::new(&data[..]), COMPRESSION_LEVEL)
                        .map_err(|e| TransferError::Protocol(format!("compression: {}", e)))?
                } else {
                    data.clone()
                };
                let mut payload = Vec::with_capacity(9 + body.len());
                payload.push(TAG_FILE_DATA);
                payload.extend_from_slice(&offset.to_be_bytes());
                payload.extend_from_slice(&body);
                Ok(payload)
            }
            Frame::RetryRequest(paths) => {
                let doc = serde_json::to_vec(paths)
                    .map_err(|e| TransferError::Protocol(format!("retry encoding: {}", e)))?;
                let mut payload = Vec::with_capacity(1 + doc.len());
                payload.push(TAG_RETRY_REQUEST);
                payload.extend_from_slice(&doc);
                Ok(payload)
            }
            Frame::EndOfStream => Ok(vec![TAG_END_OF_STREAM]),
            Frame::Ack(status) => Ok(vec![TAG_ACK, *status]),
        }
    }

    fn decode_payload(&self, plaintext: &[u8]) -> Result<Frame> {
        let (&tag, body) = plaintext
            .split_first()
            .ok_or_else(|| TransferError::Protocol("empty frame payload".to_string()))?;
        match tag {
            TAG_MANIFEST => {
                let manifest: Manifest = serde_json::from_slice(body)
                    .map_err(|e| TransferError::Protocol(format!("manifest decoding: {}", e)))?;
                Ok(Frame::Manifest(manifest))
            }
            TAG_FILE_DATA => {
                if body.len() < 8 {
                    return Err(TransferError::Protocol(
                        "data frame shorter than offset header".to_string(),
                    ));
                }
                let offset = u64::from_be_bytes(body[..8].try_into().unwrap_or([0u8; 8]));
                let data = if self.compression {
                    decompress_block(&body[8..])?
                } else {
                    body[8..].to_vec()
                };
                if data.len() > MAX_DATA_PAYLOAD {
                    return Err(TransferError::Protocol(format!(
                        "data payload {} exceeds {} byte cap",
                        data.len(),
                        MAX_DATA_PAYLOAD
                    )));
                }
                Ok(Frame::FileData { offset, data })
            }
            TAG_RETRY_REQUEST => {
                let paths: Vec<String> = serde_json::from_slice(body)
                    .map_err(|e| TransferError::Protocol(format!("retry decoding: {}", e)))?;
                Ok(Frame::RetryRequest(paths))
            }
            TAG_END_OF_STREAM => {
                if !body.is_empty() {
                    return Err(TransferError::Protocol(
                        "end-of-stream frame carries payload".to_string(),
                    ));
                }
                Ok(Frame::EndOfStream)
            }
            TAG_ACK => match body {
                [status] => Ok(Frame::Ack(*status)),
                _ => Err(TransferError::Protocol(
                    "ack frame must carry exactly one status byte".to_string(),
                )),
            },
            other => Err(TransferError::Protocol(format!(
                "unknown frame tag 0x{:02x}",
                other
            ))),
        }
    }
}

/// Decompress one block with the output bounded just past the payload cap,
/// so a hostile frame cannot balloon memory before the cap check runs.
fn decompress_block(compressed: &[u8]) -> Result<Vec<u8>> {
    use std::io::Read;

    let decoder = zstd::Decoder::new(std::io::Cursor::new(compressed))
        .map_err(|e| TransferError::Protocol(format!("decompression: {}", e)))?;
    let mut data = Vec::new();
    decoder
        .take(MAX_DATA_PAYLOAD as u64 + 1)
        .read_to_end(&mut data)
        .map_err(|e| TransferError::Protocol(format!("decompression: {}", e)))?;
    Ok(data)
}
