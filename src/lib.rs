use std::time::Duration;

pub mod cryptography;
pub mod enumerate;
pub mod error;
pub mod framing;
pub mod lock;
pub mod monitor;
pub mod overlay;
pub mod token;
pub mod warnings;
pub mod writer;
pub mod commands;

pub const KEY_SIZE: usize = 32;
pub const NONCE_SIZE: usize = 12;
pub const TAG_SIZE: usize = 16;

/// Fixed TCP port the sender listens on.
pub const TRANSFER_PORT: u16 = 15820;

/// Streaming read buffer size; also the cap on a single data frame's payload.
pub const DATA_CHUNK_SIZE: usize = 1024 * 1024;
pub const MAX_DATA_PAYLOAD: usize = 1024 * 1024;
pub const MAX_MANIFEST_PAYLOAD: usize = 16 * 1024 * 1024;

pub const MAX_RETRY_ATTEMPTS: u32 = 3;

pub const ACCEPT_TIMEOUT: Duration = Duration::from_secs(300);
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const MANIFEST_READ_TIMEOUT: Duration = Duration::from_secs(120);
pub const DATA_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const RETRY_READ_TIMEOUT: Duration = Duration::from_secs(120);
pub const OVERLAY_CLI_TIMEOUT: Duration = Duration::from_secs(5);
