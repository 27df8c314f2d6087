//! # Commands Module
//!
//! The two session engines behind the CLI:
//!
//! ## `send`
//! Enumerates the input paths into a deterministic manifest, announces the
//! connection string, accepts exactly one verified overlay peer, performs
//! the key exchange, then streams every file through the encrypting frame
//! codec and services retry requests until the receiver acknowledges.
//!
//! ## `receive`
//! Connects to the sender named in the connection string, performs the key
//! exchange, validates the incoming manifest, plans resume work from the
//! durable lock document, routes data frames into incremental file writers,
//! verifies integrity, and drives selective retries for files that failed.

pub mod receive;
pub mod send;
