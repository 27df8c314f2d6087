use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio::time::timeout;

use crate::OVERLAY_CLI_TIMEOUT;

/// Name of the overlay CLI binary, resolved through PATH.
pub const OVERLAY_CLI: &str = "tailscale";

/// How long a peer-cache snapshot stays valid.
const CACHE_TTL: Duration = Duration::from_secs(30);

/// Hostname reported for addresses the overlay does not know.
pub const UNKNOWN_PEER: &str = "unknown_peer";

struct PeerCache {
    peers: HashMap<Ipv4Addr, String>,
    refreshed_at: Instant,
}

// Whole-cache snapshot, swapped atomically under the lock so concurrent
// callers observe either the previous mapping or the fully rebuilt one.
static PEER_CACHE: Mutex<Option<PeerCache>> = Mutex::new(None);

/// Ask the overlay CLI for this host's IPv4 address.
///
/// Returns `None` when the CLI is missing, times out, exits non-zero, or its
/// output does not contain exactly one IPv4 address. Never errors.
pub async fn local_endpoint() -> Option<Ipv4Addr> {
    let output = timeout(
        OVERLAY_CLI_TIMEOUT,
        Command::new(OVERLAY_CLI)
            .args(["ip", "--4"])
            .kill_on_drop(true)
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    parse_ip_output(&String::from_utf8_lossy(&output.stdout))
}

/// Check whether `ip` is an authenticated overlay peer.
///
/// Returns `(true, hostname)` iff the address appears in a cache snapshot no
/// older than 30 seconds; a stale or absent cache triggers a full refresh
/// from the overlay status listing first. Any subprocess or parse failure
/// yields `(false, "unknown_peer")`.
pub async fn verify_peer(ip: Ipv4Addr) -> (bool, String) {
    if let Some(hit) = cache_lookup(ip) {
        return hit;
    }

    let Some(peers) = fetch_peer_listing().await else {
        return (false, UNKNOWN_PEER.to_string());
    };

    let mut guard = match PEER_CACHE.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    *guard = Some(PeerCache {
        peers,
        refreshed_at: Instant::now(),
    });
    match guard.as_ref().and_then(|c| c.peers.get(&ip)) {
        Some(name) => (true, name.clone()),
        None => (false, UNKNOWN_PEER.to_string()),
    }
}

fn cache_lookup(ip: Ipv4Addr) -> Option<(bool, String)> {
    let guard = match PEER_CACHE.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    };
    let cache = guard.as_ref()?;
    if cache.refreshed_at.elapsed() >= CACHE_TTL {
        return None;
    }
    Some(match cache.peers.get(&ip) {
        Some(name) => (true, name.clone()),
        None => (false, UNKNOWN_PEER.to_string()),
    })
}

async fn fetch_peer_listing() -> Option<HashMap<Ipv4Addr, String>> {
    let output = timeout(
        OVERLAY_CLI_TIMEOUT,
        Command::new(OVERLAY_CLI)
            .arg("status")
            .kill_on_drop(true)
            .output(),
    )
    .await
    .ok()?
    .ok()?;

    if !output.status.success() {
        return None;
    }
    Some(parse_status_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Extract exactly one IPv4 address from CLI output; anything else is `None`.
fn parse_ip_output(stdout: &str) -> Option<Ipv4Addr> {
    let mut found = None;
    for tok in stdout.split_whitespace() {
        if let Ok(addr) = tok.parse::<Ipv4Addr>() {
            if found.is_some() {
                return None;
            }
            found = Some(addr);
        }
    }
    found
}

/// Parse the overlay status listing into an ip -> hostname mapping.
///
/// Each peer line starts with the peer's IPv4 address followed by its
/// hostname; blank lines and `#` comments are skipped, as are lines whose
/// first column is not an IPv4 address (header or summary rows).
fn parse_status_output(stdout: &str) -> HashMap<Ipv4Addr, String> {
    let mut peers = HashMap::new();
    for line in stdout.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        let Some(ip_tok) = parts.next() else { continue };
        let Ok(ip) = ip_tok.parse::<Ipv4Addr>() else { continue };
        let hostname = parts.next().unwrap_or("unknown").to_string();
        peers.insert(ip, hostname);
    }
    peers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ip_output_single_address() {
        assert_eq!(
            parse_ip_output("100.64.1.123\n"),
            Some(Ipv4Addr::new(100, 64, 1, 123))
        );
    }

    #[test]
    fn test_parse_ip_output_rejects_multiple() {
        assert_eq!(parse_ip_output("100.64.1.123\n100.64.1.124\n"), None);
    }

    #[test]
    fn test_parse_ip_output_rejects_garbage() {
        assert_eq!(parse_ip_output(""), None);
        assert_eq!(parse_ip_output("not an address"), None);
        assert_eq!(parse_ip_output("fd7a::1"), None);
    }

    #[test]
    fn test_parse_status_output_builds_mapping() {
        let listing = "\
# overlay status
100.64.1.5   alpha   user@  linux   -
100.64.1.9   beta    user@  macOS   idle

not-an-ip    header  row
";
        let peers = parse_status_output(listing);
        assert_eq!(peers.len(), 2);
        assert_eq!(
            peers.get(&Ipv4Addr::new(100, 64, 1, 5)).map(String::as_str),
            Some("alpha")
        );
        assert_eq!(
            peers.get(&Ipv4Addr::new(100, 64, 1, 9)).map(String::as_str),
            Some("beta")
        );
    }

    #[test]
    fn test_parse_status_output_tolerates_missing_hostname() {
        let peers = parse_status_output("100.64.1.7\n");
        assert_eq!(
            peers.get(&Ipv4Addr::new(100, 64, 1, 7)).map(String::as_str),
            Some("unknown")
        );
    }
}
