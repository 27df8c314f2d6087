use crate::warnings::WarningSink;

/// Fraction of the descriptor limit beyond which we warn.
const HEADROOM_FRACTION: f64 = 0.8;

/// Count this process's open file descriptors. Linux only; other platforms
/// return `None` and the check is skipped.
#[cfg(target_os = "linux")]
pub fn open_descriptor_count() -> Option<usize> {
    let entries = std::fs::read_dir("/proc/self/fd").ok()?;
    Some(entries.filter_map(|e| e.ok()).count())
}

#[cfg(not(target_os = "linux"))]
pub fn open_descriptor_count() -> Option<usize> {
    None
}

/// Soft RLIMIT_NOFILE, where available.
#[cfg(unix)]
pub fn descriptor_limit() -> Option<u64> {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    let rc = unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) };
    if rc == 0 {
        Some(limit.rlim_cur as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
pub fn descriptor_limit() -> Option<u64> {
    None
}

/// Advisory check before a transfer touches many files. Warns when current
/// usage plus the incoming file count crowds the soft limit; silently does
/// nothing where the queries are unsupported.
pub fn check_descriptor_headroom(incoming_files: usize, sink: &WarningSink) {
    let (Some(current), Some(limit)) = (open_descriptor_count(), descriptor_limit()) else {
        return;
    };
    if (current as u64).saturating_add(incoming_files as u64) as f64
        > HEADROOM_FRACTION * limit as f64
    {
        sink.warn(&format!(
            "file descriptor pressure: {} open + {} incoming files vs soft limit {}",
            current, incoming_files, limit
        ));
    }
}
