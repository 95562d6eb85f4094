use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds elapsed since the unix epoch. A clock set before the epoch
/// collapses to zero, the same value listings use for an unknown mtime.
#[inline]
pub fn timestamp_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0)
}
