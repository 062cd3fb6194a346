pub mod config;
pub mod hex;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_NOW_MS: AtomicU64 = AtomicU64::new(1);

/// Wall-clock milliseconds, clamped so repeated samples never regress.
/// Pool timestamps and backoff math rely on this being monotonic.
pub fn now_ms() -> u64 {
    let sample = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|d| d.as_millis() as u64);
    normalize_now_ms(sample)
}

fn normalize_now_ms(sample_ms: Option<u64>) -> u64 {
    let mut prev = LAST_NOW_MS.load(Ordering::Relaxed);
    loop {
        let normalized = sample_ms.unwrap_or(prev).max(prev).max(1);
        match LAST_NOW_MS.compare_exchange_weak(
            prev,
            normalized,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => return normalized,
            Err(actual) => prev = actual,
        }
    }
}

/// Trim an error's display form so transport noise does not flood the logs.
pub fn compact_error(err: impl std::fmt::Display) -> String {
    const MAX_LEN: usize = 260;
    let raw = err.to_string();
    if raw.len() <= MAX_LEN {
        return raw;
    }
    let mut cut = MAX_LEN;
    while !raw.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &raw[..cut])
}
