//! Write-ordering clock. Timestamps are microseconds since the epoch and never
//! repeat within a process, so two mutations built back to back still order.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_MICROS: AtomicI64 = AtomicI64::new(0);

/// Monotonic microsecond timestamp used as the write timestamp of every cell.
pub fn timestamp_micros() -> i64 {
    let wall = wall_micros();
    let mut current = LAST_MICROS.load(Ordering::Relaxed);
    loop {
        let next = if wall > current { wall } else { current + 1 };
        match LAST_MICROS.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => current = actual,
        }
    }
}

/// Whole seconds since the epoch; the resolution of tombstone deletion times.
pub fn now_seconds() -> i32 {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    secs.min(i32::MAX as u64) as i32
}

fn wall_micros() -> i64 {
    let micros = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros();
    micros.min(i64::MAX as u128) as i64
}
