// Process-wide entity-tag generator.
//
// Every call returns a value strictly greater than any value returned
// before it, from any thread.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use rand::rngs::OsRng;

static LAST_ETAG: AtomicU64 = AtomicU64::new(0);

const JITTER_RANGE: u64 = 1000;

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

fn jitter() -> u64 {
    let mut buf = [0_u8; 8];
    match OsRng.try_fill_bytes(&mut buf) {
        Ok(()) => u64::from_le_bytes(buf) % JITTER_RANGE,
        Err(_) => now_ns() % JITTER_RANGE,
    }
}

/// Generate the next entity-tag.
pub fn next_etag() -> u64 {
    let mut prev = LAST_ETAG.load(Ordering::Acquire);
    loop {
        let mut next = prev.max(now_ns()).saturating_add(jitter());
        if next <= prev {
            next = prev.saturating_add(1);
        }
        match LAST_ETAG.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(current) => prev = current,
        }
    }
}
