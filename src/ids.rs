//! Monotonic id generation for chats and messages.
//!
//! Ids embed the creation time in milliseconds followed by a per-millisecond
//! sequence number, both zero-padded, so lexicographic order equals creation
//! order and two ids minted within the same millisecond never collide.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Sequence slots available inside one millisecond before borrowing the next.
const SEQ_PER_MS: u64 = 10_000;

static LAST: AtomicU64 = AtomicU64::new(0);

pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Next value of the process-wide clock, `millis * SEQ_PER_MS + seq`.
///
/// Strictly increasing across threads. When the wall clock stalls or steps
/// backwards the counter keeps advancing from the last value handed out.
fn next_tick() -> u64 {
    let floor = now_ms().saturating_mul(SEQ_PER_MS);
    let mut prev = LAST.load(Ordering::Relaxed);
    loop {
        let next = if floor > prev { floor } else { prev + 1 };
        match LAST.compare_exchange_weak(prev, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => prev = actual,
        }
    }
}

fn mint(prefix: &str) -> String {
    let tick = next_tick();
    format!("{prefix}_{:013}{:04}", tick / SEQ_PER_MS, tick % SEQ_PER_MS)
}

pub fn chat_id() -> String {
    mint("chat")
}

pub fn message_id() -> String {
    mint("msg")
}
