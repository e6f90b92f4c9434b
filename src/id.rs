//! Process-wide request id generation.
//!
//! `spec.md` §4.3 describes `ms + offset` (arithmetic addition), and §9 flags
//! that as ambiguous across millisecond boundaries: a large offset from one
//! millisecond can collide with a small offset from the next. Per that
//! section's suggested fix this implementation bit-packs instead:
//! `(ms << 20) | (offset & (2^20 - 1))`, which is collision-free across
//! millisecond boundaries as well as within one, at the cost of repeating
//! after about 34 years of epoch milliseconds shifted into the high bits —
//! an acceptable tradeoff for a correlation id, not a timestamp.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

const COUNTER_BITS: u32 = 20;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

static OFFSET: AtomicU64 = AtomicU64::new(0);

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the unix epoch")
        .as_millis() as u64
}

/// Generates a new request id unique within the current process at
/// millisecond resolution. Up to 2^20 calls within the same millisecond are
/// guaranteed pairwise distinct; beyond that the low-order counter bits wrap
/// and may collide with an id minted earlier in the same millisecond.
pub fn next_request_id() -> u64 {
    let offset = OFFSET.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
    (now_millis() << COUNTER_BITS) | offset
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn generated_ids_are_pairwise_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..100_000 {
            assert!(seen.insert(next_request_id()));
        }
    }

    quickcheck::quickcheck! {
        // Freeze the "clock" contribution by packing it ourselves and only
        // exercising the counter, since the real clock can't be frozen from
        // a property test: construct 2^20 ids using the same packing scheme
        // `next_request_id` uses and confirm the counter component alone is
        // already pairwise distinct across a full window.
        fn distinct_within_one_millisecond_window(fixed_ms: u64) -> bool {
            let base = fixed_ms << COUNTER_BITS;
            let mut seen = HashSet::new();
            for _ in 0..(1usize << COUNTER_BITS) {
                let offset = OFFSET.fetch_add(1, Ordering::Relaxed) & COUNTER_MASK;
                if !seen.insert(base | offset) {
                    return false;
                }
            }
            true
        }
    }
}
