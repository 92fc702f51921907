pub mod store;
pub mod structures;

use std::sync::OnceLock;
use std::time::Instant;

static PROCESS_START: OnceLock<Instant> = OnceLock::new();

/// Monotonic nanoseconds since process start. Never returns 0, so a zero
/// `last_update_ns` always means "never read".
pub fn monotonic_now_ns() -> u64 {
    let start = PROCESS_START.get_or_init(Instant::now);
    (start.elapsed().as_nanos() as u64).max(1)
}
