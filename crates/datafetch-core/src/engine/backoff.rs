//! Exponential backoff, decoupled from I/O so it is testable without a
//! network.

use std::time::Duration;

/// Delay before retry number `attempt` (0-based): `base * 2^attempt`,
/// capped at `cap`.
pub fn delay(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).map_or(cap, |d| d.min(cap))
}
