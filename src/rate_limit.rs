//! Per-session inbound frame limiter: a direct `governor` quota built
//! from the operator's per-minute setting.

use std::num::NonZeroU32;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};

pub struct FrameLimiter {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
}

impl FrameLimiter {
    /// `None` when `per_minute` is 0, which disables limiting entirely.
    pub fn per_minute(per_minute: u32) -> Option<FrameLimiter> {
        let quota = Quota::per_minute(NonZeroU32::new(per_minute)?);
        Some(FrameLimiter {
            limiter: RateLimiter::direct(quota),
        })
    }

    pub fn try_take(&self) -> bool {
        self.limiter.check().is_ok()
    }
}
