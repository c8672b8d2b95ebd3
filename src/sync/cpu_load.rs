//! Component I: an EWMA CPU load counter. Grounded on
//! `inc/nu/utils/cpu_load.hpp`, and reusing the same smoothing constant the
//! controller applies to reported free resources (SPEC_FULL Open Question
//! C.2 — one formula, used on both sides) so a proclet's self-reported load
//! and the controller's view of it agree on what "recent" means.
use std::sync::atomic::{AtomicU64, Ordering};

const ALPHA_BITS: u32 = 16;
const ALPHA_NUM: u64 = (0.2 * (1u64 << ALPHA_BITS) as f64) as u64;

/// Fixed-point EWMA so the counter can live in a single `AtomicU64` and be
/// updated from any core without a lock.
pub struct CpuLoad {
    // scaled by 2^ALPHA_BITS
    fixed: AtomicU64,
}

impl CpuLoad {
    pub fn new() -> CpuLoad {
        CpuLoad {
            fixed: AtomicU64::new(0),
        }
    }

    /// `busy_frac` is this sampling window's fraction of time spent busy,
    /// in `[0.0, 1.0]`.
    pub fn record(&self, busy_frac: f64) {
        let sample = (busy_frac.clamp(0.0, 1.0) * (1u64 << ALPHA_BITS) as f64) as u64;
        let mut cur = self.fixed.load(Ordering::Relaxed);
        loop {
            let next = (ALPHA_NUM * sample + (((1u64 << ALPHA_BITS) - ALPHA_NUM) * cur))
                >> ALPHA_BITS;
            match self
                .fixed
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn load(&self) -> f64 {
        self.fixed.load(Ordering::Relaxed) as f64 / (1u64 << ALPHA_BITS) as f64
    }
}

impl Default for CpuLoad {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn converges_toward_repeated_samples() {
        let load = CpuLoad::new();
        for _ in 0..200 {
            load.record(0.8);
        }
        assert!((load.load() - 0.8).abs() < 0.01);
    }

    #[test]
    fn starts_at_zero() {
        let load = CpuLoad::new();
        assert_eq!(load.load(), 0.0);
    }
}
