// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Per-thread spin calibration, run once at scheduler thread entry.

use std::time::Instant;

const CALIBRATION_SPINS: u32 = 10_000;
const DEFAULT_TARGET_US: u64 = 16;

/// Measures wall time of [`CALIBRATION_SPINS`] spin-loop hints and derives
/// a spin budget targeting `target_us` of wall time, clamped to avoid
/// pathological values on noisy hosts.
#[must_use]
pub fn calibrate(target_us: u64, num_cpus: usize) -> u32 {
    if num_cpus < 2 {
        // A single-CPU host can't profitably spin-wait for a peer; pause
        // immediately instead.
        return 0;
    }
    let start = Instant::now();
    for _ in 0..CALIBRATION_SPINS {
        std::hint::spin_loop();
    }
    let elapsed_ns = start.elapsed().as_nanos().max(1);
    let spins = (u128::from(target_us) * 1000 * u128::from(CALIBRATION_SPINS)) / elapsed_ns;
    u32::try_from(spins).unwrap_or(u32::MAX).clamp(1, 1_000_000)
}

/// Resolves the spin target, honoring a `SLICKSCHEDULERSPIN` microsecond
/// override if set and parseable; otherwise [`DEFAULT_TARGET_US`].
#[must_use]
pub fn resolve_target_us(env_override: Option<&str>) -> u64 {
    match env_override {
        Some(s) => match s.parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                crate::error::warning(format!(
                    "SLICKSCHEDULERSPIN={s:?} is not a valid microsecond count, using default"
                ));
                DEFAULT_TARGET_US
            }
        },
        None => DEFAULT_TARGET_US,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_cpu_skips_spinning() {
        assert_eq!(calibrate(16, 1), 0);
    }

    #[test]
    fn multi_cpu_calibrates_nonzero() {
        assert!(calibrate(16, 4) > 0);
    }

    #[test]
    fn resolve_target_defaults_on_garbage() {
        assert_eq!(resolve_target_us(Some("not-a-number")), DEFAULT_TARGET_US);
        assert_eq!(resolve_target_us(Some("42")), 42);
        assert_eq!(resolve_target_us(None), DEFAULT_TARGET_US);
    }
}
