// SPDX-License-Identifier: MPL-2.0

//! Bounded busy-waiting on hardware state.

use crate::error::Timeout;

/// Spins until `condition` holds, checking it at most `max_iterations + 1` times.
///
/// This never sleeps and never yields. It is the only way the driver waits on
/// the SMMU, because the waits happen with a spin lock held or with local
/// interrupts disabled, where suspending the caller is not allowed. Hardware
/// completions are expected within a few thousand cycles, so the bound only
/// trips on a wedged or misconfigured unit.
pub fn poll_until<F>(max_iterations: usize, mut condition: F) -> Result<(), Timeout>
where
    F: FnMut() -> bool,
{
    for _ in 0..=max_iterations {
        if condition() {
            return Ok(());
        }
        core::hint::spin_loop();
    }
    Err(Timeout)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn succeeds_immediately() {
        let mut calls = 0;
        assert_eq!(
            poll_until(0, || {
                calls += 1;
                true
            }),
            Ok(())
        );
        assert_eq!(calls, 1);
    }

    #[test]
    fn succeeds_on_last_allowed_check() {
        let mut calls = 0;
        let res = poll_until(3, || {
            calls += 1;
            calls == 4
        });
        assert_eq!(res, Ok(()));
    }

    #[test]
    fn gives_up_after_bound() {
        let mut calls = 0;
        let res = poll_until(5, || {
            calls += 1;
            false
        });
        assert_eq!(res, Err(Timeout));
        assert_eq!(calls, 6);
    }
}
