//! Stall sizing and abort backoff.
//!
//! Two knobs shape how long a thread sits out after the protocol refuses
//! it:
//!
//! - [`StallParams`] carries the fixed NACK stall plus the base/variable
//!   pairs for commit and abort stalls. Which configured pair (primary or
//!   secondary) plays which role depends on the versioning model: eager
//!   versioning pays on abort (undo), lazy versioning pays on commit
//!   (publish).
//! - [`BackoffPolicy`] sizes the post-abort backoff: exponential in the
//!   abort count when `abort_exp_backoff` is set, otherwise a random linear
//!   multiple. It also applies the optional symmetric jitter to every stall,
//!   a uniform draw over `[n/2, 3n/2]`.
//!
//! The RNG is injected so simulation runs are reproducible; seed it from
//! the `rng_seed` config key.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Stall cycle parameters resolved for one policy.
#[derive(Debug, Clone, Copy)]
pub struct StallParams {
    /// Stall after any NACK.
    pub nack_stall_cycles: u64,
    /// Commit stall: base + var × write-set size.
    pub commit_base_stall_cycles: u64,
    pub commit_var_stall_cycles: u64,
    /// Abort stall: base + var × write-set size.
    pub abort_base_stall_cycles: u64,
    pub abort_var_stall_cycles: u64,
}

impl StallParams {
    /// Assign the primary/secondary stall pairs to commit and abort roles.
    ///
    /// Eager versioning puts the primary pair on abort; lazy versioning
    /// puts it on commit.
    pub fn for_versioning(
        eager_versioning: bool,
        nack: u64,
        primary_base: u64,
        primary_var: u64,
        secondary_base: u64,
        secondary_var: u64,
    ) -> Self {
        if eager_versioning {
            Self {
                nack_stall_cycles: nack,
                commit_base_stall_cycles: secondary_base,
                commit_var_stall_cycles: secondary_var,
                abort_base_stall_cycles: primary_base,
                abort_var_stall_cycles: primary_var,
            }
        } else {
            Self {
                nack_stall_cycles: nack,
                commit_base_stall_cycles: primary_base,
                commit_var_stall_cycles: primary_var,
                abort_base_stall_cycles: secondary_base,
                abort_var_stall_cycles: secondary_var,
            }
        }
    }

    /// Commit stall for a given write-set size, before jitter.
    #[inline]
    pub fn commit_stall(&self, write_set: usize) -> u64 {
        self.commit_base_stall_cycles + self.commit_var_stall_cycles * write_set as u64
    }

    /// Abort stall for a given write-set size, before jitter.
    #[inline]
    pub fn abort_stall(&self, write_set: usize) -> u64 {
        self.abort_base_stall_cycles + self.abort_var_stall_cycles * write_set as u64
    }
}

/// Randomized backoff policy with an injected RNG.
pub struct BackoffPolicy {
    /// Exponent base for exponential backoff; 0 selects linear backoff.
    exp_base: u64,
    /// Upper bound of the uniform draw for linear backoff.
    lin_bound: u64,
    /// Whether stalls get the symmetric jitter.
    randomize: bool,
    rng: StdRng,
}

impl BackoffPolicy {
    /// Create a policy. A `seed` of `None` draws entropy from the OS.
    pub fn new(exp_base: u64, lin_bound: u64, randomize: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            exp_base,
            lin_bound: lin_bound.max(1),
            randomize,
            rng,
        }
    }

    /// Backoff stall after the `abort_count`-th consecutive abort.
    pub fn abort_backoff(&mut self, abort_count: u32) -> u64 {
        if self.exp_base != 0 {
            self.exp_base.saturating_pow(abort_count % 15)
        } else {
            self.rng.gen_range(1..=self.lin_bound) * abort_count as u64
        }
    }

    /// Apply the configured jitter to a stall of `n` cycles.
    ///
    /// With randomization off this is the identity; otherwise a uniform
    /// draw over the symmetric window `[n/2, 3n/2]`.
    pub fn rnd_delay(&mut self, n: u64) -> u64 {
        if !self.randomize || n == 0 {
            return n;
        }
        let lo = n / 2;
        let hi = n + n / 2;
        self.rng.gen_range(lo..=hi)
    }
}

impl std::fmt::Debug for BackoffPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackoffPolicy")
            .field("exp_base", &self.exp_base)
            .field("lin_bound", &self.lin_bound)
            .field("randomize", &self.randomize)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_versioning_selects_stall_roles() {
        let eager = StallParams::for_versioning(true, 10, 100, 5, 200, 7);
        assert_eq!(eager.abort_base_stall_cycles, 100);
        assert_eq!(eager.commit_base_stall_cycles, 200);

        let lazy = StallParams::for_versioning(false, 10, 100, 5, 200, 7);
        assert_eq!(lazy.commit_base_stall_cycles, 100);
        assert_eq!(lazy.abort_base_stall_cycles, 200);
    }

    #[test]
    fn test_stall_scales_with_write_set() {
        let p = StallParams::for_versioning(true, 10, 100, 5, 200, 7);
        assert_eq!(p.abort_stall(0), 100);
        assert_eq!(p.abort_stall(3), 115);
        assert_eq!(p.commit_stall(2), 214);
    }

    #[test]
    fn test_exponential_backoff() {
        let mut b = BackoffPolicy::new(2, 100, false, Some(1));
        assert_eq!(b.abort_backoff(0), 1);
        assert_eq!(b.abort_backoff(3), 8);
        // Exponent wraps at 15 consecutive aborts.
        assert_eq!(b.abort_backoff(15), 1);
        assert_eq!(b.abort_backoff(16), 2);
    }

    #[test]
    fn test_linear_backoff_bounds() {
        let mut b = BackoffPolicy::new(0, 8, false, Some(42));
        for count in 1..10u32 {
            let stall = b.abort_backoff(count);
            assert!(stall >= count as u64);
            assert!(stall <= 8 * count as u64);
        }
    }

    #[test]
    fn test_rnd_delay_identity_without_randomization() {
        let mut b = BackoffPolicy::new(2, 8, false, Some(7));
        assert_eq!(b.rnd_delay(40), 40);
    }

    #[test]
    fn test_rnd_delay_window() {
        let mut b = BackoffPolicy::new(2, 8, true, Some(7));
        for _ in 0..100 {
            let d = b.rnd_delay(40);
            assert!((20..=60).contains(&d));
        }
    }
}
