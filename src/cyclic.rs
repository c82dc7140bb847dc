//! Cyclic-group permutation of the target index space.
//!
//! Targets are numbered `1..=N`. We pick the smallest prime `p >= max(N,2)+1`
//! and a primitive root `g` of the multiplicative group mod `p`; the sequence
//! `g^(e0+k) mod p` for `k = 0,1,..` then walks every value in `[1, p-1]`
//! exactly once in pseudo-random order. Values above `N` are holes and are
//! skipped by the consumer. Both the prime and the root are derived from `N`
//! alone, so shards on separate machines agree on the permutation; only the
//! starting exponent `e0` carries randomness (and is seed-derivable).
//!
//! All modular arithmetic routes through `u128` intermediates, which is
//! exact for any `N` up to [`MAX_TARGET_SPACE`].

use rand::Rng;
use thiserror::Error;

/// Largest supported target space: 2^48 indices.
///
/// `p` stays below 2^49, so `u128` multiplication never overflows and the
/// exponent bookkeeping fits comfortably in `u64`.
pub const MAX_TARGET_SPACE: u64 = 1 << 48;

/// Error constructing a cyclic group over the target space.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("target space is empty (no allowed address/port combinations)")]
    EmptySpace,

    #[error("target space of {0} exceeds the supported maximum of 2^48")]
    SpaceTooLarge(u64),
}

/// An initialized cyclic group: the permutation parameters, fixed for the
/// lifetime of the scan.
#[derive(Debug, Clone)]
pub struct Cycle {
    n: u64,
    prime: u64,
    generator: u64,
    order: u64,
    offset: u64,
}

impl Cycle {
    /// Build the group for a target space of `n` indices.
    ///
    /// The starting exponent is drawn from `rng`; pass a seeded RNG when
    /// distributed shards must agree on it.
    pub fn new(n: u64, rng: &mut impl Rng) -> Result<Self, CycleError> {
        if n == 0 {
            return Err(CycleError::EmptySpace);
        }
        if n > MAX_TARGET_SPACE {
            return Err(CycleError::SpaceTooLarge(n));
        }
        let prime = next_prime(n.max(2) + 1);
        let generator = primitive_root(prime);
        let order = prime - 1;
        let offset = rng.gen_range(1..=order);
        tracing::debug!(
            n,
            prime,
            generator,
            offset,
            "cyclic group initialized over target space"
        );
        Ok(Self {
            n,
            prime,
            generator,
            order,
            offset,
        })
    }

    /// Number of valid indices (`1..=n`).
    pub fn target_count(&self) -> u64 {
        self.n
    }

    /// Group modulus.
    pub fn prime(&self) -> u64 {
        self.prime
    }

    /// Primitive root generating the full group.
    pub fn generator(&self) -> u64 {
        self.generator
    }

    /// Group order, `prime - 1`. This is the full period of the walk,
    /// holes included.
    pub fn order(&self) -> u64 {
        self.order
    }

    /// The group element at exponent offset `k`, i.e. `g^(e0+k) mod p`.
    pub fn element(&self, k: u64) -> u64 {
        powmod(
            self.generator,
            (self.offset + k) % self.order,
            self.prime,
        )
    }

    /// `g^k mod p` without the starting offset; used for shard strides.
    pub fn stride_factor(&self, k: u64) -> u64 {
        powmod(self.generator, k % self.order, self.prime)
    }
}

// =============================================================================
// Modular arithmetic
// =============================================================================

/// `(a * b) mod m` without overflow.
pub fn mulmod(a: u64, b: u64, m: u64) -> u64 {
    ((a as u128 * b as u128) % m as u128) as u64
}

/// `base^exp mod m` by square-and-multiply.
pub fn powmod(base: u64, mut exp: u64, m: u64) -> u64 {
    let mut result: u64 = 1 % m;
    let mut base = base % m;
    while exp > 0 {
        if exp & 1 == 1 {
            result = mulmod(result, base, m);
        }
        base = mulmod(base, base, m);
        exp >>= 1;
    }
    result
}

/// Deterministic Miller-Rabin primality test.
///
/// The fixed base set is a proven witness set for every 64-bit integer.
fn is_prime(n: u64) -> bool {
    if n < 2 {
        return false;
    }
    for p in [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        if n == p {
            return true;
        }
        if n % p == 0 {
            return false;
        }
    }
    let mut d = n - 1;
    let mut r = 0u32;
    while d % 2 == 0 {
        d /= 2;
        r += 1;
    }
    'witness: for a in [2u64, 3, 5, 7, 11, 13, 17, 19, 23, 29, 31, 37] {
        let mut x = powmod(a, d, n);
        if x == 1 || x == n - 1 {
            continue;
        }
        for _ in 0..r - 1 {
            x = mulmod(x, x, n);
            if x == n - 1 {
                continue 'witness;
            }
        }
        return false;
    }
    true
}

/// Smallest prime `>= n`.
fn next_prime(mut n: u64) -> u64 {
    if n <= 2 {
        return 2;
    }
    if n % 2 == 0 {
        n += 1;
    }
    while !is_prime(n) {
        n += 2;
    }
    n
}

/// Distinct prime factors of `n` by trial division.
fn distinct_prime_factors(mut n: u64) -> Vec<u64> {
    let mut factors = Vec::new();
    if n % 2 == 0 {
        factors.push(2);
        while n % 2 == 0 {
            n /= 2;
        }
    }
    let mut d = 3u64;
    while d * d <= n {
        if n % d == 0 {
            factors.push(d);
            while n % d == 0 {
                n /= d;
            }
        }
        d += 2;
    }
    if n > 1 {
        factors.push(n);
    }
    factors
}

/// Smallest primitive root of the prime `p`.
///
/// `g` is a primitive root iff `g^((p-1)/q) != 1` for every prime factor
/// `q` of `p-1`. Deterministic given `p`, which is deterministic given `N`.
fn primitive_root(p: u64) -> u64 {
    if p == 2 {
        return 1;
    }
    let order = p - 1;
    let factors = distinct_prime_factors(order);
    for g in 2..p {
        if factors.iter().all(|&q| powmod(g, order / q, p) != 1) {
            return g;
        }
    }
    unreachable!("every prime has a primitive root")
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn cycle(n: u64) -> Cycle {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        Cycle::new(n, &mut rng).unwrap()
    }

    #[test]
    fn test_prime_selection_is_minimal() {
        // smallest prime >= max(N,2)+1
        assert_eq!(cycle(1).prime(), 3);
        assert_eq!(cycle(2).prime(), 3);
        assert_eq!(cycle(7).prime(), 11);
        assert_eq!(cycle(254).prime(), 257);
        assert_eq!(cycle(255).prime(), 257);
        assert_eq!(cycle(65535).prime(), 65537);
        assert_eq!(cycle(65536).prime(), 65537);
    }

    #[test]
    fn test_known_primes() {
        for p in [2u64, 3, 5, 7, 11, 257, 65537, 16777259] {
            assert!(is_prime(p), "{p} is prime");
        }
        for c in [1u64, 4, 255, 65536, 16777260] {
            assert!(!is_prime(c), "{c} is composite");
        }
    }

    #[test]
    fn test_generator_has_full_order() {
        for n in [1u64, 7, 100, 65535] {
            let c = cycle(n);
            let p = c.prime();
            let g = c.generator();
            for q in distinct_prime_factors(p - 1) {
                assert_ne!(
                    powmod(g, (p - 1) / q, p),
                    1,
                    "g={g} is not a primitive root of p={p}"
                );
            }
        }
    }

    #[test]
    fn test_walk_covers_group_exactly_once() {
        for n in [1u64, 2, 7, 255, 1000] {
            let c = cycle(n);
            let mut seen = vec![false; (c.prime()) as usize];
            for k in 0..c.order() {
                let x = c.element(k);
                assert!(x >= 1 && x < c.prime());
                assert!(!seen[x as usize], "element {x} repeated for n={n}");
                seen[x as usize] = true;
            }
            let visited = seen.iter().filter(|&&s| s).count() as u64;
            assert_eq!(visited, c.order(), "full period must cover the group");
        }
    }

    #[test]
    fn test_valid_indices_covered_after_hole_skip() {
        let n = 255u64;
        let c = cycle(n);
        let mut seen = vec![false; (n + 1) as usize];
        for k in 0..c.order() {
            let x = c.element(k);
            if x <= n {
                assert!(!seen[x as usize]);
                seen[x as usize] = true;
            }
        }
        assert!(
            seen[1..].iter().all(|&s| s),
            "every index in 1..=N must appear"
        );
    }

    /// Walk the whole group incrementally (one multiply per step, the way
    /// shards do) and verify every index appears exactly once.
    fn assert_full_coverage(n: u64) {
        let c = cycle(n);
        let mut seen = vec![false; (n + 1) as usize];
        let mut covered = 0u64;
        let mut x = c.element(0);
        let start = x;
        loop {
            if x <= n {
                assert!(!seen[x as usize], "index {x} repeated for n={n}");
                seen[x as usize] = true;
                covered += 1;
            }
            x = mulmod(x, c.generator(), c.prime());
            if x == start {
                break;
            }
        }
        assert_eq!(covered, n, "every index visited exactly once for n={n}");
    }

    #[test]
    fn test_full_coverage_port_sized_space() {
        assert_full_coverage(65536);
    }

    #[test]
    #[ignore] // ~30M modular multiplications; run with --ignored
    fn test_full_coverage_sixteen_million() {
        assert_full_coverage(1 << 24);
    }

    #[test]
    fn test_same_seed_same_walk() {
        let mut r1 = rand::rngs::StdRng::seed_from_u64(99);
        let mut r2 = rand::rngs::StdRng::seed_from_u64(99);
        let a = Cycle::new(10_000, &mut r1).unwrap();
        let b = Cycle::new(10_000, &mut r2).unwrap();
        for k in [0u64, 1, 17, 9999] {
            assert_eq!(a.element(k), b.element(k));
        }
    }

    #[test]
    fn test_zero_space_rejected() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(matches!(
            Cycle::new(0, &mut rng),
            Err(CycleError::EmptySpace)
        ));
    }

    #[test]
    fn test_oversized_space_rejected() {
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(matches!(
            Cycle::new(MAX_TARGET_SPACE + 1, &mut rng),
            Err(CycleError::SpaceTooLarge(_))
        ));
    }

    #[test]
    fn test_mulmod_near_limits() {
        let m = (1u64 << 49) - 1;
        let a = m - 1;
        assert_eq!(mulmod(a, a, m), 1, "(m-1)^2 mod m == 1");
    }
}
