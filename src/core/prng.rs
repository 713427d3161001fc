// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It drives stochastic integration and random initial conditions, where
// bit-for-bit reproducibility from a seed matters more than quality.

const ZERO_STATE_FALLBACK: u64 = 0x9E3779B97F4A7C15;

#[derive(Debug, Clone, PartialEq)]
pub struct Prng {
    state: u64,
    // Second Box-Muller variate, handed out on the next normal draw.
    spare: Option<f64>,
}

/// Snapshot of a [`Prng`], sufficient to continue the exact same sequence.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PrngState {
    pub word: u64,
    pub spare: Option<f64>,
}

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Nearby seeds must not produce correlated streams.
        let state = splitmix64(seed);
        let state = if state == 0 { ZERO_STATE_FALLBACK } else { state };
        Self { state, spare: None }
    }

    /// Rebuild a generator from a saved snapshot.
    ///
    /// Returns `None` for snapshots no generator can be in (zero word,
    /// non-finite cached variate).
    pub fn from_state(state: PrngState) -> Option<Self> {
        if state.word == 0 {
            return None;
        }
        if let Some(s) = state.spare {
            if !s.is_finite() {
                return None;
            }
        }
        Some(Self {
            state: state.word,
            spare: state.spare,
        })
    }

    pub fn state(&self) -> PrngState {
        PrngState {
            word: self.state,
            spare: self.spare,
        }
    }

    #[inline]
    pub fn next_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545F4914F6CDD1D)
    }

    /// Uniform in [0, 1) with 53 bits of precision.
    #[inline]
    pub fn next_f64_01(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    #[inline]
    pub fn gen_range_f64(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.next_f64_01()
    }

    /// Standard normal variate (polar Box-Muller).
    pub fn standard_normal(&mut self) -> f64 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        loop {
            let u = 2.0 * self.next_f64_01() - 1.0;
            let v = 2.0 * self.next_f64_01() - 1.0;
            let s = u * u + v * v;
            if s > 0.0 && s < 1.0 {
                let m = (-2.0 * s.ln() / s).sqrt();
                self.spare = Some(v * m);
                return u * m;
            }
        }
    }
}

#[inline]
fn splitmix64(seed: u64) -> u64 {
    let mut z = seed.wrapping_add(0x9E3779B97F4A7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = Prng::new(42);
        let mut b = Prng::new(42);
        for _ in 0..100 {
            assert_eq!(a.standard_normal().to_bits(), b.standard_normal().to_bits());
        }
        let mut c = Prng::new(43);
        assert_ne!(a.next_u64(), c.next_u64());
    }

    #[test]
    fn uniform_stays_in_unit_interval() {
        let mut rng = Prng::new(7);
        for _ in 0..10_000 {
            let x = rng.next_f64_01();
            assert!((0.0..1.0).contains(&x));
        }
        let y = rng.gen_range_f64(-2.0, 4.0);
        assert!((-2.0..4.0).contains(&y));
    }

    #[test]
    fn normals_have_unit_moments() {
        let mut rng = Prng::new(1);
        let n = 200_000;
        let mut sum = 0.0;
        let mut sum2 = 0.0;
        for _ in 0..n {
            let z = rng.standard_normal();
            sum += z;
            sum2 += z * z;
        }
        let mean = sum / n as f64;
        let var = sum2 / n as f64 - mean * mean;
        assert!(mean.abs() < 0.01, "mean {mean}");
        assert!((var - 1.0).abs() < 0.02, "var {var}");
    }

    #[test]
    fn restored_state_continues_sequence() {
        let mut rng = Prng::new(5);
        rng.standard_normal();
        let snap = rng.state();
        assert!(snap.spare.is_some());

        let mut resumed = Prng::from_state(snap).unwrap();
        for _ in 0..16 {
            assert_eq!(rng.standard_normal().to_bits(), resumed.standard_normal().to_bits());
        }
    }

    #[test]
    fn invalid_snapshots_are_rejected() {
        assert!(Prng::from_state(PrngState { word: 0, spare: None }).is_none());
        assert!(Prng::from_state(PrngState {
            word: 1,
            spare: Some(f64::NAN)
        })
        .is_none());
    }
}
