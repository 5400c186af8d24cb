// Minimal PRNG (no external crates).
//
// This is NOT cryptographically secure.
// It drives connection sampling, initial weights and activation noise, and its
// full state is checkpointed so a resumed substrate continues the same stream.

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prng {
    state: u64,
}

const ZERO_STATE_REPLACEMENT: u64 = 0x9E3779B97F4A7C15;

impl Prng {
    pub fn new(seed: u64) -> Self {
        // Avoid a zero state.
        let seed = if seed == 0 {
            ZERO_STATE_REPLACEMENT
        } else {
            seed
        };
        Self { state: seed }
    }

    pub(crate) fn from_state(state: u64) -> Self {
        Self::new(state)
    }

    pub(crate) fn state(&self) -> u64 {
        self.state
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

    #[inline]
    pub fn next_u32(&mut self) -> u32 {
        (self.next_u64() >> 32) as u32
    }

    #[inline]
    pub fn next_f32_01(&mut self) -> f32 {
        // Convert to [0,1).
        let x = self.next_u32() >> 8;
        (x as f32) / ((1u32 << 24) as f32)
    }

    #[inline]
    pub fn gen_range_f32(&mut self, low: f32, high: f32) -> f32 {
        low + (high - low) * self.next_f32_01()
    }

    /// Uniform integer in `[0, span)` (Lemire's widening multiply).
    #[inline]
    pub fn gen_below_u64(&mut self, span: u64) -> u64 {
        if span == 0 {
            return 0;
        }
        ((self.next_u64() as u128 * span as u128) >> 64) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resumed_state_continues_the_stream() {
        let mut a = Prng::new(42);
        for _ in 0..10 {
            a.next_u64();
        }
        let mut b = Prng::from_state(a.state());
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
    }

    #[test]
    fn unit_interval_and_ranges_stay_in_bounds() {
        let mut rng = Prng::new(7);
        for _ in 0..10_000 {
            let x = rng.next_f32_01();
            assert!((0.0..1.0).contains(&x));
            let y = rng.gen_range_f32(0.1, 0.9);
            assert!((0.1..=0.9).contains(&y));
            assert!(rng.gen_below_u64(13) < 13);
        }
    }
}
