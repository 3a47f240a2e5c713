//! Random source for the lottery draw.
//!
//! The draw is behind [`TicketSource`] so that tests (and ports with a
//! hardware RNG) can supply their own values. The default is a 32-bit
//! xorshift generator: seeded once, no state besides the generator word.

/// Supplies the winning ticket for one lottery round.
pub trait TicketSource {
    /// Return a value uniformly distributed in `[0, total)`. `total` is
    /// never zero.
    fn draw(&mut self, total: u32) -> u32;
}

/// Marsaglia xorshift (13, 17, 5).
#[derive(Debug, Clone)]
pub struct Xorshift32(u32);

impl Xorshift32 {
    /// A zero state would get stuck at zero, so `0` is replaced by a fixed
    /// non-zero seed.
    pub const fn new(seed: u32) -> Self {
        Self(if seed == 0 { crate::config::DEFAULT_SEED } else { seed })
    }

    pub fn next_u32(&mut self) -> u32 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 17;
        self.0 ^= self.0 << 5;
        self.0
    }
}

impl TicketSource for Xorshift32 {
    /// Multiply-shift range reduction: maps the full 32-bit output onto
    /// `[0, total)` without a division.
    fn draw(&mut self, total: u32) -> u32 {
        ((self.next_u32() as u64 * total as u64) >> 32) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_seed_is_replaced() {
        let mut rng = Xorshift32::new(0);
        assert_ne!(rng.next_u32(), 0);
    }

    #[test]
    fn test_same_seed_same_sequence() {
        let mut a = Xorshift32::new(0xc0ffee);
        let mut b = Xorshift32::new(0xc0ffee);
        for _ in 0..100 {
            assert_eq!(a.next_u32(), b.next_u32());
        }
    }

    #[test]
    fn test_draw_stays_in_range() {
        let mut rng = Xorshift32::new(1);
        for total in [1u32, 2, 3, 100, 1_000_000] {
            for _ in 0..1000 {
                assert!(rng.draw(total) < total);
            }
        }
    }

    #[test]
    fn test_draw_is_roughly_uniform() {
        let mut rng = Xorshift32::new(0xc0ffee00);
        let mut buckets = [0u32; 10];
        for _ in 0..100_000 {
            buckets[rng.draw(10) as usize] += 1;
        }
        for count in buckets {
            assert!((9_000..11_000).contains(&count), "{:?}", buckets);
        }
    }
}
