//! Deterministic workload generation.

/// xorshift64* generator. Same seed, same workload.
#[derive(Clone, Copy, Debug)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// Zero is not a valid xorshift state and is replaced by a fixed seed.
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed },
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        assert!(low <= high_inclusive);
        let span = high_inclusive - low + 1;
        low + (self.next_u64() as usize % span)
    }

    /// True with probability `percent / 100`.
    pub fn chance(&mut self, percent: u64) -> bool {
        self.next_u64() % 100 < percent
    }
}

/// Request sizes typical of JIT output: mostly small stubs, some medium
/// functions, a rare large one.
#[must_use]
pub fn code_size(rng: &mut XorShift64) -> usize {
    match rng.gen_range(0, 99) {
        0..=69 => rng.gen_range(1, 96),
        70..=97 => rng.gen_range(97, 1_024),
        _ => rng.gen_range(1_025, 16_384),
    }
}

/// Parse a seed written in decimal or `0x` hex, with optional underscores.
pub fn parse_seed(raw: &str) -> Result<u64, std::num::ParseIntError> {
    let s = raw.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(&hex.replace('_', ""), 16)
    } else {
        s.replace('_', "").parse::<u64>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_sequence() {
        let mut a = XorShift64::new(42);
        let mut b = XorShift64::new(42);
        for _ in 0..100 {
            assert_eq!(a.next_u64(), b.next_u64());
        }
        assert_ne!(XorShift64::new(0).next_u64(), 0);
    }

    #[test]
    fn ranges_are_inclusive() {
        let mut rng = XorShift64::new(7);
        let mut seen_low = false;
        let mut seen_high = false;
        for _ in 0..10_000 {
            let v = rng.gen_range(3, 5);
            assert!((3..=5).contains(&v));
            seen_low |= v == 3;
            seen_high |= v == 5;
        }
        assert!(seen_low && seen_high);
    }

    #[test]
    fn code_sizes_stay_in_bounds() {
        let mut rng = XorShift64::new(0xDEAD_BEEF);
        for _ in 0..1_000 {
            let size = code_size(&mut rng);
            assert!((1..=16_384).contains(&size));
        }
    }

    #[test]
    fn seeds_parse_in_both_radixes() {
        assert_eq!(parse_seed("0xDEAD_BEEF").unwrap(), 0xDEAD_BEEF);
        assert_eq!(parse_seed(" 1_000 ").unwrap(), 1000);
        assert!(parse_seed("seed").is_err());
    }
}
