//! Shared inputs for the knight benchmarks.
//!
//! Traces are generated up front from a fixed seed so every bench iteration
//! replays the same requests and the generator stays out of the timings.

use knight_harness::workload::{XorShift64, code_size};

pub const BENCH_SEED: u64 = 0x6B6E_6967_6874;

/// One step of an alloc/free trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Alloc(usize),
    /// Free the live block at this index (modulo the live count).
    Free(usize),
}

/// Code-cache request sizes.
#[must_use]
pub fn code_sizes(count: usize) -> Vec<usize> {
    let mut rng = XorShift64::new(BENCH_SEED);
    (0..count).map(|_| code_size(&mut rng)).collect()
}

/// Lump request sizes between 1 and `max` bytes.
#[must_use]
pub fn lump_sizes(count: usize, max: usize) -> Vec<usize> {
    let mut rng = XorShift64::new(BENCH_SEED);
    (0..count).map(|_| rng.gen_range(1, max)).collect()
}

/// Alloc/free mix with roughly `alloc_percent`% allocations.
#[must_use]
pub fn churn_trace(count: usize, alloc_percent: u64) -> Vec<Op> {
    let mut rng = XorShift64::new(BENCH_SEED);
    let mut live = 0usize;
    (0..count)
        .map(|_| {
            if live == 0 || rng.chance(alloc_percent) {
                live += 1;
                Op::Alloc(code_size(&mut rng))
            } else {
                live -= 1;
                Op::Free(rng.next_u64() as usize)
            }
        })
        .collect()
}

/// Symbol-like string keys.
#[must_use]
pub fn symbol_keys(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("Lcode_{i:06}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn traces_are_reproducible() {
        assert_eq!(code_sizes(64), code_sizes(64));
        assert_eq!(churn_trace(256, 60), churn_trace(256, 60));
    }

    #[test]
    fn churn_never_frees_from_empty() {
        let mut live = 0usize;
        for op in churn_trace(10_000, 40) {
            match op {
                Op::Alloc(size) => {
                    assert!(size > 0);
                    live += 1;
                }
                Op::Free(_) => {
                    assert!(live > 0);
                    live -= 1;
                }
            }
        }
    }
}
