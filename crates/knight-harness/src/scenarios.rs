//! Replayable allocator scenarios.
//!
//! Each scenario drives one allocator with a seeded workload, checks the
//! allocator's invariants along the way and reports the result. The core
//! lifecycle records of the run are forwarded to the JSONL log.

use std::collections::{BTreeMap, HashSet};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use knight_core::code_cache::{CODE_ALIGN, SECRET_SIZE};
use knight_core::hash_table::grow_limit;
use knight_core::lump::LUMP_ALIGN;
use knight_core::{
    CodeCache, HashTable, KnightConfig, KnightError, LifecycleRecord, LumpAllocator,
    PageAllocator, hash_str,
};

use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
use crate::workload::{XorShift64, code_size};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("allocator: {0}")]
    Allocator(#[from] KnightError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid seed '{raw}': {source}")]
    Seed {
        raw: String,
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("{failed} of {total} scenarios failed")]
    ScenariosFailed { failed: usize, total: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    /// Page alloc/free churn followed by a full recycle.
    PageRecycle,
    /// Rounds of lump allocation separated by resets.
    LumpReset,
    /// Random code-cache alloc/free with overlap checks.
    CodeChurn,
    /// Hash table growth, lookup and removal, heap and lump backed.
    HashResize,
}

impl Scenario {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PageRecycle => "page_recycle",
            Self::LumpReset => "lump_reset",
            Self::CodeChurn => "code_churn",
            Self::HashResize => "hash_resize",
        }
    }

    #[must_use]
    pub const fn all() -> [Self; 4] {
        [
            Self::PageRecycle,
            Self::LumpReset,
            Self::CodeChurn,
            Self::HashResize,
        ]
    }
}

/// One named invariant check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub detail: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenarioReport {
    pub scenario: Scenario,
    pub seed: u64,
    pub ops: usize,
    /// Regions (or page blocks) mapped by the end of the run.
    pub regions: usize,
    pub mapped_bytes: usize,
    pub lifecycle_events: usize,
    pub duration_ms: u64,
    pub checks: Vec<Check>,
}

impl ScenarioReport {
    fn new(scenario: Scenario, options: &RunOptions) -> Self {
        Self {
            scenario,
            seed: options.seed,
            ops: options.ops,
            regions: 0,
            mapped_bytes: 0,
            lifecycle_events: 0,
            duration_ms: 0,
            checks: Vec::new(),
        }
    }

    fn check(&mut self, name: &str, passed: bool, detail: impl Into<String>) {
        self.checks.push(Check {
            name: name.to_string(),
            passed,
            detail: detail.into(),
        });
    }

    #[must_use]
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failed_checks(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOptions {
    pub seed: u64,
    pub ops: usize,
    pub config: KnightConfig,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            seed: 0xDEAD_BEEF,
            ops: 10_000,
            config: KnightConfig::default(),
        }
    }
}

/// Run `scenario`, logging start, lifecycle records and result to `emitter`.
pub fn run_scenario(
    scenario: Scenario,
    options: &RunOptions,
    emitter: &mut LogEmitter,
) -> Result<ScenarioReport, HarnessError> {
    let mut options = *options;
    options.config = options.config.with_lifecycle_log(true);

    emitter.emit_entry(
        LogEntry::new(String::new(), LogLevel::Info, "scenario_start")
            .with_component("harness")
            .with_scenario(scenario.as_str())
            .with_details(serde_json::json!({ "seed": options.seed, "ops": options.ops })),
    )?;

    let started = Instant::now();
    let (mut report, lifecycle) = match scenario {
        Scenario::PageRecycle => page_recycle(&options)?,
        Scenario::LumpReset => lump_reset(&options)?,
        Scenario::CodeChurn => code_churn(&options)?,
        Scenario::HashResize => hash_resize(&options)?,
    };
    report.duration_ms = started.elapsed().as_millis() as u64;
    report.lifecycle_events = lifecycle.len();

    emitter.emit_lifecycle(scenario.as_str(), &lifecycle)?;

    let passed = report.passed();
    let failed: Vec<&str> = report.failed_checks().map(|c| c.name.as_str()).collect();
    emitter.emit_entry(
        LogEntry::new(
            String::new(),
            if passed { LogLevel::Info } else { LogLevel::Error },
            "scenario_end",
        )
        .with_component("harness")
        .with_scenario(scenario.as_str())
        .with_outcome(if passed { Outcome::Pass } else { Outcome::Fail })
        .with_size(report.mapped_bytes as u64)
        .with_duration_ms(report.duration_ms)
        .with_details(serde_json::json!({
            "regions": report.regions,
            "checks": report.checks.len(),
            "failed": failed,
        })),
    )?;
    Ok(report)
}

type Outcomes = (ScenarioReport, Vec<LifecycleRecord>);

// ---------------------------------------------------------------------------
// Workloads
// ---------------------------------------------------------------------------

fn page_recycle(options: &RunOptions) -> Result<Outcomes, HarnessError> {
    let mut report = ScenarioReport::new(Scenario::PageRecycle, options);
    let mut pages = PageAllocator::with_config(&options.config);
    let mut rng = XorShift64::new(options.seed);
    let page_size = pages.page_size();
    let per_block = pages.granularity() / page_size;

    let mut live = Vec::new();
    let mut peak = 0usize;
    let mut misaligned = 0usize;
    for _ in 0..options.ops {
        if live.is_empty() || rng.chance(55) {
            let page = pages.alloc()?;
            misaligned += usize::from(page.addr() % page_size != 0);
            live.push(page);
            peak = peak.max(live.len());
        } else {
            let index = rng.gen_range(0, live.len() - 1);
            pages.free(live.swap_remove(index));
        }
    }

    let distinct: HashSet<usize> = live.iter().map(|p| p.addr()).collect();
    report.check("pages_aligned", misaligned == 0, format!("misaligned={misaligned}"));
    report.check(
        "live_pages_distinct",
        distinct.len() == live.len(),
        format!("live={} distinct={}", live.len(), distinct.len()),
    );
    let bound = peak.div_ceil(per_block.max(1));
    report.check(
        "blocks_bounded_by_peak",
        pages.mapped_blocks() <= bound,
        format!("blocks={} bound={bound} peak={peak}", pages.mapped_blocks()),
    );

    // Everything back, then everything out again: no new mappings.
    let held = live.len();
    for page in live.drain(..) {
        pages.free(page);
    }
    let blocks = pages.mapped_blocks();
    for _ in 0..held {
        live.push(pages.alloc()?);
    }
    report.check(
        "recycle_maps_nothing",
        pages.mapped_blocks() == blocks,
        format!("before={blocks} after={}", pages.mapped_blocks()),
    );

    report.regions = pages.mapped_blocks();
    report.mapped_bytes = pages.mapped_bytes();
    Ok((report, pages.lifecycle_log().records().cloned().collect()))
}

fn lump_reset(options: &RunOptions) -> Result<Outcomes, HarnessError> {
    const ROUNDS: usize = 4;

    let mut report = ScenarioReport::new(Scenario::LumpReset, options);
    let mut lump = LumpAllocator::with_config(&options.config);
    let lump_size = lump.default_lump_size();
    let per_round = (options.ops / ROUNDS).max(1);

    let mut misaligned = 0usize;
    let mut foreign = 0usize;
    let mut unrestored = 0usize;
    for _ in 0..ROUNDS {
        let mut rng = XorShift64::new(options.seed);
        for _ in 0..per_round {
            let size = if rng.chance(1) {
                rng.gen_range(lump_size + 1, lump_size * 3)
            } else {
                rng.gen_range(1, 512)
            };
            let ptr = lump.alloc(size)?.as_ptr() as usize;
            misaligned += usize::from(ptr % LUMP_ALIGN != 0);
            foreign += usize::from(!lump.owns(ptr + size - 1));
        }
        lump.reset();
        if lump.available_bytes() != lump.mapped_bytes() || lump.unusable_regions() != 0 {
            unrestored += 1;
        }
    }

    let available = lump.available_bytes();
    lump.reset();
    report.check("pointers_aligned", misaligned == 0, format!("misaligned={misaligned}"));
    report.check("pointers_owned", foreign == 0, format!("foreign={foreign}"));
    report.check(
        "reset_restores_all",
        unrestored == 0,
        format!("unrestored_rounds={unrestored}"),
    );
    report.check(
        "reset_idempotent",
        lump.available_bytes() == available,
        format!("before={available} after={}", lump.available_bytes()),
    );

    report.regions = lump.region_count();
    report.mapped_bytes = lump.mapped_bytes();
    Ok((report, lump.lifecycle_log().records().cloned().collect()))
}

fn code_churn(options: &RunOptions) -> Result<Outcomes, HarnessError> {
    let mut report = ScenarioReport::new(Scenario::CodeChurn, options);
    let mut cache = CodeCache::with_config(&options.config);
    let mut rng = XorShift64::new(options.seed);

    let mut live = Vec::new();
    let mut misaligned = 0usize;
    let mut short = 0usize;
    let mut misfiled = 0usize;
    let mut overlaps = 0usize;
    for op in 0..options.ops {
        if live.is_empty() || rng.chance(60) {
            let size = code_size(&mut rng);
            let block = cache.alloc(size)?;
            misaligned += usize::from(block.addr() % CODE_ALIGN != 0);
            short += usize::from(block.capacity() < size);
            misfiled += usize::from(cache.region_of(block.addr()) != Some(block.region()));
            live.push(block);
        } else {
            let index = rng.gen_range(0, live.len() - 1);
            cache.free(live.swap_remove(index));
        }
        if op % 1_024 == 0 {
            overlaps += count_overlaps(&live);
        }
    }
    overlaps += count_overlaps(&live);

    report.check("blocks_aligned", misaligned == 0, format!("misaligned={misaligned}"));
    report.check("capacity_covers_request", short == 0, format!("short={short}"));
    report.check("region_lookup_agrees", misfiled == 0, format!("misfiled={misfiled}"));
    report.check("live_blocks_disjoint", overlaps == 0, format!("overlaps={overlaps}"));

    for block in live.drain(..) {
        cache.free(block);
    }
    cache.rebalance();
    let stats = cache.stats();
    report.check(
        "accounting_balances",
        stats.total_free == stats.mapped_bytes,
        format!("total_free={} mapped={}", stats.total_free, stats.mapped_bytes),
    );
    report.check(
        "rebalance_clears_full",
        stats.full == 0,
        format!("live={} partial={} full={}", stats.live, stats.partial, stats.full),
    );

    report.regions = stats.regions();
    report.mapped_bytes = stats.mapped_bytes;
    Ok((report, cache.lifecycle_log().records().cloned().collect()))
}

/// Overlapping `[slot start, slot end)` pairs among live blocks.
fn count_overlaps(live: &[knight_core::CodeBlock]) -> usize {
    let spans: BTreeMap<usize, usize> = live
        .iter()
        .map(|b| {
            let start = b.addr() - SECRET_SIZE;
            (start, start + b.slot_size())
        })
        .collect();
    let duplicates = live.len() - spans.len();
    duplicates
        + spans
            .iter()
            .zip(spans.iter().skip(1))
            .filter(|((_, end), (next, _))| *end > *next)
            .count()
}

fn hash_resize(options: &RunOptions) -> Result<Outcomes, HarnessError> {
    let mut report = ScenarioReport::new(Scenario::HashResize, options);
    let keys = (options.ops / 2).max(16);

    let mut table: HashTable<String, u64> =
        HashTable::new(4, hash_str).with_lifecycle_log(options.config.lifecycle_log);
    let mut early_growth = 0usize;
    for i in 0..keys {
        let buckets = table.bucket_count();
        let len = table.len();
        table.insert(format!("sym_{i}"), i as u64)?;
        let grew = table.bucket_count() != buckets;
        // Growth happens exactly when the table held 90% of its buckets.
        if grew != (len >= grow_limit(buckets)) {
            early_growth += 1;
        }
    }
    report.check(
        "growth_at_ninety_percent",
        early_growth == 0,
        format!("mismatches={early_growth} buckets={}", table.bucket_count()),
    );

    let missing = (0..keys)
        .filter(|i| table.find(&format!("sym_{i}")) != Some(&(*i as u64)))
        .count();
    report.check("lookups_after_growth", missing == 0, format!("missing={missing}"));

    let mut removed = 0usize;
    for i in (0..keys).step_by(3) {
        removed += usize::from(table.remove(&format!("sym_{i}")).is_some());
    }
    let ghosts = (0..keys)
        .step_by(3)
        .filter(|i| table.contains_key(&format!("sym_{i}")))
        .count();
    report.check(
        "removal_consistent",
        ghosts == 0 && table.len() == keys - removed,
        format!("removed={removed} ghosts={ghosts} len={}", table.len()),
    );
    let mut lifecycle: Vec<_> = table.lifecycle_log().records().cloned().collect();

    // Same keys in a lump-backed table, thrown away by one reset.
    let mut lump = LumpAllocator::with_config(&options.config);
    {
        let mut scratch: HashTable<u64, u64, &mut LumpAllocator> =
            HashTable::with_allocator(4, |k| (*k ^ (*k >> 32)) as u32, &mut lump, true);
        let mut rng = XorShift64::new(options.seed);
        let mut expected = BTreeMap::new();
        for _ in 0..keys {
            let key = rng.next_u64();
            let value = rng.next_u64();
            scratch.insert(key, value)?;
            expected.insert(key, value);
        }
        let wrong = expected
            .iter()
            .filter(|&(k, v)| scratch.find(k) != Some(v))
            .count();
        report.check(
            "lump_backed_lookups",
            wrong == 0 && scratch.len() == expected.len(),
            format!("wrong={wrong} len={}", scratch.len()),
        );
    }
    lump.reset();
    report.check(
        "lump_reset_reclaims_nodes",
        lump.available_bytes() == lump.mapped_bytes(),
        format!("regions={}", lump.region_count()),
    );
    lifecycle.extend(lump.lifecycle_log().records().cloned());

    report.regions = lump.region_count();
    report.mapped_bytes = lump.mapped_bytes();
    Ok((report, lifecycle))
}
