//! Allocator configuration.
//!
//! Every allocator takes a [`KnightConfig`]. The defaults come from the OS;
//! `KnightConfig::from_env()` lets a host override them:
//! - `KNIGHT_LUMP_SIZE`: default lump size (`65536`, `64k`, `1m`).
//! - `KNIGHT_CODE_REGION_SIZE`: default code region size.
//! - `KNIGHT_MAP_GRANULARITY`: bytes handed out per page-allocator mapping.
//! - `KNIGHT_LIFECYCLE_LOG`: `on` to record region-level lifecycle events.
//!
//! The environment is read each time `from_env` is called. Nothing is cached
//! in process-wide state.

use crate::platform::MemoryInfo;

/// Smallest default lump, regardless of what the OS reports.
pub const MIN_LUMP_SIZE: usize = 64 * 1024;

/// Default size of a freshly mapped code region.
pub const DEFAULT_CODE_REGION_SIZE: usize = 64 * 1024;

/// Tunables shared by the page, lump and code allocators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnightConfig {
    /// Page size and mapping granularity.
    pub memory: MemoryInfo,
    /// Size of a regular lump. Oversize requests get a multiple of this.
    pub lump_size: usize,
    /// Minimum size of a new code region.
    pub code_region_size: usize,
    /// Record region-level lifecycle events.
    pub lifecycle_log: bool,
}

impl Default for KnightConfig {
    fn default() -> Self {
        Self::for_memory(MemoryInfo::query())
    }
}

impl KnightConfig {
    /// Defaults derived from the given memory geometry.
    #[must_use]
    pub fn for_memory(memory: MemoryInfo) -> Self {
        Self {
            memory,
            lump_size: memory.granularity.max(MIN_LUMP_SIZE),
            code_region_size: DEFAULT_CODE_REGION_SIZE,
            lifecycle_log: false,
        }
    }

    /// The configuration every allocator actually runs with.
    ///
    /// Fields are public, so a literal may carry values the setters would
    /// never produce. Geometry is repaired with [`MemoryInfo::normalized`], a
    /// zero lump size falls back to the default, and lump sizes are rounded
    /// to whole pages. A zero code region size stays meaningful.
    #[must_use]
    pub fn normalized(self) -> Self {
        let memory = self.memory.normalized();
        let default_lump = memory.granularity.max(MIN_LUMP_SIZE);
        let lump_size = if self.lump_size == 0 {
            default_lump
        } else {
            self.lump_size
                .checked_next_multiple_of(memory.page_size)
                .unwrap_or(default_lump)
        };
        Self {
            memory,
            lump_size,
            ..self
        }
    }

    /// Defaults, overridden by the `KNIGHT_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`KnightConfig::from_env`] with a caller-provided lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(granularity) = lookup("KNIGHT_MAP_GRANULARITY")
            .as_deref()
            .and_then(parse_size_loose)
        {
            config = config.with_granularity(granularity);
        }
        if let Some(size) = lookup("KNIGHT_LUMP_SIZE")
            .as_deref()
            .and_then(parse_size_loose)
        {
            config = config.with_lump_size(size);
        }
        if let Some(size) = lookup("KNIGHT_CODE_REGION_SIZE")
            .as_deref()
            .and_then(parse_size_loose)
        {
            config = config.with_code_region_size(size);
        }
        if let Some(raw) = lookup("KNIGHT_LIFECYCLE_LOG") {
            config.lifecycle_log = parse_switch_loose(&raw);
        }
        config
    }

    #[must_use]
    pub fn with_granularity(mut self, granularity: usize) -> Self {
        self.memory = self.memory.with_granularity(granularity);
        self
    }

    /// Lump sizes are kept page-aligned.
    #[must_use]
    pub fn with_lump_size(mut self, size: usize) -> Self {
        let page = self.memory.page_size;
        self.lump_size = size.max(page).next_multiple_of(page);
        self
    }

    /// Zero means "size each region to its first request".
    #[must_use]
    pub fn with_code_region_size(mut self, size: usize) -> Self {
        self.code_region_size = size;
        self
    }

    #[must_use]
    pub fn with_lifecycle_log(mut self, enabled: bool) -> Self {
        self.lifecycle_log = enabled;
        self
    }
}

/// Parse a byte count with an optional `k`/`m`/`g` suffix (case-insensitive).
///
/// Returns `None` for anything unparseable, zero, or overflowing.
#[must_use]
pub fn parse_size_loose(raw: &str) -> Option<usize> {
    let s = raw.trim().to_ascii_lowercase();
    let s = s.strip_suffix('b').unwrap_or(&s);
    let (digits, shift) = match s.as_bytes().last()? {
        b'k' => (&s[..s.len() - 1], 10),
        b'm' => (&s[..s.len() - 1], 20),
        b'g' => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };
    let value: usize = digits.trim().replace('_', "").parse().ok()?;
    let bytes = value.checked_mul(1usize.checked_shl(shift)?)?;
    (bytes > 0).then_some(bytes)
}

/// Parse an on/off switch. Unknown values are off.
#[must_use]
pub fn parse_switch_loose(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "on" | "yes" | "true" | "enabled"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixed_memory() -> MemoryInfo {
        MemoryInfo {
            page_size: 4096,
            granularity: 4096,
        }
    }

    #[test]
    fn parse_sizes() {
        assert_eq!(parse_size_loose("65536"), Some(65536));
        assert_eq!(parse_size_loose("64k"), Some(65536));
        assert_eq!(parse_size_loose("64K"), Some(65536));
        assert_eq!(parse_size_loose("64kb"), Some(65536));
        assert_eq!(parse_size_loose(" 1m "), Some(1 << 20));
        assert_eq!(parse_size_loose("2g"), Some(2 << 30));
        assert_eq!(parse_size_loose("1_024"), Some(1024));
        assert_eq!(parse_size_loose("0"), None);
        assert_eq!(parse_size_loose(""), None);
        assert_eq!(parse_size_loose("k"), None);
        assert_eq!(parse_size_loose("bogus"), None);
        assert_eq!(parse_size_loose("-4k"), None);
    }

    #[test]
    fn parse_switches() {
        assert!(parse_switch_loose("on"));
        assert!(parse_switch_loose("TRUE"));
        assert!(parse_switch_loose("1"));
        assert!(!parse_switch_loose("off"));
        assert!(!parse_switch_loose("bogus"));
    }

    #[test]
    fn defaults_follow_memory_geometry() {
        let config = KnightConfig::for_memory(fixed_memory());
        assert_eq!(config.lump_size, MIN_LUMP_SIZE);
        assert_eq!(config.code_region_size, DEFAULT_CODE_REGION_SIZE);
        assert!(!config.lifecycle_log);

        let big = KnightConfig::for_memory(MemoryInfo {
            page_size: 4096,
            granularity: 256 * 1024,
        });
        assert_eq!(big.lump_size, 256 * 1024);
    }

    #[test]
    fn lump_size_is_page_aligned() {
        let config = KnightConfig::for_memory(fixed_memory()).with_lump_size(5000);
        assert_eq!(config.lump_size, 8192);
        let config = KnightConfig::for_memory(fixed_memory()).with_lump_size(1);
        assert_eq!(config.lump_size, 4096);
    }

    #[test]
    fn normalized_repairs_literal_configs() {
        let broken = KnightConfig {
            memory: MemoryInfo {
                page_size: 4096,
                granularity: 0,
            },
            lump_size: 0,
            code_region_size: 0,
            lifecycle_log: true,
        }
        .normalized();
        assert_eq!(broken.memory.granularity, 4096);
        assert_eq!(broken.lump_size, MIN_LUMP_SIZE);
        assert_eq!(broken.code_region_size, 0);
        assert!(broken.lifecycle_log);

        let ragged = KnightConfig {
            lump_size: 5000,
            ..KnightConfig::for_memory(fixed_memory())
        }
        .normalized();
        assert_eq!(ragged.lump_size, 8192);

        let sane = KnightConfig::for_memory(fixed_memory()).with_lump_size(128 * 1024);
        assert_eq!(sane.normalized(), sane);
    }

    #[test]
    fn lookup_overrides_defaults() {
        let config = KnightConfig::from_lookup(|name| match name {
            "KNIGHT_LUMP_SIZE" => Some("128k".to_string()),
            "KNIGHT_CODE_REGION_SIZE" => Some("0x10".to_string()),
            "KNIGHT_LIFECYCLE_LOG" => Some("on".to_string()),
            _ => None,
        });
        assert_eq!(config.lump_size, 128 * 1024);
        // Unparseable value keeps the default.
        assert_eq!(config.code_region_size, DEFAULT_CODE_REGION_SIZE);
        assert!(config.lifecycle_log);
    }

    #[test]
    fn lookup_granularity_override() {
        let page = crate::platform::page_size();
        let config = KnightConfig::from_lookup(|name| {
            (name == "KNIGHT_MAP_GRANULARITY").then(|| (page * 8).to_string())
        });
        assert_eq!(config.memory.granularity, page * 8);
        assert_eq!(config.memory.pages_per_block(), 8);
    }
}
