//! Functions for handling buffer pool configuration options
//!
//! Pool-wide options can be set in a `pagestore.toml` configuration file or
//! assembled programmatically; per-resource options travel with the resource
//! descriptor.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::segment_alloc::SizeClass;
use crate::versioning::VersioningType;

pub mod defaults {
    use const_format::formatcp;

    pub const DEFAULT_PHYSICAL_BUDGET_BYTES: u64 = 8 * 1024 * 1024 * 1024;
    pub const DEFAULT_SWEEPER_INTERVAL: &str = "100ms";
    pub const DEFAULT_SHARDS: usize = 64;
    pub const DEFAULT_FULL_DUMP_PERIOD: u32 = 4;

    pub const DEFAULT_REVISION_ROOT_CACHE_ENTRIES: usize = 1024;
    pub const DEFAULT_NAME_CACHE_ENTRIES: usize = 512;
    pub const DEFAULT_PATH_SUMMARY_CACHE_ENTRIES: usize = 512;

    /// Base weight limits of the two segment-backed caches, per GiB of
    /// physical budget. An 8 GiB budget yields 8x these limits.
    pub const RECORD_PAGE_CACHE_BASE_WEIGHT: u64 = 96 * 1024 * 1024;
    pub const FRAGMENT_CACHE_BASE_WEIGHT: u64 = 32 * 1024 * 1024;

    ///
    /// Default built-in configuration file.
    ///
    pub const DEFAULT_CONFIG_FILE: &str = formatcp!(
        r#"
# Initial configuration file created by 'pagestore --init'
#physical_budget_bytes = {DEFAULT_PHYSICAL_BUDGET_BYTES}
#sweeper_interval = '{DEFAULT_SWEEPER_INTERVAL}'
#shards = {DEFAULT_SHARDS}

#revision_root_cache_entries = {DEFAULT_REVISION_ROOT_CACHE_ENTRIES}
#name_cache_entries = {DEFAULT_NAME_CACHE_ENTRIES}
#path_summary_cache_entries = {DEFAULT_PATH_SUMMARY_CACHE_ENTRIES}
"#
    );
}

/// Pool-wide configuration, fixed for the lifetime of one buffer manager
/// instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConf {
    /// Upper bound on resident native memory across all size classes.
    /// Must be a positive multiple of the largest size class.
    pub physical_budget_bytes: u64,

    /// How often each sweeper task walks its shard.
    pub sweeper_interval: Duration,

    /// Number of independently locked cache shards.
    pub shards: usize,

    /// Entry caps of the object-level caches. These are deliberately literal
    /// counts: the cached objects live on the Rust heap, not in pool memory,
    /// and do not scale with the physical budget.
    pub revision_root_cache_entries: usize,
    pub name_cache_entries: usize,
    pub path_summary_cache_entries: usize,
}

impl Default for PoolConf {
    fn default() -> Self {
        PoolConf {
            physical_budget_bytes: defaults::DEFAULT_PHYSICAL_BUDGET_BYTES,
            sweeper_interval: Duration::from_millis(100),
            shards: defaults::DEFAULT_SHARDS,
            revision_root_cache_entries: defaults::DEFAULT_REVISION_ROOT_CACHE_ENTRIES,
            name_cache_entries: defaults::DEFAULT_NAME_CACHE_ENTRIES,
            path_summary_cache_entries: defaults::DEFAULT_PATH_SUMMARY_CACHE_ENTRIES,
        }
    }
}

/// On-file representation of [`PoolConf`]; every field optional so that a
/// partial file overlays the defaults.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolConfFile {
    physical_budget_bytes: Option<u64>,
    /// Humantime format, e.g. `100ms` or `1s`.
    sweeper_interval: Option<String>,
    shards: Option<usize>,
    revision_root_cache_entries: Option<usize>,
    name_cache_entries: Option<usize>,
    path_summary_cache_entries: Option<usize>,
}

impl PoolConf {
    pub fn from_toml(input: &str) -> Result<PoolConf> {
        let file: PoolConfFile =
            toml::from_str(input).context("could not parse pool configuration")?;
        let mut conf = PoolConf::default();
        if let Some(v) = file.physical_budget_bytes {
            conf.physical_budget_bytes = v;
        }
        if let Some(v) = file.sweeper_interval {
            conf.sweeper_interval = humantime::parse_duration(&v)
                .with_context(|| format!("could not parse sweeper_interval '{v}'"))?;
        }
        if let Some(v) = file.shards {
            conf.shards = v;
        }
        if let Some(v) = file.revision_root_cache_entries {
            conf.revision_root_cache_entries = v;
        }
        if let Some(v) = file.name_cache_entries {
            conf.name_cache_entries = v;
        }
        if let Some(v) = file.path_summary_cache_entries {
            conf.path_summary_cache_entries = v;
        }
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        let largest = SizeClass::largest().bytes() as u64;
        if self.physical_budget_bytes == 0 {
            bail!("physical_budget_bytes must be positive");
        }
        if self.physical_budget_bytes % largest != 0 {
            bail!(
                "physical_budget_bytes {} is not a multiple of the largest size class ({})",
                self.physical_budget_bytes,
                largest
            );
        }
        if self.shards == 0 || !self.shards.is_power_of_two() {
            bail!("shards must be a positive power of two, got {}", self.shards);
        }
        if self.sweeper_interval == Duration::ZERO {
            bail!("sweeper_interval must be positive");
        }
        Ok(())
    }

    /// Weight limit of the record-page cache, scaled linearly with the
    /// physical budget.
    pub fn record_page_cache_weight(&self) -> u64 {
        self.budget_gib() * defaults::RECORD_PAGE_CACHE_BASE_WEIGHT
    }

    /// Weight limit of the record-page-fragment cache.
    pub fn fragment_cache_weight(&self) -> u64 {
        self.budget_gib() * defaults::FRAGMENT_CACHE_BASE_WEIGHT
    }

    fn budget_gib(&self) -> u64 {
        // Round up so sub-GiB test budgets still get a non-zero weight limit.
        (self.physical_budget_bytes + (1 << 30) - 1) >> 30
    }
}

/// Per-resource configuration, chosen at resource creation and immutable
/// afterwards (the on-disk fragments depend on it).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConf {
    /// How page fragments are laid out across revisions, and therefore how a
    /// revision's view is reconstructed.
    pub versioning: VersioningType,

    /// Whether records carry a dewey-id ordering key in a second memory
    /// segment.
    #[serde(default)]
    pub dewey_ids: bool,

    /// A full page image is persisted every this-many revisions; fragments in
    /// between are deltas (ignored by [`VersioningType::Full`]).
    #[serde(default = "default_full_dump_period")]
    pub full_dump_period: u32,
}

fn default_full_dump_period() -> u32 {
    defaults::DEFAULT_FULL_DUMP_PERIOD
}

impl Default for ResourceConf {
    fn default() -> Self {
        ResourceConf {
            versioning: VersioningType::SlidingSnapshot { window: 3 },
            dewey_ids: false,
            full_dump_period: defaults::DEFAULT_FULL_DUMP_PERIOD,
        }
    }
}
