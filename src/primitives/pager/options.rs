use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::types::{Result, VnError};

/// Default page size in bytes.
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
/// Largest single clustered transfer, in bytes.
pub const DEFAULT_CLUSTER_BYTES: u64 = 64 * 1024;

/// Configuration options for a [`PagerSystem`](super::PagerSystem).
///
/// These options size the shared resources every pager draws from: the
/// page-frame pool, the scratch mapping window, and the clustering limit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PagerOptions {
    /// Size of each page in bytes (power of two, at least 512).
    pub page_size: u32,
    /// Upper bound on a clustered write, in bytes (multiple of the page size).
    pub cluster_bytes: u64,
    /// Number of page frames shared by every pager.
    pub frame_pool_pages: usize,
    /// Number of pages the scratch window can map at once.
    pub scratch_pages: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cluster_bytes: DEFAULT_CLUSTER_BYTES,
            frame_pool_pages: 16 * 1024,
            scratch_pages: 256,
        }
    }
}

impl PagerOptions {
    /// Checks the options for internal consistency.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two() || self.page_size < 512 {
            return Err(VnError::Invalid("page size must be a power of two >= 512"));
        }
        let page = u64::from(self.page_size);
        if self.cluster_bytes < page || self.cluster_bytes % page != 0 {
            return Err(VnError::Invalid(
                "cluster size must be a non-zero multiple of the page size",
            ));
        }
        if self.frame_pool_pages == 0 {
            return Err(VnError::Invalid("frame pool must hold at least one page"));
        }
        if (self.scratch_pages as u64) < self.cluster_pages() {
            return Err(VnError::Invalid(
                "scratch window must fit at least one full cluster",
            ));
        }
        Ok(())
    }

    /// Number of pages in a maximal cluster.
    pub fn cluster_pages(&self) -> u64 {
        self.cluster_bytes / u64::from(self.page_size)
    }

    /// Parses and validates options from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let options: PagerOptions = toml::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Loads and validates options from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }

    /// Serializes the options to TOML.
    pub fn to_toml_string(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}
