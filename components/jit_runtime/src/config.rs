//! Runtime configuration.
//!
//! The caching thresholds and the pool size are tunables rather than fixed
//! constants. Defaults keep the one-miss grace period and a small bounded
//! polymorphic list.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::stub_info::MAX_POLYMORPHIC_CAPACITY;
use memory_manager::{default_pool_size, ALLOCATION_GRANULE};

/// What the runtime does when the executable pool cannot fit new code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Fail the compile and keep running without the code
    Soft,
    /// Reclaim dead code, retry once, abort if still full
    Hard,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The JSON text could not be parsed
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// A value is out of range
    #[error("invalid configuration value for `{field}`: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// Why it was rejected
        reason: String,
    },
}

/// Tunables for one VM instance.
///
/// # Example
///
/// ```
/// use jit_runtime::{AllocationPolicy, JitConfig};
///
/// let config = JitConfig::from_json(r#"{ "pool_size": 65536, "allocation_policy": "soft" }"#).unwrap();
/// assert_eq!(config.pool_size, 65536);
/// assert_eq!(config.allocation_policy, AllocationPolicy::Soft);
/// assert_eq!(config.call_link_threshold, 1);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitConfig {
    /// Executable pool size in bytes, rounded up to whole pages
    pub pool_size: usize,
    /// Behaviour on pool exhaustion during compilation
    pub allocation_policy: AllocationPolicy,
    /// Visits a call site must have seen before it is linked
    pub call_link_threshold: u32,
    /// Visits an access site must have seen before it is first repatched
    pub stub_repatch_threshold: u32,
    /// Maximum entries in a polymorphic access list
    pub polymorphic_list_capacity: usize,
    /// Frame depth treated as stack overflow
    pub max_call_depth: usize,
    /// Largest index put-by-val may grow an array to
    pub max_array_growth: u32,
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            pool_size: default_pool_size(),
            allocation_policy: AllocationPolicy::Hard,
            call_link_threshold: 1,
            stub_repatch_threshold: 1,
            polymorphic_list_capacity: 4,
            max_call_depth: 10_000,
            max_array_growth: 1 << 24,
        }
    }
}

impl JitConfig {
    /// Parses and validates a JSON configuration. Missing fields take
    /// their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: JitConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Returns a default configuration with a smaller pool, for tests and
    /// embedders that only need a little code space.
    pub fn with_pool_size(pool_size: usize) -> Self {
        JitConfig {
            pool_size,
            ..Self::default()
        }
    }

    /// Checks every field is in range.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pool_size < ALLOCATION_GRANULE {
            return Err(invalid(
                "pool_size",
                format!("must be at least {ALLOCATION_GRANULE} bytes"),
            ));
        }
        if self.call_link_threshold == 0 {
            return Err(invalid("call_link_threshold", "must be at least 1"));
        }
        if self.stub_repatch_threshold == 0 {
            return Err(invalid("stub_repatch_threshold", "must be at least 1"));
        }
        if self.polymorphic_list_capacity == 0
            || self.polymorphic_list_capacity > MAX_POLYMORPHIC_CAPACITY
        {
            return Err(invalid(
                "polymorphic_list_capacity",
                format!("must be between 1 and {MAX_POLYMORPHIC_CAPACITY}"),
            ));
        }
        if self.max_call_depth == 0 {
            return Err(invalid("max_call_depth", "must be at least 1"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}
