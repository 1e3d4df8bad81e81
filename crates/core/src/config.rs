//! Cache and converter configuration
//!
//! The recognized options are the ordered output format list, the niceness
//! the external rescaler runs at, and the recipe template selecting the
//! converter family. Cache size limits are expressed as entry-count triples;
//! the lower GC watermark is derived from the configured upper limit.

use crate::stats::Statistics;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Percentage of the upper limits at which GC stops trimming
pub const LIMITS_LOW_HI_PERCENTAGE: u8 = 60;

/// Extra aggressiveness added to the first GC round's threshold
pub const GC_FIRST_ROUND_BIAS: u8 = 10;

/// Threshold percentage for GC rounds after a successful one
pub const GC_APPROACHING_PERCENTAGE: u8 = 20;

/// Consecutive fruitless GC rounds tolerated before giving up
pub const GC_MAX_FAIL_ROUNDS: u32 = 2;

/// Environment variable overriding the cache root directory
pub const CACHE_ROOT_ENV: &str = "ARTCACHE_ROOT";

/// One pre-scaled output the converter must produce
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputFormat {
    /// Converter format token, e.g. `png`
    pub format_spec: String,
    /// Target dimensions, e.g. `120x120`
    pub dimensions: String,
}

impl OutputFormat {
    /// Create an output format
    #[must_use]
    pub fn new(format_spec: impl Into<String>, dimensions: impl Into<String>) -> Self {
        Self {
            format_spec: format_spec.into(),
            dimensions: dimensions.into(),
        }
    }

    /// The output file name the conversion recipe writes, `<spec>@<dims>`
    #[must_use]
    pub fn filename(&self) -> String {
        format!("{}@{}", self.format_spec, self.dimensions)
    }
}

/// Converter family the recipe generator targets
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecipeTemplate {
    /// ImageMagick's `convert`
    #[default]
    ImageMagick,
    /// GraphicsMagick's `gm convert`
    GraphicsMagick,
}

impl RecipeTemplate {
    /// The converter invocation prefix for this template
    #[must_use]
    pub fn converter_command(self) -> &'static str {
        match self {
            Self::ImageMagick => "convert",
            Self::GraphicsMagick => "gm convert",
        }
    }
}

/// Converter policy: what to produce and how politely
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Ordered list of outputs each conversion produces
    pub output_formats: Vec<OutputFormat>,
    /// Niceness the rescaler runs at, clamped to `[0, 19]`
    pub niceness: u8,
    /// Converter family
    pub recipe_template: RecipeTemplate,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_formats: vec![
                OutputFormat::new("png", "120x120"),
                OutputFormat::new("png", "200x200"),
                OutputFormat::new("jpg", "400x400"),
            ],
            niceness: 19,
            recipe_template: RecipeTemplate::ImageMagick,
        }
    }
}

impl Config {
    /// Niceness clamped to the valid range
    #[must_use]
    pub fn effective_niceness(&self) -> u8 {
        self.niceness.min(19)
    }
}

/// Upper cache size limits in entry counts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheLimits {
    /// Maximum number of `(stream key, priority)` entries
    pub keys: usize,
    /// Maximum number of source directories
    pub sources: usize,
    /// Maximum number of object files
    pub objects: usize,
}

impl Default for CacheLimits {
    fn default() -> Self {
        Self {
            keys: 500,
            sources: 500,
            objects: 1500,
        }
    }
}

impl CacheLimits {
    /// The upper watermark as tier counters
    #[must_use]
    pub fn upper_watermark(&self) -> Statistics {
        Statistics::new(self.keys, self.sources, self.objects)
    }
}

/// Resolve the cache root directory
///
/// Resolution order:
/// 1. `ARTCACHE_ROOT` environment variable
/// 2. Platform cache directory + `/artcache`
///
/// # Errors
///
/// Returns an error if no platform cache directory can be determined.
pub fn default_cache_root() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CACHE_ROOT_ENV)
        && !dir.is_empty()
    {
        return Ok(PathBuf::from(dir));
    }

    let base = dirs::cache_dir()
        .ok_or_else(|| Error::configuration("could not determine cache directory"))?;

    Ok(base.join("artcache"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_formats() {
        let config = Config::default();
        let names: Vec<String> = config.output_formats.iter().map(OutputFormat::filename).collect();
        assert_eq!(names, ["png@120x120", "png@200x200", "jpg@400x400"]);
    }

    #[test]
    fn test_niceness_is_clamped() {
        let mut config = Config::default();
        assert_eq!(config.effective_niceness(), 19);
        config.niceness = 99;
        assert_eq!(config.effective_niceness(), 19);
        config.niceness = 5;
        assert_eq!(config.effective_niceness(), 5);
    }

    #[test]
    fn test_converter_command() {
        assert_eq!(RecipeTemplate::ImageMagick.converter_command(), "convert");
        assert_eq!(RecipeTemplate::GraphicsMagick.converter_command(), "gm convert");
    }

    #[test]
    fn test_limits_watermark() {
        let limits = CacheLimits::default();
        let upper = limits.upper_watermark();
        assert_eq!(upper.keys(), 500);
        assert_eq!(upper.objects(), 1500);
    }

    #[test]
    fn test_cache_root_override() {
        temp_env::with_var(CACHE_ROOT_ENV, Some("/tmp/artcache-test-root"), || {
            let root = default_cache_root().expect("cache root should resolve");
            assert_eq!(root, PathBuf::from("/tmp/artcache-test-root"));
        });
    }

    #[test]
    fn test_cache_root_default() {
        temp_env::with_var_unset(CACHE_ROOT_ENV, || {
            if let Ok(root) = default_cache_root() {
                assert!(root.ends_with("artcache"), "should end with artcache: {root:?}");
            }
        });
    }
}
