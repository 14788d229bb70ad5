//! Compilation configuration.
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SPECJIT_OPT_LEVEL` | Optimization level (0-3, `O0`-`O3`, or none/less/default/aggressive) | 2 |
//! | `SPECJIT_DUMP_IR` | Log the specialized module at debug level ("true"/"false") | false |
//! | `SPECJIT_VERIFY` | Verify the module after specialization ("true"/"false") | true |
//!
//! # Example
//!
//! ```rust,ignore
//! use specjit::config::{JitConfig, OptLevel};
//!
//! let config = JitConfig::from_env()?;
//!
//! let config = JitConfig::builder()
//!     .opt_level(OptLevel::Aggressive)
//!     .dump_ir(true)
//!     .build();
//! ```

use std::env;

use inkwell::OptimizationLevel;

use crate::error::ConfigError;

/// Optimization level for the lowering passes and the code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum OptLevel {
    None,
    Less,
    #[default]
    Default,
    Aggressive,
}

impl OptLevel {
    /// Parse a level from a string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "0" | "o0" | "none" => Some(OptLevel::None),
            "1" | "o1" | "less" => Some(OptLevel::Less),
            "2" | "o2" | "default" => Some(OptLevel::Default),
            "3" | "o3" | "aggressive" => Some(OptLevel::Aggressive),
            _ => None,
        }
    }

    /// Numeric level, as used in `default<On>` pass pipelines.
    pub fn as_u8(&self) -> u8 {
        match self {
            OptLevel::None => 0,
            OptLevel::Less => 1,
            OptLevel::Default => 2,
            OptLevel::Aggressive => 3,
        }
    }

    pub fn pass_pipeline(&self) -> String {
        format!("default<O{}>", self.as_u8())
    }
}

impl From<OptLevel> for OptimizationLevel {
    fn from(level: OptLevel) -> Self {
        match level {
            OptLevel::None => OptimizationLevel::None,
            OptLevel::Less => OptimizationLevel::Less,
            OptLevel::Default => OptimizationLevel::Default,
            OptLevel::Aggressive => OptimizationLevel::Aggressive,
        }
    }
}

/// Settings for one [`Jit`](crate::pipeline::Jit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JitConfig {
    /// Optimization level.
    /// Default: `OptLevel::Default` (O2).
    pub opt_level: OptLevel,

    /// Log the specialized module before code generation.
    /// Default: false.
    pub dump_ir: bool,

    /// Run the IR verifier after specialization.
    /// Default: true.
    pub verify: bool,
}

impl Default for JitConfig {
    fn default() -> Self {
        Self {
            opt_level: OptLevel::Default,
            dump_ir: false,
            verify: true,
        }
    }
}

impl JitConfig {
    pub fn builder() -> JitConfigBuilder {
        JitConfigBuilder::new()
    }

    /// Load configuration from `SPECJIT_*` environment variables.
    ///
    /// Unset variables keep their defaults; set but unparsable ones are errors.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup("SPECJIT_OPT_LEVEL") {
            config.opt_level = OptLevel::from_str(&value).ok_or(ConfigError::InvalidValue {
                key: "SPECJIT_OPT_LEVEL",
                value,
            })?;
        }
        if let Some(value) = lookup("SPECJIT_DUMP_IR") {
            config.dump_ir = parse_bool("SPECJIT_DUMP_IR", value)?;
        }
        if let Some(value) = lookup("SPECJIT_VERIFY") {
            config.verify = parse_bool("SPECJIT_VERIFY", value)?;
        }

        Ok(config)
    }
}

fn parse_bool(key: &'static str, value: String) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue { key, value }),
    }
}

/// Builder for [`JitConfig`].
#[derive(Debug, Clone, Default)]
pub struct JitConfigBuilder {
    config: JitConfig,
}

impl JitConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opt_level(mut self, level: OptLevel) -> Self {
        self.config.opt_level = level;
        self
    }

    pub fn dump_ir(mut self, enabled: bool) -> Self {
        self.config.dump_ir = enabled;
        self
    }

    pub fn verify(mut self, enabled: bool) -> Self {
        self.config.verify = enabled;
        self
    }

    pub fn build(self) -> JitConfig {
        self.config
    }
}
