//! Configuration module for vmhook
//!
//! Provides a centralized configuration system that supports both
//! configuration files and command-line arguments.

mod cli;
mod parser;

pub use cli::{parse_args, parse_cli_args, print_help, CliAction, CliArgs};
pub use parser::{parse_config_file, parse_config_str, ConfigParseError};

use crate::interp::VmLimits;
use std::path::PathBuf;
use std::str::FromStr;

/// Highest identity level an execution context can hold
pub const MAX_IDENTITY: u8 = 8;

/// Main configuration structure
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Interpreter resource limits
    pub vm: VmConfig,

    /// Identity levels
    pub identity: IdentityConfig,

    /// Log level
    pub log_level: LogLevel,
}

/// Interpreter resource limits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    /// Maximum nested call depth
    pub call_depth: usize,

    /// Instructions per top-level call (0 = unlimited)
    pub instruction_limit: u64,

    /// Closure redirects followed for one call
    pub redirect_depth: usize,
}

/// Identity level defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityConfig {
    /// Level a context holds until it sets its own
    pub default_level: u8,

    /// Level required by script-surface mutators
    pub privileged_level: u8,
}

/// Log level configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - most verbose
    Debug,

    /// Verbose level
    Verbose,

    /// Notice level - default
    Notice,

    /// Warning level
    Warning,
}

impl LogLevel {
    /// Directive understood by `tracing_subscriber::EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "trace",
            LogLevel::Verbose => "debug",
            LogLevel::Notice => "info",
            LogLevel::Warning => "warn",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Verbose => "verbose",
            LogLevel::Notice => "notice",
            LogLevel::Warning => "warning",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "verbose" => Ok(LogLevel::Verbose),
            "notice" => Ok(LogLevel::Notice),
            "warning" => Ok(LogLevel::Warning),
            _ => Err(()),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            vm: VmConfig::default(),
            identity: IdentityConfig::default(),
            log_level: LogLevel::Notice,
        }
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        let limits = VmLimits::default();
        VmConfig {
            call_depth: limits.call_depth,
            instruction_limit: limits.instruction_limit,
            redirect_depth: limits.redirect_depth,
        }
    }
}

impl Default for IdentityConfig {
    fn default() -> Self {
        IdentityConfig {
            default_level: 2,
            privileged_level: 2,
        }
    }
}

impl VmConfig {
    pub fn limits(&self) -> VmLimits {
        VmLimits {
            call_depth: self.call_depth,
            instruction_limit: self.instruction_limit,
            redirect_depth: self.redirect_depth,
        }
    }
}

impl Config {
    /// Load configuration from a file
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        Ok(parse_config_file(&path)?)
    }

    /// Apply command-line arguments to override config
    pub fn apply_cli_args(&mut self, args: &CliArgs) -> Result<(), ConfigError> {
        if let Some(level) = &args.loglevel {
            self.log_level = level
                .parse()
                .map_err(|_| ConfigError::Other(format!("unknown log level '{}'", level)))?;
        }
        Ok(())
    }

    /// Get a configuration parameter by name
    pub fn get(&self, param: &str) -> Option<String> {
        match param {
            "call-depth" => Some(self.vm.call_depth.to_string()),
            "instruction-limit" => Some(self.vm.instruction_limit.to_string()),
            "redirect-depth" => Some(self.vm.redirect_depth.to_string()),
            "default-identity" => Some(self.identity.default_level.to_string()),
            "privileged-identity" => Some(self.identity.privileged_level.to_string()),
            "loglevel" => Some(self.log_level.as_str().to_string()),
            _ => None,
        }
    }
}

/// Errors that can occur during configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Configuration file parse error
    #[error("Failed to parse config: {0}")]
    Parse(#[from] ConfigParseError),

    /// Other errors
    #[error("Configuration error: {0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.identity.default_level, 2);
        assert_eq!(config.vm.limits(), VmLimits::default());
        assert_eq!(config.get("loglevel").as_deref(), Some("notice"));
    }

    #[test]
    fn test_cli_overrides_log_level() {
        let mut config = Config::default();
        let args = CliArgs { loglevel: Some("debug".into()), ..CliArgs::default() };
        config.apply_cli_args(&args).unwrap();
        assert_eq!(config.log_level, LogLevel::Debug);

        let bad = CliArgs { loglevel: Some("loud".into()), ..CliArgs::default() };
        assert!(config.apply_cli_args(&bad).is_err());
    }
}
