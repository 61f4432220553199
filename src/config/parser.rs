//! Configuration file parser
//!
//! One `parameter value` pair per line; `#` starts a comment line.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::str::FromStr;

use super::{Config, MAX_IDENTITY};

/// Failure while reading a configuration file
#[derive(Debug, thiserror::Error)]
pub enum ConfigParseError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Line without a `parameter value` pair
    #[error("Invalid line format at line {0}: {1}")]
    Format(usize, String),

    /// Parameter, line number, offending value
    #[error("Invalid value for parameter '{0}' at line {1}: {2}")]
    Value(String, usize, String),
}

pub fn parse_config_file(path: &Path) -> Result<Config, ConfigParseError> {
    let file = File::open(path)?;
    parse_lines(BufReader::new(file).lines())
}

pub fn parse_config_str(text: &str) -> Result<Config, ConfigParseError> {
    parse_lines(text.lines().map(|l| Ok(l.to_string())))
}

fn parse_lines<I>(lines: I) -> Result<Config, ConfigParseError>
where
    I: Iterator<Item = io::Result<String>>,
{
    let mut config = Config::default();

    for (number, line) in (1..).zip(lines) {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let (param, value) = line
            .split_once(char::is_whitespace)
            .ok_or_else(|| ConfigParseError::Format(number, line.to_string()))?;
        apply(&mut config, &param.to_lowercase(), value.trim(), number)?;
    }

    Ok(config)
}

fn apply(config: &mut Config, param: &str, value: &str, line: usize) -> Result<(), ConfigParseError> {
    match param {
        "call-depth" => config.vm.call_depth = parse_value(param, value, line)?,
        "instruction-limit" => config.vm.instruction_limit = parse_value(param, value, line)?,
        "redirect-depth" => config.vm.redirect_depth = parse_value(param, value, line)?,
        "default-identity" => config.identity.default_level = parse_level(param, value, line)?,
        "privileged-identity" => config.identity.privileged_level = parse_level(param, value, line)?,
        "loglevel" => config.log_level = parse_value(param, value, line)?,
        _ => tracing::warn!(param, line, "unknown configuration parameter, skipping"),
    }
    Ok(())
}

fn bad_value(param: &str, line: usize, value: &str) -> ConfigParseError {
    ConfigParseError::Value(param.to_string(), line, value.to_string())
}

fn parse_value<T: FromStr>(param: &str, value: &str, line: usize) -> Result<T, ConfigParseError> {
    value.parse().map_err(|_| bad_value(param, line, value))
}

/// Identity levels stop at `MAX_IDENTITY`
fn parse_level(param: &str, value: &str, line: usize) -> Result<u8, ConfigParseError> {
    match parse_value::<u8>(param, value, line)? {
        level if level <= MAX_IDENTITY => Ok(level),
        _ => Err(bad_value(param, line, value)),
    }
}
