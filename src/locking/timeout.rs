// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::time::Duration;

/// Represents the resolved wait budget for a lease acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseTimeoutValue {
    Finite(Duration),
    Infinite,
}

impl LeaseTimeoutValue {
    pub const fn from_secs(seconds: u64) -> Self {
        Self::Finite(Duration::from_secs(seconds))
    }

    pub const fn from_millis(millis: u64) -> Self {
        Self::Finite(Duration::from_millis(millis))
    }

    pub fn as_duration(&self) -> Duration {
        match self {
            LeaseTimeoutValue::Finite(duration) => *duration,
            LeaseTimeoutValue::Infinite => Duration::MAX,
        }
    }

    pub fn is_infinite(&self) -> bool {
        matches!(self, LeaseTimeoutValue::Infinite)
    }
}

impl fmt::Display for LeaseTimeoutValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseTimeoutValue::Infinite => f.write_str("infinite"),
            LeaseTimeoutValue::Finite(duration) => write!(f, "{}s", duration.as_secs()),
        }
    }
}

/// Source precedence used when resolving the effective acquire timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseTimeoutSource {
    #[default]
    Default,
    Config,
    Environment,
}

impl fmt::Display for LeaseTimeoutSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LeaseTimeoutSource::Default => "built-in default",
            LeaseTimeoutSource::Config => "configuration file",
            LeaseTimeoutSource::Environment => "environment variable",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseTimeoutResolution {
    pub value: LeaseTimeoutValue,
    pub source: LeaseTimeoutSource,
}

/// Error produced when parsing a timeout override fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseTimeoutParseError {
    message: String,
}

impl fmt::Display for LeaseTimeoutParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LeaseTimeoutParseError {}

impl LeaseTimeoutParseError {
    fn invalid_value(value: &str) -> Self {
        Self {
            message: format!(
                "Acquire timeout value '{value}' is invalid. Use an integer number of seconds or \
                 the word 'infinite'."
            ),
        }
    }
}

/// Parses an acquire-timeout override originating from environment or configuration.
pub fn parse_timeout_override(value: &str) -> Result<LeaseTimeoutValue, LeaseTimeoutParseError> {
    let trimmed = value.trim();
    if trimmed.eq_ignore_ascii_case("infinite") {
        return Ok(LeaseTimeoutValue::Infinite);
    }

    if let Ok(seconds) = trimmed.parse::<u64>() {
        return Ok(LeaseTimeoutValue::from_secs(seconds));
    }

    Err(LeaseTimeoutParseError::invalid_value(trimmed))
}

/// Resolves the effective timeout based on env > config > default precedence.
pub struct LeaseTimeoutResolver<'a> {
    env_override: Option<&'a str>,
    config_value: LeaseTimeoutValue,
    default_value: LeaseTimeoutValue,
}

impl<'a> LeaseTimeoutResolver<'a> {
    pub fn new(
        env_override: Option<&'a str>,
        config_value: LeaseTimeoutValue,
        default_value: LeaseTimeoutValue,
    ) -> Self {
        Self {
            env_override,
            config_value,
            default_value,
        }
    }

    pub fn resolve(self) -> Result<LeaseTimeoutResolution, LeaseTimeoutParseError> {
        if let Some(env_value) = self.env_override {
            let value = parse_timeout_override(env_value)?;
            return Ok(LeaseTimeoutResolution {
                value,
                source: LeaseTimeoutSource::Environment,
            });
        }

        if self.config_value != self.default_value {
            return Ok(LeaseTimeoutResolution {
                value: self.config_value,
                source: LeaseTimeoutSource::Config,
            });
        }

        Ok(LeaseTimeoutResolution {
            value: self.default_value,
            source: LeaseTimeoutSource::Default,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_numeric_values() {
        assert_eq!(
            parse_timeout_override("42").unwrap(),
            LeaseTimeoutValue::from_secs(42)
        );
        assert_eq!(
            parse_timeout_override("0").unwrap(),
            LeaseTimeoutValue::from_secs(0)
        );
    }

    #[test]
    fn parse_infinite_keyword() {
        assert_eq!(
            parse_timeout_override("infinite").unwrap(),
            LeaseTimeoutValue::Infinite
        );
        assert_eq!(
            parse_timeout_override("Infinite").unwrap(),
            LeaseTimeoutValue::Infinite
        );
    }

    #[test]
    fn parse_rejects_invalid_input() {
        let err = parse_timeout_override("soon").unwrap_err();
        assert!(
            err.to_string()
                .contains("Use an integer number of seconds or the word 'infinite'")
        );
    }

    #[test]
    fn resolver_prefers_environment() {
        let default = LeaseTimeoutValue::from_secs(600);
        let config = LeaseTimeoutValue::from_secs(120);
        let resolution = LeaseTimeoutResolver::new(Some("30"), config, default)
            .resolve()
            .unwrap();
        assert_eq!(resolution.source, LeaseTimeoutSource::Environment);
        assert_eq!(resolution.value, LeaseTimeoutValue::from_secs(30));
    }

    #[test]
    fn resolver_config_vs_default() {
        let default = LeaseTimeoutValue::from_secs(600);
        let config = LeaseTimeoutValue::from_secs(45);
        let resolution = LeaseTimeoutResolver::new(None, config, default)
            .resolve()
            .unwrap();
        assert_eq!(resolution.source, LeaseTimeoutSource::Config);
        assert_eq!(resolution.value, LeaseTimeoutValue::from_secs(45));
    }

    #[test]
    fn resolver_defaults_when_config_matches() {
        let default = LeaseTimeoutValue::from_secs(600);
        let resolution = LeaseTimeoutResolver::new(None, default, default)
            .resolve()
            .unwrap();
        assert_eq!(resolution.source, LeaseTimeoutSource::Default);
        assert_eq!(resolution.value, default);
    }
}
