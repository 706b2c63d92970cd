//! Field-by-field parsing of key/value property sources.

use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;

use thiserror::Error;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A required key has no value.
    #[error("missing required key `{0}`")]
    Missing(&'static str),
    /// A value could not be parsed.
    #[error("invalid value `{value}` for `{key}`: {reason}")]
    Invalid {
        /// Offending key.
        key: String,
        /// Raw value.
        value: String,
        /// What was expected.
        reason: String,
    },
    /// Parsed values are inconsistent.
    #[error("invalid configuration: {0}")]
    Validation(String),
    /// Structured source could not be parsed.
    #[error("parse error: {0}")]
    Parse(String),
}

/// Read-only view over string properties with typed getters.
pub(crate) struct Properties<'a> {
    source: &'a HashMap<String, String>,
}

impl<'a> Properties<'a> {
    pub(crate) const fn new(source: &'a HashMap<String, String>) -> Self {
        Self { source }
    }

    pub(crate) fn string(&self, key: &str) -> Option<String> {
        self.source.get(key).map(|v| v.trim().to_owned())
    }

    pub(crate) fn parse<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.source.get(key) else {
            return Ok(None);
        };
        raw.trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, raw, e.to_string()))
    }

    /// Comma-separated list, e.g. `972,0`.
    pub(crate) fn list<T>(&self, key: &str) -> Result<Option<Vec<T>>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        let Some(raw) = self.source.get(key) else {
            return Ok(None);
        };
        split(raw)
            .map(|item| item.parse().map_err(|e: T::Err| invalid(key, raw, e.to_string())))
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    pub(crate) fn set<T>(&self, key: &str) -> Result<Option<BTreeSet<T>>, ConfigError>
    where
        T: FromStr + Ord,
        T::Err: std::fmt::Display,
    {
        Ok(self.list(key)?.map(|v| v.into_iter().collect()))
    }

    /// Comma-separated `name:value` pairs, e.g. `any:1,report:4`.
    pub(crate) fn map(&self, key: &str) -> Result<Option<HashMap<String, u32>>, ConfigError> {
        let Some(raw) = self.source.get(key) else {
            return Ok(None);
        };
        let mut out = HashMap::new();
        for item in split(raw) {
            let (name, value) = item
                .split_once(':')
                .ok_or_else(|| invalid(key, raw, format!("expected name:value, got `{item}`")))?;
            let value = value
                .trim()
                .parse()
                .map_err(|e: std::num::ParseIntError| invalid(key, raw, e.to_string()))?;
            out.insert(name.trim().to_owned(), value);
        }
        Ok(Some(out))
    }
}

fn split(raw: &str) -> impl Iterator<Item = &str> {
    raw.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn invalid(key: &str, value: &str, reason: String) -> ConfigError {
    ConfigError::Invalid {
        key: key.to_owned(),
        value: value.to_owned(),
        reason,
    }
}

/// Collect `PREFIX`-ed environment variables, mapping each to the known key it
/// names case-insensitively (`DODO_MAXTHREADS` -> `maxThreads`). Loads `.env`
/// first if one exists.
pub(crate) fn env_properties(prefix: &str, known_keys: &[&str]) -> HashMap<String, String> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            tracing::warn!("failed to load .env: {e}");
        }
    }
    std::env::vars()
        .filter_map(|(name, value)| {
            let rest = name.strip_prefix(prefix)?;
            let key = known_keys
                .iter()
                .find(|k| k.eq_ignore_ascii_case(rest))?;
            Some(((*key).to_owned(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn source(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect()
    }

    #[test]
    fn test_parse_and_lists() {
        let src = source(&[("n", " 12 "), ("groups", "972, 0"), ("limits", "any:1,report:4")]);
        let props = Properties::new(&src);
        assert_eq!(props.parse::<u32>("n").unwrap(), Some(12));
        assert_eq!(props.list::<i32>("groups").unwrap(), Some(vec![972, 0]));
        let limits = props.map("limits").unwrap().unwrap();
        assert_eq!(limits["report"], 4);
        assert_eq!(props.parse::<u32>("absent").unwrap(), None);
    }

    #[test]
    fn test_invalid_value_names_key() {
        let src = source(&[("n", "twelve"), ("limits", "any")]);
        let props = Properties::new(&src);
        let err = props.parse::<u32>("n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { ref key, .. } if key == "n"));
        assert!(props.map("limits").is_err());
    }
}
