//! Mini-config strings.
//!
//! Model, optimizer and instance-reader options travel as compact
//! `k=v;k=v` strings on the command line (`;` or `,` separated). They are
//! parsed once into a [`MiniConfig`] and read back with typed getters.

use std::collections::BTreeMap;

use super::error::Error;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MiniConfig {
    entries: BTreeMap<String, String>,
}

impl MiniConfig {
    /// Parse a `k=v;k=v` string. Empty input yields an empty config.
    pub fn parse(s: &str) -> Result<Self, Error> {
        let mut entries = BTreeMap::new();
        for part in s.split([';', ',']) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (k, v) = part.split_once('=').ok_or_else(|| Error::Entry(part.into()))?;
            let k = k.trim();
            let v = v.trim();
            if k.is_empty() || v.is_empty() {
                return Err(Error::Entry(part.into()));
            }
            entries.insert(k.to_string(), v.to_string());
        }
        Ok(Self { entries })
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    pub fn insert(&mut self, key: impl ToString, value: impl ToString) {
        self.entries.insert(key.to_string(), value.to_string());
    }

    /// Typed getter; `option` names the flag in errors.
    pub fn get_parsed<T: std::str::FromStr>(
        &self,
        key: &str,
        option: &'static str,
    ) -> Result<Option<T>, Error> {
        match self.entries.get(key) {
            Some(v) => v
                .parse::<T>()
                .map(Some)
                .map_err(|_| Error::invalid(option, v)),
            None => Ok(None),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse() {
        let config = MiniConfig::parse("dim=100;k=8").unwrap();
        assert_eq!(config.get("dim"), Some("100"));
        assert_eq!(config.get_parsed::<usize>("k", "k").unwrap(), Some(8));
        assert_eq!(config.get("missing"), None);
    }

    #[test]
    fn test_parse_comma_and_whitespace() {
        let config = MiniConfig::parse(" batch=64 , alpha=0.01 ").unwrap();
        assert_eq!(config.get_parsed::<usize>("batch", "batch").unwrap(), Some(64));
        assert_eq!(config.get("alpha"), Some("0.01"));
    }

    #[test]
    fn test_parse_empty() {
        assert!(MiniConfig::parse("").unwrap().is_empty());
        assert!(MiniConfig::parse(";;").unwrap().is_empty());
    }

    #[test]
    fn test_parse_malformed() {
        assert!(MiniConfig::parse("dim").is_err());
        assert!(MiniConfig::parse("=5").is_err());
        let err = MiniConfig::parse("k=").unwrap_err();
        assert!(matches!(err, Error::Entry(_)));
    }

    #[test]
    fn test_bad_typed_value() {
        let config = MiniConfig::parse("dim=abc").unwrap();
        assert!(config.get_parsed::<usize>("dim", "model_config").is_err());
    }
}
