//! Engine configuration.
//!
//! Every setting has a default and can be overridden from the environment:
//!
//! - `RACETRAP_RUNS` - number of rounds (0 = no limit)
//! - `RACETRAP_TIME_LIMIT_MS` - wall-clock budget, used when no run limit is set
//! - `RACETRAP_SELECTOR` - `random` or `buckets:2,1,3`
//! - `RACETRAP_SEED` - seed for the random selector
//! - `RACETRAP_STACK_SIZE` - bytes of stack per thread
//! - `RACETRAP_EXCLUDE` - comma list of extra crates or symbol prefixes that
//!   must never be instrumented

use std::env;

use racetrap_elf::SymbolFilter;

use crate::error::EngineError;
use crate::selector::{BucketSelector, RandomSelector, ThreadSelector};

pub const DEFAULT_STACK_SIZE: usize = 8 * 1024 * 1024;
pub const MIN_STACK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorConfig {
    Random { seed: Option<u64> },
    Buckets(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub runs: u64,
    pub time_limit_ms: u64,
    pub selector: SelectorConfig,
    pub stack_size: usize,
    pub exclude: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            runs: 0,
            time_limit_ms: 0,
            selector: SelectorConfig::Random { seed: None },
            stack_size: DEFAULT_STACK_SIZE,
            exclude: Vec::new(),
        }
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, EngineError> {
    value.trim().parse().map_err(|_| EngineError::Config(format!("{}: expected a number, got {:?}", key, value)))
}

/// Parse `random` or `buckets:a,b,c`.
pub fn parse_selector(value: &str) -> Result<SelectorConfig, EngineError> {
    let value = value.trim();
    if value == "random" {
        return Ok(SelectorConfig::Random { seed: None });
    }
    let Some(list) = value.strip_prefix("buckets:") else {
        return Err(EngineError::Config(format!("unknown selector {:?}", value)));
    };
    let buckets = list
        .split(',')
        .map(|b| parse_number::<u32>("bucket", b))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(SelectorConfig::Buckets(buckets))
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from a variable lookup; `from_env` with an injectable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, EngineError> {
        let mut config = Self::default();
        if let Some(v) = lookup("RACETRAP_RUNS") {
            config.runs = parse_number("RACETRAP_RUNS", &v)?;
        }
        if let Some(v) = lookup("RACETRAP_TIME_LIMIT_MS") {
            config.time_limit_ms = parse_number("RACETRAP_TIME_LIMIT_MS", &v)?;
        }
        if let Some(v) = lookup("RACETRAP_SELECTOR") {
            config.selector = parse_selector(&v)?;
        }
        if let Some(v) = lookup("RACETRAP_SEED") {
            let seed = parse_number("RACETRAP_SEED", &v)?;
            match &mut config.selector {
                SelectorConfig::Random { seed: slot } => *slot = Some(seed),
                SelectorConfig::Buckets(_) => {
                    return Err(EngineError::Config("RACETRAP_SEED only applies to the random selector".to_string()))
                }
            }
        }
        if let Some(v) = lookup("RACETRAP_STACK_SIZE") {
            config.stack_size = parse_number("RACETRAP_STACK_SIZE", &v)?;
        }
        if let Some(v) = lookup("RACETRAP_EXCLUDE") {
            config.exclude = v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect();
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.stack_size < MIN_STACK_SIZE || self.stack_size % 16 != 0 {
            return Err(EngineError::Config(format!(
                "stack size {} must be a multiple of 16 and at least {}",
                self.stack_size, MIN_STACK_SIZE
            )));
        }
        if let SelectorConfig::Buckets(buckets) = &self.selector {
            if buckets.is_empty() {
                return Err(EngineError::Config("bucket list is empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn with_runs(mut self, runs: u64) -> Self {
        self.runs = runs;
        self
    }

    pub fn with_time_limit_ms(mut self, ms: u64) -> Self {
        self.time_limit_ms = ms;
        self
    }

    pub fn with_selector(mut self, selector: SelectorConfig) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_stack_size(mut self, bytes: usize) -> Self {
        self.stack_size = bytes;
        self
    }

    pub fn excluding(mut self, name: impl Into<String>) -> Self {
        self.exclude.push(name.into());
        self
    }

    pub fn build_selector(&self) -> Box<dyn ThreadSelector> {
        match &self.selector {
            SelectorConfig::Random { seed: Some(seed) } => Box::new(RandomSelector::with_seed(*seed)),
            SelectorConfig::Random { seed: None } => Box::new(RandomSelector::from_entropy()),
            SelectorConfig::Buckets(buckets) => Box::new(BucketSelector::new(buckets.clone())),
        }
    }

    pub fn symbol_filter(&self) -> SymbolFilter {
        let mut filter = SymbolFilter::default();
        for name in &self.exclude {
            filter.exclude(name);
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.stack_size, DEFAULT_STACK_SIZE);
    }

    #[test]
    fn test_full_environment() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("RACETRAP_RUNS", "25"),
            ("RACETRAP_TIME_LIMIT_MS", "1500"),
            ("RACETRAP_SEED", "99"),
            ("RACETRAP_STACK_SIZE", "131072"),
            ("RACETRAP_EXCLUDE", "helpers, vendored_"),
        ]))
        .unwrap();
        assert_eq!(config.runs, 25);
        assert_eq!(config.time_limit_ms, 1500);
        assert_eq!(config.selector, SelectorConfig::Random { seed: Some(99) });
        assert_eq!(config.stack_size, 131072);
        assert_eq!(config.exclude, vec!["helpers", "vendored_"]);
        assert_eq!(config.build_selector().describe(), "random(seed=99)");
    }

    #[test]
    fn test_bucket_selector() {
        let config = EngineConfig::from_lookup(lookup(&[("RACETRAP_SELECTOR", "buckets:2,1,3")])).unwrap();
        assert_eq!(config.selector, SelectorConfig::Buckets(vec![2, 1, 3]));
        assert_eq!(config.build_selector().describe(), "buckets(2,1,3)");
    }

    #[test]
    fn test_invalid_values() {
        assert!(matches!(EngineConfig::from_lookup(lookup(&[("RACETRAP_RUNS", "many")])), Err(EngineError::Config(_))));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("RACETRAP_SELECTOR", "fair")])),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("RACETRAP_SELECTOR", "buckets:1,x")])),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("RACETRAP_SELECTOR", "buckets:1"), ("RACETRAP_SEED", "3")])),
            Err(EngineError::Config(_))
        ));
        assert!(matches!(
            EngineConfig::from_lookup(lookup(&[("RACETRAP_STACK_SIZE", "1000")])),
            Err(EngineError::Config(_))
        ));
    }

    #[test]
    fn test_symbol_filter_uses_exclusions() {
        let config = EngineConfig::default().excluding("selftest");
        let filter = config.symbol_filter();
        assert_eq!(filter.classify("_ZN8selftest6worker17h01E"), racetrap_elf::FunctionKind::Library);
    }
}
