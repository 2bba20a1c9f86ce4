//! Cache and rewrite rules.
//!
//! Rules are evaluated in registration order and the first regex matching the
//! request path wins. A path no rule matches is proxied transparently.

use chrono::TimeDelta;
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("invalid rule pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// With a finite cache time, a refresh window at or above it would never
    /// fire.
    #[error("cache duration must be greater than refresh duration")]
    CacheNotAboveRefresh,

    #[error("replace source must not be empty")]
    EmptySource,
}

/// Decides how long matching paths stay cached.
///
/// `cache` is the hard TTL after which the entry must be fetched again; zero
/// means it never expires. `refresh` is the window after which the entry is
/// revalidated against the origin even while still within its TTL; zero means
/// never.
#[derive(Debug)]
pub struct Rule {
    regex: Regex,
    cache: TimeDelta,
    refresh: TimeDelta,
}

impl Rule {
    pub fn new(regex: &str, cache: TimeDelta, refresh: TimeDelta) -> Result<Self, RuleError> {
        if cache > TimeDelta::zero() && cache <= refresh {
            return Err(RuleError::CacheNotAboveRefresh);
        }
        Ok(Rule {
            regex: Regex::new(regex)?,
            cache,
            refresh,
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn cache(&self) -> TimeDelta {
        self.cache
    }

    pub fn refresh(&self) -> TimeDelta {
        self.refresh
    }
}

/// Rewrites occurrences of `old` to `new` in the bodies of matching paths.
#[derive(Debug)]
pub struct ReplaceRule {
    regex: Regex,
    pattern: Vec<u8>,
    replacement: Vec<u8>,
}

impl ReplaceRule {
    pub fn new(regex: &str, old: &str, new: &str) -> Result<Self, RuleError> {
        if old.is_empty() {
            return Err(RuleError::EmptySource);
        }
        Ok(ReplaceRule {
            regex: Regex::new(regex)?,
            pattern: old.as_bytes().to_vec(),
            replacement: new.as_bytes().to_vec(),
        })
    }

    pub fn matches(&self, path: &str) -> bool {
        self.regex.is_match(path)
    }

    pub fn pattern(&self) -> &[u8] {
        &self.pattern
    }

    pub fn replacement(&self) -> &[u8] {
        &self.replacement
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_cache_not_above_refresh() {
        assert!(matches!(
            Rule::new(".*", TimeDelta::minutes(5), TimeDelta::minutes(5)),
            Err(RuleError::CacheNotAboveRefresh)
        ));
        assert!(matches!(
            Rule::new(".*", TimeDelta::minutes(5), TimeDelta::minutes(10)),
            Err(RuleError::CacheNotAboveRefresh)
        ));
    }

    #[test]
    fn test_accepts_cache_above_refresh() {
        assert!(Rule::new(".*", TimeDelta::minutes(10), TimeDelta::minutes(5)).is_ok());
    }

    #[test]
    fn test_eternal_cache_accepts_any_refresh() {
        // cache == 0 means "never expires"; the ordering constraint does not
        // apply to it.
        assert!(Rule::new(".*", TimeDelta::zero(), TimeDelta::zero()).is_ok());
        assert!(Rule::new(".*", TimeDelta::zero(), TimeDelta::hours(1)).is_ok());
    }

    #[test]
    fn test_rejects_invalid_regex() {
        assert!(matches!(
            Rule::new("(unclosed", TimeDelta::zero(), TimeDelta::zero()),
            Err(RuleError::Pattern(_))
        ));
    }

    #[test]
    fn test_replace_rejects_empty_source() {
        assert!(matches!(
            ReplaceRule::new(".*", "", "replacement"),
            Err(RuleError::EmptySource)
        ));
    }

    #[test]
    fn test_rule_matching() {
        let rule = Rule::new(r"\.iso$", TimeDelta::zero(), TimeDelta::zero()).unwrap();
        assert!(rule.matches("images/boot.iso"));
        assert!(!rule.matches("images/boot.iso.sig"));
    }
}
