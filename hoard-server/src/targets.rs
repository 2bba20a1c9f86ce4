//! Assembles the worker and its targets from the loaded configuration.

use crate::config::{CacheConfig, RuleConfig, RuleSetConfig, ServerConfig, TransportConfig};
use anyhow::Context;
use chrono::TimeDelta;
use hoard::proxy::{TargetConfig, Transport, Worker};
use hoard::util::duration::parse_duration_from_str;
use std::collections::HashMap;
use tracing::info;

/// Opens the storage backend and binds every configured cache target.
///
/// All validation errors (bad regexes, inverted cache/refresh durations,
/// unknown ruleset references, duplicate names) surface here and are fatal.
pub fn build_worker(config: &ServerConfig) -> anyhow::Result<Worker> {
    let worker = Worker::open(&config.backend)
        .with_context(|| format!("failed to open storage at {}", config.backend))?;

    let mut names: Vec<&String> = config.caches.keys().collect();
    names.sort();
    for name in names {
        let cache = &config.caches[name];
        let target = build_target(name, cache, &config.rules)?;
        info!(name = %name, urls = ?cache.urls, "binding reverse proxy target");
        worker
            .bind(name, target)
            .with_context(|| format!("failed to bind target {name}"))?;
    }
    Ok(worker)
}

fn build_target(
    name: &str,
    cache: &CacheConfig,
    rulesets: &HashMap<String, RuleSetConfig>,
) -> anyhow::Result<TargetConfig> {
    let mut target = TargetConfig::new(&cache.urls);
    if let Some(transport) = &cache.transport {
        target.set_transport(build_transport(name, transport)?);
    }
    for include in &cache.rules_include {
        let ruleset = rulesets.get(include).with_context(|| {
            format!("target {name} references unknown ruleset {include}")
        })?;
        for rule in &ruleset.rules {
            add_rule(&mut target, name, rule)?;
        }
    }
    for rule in &cache.rules {
        add_rule(&mut target, name, rule)?;
    }
    for replace in &cache.replaces {
        target
            .add_replace(&replace.regex, &replace.old, &replace.new)
            .with_context(|| format!("target {name}: invalid replace {:?}", replace.regex))?;
    }
    Ok(target)
}

fn build_transport(name: &str, config: &TransportConfig) -> anyhow::Result<Transport> {
    let connect_timeout = match &config.timeout {
        Some(value) => Some(parse_duration_from_str(value).with_context(|| {
            format!("target {name}: invalid transport timeout {value:?}")
        })?),
        None => None,
    };
    let mut headers: Vec<(String, String)> = config
        .headers
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    headers.sort();
    Ok(Transport {
        proxy: config.proxy.clone(),
        user_agent: config.ua.clone(),
        connect_timeout,
        headers,
    })
}

fn add_rule(target: &mut TargetConfig, name: &str, rule: &RuleConfig) -> anyhow::Result<()> {
    let ttl = parse_delta(&rule.ttl)
        .with_context(|| format!("target {name}: invalid ttl {:?}", rule.ttl))?;
    let refresh = parse_delta(&rule.refresh)
        .with_context(|| format!("target {name}: invalid refresh {:?}", rule.refresh))?;
    target
        .add_rule(&rule.regex, ttl, refresh)
        .with_context(|| format!("target {name}: invalid rule {:?}", rule.regex))?;
    Ok(())
}

pub fn parse_delta(value: &str) -> anyhow::Result<TimeDelta> {
    let duration = parse_duration_from_str(value)?;
    TimeDelta::from_std(duration).context("duration out of range")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplaceConfig;
    use tempfile::tempdir;

    fn base_config(backend: &str) -> ServerConfig {
        ServerConfig {
            bind: "127.0.0.1:0".to_string(),
            backend: backend.to_string(),
            gc: crate::config::GcConfig {
                meta: "10s".to_string(),
                blob: "24h".to_string(),
            },
            page: None,
            monitor: None,
            rules: HashMap::new(),
            caches: HashMap::new(),
        }
    }

    fn simple_cache(urls: &[&str]) -> CacheConfig {
        CacheConfig {
            urls: urls.iter().map(|s| s.to_string()).collect(),
            rules_include: Vec::new(),
            rules: Vec::new(),
            replaces: Vec::new(),
            transport: None,
        }
    }

    fn rule(regex: &str, ttl: &str, refresh: &str) -> RuleConfig {
        RuleConfig {
            regex: regex.to_string(),
            ttl: ttl.to_string(),
            refresh: refresh.to_string(),
        }
    }

    #[test]
    fn test_builds_worker_with_targets_and_rulesets() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path().to_str().unwrap());
        config.rules.insert(
            "archives".to_string(),
            RuleSetConfig {
                rules: vec![rule(r"\.tar\.gz$", "0", "0")],
            },
        );
        let mut cache = simple_cache(&["http://origin"]);
        cache.rules_include.push("archives".to_string());
        cache.rules.push(rule(".*", "2h", "1h"));
        cache.replaces.push(ReplaceConfig {
            regex: r"\.list$".to_string(),
            old: "upstream".to_string(),
            new: "mirror".to_string(),
        });
        config.caches.insert("debian".to_string(), cache);

        let worker = build_worker(&config).unwrap();
        assert!(worker.route("/debian/pool/pkg.deb").is_some());
    }

    #[test]
    fn test_unknown_ruleset_reference_is_fatal() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path().to_str().unwrap());
        let mut cache = simple_cache(&["http://origin"]);
        cache.rules_include.push("nonexistent".to_string());
        config.caches.insert("debian".to_string(), cache);

        let err = build_worker(&config).unwrap_err();
        assert!(err.to_string().contains("unknown ruleset"));
    }

    #[test]
    fn test_inverted_cache_refresh_is_fatal() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path().to_str().unwrap());
        let mut cache = simple_cache(&["http://origin"]);
        cache.rules.push(rule(".*", "1h", "2h"));
        config.caches.insert("debian".to_string(), cache);
        assert!(build_worker(&config).is_err());
    }

    #[test]
    fn test_invalid_duration_is_fatal() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path().to_str().unwrap());
        let mut cache = simple_cache(&["http://origin"]);
        cache.rules.push(rule(".*", "two hours", "0"));
        config.caches.insert("debian".to_string(), cache);
        assert!(build_worker(&config).is_err());
    }

    #[test]
    fn test_transport_settings_are_applied() {
        let dir = tempdir().unwrap();
        let mut config = base_config(dir.path().to_str().unwrap());
        let mut cache = simple_cache(&["http://origin"]);
        cache.transport = Some(TransportConfig {
            proxy: None,
            ua: Some("hoard/1.0".to_string()),
            timeout: Some("5s".to_string()),
            headers: HashMap::from([("X-Token".to_string(), "secret".to_string())]),
        });
        config.caches.insert("debian".to_string(), cache);
        build_worker(&config).unwrap();
    }
}
