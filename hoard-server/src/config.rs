use config::builder::DefaultState;
use config::{Config, ConfigBuilder, ConfigError, Environment, File, Map, Source};
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

/// Top-level server configuration, loaded from a YAML file plus `HOARD_*`
/// environment overrides.
#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct ServerConfig {
    pub bind: String,
    /// Base directory for blob and meta storage.
    pub backend: String,

    pub gc: GcConfig,

    /// Optional HTML template served on errors; `{{path}}` and `{{error}}`
    /// are substituted.
    pub page: Option<String>,

    /// Accepted for forward compatibility; metrics endpoints are provided by
    /// an external collaborator.
    pub monitor: Option<MonitorConfig>,

    /// Named rulesets that targets can pull in via `rules_include`.
    #[serde(default)]
    pub rules: HashMap<String, RuleSetConfig>,

    #[serde(default)]
    pub caches: HashMap<String, CacheConfig>,
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct GcConfig {
    /// Interval of the per-target meta sweep.
    pub meta: String,
    /// Interval of the shared blob sweep.
    pub blob: String,
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct MonitorConfig {
    pub bind: String,
    #[serde(default = "default_monitor_path")]
    pub path: String,
}

fn default_monitor_path() -> String {
    "/metrics".to_string()
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct RuleSetConfig {
    pub rules: Vec<RuleConfig>,
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct RuleConfig {
    pub regex: String,
    #[serde(default = "zero_duration")]
    pub ttl: String,
    #[serde(default = "zero_duration")]
    pub refresh: String,
}

fn zero_duration() -> String {
    "0".to_string()
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct CacheConfig {
    /// Origin base URLs, tried in order.
    pub urls: Vec<String>,
    #[serde(default)]
    pub rules_include: Vec<String>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub replaces: Vec<ReplaceConfig>,
    pub transport: Option<TransportConfig>,
}

#[derive(Clone, Debug, serde::Deserialize, PartialEq)]
pub struct ReplaceConfig {
    pub regex: String,
    pub old: String,
    pub new: String,
}

#[derive(Clone, Debug, Default, serde::Deserialize, PartialEq)]
pub struct TransportConfig {
    pub proxy: Option<String>,
    pub ua: Option<String>,
    pub timeout: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

impl ServerConfig {
    pub fn load(path: &str) -> Result<Self, LoadConfigError> {
        ConfigLoader::new().add_default_sources(path).load()
    }
}

#[derive(Debug)]
pub enum LoadConfigError {
    ConfigError(ConfigError),
}

impl Display for LoadConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadConfigError::ConfigError(err) => write!(f, "configuration error: {err}"),
        }
    }
}

impl From<ConfigError> for LoadConfigError {
    fn from(err: ConfigError) -> Self {
        LoadConfigError::ConfigError(err)
    }
}

impl std::error::Error for LoadConfigError {}

struct ConfigLoader(ConfigBuilder<DefaultState>);

impl ConfigLoader {
    pub fn new() -> Self {
        ConfigLoader(Config::builder())
    }

    pub fn add_default_sources(self, path: &str) -> Self {
        self.add_file_source(File::with_name(path))
            .add_environment_source(None)
    }

    pub fn add_file_source<T, F>(mut self, file: File<T, F>) -> Self
    where
        File<T, F>: Source + Send + Sync + 'static,
    {
        self.0 = self.0.add_source(file);
        self
    }

    pub fn add_environment_source(mut self, source: Option<Map<String, String>>) -> Self {
        self.0 = self.0.add_source(
            Environment::with_prefix("HOARD")
                .separator("__")
                .prefix_separator("_")
                .try_parsing(true)
                .source(source),
        );
        self
    }

    pub fn load(self) -> Result<ServerConfig, LoadConfigError> {
        self.0
            .set_default("bind", "0.0.0.0:8080".to_string())?
            .set_default("gc.meta", "10s".to_string())?
            .set_default("gc.blob", "24h".to_string())?
            .build()?
            .try_deserialize()
            .map_err(LoadConfigError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    fn load_yaml(content: &str) -> Result<ServerConfig, LoadConfigError> {
        ConfigLoader::new()
            .add_file_source(File::from_str(content, FileFormat::Yaml))
            .load()
    }

    #[test]
    fn test_minimal_configuration_gets_defaults() {
        let parsed = load_yaml("backend: /var/lib/hoard\n").unwrap();
        assert_eq!(parsed.bind, "0.0.0.0:8080");
        assert_eq!(parsed.backend, "/var/lib/hoard");
        assert_eq!(parsed.gc.meta, "10s");
        assert_eq!(parsed.gc.blob, "24h");
        assert!(parsed.page.is_none());
        assert!(parsed.caches.is_empty());
    }

    #[test]
    fn test_missing_backend_is_an_error() {
        assert!(load_yaml("bind: 127.0.0.1:8080\n").is_err());
    }

    #[test]
    fn test_parses_full_configuration() {
        let parsed = load_yaml(
            r#"
bind: 127.0.0.1:8080
backend: /srv/hoard
gc:
  meta: 30s
  blob: 12h
page: error.html
monitor:
  bind: 127.0.0.1:9090
rules:
  archives:
    rules:
      - regex: '\.tar\.gz$'
        ttl: 0
caches:
  debian:
    urls:
      - https://deb.debian.org/debian
      - https://ftp.de.debian.org/debian
    rules_include: [archives]
    rules:
      - regex: '.*'
        ttl: 2h
        refresh: 1h
    replaces:
      - regex: '\.list$'
        old: http://deb.debian.org
        new: http://mirror.internal
    transport:
      ua: hoard/1.0
      timeout: 5s
      headers:
        X-Mirror-Token: secret
"#,
        )
        .unwrap();

        assert_eq!(parsed.bind, "127.0.0.1:8080");
        assert_eq!(parsed.gc.meta, "30s");
        assert_eq!(parsed.page.as_deref(), Some("error.html"));
        assert_eq!(
            parsed.monitor,
            Some(MonitorConfig {
                bind: "127.0.0.1:9090".to_string(),
                path: "/metrics".to_string(),
            })
        );

        let ruleset = &parsed.rules["archives"];
        assert_eq!(ruleset.rules[0].regex, r"\.tar\.gz$");
        assert_eq!(ruleset.rules[0].refresh, "0");

        let debian = &parsed.caches["debian"];
        assert_eq!(debian.urls.len(), 2);
        assert_eq!(debian.rules_include, vec!["archives".to_string()]);
        assert_eq!(debian.rules[0].ttl, "2h");
        assert_eq!(debian.replaces[0].new, "http://mirror.internal");
        let transport = debian.transport.as_ref().unwrap();
        assert_eq!(transport.ua.as_deref(), Some("hoard/1.0"));
        assert_eq!(
            transport.headers.get("X-Mirror-Token").map(String::as_str),
            Some("secret")
        );
    }

    #[test]
    fn test_environment_variables_override() {
        let env = Map::from([
            ("HOARD_BIND".to_string(), "[::1]:9999".to_string()),
            ("HOARD_BACKEND".to_string(), "/tmp/hoard".to_string()),
            ("HOARD_GC__META".to_string(), "1m".to_string()),
        ]);
        let parsed = ConfigLoader::new()
            .add_environment_source(Some(env))
            .load()
            .unwrap();
        assert_eq!(parsed.bind, "[::1]:9999");
        assert_eq!(parsed.backend, "/tmp/hoard");
        assert_eq!(parsed.gc.meta, "1m");
    }
}
