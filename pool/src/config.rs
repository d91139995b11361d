use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "stratum_config.json";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },

    #[error("Unknown dialect: {0}")]
    UnknownDialect(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Wire dialect spoken to miners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum Dialect {
    /// mining.subscribe / mining.authorize / mining.submit
    Classic,
    /// login / solution
    Beam,
}

impl FromStr for Dialect {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "classic" | "stratum" => Ok(Dialect::Classic),
            "beam" | "login" => Ok(Dialect::Beam),
            other => Err(ConfigError::UnknownDialect(other.to_string())),
        }
    }
}

impl TryFrom<String> for Dialect {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Classic => write!(f, "classic"),
            Dialect::Beam => write!(f, "beam"),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct UpstreamConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    /// Bound on connect, login and each solution round-trip
    pub request_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 17021,
            api_key: String::new(),
            request_timeout_secs: 10,
        }
    }
}

#[derive(Deserialize, Clone, Debug, Default)]
#[serde(default)]
pub struct PowConfig {
    /// Accept every solution without verification. Test deployments only.
    pub trust_solutions: bool,
}

#[derive(Deserialize, Clone, Debug)]
#[serde(default)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// Difficulty assigned to every new client
    pub difficulty: f64,
    pub dialect: Dialect,
    pub upstream: UpstreamConfig,
    pub client_idle_timeout_secs: u64,
    pub first_job_timeout_secs: u64,
    pub metrics_listen: Option<String>,
    pub pow: PowConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3020,
            difficulty: 1024.0,
            dialect: Dialect::Beam,
            upstream: UpstreamConfig::default(),
            client_idle_timeout_secs: 600,
            first_job_timeout_secs: 30,
            metrics_listen: None,
            pow: PowConfig::default(),
        }
    }
}

fn env_parse<T: FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::Env { var, value })
}

impl Config {
    /// Defaults, then the JSON file (`$STRATUM_CONFIG` or `stratum_config.json`), then env.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var("STRATUM_CONFIG").ok();
        let mut cfg = match path.as_deref() {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };
        cfg.apply_env(|var| std::env::var(var).ok())?;
        Ok(cfg)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let txt = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&txt).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `STRATUM_*` overrides. `lookup` is `std::env::var` outside of tests.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(h) = lookup("STRATUM_HOST") {
            self.host = h;
        }
        if let Some(p) = lookup("STRATUM_PORT") {
            self.port = env_parse("STRATUM_PORT", p)?;
        }
        if let Some(d) = lookup("STRATUM_DIFF") {
            self.difficulty = env_parse("STRATUM_DIFF", d)?;
        }
        if let Some(d) = lookup("STRATUM_DIALECT") {
            self.dialect = d.parse()?;
        }
        if let Some(h) = lookup("STRATUM_UPSTREAM_HOST") {
            self.upstream.host = h;
        }
        if let Some(p) = lookup("STRATUM_UPSTREAM_PORT") {
            self.upstream.port = env_parse("STRATUM_UPSTREAM_PORT", p)?;
        }
        if let Some(k) = lookup("STRATUM_UPSTREAM_API_KEY") {
            self.upstream.api_key = k;
        }
        if let Some(m) = lookup("STRATUM_METRICS_LISTEN") {
            self.metrics_listen = if m.trim().is_empty() { None } else { Some(m) };
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::Invalid("port must be non-zero".to_string()));
        }
        if !self.difficulty.is_finite() || self.difficulty <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "difficulty must be a positive number, got {}",
                self.difficulty
            )));
        }
        if self.upstream.host.trim().is_empty() {
            return Err(ConfigError::Invalid("upstream host is empty".to_string()));
        }
        if self.upstream.port == 0 {
            return Err(ConfigError::Invalid("upstream port must be non-zero".to_string()));
        }
        if self.client_idle_timeout_secs == 0
            || self.first_job_timeout_secs == 0
            || self.upstream.request_timeout_secs == 0
        {
            return Err(ConfigError::Invalid("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn client_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.client_idle_timeout_secs)
    }

    pub fn first_job_timeout(&self) -> Duration {
        Duration::from_secs(self.first_job_timeout_secs)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        assert_eq!(cfg.listen_addr(), "0.0.0.0:3020");
        assert_eq!(cfg.difficulty, 1024.0);
        assert_eq!(cfg.dialect, Dialect::Beam);
        assert!(cfg.metrics_listen.is_none());
        assert!(!cfg.pow.trust_solutions);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let cfg: Config = serde_json::from_str(
            r#"{"port": 4000, "dialect": "Stratum", "upstream": {"api_key": "abc"}, "pow": {"trust_solutions": true}}"#,
        )
        .unwrap();
        assert_eq!(cfg.port, 4000);
        assert_eq!(cfg.dialect, Dialect::Classic);
        assert_eq!(cfg.upstream.api_key, "abc");
        assert_eq!(cfg.upstream.port, 17021);
        assert!(cfg.pow.trust_solutions);
        assert_eq!(cfg.client_idle_timeout_secs, 600);
    }

    #[test]
    fn test_unknown_dialect_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"dialect": "ethproxy"}"#).is_err());
        assert!(matches!("nope".parse::<Dialect>(), Err(ConfigError::UnknownDialect(_))));
        assert_eq!("LOGIN".parse::<Dialect>().unwrap(), Dialect::Beam);
    }

    #[test]
    fn test_env_overrides() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[
            ("STRATUM_PORT", "4444"),
            ("STRATUM_DIFF", "2048.5"),
            ("STRATUM_DIALECT", "classic"),
            ("STRATUM_UPSTREAM_HOST", "10.0.0.2"),
            ("STRATUM_UPSTREAM_API_KEY", "secret"),
            ("STRATUM_METRICS_LISTEN", "127.0.0.1:9100"),
        ]))
        .unwrap();

        assert_eq!(cfg.port, 4444);
        assert_eq!(cfg.difficulty, 2048.5);
        assert_eq!(cfg.dialect, Dialect::Classic);
        assert_eq!(cfg.upstream.host, "10.0.0.2");
        assert_eq!(cfg.upstream.api_key, "secret");
        assert_eq!(cfg.metrics_listen.as_deref(), Some("127.0.0.1:9100"));
    }

    #[test]
    fn test_bad_env_value() {
        let mut cfg = Config::default();
        let err = cfg.apply_env(env(&[("STRATUM_PORT", "http")])).unwrap_err();
        assert!(matches!(err, ConfigError::Env { var: "STRATUM_PORT", .. }));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut cfg = Config::default();
        cfg.port = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.difficulty = f64::NAN;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.difficulty = -1.0;
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.upstream.host = " ".to_string();
        assert!(cfg.validate().is_err());

        let mut cfg = Config::default();
        cfg.client_idle_timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_from_file_missing() {
        assert!(matches!(
            Config::from_file("/nonexistent/stratum_config.json"),
            Err(ConfigError::Read { .. })
        ));
    }
}
