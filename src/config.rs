use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Server settings, read once at startup from `SLOTD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the log is rewritten.
    pub compact_threshold: u64,
    pub lock_timeout: Duration,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5433,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            password: "slotd".into(),
            max_connections: 256,
            compact_threshold: 1000,
            lock_timeout: Duration::from_millis(5000),
            metrics_port: None,
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    Malformed { var: &'static str, value: String },
    OutOfRange { var: &'static str, value: String },
    TlsHalfConfigured,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Malformed { var, value } => write!(f, "{var}: cannot parse '{value}'"),
            ConfigError::OutOfRange { var, value } => write!(f, "{var}: '{value}' out of range"),
            ConfigError::TlsHalfConfigured => {
                write!(f, "both SLOTD_TLS_CERT and SLOTD_TLS_KEY must be set, or neither")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(std::env::vars().filter(|(k, _)| k.starts_with("SLOTD_")).collect())
    }

    fn from_vars(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let defaults = Config::default();
        let get = |var: &str| vars.get(var).map(|v| v.trim()).filter(|v| !v.is_empty());

        let lock_timeout_ms: u64 = parse_or(&vars, "SLOTD_LOCK_TIMEOUT_MS", 5000)?;
        if lock_timeout_ms == 0 {
            return Err(ConfigError::OutOfRange {
                var: "SLOTD_LOCK_TIMEOUT_MS",
                value: lock_timeout_ms.to_string(),
            });
        }
        let max_connections: usize =
            parse_or(&vars, "SLOTD_MAX_CONNECTIONS", defaults.max_connections)?;
        if max_connections == 0 {
            return Err(ConfigError::OutOfRange {
                var: "SLOTD_MAX_CONNECTIONS",
                value: "0".into(),
            });
        }

        let tls_cert = get("SLOTD_TLS_CERT").map(PathBuf::from);
        let tls_key = get("SLOTD_TLS_KEY").map(PathBuf::from);
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsHalfConfigured);
        }

        Ok(Self {
            port: parse_or(&vars, "SLOTD_PORT", defaults.port)?,
            bind: get("SLOTD_BIND").map_or(defaults.bind, str::to_string),
            data_dir: get("SLOTD_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            password: get("SLOTD_PASSWORD").map_or(defaults.password, str::to_string),
            max_connections,
            compact_threshold: parse_or(
                &vars,
                "SLOTD_COMPACT_THRESHOLD",
                defaults.compact_threshold,
            )?,
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            metrics_port: parse_opt(&vars, "SLOTD_METRICS_PORT")?,
            tls_cert,
            tls_key,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<T: FromStr>(
    vars: &HashMap<String, String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    match vars.get(var).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(value) => value.parse().map(Some).map_err(|_| ConfigError::Malformed {
            var,
            value: value.to_string(),
        }),
    }
}

fn parse_or<T: FromStr>(
    vars: &HashMap<String, String>,
    var: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(vars, var)?.unwrap_or(default))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn empty_environment_gives_defaults() {
        assert_eq!(Config::from_vars(HashMap::new()).unwrap(), Config::default());
    }

    #[test]
    fn overrides_are_applied() {
        let config = Config::from_vars(vars(&[
            ("SLOTD_PORT", "6543"),
            ("SLOTD_BIND", "127.0.0.1"),
            ("SLOTD_DATA_DIR", "/var/lib/slotd"),
            ("SLOTD_LOCK_TIMEOUT_MS", "250"),
            ("SLOTD_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr(), "127.0.0.1:6543");
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/slotd"));
        assert_eq!(config.lock_timeout, Duration::from_millis(250));
        assert_eq!(config.metrics_port, Some(9100));
    }

    #[test]
    fn malformed_numbers_are_errors() {
        let err = Config::from_vars(vars(&[("SLOTD_PORT", "http")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Malformed {
                var: "SLOTD_PORT",
                value: "http".into()
            }
        );
        assert!(Config::from_vars(vars(&[("SLOTD_MAX_CONNECTIONS", "-1")])).is_err());
        assert!(Config::from_vars(vars(&[("SLOTD_LOCK_TIMEOUT_MS", "0")])).is_err());
    }

    #[test]
    fn tls_needs_both_files() {
        assert_eq!(
            Config::from_vars(vars(&[("SLOTD_TLS_CERT", "cert.pem")])).unwrap_err(),
            ConfigError::TlsHalfConfigured
        );
        let config = Config::from_vars(vars(&[
            ("SLOTD_TLS_CERT", "cert.pem"),
            ("SLOTD_TLS_KEY", "key.pem"),
        ]))
        .unwrap();
        assert!(config.tls_cert.is_some() && config.tls_key.is_some());
    }
}
