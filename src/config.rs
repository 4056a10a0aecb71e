use std::path::PathBuf;

use tracing::warn;

/// Server settings, read once from `MEETD_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    /// WAL appends since the last compaction that trigger a new one.
    pub compact_threshold: u64,
    /// Prometheus exporter port; `None` disables metrics export.
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5433,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable numbers fall back to the
    /// default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            bind: lookup("MEETD_BIND").unwrap_or(defaults.bind),
            port: parse_or("MEETD_PORT", &lookup, defaults.port),
            data_dir: lookup("MEETD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections: parse_or("MEETD_MAX_CONNECTIONS", &lookup, defaults.max_connections),
            compact_threshold: parse_or(
                "MEETD_COMPACT_THRESHOLD",
                &lookup,
                defaults.compact_threshold,
            ),
            metrics_port: lookup("MEETD_METRICS_PORT").and_then(|raw| match raw.parse() {
                Ok(p) => Some(p),
                Err(_) => {
                    warn!("MEETD_METRICS_PORT={raw:?} is not a port, metrics disabled");
                    None
                }
            }),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("meetd.wal")
    }
}

fn parse_or<T: std::str::FromStr + std::fmt::Debug>(
    key: &str,
    lookup: &impl Fn(&str) -> Option<String>,
    default: T,
) -> T {
    match lookup(key) {
        None => default,
        Some(raw) => raw.trim().parse().unwrap_or_else(|_| {
            warn!("{key}={raw:?} is not valid, using {default:?}");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(|_| None);
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/meetd.wal"));
    }

    #[test]
    fn reads_every_key() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("MEETD_BIND", "127.0.0.1"),
            ("MEETD_PORT", "6000"),
            ("MEETD_DATA_DIR", "/var/lib/meetd"),
            ("MEETD_MAX_CONNECTIONS", "8"),
            ("MEETD_COMPACT_THRESHOLD", "50"),
            ("MEETD_METRICS_PORT", "9100"),
        ]));
        assert_eq!(cfg.listen_addr(), "127.0.0.1:6000");
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/meetd"));
        assert_eq!(cfg.max_connections, 8);
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.metrics_port, Some(9100));
    }

    #[test]
    fn bad_numbers_fall_back() {
        let cfg = Config::from_lookup(lookup_from(&[
            ("MEETD_PORT", "http"),
            ("MEETD_MAX_CONNECTIONS", "-1"),
            ("MEETD_METRICS_PORT", "99999"),
        ]));
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.metrics_port, None);
    }
}
