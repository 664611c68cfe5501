use std::env;
use std::fmt::Display;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{info, warn};

const DEFAULT_PORT: u16 = 2052;
const DEFAULT_DATA_FILE: &str = "data/relay-store.json";
const DEFAULT_STATIC_DIR: &str = "public";

/// Relay server settings, read from `RELAY_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub port: u16,
    /// `None` keeps everything in memory.
    pub data_file: Option<PathBuf>,
    pub static_dir: PathBuf,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            data_file: Some(PathBuf::from(DEFAULT_DATA_FILE)),
            static_dir: PathBuf::from(DEFAULT_STATIC_DIR),
            tls_cert: None,
            tls_key: None,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Config::default();
        let data_file = match lookup("RELAY_DATA_FILE") {
            Some(path) if path.trim().is_empty() => None,
            Some(path) => Some(PathBuf::from(path)),
            None => defaults.data_file,
        };

        Config {
            bind: parse_or(&lookup, "RELAY_BIND", defaults.bind),
            port: parse_or(&lookup, "RELAY_PORT", defaults.port),
            data_file,
            static_dir: lookup("RELAY_STATIC_DIR")
                .map_or(defaults.static_dir, PathBuf::from),
            tls_cert: lookup("RELAY_TLS_CERT").map(PathBuf::from),
            tls_key: lookup("RELAY_TLS_KEY").map(PathBuf::from),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }

    /// Certificate and key, only when both are configured and present on disk.
    pub fn tls_paths(&self) -> Option<(&Path, &Path)> {
        let (cert, key) = (self.tls_cert.as_deref()?, self.tls_key.as_deref()?);
        for path in [cert, key] {
            if !path.exists() {
                warn!("TLS file {} not found, falling back to HTTP/WS", path.display());
                return None;
            }
        }
        Some((cert, key))
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        None => {
            info!("{key} not set, using default: {default}");
            default
        }
        Some(raw) => raw.trim().parse().unwrap_or_else(|e| {
            warn!("Invalid {key} value {raw:?} ({e}), using default: {default}");
            default
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]);
        assert_eq!(config.socket_addr().to_string(), "0.0.0.0:2052");
        assert_eq!(config.data_file, Some(PathBuf::from(DEFAULT_DATA_FILE)));
        assert!(config.tls_paths().is_none());
    }

    #[test]
    fn invalid_values_fall_back() {
        let config = config_from(&[("RELAY_PORT", "not-a-port"), ("RELAY_BIND", "127.0.0.1")]);
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.bind.to_string(), "127.0.0.1");
    }

    #[test]
    fn empty_data_file_disables_persistence() {
        let config = config_from(&[("RELAY_DATA_FILE", "")]);
        assert!(config.data_file.is_none());
    }

    #[test]
    fn missing_tls_files_disable_tls() {
        let config = config_from(&[
            ("RELAY_TLS_CERT", "/nonexistent/cert.pem"),
            ("RELAY_TLS_KEY", "/nonexistent/key.pem"),
        ]);
        assert!(config.tls_paths().is_none());
    }
}
