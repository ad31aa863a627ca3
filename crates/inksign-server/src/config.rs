//! Server configuration from the environment.

use std::net::SocketAddr;
use std::path::PathBuf;
use thiserror::Error;

pub const DEFAULT_ADDR: &str = "0.0.0.0:3040";
pub const DEFAULT_MAX_UPLOAD_MB: usize = 25;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("INKSIGN_ADDR '{0}' is not a socket address")]
    InvalidAddr(String),
    #[error("{name} '{value}' is not valid")]
    InvalidValue { name: &'static str, value: String },
    #[error("no data directory: set INKSIGN_DATA_DIR")]
    NoDataDir,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub addr: SocketAddr,
    /// Root of the documents/, artifacts/ and envelopes/ stores.
    pub data_dir: PathBuf,
    pub max_upload_bytes: usize,
    /// Append a completion certificate to signed documents.
    pub certificate_page: bool,
}

impl ServerConfig {
    /// Read `INKSIGN_ADDR`, `INKSIGN_DATA_DIR`, `INKSIGN_MAX_UPLOAD_MB` and
    /// `INKSIGN_CERTIFICATE`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let addr_value = get("INKSIGN_ADDR").unwrap_or_else(|| DEFAULT_ADDR.to_string());
        let addr = addr_value
            .parse()
            .map_err(|_| ConfigError::InvalidAddr(addr_value.clone()))?;

        let data_dir = match get("INKSIGN_DATA_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .map(|dir| dir.join("inksign"))
                .ok_or(ConfigError::NoDataDir)?,
        };

        let max_upload_mb = match get("INKSIGN_MAX_UPLOAD_MB") {
            Some(value) => value.parse::<usize>().map_err(|_| ConfigError::InvalidValue {
                name: "INKSIGN_MAX_UPLOAD_MB",
                value,
            })?,
            None => DEFAULT_MAX_UPLOAD_MB,
        };

        let certificate_page = match get("INKSIGN_CERTIFICATE").as_deref() {
            None | Some("1" | "true" | "on" | "yes") => true,
            Some("0" | "false" | "off" | "no") => false,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    name: "INKSIGN_CERTIFICATE",
                    value: other.to_string(),
                });
            }
        };

        Ok(Self {
            addr,
            data_dir,
            max_upload_bytes: max_upload_mb * 1024 * 1024,
            certificate_page,
        })
    }

    pub fn documents_dir(&self) -> PathBuf {
        self.data_dir.join("documents")
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.data_dir.join("artifacts")
    }

    pub fn envelopes_dir(&self) -> PathBuf {
        self.data_dir.join("envelopes")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_explicit_values() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("INKSIGN_ADDR", "127.0.0.1:8080"),
            ("INKSIGN_DATA_DIR", "/tmp/inksign-test"),
            ("INKSIGN_MAX_UPLOAD_MB", "5"),
            ("INKSIGN_CERTIFICATE", "off"),
        ]))
        .unwrap();
        assert_eq!(config.addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.envelopes_dir(), PathBuf::from("/tmp/inksign-test/envelopes"));
        assert_eq!(config.max_upload_bytes, 5 * 1024 * 1024);
        assert!(!config.certificate_page);
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[("INKSIGN_DATA_DIR", "/data")])).unwrap();
        assert_eq!(config.addr, DEFAULT_ADDR.parse().unwrap());
        assert_eq!(config.max_upload_bytes, DEFAULT_MAX_UPLOAD_MB * 1024 * 1024);
        assert!(config.certificate_page);
        assert_eq!(config.documents_dir(), PathBuf::from("/data/documents"));
    }

    #[test]
    fn test_invalid_values() {
        assert_eq!(
            ServerConfig::from_lookup(lookup(&[("INKSIGN_ADDR", "localhost")])),
            Err(ConfigError::InvalidAddr("localhost".to_string()))
        );
        assert!(matches!(
            ServerConfig::from_lookup(lookup(&[("INKSIGN_DATA_DIR", "/d"), ("INKSIGN_CERTIFICATE", "maybe")])),
            Err(ConfigError::InvalidValue { name: "INKSIGN_CERTIFICATE", .. })
        ));
    }
}
