use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::ConfigError;

const DEFAULT_BIND: &str = "0.0.0.0:2052";
const DEFAULT_STATIC_DIR: &str = "public";
const DEFAULT_TLS_CERT: &str = "ssl/room/certificate.pem";
const DEFAULT_TLS_KEY: &str = "ssl/room/private.key";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: SocketAddr,
    pub static_dir: PathBuf,
    pub tls: TlsPaths,
    /// Session logs are written here when set; otherwise sessions live in memory.
    pub data_dir: Option<PathBuf>,
    /// JSON array of student records used for name lookups and class rosters.
    pub roster_file: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let bind_value = get("OPENLMS_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind_value.parse().map_err(|_| ConfigError::Invalid {
            key: "OPENLMS_BIND",
            value: bind_value.clone(),
        })?;

        Ok(Config {
            bind,
            static_dir: get("OPENLMS_STATIC_DIR")
                .map_or_else(|| DEFAULT_STATIC_DIR.into(), PathBuf::from),
            tls: TlsPaths {
                cert_path: get("OPENLMS_TLS_CERT")
                    .map_or_else(|| DEFAULT_TLS_CERT.into(), PathBuf::from),
                key_path: get("OPENLMS_TLS_KEY")
                    .map_or_else(|| DEFAULT_TLS_KEY.into(), PathBuf::from),
            },
            data_dir: get("OPENLMS_DATA_DIR").map(PathBuf::from),
            roster_file: get("OPENLMS_ROSTER_FILE").map(PathBuf::from),
        })
    }
}
