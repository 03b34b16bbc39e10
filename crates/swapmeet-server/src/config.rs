use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub struct Config {
    pub jwt_secret: String,
    pub db_path: PathBuf,
    pub addr: SocketAddr,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset keys fall back to development defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let jwt_secret = lookup("SWAPMEET_JWT_SECRET").unwrap_or_else(|| "dev-secret-change-me".into());
        let db_path = lookup("SWAPMEET_DB_PATH").unwrap_or_else(|| "swapmeet.db".into());
        let host = lookup("SWAPMEET_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port: u16 = lookup("SWAPMEET_PORT")
            .unwrap_or_else(|| "3000".into())
            .parse()
            .context("SWAPMEET_PORT must be a port number")?;

        let addr = format!("{}:{}", host, port)
            .parse()
            .with_context(|| format!("invalid bind address {}:{}", host, port))?;

        Ok(Self {
            jwt_secret,
            db_path: PathBuf::from(db_path),
            addr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(|_| None).unwrap();
        assert_eq!(config.addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.db_path, PathBuf::from("swapmeet.db"));
        assert_eq!(config.jwt_secret, "dev-secret-change-me");
    }

    #[test]
    fn reads_overrides() {
        let vars: HashMap<&str, &str> = [
            ("SWAPMEET_HOST", "127.0.0.1"),
            ("SWAPMEET_PORT", "8080"),
            ("SWAPMEET_DB_PATH", "/tmp/trades.db"),
        ]
        .into_iter()
        .collect();
        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.db_path, PathBuf::from("/tmp/trades.db"));
    }

    #[test]
    fn rejects_bad_port() {
        let result = Config::from_lookup(|k| (k == "SWAPMEET_PORT").then(|| "lots".to_string()));
        assert!(result.is_err());
    }
}
