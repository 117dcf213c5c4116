//! Node configuration file loader.
//!
//! The config file is line-oriented `key=value` with `#` comments and blank
//! lines ignored. Recognized keys:
//!
//! | Key | Meaning |
//! |-----|---------|
//! | `listen` | TCP listen address (`:3000` or `host:port`) |
//! | `db` | Metadata database path |
//! | `bootstrap` | Comma-separated bootstrap node addresses |
//!
//! A leading `~/` in the path is expanded to the user's home directory.
//! A missing file yields an empty config; explicit CLI flags always win over
//! config values.

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Values parsed from a config file. `None`/empty means "not set".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub listen: Option<String>,
    pub db: Option<String>,
    pub bootstrap: Vec<String>,
}

impl Config {
    /// Loads and parses the config file at `path`.
    pub fn load(path: &str) -> Result<Config> {
        let path = expand_home(path);
        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Config::default()),
            Err(e) => {
                return Err(e).with_context(|| format!("reading config {}", path.display()))
            }
        };
        Ok(Self::parse(&contents))
    }

    fn parse(contents: &str) -> Config {
        let mut config = Config::default();

        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let (key, value) = (key.trim(), value.trim());

            match key {
                "listen" => config.listen = Some(value.to_string()),
                "db" => config.db = Some(value.to_string()),
                "bootstrap" => {
                    config.bootstrap.extend(
                        value
                            .split(',')
                            .map(str::trim)
                            .filter(|n| !n.is_empty())
                            .map(String::from),
                    );
                }
                _ => {}
            }
        }

        config
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}
