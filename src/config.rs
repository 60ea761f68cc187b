// SPDX-License-Identifier: MPL-2.0

use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_DB_SCHEMA: &str = "bsky";
pub const DEFAULT_PLC_DIRECTORY: &str = "https://plc.directory";
pub const DEFAULT_STATE_PATH: &str = "./muncher-state.sqlite";
pub const DEFAULT_CHANGE_FEED: &str = "wss://jetstream1.us-east.bsky.network/subscribe";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required {0}")]
    Missing(&'static str),
    #[error("{0} contains no valid DIDs")]
    EmptyDidList(&'static str),
    #[error("{0} is not a DID: {1}")]
    InvalidDid(&'static str, String),
    #[error("invalid HTTP version {0:?} (expected \"1.1\" or \"2\")")]
    InvalidHttpVersion(String),
    #[error("MUNCHER_DATAPLANE_URLS is required when MUNCHER_MOD_SERVICE_DID is set")]
    MissingDataplane,
}

/// Dataplane transport version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http1,
    Http2,
}

impl FromStr for HttpVersion {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1.1" => Ok(Self::Http1),
            "2" => Ok(Self::Http2),
            other => Err(ConfigError::InvalidHttpVersion(other.to_string())),
        }
    }
}

/// Service configuration, read from the environment at startup
#[derive(Debug, Clone)]
pub struct Config {
    pub db_url: String,
    pub db_schema: String,
    pub labeler_dids: Vec<String>,
    pub plc_url: String,
    pub state_path: PathBuf,
    pub mod_service_did: Option<String>,
    pub dataplane_urls: Vec<String>,
    pub dataplane_http_version: HttpVersion,
    pub change_feed_url: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Build from a variable lookup; `from_env` passes the process
    /// environment through here.
    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let db_url = var("MUNCHER_DB_POSTGRES_URL")
            .filter(|v| !v.is_empty())
            .ok_or(ConfigError::Missing("MUNCHER_DB_POSTGRES_URL"))?;
        let db_schema =
            var("MUNCHER_DB_POSTGRES_SCHEMA").unwrap_or_else(|| DEFAULT_DB_SCHEMA.to_string());

        let labeler_dids = parse_did_list(
            "MUNCHER_LABELER_DIDS",
            &var("MUNCHER_LABELER_DIDS").ok_or(ConfigError::Missing("MUNCHER_LABELER_DIDS"))?,
        )?;

        let plc_url = var("MUNCHER_DID_PLC_URL").unwrap_or_else(|| DEFAULT_PLC_DIRECTORY.to_string());
        let state_path =
            PathBuf::from(var("MUNCHER_STATE_PATH").unwrap_or_else(|| DEFAULT_STATE_PATH.to_string()));

        let mod_service_did = var("MUNCHER_MOD_SERVICE_DID").filter(|v| !v.is_empty());
        let dataplane_urls = match var("MUNCHER_DATAPLANE_URLS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(str::to_string)
                .collect(),
            None => Vec::new(),
        };
        if mod_service_did.is_some() && dataplane_urls.is_empty() {
            return Err(ConfigError::MissingDataplane);
        }

        let dataplane_http_version = var("MUNCHER_DATAPLANE_HTTP_VERSION")
            .map(|raw| raw.parse())
            .transpose()?
            .unwrap_or(HttpVersion::Http1);

        let change_feed_url =
            var("MUNCHER_CHANGE_FEED_URL").unwrap_or_else(|| DEFAULT_CHANGE_FEED.to_string());

        Ok(Self {
            db_url,
            db_schema,
            labeler_dids,
            plc_url,
            state_path,
            mod_service_did,
            dataplane_urls,
            dataplane_http_version,
            change_feed_url,
        })
    }
}

/// Parse a comma-separated DID list; deduplicates so no publisher is ever
/// subscribed twice.
fn parse_did_list(key: &'static str, raw: &str) -> Result<Vec<String>, ConfigError> {
    let mut dids: Vec<String> = Vec::new();

    for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        if !entry.starts_with("did:") {
            return Err(ConfigError::InvalidDid(key, entry.to_string()));
        }
        if !dids.iter().any(|d| d == entry) {
            dids.push(entry.to_string());
        }
    }

    if dids.is_empty() {
        return Err(ConfigError::EmptyDidList(key));
    }

    Ok(dids)
}
