// SPDX-License-Identifier: MPL-2.0

//! Translates a trusted moderation service's `!takedown` labels into
//! dataplane actions against actors or records.

use crate::atproto::Label;
use crate::config::HttpVersion;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use reqwest::Client;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

pub const TAKEDOWN_VALUE: &str = "!takedown";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Error, Debug)]
pub enum DataplaneError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("dataplane returned status {0}")]
    Status(u16),
    #[error("no dataplane hosts configured")]
    NoHosts,
}

/// The moderation dataplane's takedown surface
#[async_trait]
pub trait Dataplane: Send + Sync {
    async fn takedown_actor(
        &self,
        did: &str,
        takedown_ref: &str,
        seen: DateTime<Utc>,
    ) -> Result<(), DataplaneError>;

    async fn untakedown_actor(&self, did: &str, seen: DateTime<Utc>) -> Result<(), DataplaneError>;

    async fn takedown_record(
        &self,
        record_uri: &str,
        takedown_ref: &str,
        seen: DateTime<Utc>,
    ) -> Result<(), DataplaneError>;

    async fn untakedown_record(
        &self,
        record_uri: &str,
        seen: DateTime<Utc>,
    ) -> Result<(), DataplaneError>;
}

/// HTTP dataplane client, round-robin over the configured hosts
pub struct HttpDataplane {
    http: Client,
    hosts: Vec<String>,
    next: AtomicUsize,
}

impl HttpDataplane {
    pub fn new(hosts: &[String], version: HttpVersion) -> Result<Self, DataplaneError> {
        if hosts.is_empty() {
            return Err(DataplaneError::NoHosts);
        }

        let builder = Client::builder().timeout(HTTP_TIMEOUT);
        let builder = match version {
            HttpVersion::Http1 => builder.http1_only(),
            HttpVersion::Http2 => builder.http2_prior_knowledge(),
        };

        Ok(Self {
            http: builder.build()?,
            hosts: hosts
                .iter()
                .map(|h| h.trim_end_matches('/').to_string())
                .collect(),
            next: AtomicUsize::new(0),
        })
    }

    fn host(&self) -> &str {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        &self.hosts[i % self.hosts.len()]
    }

    async fn call(&self, method: &str, body: serde_json::Value) -> Result<(), DataplaneError> {
        let url = format!("{}/bsky.Service/{}", self.host(), method);
        let response = self.http.post(&url).json(&body).send().await?;

        if !response.status().is_success() {
            return Err(DataplaneError::Status(response.status().as_u16()));
        }

        Ok(())
    }
}

fn seen_at(seen: DateTime<Utc>) -> String {
    seen.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[async_trait]
impl Dataplane for HttpDataplane {
    async fn takedown_actor(
        &self,
        did: &str,
        takedown_ref: &str,
        seen: DateTime<Utc>,
    ) -> Result<(), DataplaneError> {
        self.call(
            "TakedownActor",
            json!({"did": did, "ref": takedown_ref, "seenAt": seen_at(seen)}),
        )
        .await
    }

    async fn untakedown_actor(&self, did: &str, seen: DateTime<Utc>) -> Result<(), DataplaneError> {
        self.call("UntakedownActor", json!({"did": did, "seenAt": seen_at(seen)}))
            .await
    }

    async fn takedown_record(
        &self,
        record_uri: &str,
        takedown_ref: &str,
        seen: DateTime<Utc>,
    ) -> Result<(), DataplaneError> {
        self.call(
            "TakedownRecord",
            json!({"recordUri": record_uri, "ref": takedown_ref, "seenAt": seen_at(seen)}),
        )
        .await
    }

    async fn untakedown_record(
        &self,
        record_uri: &str,
        seen: DateTime<Utc>,
    ) -> Result<(), DataplaneError> {
        self.call(
            "UntakedownRecord",
            json!({"recordUri": record_uri, "seenAt": seen_at(seen)}),
        )
        .await
    }
}

/// Reference string recorded with a takedown: the label's creation
/// timestamp with every non-alphanumeric character stripped.
pub fn takedown_ref(cts: &str) -> String {
    let stripped: String = cts.chars().filter(char::is_ascii_alphanumeric).collect();
    format!("BSKY-TAKEDOWN-{stripped}")
}

/// Dispatches takedown labels from the trusted moderation service
pub struct TakedownDispatcher {
    mod_service_did: String,
    dataplane: Arc<dyn Dataplane>,
}

impl TakedownDispatcher {
    pub fn new(mod_service_did: String, dataplane: Arc<dyn Dataplane>) -> Self {
        Self {
            mod_service_did,
            dataplane,
        }
    }

    /// Only the trusted service's `!takedown` labels are dispatched
    pub fn applies(&self, label: &Label) -> bool {
        label.src == self.mod_service_did && label.val == TAKEDOWN_VALUE
    }

    /// Dispatch one takedown. RPC failures are logged and swallowed; the
    /// label row is already inserted by the time this runs.
    pub async fn dispatch(&self, label: &Label) {
        let seen = Utc::now();
        let takedown_ref = takedown_ref(&label.cts);

        let result = if label.uri.starts_with("did:") {
            if label.is_negation() {
                self.dataplane.untakedown_actor(&label.uri, seen).await
            } else {
                self.dataplane
                    .takedown_actor(&label.uri, &takedown_ref, seen)
                    .await
            }
        } else if label.uri.starts_with("at://") {
            if label.is_negation() {
                self.dataplane.untakedown_record(&label.uri, seen).await
            } else {
                self.dataplane
                    .takedown_record(&label.uri, &takedown_ref, seen)
                    .await
            }
        } else {
            error!(uri = %label.uri, "takedown subject is neither a DID nor a record URI");
            return;
        };

        if let Err(e) = result {
            warn!(uri = %label.uri, error = %e, "takedown dispatch failed");
        }
    }
}
