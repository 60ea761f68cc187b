// SPDX-License-Identifier: MPL-2.0

//! Fetching a publisher's declared label values from its repo.

use crate::atproto::identity::{DidResolver, ResolveError};
use crate::atproto::LabelerRecord;
use crate::store::{ServiceStore, StateDb};
use async_trait::async_trait;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

const LABELER_COLLECTION: &str = "app.bsky.labeler.service";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Source of a publisher's declared label values
#[async_trait]
pub trait DeclaredValueSource: Send + Sync {
    /// The values the publisher has announced it may emit, or `None` on any
    /// failure. Failures are logged here, never surfaced to the caller.
    async fn declared_values(&self, did: &str) -> Option<Vec<String>>;
}

#[derive(Error, Debug)]
enum RecordError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error("publisher declares no PDS endpoint")]
    NoPds,
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("PDS returned status {0}")]
    Status(u16),
    #[error("unexpected record type {0:?}")]
    WrongType(String),
}

#[derive(serde::Deserialize)]
struct GetRecordResponse {
    value: LabelerRecord,
}

/// Fetches `app.bsky.labeler.service/self` from the publisher's PDS and
/// writes the result through the service cache.
pub struct RecordFetcher {
    http: Client,
    resolver: Arc<dyn DidResolver>,
    store: StateDb,
}

impl RecordFetcher {
    pub fn new(resolver: Arc<dyn DidResolver>, store: StateDb) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            resolver,
            store,
        })
    }

    async fn fetch(&self, did: &str) -> Result<Vec<String>, RecordError> {
        let doc = self.resolver.resolve(did, false).await?;
        let pds = doc.pds_endpoint().ok_or(RecordError::NoPds)?;

        let url = format!(
            "{}/xrpc/com.atproto.repo.getRecord",
            pds.trim_end_matches('/')
        );
        let response = self
            .http
            .get(&url)
            .query(&[
                ("repo", did),
                ("collection", LABELER_COLLECTION),
                ("rkey", "self"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(RecordError::Status(response.status().as_u16()));
        }

        let record: GetRecordResponse = response.json().await?;
        if let Some(record_type) = &record.value.record_type {
            if record_type != LABELER_COLLECTION {
                return Err(RecordError::WrongType(record_type.clone()));
            }
        }

        Ok(record.value.policies.label_values)
    }
}

#[async_trait]
impl DeclaredValueSource for RecordFetcher {
    async fn declared_values(&self, did: &str) -> Option<Vec<String>> {
        match self.fetch(did).await {
            Ok(values) => {
                if let Err(e) = ServiceStore::new(&self.store).set(did, &values) {
                    warn!(did, error = %e, "failed to cache declared label values");
                }
                Some(values)
            }
            Err(e) => {
                warn!(did, error = %e, "failed to fetch labeler service record");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_record_response_parses() {
        let response: GetRecordResponse = serde_json::from_str(
            r#"{
                "uri": "at://did:plc:a/app.bsky.labeler.service/self",
                "cid": "bafyreihc",
                "value": {
                    "$type": "app.bsky.labeler.service",
                    "policies": {"labelValues": ["spam", "scam"]},
                    "createdAt": "2024-01-01T00:00:00Z"
                }
            }"#,
        )
        .unwrap();

        assert_eq!(response.value.policies.label_values, vec!["spam", "scam"]);
    }

    #[test]
    fn test_record_without_values_is_empty() {
        let response: GetRecordResponse =
            serde_json::from_str(r#"{"value": {"policies": {}}}"#).unwrap();
        assert!(response.value.policies.label_values.is_empty());
    }

    #[test]
    fn test_foreign_record_type_is_detected() {
        let response: GetRecordResponse = serde_json::from_str(
            r#"{"value": {"$type": "app.bsky.feed.generator", "policies": {}}}"#,
        )
        .unwrap();
        assert_eq!(
            response.value.record_type.as_deref(),
            Some("app.bsky.feed.generator")
        );
    }
}
