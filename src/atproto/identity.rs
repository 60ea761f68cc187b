// SPDX-License-Identifier: MPL-2.0

//! DID resolution for publishers.
//!
//! A composite resolver dispatches on the DID method prefix: `did:plc` goes
//! to the PLC directory, `did:web` to the host's well-known document. A
//! short-lived in-memory document cache plus a per-DID flight lock keeps
//! startup from hammering the directory with identical resolutions.

use crate::atproto::DidDocument;
use async_trait::async_trait;
use reqwest::Client;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;

const HTTP_TIMEOUT: Duration = Duration::from_secs(30);
/// Resolved documents are reused for this long before the directory is asked
/// again; the durable 24 h cache lives in the state store, not here.
const RECENT_DOC_TTL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("unsupported DID method: {0}")]
    UnsupportedMethod(String),
    #[error("invalid did:web identifier: {0}")]
    InvalidWebDid(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("resolver returned status {0}")]
    Status(u16),
}

#[async_trait]
pub trait DidResolver: Send + Sync {
    /// Resolve a DID to its document. `no_cache` bypasses any resolver-side
    /// caching; refresh paths pass `true`.
    async fn resolve(&self, did: &str, no_cache: bool) -> Result<DidDocument, ResolveError>;
}

/// Resolver for `did:plc` via a PLC directory
pub struct PlcResolver {
    http: Client,
    base_url: String,
}

impl PlcResolver {
    pub fn new(http: Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn fetch(&self, did: &str) -> Result<DidDocument, ResolveError> {
        let url = format!("{}/{}", self.base_url, did);
        let response = self.http.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(ResolveError::Status(response.status().as_u16()));
        }

        Ok(response.json().await?)
    }
}

/// Resolver for `did:web` via the host's well-known document
pub struct WebResolver {
    http: Client,
}

impl WebResolver {
    pub fn new(http: Client) -> Self {
        Self { http }
    }

    async fn fetch(&self, did: &str) -> Result<DidDocument, ResolveError> {
        let url = web_did_url(did)?;
        let response = self.http.get(&url).send().await?;

        if !response.status().is_success() {
            return Err(ResolveError::Status(response.status().as_u16()));
        }

        Ok(response.json().await?)
    }
}

/// Translate a did:web identifier into its document URL
fn web_did_url(did: &str) -> Result<String, ResolveError> {
    let id = did
        .strip_prefix("did:web:")
        .ok_or_else(|| ResolveError::InvalidWebDid(did.to_string()))?;
    if id.is_empty() {
        return Err(ResolveError::InvalidWebDid(did.to_string()));
    }

    let mut segments = id.split(':');
    // Ports are percent-encoded in the method-specific identifier
    let host = segments.next().unwrap_or_default().replace("%3A", ":");
    let path: Vec<&str> = segments.collect();

    if path.is_empty() {
        Ok(format!("https://{}/.well-known/did.json", host))
    } else {
        Ok(format!("https://{}/{}/did.json", host, path.join("/")))
    }
}

/// Composite resolver dispatching on the DID method
pub struct IdentityResolver {
    plc: PlcResolver,
    web: WebResolver,
    recent: StdMutex<HashMap<String, (Instant, DidDocument)>>,
    inflight: AsyncMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl IdentityResolver {
    pub fn new(plc_url: &str) -> Result<Self, ResolveError> {
        let http = Client::builder().timeout(HTTP_TIMEOUT).build()?;

        Ok(Self {
            plc: PlcResolver::new(http.clone(), plc_url),
            web: WebResolver::new(http),
            recent: StdMutex::new(HashMap::new()),
            inflight: AsyncMutex::new(HashMap::new()),
        })
    }

    async fn dispatch(&self, did: &str) -> Result<DidDocument, ResolveError> {
        if did.starts_with("did:plc:") {
            self.plc.fetch(did).await
        } else if did.starts_with("did:web:") {
            self.web.fetch(did).await
        } else {
            let method = did.split(':').nth(1).unwrap_or(did);
            Err(ResolveError::UnsupportedMethod(method.to_string()))
        }
    }

    fn recent_get(&self, did: &str) -> Option<DidDocument> {
        let mut recent = self.recent.lock().expect("resolver lock poisoned");
        match recent.get(did) {
            Some((at, doc)) if at.elapsed() <= RECENT_DOC_TTL => Some(doc.clone()),
            Some(_) => {
                recent.remove(did);
                None
            }
            None => None,
        }
    }

    fn recent_put(&self, did: &str, doc: &DidDocument) {
        self.recent
            .lock()
            .expect("resolver lock poisoned")
            .insert(did.to_string(), (Instant::now(), doc.clone()));
    }

    /// One flight lock per DID so concurrent resolutions collapse
    async fn flight_lock(&self, did: &str) -> Arc<AsyncMutex<()>> {
        let mut inflight = self.inflight.lock().await;
        inflight
            .entry(did.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}

#[async_trait]
impl DidResolver for IdentityResolver {
    async fn resolve(&self, did: &str, no_cache: bool) -> Result<DidDocument, ResolveError> {
        if !no_cache {
            if let Some(doc) = self.recent_get(did) {
                return Ok(doc);
            }
        }

        let gate = self.flight_lock(did).await;
        let _guard = gate.lock().await;

        // A concurrent flight may have filled the cache while we waited
        if !no_cache {
            if let Some(doc) = self.recent_get(did) {
                return Ok(doc);
            }
        }

        let doc = self.dispatch(did).await?;
        self.recent_put(did, &doc);
        Ok(doc)
    }
}
