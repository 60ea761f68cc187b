// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

/// A signed moderation label as carried on the subscription wire.
/// Decoupled from any lexicon codegen so we own the API boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Label {
    /// Publisher DID
    pub src: String,
    /// Subject: an account DID or an at:// record URI
    pub uri: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cid: Option<String>,
    /// Label value, e.g. "spam" or "!takedown"
    pub val: String,
    /// True when this label retracts an earlier one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neg: Option<bool>,
    /// Creation timestamp (ISO 8601)
    pub cts: String,
    /// Expiry timestamp (ISO 8601)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ver: Option<i64>,
    /// Raw signature bytes over the canonical signing payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sig: Option<serde_bytes::ByteBuf>,
}

impl Label {
    pub fn is_negation(&self) -> bool {
        self.neg.unwrap_or(false)
    }
}

/// Body of a `#labels` frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelsMessage {
    pub seq: i64,
    pub labels: Vec<Label>,
}

/// Body of a `#info` frame; advisory only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfoMessage {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A resolved DID document, reduced to the parts this service reads
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DidDocument {
    pub id: String,
    #[serde(default)]
    pub verification_method: Vec<VerificationMethod>,
    #[serde(default)]
    pub service: Vec<ServiceEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationMethod {
    pub id: String,
    #[serde(default)]
    pub public_key_multibase: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEntry {
    pub id: String,
    /// Endpoint as declared; only string URLs are usable
    #[serde(default)]
    pub service_endpoint: serde_json::Value,
}

impl DidDocument {
    /// Signing key for labels: the verification method tagged #atproto_label
    pub fn labeler_key(&self) -> Option<&str> {
        self.verification_method
            .iter()
            .find(|m| m.id.ends_with("#atproto_label"))
            .and_then(|m| m.public_key_multibase.as_deref())
    }

    /// Label subscription endpoint: the service tagged #atproto_labeler
    pub fn labeler_endpoint(&self) -> Option<&str> {
        self.service_endpoint("#atproto_labeler")
    }

    /// Repo host for record fetches: the service tagged #atproto_pds
    pub fn pds_endpoint(&self) -> Option<&str> {
        self.service_endpoint("#atproto_pds")
    }

    fn service_endpoint(&self, suffix: &str) -> Option<&str> {
        self.service
            .iter()
            .find(|s| s.id.ends_with(suffix))
            .and_then(|s| s.service_endpoint.as_str())
    }
}

/// `app.bsky.labeler.service` record, as returned by getRecord
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelerRecord {
    #[serde(rename = "$type", default, skip_serializing_if = "Option::is_none")]
    pub record_type: Option<String>,
    #[serde(default)]
    pub policies: LabelerPolicies,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelerPolicies {
    #[serde(default)]
    pub label_values: Vec<String>,
}
