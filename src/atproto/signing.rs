// SPDX-License-Identifier: MPL-2.0

//! Key material and signature verification for labels.
//!
//! Publishers sign the DAG-CBOR encoding of the label's declared fields;
//! the signing key is published in the DID document as a multibase string
//! wrapping a multicodec-prefixed compressed SEC1 point.

use crate::atproto::Label;
use k256::ecdsa::signature::Verifier;
use serde::Serialize;
use thiserror::Error;

/// multicodec prefix for secp256k1-pub (0xe7, varint)
const MULTICODEC_SECP256K1: [u8; 2] = [0xe7, 0x01];
/// multicodec prefix for p256-pub (0x1200, varint)
const MULTICODEC_P256: [u8; 2] = [0x80, 0x24];

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("invalid multikey: {0}")]
    InvalidKey(String),
    #[error("unsupported key multicodec")]
    UnsupportedKeyType,
    #[error("payload encoding failed: {0}")]
    Encode(String),
}

/// A publisher's label-signing key, parsed to its curve
pub enum LabelerKey {
    Secp256k1(k256::ecdsa::VerifyingKey),
    P256(p256::ecdsa::VerifyingKey),
}

impl LabelerKey {
    /// Parse a `publicKeyMultibase` string into a verifying key
    pub fn parse(multikey: &str) -> Result<Self, SigningError> {
        let (_, bytes) =
            multibase::decode(multikey).map_err(|e| SigningError::InvalidKey(e.to_string()))?;

        if bytes.len() < 2 {
            return Err(SigningError::InvalidKey("key bytes too short".to_string()));
        }

        let (codec, point) = bytes.split_at(2);
        match codec {
            c if c == MULTICODEC_SECP256K1 => k256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .map(Self::Secp256k1)
                .map_err(|e| SigningError::InvalidKey(e.to_string())),
            c if c == MULTICODEC_P256 => p256::ecdsa::VerifyingKey::from_sec1_bytes(point)
                .map(Self::P256)
                .map_err(|e| SigningError::InvalidKey(e.to_string())),
            _ => Err(SigningError::UnsupportedKeyType),
        }
    }

    /// Verify a compact ECDSA signature over the payload bytes
    pub fn verify(&self, payload: &[u8], sig: &[u8]) -> bool {
        match self {
            Self::Secp256k1(key) => match k256::ecdsa::Signature::from_slice(sig) {
                Ok(sig) => key.verify(payload, &sig).is_ok(),
                Err(_) => false,
            },
            Self::P256(key) => match p256::ecdsa::Signature::from_slice(sig) {
                Ok(sig) => key.verify(payload, &sig).is_ok(),
                Err(_) => false,
            },
        }
    }
}

/// Canonical signing payload: the label's fields, present-only, in this
/// order, DAG-CBOR encoded. The `sig` field is never part of the payload.
#[derive(Serialize)]
struct SignedPayload<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    ver: Option<i64>,
    src: &'a str,
    uri: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    cid: Option<&'a str>,
    val: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    neg: Option<bool>,
    cts: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    exp: Option<&'a str>,
}

/// Encode the canonical signing payload for a label
pub fn signing_payload(label: &Label) -> Result<Vec<u8>, SigningError> {
    let payload = SignedPayload {
        ver: label.ver,
        src: &label.src,
        uri: &label.uri,
        cid: label.cid.as_deref(),
        val: &label.val,
        neg: label.neg,
        cts: &label.cts,
        exp: label.exp.as_deref(),
    };

    serde_ipld_dagcbor::to_vec(&payload).map_err(|e| SigningError::Encode(e.to_string()))
}
