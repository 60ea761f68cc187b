// SPDX-License-Identifier: MPL-2.0

//! Label validation: shape, source binding, signature, declared values,
//! expiry. Outcomes are data, not errors; the stream never stops for an
//! invalid label.

use crate::atproto::identity::DidResolver;
use crate::atproto::records::DeclaredValueSource;
use crate::atproto::signing::{signing_payload, LabelerKey};
use crate::atproto::Label;
use crate::store::{CachedIdentity, IdentityStore, ServiceStore, StateDb};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;

/// Label values every publisher may emit without declaring them. Matches the
/// AppView's accepted defaults.
pub const GLOBAL_LABEL_VALUES: &[&str] = &["porn", "sexual", "nudity", "graphic-media", "gore"];

/// Outcome of validating one label
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub valid: bool,
    pub reason: Option<String>,
}

impl Verdict {
    fn ok() -> Self {
        Self {
            valid: true,
            reason: None,
        }
    }

    fn fail(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            reason: Some(reason.into()),
        }
    }
}

pub struct LabelValidator {
    store: StateDb,
    resolver: Arc<dyn DidResolver>,
    records: Arc<dyn DeclaredValueSource>,
}

impl LabelValidator {
    pub fn new(
        store: StateDb,
        resolver: Arc<dyn DidResolver>,
        records: Arc<dyn DeclaredValueSource>,
    ) -> Self {
        Self {
            store,
            resolver,
            records,
        }
    }

    /// Run the ordered checks; the first failure wins
    pub async fn validate(&self, label: &Label, expected_did: &str) -> Verdict {
        if let Some(field) = missing_field(label) {
            return Verdict::fail(format!("missing required field {field}"));
        }

        if label.src != expected_did {
            return Verdict::fail("source DID does not match");
        }

        if let Some(verdict) = self.check_signature(label).await {
            return verdict;
        }

        if let Some(verdict) = self.check_declared_value(label).await {
            return verdict;
        }

        if let Some(exp) = &label.exp {
            if is_expired(exp) {
                return Verdict::fail("expired");
            }
        }

        Verdict::ok()
    }

    /// Verify the signature, refreshing the key once on failure.
    /// `None` means the check passed.
    async fn check_signature(&self, label: &Label) -> Option<Verdict> {
        let Some(sig) = label.sig.as_ref() else {
            return Some(Verdict::fail("missing required field sig"));
        };

        let payload = match signing_payload(label) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(src = %label.src, error = %e, "could not encode signing payload");
                return Some(Verdict::fail("invalid signature"));
            }
        };

        let Some(identity) = self.identity(&label.src).await else {
            return Some(Verdict::fail("could not resolve signing key"));
        };

        if verify_with(&identity.signing_key, &payload, sig) {
            return None;
        }

        // One refresh absorbs a key rotation; an identical key means the
        // signature is simply wrong.
        let Some(fresh) = self.refresh_identity(&label.src).await else {
            return Some(Verdict::fail("invalid signature"));
        };
        if fresh.signing_key != identity.signing_key
            && verify_with(&fresh.signing_key, &payload, sig)
        {
            return None;
        }

        Some(Verdict::fail("invalid signature"))
    }

    /// `None` means the value is allowed
    async fn check_declared_value(&self, label: &Label) -> Option<Verdict> {
        if GLOBAL_LABEL_VALUES.contains(&label.val.as_str()) {
            return None;
        }

        let cached = match ServiceStore::new(&self.store).get(&label.src) {
            Ok(cached) => cached,
            Err(e) => {
                warn!(src = %label.src, error = %e, "service cache read failed");
                None
            }
        };

        let declared = match cached {
            Some(values) => values,
            None => self
                .records
                .declared_values(&label.src)
                .await
                .unwrap_or_default(),
        };

        if declared.iter().any(|v| v == &label.val) {
            None
        } else {
            Some(Verdict::fail("value not in labeler's declared values"))
        }
    }

    /// Cached identity, resolving and caching on miss
    async fn identity(&self, did: &str) -> Option<CachedIdentity> {
        match IdentityStore::new(&self.store).get(did) {
            Ok(Some(identity)) => return Some(identity),
            Ok(None) => {}
            Err(e) => warn!(did, error = %e, "identity cache read failed"),
        }

        self.resolve_and_cache(did, false).await
    }

    /// Re-resolve bypassing resolver caches; updates the identity cache
    async fn refresh_identity(&self, did: &str) -> Option<CachedIdentity> {
        self.resolve_and_cache(did, true).await
    }

    async fn resolve_and_cache(&self, did: &str, no_cache: bool) -> Option<CachedIdentity> {
        let doc = match self.resolver.resolve(did, no_cache).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!(did, error = %e, "identity resolution failed");
                return None;
            }
        };

        let signing_key = doc.labeler_key()?.to_string();
        let identity = CachedIdentity {
            signing_key,
            endpoint: doc.labeler_endpoint().unwrap_or_default().to_string(),
        };

        if let Err(e) = IdentityStore::new(&self.store).set(did, &identity) {
            warn!(did, error = %e, "failed to cache identity");
        }

        Some(identity)
    }
}

fn verify_with(multikey: &str, payload: &[u8], sig: &[u8]) -> bool {
    match LabelerKey::parse(multikey) {
        Ok(key) => key.verify(payload, sig),
        Err(e) => {
            warn!(error = %e, "unusable signing key");
            false
        }
    }
}

fn missing_field(label: &Label) -> Option<&'static str> {
    if label.src.is_empty() {
        return Some("src");
    }
    if label.uri.is_empty() {
        return Some("uri");
    }
    if label.val.is_empty() {
        return Some("val");
    }
    if label.cts.is_empty() {
        return Some("cts");
    }
    if label.sig.as_ref().map_or(true, |sig| sig.is_empty()) {
        return Some("sig");
    }
    None
}

fn is_expired(exp: &str) -> bool {
    // An unparseable timestamp never compares as past
    DateTime::parse_from_rfc3339(exp)
        .map(|t| t.with_timezone(&Utc) <= Utc::now())
        .unwrap_or(false)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::atproto::identity::ResolveError;
    use crate::atproto::signing::tests::{sign_label, test_keypair};
    use crate::atproto::{DidDocument, ServiceEntry, VerificationMethod};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    pub(crate) const DID: &str = "did:plc:publisher";

    /// Resolver returning queued documents; the last one is sticky
    pub(crate) struct StaticResolver {
        docs: StdMutex<VecDeque<DidDocument>>,
        pub(crate) refresh_calls: AtomicUsize,
    }

    impl StaticResolver {
        pub(crate) fn new(docs: Vec<DidDocument>) -> Self {
            Self {
                docs: StdMutex::new(docs.into()),
                refresh_calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl DidResolver for StaticResolver {
        async fn resolve(&self, did: &str, no_cache: bool) -> Result<DidDocument, ResolveError> {
            if no_cache {
                self.refresh_calls.fetch_add(1, Ordering::SeqCst);
            }
            let mut docs = self.docs.lock().unwrap();
            if docs.len() > 1 {
                Ok(docs.pop_front().unwrap())
            } else {
                docs.front()
                    .cloned()
                    .ok_or_else(|| ResolveError::UnsupportedMethod(did.to_string()))
            }
        }
    }

    /// Declared-value source with a fixed answer
    pub(crate) struct StaticValues(pub(crate) Option<Vec<String>>);

    #[async_trait]
    impl DeclaredValueSource for StaticValues {
        async fn declared_values(&self, _did: &str) -> Option<Vec<String>> {
            self.0.clone()
        }
    }

    pub(crate) fn doc_with_key(multikey: &str) -> DidDocument {
        DidDocument {
            id: DID.to_string(),
            verification_method: vec![VerificationMethod {
                id: format!("{DID}#atproto_label"),
                public_key_multibase: Some(multikey.to_string()),
            }],
            service: vec![ServiceEntry {
                id: "#atproto_labeler".to_string(),
                service_endpoint: serde_json::Value::String(
                    "https://labeler.example.com".to_string(),
                ),
            }],
        }
    }

    fn label(val: &str) -> Label {
        Label {
            src: DID.to_string(),
            uri: "at://did:plc:subject/app.bsky.feed.post/1".to_string(),
            cid: None,
            val: val.to_string(),
            neg: None,
            cts: "2024-01-01T00:00:00Z".to_string(),
            exp: None,
            ver: None,
            sig: None,
        }
    }

    fn validator_with(
        db: &StateDb,
        resolver: StaticResolver,
        declared: Option<Vec<String>>,
    ) -> LabelValidator {
        LabelValidator::new(
            db.clone(),
            Arc::new(resolver),
            Arc::new(StaticValues(declared)),
        )
    }

    fn open_db(dir: &tempfile::TempDir) -> StateDb {
        StateDb::open(&dir.path().join("state.sqlite")).unwrap()
    }

    fn declared(vals: &[&str]) -> Option<Vec<String>> {
        Some(vals.iter().map(|v| v.to_string()).collect())
    }

    #[tokio::test]
    async fn test_valid_label_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (secret, multikey) = test_keypair();
        let validator = validator_with(
            &db,
            StaticResolver::new(vec![doc_with_key(&multikey)]),
            declared(&["spam"]),
        );

        let mut label = label("spam");
        sign_label(&secret, &mut label);

        assert_eq!(validator.validate(&label, DID).await, Verdict::ok());
    }

    #[tokio::test]
    async fn test_missing_fields_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (secret, multikey) = test_keypair();
        let validator = validator_with(
            &db,
            StaticResolver::new(vec![doc_with_key(&multikey)]),
            declared(&["spam"]),
        );

        let mut unsigned = label("spam");
        let verdict = validator.validate(&unsigned, DID).await;
        assert_eq!(verdict.reason.as_deref(), Some("missing required field sig"));

        sign_label(&secret, &mut unsigned);
        unsigned.cts = String::new();
        let verdict = validator.validate(&unsigned, DID).await;
        assert_eq!(verdict.reason.as_deref(), Some("missing required field cts"));
    }

    #[tokio::test]
    async fn test_source_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (secret, multikey) = test_keypair();
        let validator = validator_with(
            &db,
            StaticResolver::new(vec![doc_with_key(&multikey)]),
            declared(&["spam"]),
        );

        let mut label = label("spam");
        sign_label(&secret, &mut label);

        let verdict = validator.validate(&label, "did:plc:other").await;
        assert_eq!(verdict.reason.as_deref(), Some("source DID does not match"));
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (_, multikey) = test_keypair();
        let (other_secret, _) = test_keypair();
        let validator = validator_with(
            &db,
            StaticResolver::new(vec![doc_with_key(&multikey)]),
            declared(&["spam"]),
        );

        let mut label = label("spam");
        sign_label(&other_secret, &mut label);

        let verdict = validator.validate(&label, DID).await;
        assert_eq!(verdict.reason.as_deref(), Some("invalid signature"));
    }

    #[tokio::test]
    async fn test_unresolvable_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (secret, _) = test_keypair();
        let validator = validator_with(&db, StaticResolver::new(vec![]), declared(&["spam"]));

        let mut label = label("spam");
        sign_label(&secret, &mut label);

        let verdict = validator.validate(&label, DID).await;
        assert_eq!(
            verdict.reason.as_deref(),
            Some("could not resolve signing key")
        );
    }

    #[tokio::test]
    async fn test_key_rotation_refresh_recovers() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (_, old_multikey) = test_keypair();
        let (new_secret, new_multikey) = test_keypair();

        // First resolution caches the old key; the refresh returns the new one
        let resolver = StaticResolver::new(vec![
            doc_with_key(&old_multikey),
            doc_with_key(&new_multikey),
        ]);
        let validator = validator_with(&db, resolver, declared(&["spam"]));

        let mut label = label("spam");
        sign_label(&new_secret, &mut label);

        assert_eq!(validator.validate(&label, DID).await, Verdict::ok());

        // The refreshed key is now the cached one
        let cached = IdentityStore::new(&db).get(DID).unwrap().unwrap();
        assert_eq!(cached.signing_key, new_multikey);
    }

    #[tokio::test]
    async fn test_identical_key_on_refresh_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (_, multikey) = test_keypair();
        let (other_secret, _) = test_keypair();
        let resolver = Arc::new(StaticResolver::new(vec![doc_with_key(&multikey)]));
        let validator = LabelValidator::new(
            db.clone(),
            resolver.clone(),
            Arc::new(StaticValues(declared(&["spam"]))),
        );

        let mut label = label("spam");
        sign_label(&other_secret, &mut label);

        let verdict = validator.validate(&label, DID).await;
        assert_eq!(verdict.reason.as_deref(), Some("invalid signature"));

        // Exactly one refresh attempt was made
        assert_eq!(resolver.refresh_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_global_value_bypasses_declared_check() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (secret, multikey) = test_keypair();
        let validator = validator_with(
            &db,
            StaticResolver::new(vec![doc_with_key(&multikey)]),
            declared(&[]),
        );

        let mut label = label("porn");
        sign_label(&secret, &mut label);

        assert_eq!(validator.validate(&label, DID).await, Verdict::ok());
    }

    #[tokio::test]
    async fn test_undeclared_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (secret, multikey) = test_keypair();
        let validator = validator_with(
            &db,
            StaticResolver::new(vec![doc_with_key(&multikey)]),
            declared(&["spam"]),
        );

        let mut label = label("nsfw");
        sign_label(&secret, &mut label);

        let verdict = validator.validate(&label, DID).await;
        assert_eq!(
            verdict.reason.as_deref(),
            Some("value not in labeler's declared values")
        );
    }

    #[tokio::test]
    async fn test_fetch_failure_allows_only_globals() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (secret, multikey) = test_keypair();
        let validator = validator_with(
            &db,
            StaticResolver::new(vec![doc_with_key(&multikey)]),
            None,
        );

        let mut label = label("spam");
        sign_label(&secret, &mut label);

        let verdict = validator.validate(&label, DID).await;
        assert_eq!(
            verdict.reason.as_deref(),
            Some("value not in labeler's declared values")
        );
    }

    #[tokio::test]
    async fn test_cached_declared_values_skip_fetch() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (secret, multikey) = test_keypair();

        // The cache already has the values; the source would deny them
        ServiceStore::new(&db)
            .set(DID, &["spam".to_string()])
            .unwrap();
        let validator = validator_with(
            &db,
            StaticResolver::new(vec![doc_with_key(&multikey)]),
            None,
        );

        let mut label = label("spam");
        sign_label(&secret, &mut label);

        assert_eq!(validator.validate(&label, DID).await, Verdict::ok());
    }

    #[tokio::test]
    async fn test_expired_label_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (secret, multikey) = test_keypair();
        let validator = validator_with(
            &db,
            StaticResolver::new(vec![doc_with_key(&multikey)]),
            declared(&["spam"]),
        );

        let mut label = label("spam");
        label.exp = Some("1999-01-01T00:00:00Z".to_string());
        sign_label(&secret, &mut label);

        let verdict = validator.validate(&label, DID).await;
        assert_eq!(verdict.reason.as_deref(), Some("expired"));
    }

    #[tokio::test]
    async fn test_future_expiry_accepted() {
        let dir = tempfile::tempdir().unwrap();
        let db = open_db(&dir);
        let (secret, multikey) = test_keypair();
        let validator = validator_with(
            &db,
            StaticResolver::new(vec![doc_with_key(&multikey)]),
            declared(&["spam"]),
        );

        let mut label = label("spam");
        label.exp = Some("2099-01-01T00:00:00Z".to_string());
        sign_label(&secret, &mut label);

        assert_eq!(validator.validate(&label, DID).await, Verdict::ok());
    }

    #[test]
    fn test_unparseable_expiry_is_not_expired() {
        assert!(!is_expired("not-a-date"));
        assert!(is_expired("1999-01-01T00:00:00Z"));
    }
}
