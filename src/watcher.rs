// SPDX-License-Identifier: MPL-2.0

//! Watches the external change feed for edits to publishers' service
//! records and force-expires the corresponding service-cache entries.

use crate::store::{ServiceStore, StateDb};
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{info, warn};

const WATCHED_COLLECTION: &str = "app.bsky.labeler.service";
const RECONNECT_BASE: Duration = Duration::from_secs(5);
const RECONNECT_CAP: Duration = Duration::from_secs(60);

#[derive(Deserialize)]
struct ChangeEvent {
    did: String,
    kind: String,
    #[serde(default)]
    commit: Option<CommitInfo>,
}

#[derive(Deserialize)]
struct CommitInfo {
    operation: String,
}

pub struct ChangeWatcher {
    endpoint: String,
    dids: Vec<String>,
    store: StateDb,
    shutdown: broadcast::Sender<()>,
}

impl ChangeWatcher {
    pub fn new(
        endpoint: String,
        dids: Vec<String>,
        store: StateDb,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            endpoint,
            dids,
            store,
            shutdown,
        }
    }

    /// Feed URL filtered server-side to the labeler collection and the
    /// configured publishers
    fn subscribe_url(&self) -> String {
        let mut url = format!("{}?wantedCollections={}", self.endpoint, WATCHED_COLLECTION);
        for did in &self.dids {
            url.push_str("&wantedDids=");
            url.push_str(did);
        }
        url
    }

    /// Run until shutdown. Retries are unbounded: a silent watcher would
    /// stop cache invalidation for every publisher.
    pub async fn run(self) {
        let url = self.subscribe_url();
        let mut shutdown = self.shutdown.subscribe();
        let mut attempts: u32 = 0;

        loop {
            match connect_async(&url).await {
                Ok((mut ws, _)) => {
                    info!("change feed connected");
                    loop {
                        tokio::select! {
                            _ = shutdown.recv() => {
                                let _ = ws.close(None).await;
                                return;
                            }
                            message = ws.next() => match message {
                                Some(Ok(Message::Text(raw))) => {
                                    attempts = 0;
                                    self.handle_event(&raw);
                                }
                                Some(Ok(Message::Close(_))) | None => {
                                    warn!("change feed closed");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(e)) => {
                                    warn!(error = %e, "change feed error");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "change feed connect failed"),
            }

            attempts += 1;
            let delay = std::cmp::min(RECONNECT_BASE * attempts, RECONNECT_CAP);
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => return,
            }
        }
    }

    fn handle_event(&self, raw: &str) {
        let event: ChangeEvent = match serde_json::from_str(raw) {
            Ok(event) => event,
            Err(_) => return,
        };

        if event.kind != "commit" {
            return;
        }
        let Some(commit) = event.commit else { return };
        if commit.operation != "create" && commit.operation != "update" {
            return;
        }
        if !self.dids.iter().any(|d| d == &event.did) {
            return;
        }

        match ServiceStore::new(&self.store).invalidate(&event.did) {
            Ok(()) => info!(did = %event.did, "service record changed; cache invalidated"),
            Err(e) => warn!(did = %event.did, error = %e, "cache invalidation failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DID: &str = "did:plc:publisher";

    fn watcher(db: &StateDb) -> ChangeWatcher {
        let (shutdown, _) = broadcast::channel(1);
        ChangeWatcher::new(
            "wss://jetstream.example.com/subscribe".to_string(),
            vec![DID.to_string()],
            db.clone(),
            shutdown,
        )
    }

    fn db_with_cached_values(dir: &tempfile::TempDir) -> StateDb {
        let db = StateDb::open(&dir.path().join("state.sqlite")).unwrap();
        ServiceStore::new(&db)
            .set(DID, &["spam".to_string()])
            .unwrap();
        db
    }

    fn commit_event(did: &str, operation: &str) -> String {
        format!(
            r#"{{"did":"{did}","time_us":1,"kind":"commit","commit":{{"rev":"a","operation":"{operation}","collection":"app.bsky.labeler.service","rkey":"self"}}}}"#
        )
    }

    #[test]
    fn test_subscribe_url_carries_filters() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_with_cached_values(&dir);

        assert_eq!(
            watcher(&db).subscribe_url(),
            "wss://jetstream.example.com/subscribe?wantedCollections=app.bsky.labeler.service&wantedDids=did:plc:publisher"
        );
    }

    #[test]
    fn test_update_commit_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_with_cached_values(&dir);

        watcher(&db).handle_event(&commit_event(DID, "update"));

        assert_eq!(ServiceStore::new(&db).get(DID).unwrap(), None);
    }

    #[test]
    fn test_create_commit_invalidates() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_with_cached_values(&dir);

        watcher(&db).handle_event(&commit_event(DID, "create"));

        assert_eq!(ServiceStore::new(&db).get(DID).unwrap(), None);
    }

    #[test]
    fn test_delete_commit_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_with_cached_values(&dir);

        watcher(&db).handle_event(&commit_event(DID, "delete"));

        assert_eq!(
            ServiceStore::new(&db).get(DID).unwrap(),
            Some(vec!["spam".to_string()])
        );
    }

    #[test]
    fn test_account_event_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_with_cached_values(&dir);

        watcher(&db).handle_event(&format!(
            r#"{{"did":"{DID}","time_us":1,"kind":"account","account":{{"active":false}}}}"#
        ));

        assert!(ServiceStore::new(&db).get(DID).unwrap().is_some());
    }

    #[test]
    fn test_unwatched_did_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_with_cached_values(&dir);

        watcher(&db).handle_event(&commit_event("did:plc:stranger", "update"));

        assert!(ServiceStore::new(&db).get(DID).unwrap().is_some());
    }

    #[test]
    fn test_malformed_event_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let db = db_with_cached_values(&dir);

        watcher(&db).handle_event("not json at all");

        assert!(ServiceStore::new(&db).get(DID).unwrap().is_some());
    }
}
