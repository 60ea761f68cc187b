// SPDX-License-Identifier: MPL-2.0

//! One long-lived subscription per publisher: WebSocket lifecycle, frame
//! dispatch, cursor persistence, and bounded reconnect.

use crate::atproto::frames::{decode_frame, Frame};
use crate::atproto::identity::{DidResolver, ResolveError};
use crate::atproto::LabelsMessage;
use crate::sink::{LabelRow, LabelSink};
use crate::store::{CachedIdentity, CursorStore, IdentityStore, StateDb};
use crate::takedown::TakedownDispatcher;
use crate::validator::LabelValidator;
use futures_util::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{error, info, warn};

const RECONNECT_BASE: Duration = Duration::from_secs(5);
const MAX_RECONNECT_ATTEMPTS: u32 = 10;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

enum Drive {
    /// Cancelled; socket closed cleanly
    Shutdown,
    /// Transport closed or errored; candidate for reconnect
    Lost,
}

pub struct PublisherConnection {
    did: String,
    store: StateDb,
    resolver: Arc<dyn DidResolver>,
    validator: Arc<LabelValidator>,
    sink: Arc<dyn LabelSink>,
    takedowns: Option<Arc<TakedownDispatcher>>,
    connected: Arc<AtomicBool>,
    shutdown: broadcast::Sender<()>,
}

impl PublisherConnection {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        did: String,
        store: StateDb,
        resolver: Arc<dyn DidResolver>,
        validator: Arc<LabelValidator>,
        sink: Arc<dyn LabelSink>,
        takedowns: Option<Arc<TakedownDispatcher>>,
        shutdown: broadcast::Sender<()>,
    ) -> Self {
        Self {
            did,
            store,
            resolver,
            validator,
            sink,
            takedowns,
            connected: Arc::new(AtomicBool::new(false)),
            shutdown,
        }
    }

    /// Snapshot handle for the orchestrator's status map
    pub fn connected_flag(&self) -> Arc<AtomicBool> {
        self.connected.clone()
    }

    /// Run until shutdown, the publisher goes dead, or retries are exhausted
    pub async fn run(self) {
        let mut shutdown = self.shutdown.subscribe();
        let mut attempts: u32 = 0;

        loop {
            match self.endpoint().await {
                Ok(Some(endpoint)) => {
                    let cursor = self.cursor();
                    let url = subscribe_url(&endpoint, cursor);

                    match connect_async(&url).await {
                        Ok((ws, _)) => {
                            info!(did = %self.did, cursor, "label subscription open");
                            self.connected.store(true, Ordering::SeqCst);
                            let outcome = self.drive(ws, &mut shutdown, &mut attempts).await;
                            self.connected.store(false, Ordering::SeqCst);

                            if matches!(outcome, Drive::Shutdown) {
                                return;
                            }
                        }
                        Err(e) => warn!(did = %self.did, error = %e, "websocket connect failed"),
                    }
                }
                // A resolved document without a labeler endpoint is terminal
                Ok(None) => {
                    error!(did = %self.did, "publisher declares no labeler endpoint; giving up");
                    return;
                }
                Err(e) => warn!(did = %self.did, error = %e, "endpoint resolution failed"),
            }

            attempts += 1;
            if attempts > MAX_RECONNECT_ATTEMPTS {
                error!(did = %self.did, "reconnect attempts exhausted; publisher is dead");
                return;
            }

            let delay = RECONNECT_BASE * attempts;
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => return,
            }
        }
    }

    /// Receive loop for one socket. Each frame is fully handled before the
    /// next read, so cursor and sink writes stay ordered per publisher.
    async fn drive(
        &self,
        mut ws: WsStream,
        shutdown: &mut broadcast::Receiver<()>,
        attempts: &mut u32,
    ) -> Drive {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    let _ = ws.close(None).await;
                    return Drive::Shutdown;
                }
                message = ws.next() => match message {
                    Some(Ok(Message::Binary(buf))) => {
                        *attempts = 0;
                        self.handle_message(&buf).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(did = %self.did, "subscription closed by server");
                        return Drive::Lost;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(did = %self.did, error = %e, "websocket error");
                        return Drive::Lost;
                    }
                }
            }
        }
    }

    async fn handle_message(&self, buf: &[u8]) {
        match decode_frame(buf) {
            Ok(Frame::Labels(msg)) => self.handle_labels(msg).await,
            Ok(Frame::Info(frame)) => info!(
                did = %self.did,
                name = %frame.name,
                message = frame.message.as_deref().unwrap_or(""),
                "subscription info"
            ),
            Ok(Frame::Error(frame)) => warn!(
                did = %self.did,
                error = %frame.error,
                message = frame.message.as_deref().unwrap_or(""),
                "error frame from publisher"
            ),
            Err(e) => warn!(did = %self.did, error = %e, "dropping frame"),
        }
    }

    async fn handle_labels(&self, msg: LabelsMessage) {
        // Cursor first: a crash mid-batch replays the frame instead of
        // skipping it, and the publisher attested to the sequence either way
        if let Err(e) = CursorStore::new(&self.store).set(&self.did, msg.seq) {
            warn!(did = %self.did, seq = msg.seq, error = %e, "failed to persist cursor");
        }

        for label in &msg.labels {
            let verdict = self.validator.validate(label, &self.did).await;
            if !verdict.valid {
                info!(
                    did = %self.did,
                    uri = %label.uri,
                    val = %label.val,
                    reason = verdict.reason.as_deref().unwrap_or(""),
                    "dropping label"
                );
                continue;
            }

            let row = LabelRow::from(label);
            if let Err(e) = self.sink.insert(&row).await {
                warn!(did = %self.did, uri = %label.uri, error = %e, "label insert failed");
                continue;
            }

            if let Some(takedowns) = &self.takedowns {
                if takedowns.applies(label) {
                    takedowns.dispatch(label).await;
                }
            }
        }
    }

    /// Labeler endpoint, preferring the cached identity
    async fn endpoint(&self) -> Result<Option<String>, ResolveError> {
        match IdentityStore::new(&self.store).get(&self.did) {
            Ok(Some(identity)) if !identity.endpoint.is_empty() => {
                return Ok(Some(identity.endpoint))
            }
            Ok(_) => {}
            Err(e) => warn!(did = %self.did, error = %e, "identity cache read failed"),
        }

        let doc = self.resolver.resolve(&self.did, false).await?;

        if let Some(key) = doc.labeler_key() {
            let identity = CachedIdentity {
                signing_key: key.to_string(),
                endpoint: doc.labeler_endpoint().unwrap_or_default().to_string(),
            };
            if let Err(e) = IdentityStore::new(&self.store).set(&self.did, &identity) {
                warn!(did = %self.did, error = %e, "failed to cache identity");
            }
        }

        Ok(doc.labeler_endpoint().map(str::to_string))
    }

    /// Latest persisted cursor; absent means full replay from 0
    fn cursor(&self) -> i64 {
        match CursorStore::new(&self.store).get(&self.did) {
            Ok(cursor) => cursor.unwrap_or(0),
            Err(e) => {
                warn!(did = %self.did, error = %e, "cursor read failed; starting from 0");
                0
            }
        }
    }
}

/// Subscription URL with the replay cursor; http(s) endpoints map to ws(s)
fn subscribe_url(endpoint: &str, cursor: i64) -> String {
    let base = endpoint.trim_end_matches('/');
    let base = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        base.to_string()
    };

    format!("{base}/xrpc/com.atproto.label.subscribeLabels?cursor={cursor}")
}
