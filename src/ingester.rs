// SPDX-License-Identifier: MPL-2.0

//! Wires the collaborators together: one subscription task per configured
//! publisher, the change watcher, and a periodic status log.

use crate::atproto::identity::{DidResolver, IdentityResolver, ResolveError};
use crate::atproto::records::RecordFetcher;
use crate::config::Config;
use crate::sink::{LabelSink, PgLabelSink, SinkError};
use crate::store::{StateDb, StoreError};
use crate::subscription::PublisherConnection;
use crate::takedown::{DataplaneError, HttpDataplane, TakedownDispatcher};
use crate::validator::LabelValidator;
use crate::watcher::ChangeWatcher;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum IngesterError {
    #[error("already started")]
    AlreadyStarted,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error(transparent)]
    Dataplane(#[from] DataplaneError),
    #[error(transparent)]
    Resolver(#[from] ResolveError),
    #[error("http client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub struct Ingester {
    config: Config,
    shutdown: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    connections: Vec<(String, Arc<AtomicBool>)>,
    sink: Option<Arc<PgLabelSink>>,
    started: bool,
}

impl Ingester {
    pub fn new(config: Config) -> Self {
        let (shutdown, _) = broadcast::channel(8);
        Self {
            config,
            shutdown,
            tasks: Vec::new(),
            connections: Vec::new(),
            sink: None,
            started: false,
        }
    }

    /// Open the stores, start the watcher, then subscribe each publisher.
    /// Subscriptions start sequentially and run concurrently.
    pub async fn start(&mut self) -> Result<(), IngesterError> {
        if self.started {
            return Err(IngesterError::AlreadyStarted);
        }

        let store = StateDb::open(&self.config.state_path)?;
        let sink = Arc::new(
            PgLabelSink::connect(&self.config.db_url, &self.config.db_schema).await?,
        );
        let resolver: Arc<dyn DidResolver> =
            Arc::new(IdentityResolver::new(&self.config.plc_url)?);
        let records = Arc::new(RecordFetcher::new(resolver.clone(), store.clone())?);
        let validator = Arc::new(LabelValidator::new(
            store.clone(),
            resolver.clone(),
            records,
        ));

        let takedowns = match &self.config.mod_service_did {
            Some(mod_did) => {
                let dataplane = HttpDataplane::new(
                    &self.config.dataplane_urls,
                    self.config.dataplane_http_version,
                )?;
                info!(did = %mod_did, "takedown dispatch enabled");
                Some(Arc::new(TakedownDispatcher::new(
                    mod_did.clone(),
                    Arc::new(dataplane),
                )))
            }
            None => None,
        };

        let watcher = ChangeWatcher::new(
            self.config.change_feed_url.clone(),
            self.config.labeler_dids.clone(),
            store.clone(),
            self.shutdown.clone(),
        );
        self.tasks.push(tokio::spawn(watcher.run()));

        for did in &self.config.labeler_dids {
            info!(did = %did, "subscribing to label stream");
            let connection = PublisherConnection::new(
                did.clone(),
                store.clone(),
                resolver.clone(),
                validator.clone(),
                sink.clone() as Arc<dyn LabelSink>,
                takedowns.clone(),
                self.shutdown.clone(),
            );
            self.connections.push((did.clone(), connection.connected_flag()));
            self.tasks.push(tokio::spawn(connection.run()));
        }

        let connections = self.connections.clone();
        let mut shutdown = self.shutdown.subscribe();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(STATUS_LOG_INTERVAL) => {
                        let connected = connections
                            .iter()
                            .filter(|(_, flag)| flag.load(Ordering::SeqCst))
                            .count();
                        info!(connected, total = connections.len(), "label subscriptions");
                    }
                    _ = shutdown.recv() => return,
                }
            }
        }));

        self.sink = Some(sink);
        self.started = true;
        Ok(())
    }

    /// Snapshot of each publisher's connection state
    pub fn status(&self) -> HashMap<String, bool> {
        self.connections
            .iter()
            .map(|(did, flag)| (did.clone(), flag.load(Ordering::SeqCst)))
            .collect()
    }

    /// Signal every task and wait for them; individual failures are
    /// tolerated so the rest of the teardown still runs
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(());

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "task ended abnormally");
            }
        }

        if let Some(sink) = self.sink.take() {
            sink.close().await;
        }

        self.connections.clear();
        self.started = false;
    }
}
