//! Shared harness: a relay on ephemeral ports and polling helpers.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use docsync_collab::config::CollabConfig;
use docsync_collab::error::ServerError;
use docsync_collab::provider::{NetworkProvider, ProviderOptions};
use docsync_collab::server::{RelayServer, ServerConfig};
use docsync_core::{SharedDocument, SyncDocument};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use yrs::updates::decoder::Decode;
use yrs::StateVector;

/// A relay serving in the background until [`TestRelay::shutdown`].
pub struct TestRelay {
    pub server: Arc<RelayServer>,
    pub ws_addr: SocketAddr,
    pub api_addr: SocketAddr,
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<(), ServerError>>>,
}

impl TestRelay {
    /// In-memory relay on free ports.
    pub async fn start() -> Self {
        Self::start_with(ServerConfig::for_testing(None)).await
    }

    pub async fn start_with(config: ServerConfig) -> Self {
        let server = Arc::new(RelayServer::new(config).expect("relay should open"));
        let bound = server.bind().await.expect("relay should bind");
        let ws_addr = bound.ws_addr().unwrap();
        let api_addr = bound.api_addr().unwrap();
        let (stop, stopped) = oneshot::channel();
        let task = tokio::spawn(server.clone().serve(bound, async move {
            let _ = stopped.await;
        }));
        Self {
            server,
            ws_addr,
            api_addr,
            stop: Some(stop),
            task: Some(task),
        }
    }

    pub fn collab_config(&self) -> CollabConfig {
        CollabConfig::for_testing(self.ws_addr.port(), self.api_addr.port())
    }

    pub fn api_url(&self) -> String {
        format!("http://{}", self.api_addr)
    }

    /// Networked provider for `document` on its own room.
    pub fn connect(&self, document: &Arc<SharedDocument>) -> NetworkProvider {
        self.connect_dyn(document.guid().to_string(), document.clone())
    }

    pub fn connect_dyn(&self, room: String, document: Arc<dyn SyncDocument>) -> NetworkProvider {
        let config = self.collab_config();
        let options = ProviderOptions::from_config(&config, room);
        NetworkProvider::connect(&config, options, document).expect("provider should start")
    }

    /// Stop serving and release the store.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            task.await.expect("relay task panicked").expect("relay failed");
        }
    }
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Same content and same state vector.
pub fn converged(a: &SharedDocument, b: &SharedDocument) -> bool {
    let sv = |doc: &SharedDocument| StateVector::decode_v1(&doc.state_vector()).ok();
    a.source() == b.source() && sv(a) == sv(b)
}
