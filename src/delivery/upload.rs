//! Push delivery to a remote `/upload-model` endpoint.

use super::{DeliveryChannel, ModelStore};
use crate::error::{BridgeError, Result};
use crate::host::{MainLoopHandle, SharedState};
use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Header carrying the metadata JSON.
pub const METADATA_HEADER: &str = "X-Model-Metadata";

/// Stores locally, then uploads on a background thread.
///
/// The worker never touches the scene or the status directly; it posts its
/// outcome back to the main loop.
pub struct HttpUploader {
    endpoint: String,
    store: Arc<ModelStore>,
    main_loop: MainLoopHandle,
    state: Arc<SharedState>,
    timeout: Duration,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl HttpUploader {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(
        endpoint: impl Into<String>,
        store: Arc<ModelStore>,
        main_loop: MainLoopHandle,
        state: Arc<SharedState>,
    ) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            store,
            main_loop,
            state,
            timeout: Self::DEFAULT_TIMEOUT,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn upload_url(&self) -> String {
        format!("{}/upload-model", self.endpoint)
    }

    /// Wait for every upload started so far.
    pub fn flush(&self) {
        let workers: Vec<_> = self
            .workers
            .lock()
            .map(|mut w| w.drain(..).collect())
            .unwrap_or_default();
        for worker in workers {
            if worker.join().is_err() {
                warn!("Upload worker panicked");
            }
        }
    }
}

fn post_payload(url: &str, payload: Vec<u8>, metadata: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::blocking::Client::builder().timeout(timeout).build()?;
    // Metadata may carry non-ASCII text; send the raw UTF-8 bytes.
    let header = HeaderValue::from_bytes(metadata.as_bytes())
        .map_err(|e| BridgeError::Export(format!("metadata is not a valid header value: {}", e)))?;
    client
        .post(url)
        .header(CONTENT_TYPE, "application/octet-stream")
        .header(METADATA_HEADER, header)
        .body(payload)
        .send()?
        .error_for_status()?;
    Ok(())
}

impl DeliveryChannel for HttpUploader {
    fn name(&self) -> &'static str {
        "http"
    }

    fn deliver(&self, payload: Vec<u8>, metadata: Value) -> Result<()> {
        let header = serde_json::to_string(&metadata)?;
        self.store.store(payload.clone(), metadata);

        let url = self.upload_url();
        let timeout = self.timeout;
        let main_loop = self.main_loop.clone();
        let state = Arc::clone(&self.state);

        let worker = std::thread::Builder::new()
            .name("glb-upload".to_string())
            .spawn(move || {
                let size = payload.len();
                let outcome = match post_payload(&url, payload, &header, timeout) {
                    Ok(()) => {
                        debug!(url = %url, size, "Uploaded model");
                        format!("Uploaded to {}", url)
                    }
                    Err(e) => {
                        warn!(url = %url, error = %e, "Upload failed, model kept on the local server");
                        format!("Upload failed ({}), model kept on the local server", e)
                    }
                };
                main_loop.post("upload-result", move |_scene| state.set_delivery(outcome));
            })?;

        if let Ok(mut workers) = self.workers.lock() {
            workers.retain(|w| !w.is_finished());
            workers.push(worker);
        }
        Ok(())
    }
}

impl HttpUploader {
    /// Uploads started and not yet joined or finished.
    pub fn in_flight(&self) -> usize {
        self.workers.lock().map(|w| w.len()).unwrap_or(0)
    }
}
