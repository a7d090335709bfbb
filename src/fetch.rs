use crossbeam_channel::Sender;
use log::{debug, warn};
use reqwest::blocking::Client;
use thiserror::Error;

use crate::model::{FetchResult, Identifier, RawResource};
use crate::pipeline::CancellationToken;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request for {url} failed: {source}")]
    Request { url: String, source: reqwest::Error },
    #[error("reading body from {url} failed: {source}")]
    Read { url: String, source: reqwest::Error },
    #[error("{0}")]
    Other(String),
}

/// Something that can return the raw body for one identifier.
pub trait ResourceSource: Send + Sync {
    fn fetch(&self, id: Identifier) -> Result<Vec<u8>, FetchError>;
}

/// Blocking HTTP source for `<base-url>/<id>?format=json`.
pub struct HttpSource {
    client: Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(Client::new(), base_url)
    }

    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self { client, base_url: base_url.into().trim_end_matches('/').to_string() }
    }

    pub fn url_for(&self, id: Identifier) -> String {
        format!("{}/{}?format=json", self.base_url, id)
    }
}

impl ResourceSource for HttpSource {
    fn fetch(&self, id: Identifier) -> Result<Vec<u8>, FetchError> {
        let url = self.url_for(id);
        let response = self.client.get(&url).send()
            .map_err(|source| FetchError::Request { url: url.clone(), source })?;
        let status = response.status();
        let body = response.bytes().map_err(|source| FetchError::Read { url: url.clone(), source })?;
        debug!("GET {} -> {} ({} bytes)", url, status, body.len());
        Ok(body.to_vec())
    }
}

/// Fetches every identifier of one span in order and reports each outcome.
/// Returning drops `results`, which ends the paired persister's loop.
pub fn run_fetcher(
    worker: usize,
    span: &[Identifier],
    source: &dyn ResourceSource,
    results: Sender<FetchResult>,
    cancel: &CancellationToken,
) {
    debug!("Fetcher {} started with {} identifiers.", worker, span.len());
    for &id in span {
        let outcome = if cancel.is_cancelled() {
            FetchResult::Skipped(id)
        } else {
            match source.fetch(id) {
                Ok(payload) => FetchResult::Fetched(RawResource::new(id, payload)),
                Err(e) => {
                    warn!("Fetcher {}: dropping {}: {}", worker, id, e);
                    FetchResult::Failed(id)
                }
            }
        };
        if results.send(outcome).is_err() {
            warn!("Fetcher {}: persister channel closed, abandoning span at {}", worker, id);
            return;
        }
    }
    debug!("Fetcher {} finished its span.", worker);
}
