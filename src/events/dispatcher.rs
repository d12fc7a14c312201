//! The dispatcher seam: consumes fully-formed payloads.
use super::payload::EventBatch;

/// Default event collector endpoint.
pub const EVENTS_URL: &str = "https://logx.optimizely.com/v1/events";

/// A fully-built POST request for the event collector.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEvent {
    pub url: String,
    pub params: EventBatch,
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum DispatchError {
    #[error(transparent)]
    Network(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// External sink for event payloads.
///
/// Dispatch failures are logged and the batch is dropped; the SDK keeps no
/// durable queue across restarts.
pub trait EventDispatcher: Send + Sync {
    fn dispatch_event(&self, event: &LogEvent) -> Result<(), DispatchError>;
}

/// Default dispatcher: POSTs the JSON payload to the collector.
pub struct HttpEventDispatcher {
    runtime: tokio::runtime::Runtime,
    client: reqwest::Client,
}

impl HttpEventDispatcher {
    pub fn new() -> std::io::Result<HttpEventDispatcher> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(HttpEventDispatcher {
            runtime,
            client: reqwest::Client::new(),
        })
    }
}

impl EventDispatcher for HttpEventDispatcher {
    fn dispatch_event(&self, event: &LogEvent) -> Result<(), DispatchError> {
        let response = self.runtime.block_on(
            self.client
                .post(&event.url)
                .json(&event.params)
                .send(),
        )?;
        response.error_for_status()?;
        log::debug!(target: "splitstream", "dispatched event batch to {}", event.url);
        Ok(())
    }
}
