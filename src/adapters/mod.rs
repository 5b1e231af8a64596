//! Adapters translate one `Ingester.ingester` kind into a stream of
//! `(Event, raw_payload)` pairs fed to the pipeline.
//! The orchestrator owns each adapter's lifetime; adapters themselves only
//! know how to run until cancelled and report what they produce.

pub mod informer;
pub mod logs;
pub mod webhook;

use async_trait::async_trait;
use serde_json::Value;
use snafu::Snafu;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::event::Event;

/// What an adapter emits: the normalized-enough-to-route `Event` plus
/// whatever raw payload it was decoded from (used by field mappings).
pub type EventSender = mpsc::Sender<(Event, Value)>;

#[derive(Debug, Snafu)]
pub enum AdapterError {
    #[snafu(display("{source_name}: watch stream ended unexpectedly"))]
    StreamEnded { source_name: String },
    #[snafu(display("{source_name}: store error: {cause}"))]
    Store { source_name: String, cause: crate::error::StoreError },
    #[snafu(display("{source_name}: missing required spec: {detail}"))]
    InvalidSpec { source_name: String, detail: String },
}

/// One running event source. `run` is expected to honor `cancel` promptly
/// and return once its
/// upstream is exhausted or cancellation is observed.
#[async_trait]
pub trait Adapter: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, cancel: CancellationToken, out: EventSender) -> Result<(), AdapterError>;
}
