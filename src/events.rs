//! Completion events reported by collaborators.
//!
//! Collaborators never call back into tasks. They post a [`PipelineEvent`]
//! on an [`EventSender`]; the dispatcher's event loop turns each event into
//! the follow-up task, which then waits its turn on the task queue.

use tokio::sync::mpsc;

use crate::download::DownloadResult;
use crate::network::{PrefetchRequestStatus, RenderPageInfo};

/// A finished external operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineEvent {
    /// A GeneratePageBundle RPC returned.
    GeneratePageBundleFinished {
        /// Outcome of the RPC.
        status: PrefetchRequestStatus,
        /// Operation started by the service; empty on failure.
        operation_name: String,
        /// Per-page results.
        pages: Vec<RenderPageInfo>,
    },
    /// A GetOperation RPC returned.
    GetOperationFinished {
        /// Outcome of the RPC.
        status: PrefetchRequestStatus,
        /// The polled operation.
        operation_name: String,
        /// Per-page results.
        pages: Vec<RenderPageInfo>,
    },
    /// A push message announced that an operation completed.
    OperationCompleted {
        /// The completed operation.
        operation_name: String,
    },
    /// An archive download finished.
    DownloadFinished(DownloadResult),
    /// An archive import finished.
    ImportFinished {
        /// Imported item.
        offline_id: i64,
        /// Whether the page was stored.
        success: bool,
    },
}

/// Sending half handed to collaborators.
pub type EventSender = mpsc::UnboundedSender<PipelineEvent>;

/// Receiving half consumed by the dispatcher.
pub type EventReceiver = mpsc::UnboundedReceiver<PipelineEvent>;

/// Creates an event channel.
#[must_use]
pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
