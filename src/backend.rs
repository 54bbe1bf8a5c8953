//! The append-only event-stream backend contract.
//!
//! An [`EventStreamBackend`] stores one ordered stream per aggregate identity
//! plus a global log in commit order. It offers a conditional append, a full
//! stream read, and a catch-up subscription over the global log.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppendError, TransportError};
use crate::event::{ProposedEvent, RecordedEvent};

/// Concurrency expectation sent with an append.
///
/// Versions count events: a stream holding three events is at version 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExpectedVersion {
    /// Accept any current stream version (no concurrency check).
    Any,
    /// The stream must not exist yet (first write).
    NoStream,
    /// The stream must be at exactly this version.
    Exact(u64),
}

impl ExpectedVersion {
    /// Whether a stream currently at `current` satisfies this expectation.
    pub fn matches(self, current: u64) -> bool {
        match self {
            Self::Any => true,
            Self::NoStream => current == 0,
            Self::Exact(v) => current == v,
        }
    }
}

/// One message of a catch-up subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedMessage {
    /// The next event in global order.
    Event(RecordedEvent),
    /// All historical events have been delivered; live events follow.
    CaughtUp,
}

/// A catch-up subscription: history, then [`FeedMessage::CaughtUp`], then live
/// events. An `Err` item means the subscription is broken and must be reopened.
pub type FeedStream =
    Pin<Box<dyn tokio_stream::Stream<Item = Result<FeedMessage, TransportError>> + Send>>;

/// Append-only event store with per-stream optimistic concurrency and a
/// global ordered feed.
#[async_trait::async_trait]
pub trait EventStreamBackend: Send + Sync + 'static {
    /// Append `events` atomically if the stream is at `expected`.
    ///
    /// Returns the new stream version.
    ///
    /// # Errors
    ///
    /// [`AppendError::Conflict`] if the expectation does not hold (nothing is
    /// written), [`AppendError::Transport`] on connectivity failure.
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, AppendError>;

    /// Read every event of a stream in order. An absent stream reads as empty.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] on connectivity failure.
    async fn read_stream(&self, stream_id: &str) -> Result<Vec<RecordedEvent>, TransportError>;

    /// Subscribe to the global log after `from` (exclusive); `None` starts at
    /// the first event.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError`] if the subscription cannot be opened.
    async fn subscribe(&self, from: Option<u64>) -> Result<FeedStream, TransportError>;
}

/// Run `fut` under a time limit, reporting expiry as [`TransportError::Timeout`].
pub(crate) async fn with_timeout<T, E>(
    limit: Duration,
    fut: impl Future<Output = Result<T, E>>,
) -> Result<T, E>
where
    E: From<TransportError>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit).into()),
    }
}
