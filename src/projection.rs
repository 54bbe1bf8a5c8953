//! Read-model projections over the global event feed.
//!
//! A [`Projection`] folds recorded events into a read model. Projections are
//! grouped into subscription groups by the
//! [`ProjectionManager`](crate::ProjectionManager); each group shares one
//! checkpoint, so every projection in it sees the same events in the same
//! order and must tolerate redelivery after a restart.
//!
//! [`Upcaster`] is a projection that republishes legacy event shapes into a
//! dedicated stream in their newer form.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::backend::{EventStreamBackend, ExpectedVersion, with_timeout};
use crate::error::ProjectionError;
use crate::event::{EventMetadata, ProposedEvent, RecordedEvent};
use crate::store::DEFAULT_OPERATION_TIMEOUT;

/// A read model fed from the global event log.
///
/// # Contract
///
/// - [`project`](Projection::project) must be idempotent: after a crash the
///   event following the last checkpoint may be delivered again.
/// - Events whose tag the projection does not care about should be filtered
///   with [`handles`](Projection::handles) or ignored in the body, never
///   rejected.
/// - Returning an error hands the event to the group's [`FailurePolicy`].
#[async_trait::async_trait]
pub trait Projection: Send + Sync + 'static {
    /// Name used in logs and dead-letter entries.
    fn name(&self) -> &str;

    /// Whether this projection wants events tagged `event_type`.
    fn handles(&self, event_type: &str) -> bool {
        let _ = event_type;
        true
    }

    /// Apply a single event to the read model.
    ///
    /// # Errors
    ///
    /// Returns [`ProjectionError`] if the event cannot be applied.
    async fn project(&self, event: &RecordedEvent) -> Result<(), ProjectionError>;
}

/// What a subscription group does when a projection fails on an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Retry up to `max_attempts` times in total, waiting `delay` between
    /// attempts, then skip the event for that projection, log it, and record
    /// a dead letter.
    RetryThenSkip {
        /// Total attempts, including the first. Zero is treated as one.
        max_attempts: u32,
        /// Pause between attempts.
        delay: Duration,
    },
    /// Stop the group without advancing its checkpoint past the event.
    Halt,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::RetryThenSkip {
            max_attempts: 3,
            delay: Duration::from_millis(100),
        }
    }
}

/// Result of handing one event to one projection under a [`FailurePolicy`].
#[derive(Debug)]
pub(crate) enum Delivery {
    Applied,
    Skipped(ProjectionError),
    Halted(ProjectionError),
}

pub(crate) async fn deliver(
    projection: &dyn Projection,
    event: &RecordedEvent,
    policy: FailurePolicy,
) -> Delivery {
    match policy {
        FailurePolicy::Halt => match projection.project(event).await {
            Ok(()) => Delivery::Applied,
            Err(e) => Delivery::Halted(e),
        },
        FailurePolicy::RetryThenSkip {
            max_attempts,
            delay,
        } => {
            let max_attempts = max_attempts.max(1);
            let mut attempt = 1;
            loop {
                match projection.project(event).await {
                    Ok(()) => return Delivery::Applied,
                    Err(e) if attempt >= max_attempts => return Delivery::Skipped(e),
                    Err(e) => {
                        tracing::warn!(
                            projection = projection.name(),
                            position = event.global_position,
                            attempt,
                            error = %e,
                            "projection failed, retrying"
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}

// --- Dead-letter log ---

/// An entry in the dead-letter log, recording an event a projection failed
/// to handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Subscription group the projection belongs to.
    pub group: String,
    /// Projection that failed.
    pub projection: String,
    /// The skipped event.
    pub event: RecordedEvent,
    /// Human-readable error message.
    pub error: String,
    /// Unix timestamp (seconds since epoch) of the failure.
    pub ts: u64,
}

impl DeadLetterEntry {
    pub(crate) fn new(
        group: &str,
        projection: &str,
        event: &RecordedEvent,
        error: &ProjectionError,
    ) -> Self {
        let ts = std::time::SystemTime::UNIX_EPOCH
            .elapsed()
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            group: group.to_string(),
            projection: projection.to_string(),
            event: event.clone(),
            error: error.to_string(),
            ts,
        }
    }
}

/// Append a single dead-letter entry to the JSONL log at `path`.
///
/// Creates the file and its parent directory if they do not exist. Each
/// entry is a single JSON line.
///
/// # Errors
///
/// Returns `io::Error` if file I/O fails.
pub(crate) fn append_dead_letter(path: &Path, entry: &DeadLetterEntry) -> io::Result<()> {
    use std::io::Write;
    let json = serde_json::to_string(entry).map_err(io::Error::other)?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    writeln!(file, "{json}")?;
    Ok(())
}

/// Read every entry of the JSONL dead-letter log at `path`.
///
/// A missing file reads as empty.
///
/// # Errors
///
/// Returns `io::Error` if the file cannot be read or a line is not a valid
/// entry.
pub fn read_dead_letters(path: &Path) -> io::Result<Vec<DeadLetterEntry>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    content
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).map_err(io::Error::other))
        .collect()
}

// --- Upcasting ---

/// New shape produced by an upcast rule.
#[derive(Debug, Clone, PartialEq)]
pub struct UpcastEvent {
    /// Tag of the republished event.
    pub event_type: String,
    /// Payload of the republished event.
    pub payload: Value,
}

/// Future returned by an upcast rule.
pub type UpcastFuture =
    Pin<Box<dyn Future<Output = Result<Option<UpcastEvent>, ProjectionError>> + Send>>;

type UpcastRule = Box<dyn Fn(RecordedEvent) -> UpcastFuture + Send + Sync>;

/// Projection that republishes events in a newer shape to a target stream.
///
/// Each rule maps one source tag to an optional new event. Republished
/// events keep the source metadata and carry the source `event_id` as their
/// `causation_id`; the upcaster skips sources it has already republished, so
/// redelivery after a restart does not duplicate output.
///
/// # Examples
///
/// ```ignore
/// let upcaster = Upcaster::new("ad-upcaster", "upcasted-classified-ads", backend)
///     .rule("ClassifiedAdPublished", move |event| {
///         let users = users.clone();
///         Box::pin(async move {
///             let photo = seller_photo(&users, &event).await?;
///             Ok(Some(UpcastEvent {
///                 event_type: "ClassifiedAdPublishedV2".into(),
///                 payload: with_photo(event.payload, photo),
///             }))
///         })
///     });
/// ```
pub struct Upcaster {
    name: String,
    target_stream: String,
    backend: Arc<dyn EventStreamBackend>,
    rules: HashMap<String, UpcastRule>,
    operation_timeout: Duration,
    republished: Mutex<Option<HashSet<Uuid>>>,
}

impl std::fmt::Debug for Upcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upcaster")
            .field("name", &self.name)
            .field("target_stream", &self.target_stream)
            .field("rules", &self.rules.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Upcaster {
    /// Create an upcaster with no rules writing to `target_stream`.
    pub fn new(
        name: impl Into<String>,
        target_stream: impl Into<String>,
        backend: Arc<dyn EventStreamBackend>,
    ) -> Self {
        Self {
            name: name.into(),
            target_stream: target_stream.into(),
            backend,
            rules: HashMap::new(),
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            republished: Mutex::new(None),
        }
    }

    /// Upcast events tagged `event_type` with `rule`. Returning `Ok(None)`
    /// drops the event.
    pub fn rule<F>(mut self, event_type: impl Into<String>, rule: F) -> Self
    where
        F: Fn(RecordedEvent) -> UpcastFuture + Send + Sync + 'static,
    {
        self.rules.insert(event_type.into(), Box::new(rule));
        self
    }

    /// Time limit for each backend call.
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Stream republished events are appended to.
    pub fn target_stream(&self) -> &str {
        &self.target_stream
    }

    async fn load_republished(&self) -> Result<HashSet<Uuid>, ProjectionError> {
        let existing = with_timeout(
            self.operation_timeout,
            self.backend.read_stream(&self.target_stream),
        )
        .await?;
        Ok(existing
            .iter()
            .filter_map(|e| e.metadata.causation_id)
            .collect())
    }
}

#[async_trait::async_trait]
impl Projection for Upcaster {
    fn name(&self) -> &str {
        &self.name
    }

    fn handles(&self, event_type: &str) -> bool {
        self.rules.contains_key(event_type)
    }

    async fn project(&self, event: &RecordedEvent) -> Result<(), ProjectionError> {
        let Some(rule) = self.rules.get(&event.event_type) else {
            return Ok(());
        };

        let mut republished = self.republished.lock().await;
        if republished.is_none() {
            *republished = Some(self.load_republished().await?);
        }
        if republished
            .as_ref()
            .is_some_and(|seen| seen.contains(&event.event_id))
        {
            tracing::debug!(
                upcaster = %self.name,
                event_id = %event.event_id,
                "event already upcast"
            );
            return Ok(());
        }

        let Some(upcast) = rule(event.clone()).await? else {
            return Ok(());
        };

        let metadata = EventMetadata {
            causation_id: Some(event.event_id),
            ..event.metadata.clone()
        };
        let proposed = ProposedEvent::new(upcast.event_type, upcast.payload, metadata);
        with_timeout(
            self.operation_timeout,
            self.backend
                .append(&self.target_stream, ExpectedVersion::Any, vec![proposed]),
        )
        .await?;

        if let Some(seen) = republished.as_mut() {
            seen.insert(event.event_id);
        }
        tracing::debug!(
            upcaster = %self.name,
            source = %event.event_type,
            target_stream = %self.target_stream,
            "event upcast"
        );
        Ok(())
    }
}
