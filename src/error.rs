//! Crate-level error types for aggregates, stores, commands, and projections.

use std::time::Duration;

use crate::backend::ExpectedVersion;

/// An aggregate failed its invariant check after an event was applied.
///
/// Carries the aggregate identity and the state-machine state that was
/// rejected so callers can report a precise reason without inspecting the
/// aggregate itself.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{aggregate_type} '{id}' is invalid in state {state}: {reason}")]
pub struct InvalidEntityState {
    /// Aggregate type name (e.g. "classified_ad").
    pub aggregate_type: &'static str,
    /// Aggregate instance identifier.
    pub id: String,
    /// Rendered state-machine value the aggregate was in.
    pub state: String,
    /// Which rule failed.
    pub reason: String,
}

impl InvalidEntityState {
    /// Build a violation for the given aggregate identity and state.
    pub fn new(
        aggregate_type: &'static str,
        id: impl Into<String>,
        state: impl std::fmt::Debug,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            aggregate_type,
            id: id.into(),
            state: format!("{state:?}"),
            reason: reason.into(),
        }
    }
}

/// I/O or connectivity failure talking to a backend.
///
/// Retryable with backoff; never implies a partial write.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The caller-supplied time limit elapsed before the call completed.
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    /// The backend refused or could not serve the request.
    #[error("backend unavailable: {0}")]
    Unavailable(String),

    /// An open feed subscription was dropped.
    #[error("feed disconnected: {0}")]
    Disconnected(String),
}

/// Error returned by [`EventStreamBackend::append`](crate::EventStreamBackend::append).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AppendError {
    /// The stream was not at the expected version. Nothing was appended.
    #[error("expected version {expected:?} but stream is at version {actual}")]
    Conflict {
        /// The expectation the writer supplied.
        expected: ExpectedVersion,
        /// Current stream length.
        actual: u64,
    },

    /// The append could not reach the backend.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error returned by [`AggregateStore`](crate::AggregateStore) load and save.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The stream has no events.
    #[error("stream '{stream_id}' not found")]
    NotFound {
        /// Stream that was read.
        stream_id: String,
    },

    /// Conditional append rejected; no events were written.
    #[error(
        "concurrency conflict on '{stream_id}': expected {expected:?}, stream is at version {actual}"
    )]
    Conflict {
        /// Stream that was written.
        stream_id: String,
        /// The expected version sent with the append.
        expected: ExpectedVersion,
        /// The version the backend reported.
        actual: u64,
    },

    /// Connectivity failure or timeout.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A domain event could not be encoded, or a stored one could not be decoded.
    #[error("event codec failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// The aggregate produced an event whose tag is missing from the registry.
    #[error("event type '{event_type}' is not registered for aggregate '{aggregate_type}'")]
    UnregisteredEventType {
        /// Aggregate that produced the event.
        aggregate_type: String,
        /// Offending tag.
        event_type: String,
    },
}

/// Outcome of a rejected [`CommandService::handle`](crate::CommandService::handle) call.
///
/// Generic over `E`, the aggregate's domain error type, which also carries
/// invariant violations through its `From<InvalidEntityState>` impl.
#[derive(Debug, thiserror::Error)]
pub enum CommandError<E: std::error::Error + Send + Sync + 'static> {
    /// The command was rejected by domain rules or an invariant check.
    #[error(transparent)]
    Validation(E),

    /// The target aggregate does not exist.
    #[error("aggregate '{stream_id}' not found")]
    NotFound {
        /// Stream of the missing aggregate.
        stream_id: String,
    },

    /// A creation command targeted an existing stream.
    #[error("aggregate '{stream_id}' already exists")]
    AlreadyExists {
        /// Stream that already exists.
        stream_id: String,
    },

    /// Every attempt hit a version conflict.
    #[error("optimistic concurrency conflict on '{stream_id}': retries exhausted after {attempts} attempts")]
    Conflict {
        /// Contended stream.
        stream_id: String,
        /// Total attempts made, including the first.
        attempts: u32,
    },

    /// The backend could not be reached in time.
    #[error(transparent)]
    Transport(TransportError),

    /// Encoding or registry failure inside the store.
    #[error("infrastructure failure: {0}")]
    Internal(StoreError),

    /// No handler was registered for this command type.
    #[error("no handler registered for command type {0}")]
    UnknownCommand(&'static str),
}

/// Error returned by [`DocumentStore`](crate::DocumentStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    /// A stored document could not be converted to or from its typed form.
    #[error("document '{key}' could not be encoded or decoded: {source}")]
    Codec {
        /// Document key.
        key: String,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// The store was unreachable.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Error returned by [`CheckpointStore`](crate::CheckpointStore) operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// A put tried to move a checkpoint backwards.
    #[error("checkpoint '{name}' cannot rewind from {current} to {attempted}")]
    Rewind {
        /// Checkpoint name.
        name: String,
        /// Stored position.
        current: u64,
        /// Rejected position.
        attempted: u64,
    },

    /// Filesystem failure.
    #[error("checkpoint I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint file or document could not be encoded.
    #[error("checkpoint encoding failed: {0}")]
    Codec(#[from] serde_json::Error),

    /// Timeout or connectivity failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The backing document store failed.
    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// A projection failed to apply an event to its read model.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    /// The event payload did not match the shape the projection expects.
    #[error("event '{event_type}' at position {position} could not be decoded: {source}")]
    Decode {
        /// Tag of the event.
        event_type: String,
        /// Global position of the event.
        position: u64,
        /// Underlying serde error.
        #[source]
        source: serde_json::Error,
    },

    /// Read-model write failed.
    #[error(transparent)]
    Document(#[from] DocumentError),

    /// Republishing an event failed.
    #[error(transparent)]
    Append(#[from] AppendError),

    /// Reading back republished events failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The projection refused the event.
    #[error("{0}")]
    Rejected(String),
}

/// Error raised while building an [`EventTypeRegistry`](crate::EventTypeRegistry).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("event type '{event_type}' is registered to '{existing}', cannot register it to '{attempted}'")]
pub struct RegistryError {
    /// Duplicated tag.
    pub event_type: String,
    /// Owner already holding the tag.
    pub existing: String,
    /// Owner that tried to claim it.
    pub attempted: String,
}

/// Error returned when starting a [`ProjectionManager`](crate::ProjectionManager).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManagerError {
    /// Two groups share a checkpoint name.
    #[error("subscription group '{0}' is registered more than once")]
    DuplicateGroup(String),

    /// A group has no projections.
    #[error("subscription group '{0}' has no projections")]
    EmptyGroup(String),
}

/// Terminal failure of one subscription group.
#[derive(Debug, thiserror::Error)]
pub enum GroupError {
    /// The failure policy halted the group. The checkpoint stays on the
    /// last fully handled event.
    #[error("group '{group}' halted at position {position}: projection '{projection}' failed: {source}")]
    Halted {
        /// Group name.
        group: String,
        /// Projection that failed.
        projection: String,
        /// Global position of the event that could not be handled.
        position: u64,
        /// The projection failure.
        #[source]
        source: ProjectionError,
    },

    /// The checkpoint store rejected a write in a way retrying cannot fix.
    #[error("group '{group}' checkpoint failure: {source}")]
    Checkpoint {
        /// Group name.
        group: String,
        /// The checkpoint failure.
        #[source]
        source: CheckpointError,
    },

    /// The group task panicked.
    #[error("group '{group}' task panicked: {message}")]
    Panicked {
        /// Group name.
        group: String,
        /// Join error text.
        message: String,
    },
}
