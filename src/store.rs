//! Replay-based load and conditional-append save for aggregates.
//!
//! The store is built via [`AggregateStoreBuilder`] from a shared
//! [`EventStreamBackend`] and the application's [`EventTypeRegistry`]. It
//! holds no aggregate cache: every load replays the full stream.

use std::sync::Arc;
use std::time::Duration;

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::backend::{EventStreamBackend, with_timeout};
use crate::command::CommandContext;
use crate::error::{AppendError, StoreError};
use crate::event::{ProposedEvent, encode_domain_event, stream_name};
use crate::registry::EventTypeRegistry;

/// Default time limit for a single backend call: 10 seconds.
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Loads aggregates by replaying their streams and saves them with
/// optimistic concurrency.
///
/// `Clone` is cheap: the backend and registry are `Arc`-wrapped.
#[derive(Clone)]
pub struct AggregateStore {
    backend: Arc<dyn EventStreamBackend>,
    registry: Arc<EventTypeRegistry>,
    operation_timeout: Duration,
}

impl std::fmt::Debug for AggregateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateStore")
            .field("registered_event_types", &self.registry.len())
            .field("operation_timeout", &self.operation_timeout)
            .finish()
    }
}

impl AggregateStore {
    /// Start building a store over `backend` using `registry`.
    pub fn builder(
        backend: Arc<dyn EventStreamBackend>,
        registry: Arc<EventTypeRegistry>,
    ) -> AggregateStoreBuilder {
        AggregateStoreBuilder {
            backend,
            registry,
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }

    /// The registry this store validates events against.
    pub fn registry(&self) -> &Arc<EventTypeRegistry> {
        &self.registry
    }

    /// The backend this store writes to.
    pub fn backend(&self) -> &Arc<dyn EventStreamBackend> {
        &self.backend
    }

    /// Time limit applied to each backend call.
    pub fn operation_timeout(&self) -> Duration {
        self.operation_timeout
    }

    /// Load an aggregate by replaying its full stream.
    ///
    /// # Errors
    ///
    /// * [`StoreError::NotFound`] if the stream is empty or absent.
    /// * [`StoreError::Transport`] on connectivity failure or timeout.
    /// * [`StoreError::Codec`] if a stored event of a known type does not decode.
    pub async fn load<A: Aggregate>(&self, id: &str) -> Result<AggregateRoot<A>, StoreError> {
        let stream_id = stream_name(A::AGGREGATE_TYPE, id);
        let events = with_timeout(self.operation_timeout, self.backend.read_stream(&stream_id))
            .await?;

        if events.is_empty() {
            return Err(StoreError::NotFound { stream_id });
        }

        let root = AggregateRoot::<A>::load_from_history(id, &events)?;
        tracing::debug!(
            aggregate_type = A::AGGREGATE_TYPE,
            id = %id,
            version = root.version(),
            "aggregate loaded"
        );
        Ok(root)
    }

    /// Whether the aggregate's stream holds any events.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transport`] on connectivity failure or timeout.
    pub async fn exists<A: Aggregate>(&self, id: &str) -> Result<bool, StoreError> {
        let stream_id = stream_name(A::AGGREGATE_TYPE, id);
        let events = with_timeout(self.operation_timeout, self.backend.read_stream(&stream_id))
            .await?;
        Ok(!events.is_empty())
    }

    /// Append the aggregate's uncommitted events to its stream.
    ///
    /// The append is conditioned on the stream still being at the version the
    /// aggregate was loaded at (no stream for a new aggregate). On success the
    /// uncommitted list is cleared and the new version returned. A root with
    /// no uncommitted events is a no-op.
    ///
    /// # Errors
    ///
    /// * [`StoreError::Conflict`] if another writer moved the stream; nothing
    ///   was appended and the root is unchanged.
    /// * [`StoreError::UnregisteredEventType`] if an event tag is not
    ///   registered to this aggregate type.
    /// * [`StoreError::Codec`] if an event cannot be serialized.
    /// * [`StoreError::Transport`] on connectivity failure or timeout.
    pub async fn save<A: Aggregate>(
        &self,
        root: &mut AggregateRoot<A>,
        ctx: &CommandContext,
    ) -> Result<u64, StoreError> {
        if root.uncommitted().is_empty() {
            return Ok(root.version());
        }

        let stream_id = stream_name(A::AGGREGATE_TYPE, root.id());
        let proposed = root
            .uncommitted()
            .iter()
            .map(|event| self.encode::<A>(event, ctx, root.id()))
            .collect::<Result<Vec<_>, _>>()?;
        let count = proposed.len();
        let expected = root.expected_version();

        let appended = with_timeout(
            self.operation_timeout,
            self.backend.append(&stream_id, expected, proposed),
        )
        .await;

        match appended {
            Ok(new_version) => {
                let version = root.mark_committed();
                debug_assert_eq!(version, new_version);
                tracing::info!(
                    stream_id = %stream_id,
                    count,
                    version,
                    "events appended"
                );
                Ok(version)
            }
            Err(AppendError::Conflict { expected, actual }) => {
                tracing::debug!(
                    stream_id = %stream_id,
                    ?expected,
                    actual,
                    "append rejected by concurrency check"
                );
                Err(StoreError::Conflict {
                    stream_id,
                    expected,
                    actual,
                })
            }
            Err(AppendError::Transport(e)) => Err(StoreError::Transport(e)),
        }
    }

    fn encode<A: Aggregate>(
        &self,
        event: &A::Event,
        ctx: &CommandContext,
        id: &str,
    ) -> Result<ProposedEvent, StoreError> {
        let proposed = encode_domain_event(event, ctx, A::AGGREGATE_TYPE, id)?;
        if !self
            .registry
            .is_owned_by(&proposed.event_type, A::AGGREGATE_TYPE)
        {
            return Err(StoreError::UnregisteredEventType {
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                event_type: proposed.event_type,
            });
        }
        Ok(proposed)
    }
}

/// Builder for [`AggregateStore`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::time::Duration;
/// use marketplace_es::{AggregateStore, EventTypeRegistry, InMemoryBackend};
///
/// let store = AggregateStore::builder(
///     Arc::new(InMemoryBackend::new()),
///     Arc::new(EventTypeRegistry::default()),
/// )
/// .operation_timeout(Duration::from_secs(2))
/// .build();
/// assert_eq!(store.operation_timeout(), Duration::from_secs(2));
/// ```
pub struct AggregateStoreBuilder {
    backend: Arc<dyn EventStreamBackend>,
    registry: Arc<EventTypeRegistry>,
    operation_timeout: Duration,
}

impl AggregateStoreBuilder {
    /// Set the time limit for each load/save backend call.
    ///
    /// Defaults to [`DEFAULT_OPERATION_TIMEOUT`].
    pub fn operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    /// Build the store.
    pub fn build(self) -> AggregateStore {
        AggregateStore {
            backend: self.backend,
            registry: self.registry,
            operation_timeout: self.operation_timeout,
        }
    }
}
