//! Event-sourcing core: aggregates rebuilt from their event streams, a
//! command service with optimistic-concurrency retry, and checkpointed
//! projections fed from a global event log.

mod aggregate;
pub use aggregate::{Aggregate, AggregateRoot, Entity, apply_to_entity};
mod backend;
pub use backend::{EventStreamBackend, ExpectedVersion, FeedMessage, FeedStream};
mod checkpoint;
pub use checkpoint::{Checkpoint, CheckpointStore, DocumentCheckpointStore, FileCheckpointStore};
mod command;
mod document;
pub use document::{
    DocumentStore, InMemoryDocumentStore, load_document, save_document, update_document,
};
mod error;
mod event;
mod live;
mod manager;
mod memory;
mod projection;
mod registry;
mod service;
mod store;

pub use command::CommandContext;
pub use error::{
    AppendError, CheckpointError, CommandError, DocumentError, GroupError, InvalidEntityState,
    ManagerError, ProjectionError, RegistryError, StoreError, TransportError,
};
pub use event::{
    DomainEvent, EventMetadata, ProposedEvent, RecordedEvent, encode_domain_event, stream_name,
};
pub use live::{GroupStatus, LiveConfig};
pub use manager::{ManagerHandle, ProjectionManager, SubscriptionGroup};
pub use memory::InMemoryBackend;
pub use projection::{
    DeadLetterEntry, FailurePolicy, Projection, UpcastEvent, UpcastFuture, Upcaster,
    read_dead_letters,
};
pub use registry::{EventTypeRegistry, EventTypeRegistryBuilder};
pub use service::{CommandOutcome, CommandService, DEFAULT_MAX_RETRIES, target_stream};
pub use store::{AggregateStore, AggregateStoreBuilder, DEFAULT_OPERATION_TIMEOUT};
