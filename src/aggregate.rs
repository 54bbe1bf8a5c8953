//! Aggregate and entity traits, and the [`AggregateRoot`] event-application core.

use crate::backend::ExpectedVersion;
use crate::error::InvalidEntityState;
use crate::event::{DomainEvent, RecordedEvent};

/// A domain aggregate whose state is derived from its event history.
///
/// The implementing type itself is the aggregate's state. State only changes
/// by folding events through [`apply`](Aggregate::apply); after every live
/// event [`ensure_valid_state`](Aggregate::ensure_valid_state) must hold.
///
/// # Contract
///
/// - [`apply`](Aggregate::apply) is the tag → mutation table: a pure, total
///   `match` over the event enum. No I/O, no validation.
/// - [`ensure_valid_state`](Aggregate::ensure_valid_state) checks the rules
///   that hold for the aggregate's current state-machine state and names the
///   offending state on failure.
/// - `Default` is the blank state before the creation event.
pub trait Aggregate: Default + Clone + Send + Sync + 'static {
    /// Identifies this aggregate type (e.g. "classified_ad"). Prefixes stream names.
    const AGGREGATE_TYPE: &'static str;

    /// The events this aggregate produces and applies.
    type Event: DomainEvent;

    /// Domain rejection error. Invariant violations convert into it.
    type Error: std::error::Error + From<InvalidEntityState> + Send + Sync + 'static;

    /// Apply a single event to produce the next state.
    fn apply(self, event: &Self::Event) -> Self;

    /// Validate the state reached after the last applied event.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEntityState`] naming `id` and the current state.
    fn ensure_valid_state(&self, id: &str) -> Result<(), InvalidEntityState>;
}

/// An entity nested inside an aggregate.
///
/// Entities share their owner's event type. They never emit events into the
/// owner directly: operations on an entity return the event to apply, and the
/// owner's [`AggregateRoot::apply`] records it once and routes it back to the
/// entity through [`apply_to_entity`].
pub trait Entity: Clone + Send + Sync {
    /// Event type of the owning aggregate.
    type Event;

    /// Apply an event routed from the owner.
    fn apply(self, event: &Self::Event) -> Self;
}

/// Route an owner's event into a nested entity's handler.
///
/// Called from inside an [`Aggregate::apply`] implementation.
pub fn apply_to_entity<E: Entity>(entity: &mut E, event: &E::Event) {
    *entity = entity.clone().apply(event);
}

/// An aggregate instance with its identity, version, and uncommitted events.
///
/// Produced either by [`create`](AggregateRoot::create) from a creation event
/// or by [`load_from_history`](AggregateRoot::load_from_history) from a full
/// stream. Discarded after each command cycle.
#[derive(Clone)]
pub struct AggregateRoot<A: Aggregate> {
    id: String,
    state: A,
    version: u64,
    uncommitted: Vec<A::Event>,
}

impl<A: Aggregate> std::fmt::Debug for AggregateRoot<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregateRoot")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("id", &self.id)
            .field("version", &self.version)
            .field("uncommitted", &self.uncommitted.len())
            .finish()
    }
}

impl<A: Aggregate> AggregateRoot<A> {
    /// Create a brand-new aggregate from its creation event.
    ///
    /// The result has version 0 and the creation event as its only
    /// uncommitted event.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEntityState`] if the state after the creation event
    /// fails the invariant check.
    pub fn create(id: impl Into<String>, event: A::Event) -> Result<Self, InvalidEntityState> {
        let mut root = Self {
            id: id.into(),
            state: A::default(),
            version: 0,
            uncommitted: Vec::new(),
        };
        root.apply(event)?;
        Ok(root)
    }

    /// Rebuild an aggregate by replaying its persisted events in order.
    ///
    /// Events whose tag the aggregate does not know are skipped but still
    /// count toward the version. No invariant is checked between events; the
    /// final state is checked once and a failure is only logged, since
    /// history is never rejected.
    ///
    /// # Errors
    ///
    /// Returns the decode error when an event carries a known tag but its
    /// payload does not deserialize.
    pub fn load_from_history<'a>(
        id: impl Into<String>,
        events: impl IntoIterator<Item = &'a RecordedEvent>,
    ) -> Result<Self, serde_json::Error> {
        let id = id.into();
        let mut state = A::default();
        let mut version = 0u64;

        for recorded in events {
            version += 1;
            if !A::Event::EVENT_TYPES.contains(&recorded.event_type.as_str()) {
                tracing::debug!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    id = %id,
                    event_type = %recorded.event_type,
                    "skipping unknown event during replay"
                );
                continue;
            }
            let event = recorded.decode::<A::Event>().inspect_err(|e| {
                tracing::error!(
                    aggregate_type = A::AGGREGATE_TYPE,
                    id = %id,
                    event_type = %recorded.event_type,
                    global_position = recorded.global_position,
                    error = %e,
                    "stored event does not decode"
                );
            })?;
            state = state.apply(&event);
        }

        if version > 0
            && let Err(violation) = state.ensure_valid_state(&id)
        {
            tracing::warn!(
                aggregate_type = A::AGGREGATE_TYPE,
                id = %id,
                version,
                error = %violation,
                "replayed history violates current invariants"
            );
        }

        Ok(Self {
            id,
            state,
            version,
            uncommitted: Vec::new(),
        })
    }

    /// Apply a new event.
    ///
    /// The event is folded into a copy of the state and the invariant check
    /// runs on the result. Only when it passes is the new state kept and the
    /// event recorded as uncommitted.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidEntityState`] and leaves the aggregate untouched.
    pub fn apply(&mut self, event: A::Event) -> Result<(), InvalidEntityState> {
        let next = self.state.clone().apply(&event);
        next.ensure_valid_state(&self.id)?;
        self.state = next;
        self.uncommitted.push(event);
        Ok(())
    }

    /// Aggregate instance identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state.
    pub fn state(&self) -> &A {
        &self.state
    }

    /// Persisted version: the stream length this instance was loaded at or
    /// last saved to.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Version including uncommitted events.
    pub fn current_version(&self) -> u64 {
        self.version + self.uncommitted.len() as u64
    }

    /// Events applied since the last load or save.
    pub fn uncommitted(&self) -> &[A::Event] {
        &self.uncommitted
    }

    /// Expected version for the next conditional append.
    pub fn expected_version(&self) -> ExpectedVersion {
        if self.version == 0 {
            ExpectedVersion::NoStream
        } else {
            ExpectedVersion::Exact(self.version)
        }
    }

    /// Clear uncommitted events after a successful append and return the new
    /// persisted version.
    pub(crate) fn mark_committed(&mut self) -> u64 {
        self.version = self.current_version();
        self.uncommitted.clear();
        self.version
    }
}
