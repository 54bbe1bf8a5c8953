//! Explicit event-type registry.
//!
//! Maps every known event type tag to the aggregate (or stream family) that
//! owns it. Built once at startup and shared by reference with the
//! [`AggregateStore`](crate::AggregateStore), which refuses to persist unknown
//! tags, and the [`ProjectionManager`](crate::ProjectionManager), which only
//! delivers known tags to projections.

use std::collections::HashMap;

use crate::aggregate::Aggregate;
use crate::error::RegistryError;
use crate::event::DomainEvent;

/// Immutable mapping of event type tag to owning aggregate type.
#[derive(Debug, Clone, Default)]
pub struct EventTypeRegistry {
    owners: HashMap<String, String>,
}

impl EventTypeRegistry {
    /// Start building a registry.
    pub fn builder() -> EventTypeRegistryBuilder {
        EventTypeRegistryBuilder::default()
    }

    /// Owner of `event_type`, if registered.
    pub fn owner_of(&self, event_type: &str) -> Option<&str> {
        self.owners.get(event_type).map(String::as_str)
    }

    /// Whether `event_type` is known at all.
    pub fn is_registered(&self, event_type: &str) -> bool {
        self.owners.contains_key(event_type)
    }

    /// Whether `event_type` is registered to `aggregate_type`.
    pub fn is_owned_by(&self, event_type: &str, aggregate_type: &str) -> bool {
        self.owner_of(event_type) == Some(aggregate_type)
    }

    /// Number of registered tags.
    pub fn len(&self) -> usize {
        self.owners.len()
    }

    /// Whether no tags are registered.
    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}

/// Builder for [`EventTypeRegistry`].
///
/// Registering the same tag twice for the same owner is allowed; registering
/// it for a different owner fails at [`build`](EventTypeRegistryBuilder::build).
///
/// # Examples
///
/// ```
/// use marketplace_es::{DomainEvent, EventTypeRegistry};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Clone, Serialize, Deserialize)]
/// #[serde(tag = "type", content = "data")]
/// enum ProfileEvent {
///     UserRegistered { id: String },
/// }
///
/// impl DomainEvent for ProfileEvent {
///     const EVENT_TYPES: &'static [&'static str] = &["UserRegistered"];
/// }
///
/// let registry = EventTypeRegistry::builder()
///     .events::<ProfileEvent>("user_profile")
///     .build()
///     .unwrap();
/// assert_eq!(registry.owner_of("UserRegistered"), Some("user_profile"));
/// ```
#[derive(Debug, Default)]
pub struct EventTypeRegistryBuilder {
    owners: HashMap<String, String>,
    conflict: Option<RegistryError>,
}

impl EventTypeRegistryBuilder {
    /// Register every event tag of aggregate `A`.
    pub fn aggregate<A: Aggregate>(self) -> Self {
        self.events::<A::Event>(A::AGGREGATE_TYPE)
    }

    /// Register every tag of `E` under `owner`.
    pub fn events<E: DomainEvent>(mut self, owner: &str) -> Self {
        for tag in E::EVENT_TYPES {
            self = self.event_type(tag, owner);
        }
        self
    }

    /// Register a single tag under `owner`.
    pub fn event_type(mut self, event_type: &str, owner: &str) -> Self {
        match self.owners.get(event_type) {
            Some(existing) if existing != owner => {
                if self.conflict.is_none() {
                    self.conflict = Some(RegistryError {
                        event_type: event_type.to_string(),
                        existing: existing.clone(),
                        attempted: owner.to_string(),
                    });
                }
            }
            Some(_) => {}
            None => {
                self.owners
                    .insert(event_type.to_string(), owner.to_string());
            }
        }
        self
    }

    /// Finish the registry.
    ///
    /// # Errors
    ///
    /// Returns the first [`RegistryError`] if a tag was claimed by two owners.
    pub fn build(self) -> Result<EventTypeRegistry, RegistryError> {
        match self.conflict {
            Some(err) => Err(err),
            None => Ok(EventTypeRegistry {
                owners: self.owners,
            }),
        }
    }
}
