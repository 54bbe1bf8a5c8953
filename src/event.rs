//! Event encoding, decoding, and the shared event types.
//!
//! Domain events are Rust enums serialized with adjacently tagged serde
//! (`#[serde(tag = "type", content = "data")]`). The `"type"` field becomes the
//! stored event type tag and `"data"` becomes the payload. No I/O happens here.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::command::CommandContext;

/// A family of domain events sharing one adjacently tagged enum.
///
/// `EVENT_TYPES` lists every tag the enum can produce so an
/// [`EventTypeRegistry`](crate::EventTypeRegistry) can be built from the type
/// alone.
pub trait DomainEvent: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Every `"type"` tag this enum serializes to.
    const EVENT_TYPES: &'static [&'static str];
}

/// Name of the stream holding one aggregate instance's events.
///
/// # Examples
///
/// ```
/// use marketplace_es::stream_name;
/// assert_eq!(stream_name("classified_ad", "ad-1"), "classified_ad-ad-1");
/// ```
pub fn stream_name(aggregate_type: &str, instance_id: &str) -> String {
    format!("{aggregate_type}-{instance_id}")
}

/// Infrastructure metadata stamped on every persisted event.
///
/// The `aggregate_type` and `instance_id` fields make each event
/// self-describing so projections can recover the aggregate identity
/// without parsing stream names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    /// Aggregate type name (e.g. "classified_ad").
    pub aggregate_type: String,
    /// Aggregate instance identifier.
    pub instance_id: String,
    /// Actor identity from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Correlation ID from the command context, if provided.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Event this one was derived from (set by upcasters).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub causation_id: Option<Uuid>,
    /// Free-form metadata forwarded from the command context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

/// An event ready to be appended to a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposedEvent {
    /// Client-assigned UUID v4.
    pub event_id: Uuid,
    /// Type tag (the `"type"` field of the adjacently tagged enum).
    pub event_type: String,
    /// JSON payload (the `"data"` field), `null` for unit variants.
    pub payload: serde_json::Value,
    /// Infrastructure metadata.
    pub metadata: EventMetadata,
}

impl ProposedEvent {
    /// Build a proposed event from raw parts with a fresh event ID.
    pub fn new(
        event_type: impl Into<String>,
        payload: serde_json::Value,
        metadata: EventMetadata,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            metadata,
        }
    }
}

/// Encode a domain event into a [`ProposedEvent`].
///
/// Serializes the adjacently tagged event, splits it into tag and payload,
/// and stamps metadata from the aggregate identity and command context.
///
/// # Errors
///
/// Returns `serde_json::Error` if the event cannot be serialized or does not
/// serialize to a `{"type": ..., "data": ...}` object.
pub fn encode_domain_event<E: DomainEvent>(
    event: &E,
    ctx: &CommandContext,
    aggregate_type: &str,
    instance_id: &str,
) -> serde_json::Result<ProposedEvent> {
    let (event_type, payload) = split_tagged(serde_json::to_value(event)?)?;

    let metadata = EventMetadata {
        aggregate_type: aggregate_type.to_string(),
        instance_id: instance_id.to_string(),
        actor: ctx.actor.clone(),
        correlation_id: ctx.correlation_id.clone(),
        causation_id: None,
        extra: ctx.metadata.clone(),
    };

    Ok(ProposedEvent::new(event_type, payload, metadata))
}

/// Split `{"type": T, "data": D}` into `(T, D)`; `D` defaults to `null`.
fn split_tagged(value: serde_json::Value) -> serde_json::Result<(String, serde_json::Value)> {
    use serde::ser::Error as _;

    let serde_json::Value::Object(mut obj) = value else {
        return Err(serde_json::Error::custom(
            "domain event must serialize to an adjacently tagged object",
        ));
    };
    let event_type = match obj.remove("type") {
        Some(serde_json::Value::String(tag)) => tag,
        _ => {
            return Err(serde_json::Error::custom(
                "domain event is missing a string 'type' tag",
            ));
        }
    };
    let payload = obj.remove("data").unwrap_or(serde_json::Value::Null);
    Ok((event_type, payload))
}

/// An event as read back from a stream or the global feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent {
    /// Client-assigned event ID.
    pub event_id: Uuid,
    /// Stream the event belongs to.
    pub stream_id: String,
    /// Zero-based index within the stream.
    pub stream_version: u64,
    /// Zero-based position in the global log.
    pub global_position: u64,
    /// Event type tag.
    pub event_type: String,
    /// JSON payload.
    pub payload: serde_json::Value,
    /// Infrastructure metadata.
    pub metadata: EventMetadata,
    /// Backend-assigned timestamp (Unix epoch milliseconds).
    pub recorded_at: u64,
}

impl RecordedEvent {
    /// Decode this event into a typed domain event.
    ///
    /// Rebuilds the adjacently tagged object from `event_type` and `payload`
    /// and deserializes it.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the tag is unknown to `E` or the payload
    /// does not match the variant.
    pub fn decode<E: DomainEvent>(&self) -> serde_json::Result<E> {
        let tagged = if self.payload.is_null() {
            serde_json::json!({ "type": self.event_type })
        } else {
            serde_json::json!({ "type": self.event_type, "data": self.payload })
        };
        serde_json::from_value(tagged)
    }

    /// Decode only the payload into `T`, ignoring the tag.
    ///
    /// Used by projections and upcasters that read a single event shape.
    ///
    /// # Errors
    ///
    /// Returns `serde_json::Error` if the payload does not match `T`.
    pub fn payload_as<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_value(self.payload.clone())
    }
}
