//! Live subscription configuration and the per-group catch-up loop.
//!
//! This module provides [`LiveConfig`] for tuning reconnection and timeouts,
//! [`GroupStatus`] for observing a running group, and the loop that drives
//! one subscription group: read the checkpoint, subscribe after it, hand
//! every event to the group's projections, advance the checkpoint, and
//! reconnect with exponential backoff when the feed breaks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_stream::StreamExt;

use crate::backend::{EventStreamBackend, FeedMessage, with_timeout};
use crate::error::{CheckpointError, GroupError};
use crate::event::RecordedEvent;
use crate::manager::SubscriptionGroup;
use crate::projection::{DeadLetterEntry, Delivery, append_dead_letter, deliver};
use crate::registry::EventTypeRegistry;

/// Configuration for live subscription behaviour.
///
/// Controls how the group loop reconnects after a feed disconnection and how
/// long any single backend or checkpoint call may take. All fields have
/// sensible defaults accessible via [`LiveConfig::default()`].
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use marketplace_es::LiveConfig;
///
/// let config = LiveConfig {
///     reconnect_base_delay: Duration::from_millis(200),
///     ..LiveConfig::default()
/// };
/// assert_eq!(config.reconnect_base_delay, Duration::from_millis(200));
/// assert_eq!(config.reconnect_max_delay, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Base delay for exponential backoff on feed reconnection.
    ///
    /// After a feed error, the loop waits `reconnect_base_delay`, then
    /// `2 * reconnect_base_delay`, etc., up to [`reconnect_max_delay`](LiveConfig::reconnect_max_delay).
    /// A session that reached `CaughtUp` resets the backoff.
    ///
    /// Default: 1 second.
    pub reconnect_base_delay: Duration,

    /// Maximum delay between reconnection attempts.
    ///
    /// Default: 30 seconds.
    pub reconnect_max_delay: Duration,

    /// Time limit for subscribing and for each checkpoint read or write.
    /// Expiry is treated like any other transport failure.
    ///
    /// Default: 10 seconds.
    pub operation_timeout: Duration,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            reconnect_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(10),
        }
    }
}

/// Observable state of one subscription group.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GroupStatus {
    /// Last checkpointed global position; `None` before the first event.
    pub position: Option<u64>,
    /// Whether the group has reached the live tail at least once.
    pub caught_up: bool,
    /// Events skipped by the failure policy, counted per projection.
    pub skipped: u64,
    /// Whether the group stopped under [`FailurePolicy::Halt`](crate::FailurePolicy::Halt).
    pub halted: bool,
    /// Number of times the feed was reopened after a failure.
    pub reconnects: u64,
}

/// How a single subscription session ended.
enum SessionOutcome {
    /// Shutdown was requested between events.
    Shutdown,
    /// The feed or checkpoint store failed; reconnect after backoff.
    Retry { error: String, caught_up: bool },
}

/// Everything the loop needs besides the group definition.
pub(crate) struct GroupContext {
    pub backend: Arc<dyn EventStreamBackend>,
    pub registry: Arc<EventTypeRegistry>,
    pub config: LiveConfig,
    pub status: watch::Sender<GroupStatus>,
}

/// Run one subscription group until shutdown or a terminal failure.
///
/// # Returns
///
/// `Ok(())` on graceful shutdown.
///
/// # Errors
///
/// Returns [`GroupError::Halted`] when the halt policy stops the group, or
/// [`GroupError::Checkpoint`] when the checkpoint store refuses a write that
/// retrying cannot fix.
pub(crate) async fn run_group(
    group: SubscriptionGroup,
    ctx: GroupContext,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Result<(), GroupError> {
    let config = ctx.config.clone();
    let mut backoff_delay = config.reconnect_base_delay;

    loop {
        if *shutdown_rx.borrow() {
            tracing::info!(group = %group.name, "group stopped");
            return Ok(());
        }

        match run_session(&group, &ctx, &mut shutdown_rx).await? {
            SessionOutcome::Shutdown => {
                tracing::info!(group = %group.name, "group stopped");
                return Ok(());
            }
            SessionOutcome::Retry { error, caught_up } => {
                if caught_up {
                    backoff_delay = config.reconnect_base_delay;
                }
                tracing::warn!(
                    group = %group.name,
                    error = %error,
                    delay_ms = backoff_delay.as_millis() as u64,
                    "feed interrupted, reconnecting"
                );
                tokio::select! {
                    _ = tokio::time::sleep(backoff_delay) => {}
                    _ = shutdown_rx.changed() => {
                        tracing::info!(group = %group.name, "group stopped");
                        return Ok(());
                    }
                }
                backoff_delay = (backoff_delay * 2).min(config.reconnect_max_delay);
                ctx.status.send_modify(|s| s.reconnects += 1);
            }
        }
    }
}

/// Read the checkpoint, subscribe after it, and process the feed until it
/// breaks or shutdown is requested.
async fn run_session(
    group: &SubscriptionGroup,
    ctx: &GroupContext,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> Result<SessionOutcome, GroupError> {
    let limit = ctx.config.operation_timeout;

    let mut position = match with_timeout(limit, group.checkpoints.get(&group.name)).await {
        Ok(position) => position,
        Err(e) => {
            return Ok(SessionOutcome::Retry {
                error: format!("checkpoint read failed: {e}"),
                caught_up: false,
            });
        }
    };
    ctx.status.send_modify(|s| s.position = position);

    tracing::info!(group = %group.name, from = ?position, "subscribing");
    let mut feed = match with_timeout(limit, ctx.backend.subscribe(position)).await {
        Ok(feed) => feed,
        Err(e) => {
            return Ok(SessionOutcome::Retry {
                error: format!("subscribe failed: {e}"),
                caught_up: false,
            });
        }
    };

    let mut caught_up = false;
    loop {
        // Shutdown is only observed here, between events.
        let next = tokio::select! {
            biased;
            _ = shutdown_rx.changed() => return Ok(SessionOutcome::Shutdown),
            next = feed.next() => next,
        };

        let message = match next {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                return Ok(SessionOutcome::Retry {
                    error: e.to_string(),
                    caught_up,
                });
            }
            None => {
                return Ok(SessionOutcome::Retry {
                    error: "feed ended".into(),
                    caught_up,
                });
            }
        };

        match message {
            FeedMessage::CaughtUp => {
                if !caught_up {
                    tracing::info!(group = %group.name, position = ?position, "caught up");
                }
                caught_up = true;
                ctx.status.send_modify(|s| s.caught_up = true);
            }
            FeedMessage::Event(event) => {
                if position.is_some_and(|p| event.global_position <= p) {
                    tracing::trace!(
                        group = %group.name,
                        position = event.global_position,
                        "skipping already checkpointed event"
                    );
                    continue;
                }

                dispatch(group, ctx, &event).await?;

                match with_timeout(limit, group.checkpoints.put(&group.name, event.global_position))
                    .await
                {
                    Ok(()) => {
                        position = Some(event.global_position);
                        ctx.status.send_modify(|s| s.position = position);
                    }
                    Err(source @ CheckpointError::Rewind { .. }) => {
                        return Err(GroupError::Checkpoint {
                            group: group.name.clone(),
                            source,
                        });
                    }
                    Err(e) => {
                        return Ok(SessionOutcome::Retry {
                            error: format!("checkpoint write failed: {e}"),
                            caught_up,
                        });
                    }
                }
            }
        }
    }
}

/// Hand one event to every interested projection under the group's policy.
async fn dispatch(
    group: &SubscriptionGroup,
    ctx: &GroupContext,
    event: &RecordedEvent,
) -> Result<(), GroupError> {
    if !ctx.registry.is_registered(&event.event_type) {
        tracing::debug!(
            group = %group.name,
            event_type = %event.event_type,
            position = event.global_position,
            "skipping unregistered event type"
        );
        return Ok(());
    }

    for projection in &group.projections {
        if !projection.handles(&event.event_type) {
            continue;
        }
        match deliver(projection.as_ref(), event, group.policy).await {
            Delivery::Applied => {}
            Delivery::Skipped(error) => {
                tracing::error!(
                    group = %group.name,
                    projection = projection.name(),
                    event_type = %event.event_type,
                    position = event.global_position,
                    error = %error,
                    "projection failed, skipping event"
                );
                if let Some(path) = &group.dead_letters {
                    let entry = DeadLetterEntry::new(&group.name, projection.name(), event, &error);
                    if let Err(dl_err) = append_dead_letter(path, &entry) {
                        tracing::error!(
                            group = %group.name,
                            error = %dl_err,
                            "failed to write dead letter"
                        );
                    }
                }
                ctx.status.send_modify(|s| s.skipped += 1);
            }
            Delivery::Halted(source) => {
                tracing::error!(
                    group = %group.name,
                    projection = projection.name(),
                    event_type = %event.event_type,
                    position = event.global_position,
                    error = %source,
                    "projection failed, halting group"
                );
                ctx.status.send_modify(|s| s.halted = true);
                return Err(GroupError::Halted {
                    group: group.name.clone(),
                    projection: projection.name().to_string(),
                    position: event.global_position,
                    source,
                });
            }
        }
    }
    Ok(())
}
