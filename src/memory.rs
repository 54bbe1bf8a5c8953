//! In-process [`EventStreamBackend`].
//!
//! Streams and the global log live behind one `RwLock`; appends take the
//! write lock, check the expected version, assign positions and broadcast the
//! new events to live subscribers before releasing it. Subscribing snapshots
//! history and joins the broadcast under the same lock, so a subscriber sees
//! every event exactly once.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::broadcast;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;

use crate::backend::{EventStreamBackend, ExpectedVersion, FeedMessage, FeedStream};
use crate::error::{AppendError, TransportError};
use crate::event::{ProposedEvent, RecordedEvent};

const DEFAULT_LIVE_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
enum LiveSignal {
    Event(RecordedEvent),
    Disconnect,
}

#[derive(Debug, Default)]
struct Log {
    streams: HashMap<String, Vec<RecordedEvent>>,
    all: Vec<RecordedEvent>,
}

#[derive(Debug)]
struct Inner {
    log: RwLock<Log>,
    live: broadcast::Sender<LiveSignal>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
}

/// Event-stream backend held entirely in memory.
///
/// `Clone` is cheap and clones share the same log. Fault hooks
/// ([`set_offline`](InMemoryBackend::set_offline),
/// [`set_latency`](InMemoryBackend::set_latency),
/// [`disconnect_all`](InMemoryBackend::disconnect_all)) let callers exercise
/// timeout and reconnect paths.
#[derive(Debug, Clone)]
pub struct InMemoryBackend {
    inner: Arc<Inner>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::with_live_capacity(DEFAULT_LIVE_CAPACITY)
    }
}

impl InMemoryBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty backend whose live subscribers may fall at most
    /// `capacity` events behind before being disconnected.
    pub fn with_live_capacity(capacity: usize) -> Self {
        let (live, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                log: RwLock::new(Log::default()),
                live,
                offline: AtomicBool::new(false),
                latency_ms: AtomicU64::new(0),
            }),
        }
    }

    /// Make every subsequent call fail with [`TransportError::Unavailable`].
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::Release);
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner
            .latency_ms
            .store(latency.as_millis() as u64, Ordering::Release);
    }

    /// Break every open subscription; each yields one
    /// [`TransportError::Disconnected`].
    pub fn disconnect_all(&self) {
        let _ = self.inner.live.send(LiveSignal::Disconnect);
    }

    /// Number of events in the global log.
    pub fn len(&self) -> usize {
        self.inner.log.read().map(|log| log.all.len()).unwrap_or(0)
    }

    /// Whether the global log is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn gate(&self) -> Result<(), TransportError> {
        let latency = self.inner.latency_ms.load(Ordering::Acquire);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.inner.offline.load(Ordering::Acquire) {
            return Err(TransportError::Unavailable("backend is offline".into()));
        }
        Ok(())
    }
}

fn poisoned() -> TransportError {
    TransportError::Unavailable("event log lock poisoned".into())
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[async_trait::async_trait]
impl EventStreamBackend for InMemoryBackend {
    async fn append(
        &self,
        stream_id: &str,
        expected: ExpectedVersion,
        events: Vec<ProposedEvent>,
    ) -> Result<u64, AppendError> {
        self.gate().await?;

        let mut log = self.inner.log.write().map_err(|_| poisoned())?;
        let current = log.streams.get(stream_id).map_or(0, |s| s.len() as u64);
        if !expected.matches(current) {
            return Err(AppendError::Conflict {
                expected,
                actual: current,
            });
        }

        let recorded_at = now_millis();
        let mut stream_version = current;
        for proposed in events {
            let event = RecordedEvent {
                event_id: proposed.event_id,
                stream_id: stream_id.to_string(),
                stream_version,
                global_position: log.all.len() as u64,
                event_type: proposed.event_type,
                payload: proposed.payload,
                metadata: proposed.metadata,
                recorded_at,
            };
            log.streams
                .entry(stream_id.to_string())
                .or_default()
                .push(event.clone());
            log.all.push(event.clone());
            // No receivers is fine.
            let _ = self.inner.live.send(LiveSignal::Event(event));
            stream_version += 1;
        }

        Ok(stream_version)
    }

    async fn read_stream(&self, stream_id: &str) -> Result<Vec<RecordedEvent>, TransportError> {
        self.gate().await?;
        let log = self.inner.log.read().map_err(|_| poisoned())?;
        Ok(log.streams.get(stream_id).cloned().unwrap_or_default())
    }

    async fn subscribe(&self, from: Option<u64>) -> Result<FeedStream, TransportError> {
        self.gate().await?;

        let (history, receiver) = {
            let log = self.inner.log.read().map_err(|_| poisoned())?;
            let start = from.map_or(0, |p| p.saturating_add(1)).min(log.all.len() as u64) as usize;
            (log.all[start..].to_vec(), self.inner.live.subscribe())
        };

        let history = tokio_stream::iter(
            history
                .into_iter()
                .map(|e| Ok::<_, TransportError>(FeedMessage::Event(e))),
        );
        let caught_up = tokio_stream::once(Ok(FeedMessage::CaughtUp));
        let live = BroadcastStream::new(receiver).map(|signal| match signal {
            Ok(LiveSignal::Event(e)) => Ok(FeedMessage::Event(e)),
            Ok(LiveSignal::Disconnect) => Err(TransportError::Disconnected(
                "subscription dropped by backend".into(),
            )),
            Err(BroadcastStreamRecvError::Lagged(n)) => Err(TransportError::Disconnected(
                format!("subscriber lagged {n} events behind"),
            )),
        });

        Ok(Box::pin(history.chain(caught_up).chain(live)))
    }
}
