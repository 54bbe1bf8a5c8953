//! Subscription groups and the manager that runs them.
//!
//! A [`SubscriptionGroup`] is a named set of projections sharing one
//! checkpoint. The [`ProjectionManager`] starts one background task per
//! group and returns a [`ManagerHandle`] for observing and stopping them.
//! Groups are independent: a slow or halted group never holds back another.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::backend::EventStreamBackend;
use crate::checkpoint::CheckpointStore;
use crate::error::{GroupError, ManagerError};
use crate::live::{GroupContext, GroupStatus, LiveConfig, run_group};
use crate::projection::{FailurePolicy, Projection};
use crate::registry::EventTypeRegistry;

/// Projections that advance together under one checkpoint.
///
/// # Examples
///
/// ```ignore
/// let group = SubscriptionGroup::new("readmodels", checkpoints)
///     .projection(ClassifiedAdDetails::new(documents.clone()))
///     .projection(UserDetails::new(documents.clone()))
///     .failure_policy(FailurePolicy::Halt);
/// ```
pub struct SubscriptionGroup {
    pub(crate) name: String,
    pub(crate) checkpoints: Arc<dyn CheckpointStore>,
    pub(crate) projections: Vec<Arc<dyn Projection>>,
    pub(crate) policy: FailurePolicy,
    pub(crate) dead_letters: Option<PathBuf>,
}

impl std::fmt::Debug for SubscriptionGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionGroup")
            .field("name", &self.name)
            .field(
                "projections",
                &self.projections.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("policy", &self.policy)
            .field("dead_letters", &self.dead_letters)
            .finish()
    }
}

impl SubscriptionGroup {
    /// Create an empty group whose checkpoint is stored in `checkpoints`
    /// under `name`.
    pub fn new(name: impl Into<String>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        Self {
            name: name.into(),
            checkpoints,
            projections: Vec::new(),
            policy: FailurePolicy::default(),
            dead_letters: None,
        }
    }

    /// Add a projection. Projections see each event in registration order.
    pub fn projection(self, projection: impl Projection) -> Self {
        self.shared_projection(Arc::new(projection))
    }

    /// Add a projection the caller keeps a handle to.
    pub fn shared_projection(mut self, projection: Arc<dyn Projection>) -> Self {
        self.projections.push(projection);
        self
    }

    /// What to do when a projection fails. Defaults to
    /// [`FailurePolicy::default`].
    pub fn failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// JSONL file that receives an entry for every skipped event.
    pub fn dead_letters(mut self, path: impl Into<PathBuf>) -> Self {
        self.dead_letters = Some(path.into());
        self
    }

    /// Group name, also its checkpoint name.
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Builder and launcher for subscription groups over one backend.
pub struct ProjectionManager {
    backend: Arc<dyn EventStreamBackend>,
    registry: Arc<EventTypeRegistry>,
    config: LiveConfig,
    groups: Vec<SubscriptionGroup>,
}

impl std::fmt::Debug for ProjectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProjectionManager")
            .field("config", &self.config)
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

impl ProjectionManager {
    /// Create a manager with no groups.
    pub fn new(backend: Arc<dyn EventStreamBackend>, registry: Arc<EventTypeRegistry>) -> Self {
        Self {
            backend,
            registry,
            config: LiveConfig::default(),
            groups: Vec::new(),
        }
    }

    /// Override reconnection and timeout settings.
    pub fn live_config(mut self, config: LiveConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a subscription group.
    pub fn group(mut self, group: SubscriptionGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Spawn one task per group and return a handle to them.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::DuplicateGroup`] if two groups share a name,
    /// or [`ManagerError::EmptyGroup`] if a group has no projections.
    /// Nothing is spawned on error.
    pub fn start(self) -> Result<ManagerHandle, ManagerError> {
        let mut names = std::collections::HashSet::new();
        for group in &self.groups {
            if !names.insert(group.name.as_str()) {
                return Err(ManagerError::DuplicateGroup(group.name.clone()));
            }
            if group.projections.is_empty() {
                return Err(ManagerError::EmptyGroup(group.name.clone()));
            }
        }

        let (shutdown_tx, _) = watch::channel(false);
        let mut statuses = HashMap::new();
        let mut tasks = Vec::new();

        for group in self.groups {
            let name = group.name.clone();
            let (status_tx, status_rx) = watch::channel(GroupStatus::default());
            let ctx = GroupContext {
                backend: Arc::clone(&self.backend),
                registry: Arc::clone(&self.registry),
                config: self.config.clone(),
                status: status_tx,
            };
            let span = tracing::info_span!("group", name = %name);
            let task = tokio::spawn(run_group(group, ctx, shutdown_tx.subscribe()).instrument(span));
            tracing::info!(group = %name, "subscription group started");
            statuses.insert(name.clone(), status_rx);
            tasks.push((name, task));
        }

        Ok(ManagerHandle {
            shutdown_tx: Arc::new(shutdown_tx),
            statuses: Arc::new(statuses),
            tasks: Arc::new(Mutex::new(tasks)),
        })
    }
}

/// Handle for observing and stopping running subscription groups.
///
/// Dropping the handle does **not** stop the groups; call
/// [`shutdown`](ManagerHandle::shutdown) for graceful termination.
///
/// `Clone` is cheap: all fields are `Arc`-wrapped.
#[derive(Clone)]
pub struct ManagerHandle {
    shutdown_tx: Arc<watch::Sender<bool>>,
    statuses: Arc<HashMap<String, watch::Receiver<GroupStatus>>>,
    #[allow(clippy::type_complexity)]
    tasks: Arc<Mutex<Vec<(String, JoinHandle<Result<(), GroupError>>)>>>,
}

impl std::fmt::Debug for ManagerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerHandle")
            .field("groups", &self.statuses.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl ManagerHandle {
    /// Current status of `group`, or `None` for an unknown group.
    pub fn status(&self, group: &str) -> Option<GroupStatus> {
        self.statuses.get(group).map(|rx| rx.borrow().clone())
    }

    /// Whether `group` has reached the live tail at least once.
    pub fn is_caught_up(&self, group: &str) -> bool {
        self.status(group).is_some_and(|s| s.caught_up)
    }

    /// Wait until `group` has checkpointed `position` or later.
    ///
    /// Returns the status that satisfied the wait. Returns early with the
    /// current status if the group halts or its task ends, and `None` for an
    /// unknown group. Combine with `tokio::time::timeout` to bound the wait.
    pub async fn wait_for_position(&self, group: &str, position: u64) -> Option<GroupStatus> {
        let mut rx = self.statuses.get(group)?.clone();
        let reached = |s: &GroupStatus| s.halted || s.position.is_some_and(|p| p >= position);
        let result = rx.wait_for(reached).await.map(|status| status.clone());
        match result {
            Ok(status) => Some(status),
            Err(_) => Some(rx.borrow().clone()),
        }
    }

    /// Signal every group to stop and wait for their tasks.
    ///
    /// Each group finishes the event it is handling, including its
    /// checkpoint write, before it stops. Calling `shutdown` more than once
    /// is safe: later calls return `Ok(())` immediately.
    ///
    /// # Errors
    ///
    /// Returns the first terminal [`GroupError`] any group reported.
    pub async fn shutdown(&self) -> Result<(), GroupError> {
        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        let mut first_error = None;
        for (name, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => Err(GroupError::Panicked {
                    group: name.clone(),
                    message: e.to_string(),
                }),
            };
            if let Err(e) = result {
                tracing::error!(group = %name, error = %e, "subscription group failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}
