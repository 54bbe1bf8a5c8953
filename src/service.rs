//! Generic command handling with create/update registration and
//! optimistic-concurrency retry.
//!
//! A [`CommandService`] is the single entry point surrounding code (HTTP
//! handlers, CLIs, tests) uses to change aggregates. Each command type is
//! registered once, either as a creation command or as an update command,
//! and dispatched by its `TypeId`.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;

use tracing::Instrument;

use crate::aggregate::{Aggregate, AggregateRoot};
use crate::command::CommandContext;
use crate::error::{CommandError, StoreError};
use crate::event::stream_name;
use crate::store::AggregateStore;

/// Default number of reload-and-retry rounds after a concurrency conflict.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

type IdSelector<C> = Box<dyn Fn(&C) -> String + Send + Sync>;
type Factory<A, C> =
    Box<dyn Fn(&str, &C) -> Result<AggregateRoot<A>, <A as Aggregate>::Error> + Send + Sync>;
type Mutator<A, C> =
    Box<dyn Fn(&mut AggregateRoot<A>, &C) -> Result<(), <A as Aggregate>::Error> + Send + Sync>;

enum Registration<A: Aggregate, C> {
    Create {
        id: IdSelector<C>,
        factory: Factory<A, C>,
    },
    Update {
        id: IdSelector<C>,
        mutator: Mutator<A, C>,
    },
}

/// Result of a successfully handled command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Aggregate instance the command targeted.
    pub id: String,
    /// Stream version after the command.
    pub version: u64,
    /// Events persisted by the command (0 for a no-op).
    pub events_appended: usize,
    /// Attempts taken, including the first.
    pub attempts: u32,
}

/// Maps commands to aggregate creation or mutation and persists the result.
///
/// # Examples
///
/// ```ignore
/// let service = CommandService::<ClassifiedAd>::new(store)
///     .create_when(|c: &CreateAd| c.id.clone(), |id, c| ClassifiedAd::create(id, &c.owner))
///     .update_when(|c: &SetTitle| c.id.clone(), |ad, c| ClassifiedAd::set_title(ad, &c.title));
/// service.handle(SetTitle { id: "ad-1".into(), title: "Bike".into() }).await?;
/// ```
pub struct CommandService<A: Aggregate> {
    store: AggregateStore,
    registrations: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
    max_retries: u32,
    _marker: std::marker::PhantomData<fn() -> A>,
}

impl<A: Aggregate> std::fmt::Debug for CommandService<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandService")
            .field("aggregate_type", &A::AGGREGATE_TYPE)
            .field("commands", &self.registrations.len())
            .field("max_retries", &self.max_retries)
            .finish()
    }
}

impl<A: Aggregate> CommandService<A> {
    /// Create a service with no registered commands.
    pub fn new(store: AggregateStore) -> Self {
        Self {
            store,
            registrations: HashMap::new(),
            max_retries: DEFAULT_MAX_RETRIES,
            _marker: std::marker::PhantomData,
        }
    }

    /// Set how many times a conflicting update is reloaded and retried.
    ///
    /// Defaults to [`DEFAULT_MAX_RETRIES`].
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Register command `C` as creating a new aggregate.
    ///
    /// `id` picks the new aggregate's identity from the command; `factory`
    /// builds the aggregate, normally through [`AggregateRoot::create`].
    /// Registering `C` again replaces the previous registration.
    pub fn create_when<C, I, F>(mut self, id: I, factory: F) -> Self
    where
        C: Send + Sync + 'static,
        I: Fn(&C) -> String + Send + Sync + 'static,
        F: Fn(&str, &C) -> Result<AggregateRoot<A>, A::Error> + Send + Sync + 'static,
    {
        let registration: Registration<A, C> = Registration::Create {
            id: Box::new(id),
            factory: Box::new(factory),
        };
        self.registrations
            .insert(TypeId::of::<C>(), Box::new(registration));
        self
    }

    /// Register command `C` as mutating an existing aggregate.
    ///
    /// `mutator` may call [`AggregateRoot::apply`] any number of times. It
    /// may run more than once per command when a concurrent writer forces a
    /// retry, so it must not have side effects outside the aggregate.
    pub fn update_when<C, I, M>(mut self, id: I, mutator: M) -> Self
    where
        C: Send + Sync + 'static,
        I: Fn(&C) -> String + Send + Sync + 'static,
        M: Fn(&mut AggregateRoot<A>, &C) -> Result<(), A::Error> + Send + Sync + 'static,
    {
        let registration: Registration<A, C> = Registration::Update {
            id: Box::new(id),
            mutator: Box::new(mutator),
        };
        self.registrations
            .insert(TypeId::of::<C>(), Box::new(registration));
        self
    }

    /// Handle a command with an empty [`CommandContext`].
    ///
    /// # Errors
    ///
    /// See [`handle_with`](CommandService::handle_with).
    pub async fn handle<C>(&self, command: C) -> Result<CommandOutcome, CommandError<A::Error>>
    where
        C: Send + Sync + 'static,
    {
        self.handle_with(command, &CommandContext::default()).await
    }

    /// Handle a command, stamping `ctx` onto every persisted event.
    ///
    /// # Errors
    ///
    /// * [`CommandError::UnknownCommand`] if `C` was never registered.
    /// * [`CommandError::Validation`] if the factory or mutator rejected it.
    /// * [`CommandError::AlreadyExists`] if a creation targets an existing stream.
    /// * [`CommandError::NotFound`] if an update targets a missing aggregate.
    /// * [`CommandError::Conflict`] if every retry hit a concurrent writer.
    /// * [`CommandError::Transport`] on connectivity failure or timeout.
    pub async fn handle_with<C>(
        &self,
        command: C,
        ctx: &CommandContext,
    ) -> Result<CommandOutcome, CommandError<A::Error>>
    where
        C: Send + Sync + 'static,
    {
        let registration = self
            .registrations
            .get(&TypeId::of::<C>())
            .and_then(|boxed| boxed.downcast_ref::<Registration<A, C>>())
            .ok_or(CommandError::UnknownCommand(type_name::<C>()))?;

        let span = tracing::info_span!(
            "handle",
            aggregate_type = A::AGGREGATE_TYPE,
            command = type_name::<C>()
        );

        async {
            match registration {
                Registration::Create { id, factory } => {
                    let id = id(&command);
                    self.create(&id, &command, factory, ctx).await
                }
                Registration::Update { id, mutator } => {
                    let id = id(&command);
                    self.update(&id, &command, mutator, ctx).await
                }
            }
        }
        .instrument(span)
        .await
    }

    async fn create<C>(
        &self,
        id: &str,
        command: &C,
        factory: &Factory<A, C>,
        ctx: &CommandContext,
    ) -> Result<CommandOutcome, CommandError<A::Error>> {
        let mut root = factory(id, command).map_err(CommandError::Validation)?;
        let events_appended = root.uncommitted().len();

        match self.store.save(&mut root, ctx).await {
            Ok(version) => Ok(CommandOutcome {
                id: id.to_string(),
                version,
                events_appended,
                attempts: 1,
            }),
            Err(StoreError::Conflict { stream_id, .. }) => {
                tracing::info!(stream_id = %stream_id, "creation rejected, stream exists");
                Err(CommandError::AlreadyExists { stream_id })
            }
            Err(e) => Err(from_store_error(e)),
        }
    }

    async fn update<C>(
        &self,
        id: &str,
        command: &C,
        mutator: &Mutator<A, C>,
        ctx: &CommandContext,
    ) -> Result<CommandOutcome, CommandError<A::Error>> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;

            let mut root = self
                .store
                .load::<A>(id)
                .await
                .map_err(from_store_error)?;
            mutator(&mut root, command).map_err(CommandError::Validation)?;
            let events_appended = root.uncommitted().len();

            match self.store.save(&mut root, ctx).await {
                Ok(version) => {
                    return Ok(CommandOutcome {
                        id: id.to_string(),
                        version,
                        events_appended,
                        attempts,
                    });
                }
                Err(StoreError::Conflict { stream_id, actual, .. }) => {
                    if attempts > self.max_retries {
                        tracing::warn!(
                            stream_id = %stream_id,
                            attempts,
                            "concurrency retries exhausted"
                        );
                        return Err(CommandError::Conflict {
                            stream_id,
                            attempts,
                        });
                    }
                    tracing::debug!(
                        stream_id = %stream_id,
                        attempt = attempts,
                        loaded = root.version(),
                        actual,
                        "concurrency conflict, reloading"
                    );
                }
                Err(e) => return Err(from_store_error(e)),
            }
        }
    }
}

fn from_store_error<E>(err: StoreError) -> CommandError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    match err {
        StoreError::NotFound { stream_id } => CommandError::NotFound { stream_id },
        StoreError::Transport(e) => CommandError::Transport(e),
        other => CommandError::Internal(other),
    }
}

/// Stream name a command for `A` with identity `id` writes to.
pub fn target_stream<A: Aggregate>(id: &str) -> String {
    stream_name(A::AGGREGATE_TYPE, id)
}
