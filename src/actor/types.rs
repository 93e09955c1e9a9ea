//! Actor type definitions.
//!
//! This module contains the run outcome, error type and the two traits of the
//! actor layer: [`Actor`] (a unit of work) and [`ActorManager`] (the port that
//! times and runs actors).

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;

use crate::core::types::EpochMillis;

/// Outcome of one invocation of an actor's work function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorRunResult {
    /// Retire the actor.
    Done,
    /// Park the actor until it is woken with `reschedule_actor`.
    Suspend,
    /// Run the actor again after the delay.
    RescheduleIn(Duration),
}

impl ActorRunResult {
    /// Run again immediately.
    pub const NOW: ActorRunResult = ActorRunResult::RescheduleIn(Duration::ZERO);

    /// Run again after `millis`, clamping negative delays to zero.
    pub fn reschedule_in_millis(millis: EpochMillis) -> Self {
        ActorRunResult::RescheduleIn(Duration::from_millis(millis.max(0) as u64))
    }
}

/// Errors that can occur in the actor layer.
#[derive(Debug, Error)]
pub enum ActorError {
    /// An actor with the same name is already registered.
    #[error("actor already registered: {0}")]
    AlreadyRegistered(String),

    /// The manager has been stopped.
    #[error("actor manager is closed")]
    Closed,

    /// No async runtime is available to run actors on.
    #[error("no runtime available: {0}")]
    NoRuntime(String),

    /// More than one provider was supplied where at most one is allowed.
    #[error("more than one {0} supplied")]
    DuplicateProvider(&'static str),
}

/// A named, independently scheduled unit of work.
///
/// The manager never runs two invocations of the same actor at once, so `work`
/// takes `&mut self` and may keep its cursor in plain fields.
#[async_trait]
pub trait Actor: Send + 'static {
    /// Run once and report how the actor should continue.
    async fn work(&mut self) -> ActorRunResult;
}

/// Port that registers, times and runs named actors.
#[async_trait]
pub trait ActorManager: Send + Sync {
    /// Install an actor that first runs after `delay`.
    fn register_actor(
        &self,
        name: &str,
        actor: Box<dyn Actor>,
        delay: Duration,
    ) -> Result<(), ActorError>;

    /// Install an actor that waits until it is woken with [`reschedule_actor`](Self::reschedule_actor).
    fn register_suspended_actor(&self, name: &str, actor: Box<dyn Actor>)
    -> Result<(), ActorError>;

    /// Wake or re-time a registered actor. No-op for unknown names.
    fn reschedule_actor(&self, name: &str, delay: Duration);

    /// Retire and forget an actor. Idempotent.
    fn remove_actor(&self, name: &str);

    /// Whether an actor with this name is registered.
    fn is_registered(&self, name: &str) -> bool;

    /// Names of all registered actors.
    fn actor_names(&self) -> Vec<String>;

    /// Runtime used for work the actors fan out.
    fn executor(&self) -> Handle;

    /// Whether [`stop`](Self::stop) has been called.
    fn is_closed(&self) -> bool;

    /// Whether [`stop`](Self::stop) waits for running actors.
    fn supports_graceful_stop(&self) -> bool {
        true
    }

    /// Stop all actors, waiting at most `timeout` (forever when `None`) for running work.
    async fn stop(&self, timeout: Option<Duration>);
}
