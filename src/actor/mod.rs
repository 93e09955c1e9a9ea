//! Actor layer: named, independently timed units of work.
//!
//! - [`Actor`]: one unit of work returning an [`ActorRunResult`]
//! - [`ActorManager`]: port registering and running actors
//! - [`TokioActorManager`]: one tokio task per actor
//! - [`ActorContext`]: owns the managers and the cluster view, stops them together

mod context;
mod manager;
mod types;

pub use context::{ActorContext, ActorContextBuilder, ActorManagerFactory};
pub use manager::TokioActorManager;
pub use types::{Actor, ActorError, ActorManager, ActorRunResult};
