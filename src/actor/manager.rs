//! Tokio-backed actor manager.
//!
//! Every registered actor gets its own task. The task owns the actor, sleeps
//! until the actor is due, runs it, and interprets the returned
//! [`ActorRunResult`]. External calls reach the task through an unbounded
//! command channel, so a task never runs two invocations at once.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, error::TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::types::{Actor, ActorError, ActorManager, ActorRunResult};

/// Command sent to a running actor task.
#[derive(Debug, Clone, Copy)]
enum ActorCommand {
    /// Run again after the delay.
    Wake(Duration),
    /// Retire after the current invocation.
    Stop,
}

struct ActorSlot {
    generation: u64,
    commands: UnboundedSender<ActorCommand>,
    handle: JoinHandle<()>,
}

type Registry = Arc<Mutex<HashMap<String, ActorSlot>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, ActorSlot>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Actor manager running each actor as a tokio task.
pub struct TokioActorManager {
    handle: Handle,
    actors: Registry,
    generation: AtomicU64,
    closed: AtomicBool,
}

impl TokioActorManager {
    /// Create a manager on the current tokio runtime.
    pub fn new() -> Result<Self, ActorError> {
        let handle = Handle::try_current().map_err(|e| ActorError::NoRuntime(e.to_string()))?;
        Ok(Self::with_handle(handle))
    }

    /// Create a manager on an explicit runtime.
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle,
            actors: Arc::new(Mutex::new(HashMap::new())),
            generation: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    fn spawn(
        &self,
        name: &str,
        actor: Box<dyn Actor>,
        wake_at: Option<Instant>,
    ) -> Result<(), ActorError> {
        if self.is_closed() {
            return Err(ActorError::Closed);
        }

        let mut actors = lock(&self.actors);
        if actors.contains_key(name) {
            return Err(ActorError::AlreadyRegistered(name.to_string()));
        }

        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let (commands, receiver) = mpsc::unbounded_channel();
        let handle = self.handle.spawn(drive(
            name.to_string(),
            generation,
            actor,
            receiver,
            wake_at,
            Arc::clone(&self.actors),
        ));
        actors.insert(
            name.to_string(),
            ActorSlot {
                generation,
                commands,
                handle,
            },
        );
        Ok(())
    }
}

#[async_trait]
impl ActorManager for TokioActorManager {
    fn register_actor(
        &self,
        name: &str,
        actor: Box<dyn Actor>,
        delay: Duration,
    ) -> Result<(), ActorError> {
        tracing::debug!(actor = name, delay = ?delay, "Registering actor");
        self.spawn(name, actor, Some(wake_time(Instant::now(), delay)))
    }

    fn register_suspended_actor(
        &self,
        name: &str,
        actor: Box<dyn Actor>,
    ) -> Result<(), ActorError> {
        tracing::debug!(actor = name, "Registering suspended actor");
        self.spawn(name, actor, None)
    }

    fn reschedule_actor(&self, name: &str, delay: Duration) {
        if let Some(slot) = lock(&self.actors).get(name) {
            let _ = slot.commands.send(ActorCommand::Wake(delay));
        }
    }

    fn remove_actor(&self, name: &str) {
        if let Some(slot) = lock(&self.actors).remove(name) {
            tracing::debug!(actor = name, "Removing actor");
            let _ = slot.commands.send(ActorCommand::Stop);
        }
    }

    fn is_registered(&self, name: &str) -> bool {
        lock(&self.actors).contains_key(name)
    }

    fn actor_names(&self) -> Vec<String> {
        lock(&self.actors).keys().cloned().collect()
    }

    fn executor(&self) -> Handle {
        self.handle.clone()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn stop(&self, timeout: Option<Duration>) {
        self.closed.store(true, Ordering::Release);

        let slots: Vec<(String, ActorSlot)> = lock(&self.actors).drain().collect();
        if slots.is_empty() {
            return;
        }

        tracing::info!(
            "Stopping {} actor(s) (timeout: {:?})",
            slots.len(),
            timeout
        );

        let mut handles = Vec::with_capacity(slots.len());
        for (name, slot) in slots {
            let _ = slot.commands.send(ActorCommand::Stop);
            handles.push((name, slot.handle));
        }

        let start = Instant::now();
        let deadline = timeout.map(|timeout| start + timeout);
        let mut abandoned = 0usize;

        for (name, mut handle) in handles {
            let finished = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, &mut handle).await.is_ok(),
                None => {
                    let _ = (&mut handle).await;
                    true
                }
            };
            if !finished {
                tracing::warn!(actor = %name, "Actor did not stop in time, aborting");
                handle.abort();
                abandoned += 1;
            }
        }

        if abandoned == 0 {
            tracing::info!("All actors stopped in {:?}", start.elapsed());
        } else {
            tracing::warn!(
                "Shutdown timeout ({:?}) exceeded, aborted {} actor(s)",
                timeout,
                abandoned
            );
        }
    }
}

/// Far enough ahead to never fire in practice.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `from + delay`, saturating at [`FAR_FUTURE`] for delays the clock cannot represent.
fn wake_time(from: Instant, delay: Duration) -> Instant {
    from.checked_add(delay.min(FAR_FUTURE)).unwrap_or(from)
}

/// Frees the registry slot of an actor task however the task ends,
/// including a panicking [`Actor::work`] or an abort.
struct SlotGuard {
    name: String,
    generation: u64,
    registry: Registry,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let mut actors = lock(&self.registry);
        if actors
            .get(&self.name)
            .is_some_and(|slot| slot.generation == self.generation)
        {
            actors.remove(&self.name);
        }
        drop(actors);
        tracing::debug!(actor = %self.name, "Actor retired");
    }
}

/// Body of one actor task.
async fn drive(
    name: String,
    generation: u64,
    actor: Box<dyn Actor>,
    mut commands: UnboundedReceiver<ActorCommand>,
    mut wake_at: Option<Instant>,
    registry: Registry,
) {
    let _slot = SlotGuard {
        name,
        generation,
        registry,
    };
    // Declared after the guard: the actor is dropped before its slot is freed.
    let mut actor = actor;

    loop {
        let Some(at) = wake_at else {
            match commands.recv().await {
                Some(ActorCommand::Wake(delay)) => {
                    wake_at = Some(wake_time(Instant::now(), delay));
                }
                Some(ActorCommand::Stop) | None => break,
            }
            continue;
        };

        tokio::select! {
            biased;

            command = commands.recv() => {
                match command {
                    Some(ActorCommand::Wake(delay)) => {
                        wake_at = Some(wake_time(Instant::now(), delay));
                    }
                    Some(ActorCommand::Stop) | None => break,
                }
                continue;
            }

            _ = tokio::time::sleep_until(at) => {}
        }

        let result = actor.work().await;
        let now = Instant::now();
        wake_at = match result {
            ActorRunResult::Done => break,
            ActorRunResult::Suspend => None,
            ActorRunResult::RescheduleIn(delay) => Some(wake_time(now, delay)),
        };

        // Wake-ups requested while the actor ran must not be lost; keep the earliest.
        let mut stopped = false;
        loop {
            match commands.try_recv() {
                Ok(ActorCommand::Wake(delay)) => {
                    let requested = wake_time(now, delay);
                    wake_at = Some(wake_at.map_or(requested, |at| at.min(requested)));
                }
                Ok(ActorCommand::Stop) | Err(TryRecvError::Disconnected) => {
                    stopped = true;
                    break;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        if stopped {
            break;
        }
    }
}
