//! Testing utilities for users of the Cadence library.
//!
//! This module provides fakes for the processor and transaction ports and a
//! recorder for scheduler events:
//!
//! - [`RecordingHandler`]: An event handler that keeps every event it sees
//! - [`ScriptedInstanceProcessor`]: Returns a scripted sequence of cursors
//! - [`CountingTriggerProcessor`]: Emits one instance per firing
//! - [`RecordingChannel`]: A notification channel with a fixed response
//! - [`FlakyTransactionManager`]: Reports the first N transactions as unavailable
//! - [`wait_until`]: Polls a condition until it holds or a timeout passes

use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::actor::ActorRunResult;
use crate::core::context::{JobProcessingContext, TriggerProcessingContext};
use crate::core::notification::Notification;
use crate::core::processor::{
    JobInstanceProcessor, JobTriggerProcessor, NotificationError, NotificationProcessor,
    ProcessingError,
};
use crate::core::types::NotificationId;
use crate::events::{Event, EventHandler};
use crate::storage::{LocalTransactionManager, TransactionError, TransactionManager, TxBody};

/// Poll `condition` every few milliseconds until it holds.
///
/// Returns `false` if `timeout` passes first.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Tracks how many calls overlap.
#[derive(Default)]
struct InFlight {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn max(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// An event handler that records every event.
///
/// # Example
///
/// ```
/// use cadence::events::{Event, EventBus};
/// use cadence::core::types::TriggerId;
/// use cadence::testing::RecordingHandler;
/// use std::sync::Arc;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let recorder = Arc::new(RecordingHandler::new());
/// let bus = EventBus::new();
/// bus.register(recorder.clone()).await;
/// bus.emit(Event::trigger_ended(TriggerId::new(1))).await;
/// assert_eq!(recorder.count(|e| matches!(e, Event::TriggerEnded { .. })), 1);
/// # }
/// ```
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event seen so far, in order.
    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of events matching `predicate`.
    pub fn count(&self, predicate: impl Fn(&Event) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|event| predicate(event))
            .count()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event.clone());
    }
}

/// An instance processor returning scripted cursors.
///
/// Call `n` returns the `n`th cursor of the script, then `None` once the
/// script runs out. Every call records the cursor it was handed.
pub struct ScriptedInstanceProcessor {
    script: Vec<Option<Value>>,
    failure: Option<String>,
    delay: Duration,
    calls: AtomicUsize,
    seen: Mutex<Vec<Option<Value>>>,
    in_flight: InFlight,
}

impl ScriptedInstanceProcessor {
    /// Create a processor returning `script` in order.
    pub fn new(script: Vec<Option<Value>>) -> Self {
        Self {
            script,
            failure: None,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            in_flight: InFlight::default(),
        }
    }

    /// Create a processor that always fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new(Vec::new())
        }
    }

    /// Sleep for `delay` inside every call.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Cursor handed to each call, in order.
    pub fn seen_cursors(&self) -> Vec<Option<Value>> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Largest number of calls that ever overlapped.
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max()
    }
}

#[async_trait]
impl JobInstanceProcessor for ScriptedInstanceProcessor {
    async fn process(
        &self,
        ctx: &mut JobProcessingContext,
    ) -> Result<Option<Value>, ProcessingError> {
        self.in_flight.enter();
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(ctx.last_processed.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.exit();

        if let Some(message) = &self.failure {
            return Err(ProcessingError::Failed(message.clone()));
        }
        Ok(self.script.get(call).cloned().flatten())
    }
}

/// A trigger processor emitting one default instance per firing.
#[derive(Default)]
pub struct CountingTriggerProcessor {
    failure: Option<String>,
    calls: AtomicUsize,
}

impl CountingTriggerProcessor {
    /// Create a processor that emits one instance per firing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a processor that always fails with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of firings so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobTriggerProcessor for CountingTriggerProcessor {
    async fn process(&self, ctx: &mut TriggerProcessingContext) -> Result<(), ProcessingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.failure {
            return Err(ProcessingError::Failed(message.clone()));
        }
        ctx.emit_default_instance();
        Ok(())
    }
}

#[derive(Debug, Clone)]
enum ChannelResponse {
    Sent,
    RateLimited(Option<Duration>),
    Failed(String),
}

/// A notification channel answering every send the same way.
pub struct RecordingChannel {
    response: ChannelResponse,
    delay: Duration,
    calls: AtomicUsize,
    sent: Mutex<Vec<NotificationId>>,
    in_flight: InFlight,
}

impl RecordingChannel {
    fn with_response(response: ChannelResponse) -> Self {
        Self {
            response,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            sent: Mutex::new(Vec::new()),
            in_flight: InFlight::default(),
        }
    }

    /// A channel accepting every notification.
    pub fn ok() -> Self {
        Self::with_response(ChannelResponse::Sent)
    }

    /// A channel rate limiting every notification, optionally with a retry hint.
    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self::with_response(ChannelResponse::RateLimited(retry_after))
    }

    /// A channel rejecting every notification with `message`.
    pub fn failing(message: impl Into<String>) -> Self {
        Self::with_response(ChannelResponse::Failed(message.into()))
    }

    /// Sleep for `delay` inside every send.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Number of sends attempted.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Ids of the notifications accepted, in order.
    pub fn sent(&self) -> Vec<NotificationId> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Largest number of sends that ever overlapped.
    pub fn max_in_flight(&self) -> usize {
        self.in_flight.max()
    }
}

#[async_trait]
impl NotificationProcessor for RecordingChannel {
    async fn send(&self, notification: &Notification) -> Result<Value, NotificationError> {
        self.in_flight.enter();
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.exit();

        match &self.response {
            ChannelResponse::Sent => {
                self.sent
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(notification.id);
                Ok(json!({ "recipient": notification.recipient }))
            }
            ChannelResponse::RateLimited(retry_after) => Err(NotificationError::RateLimited {
                retry_after: *retry_after,
            }),
            ChannelResponse::Failed(message) => Err(NotificationError::Failed(message.clone())),
        }
    }
}

/// A transaction manager whose first N transactions are unavailable.
///
/// Later transactions run on a [`LocalTransactionManager`].
pub struct FlakyTransactionManager {
    failures_remaining: Mutex<u32>,
    executions: AtomicUsize,
    inner: LocalTransactionManager,
}

impl FlakyTransactionManager {
    /// Fail the next `failures` transactions.
    pub fn new(failures: u32) -> Self {
        Self {
            failures_remaining: Mutex::new(failures),
            executions: AtomicUsize::new(0),
            inner: LocalTransactionManager::new(),
        }
    }

    /// Number of transactions requested, failed ones included.
    pub fn executions(&self) -> usize {
        self.executions.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransactionManager for FlakyTransactionManager {
    async fn execute(
        &self,
        timeout: Duration,
        join_if_possible: bool,
        body: TxBody<'_>,
    ) -> Result<Result<ActorRunResult, ProcessingError>, TransactionError> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        let fail = {
            let mut remaining = self
                .failures_remaining
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if *remaining > 0 {
                *remaining -= 1;
                true
            } else {
                false
            }
        };
        if fail {
            return Err(TransactionError::Unavailable(
                "injected transaction failure".into(),
            ));
        }
        self.inner.execute(timeout, join_if_possible, body).await
    }
}
