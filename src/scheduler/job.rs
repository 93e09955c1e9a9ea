//! Job scheduler: binds persisted triggers and instances to actors.
//!
//! Each trigger and each `NEW` instance owned by this node runs as its own
//! named actor. Names carry the cluster version they were registered under;
//! a membership change purges every actor from an older version and rescans
//! storage for the new partition.

use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use super::handlers::JobClusterListener;
use super::types::{SchedulerError, names};
use crate::actor::{Actor, ActorContext, ActorManager, ActorRunResult};
use crate::cluster::{ClusterEvent, ClusterEventKind, ClusterNodeInfo, ClusterStateManager};
use crate::config::JobSchedulerConfig;
use crate::core::context::{JobProcessingContext, ScheduleContext, TriggerProcessingContext};
use crate::core::job::{
    Admission, Deferral, JobConfiguration, JobInstance, JobTrigger, NewJobInstance,
};
use crate::core::processor::{JobProcessors, ProcessingError};
use crate::core::schedule::{JobSchedule, ScheduleSpec};
use crate::core::types::{
    EpochMillis, InstanceId, Partition, TriggerId, delay_until, now_millis, to_datetime,
};
use crate::events::{Event, EventBus};
use crate::storage::{
    JobManager, LocalTransactionManager, StorageError, TransactionManager, TxOutcome,
    run_in_transaction,
};

/// Runs job triggers and instances on the actors of one actor manager.
///
/// Cheap to clone; every clone drives the same scheduler. Once the last
/// clone is dropped the actors and cluster listeners retire on their next turn.
pub struct JobScheduler<M: JobManager + 'static> {
    inner: Arc<JobSchedulerInner<M>>,
}

impl<M: JobManager + 'static> Clone for JobScheduler<M> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct JobSchedulerInner<M: JobManager + 'static> {
    jobs: Arc<M>,
    processors: JobProcessors,
    events: Arc<EventBus>,
    transactions: Arc<dyn TransactionManager>,
    actors: Arc<dyn ActorManager>,
    cluster: Arc<dyn ClusterStateManager>,
    config: JobSchedulerConfig,
    node: RwLock<Option<ClusterNodeInfo>>,
    queued: Mutex<HashSet<String>>,
    rebalance: tokio::sync::Mutex<()>,
    closed: AtomicBool,
}

/// Builder for [`JobScheduler`].
pub struct JobSchedulerBuilder<M: JobManager + 'static> {
    jobs: Arc<M>,
    processors: JobProcessors,
    events: Arc<EventBus>,
    transactions: Arc<dyn TransactionManager>,
    config: JobSchedulerConfig,
}

impl<M: JobManager + 'static> JobSchedulerBuilder<M> {
    /// Set the processors looked up by job name.
    pub fn with_processors(mut self, processors: JobProcessors) -> Self {
        self.processors = processors;
        self
    }

    /// Set the event bus that receives trigger and instance events.
    pub fn with_event_bus(mut self, events: Arc<EventBus>) -> Self {
        self.events = events;
        self
    }

    /// Set the transaction manager wrapping every run loop step.
    pub fn with_transaction_manager(mut self, transactions: Arc<dyn TransactionManager>) -> Self {
        self.transactions = transactions;
        self
    }

    /// Set the scheduler configuration.
    pub fn with_config(mut self, config: JobSchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Start the scheduler on an actor manager created by `context`.
    ///
    /// Subscribes to cluster changes; the initial cluster snapshot triggers a
    /// scan of this node's partition before this returns.
    pub async fn start(self, context: &ActorContext) -> Result<JobScheduler<M>, SchedulerError> {
        let actors = context.new_actor_manager()?;
        let cluster = context.cluster_state_manager();
        let inner = Arc::new(JobSchedulerInner {
            jobs: self.jobs,
            processors: self.processors,
            events: self.events,
            transactions: self.transactions,
            actors,
            cluster: Arc::clone(&cluster),
            config: self.config,
            node: RwLock::new(None),
            queued: Mutex::new(HashSet::new()),
            rebalance: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
        });

        let listener = Arc::new(JobClusterListener {
            scheduler: Arc::downgrade(&inner),
        });
        cluster.register_event_listener(ClusterEventKind::TriggerAdded, listener.clone());
        cluster.register_event_listener(ClusterEventKind::InstanceAdded, listener.clone());
        cluster.register_listener(listener).await;

        Ok(JobScheduler { inner })
    }
}

impl<M: JobManager + 'static> JobScheduler<M> {
    /// Start building a scheduler over `jobs`.
    pub fn builder(jobs: Arc<M>) -> JobSchedulerBuilder<M> {
        JobSchedulerBuilder {
            jobs,
            processors: JobProcessors::new(),
            events: Arc::new(EventBus::new()),
            transactions: Arc::new(LocalTransactionManager::new()),
            config: JobSchedulerConfig::default(),
        }
    }

    /// Admit a trigger.
    ///
    /// Done triggers are rejected. A trigger owned by this node is queued
    /// here; otherwise the other nodes are told about it.
    pub async fn add_trigger(&self, trigger: &JobTrigger) -> Result<(), SchedulerError> {
        self.inner.admit_trigger(trigger).await
    }

    /// Admit an instance. Only `NEW` instances are accepted.
    pub async fn add_instance(&self, instance: &JobInstance) -> Result<(), SchedulerError> {
        self.inner.admit_instance(instance).await
    }

    /// Persist a new trigger and admit it.
    pub async fn create_trigger(
        &self,
        configuration: JobConfiguration,
        schedule: ScheduleSpec,
    ) -> Result<JobTrigger, SchedulerError> {
        let trigger = self
            .inner
            .jobs
            .create_job_trigger(configuration, schedule)
            .await?;
        self.add_trigger(&trigger).await?;
        Ok(trigger)
    }

    /// Persist a new instance and admit it.
    pub async fn create_instance(
        &self,
        request: NewJobInstance,
    ) -> Result<JobInstance, SchedulerError> {
        let instance = self.inner.jobs.create_job_instance(request).await?;
        self.add_instance(&instance).await?;
        Ok(instance)
    }

    /// Snapshot of this node as last seen by the scheduler.
    pub fn node_info(&self) -> ClusterNodeInfo {
        self.inner.node()
    }

    /// Names of the actors currently registered.
    pub fn actor_names(&self) -> Vec<String> {
        self.inner.actors.actor_names()
    }

    /// The event bus receiving trigger and instance events.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.inner.events
    }

    /// Whether [`stop`](Self::stop) has been called.
    pub fn is_stopped(&self) -> bool {
        self.inner.is_stopped()
    }

    /// Stop the scheduler.
    ///
    /// Running loops observe the closed flag and retire; the actor manager is
    /// drained within `timeout`, or without a bound when `None`.
    pub async fn stop(&self, timeout: Option<Duration>) {
        self.inner.closed.store(true, Ordering::SeqCst);
        tracing::info!("Stopping job scheduler");
        self.inner.actors.stop(timeout).await;
    }
}

impl<M: JobManager + 'static> JobSchedulerInner<M> {
    fn is_stopped(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn node(&self) -> ClusterNodeInfo {
        let node = *self.node.read().unwrap_or_else(PoisonError::into_inner);
        node.unwrap_or_else(|| self.cluster.node_info())
    }

    fn queued(&self) -> MutexGuard<'_, HashSet<String>> {
        self.queued.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register the actor built by `actor` unless one of that name is already
    /// queued. Built only once the name is claimed: job actors release their
    /// name when dropped.
    fn queue(
        &self,
        name: String,
        delay: Duration,
        actor: impl FnOnce() -> Box<dyn Actor>,
    ) -> bool {
        if !self.queued().insert(name.clone()) {
            return false;
        }
        if let Err(e) = self.actors.register_actor(&name, actor(), delay) {
            self.queued().remove(&name);
            tracing::warn!(actor = %name, error = %e, "Failed to register actor");
            return false;
        }
        true
    }

    fn dequeue(&self, name: &str) {
        self.queued().remove(name);
    }

    async fn admit_trigger(self: &Arc<Self>, trigger: &JobTrigger) -> Result<(), SchedulerError> {
        if trigger.is_done() {
            return Err(SchedulerError::TriggerDone(trigger.id));
        }
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        if self.node().owns(trigger.id.value()) {
            self.queue_trigger(trigger).await;
        } else {
            self.cluster
                .fire_event_exclude_self(ClusterEvent::TriggerAdded {
                    trigger_id: trigger.id,
                })
                .await;
        }
        Ok(())
    }

    async fn admit_instance(self: &Arc<Self>, instance: &JobInstance) -> Result<(), SchedulerError> {
        if !instance.work.is_new() {
            return Err(SchedulerError::InstanceNotNew {
                id: instance.id,
                state: instance.state(),
            });
        }
        if self.is_stopped() {
            return Err(SchedulerError::Stopped);
        }
        if self.node().owns(instance.id.value()) {
            self.queue_instance(instance);
        } else {
            self.cluster
                .fire_event_exclude_self(ClusterEvent::InstanceAdded {
                    instance_id: instance.id,
                })
                .await;
        }
        Ok(())
    }

    async fn queue_trigger(self: &Arc<Self>, trigger: &JobTrigger) {
        let ctx = ScheduleContext::resumed(trigger.last_execution_time)
            .with_execution_count(trigger.execution_count);
        let due = trigger.schedule.next_epoch_schedule(&ctx);
        if trigger.last_execution_time.is_some() && due == ctx.last_scheduled_execution_time {
            // Exhausted before the end could be recorded.
            self.end_trigger(trigger.id).await;
            return;
        }

        let name = names::trigger(self.node().version, trigger.id);
        let actor = || -> Box<dyn Actor> {
            Box::new(TriggerActor {
                scheduler: Arc::downgrade(self),
                name: name.clone(),
                run: TriggerRun {
                    trigger_id: trigger.id,
                    ctx,
                    due,
                    created: Vec::new(),
                },
            })
        };
        if self.queue(name.clone(), delay_until(due, now_millis()), actor) {
            tracing::debug!(trigger_id = %trigger.id, due, "Trigger queued");
        }
    }

    fn queue_instance(self: &Arc<Self>, instance: &JobInstance) {
        let name = names::instance(self.node().version, instance.id);
        let actor = || -> Box<dyn Actor> {
            Box::new(InstanceActor {
                scheduler: Arc::downgrade(self),
                name: name.clone(),
                run: InstanceRun {
                    instance_id: instance.id,
                    ctx: ScheduleContext::resumed(instance.work.last_execution_time),
                    started: None,
                },
            })
        };
        let delay = delay_until(instance.work.schedule_time, now_millis());
        if self.queue(name.clone(), delay, actor) {
            tracing::debug!(instance_id = %instance.id, delay = ?delay, "Instance queued");
        }
    }

    async fn end_trigger(&self, id: TriggerId) {
        if let Err(e) = self.jobs.on_job_trigger_ended(id).await {
            tracing::warn!(trigger_id = %id, error = %e, "Failed to mark trigger ended");
            return;
        }
        tracing::info!(trigger_id = %id, "Trigger ended");
        self.events.emit(Event::trigger_ended(id)).await;
    }

    /// Adopt a new cluster snapshot: purge actors of older versions and
    /// queue everything undone in the new partition.
    pub(crate) async fn rebalance(self: &Arc<Self>, info: ClusterNodeInfo) {
        let _guard = self.rebalance.lock().await;
        {
            let mut node = self.node.write().unwrap_or_else(PoisonError::into_inner);
            if node.is_some_and(|current| current.version >= info.version) {
                tracing::debug!(version = info.version, "Ignoring stale cluster state");
                return;
            }
            *node = Some(info);
        }
        if self.is_stopped() {
            return;
        }

        let prefix = names::version_prefix(info.version);
        let mut removed = 0usize;
        for name in self.actors.actor_names() {
            if !name.starts_with(&prefix) {
                self.actors.remove_actor(&name);
                removed += 1;
            }
        }
        self.queued().retain(|name| name.starts_with(&prefix));

        tracing::info!(
            position = info.position,
            size = info.size,
            version = info.version,
            removed,
            "Cluster state changed, scanning partition"
        );
        if let Err(e) = self.scan(info.partition()).await {
            tracing::warn!(version = info.version, error = %e, "Failed to scan partition");
        }
    }

    async fn scan(self: &Arc<Self>, partition: Partition) -> Result<(), StorageError> {
        let limit = self.config.process_count;

        let mut after = None;
        loop {
            let page = self
                .jobs
                .undone_job_triggers(partition, after, limit)
                .await?;
            let Some(last) = page.last() else { break };
            after = Some(last.id);
            for trigger in &page {
                if self.is_stopped() {
                    return Ok(());
                }
                self.queue_trigger(trigger).await;
            }
            if page.len() < limit {
                break;
            }
        }

        let mut after = None;
        loop {
            let page = self
                .jobs
                .undone_job_instances(partition, after, limit)
                .await?;
            let Some(last) = page.last() else { break };
            after = Some(last.id);
            for instance in page.iter().filter(|instance| instance.work.is_new()) {
                if self.is_stopped() {
                    return Ok(());
                }
                self.queue_instance(instance);
            }
            if page.len() < limit {
                break;
            }
        }
        Ok(())
    }

    pub(crate) async fn on_cluster_event(self: &Arc<Self>, event: &ClusterEvent) {
        if self.is_stopped() {
            return;
        }
        let node = self.node();
        match event {
            ClusterEvent::TriggerAdded { trigger_id } if node.owns(trigger_id.value()) => {
                match self.jobs.get_job_trigger(*trigger_id).await {
                    Ok(trigger) if !trigger.is_done() => self.queue_trigger(&trigger).await,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(trigger_id = %trigger_id, error = %e, "Failed to load announced trigger")
                    }
                }
            }
            ClusterEvent::InstanceAdded { instance_id } if node.owns(instance_id.value()) => {
                match self.jobs.get_job_instance(*instance_id).await {
                    Ok(instance) if instance.work.is_new() => self.queue_instance(&instance),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(instance_id = %instance_id, error = %e, "Failed to load announced instance")
                    }
                }
            }
            _ => {}
        }
    }

    async fn run_trigger(self: &Arc<Self>, run: &mut TriggerRun) -> ActorRunResult {
        if self.is_stopped() {
            return ActorRunResult::Done;
        }
        let now = now_millis();
        run.ctx.started(run.due, now);
        run.created.clear();

        let timeout = self.config.transaction_timeout();
        let outcome = run_in_transaction(
            self.transactions.as_ref(),
            timeout,
            Box::pin(self.fire_trigger(run, now)),
        )
        .await;
        let committed = matches!(outcome, TxOutcome::Completed(_));
        let result = match outcome {
            TxOutcome::Completed(result) => result,
            TxOutcome::Failed(error) => {
                tracing::warn!(trigger_id = %run.trigger_id, error = %error, "Trigger processing failed");
                let recorded = run_in_transaction(
                    self.transactions.as_ref(),
                    timeout,
                    Box::pin(self.record_trigger_error(run, now, error.to_string())),
                )
                .await;
                match recorded {
                    TxOutcome::Completed(result) => result,
                    TxOutcome::Failed(e) => {
                        tracing::warn!(trigger_id = %run.trigger_id, error = %e, "Failed to record trigger error");
                        ActorRunResult::Done
                    }
                    TxOutcome::Unavailable(e) => {
                        tracing::warn!(trigger_id = %run.trigger_id, error = %e, "Transaction unavailable, retiring trigger");
                        ActorRunResult::Done
                    }
                }
            }
            TxOutcome::Unavailable(error) => {
                tracing::warn!(trigger_id = %run.trigger_id, error = %error, "Transaction unavailable, retiring trigger");
                ActorRunResult::Done
            }
        };

        if self.is_stopped() {
            return ActorRunResult::Done;
        }
        for instance in std::mem::take(&mut run.created) {
            let instance = if committed {
                instance
            } else {
                match self.surviving_instance(instance.id).await {
                    Some(instance) => instance,
                    None => continue,
                }
            };
            if let Err(e) = self.admit_instance(&instance).await {
                tracing::warn!(trigger_id = %run.trigger_id, instance_id = %instance.id, error = %e, "Failed to admit instance");
            }
        }
        result
    }

    /// An instance created by a firing whose transaction failed. Stores
    /// without rollback keep it, and it must still run.
    async fn surviving_instance(&self, id: InstanceId) -> Option<JobInstance> {
        match self.jobs.get_job_instance(id).await {
            Ok(instance) if instance.work.is_new() => {
                tracing::debug!(instance_id = %id, "Instance survived failed firing");
                Some(instance)
            }
            Ok(_) => None,
            Err(StorageError::NotFound(_)) => None,
            Err(e) => {
                tracing::warn!(instance_id = %id, error = %e, "Failed to check instance of failed firing");
                None
            }
        }
    }

    async fn fire_trigger(
        &self,
        run: &mut TriggerRun,
        now: EpochMillis,
    ) -> Result<ActorRunResult, ProcessingError> {
        let mut trigger = self.jobs.get_job_trigger(run.trigger_id).await?;
        if trigger.is_done() {
            return Ok(ActorRunResult::Done);
        }
        trigger.last_execution_time = Some(now);
        trigger.execution_count = run.ctx.execution_count;

        let overlapping = !trigger.configuration.allow_overlap
            && self.jobs.count_undone_instances(trigger.id).await? > 0;
        if overlapping {
            tracing::debug!(trigger_id = %trigger.id, "Skipping firing, previous instances still running");
            self.jobs.on_job_trigger_success(&trigger).await?;
            self.events.emit(Event::trigger_skipped(trigger.id)).await;
            return self.next_firing(&trigger, run).await;
        }

        let processor = self.processors.trigger(&trigger.configuration.job)?;
        let ctx =
            TriggerProcessingContext::new(trigger.id, trigger.configuration.clone(), run.ctx);
        let mut ctx = isolate(&self.actors.executor(), async move {
            let mut ctx = ctx;
            let result = processor.process(&mut ctx).await;
            result.map(|()| ctx)
        })
        .await?;
        for request in ctx.take_emitted() {
            let instance = self.jobs.create_job_instance(request).await?;
            run.created.push(instance);
        }

        self.jobs.on_job_trigger_success(&trigger).await?;
        tracing::debug!(trigger_id = %trigger.id, instances = run.created.len(), "Trigger fired");
        self.events
            .emit(Event::trigger_succeeded(trigger.id, run.created.len()))
            .await;
        self.next_firing(&trigger, run).await
    }

    async fn record_trigger_error(
        &self,
        run: &mut TriggerRun,
        now: EpochMillis,
        error: String,
    ) -> Result<ActorRunResult, ProcessingError> {
        self.jobs
            .on_job_trigger_error(run.trigger_id, now, run.ctx.execution_count, &error)
            .await?;
        self.events
            .emit(Event::trigger_failed(run.trigger_id, error))
            .await;
        let trigger = self.jobs.get_job_trigger(run.trigger_id).await?;
        self.next_firing(&trigger, run).await
    }

    async fn next_firing(
        &self,
        trigger: &JobTrigger,
        run: &mut TriggerRun,
    ) -> Result<ActorRunResult, ProcessingError> {
        run.ctx.completed(now_millis());
        let next = trigger.schedule.next_epoch_schedule(&run.ctx);
        if trigger.is_done() || next == run.ctx.last_scheduled_execution_time {
            self.jobs.on_job_trigger_ended(trigger.id).await?;
            tracing::info!(trigger_id = %trigger.id, "Trigger ended");
            self.events.emit(Event::trigger_ended(trigger.id)).await;
            return Ok(ActorRunResult::Done);
        }
        run.due = next;
        Ok(ActorRunResult::RescheduleIn(delay_until(next, now_millis())))
    }

    async fn run_instance(&self, run: &mut InstanceRun) -> ActorRunResult {
        if self.is_stopped() {
            return ActorRunResult::Done;
        }
        let now = now_millis();
        let timeout = self.config.transaction_timeout();
        let outcome = run_in_transaction(
            self.transactions.as_ref(),
            timeout,
            Box::pin(self.process_instance(run, now)),
        )
        .await;
        let result = match outcome {
            TxOutcome::Completed(result) => result,
            TxOutcome::Failed(error) => {
                tracing::warn!(instance_id = %run.instance_id, error = %error, "Instance processing failed");
                let recorded = run_in_transaction(
                    self.transactions.as_ref(),
                    timeout,
                    Box::pin(self.record_instance_error(run.instance_id, error.to_string())),
                )
                .await;
                match recorded {
                    TxOutcome::Completed(result) => result,
                    TxOutcome::Failed(e) => {
                        tracing::warn!(instance_id = %run.instance_id, error = %e, "Failed to record instance error");
                        ActorRunResult::Done
                    }
                    TxOutcome::Unavailable(e) => {
                        tracing::warn!(instance_id = %run.instance_id, error = %e, "Transaction unavailable, retiring instance");
                        ActorRunResult::Done
                    }
                }
            }
            TxOutcome::Unavailable(error) => {
                tracing::warn!(instance_id = %run.instance_id, error = %error, "Transaction unavailable, retiring instance");
                ActorRunResult::Done
            }
        };

        if self.is_stopped() {
            return ActorRunResult::Done;
        }
        result
    }

    async fn process_instance(
        &self,
        run: &mut InstanceRun,
        now: EpochMillis,
    ) -> Result<ActorRunResult, ProcessingError> {
        let mut instance = self.jobs.get_job_instance(run.instance_id).await?;
        if !instance.work.is_new() {
            tracing::debug!(instance_id = %instance.id, state = ?instance.state(), "Instance already finished");
            return Ok(ActorRunResult::Done);
        }
        let id = instance.id;
        run.ctx.started(instance.work.schedule_time, now);
        run.started.get_or_insert_with(Instant::now);
        instance.work.last_execution_time = Some(now);
        let defer_count = instance.work.defer_count;

        let admission = instance
            .configuration
            .admission(&instance.configuration.execution_time_frames, to_datetime(now));
        let cursor = match admission {
            Admission::DeadlineReached => {
                instance.work.mark_deadline_reached();
                self.jobs.update_job_instance(&instance).await?;
                tracing::info!(instance_id = %id, "Instance deadline reached");
                self.events.emit(Event::instance_deadline_reached(id)).await;
                None
            }
            Admission::Run => {
                let processor = self.processors.instance(&instance.configuration.job)?;
                let mut ctx = JobProcessingContext::new(
                    id,
                    instance.trigger_id,
                    instance.configuration.parameters.clone(),
                    instance.last_processed.clone(),
                )
                .with_partition(self.node().partition());
                ctx.schedule = run.ctx;
                isolate(&self.actors.executor(), async move {
                    processor.process(&mut ctx).await
                })
                .await?
            }
            Admission::Defer(until) => {
                match instance.work.mark_deferred(until, &instance.configuration) {
                    Deferral::Deferred(at) => {
                        self.jobs.update_job_instance(&instance).await?;
                        tracing::debug!(instance_id = %id, until = at, defer_count = instance.work.defer_count, "Instance deferred");
                        self.events
                            .emit(Event::instance_deferred(id, at, instance.work.defer_count))
                            .await;
                    }
                    Deferral::Dropped => {
                        self.jobs.update_job_instance(&instance).await?;
                        tracing::info!(instance_id = %id, defer_count = instance.work.defer_count, "Instance dropped after too many deferrals");
                        self.events.emit(Event::instance_dropped(id)).await;
                    }
                }
                None
            }
            Admission::Drop => {
                instance.work.mark_dropped();
                self.jobs.update_job_instance(&instance).await?;
                tracing::info!(instance_id = %id, "Instance dropped, no execution window left");
                self.events.emit(Event::instance_dropped(id)).await;
                None
            }
        };
        run.ctx.completed(now_millis());

        if instance.work.is_new() && instance.work.defer_count == defer_count {
            instance.last_processed = cursor.clone();
            self.jobs.on_job_instance_chunk_success(&instance).await?;
            self.events
                .emit(Event::instance_chunk_succeeded(id, cursor.clone()))
                .await;
            if cursor.is_some() {
                return Ok(ActorRunResult::NOW);
            }

            instance.work.mark_done();
            self.jobs.on_job_instance_success(&instance).await?;
            let duration = run.started.map(|at| at.elapsed()).unwrap_or_default();
            tracing::info!(instance_id = %id, duration = ?duration, "Instance completed");
            self.events.emit(Event::instance_succeeded(id, duration)).await;
            return Ok(ActorRunResult::Done);
        }

        if !instance.work.is_new() {
            return Ok(ActorRunResult::Done);
        }
        let next = instance.work.schedule_time;
        if next == run.ctx.last_scheduled_execution_time {
            return Ok(ActorRunResult::Done);
        }
        Ok(ActorRunResult::RescheduleIn(delay_until(next, now_millis())))
    }

    async fn record_instance_error(
        &self,
        id: InstanceId,
        error: String,
    ) -> Result<ActorRunResult, ProcessingError> {
        self.jobs.on_job_instance_error(id, &error).await?;
        self.events.emit(Event::instance_failed(id, error)).await;
        Ok(ActorRunResult::Done)
    }
}

struct TriggerRun {
    trigger_id: TriggerId,
    ctx: ScheduleContext,
    due: EpochMillis,
    created: Vec<JobInstance>,
}

struct TriggerActor<M: JobManager + 'static> {
    scheduler: Weak<JobSchedulerInner<M>>,
    name: String,
    run: TriggerRun,
}

#[async_trait]
impl<M: JobManager + 'static> Actor for TriggerActor<M> {
    async fn work(&mut self) -> ActorRunResult {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return ActorRunResult::Done;
        };
        scheduler.run_trigger(&mut self.run).await
    }
}

impl<M: JobManager + 'static> Drop for TriggerActor<M> {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.dequeue(&self.name);
        }
    }
}

struct InstanceRun {
    instance_id: InstanceId,
    ctx: ScheduleContext,
    started: Option<Instant>,
}

struct InstanceActor<M: JobManager + 'static> {
    scheduler: Weak<JobSchedulerInner<M>>,
    name: String,
    run: InstanceRun,
}

#[async_trait]
impl<M: JobManager + 'static> Actor for InstanceActor<M> {
    async fn work(&mut self) -> ActorRunResult {
        let Some(scheduler) = self.scheduler.upgrade() else {
            return ActorRunResult::Done;
        };
        scheduler.run_instance(&mut self.run).await
    }
}

impl<M: JobManager + 'static> Drop for InstanceActor<M> {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.upgrade() {
            scheduler.dequeue(&self.name);
        }
    }
}

/// Run processor code on its own task so a panic fails the item instead of
/// unwinding the actor. The task is aborted if the caller goes away first.
async fn isolate<T, F>(executor: &Handle, work: F) -> Result<T, ProcessingError>
where
    F: Future<Output = Result<T, ProcessingError>> + Send + 'static,
    T: Send + 'static,
{
    let task = executor.spawn(work);
    let _abort = AbortOnDrop(task.abort_handle());
    task.await?
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}
