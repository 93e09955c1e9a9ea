//! cadence - cluster-aware job and notification scheduler.
//!
//! Usage:
//!   cadence run <config>       Run the configured triggers until Ctrl+C
//!   cadence validate <config>  Validate a configuration without running
//!   cadence list <config>      List the configured triggers and their next firing

use cadence::{
    ActorContext, EventBus, EventHandler, InMemoryJobManager, InMemoryNotificationManager,
    JobInstanceProcessor, JobProcessingContext, JobProcessors, JobSchedule, JobScheduler,
    NotificationChannels, NotificationError, NotificationProcessor, NotificationScheduler,
    ProcessingError, ScheduleContext, SchedulerConfig, SpawnInstanceProcessor, TriggerConfig,
    TriggerConfigBuilder, TriggerId, YamlLoader,
};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::collections::{BTreeSet, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// cadence - cluster-aware job and notification scheduler
#[derive(Parser)]
#[command(name = "cadence")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the configured triggers with in-memory storage
    Run {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// Validate a configuration without running
    Validate {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },

    /// List the configured triggers
    List {
        /// Path to the YAML configuration file
        #[arg(value_name = "CONFIG")]
        config: PathBuf,
    },
}

/// Logs scheduler events.
struct LoggingHandler;

#[async_trait::async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &cadence::Event) {
        use cadence::Event;
        match event {
            Event::TriggerSucceeded {
                trigger_id,
                instances_created,
                ..
            } => {
                info!(
                    "Trigger {} fired, {} instance(s) created",
                    trigger_id, instances_created
                );
            }
            Event::TriggerFailed {
                trigger_id, error, ..
            } => {
                warn!("Trigger {} failed: {}", trigger_id, error);
            }
            Event::TriggerEnded { trigger_id, .. } => {
                info!("Trigger {} ended", trigger_id);
            }
            Event::InstanceSucceeded {
                instance_id,
                duration,
                ..
            } => {
                info!("  Instance {} completed in {:?}", instance_id, duration);
            }
            Event::InstanceFailed {
                instance_id, error, ..
            } => {
                error!("  Instance {} failed: {}", instance_id, error);
            }
            Event::InstanceDeferred {
                instance_id,
                until,
                ..
            } => {
                info!("  Instance {} deferred until {}", instance_id, until);
            }
            Event::InstanceDropped { instance_id, .. } => {
                warn!("  Instance {} dropped", instance_id);
            }
            Event::InstanceDeadlineReached { instance_id, .. } => {
                warn!("  Instance {} missed its deadline", instance_id);
            }
            _ => {}
        }
    }
}

/// Instance processor that logs the job parameters and finishes in one chunk.
struct LoggingProcessor;

#[async_trait::async_trait]
impl JobInstanceProcessor for LoggingProcessor {
    async fn process(
        &self,
        ctx: &mut JobProcessingContext,
    ) -> Result<Option<Value>, ProcessingError> {
        info!(
            instance_id = %ctx.instance_id,
            partition = ctx.partition_id,
            "Running instance with parameters {}",
            json!(ctx.parameters())
        );
        Ok(None)
    }
}

/// Channel that writes notifications to the log.
struct LoggingChannel;

#[async_trait::async_trait]
impl NotificationProcessor for LoggingChannel {
    async fn send(
        &self,
        notification: &cadence::Notification,
    ) -> Result<Value, NotificationError> {
        info!(
            notification_id = %notification.id,
            recipient = %notification.recipient,
            "Notification: {}",
            notification.payload
        );
        Ok(json!({ "logged": true }))
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { config } => {
            run_scheduler(config).await?;
        }
        Commands::Validate { config } => {
            validate_config(config)?;
        }
        Commands::List { config } => {
            list_triggers(config)?;
        }
    }

    Ok(())
}

/// Give every trigger an id: configured ids are kept, the rest are numbered after them.
fn assign_ids(triggers: &[TriggerConfig]) -> Vec<TriggerId> {
    let taken: HashSet<u64> = triggers.iter().filter_map(|t| t.id).collect();
    let mut next = taken.iter().max().map_or(1, |max| max + 1);
    triggers
        .iter()
        .map(|trigger| match trigger.id {
            Some(id) => TriggerId::new(id),
            None => {
                let id = TriggerId::new(next);
                next += 1;
                id
            }
        })
        .collect()
}

/// Run the configured triggers until Ctrl+C.
async fn run_scheduler(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading configuration from: {}", path.display());
    let config: SchedulerConfig = YamlLoader::load_config(&path)?;

    if config.triggers.is_empty() {
        warn!("No triggers configured in {}", path.display());
    }

    let jobs = Arc::new(InMemoryJobManager::new());
    let now = Utc::now();
    let mut job_names = BTreeSet::new();
    for (trigger_config, id) in config.triggers.iter().zip(assign_ids(&config.triggers)) {
        let trigger = TriggerConfigBuilder::build(trigger_config, id, now)?;
        info!("  - trigger {} runs job '{}'", id, trigger_config.job);
        job_names.insert(trigger_config.job.clone());
        jobs.insert_trigger(trigger)?;
    }

    let mut processors = JobProcessors::new();
    for job in &job_names {
        processors = processors
            .with_trigger_processor(job.as_str(), Arc::new(SpawnInstanceProcessor))
            .with_instance_processor(job.as_str(), Arc::new(LoggingProcessor));
    }

    // Create event bus with logging handler
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(LoggingHandler)).await;

    let context = ActorContext::single_node();
    let job_scheduler = JobScheduler::builder(jobs)
        .with_processors(processors)
        .with_event_bus(Arc::clone(&event_bus))
        .with_config(config.job.clone())
        .start(&context)
        .await?;
    let _notification_scheduler =
        NotificationScheduler::builder(Arc::new(InMemoryNotificationManager::new()))
            .with_channels(NotificationChannels::new().with_channel("log", Arc::new(LoggingChannel)))
            .with_event_bus(event_bus)
            .with_config(config.notification.clone())
            .start(&context)
            .await?;

    info!(
        "Scheduler started with {} actor(s)",
        job_scheduler.actor_names().len()
    );
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down (timeout: {:?})...", config.shutdown_timeout());
    context.stop_timeout(config.shutdown_timeout()).await;

    info!("Goodbye!");
    Ok(())
}

/// Validate a configuration without running.
fn validate_config(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating configuration: {}", path.display());

    let config = match YamlLoader::load_config(&path) {
        Ok(config) => config,
        Err(e) => {
            error!("Validation failed: {}", e);
            return Err(e.into());
        }
    };

    let now = Utc::now();
    for (trigger_config, id) in config.triggers.iter().zip(assign_ids(&config.triggers)) {
        if let Err(e) = TriggerConfigBuilder::build(trigger_config, id, now) {
            error!("Validation failed: {}", e);
            return Err(e.into());
        }
    }
    info!("Configuration is valid: {} trigger(s)", config.triggers.len());
    Ok(())
}

/// List the configured triggers with their next firing.
fn list_triggers(path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = YamlLoader::load_config(&path)?;

    if config.triggers.is_empty() {
        println!("No triggers in {}", path.display());
        return Ok(());
    }

    println!("Triggers in {}:", path.display());
    println!();

    let now = Utc::now();
    for (trigger_config, id) in config.triggers.iter().zip(assign_ids(&config.triggers)) {
        let trigger = TriggerConfigBuilder::build(trigger_config, id, now)?;
        let next = trigger.schedule.next_epoch_schedule(&ScheduleContext::new());
        println!("ID: {}", id);
        println!("  Job: {}", trigger_config.job);
        println!("  Next firing: {}", cadence::core::types::to_datetime(next));
        println!("  Overlap allowed: {}", trigger_config.allow_overlap);
        if let Some(deadline) = trigger_config.deadline {
            println!("  Deadline: {}", deadline);
        }
        if !trigger_config.execution_time_frames.is_empty() {
            println!(
                "  Time frames: {}",
                trigger_config.execution_time_frames.iter().count()
            );
        }
        println!();
    }

    Ok(())
}
