//! End-to-end workflow tests.
//!
//! Tests the complete flow: YAML file -> triggers in storage -> scheduler ->
//! trigger firings -> instances -> events.

use crate::common::WAIT;
use async_trait::async_trait;
use cadence::testing::{RecordingHandler, wait_until};
use cadence::{
    ActorContext, Event, EventBus, InMemoryJobManager, JobInstanceProcessor, JobInstanceState,
    JobManager, JobProcessingContext, JobProcessors, JobScheduler, ProcessingError,
    SpawnInstanceProcessor, TriggerConfigBuilder, TriggerId, YamlLoader,
};
use chrono::Utc;
use serde_json::Value;
use std::io::Write;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// Records the `batch` parameter of every chunk.
#[derive(Default)]
struct BatchRecorder {
    batches: Mutex<Vec<u32>>,
}

#[async_trait]
impl JobInstanceProcessor for BatchRecorder {
    async fn process(
        &self,
        ctx: &mut JobProcessingContext,
    ) -> Result<Option<Value>, ProcessingError> {
        let batch: u32 = ctx.parameter("batch")?;
        self.batches.lock().unwrap().push(batch);
        Ok(None)
    }
}

const CONFIG: &str = r#"
job:
  process_count: 10
shutdown_timeout_secs: 2
triggers:
  - id: 1
    job: import
    schedule:
      once: 2020-01-01T00:00:00Z
    parameters:
      batch: 50
  - id: 2
    job: import
    schedule:
      every: 1s
      limit: 2
    allow_overlap: false
    parameters:
      batch: 10
"#;

/// Test: Triggers loaded from YAML fire and their instances run with the configured parameters.
#[tokio::test]
async fn test_yaml_triggers_run_to_completion() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(CONFIG.as_bytes()).unwrap();
    let config = YamlLoader::load_config(file.path()).unwrap();
    assert_eq!(config.triggers.len(), 2);

    let jobs = Arc::new(InMemoryJobManager::new());
    let now = Utc::now();
    for trigger in &config.triggers {
        let id = TriggerId::new(trigger.id.unwrap());
        jobs.insert_trigger(TriggerConfigBuilder::build(trigger, id, now).unwrap())
            .unwrap();
    }

    let recorder = Arc::new(RecordingHandler::new());
    let events = Arc::new(EventBus::new());
    events.register(recorder.clone()).await;
    let processor = Arc::new(BatchRecorder::default());
    let context = ActorContext::single_node();
    let _scheduler = JobScheduler::builder(jobs.clone())
        .with_processors(
            JobProcessors::new()
                .with_trigger_processor("import", Arc::new(SpawnInstanceProcessor))
                .with_instance_processor("import", processor.clone()),
        )
        .with_event_bus(events)
        .with_config(config.job.clone())
        .start(&context)
        .await
        .unwrap();

    assert!(
        wait_until(WAIT, || {
            recorder.count(|e| matches!(e, Event::TriggerEnded { .. })) == 2
        })
        .await
    );
    assert!(
        wait_until(WAIT, || {
            recorder.count(|e| matches!(e, Event::InstanceSucceeded { .. })) == 3
        })
        .await
    );

    let mut batches = processor.batches.lock().unwrap().clone();
    batches.sort();
    assert_eq!(batches, vec![10, 10, 50]);

    let instances = jobs.instances().unwrap();
    assert_eq!(instances.len(), 3);
    assert!(instances
        .iter()
        .all(|instance| instance.state() == JobInstanceState::Done));
    for id in [1, 2] {
        let trigger = jobs.get_job_trigger(TriggerId::new(id)).await.unwrap();
        assert!(trigger.is_done());
        assert!(trigger.last_execution_time.is_some());
    }

    context.stop_timeout(config.shutdown_timeout()).await;
}

/// Test: Invalid or missing configuration files are rejected.
#[tokio::test]
async fn test_invalid_yaml_rejected() {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(b"job:\n  process_count: 0\n").unwrap();
    assert!(YamlLoader::load_config(file.path()).is_err());

    let missing = file.path().with_extension("missing");
    assert!(YamlLoader::load_config(&missing).is_err());
}
