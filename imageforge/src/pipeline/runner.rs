//! Sequential step runner with a compensation stack.

use crate::context::StepState;
use crate::errors::ProvisionError;
use crate::step::{halt_on_error, Step};
use crate::steps::{DefineDomainStep, PrepareVolumesStep};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{info, warn};

const MIN_COMPENSATION_TIMEOUT: Duration = Duration::from_millis(10);

/// Final status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    /// Every step continued.
    Completed,
    /// A step halted.
    Halted,
    /// The run was cancelled.
    Cancelled,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::Halted => write!(f, "halted"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineOutcome {
    /// Pipeline name.
    pub pipeline: String,
    /// Final status.
    pub status: PipelineStatus,
    /// Steps whose forward operation started, in order.
    pub steps_run: Vec<String>,
    /// Message recorded by the halt protocol.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Compensations that panicked or timed out, as (step, reason).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub compensation_failures: Vec<(String, String)>,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the last compensation finished.
    pub ended_at: DateTime<Utc>,
}

impl PipelineOutcome {
    /// Returns true if every step continued.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status == PipelineStatus::Completed
    }

    /// Returns the duration in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> i64 {
        (self.ended_at - self.started_at).num_milliseconds()
    }
}

/// An ordered list of steps run as a saga.
///
/// Forward operations run in registration order until one halts. Every step
/// whose forward operation started is then compensated in reverse order,
/// including the step that halted. After a successful run the same unwinding
/// acts as teardown.
#[derive(Debug, Clone)]
pub struct StepPipeline {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    cleanup_timeout: Option<Duration>,
}

impl StepPipeline {
    /// Creates an empty pipeline.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            cleanup_timeout: None,
        }
    }

    /// Creates the standard provisioning pipeline: volumes, then the domain.
    #[must_use]
    pub fn provisioning() -> Self {
        Self::new("provision")
            .step(PrepareVolumesStep::new())
            .step(DefineDomainStep::new())
    }

    /// Appends a step.
    #[must_use]
    pub fn step(mut self, step: impl Step + 'static) -> Self {
        self.steps.push(Arc::new(step));
        self
    }

    /// Appends a shared step.
    pub fn add_step(&mut self, step: Arc<dyn Step>) {
        self.steps.push(step);
    }

    /// Overrides the total compensation timeout from the configuration.
    #[must_use]
    pub fn with_cleanup_timeout(mut self, timeout: Duration) -> Self {
        self.cleanup_timeout = Some(timeout);
        self
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the step names in order.
    #[must_use]
    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    /// Returns the number of steps.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if no steps are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Runs the pipeline to completion, including compensations.
    pub async fn run(&self, state: &mut StepState) -> PipelineOutcome {
        let started_at = Utc::now();
        let mut compensations: Vec<Arc<dyn Step>> = Vec::with_capacity(self.steps.len());
        let mut steps_run = Vec::new();
        let mut status = PipelineStatus::Completed;

        info!(pipeline = %self.name, run_id = %state.run_id, steps = self.steps.len(), "pipeline started");

        for step in &self.steps {
            if let Err(err) = state.cancel.check(step.name()) {
                halt_on_error(state, err, format!("Pipeline[{}]", self.name));
                status = PipelineStatus::Cancelled;
                break;
            }

            info!(pipeline = %self.name, step = step.name(), "running step");
            compensations.push(Arc::clone(step));
            steps_run.push(step.name().to_string());

            if step.run(state).await.is_halt() {
                status = if matches!(
                    state.error.as_ref().map(|e| &e.cause),
                    Some(ProvisionError::Cancelled(_))
                ) {
                    PipelineStatus::Cancelled
                } else {
                    PipelineStatus::Halted
                };
                warn!(pipeline = %self.name, step = step.name(), %status, "step halted");
                break;
            }
        }

        // Catches a cancellation that arrived during the last step.
        if status == PipelineStatus::Completed {
            if let Err(err) = state.cancel.check("Teardown") {
                halt_on_error(state, err, format!("Pipeline[{}]", self.name));
                status = PipelineStatus::Cancelled;
            }
        }

        let compensation_failures = self.unwind(state, compensations).await;

        let outcome = PipelineOutcome {
            pipeline: self.name.clone(),
            status,
            steps_run,
            error: state.error_message().map(String::from),
            compensation_failures,
            started_at,
            ended_at: Utc::now(),
        };

        info!(
            pipeline = %self.name,
            run_id = %state.run_id,
            status = %outcome.status,
            duration_ms = outcome.duration_ms(),
            "pipeline finished"
        );

        outcome
    }

    /// Pops and runs compensations in LIFO order.
    ///
    /// Each compensation gets an equal share of the total timeout. A panic or
    /// timeout is recorded and the next compensation still runs.
    async fn unwind(
        &self,
        state: &mut StepState,
        mut compensations: Vec<Arc<dyn Step>>,
    ) -> Vec<(String, String)> {
        if compensations.is_empty() {
            return Vec::new();
        }

        let total = self
            .cleanup_timeout
            .unwrap_or_else(|| state.config.cleanup_timeout());
        let steps = u32::try_from(compensations.len()).unwrap_or(u32::MAX);
        let per_step = (total / steps).max(MIN_COMPENSATION_TIMEOUT);

        let mut failures = Vec::new();

        while let Some(step) = compensations.pop() {
            let name = step.name().to_string();
            let result = timeout(per_step, AssertUnwindSafe(step.cleanup(state)).catch_unwind()).await;

            match result {
                Ok(Ok(())) => {}
                Ok(Err(panic)) => {
                    let msg = format!("Cleanup panicked: {}", panic_message(panic.as_ref()));
                    warn!(step = %name, "{}", msg);
                    failures.push((name, msg));
                }
                Err(_) => {
                    let msg = "Cleanup timed out".to_string();
                    warn!(step = %name, "{}", msg);
                    failures.push((name, msg));
                }
            }
        }

        failures
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{BuilderConfig, VolumeConfig, VolumeSource};
    use crate::descriptor::DomainInterface;
    use crate::errors::DriverError;
    use crate::step::StepAction;
    use crate::testing::test_state;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Behaviour {
        Continue,
        Halt,
        PanicOnCleanup,
        SlowCleanup,
        CancelDuringRun,
    }

    #[derive(Debug)]
    struct RecordingStep {
        name: String,
        behaviour: Behaviour,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingStep {
        fn new(name: &str, behaviour: Behaviour, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                behaviour,
                log: Arc::clone(log),
            }
        }
    }

    #[async_trait]
    impl Step for RecordingStep {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(&self, state: &mut StepState) -> StepAction {
            self.log.lock().push(format!("run:{}", self.name));
            match self.behaviour {
                Behaviour::Halt => {
                    return halt_on_error(state, ProvisionError::marshal("boom"), &self.name);
                }
                Behaviour::CancelDuringRun => state.cancel.cancel("signal"),
                _ => {}
            }
            StepAction::Continue
        }

        async fn cleanup(&self, _state: &mut StepState) {
            match self.behaviour {
                Behaviour::PanicOnCleanup => panic!("cleanup exploded"),
                Behaviour::SlowCleanup => tokio::time::sleep(Duration::from_secs(5)).await,
                _ => {}
            }
            self.log.lock().push(format!("cleanup:{}", self.name));
        }
    }

    #[tokio::test]
    async fn test_success_tears_down_in_reverse() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = StepPipeline::new("test")
            .step(RecordingStep::new("a", Behaviour::Continue, &log))
            .step(RecordingStep::new("b", Behaviour::Continue, &log))
            .step(RecordingStep::new("c", Behaviour::Continue, &log));
        let (mut state, _ui, _driver) = test_state(BuilderConfig::new());

        let outcome = pipeline.run(&mut state).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.steps_run, vec!["a", "b", "c"]);
        assert_eq!(
            *log.lock(),
            vec!["run:a", "run:b", "run:c", "cleanup:c", "cleanup:b", "cleanup:a"]
        );
    }

    #[tokio::test]
    async fn test_halt_stops_forward_and_compensates_halted_step() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = StepPipeline::new("test")
            .step(RecordingStep::new("a", Behaviour::Continue, &log))
            .step(RecordingStep::new("b", Behaviour::Halt, &log))
            .step(RecordingStep::new("c", Behaviour::Continue, &log));
        let (mut state, ui, _driver) = test_state(BuilderConfig::new());

        let outcome = pipeline.run(&mut state).await;

        assert_eq!(outcome.status, PipelineStatus::Halted);
        assert_eq!(outcome.error.as_deref(), Some("b: marshal error: boom"));
        assert_eq!(*log.lock(), vec!["run:a", "run:b", "cleanup:b", "cleanup:a"]);
        assert_eq!(ui.errors(), vec!["b: marshal error: boom".to_string()]);
    }

    #[tokio::test]
    async fn test_panicking_compensation_does_not_block_others() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = StepPipeline::new("test")
            .step(RecordingStep::new("a", Behaviour::Continue, &log))
            .step(RecordingStep::new("b", Behaviour::PanicOnCleanup, &log))
            .step(RecordingStep::new("c", Behaviour::Continue, &log));
        let (mut state, _ui, _driver) = test_state(BuilderConfig::new());

        let outcome = pipeline.run(&mut state).await;

        assert!(outcome.is_success());
        assert_eq!(outcome.compensation_failures.len(), 1);
        assert_eq!(outcome.compensation_failures[0].0, "b");
        assert!(outcome.compensation_failures[0].1.contains("cleanup exploded"));
        assert_eq!(
            *log.lock(),
            vec!["run:a", "run:b", "run:c", "cleanup:c", "cleanup:a"]
        );
    }

    #[tokio::test]
    async fn test_slow_compensation_times_out() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = StepPipeline::new("test")
            .step(RecordingStep::new("a", Behaviour::Continue, &log))
            .step(RecordingStep::new("slow", Behaviour::SlowCleanup, &log))
            .with_cleanup_timeout(Duration::from_millis(100));
        let (mut state, _ui, _driver) = test_state(BuilderConfig::new());

        let outcome = pipeline.run(&mut state).await;

        assert_eq!(
            outcome.compensation_failures,
            vec![("slow".to_string(), "Cleanup timed out".to_string())]
        );
        assert_eq!(*log.lock(), vec!["run:a", "run:slow", "cleanup:a"]);
    }

    #[tokio::test]
    async fn test_cancellation_between_steps() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = StepPipeline::new("test")
            .step(RecordingStep::new("a", Behaviour::Continue, &log))
            .step(RecordingStep::new("b", Behaviour::Continue, &log));
        let (mut state, ui, _driver) = test_state(BuilderConfig::new());
        state.cancel.cancel("ctrl-c");

        let outcome = pipeline.run(&mut state).await;

        assert_eq!(outcome.status, PipelineStatus::Cancelled);
        assert!(outcome.steps_run.is_empty());
        assert!(log.lock().is_empty());
        assert_eq!(ui.errors().len(), 1);
        assert!(outcome.error.unwrap().contains("ctrl-c"));
    }

    #[tokio::test]
    async fn test_cancellation_during_last_step_is_not_success() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = StepPipeline::new("test")
            .step(RecordingStep::new("a", Behaviour::Continue, &log))
            .step(RecordingStep::new("b", Behaviour::CancelDuringRun, &log));
        let (mut state, ui, _driver) = test_state(BuilderConfig::new());

        let outcome = pipeline.run(&mut state).await;

        assert_eq!(outcome.status, PipelineStatus::Cancelled);
        assert!(!outcome.is_success());
        assert_eq!(
            outcome.error.as_deref(),
            Some("Pipeline[test]: cancelled: Teardown: signal")
        );
        assert_eq!(ui.errors().len(), 1);
        assert_eq!(*log.lock(), vec!["run:a", "run:b", "cleanup:b", "cleanup:a"]);
    }

    #[tokio::test]
    async fn test_cancelled_provisioning_removes_artifacts() {
        let config = BuilderConfig::new().with_volume(
            VolumeConfig::new("root.qcow2")
                .with_capacity_bytes(1 << 30)
                .as_artifact(),
        );
        let (mut state, _ui, driver) = test_state(config);
        driver.add_pool("default");
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipeline = StepPipeline::new("provision")
            .step(PrepareVolumesStep::new())
            .step(RecordingStep::new("signal", Behaviour::CancelDuringRun, &log))
            .step(DefineDomainStep::new());

        let outcome = pipeline.run(&mut state).await;

        assert_eq!(outcome.status, PipelineStatus::Cancelled);
        assert_eq!(driver.calls("define_domain"), 0);
        assert!(driver.volume_names("default").is_empty());
        assert!(state.volumes.is_empty());
    }

    #[tokio::test]
    async fn test_timed_out_compensations_leave_state_consistent() {
        let config = BuilderConfig::new()
            .with_volume(VolumeConfig::new("a.qcow2").with_capacity_bytes(1))
            .with_volume(VolumeConfig::new("b.qcow2").with_capacity_bytes(1).with_target_dev("vdb"))
            .with_cleanup_timeout(0.2);
        let (mut state, _ui, driver) = test_state(config);
        driver.add_pool("default");
        driver.delay("undefine_domain", Duration::from_secs(5));
        driver.delay("delete_volume", Duration::from_secs(5));

        let outcome = StepPipeline::provisioning().run(&mut state).await;

        let failed: Vec<&str> = outcome
            .compensation_failures
            .iter()
            .map(|(step, _)| step.as_str())
            .collect();
        assert_eq!(failed, vec!["define_domain", "prepare_volumes"]);
        assert!(state.domain.is_none());
        let recorded: Vec<String> = state.volumes.iter().map(|v| v.handle.name.clone()).collect();
        assert_eq!(recorded, driver.volume_names("default"));
    }

    #[tokio::test]
    async fn test_huge_cleanup_timeout_does_not_panic() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let config = BuilderConfig::from_json_str(r#"{"cleanup_timeout_seconds": 1e20}"#).unwrap();
        let (mut state, _ui, _driver) = test_state(config);

        let outcome = StepPipeline::new("test")
            .step(RecordingStep::new("a", Behaviour::Continue, &log))
            .run(&mut state)
            .await;
        assert!(outcome.is_success());

        let outcome = StepPipeline::new("test")
            .step(RecordingStep::new("a", Behaviour::Continue, &log))
            .step(RecordingStep::new("b", Behaviour::Continue, &log))
            .with_cleanup_timeout(Duration::MAX)
            .run(&mut state)
            .await;
        assert!(outcome.compensation_failures.is_empty());
    }

    #[tokio::test]
    async fn test_provisioning_success_keeps_artifacts_only() {
        let config = BuilderConfig::new()
            .with_communicator_interface("ua-communicator")
            .with_volume(
                VolumeConfig::new("root.qcow2")
                    .with_capacity_bytes(1 << 30)
                    .with_source(VolumeSource::BackingStore {
                        path: "/images/base.qcow2".to_string(),
                        format: None,
                    })
                    .as_artifact(),
            );
        let (mut state, _ui, driver) = test_state(config);
        driver.add_pool("default");
        state.domain_def = state
            .domain_def
            .clone()
            .with_interface(DomainInterface::network("default").with_alias("ua-communicator"));

        let pipeline = StepPipeline::provisioning();
        assert_eq!(pipeline.step_names(), vec!["prepare_volumes", "define_domain"]);

        let outcome = pipeline.run(&mut state).await;

        assert!(outcome.is_success(), "{:?}", outcome.error);
        assert!(state.communicator_address_helper.is_some());
        assert!(state.domain.is_none());
        assert!(driver.domain_names().is_empty());
        assert_eq!(driver.volume_names("default"), vec!["root.qcow2".to_string()]);
    }

    #[tokio::test]
    async fn test_provisioning_define_failure_rolls_back_volumes() {
        let config = BuilderConfig::new().with_volume(
            VolumeConfig::new("root.qcow2")
                .with_capacity_bytes(1 << 30)
                .as_artifact(),
        );
        let (mut state, ui, driver) = test_state(config);
        driver.add_pool("default");
        driver.fail_after("define_domain", 0, DriverError::rpc(27, "XML error"));

        let outcome = StepPipeline::provisioning().run(&mut state).await;

        assert_eq!(outcome.status, PipelineStatus::Halted);
        assert_eq!(outcome.steps_run, vec!["prepare_volumes", "define_domain"]);
        assert!(outcome.error.unwrap().starts_with("DefineDomain.RPC"));
        assert!(driver.volume_names("default").is_empty());
        assert_eq!(driver.calls("undefine_domain"), 0);
        assert_eq!(ui.errors().len(), 1);
    }

    #[test]
    fn test_outcome_serializes() {
        let outcome = PipelineOutcome {
            pipeline: "provision".to_string(),
            status: PipelineStatus::Halted,
            steps_run: vec!["define_domain".to_string()],
            error: Some("DefineDomain.RPC: failed".to_string()),
            compensation_failures: Vec::new(),
            started_at: Utc::now(),
            ended_at: Utc::now(),
        };

        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "halted");
        assert!(json.get("compensation_failures").is_none());
    }
}
