//! Prometheus metrics
//!
//! Recording goes through the `metrics` facade; nothing is recorded until
//! [`install`] registers the Prometheus recorder, so tests and tools that
//! skip it pay nothing. The handle it returns renders `/metrics`.

use std::time::Duration;

use anyhow::{Context, Result};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

pub const RUN_COUNT: &str = "ca_run_count";
pub const RUN_ELAPSED: &str = "ca_run_elapsed";

pub const WORKERS_TOTAL: &str = "workerpool_workers_total";
pub const WORKERS_BUSY: &str = "workerpool_workers_busy";
pub const QUEUE_SIZE: &str = "workerpool_queue_size";
pub const QUEUE_CAPACITY: &str = "workerpool_queue_capacity";
pub const TASKS_SUBMITTED: &str = "workerpool_tasks_submitted_total";
pub const TASKS_COMPLETED: &str = "workerpool_tasks_completed_total";
pub const TASKS_FAILED: &str = "workerpool_tasks_failed_total";
pub const TASKS_REJECTED: &str = "workerpool_tasks_rejected_total";
pub const TASKS_CANCELED: &str = "workerpool_tasks_timeout_total";
pub const QUEUE_WAIT: &str = "workerpool_queue_wait_seconds";
pub const TASK_DURATION: &str = "workerpool_task_duration_seconds";

const RUN_ELAPSED_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0];
const QUEUE_WAIT_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];
const TASK_DURATION_BUCKETS: &[f64] = &[0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0];

fn builder() -> std::result::Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(RUN_ELAPSED.into()), RUN_ELAPSED_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full(QUEUE_WAIT.into()), QUEUE_WAIT_BUCKETS)?
        .set_buckets_for_metric(Matcher::Full(TASK_DURATION.into()), TASK_DURATION_BUCKETS)
}

/// Install the global Prometheus recorder.
pub fn install() -> Result<PrometheusHandle> {
    let handle = builder()
        .context("Invalid histogram buckets")?
        .install_recorder()
        .context("Failed to install metrics recorder")?;
    describe();
    Ok(handle)
}

/// A handle whose recorder was never installed; renders nothing.
pub fn detached() -> PrometheusHandle {
    PrometheusBuilder::new().build_recorder().handle()
}

fn describe() {
    describe_counter!(RUN_COUNT, "The number of code executions started by a request");
    describe_histogram!(RUN_ELAPSED, "The time a run execution request took to complete");

    describe_gauge!(WORKERS_TOTAL, "Total number of workers in the pool");
    describe_gauge!(WORKERS_BUSY, "Number of workers currently executing tasks");
    describe_gauge!(QUEUE_SIZE, "Current number of tasks waiting in queue");
    describe_gauge!(QUEUE_CAPACITY, "Maximum capacity of the task queue");
    describe_counter!(TASKS_SUBMITTED, "Total number of tasks submitted to the pool");
    describe_counter!(TASKS_COMPLETED, "Total number of tasks completed successfully");
    describe_counter!(TASKS_FAILED, "Total number of tasks that failed with error");
    describe_counter!(TASKS_REJECTED, "Total number of tasks rejected due to full queue");
    describe_counter!(TASKS_CANCELED, "Total number of tasks dropped because they were canceled");
    describe_histogram!(QUEUE_WAIT, "Time tasks spend waiting in queue before execution");
    describe_histogram!(TASK_DURATION, "Duration of task execution");
}

pub fn pool_started(workers: usize, capacity: usize) {
    gauge!(WORKERS_TOTAL).set(workers as f64);
    gauge!(QUEUE_CAPACITY).set(capacity as f64);
}

pub fn task_submitted(queued: usize) {
    counter!(TASKS_SUBMITTED).increment(1);
    gauge!(QUEUE_SIZE).set(queued as f64);
}

pub fn task_rejected() {
    counter!(TASKS_REJECTED).increment(1);
}

pub fn task_canceled() {
    counter!(TASKS_CANCELED).increment(1);
}

pub fn task_dequeued(queued: usize, waited: Duration) {
    gauge!(QUEUE_SIZE).set(queued as f64);
    histogram!(QUEUE_WAIT).record(waited.as_secs_f64());
}

pub fn workers_busy(busy: usize) {
    gauge!(WORKERS_BUSY).set(busy as f64);
}

/// `ran` is the executor's wall time, `None` when there was nothing to run.
pub fn task_finished(ran: Option<Duration>, success: bool) {
    if let Some(ran) = ran {
        histogram!(TASK_DURATION).record(ran.as_secs_f64());
    }
    if success {
        counter!(TASKS_COMPLETED).increment(1);
    } else {
        counter!(TASKS_FAILED).increment(1);
    }
}

pub fn run_finished(project_uuid: &str, code_id: &str, elapsed: Duration) {
    let labels = [
        ("project_uuid", project_uuid.to_string()),
        ("code_id", code_id.to_string()),
    ];
    counter!(RUN_COUNT, &labels).increment(1);
    histogram!(RUN_ELAPSED, &labels).record(elapsed.as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn render(record: impl FnOnce()) -> String {
        let recorder = builder().unwrap().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || {
            describe();
            record();
        });
        handle.render()
    }

    #[test]
    fn test_pool_metrics() {
        let text = render(|| {
            pool_started(2, 4);
            task_submitted(1);
            task_rejected();
            task_dequeued(0, Duration::from_millis(3));
            workers_busy(1);
            task_finished(Some(Duration::from_millis(20)), true);
            task_finished(None, false);
            task_canceled();
        });

        assert!(text.contains("# HELP workerpool_workers_total"));
        assert!(text.contains("workerpool_workers_total 2"));
        assert!(text.contains("workerpool_queue_capacity 4"));
        assert!(text.contains("workerpool_queue_size 0"));
        assert!(text.contains("workerpool_workers_busy 1"));
        assert!(text.contains("workerpool_tasks_submitted_total 1"));
        assert!(text.contains("workerpool_tasks_rejected_total 1"));
        assert!(text.contains("workerpool_tasks_completed_total 1"));
        assert!(text.contains("workerpool_tasks_failed_total 1"));
        assert!(text.contains("workerpool_tasks_timeout_total 1"));
        assert!(text.contains("workerpool_queue_wait_seconds_bucket"));
        assert!(text.contains("workerpool_task_duration_seconds_count 1"));
    }

    #[test]
    fn test_run_metrics_are_labelled() {
        let text = render(|| {
            run_finished("project-1", "code-1", Duration::from_millis(25));
            run_finished("project-1", "code-1", Duration::from_millis(40));
        });

        let count = text
            .lines()
            .find(|l| l.starts_with("ca_run_count{"))
            .unwrap();
        assert!(count.contains(r#"project_uuid="project-1""#));
        assert!(count.contains(r#"code_id="code-1""#));
        assert!(count.ends_with(" 2"));
        assert!(text.contains("ca_run_elapsed_bucket{"));
    }

    #[test]
    fn test_detached_handle_renders_nothing() {
        pool_started(1, 1);
        assert!(!detached().render().contains(WORKERS_TOTAL));
    }
}
