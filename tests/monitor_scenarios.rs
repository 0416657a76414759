mod common;

use common::{stderr_reply, ScriptedQueue};
use jobsync_lib::core::{
    should_retrieve, JobMonitor, JobStatus, MonitorPolicy, QueueState, RunMode, RunOutcome,
};
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test]
async fn check_once_running_is_not_retrieved() {
    let queue = ScriptedQueue::new(vec![Ok("R".to_string())]);
    let monitor = JobMonitor::new(queue.clone());

    let status = monitor.check_once("4242").await.unwrap();
    assert_eq!(status, JobStatus::OnQueue(QueueState::Running));
    assert_eq!(should_retrieve(&status), Some(false));
    assert_eq!(
        queue.commands.lock().unwrap()[0],
        "squeue -h -o %t -j4242"
    );
}

#[tokio::test(start_paused = true)]
async fn pending_then_gone_is_off_queue_immediately() {
    let queue = ScriptedQueue::new(vec![Ok("PD".to_string()), Ok(String::new())]);
    let monitor = JobMonitor::new(queue.clone());

    let start = Instant::now();
    let status = monitor
        .watch("17", MonitorPolicy::from_secs(3600, 10))
        .await
        .unwrap();
    assert_eq!(status, JobStatus::OffQueue);
    assert_eq!(should_retrieve(&status), Some(true));
    assert_eq!(queue.polls(), 2);
    assert!(start.elapsed() < Duration::from_secs(3600));
}

#[tokio::test(start_paused = true)]
async fn unit_policy_polls_exactly_once() {
    let queue = ScriptedQueue::new(vec![Ok(String::new()), Ok(String::new())]);
    let monitor = JobMonitor::new(queue.clone());

    let start = Instant::now();
    let outcome = monitor
        .watch_outcome("1", MonitorPolicy::from_secs(1, 1))
        .await
        .unwrap();
    assert_eq!(queue.polls(), 1);
    assert!(start.elapsed() <= Duration::from_secs(1));
    assert_eq!(outcome.status, JobStatus::NotSeen);
    assert!(outcome.budget_exhausted);
    assert_eq!(should_retrieve(&outcome.status), None);
}

#[tokio::test(start_paused = true)]
async fn unknown_output_keeps_polling() {
    let queue = ScriptedQueue::new(vec![
        Ok("slurm_load_jobs: socket timed out".to_string()),
        stderr_reply("squeue: error: communication failure"),
        Ok("CG".to_string()),
        stderr_reply("slurm_load_jobs error: Invalid job id specified"),
    ]);
    let monitor = JobMonitor::new(queue.clone());

    let outcome = monitor
        .watch_outcome("88", MonitorPolicy::from_secs(60, 5))
        .await
        .unwrap();
    assert_eq!(outcome.polls, 4);
    assert_eq!(outcome.status, JobStatus::OffQueue);
    assert!(!outcome.budget_exhausted);
}

#[tokio::test]
async fn direct_run_returns_output() {
    let queue = ScriptedQueue::new(vec![Ok("hello".to_string())]);
    let monitor = JobMonitor::new(queue.clone());

    let outcome = monitor
        .run(&["./solver --in x".to_string()], RunMode::Direct)
        .await
        .unwrap();
    assert_eq!(
        outcome,
        RunOutcome::Completed {
            stdout: "hello".to_string()
        }
    );
}
