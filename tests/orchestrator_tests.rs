//! Run orchestration against a scripted cluster: every exit path must record
//! a terminal log and delete the job exactly once.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use healthcheckd::backend::job::{JobSpec, JOB_NAME_PREFIX};
use healthcheckd::backend::{ClusterApi, ClusterBackend, ClusterError, JobSettings, JobStatus};
use healthcheckd::model::{NewHealthCheck, RunStatus};
use healthcheckd::service::{HealthCheckService, ServiceError};
use healthcheckd::storage::{HealthCheckStore, MemoryStore, SqliteStore};
use tokio_util::sync::CancellationToken;

#[derive(Default)]
enum DeleteBehaviour {
    #[default]
    Ok,
    NotFound,
    Error,
}

#[derive(Default)]
struct FakeCluster {
    succeed_after: Option<u32>,
    fail_after: Option<u32>,
    submit_error: bool,
    status_error: bool,
    panic_on_status: bool,
    no_pods: bool,
    log_error: bool,
    delete: DeleteBehaviour,
    /// Store and check id to snapshot on every status poll.
    watch: Option<(Arc<dyn HealthCheckStore>, String)>,

    polls: AtomicU32,
    submitted: Mutex<Vec<JobSpec>>,
    deleted: Mutex<Vec<String>>,
    seen_mid_run: Mutex<Vec<(RunStatus, Option<String>)>>,
}

impl FakeCluster {
    fn deletes(&self) -> usize {
        self.deleted.lock().unwrap().len()
    }

    fn submits(&self) -> usize {
        self.submitted.lock().unwrap().len()
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn submit_job(&self, spec: &JobSpec) -> Result<(), ClusterError> {
        self.submitted.lock().unwrap().push(spec.clone());
        if self.submit_error {
            return Err(ClusterError::Api {
                status: 403,
                message: "jobs.batch is forbidden".into(),
            });
        }
        Ok(())
    }

    async fn job_status(&self, _name: &str) -> Result<JobStatus, ClusterError> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some((store, id)) = &self.watch {
            let check = store.load(id).await.unwrap().unwrap();
            let last = check.execution_logs.last().unwrap();
            let snapshot = (last.status, last.output.clone());
            self.seen_mid_run.lock().unwrap().push(snapshot);
        }

        if self.panic_on_status {
            panic!("status decoder exploded");
        }
        if self.status_error {
            return Err(ClusterError::Api {
                status: 500,
                message: "etcdserver: request timed out".into(),
            });
        }
        let mut status = JobStatus::default();
        if self.succeed_after.is_some_and(|k| n >= k) {
            status.succeeded = 1;
        }
        if self.fail_after.is_some_and(|k| n >= k) {
            status.failed = 1;
        }
        Ok(status)
    }

    async fn list_pods_for_job(&self, name: &str) -> Result<Vec<String>, ClusterError> {
        if self.no_pods {
            return Ok(Vec::new());
        }
        Ok(vec![format!("{}-x7k2p", name)])
    }

    async fn pod_output(&self, _pod: &str) -> Result<String, ClusterError> {
        if self.log_error {
            return Err(ClusterError::Api {
                status: 400,
                message: "container is waiting to start".into(),
            });
        }
        Ok("PING host: 4 packets transmitted, 4 received\n".into())
    }

    async fn delete_job(&self, name: &str) -> Result<(), ClusterError> {
        self.deleted.lock().unwrap().push(name.to_string());
        match self.delete {
            DeleteBehaviour::Ok => Ok(()),
            DeleteBehaviour::NotFound => Err(ClusterError::NotFound {
                resource: format!("job {}", name),
            }),
            DeleteBehaviour::Error => Err(ClusterError::Api {
                status: 500,
                message: "internal error".into(),
            }),
        }
    }
}

fn fast_settings() -> JobSettings {
    JobSettings {
        poll_interval: Duration::from_millis(10),
        timeout: Duration::from_millis(200),
        ..JobSettings::default()
    }
}

struct Harness {
    store: Arc<dyn HealthCheckStore>,
    cluster: Arc<FakeCluster>,
    service: HealthCheckService,
    id: String,
}

async fn harness(build: impl FnOnce(&Arc<dyn HealthCheckStore>, &str) -> FakeCluster) -> Harness {
    harness_on(Arc::new(MemoryStore::new()), build).await
}

async fn harness_on(
    store: Arc<dyn HealthCheckStore>,
    build: impl FnOnce(&Arc<dyn HealthCheckStore>, &str) -> FakeCluster,
) -> Harness {
    let created = store
        .save(
            &NewHealthCheck {
                name: "gateway".into(),
                owner: "netops".into(),
                command: "ping -c 4 host".into(),
            }
            .into(),
        )
        .await
        .unwrap()
        .unwrap();
    let id = created.id.unwrap();

    let cluster = Arc::new(build(&store, &id));
    let backend = ClusterBackend::new(cluster.clone(), fast_settings());
    let service = HealthCheckService::new(store.clone(), Arc::new(backend));
    Harness {
        store,
        cluster,
        service,
        id,
    }
}

#[tokio::test]
async fn test_success_after_polls_records_output_and_cleans_up_once() {
    let h = harness(|store, id| FakeCluster {
        succeed_after: Some(3),
        watch: Some((store.clone(), id.to_string())),
        ..FakeCluster::default()
    })
    .await;

    let check = h.service.run(&h.id, "alice").await.unwrap();

    assert_eq!(check.execution_logs.len(), 1);
    let log = &check.execution_logs[0];
    assert_eq!(log.status, RunStatus::Success);
    assert!(log.output.as_deref().unwrap().contains("4 received"));
    assert!(log.end_time.unwrap() >= log.start_time);
    assert_eq!(log.triggered_by, "alice");

    assert_eq!(h.cluster.polls.load(Ordering::SeqCst), 3);
    assert_eq!(h.cluster.submits(), 1);
    assert_eq!(h.cluster.deletes(), 1);

    // The job that was created is the one that was deleted.
    let spec = h.cluster.submitted.lock().unwrap()[0].clone();
    assert!(spec.name.starts_with(JOB_NAME_PREFIX));
    assert_eq!(spec.command, "ping -c 4 host");
    assert_eq!(spec.image, "busybox");
    assert_eq!(spec.backoff_limit, 1);
    assert_eq!(h.cluster.deleted.lock().unwrap()[0], spec.name);

    // Observers saw RUNNING with no output while the job was in flight.
    let seen = h.cluster.seen_mid_run.lock().unwrap().clone();
    assert_eq!(seen.len(), 3);
    assert!(seen.iter().all(|(s, o)| *s == RunStatus::Running && o.is_none()));

    // And the terminal state is what is stored afterwards.
    let stored = h.store.load(&h.id).await.unwrap().unwrap();
    assert_eq!(stored.execution_logs, check.execution_logs);
}

#[tokio::test]
async fn test_never_finishing_job_times_out() {
    let h = harness(|_, _| FakeCluster::default()).await;

    let started = Instant::now();
    let check = h.service.run(&h.id, "alice").await.unwrap();
    let elapsed = started.elapsed();

    let log = &check.execution_logs[0];
    assert_eq!(log.status, RunStatus::Failed);
    assert!(log.output.as_deref().unwrap().contains("timed out"), "{:?}", log.output);
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_secs(5));
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_dispatch_error_fails_immediately_and_still_cleans_up() {
    let h = harness(|_, _| FakeCluster {
        submit_error: true,
        delete: DeleteBehaviour::NotFound,
        ..FakeCluster::default()
    })
    .await;

    let check = h.service.run(&h.id, "alice").await.unwrap();
    let log = &check.execution_logs[0];
    assert_eq!(log.status, RunStatus::Failed);
    let output = log.output.as_deref().unwrap();
    assert!(output.starts_with("Failed to execute command. Error: failed to dispatch job"));
    assert!(output.contains("forbidden"));
    assert_eq!(h.cluster.polls.load(Ordering::SeqCst), 0);
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_cluster_reported_failure_is_not_retried() {
    let h = harness(|_, _| FakeCluster {
        fail_after: Some(2),
        ..FakeCluster::default()
    })
    .await;

    let check = h.service.run(&h.id, "alice").await.unwrap();
    let log = &check.execution_logs[0];
    assert_eq!(log.status, RunStatus::Failed);
    assert!(log.output.as_deref().unwrap().contains("failed to execute"));
    assert_eq!(h.cluster.polls.load(Ordering::SeqCst), 2);
    assert_eq!(h.cluster.submits(), 1);
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_status_read_error_fails_run() {
    let h = harness(|_, _| FakeCluster {
        status_error: true,
        ..FakeCluster::default()
    })
    .await;

    let check = h.service.run(&h.id, "alice").await.unwrap();
    let log = &check.execution_logs[0];
    assert_eq!(log.status, RunStatus::Failed);
    assert!(log.output.as_deref().unwrap().contains("could not read status"));
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_missing_pod_is_a_failure() {
    let h = harness(|_, _| FakeCluster {
        succeed_after: Some(1),
        no_pods: true,
        ..FakeCluster::default()
    })
    .await;

    let check = h.service.run(&h.id, "alice").await.unwrap();
    let log = &check.execution_logs[0];
    assert_eq!(log.status, RunStatus::Failed);
    assert!(log.output.as_deref().unwrap().contains("could not find pod"));
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_log_retrieval_error_keeps_success() {
    let h = harness(|_, _| FakeCluster {
        succeed_after: Some(1),
        log_error: true,
        ..FakeCluster::default()
    })
    .await;

    let check = h.service.run(&h.id, "alice").await.unwrap();
    let log = &check.execution_logs[0];
    assert_eq!(log.status, RunStatus::Success);
    let output = log.output.as_deref().unwrap();
    assert!(output.starts_with("Error retrieving logs:"), "{output}");
    assert!(output.contains("waiting to start"));
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_cleanup_failure_does_not_change_outcome() {
    let h = harness(|_, _| FakeCluster {
        succeed_after: Some(1),
        delete: DeleteBehaviour::Error,
        ..FakeCluster::default()
    })
    .await;

    let check = h.service.run(&h.id, "alice").await.unwrap();
    assert_eq!(check.execution_logs[0].status, RunStatus::Success);
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_cancellation_interrupts_polling() {
    let h = harness(|_, _| FakeCluster::default()).await;
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let check = h
        .service
        .run_with_cancel(&h.id, "alice", &cancel)
        .await
        .unwrap();

    let log = &check.execution_logs[0];
    assert_eq!(log.status, RunStatus::Failed);
    assert!(log.output.as_deref().unwrap().contains("interrupted"));
    assert!(started.elapsed() < Duration::from_millis(200));
    assert!(cancel.is_cancelled());
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_service_shutdown_interrupts_run() {
    let h = harness(|_, _| FakeCluster::default()).await;
    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let service = h.service.clone().with_shutdown(shutdown);

    let check = service.run(&h.id, "alice").await.unwrap();
    assert_eq!(check.execution_logs[0].status, RunStatus::Failed);
    assert!(check.execution_logs[0].output.as_deref().unwrap().contains("interrupted"));
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_backend_panic_recorded_as_unexpected_failure() {
    let h = harness(|_, _| FakeCluster {
        panic_on_status: true,
        ..FakeCluster::default()
    })
    .await;

    let check = h.service.run(&h.id, "alice").await.unwrap();
    let log = &check.execution_logs[0];
    assert_eq!(log.status, RunStatus::Failed);
    let output = log.output.as_deref().unwrap();
    assert!(output.starts_with("An unexpected error occurred:"), "{output}");
    assert!(output.contains("status decoder exploded"));

    // The unwound job guard deletes in the background.
    for _ in 0..50 {
        if h.cluster.deletes() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_two_runs_append_two_logs_in_order() {
    let h = harness(|_, _| FakeCluster {
        succeed_after: Some(1),
        ..FakeCluster::default()
    })
    .await;

    h.service.run(&h.id, "first").await.unwrap();
    let check = h.service.run(&h.id, "second").await.unwrap();

    let who: Vec<_> = check
        .execution_logs
        .iter()
        .map(|l| l.triggered_by.as_str())
        .collect();
    assert_eq!(who, vec!["first", "second"]);
    assert!(check.execution_logs.iter().all(|l| l.status == RunStatus::Success));
    assert_ne!(check.execution_logs[0].id, check.execution_logs[1].id);
    assert_eq!(h.cluster.deletes(), 2);
}

#[tokio::test]
async fn test_concurrent_runs_on_same_check_keep_both_logs() {
    let h = harness(|_, _| FakeCluster {
        succeed_after: Some(2),
        ..FakeCluster::default()
    })
    .await;

    let (a, b) = tokio::join!(h.service.run(&h.id, "a"), h.service.run(&h.id, "b"));
    a.unwrap();
    b.unwrap();

    let stored = h.store.load(&h.id).await.unwrap().unwrap();
    assert_eq!(stored.execution_logs.len(), 2);
    assert!(stored.execution_logs.iter().all(|l| l.is_terminal()));
}

#[tokio::test]
async fn test_unknown_check_creates_no_log_and_no_job() {
    let h = harness(|_, _| FakeCluster {
        succeed_after: Some(1),
        ..FakeCluster::default()
    })
    .await;

    let err = h.service.run("does-not-exist", "alice").await.unwrap_err();
    assert!(matches!(err, ServiceError::NotFound { .. }));
    assert_eq!(h.cluster.submits(), 0);
    assert_eq!(h.cluster.deletes(), 0);

    let stored = h.store.load(&h.id).await.unwrap().unwrap();
    assert!(stored.execution_logs.is_empty());
}

async fn assert_delete_mid_run_sticks(h: Harness) {
    let deleter = {
        let service = h.service.clone();
        let id = h.id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            service.delete(&id).await.unwrap();
        })
    };

    let err = h.service.run(&h.id, "alice").await.unwrap_err();
    deleter.await.unwrap();

    assert!(matches!(err, ServiceError::NotFound { .. }), "{err:?}");
    assert!(!h.store.exists(&h.id).await.unwrap());
    assert!(h.store.list_all().await.unwrap().is_empty());
    assert_eq!(h.cluster.deletes(), 1);
}

#[tokio::test]
async fn test_check_deleted_mid_run_is_not_restored() {
    let h = harness(|_, _| FakeCluster {
        succeed_after: Some(6),
        ..FakeCluster::default()
    })
    .await;
    assert_delete_mid_run_sticks(h).await;
}

#[tokio::test]
async fn test_check_deleted_mid_run_is_not_restored_in_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("checks.db");
    let store = Arc::new(SqliteStore::open(path.to_str().unwrap()).unwrap());
    let h = harness_on(store, |_, _| FakeCluster {
        succeed_after: Some(6),
        ..FakeCluster::default()
    })
    .await;
    assert_delete_mid_run_sticks(h).await;
}
