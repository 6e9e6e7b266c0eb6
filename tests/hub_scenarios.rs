use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use collecthub::{
    BackoffConfig, CancelOutcome, CollectHub, CollectRequest, Collector, CollectorError, Discovery,
    Extraction, FieldSpec, HubConfig, JobError, JobId, JobOptions, JobState, LimiterKind,
    MemorySink, Retrieval, Stage, StageStatus, StreamClose,
};
use serde_json::json;
use tokio_stream::StreamExt;

// --- Scripted collector ---

#[derive(Default)]
struct Scripted {
    discover_delay: Duration,
    extract_delay: Duration,
    /// Consumed one per discovery call before falling back to `always`.
    failures: Mutex<VecDeque<CollectorError>>,
    always: Option<CollectorError>,
    discover_calls: AtomicU32,
    in_extract: AtomicUsize,
    max_in_extract: AtomicUsize,
}

impl Scripted {
    fn ok() -> Self {
        Self::default()
    }

    fn always(err: CollectorError) -> Self {
        Self {
            always: Some(err),
            ..Self::default()
        }
    }

    fn failing_first(errs: Vec<CollectorError>) -> Self {
        Self {
            failures: Mutex::new(errs.into()),
            ..Self::default()
        }
    }

    fn calls(&self) -> u32 {
        self.discover_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Collector for Scripted {
    async fn discover(&self, req: &CollectRequest) -> Result<Discovery, CollectorError> {
        self.discover_calls.fetch_add(1, Ordering::SeqCst);
        if !self.discover_delay.is_zero() {
            tokio::time::sleep(self.discover_delay).await;
        }
        if let Some(err) = self.failures.lock().unwrap().pop_front() {
            return Err(err);
        }
        if let Some(err) = &self.always {
            return Err(err.clone());
        }
        Ok(Discovery {
            targets: vec![format!("https://parts.example/{}", req.query)],
            cost_usd: 0.001,
        })
    }

    async fn retrieve(
        &self,
        _req: &CollectRequest,
        _discovery: &Discovery,
    ) -> Result<Retrieval, CollectorError> {
        Ok(Retrieval::default())
    }

    async fn extract(
        &self,
        req: &CollectRequest,
        _retrieval: &Retrieval,
    ) -> Result<Extraction, CollectorError> {
        let now = self.in_extract.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_extract.fetch_max(now, Ordering::SeqCst);
        if !self.extract_delay.is_zero() {
            tokio::time::sleep(self.extract_delay).await;
        }
        self.in_extract.fetch_sub(1, Ordering::SeqCst);
        Ok(Extraction {
            output: json!({ "part": req.query }),
            cost_usd: 0.002,
        })
    }
}

fn fast_config(workers: usize, retrieval: usize, extraction: usize) -> HubConfig {
    HubConfig {
        workers,
        retrieval_capacity: retrieval,
        extraction_capacity: extraction,
        backoff: BackoffConfig {
            base_delay_ms: 1,
            multiplier: 2.0,
            max_delay_ms: 5,
            jitter: 0.0,
        },
        ..HubConfig::default()
    }
}

fn schema() -> Vec<FieldSpec> {
    vec![FieldSpec::new("part", "part number").with_example("BAV99")]
}

fn hub(config: HubConfig, collector: &Arc<Scripted>) -> CollectHub {
    CollectHub::new(config, collector.clone()).unwrap()
}

async fn wait_for_state(hub: &CollectHub, id: JobId, state: JobState) {
    for _ in 0..200 {
        if hub.get_state(id).unwrap() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("job {id} never reached {state}");
}

#[tokio::test]
async fn single_worker_completes_in_submission_order() {
    let collector = Arc::new(Scripted::ok());
    let hub = hub(fast_config(1, 1, 1), &collector);
    hub.pause();
    let ids: Vec<JobId> = ["J1", "J2", "J3"]
        .iter()
        .map(|q| hub.submit(*q, schema()).unwrap())
        .collect();
    hub.resume();

    let order: Vec<JobId> = hub.run_all().await.iter().map(|o| o.job_id).collect();
    assert_eq!(order, ids);
    hub.shutdown().await;
}

#[tokio::test]
async fn transient_failures_exhaust_max_attempts() {
    let collector = Arc::new(Scripted::always(CollectorError::Timeout));
    let hub = hub(fast_config(2, 2, 2), &collector);
    let options = JobOptions {
        max_attempts: 3,
        ..Default::default()
    };
    let id = hub.submit_job("bav99", schema(), options).unwrap();

    let outcome = hub.get_result(id).await.unwrap();
    assert_eq!(outcome.status, JobState::Failed);
    assert_eq!(outcome.attempts, 3);
    assert!(matches!(outcome.result, Err(JobError::Transient(_))));
    assert_eq!(hub.job(id).unwrap().attempt_count, 3);
    assert_eq!(collector.calls(), 3);
    hub.shutdown().await;
}

#[tokio::test]
async fn permanent_failure_runs_once() {
    let collector = Arc::new(Scripted::always(CollectorError::Api {
        status: 404,
        message: "no such part".into(),
    }));
    let hub = hub(fast_config(2, 2, 2), &collector);
    let id = hub.submit("zz-unknown", schema()).unwrap();

    let outcome = hub.get_result(id).await.unwrap();
    assert_eq!(outcome.status, JobState::Failed);
    assert_eq!(outcome.attempts, 1);
    assert!(matches!(outcome.result, Err(JobError::Permanent(_))));
    assert_eq!(collector.calls(), 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn transient_failure_then_success() {
    let collector = Arc::new(Scripted::failing_first(vec![
        CollectorError::RateLimited { retry_after_ms: 10 },
    ]));
    let hub = hub(fast_config(1, 1, 1), &collector);
    let id = hub.submit("bav99", schema()).unwrap();

    let outcome = hub.get_result(id).await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 2);
    assert_eq!(
        hub.job(id).unwrap().state_history,
        vec![
            JobState::Pending,
            JobState::Running,
            JobState::Pending,
            JobState::Running
        ]
    );
    hub.shutdown().await;
}

#[tokio::test]
async fn cancel_while_running_releases_leases() {
    let collector = Arc::new(Scripted {
        discover_delay: Duration::from_millis(150),
        ..Scripted::default()
    });
    let hub = hub(fast_config(1, 1, 1), &collector);
    let baseline = hub.limiter_stats(LimiterKind::Retrieval).in_use;
    let id = hub.submit("bav99", schema()).unwrap();

    wait_for_state(&hub, id, JobState::Running).await;
    assert_eq!(hub.cancel(id).unwrap(), CancelOutcome::Requested);

    let outcome = hub.get_result(id).await.unwrap();
    assert_eq!(outcome.status, JobState::Cancelled);
    assert_eq!(outcome.result, Err(JobError::Cancelled));
    assert_eq!(hub.limiter_stats(LimiterKind::Retrieval).in_use, baseline);
    assert_eq!(hub.limiter_stats(LimiterKind::Extraction).in_use, 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn cancel_during_extraction_releases_extraction_lease() {
    let collector = Arc::new(Scripted {
        extract_delay: Duration::from_millis(150),
        ..Scripted::default()
    });
    let hub = hub(fast_config(1, 1, 1), &collector);
    let baseline = hub.limiter_stats(LimiterKind::Extraction).in_use;
    let id = hub.submit("bav99", schema()).unwrap();

    for _ in 0..200 {
        if collector.in_extract.load(Ordering::SeqCst) == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(collector.in_extract.load(Ordering::SeqCst), 1);
    assert_eq!(hub.limiter_stats(LimiterKind::Extraction).in_use, baseline + 1);
    assert_eq!(hub.cancel(id).unwrap(), CancelOutcome::Requested);

    let outcome = hub.get_result(id).await.unwrap();
    assert_eq!(outcome.status, JobState::Cancelled);
    assert_eq!(outcome.result, Err(JobError::Cancelled));
    assert_eq!(hub.limiter_stats(LimiterKind::Extraction).in_use, baseline);
    assert_eq!(hub.limiter_stats(LimiterKind::Retrieval).in_use, 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn limiter_freeze_longer_than_timeout_does_not_fail_job() {
    let collector = Arc::new(Scripted::ok());
    let hub = hub(fast_config(1, 1, 1), &collector);
    hub.resize_limiter("retrieval", 0).await.unwrap();
    let options = JobOptions {
        timeout_ms: 50,
        max_attempts: 1,
        ..Default::default()
    };
    let id = hub.submit_job("bav99", schema(), options).unwrap();

    wait_for_state(&hub, id, JobState::Running).await;
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(hub.get_state(id).unwrap(), JobState::Running);
    assert_eq!(collector.calls(), 0);

    hub.resize_limiter("retrieval", 1).await.unwrap();
    let outcome = hub.get_result(id).await.unwrap();
    assert!(outcome.is_success(), "unexpected outcome: {outcome:?}");
    assert_eq!(outcome.attempts, 1);
    hub.shutdown().await;
}

#[tokio::test]
async fn zero_retrieval_capacity_freezes_without_failing() {
    let collector = Arc::new(Scripted::ok());
    let hub = hub(fast_config(2, 2, 2), &collector);
    hub.pause();
    let ids: Vec<JobId> = (0..3)
        .map(|i| hub.submit(format!("part-{i}"), schema()).unwrap())
        .collect();
    hub.resize_limiter("retrieval", 0).await.unwrap();
    hub.resume();

    tokio::time::sleep(Duration::from_millis(100)).await;
    for id in &ids {
        let state = hub.get_state(*id).unwrap();
        assert!(!state.is_terminal(), "job {id} reached {state} during freeze");
    }
    assert_eq!(collector.calls(), 0);
    assert_eq!(hub.limiter_stats(LimiterKind::Retrieval).waiting, 2);

    hub.resize_limiter("retrieval", 2).await.unwrap();
    let outcomes = hub.run_all().await;
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(|o| o.is_success()));
    hub.shutdown().await;
}

#[tokio::test]
async fn limiter_capacity_bounds_concurrency() {
    let collector = Arc::new(Scripted {
        extract_delay: Duration::from_millis(20),
        ..Scripted::default()
    });
    let hub = hub(fast_config(8, 3, 2), &collector);
    for i in 0..16 {
        hub.submit(format!("part-{i}"), schema()).unwrap();
    }

    let outcomes = hub.run_all().await;
    assert_eq!(outcomes.len(), 16);
    assert!(collector.max_in_extract.load(Ordering::SeqCst) <= 2);
    assert!(hub.limiter_stats(LimiterKind::Retrieval).peak_in_use <= 3);
    assert!(hub.limiter_stats(LimiterKind::Extraction).peak_in_use <= 2);
    assert_eq!(hub.limiter_stats(LimiterKind::Retrieval).in_use, 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn resize_pool_is_idempotent_and_keeps_jobs_running() {
    let collector = Arc::new(Scripted {
        discover_delay: Duration::from_millis(80),
        ..Scripted::default()
    });
    let hub = hub(fast_config(2, 4, 4), &collector);
    let id = hub.submit("bav99", schema()).unwrap();
    wait_for_state(&hub, id, JobState::Running).await;

    hub.resize_pool(4).await;
    hub.resize_pool(4).await;
    assert_eq!(hub.stats().workers, 4);

    hub.resize_pool(1).await;
    hub.resize_pool(1).await;
    assert_eq!(hub.stats().workers, 1);

    assert!(hub.get_result(id).await.unwrap().is_success());
    hub.shutdown().await;
}

#[tokio::test]
async fn pause_holds_jobs_pending() {
    let collector = Arc::new(Scripted::ok());
    let hub = hub(fast_config(2, 2, 2), &collector);
    hub.pause();
    let id = hub.submit("bav99", schema()).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(hub.get_state(id).unwrap(), JobState::Pending);
    assert!(hub.stats().paused);

    hub.resume();
    assert!(hub.get_result(id).await.unwrap().is_success());
    hub.shutdown().await;
}

#[tokio::test]
async fn stream_delivers_each_outcome_once() {
    let collector = Arc::new(Scripted::ok());
    let hub = hub(fast_config(3, 3, 3), &collector);
    hub.pause();
    let mut ids: Vec<JobId> = (0..4)
        .map(|i| hub.submit(format!("part-{i}"), schema()).unwrap())
        .collect();
    let stream = hub.stream_results_with(StreamClose::WhenIdle);
    hub.resume();

    let mut streamed: Vec<JobId> = stream.map(|o| o.job_id).collect().await;
    streamed.sort();
    ids.sort();
    assert_eq!(streamed, ids);
    hub.shutdown().await;
}

#[tokio::test]
async fn cancel_all_cancels_queued_jobs() {
    let collector = Arc::new(Scripted::ok());
    let hub = hub(fast_config(1, 1, 1), &collector);
    hub.pause();
    let ids: Vec<JobId> = (0..3)
        .map(|i| hub.submit(format!("part-{i}"), schema()).unwrap())
        .collect();

    assert_eq!(hub.cancel_all(), 3);
    for id in ids {
        assert_eq!(hub.get_state(id).unwrap(), JobState::Cancelled);
    }
    assert_eq!(collector.calls(), 0);
    hub.shutdown().await;
}

#[tokio::test]
async fn stage_metrics_are_emitted() {
    let collector = Arc::new(Scripted::ok());
    let sink = Arc::new(MemorySink::new());
    let hub = CollectHub::with_metrics(fast_config(1, 1, 1), collector, sink.clone()).unwrap();
    let id = hub.submit("bav99", schema()).unwrap();
    hub.get_result(id).await.unwrap();

    let events = sink.events_for(id);
    let stages: Vec<Stage> = events.iter().map(|e| e.stage).collect();
    assert_eq!(stages, vec![Stage::Discovery, Stage::Retrieval, Stage::Extraction]);
    assert!(events.iter().all(|e| e.status == StageStatus::Succeeded));
    assert_eq!(events[2].cost_usd, 0.002);
    hub.shutdown().await;
}

#[tokio::test]
async fn shutdown_releases_limiter_waiters() {
    let collector = Arc::new(Scripted::ok());
    let hub = hub(fast_config(2, 0, 1), &collector);
    let id = hub.submit("bav99", schema()).unwrap();
    wait_for_state(&hub, id, JobState::Running).await;

    hub.shutdown().await;
    let outcome = hub.get_result(id).await.unwrap();
    assert_eq!(outcome.status, JobState::Cancelled);
    assert_eq!(outcome.result, Err(JobError::Shutdown));
}
