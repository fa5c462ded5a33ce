//! End-to-end session and job scenarios against a scripted page source.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use roost_adapters::{
    user_cell_fixture, DetailLevel, RawItem, ScriptedPageSource, UserCellExtractor,
};
use roost_collect::{
    CollectConfig, Collector, DriverTuning, JobSpec, Pacer, PaginationDriver, SessionEnd,
};
use roost_core::{Record, Scope, TaskKind};
use roost_storage::{CheckpointStore, CsvSink, RecordSink, SeenSet, SinkError};
use tempfile::tempdir;

fn snappy_tuning(chunk_size: usize) -> DriverTuning {
    DriverTuning {
        max_extend_attempts: 100,
        patience: 3,
        chunk_size,
        initial_wait: Duration::from_millis(50),
        growth_wait: Duration::from_millis(20),
        poll_interval: Duration::from_millis(5),
    }
}

fn test_config(root: &Path) -> CollectConfig {
    let mut config = CollectConfig::rooted_at(root);
    config.tuning = snappy_tuning(10);
    config.pacer = Pacer::disabled();
    config
}

fn follower_page(count: usize) -> ScriptedPageSource {
    let items: Vec<RawItem> = (1..=count)
        .map(|i| user_cell_fixture(&format!("u{i}"), &format!("User {i}"), "bio"))
        .collect();
    ScriptedPageSource::new(items)
        .with_initial_visible(10)
        .with_reveal_per_extend(10)
}

fn scope() -> Scope {
    Scope::new(TaskKind::Followers, "@MindAIProject")
}

fn handles(records: &[Record]) -> Vec<String> {
    records.iter().map(|r| r.id.clone()).collect()
}

fn expected_handles(range: std::ops::RangeInclusive<usize>) -> Vec<String> {
    range.map(|i| format!("@u{i}")).collect()
}

#[tokio::test]
async fn second_run_against_a_static_source_is_idempotent() {
    let dir = tempdir().expect("tempdir");
    let collector = Collector::new(test_config(dir.path())).await.expect("collector");

    let mut page = follower_page(20);
    let report = collector
        .run_session(&mut page, &scope(), None)
        .await
        .expect("first session");
    assert_eq!(report.new_records.len(), 20);
    assert_eq!(report.end, SessionEnd::Exhausted);

    let mut page = follower_page(20);
    let report = collector
        .run_session(&mut page, &scope(), None)
        .await
        .expect("second session");
    assert!(report.new_records.is_empty(), "nothing new on a re-run");

    let sink = CsvSink::new(dir.path().join("data"), 1_000_000);
    let committed = sink.seen_ids(&scope()).await.expect("seen ids");
    assert_eq!(committed.len(), 20, "the sink holds each id exactly once");
}

#[tokio::test]
async fn session_cap_stops_collection_mid_scan() {
    let dir = tempdir().expect("tempdir");
    let collector = Collector::new(test_config(dir.path())).await.expect("collector");

    let mut page = follower_page(30);
    let report = collector
        .run_session(&mut page, &scope(), Some(7))
        .await
        .expect("capped session");
    assert_eq!(report.end, SessionEnd::LimitReached);
    assert_eq!(handles(&report.new_records), expected_handles(1..=7));
}

#[tokio::test]
async fn stalled_source_terminates_within_patience() {
    let dir = tempdir().expect("tempdir");
    let collector = Collector::new(test_config(dir.path())).await.expect("collector");

    // The page shows the same ten cells forever; nothing new ever loads.
    let fixed = follower_page(10).with_reveal_per_extend(0);

    let mut page = fixed.clone();
    let report = collector
        .run_session(&mut page, &scope(), None)
        .await
        .expect("first session");
    assert_eq!(report.new_records.len(), 10);
    assert_eq!(report.end, SessionEnd::Exhausted);
    assert!(
        report.extend_attempts <= 4,
        "gave up after {} extends instead of the patience threshold",
        report.extend_attempts
    );

    let mut page = fixed;
    let report = collector
        .run_session(&mut page, &scope(), None)
        .await
        .expect("second session");
    assert!(report.new_records.is_empty());
    assert_eq!(report.end, SessionEnd::Exhausted);
}

#[tokio::test]
async fn resumed_scope_collects_only_the_remainder() {
    let dir = tempdir().expect("tempdir");
    let collector = Collector::new(test_config(dir.path())).await.expect("collector");

    let mut page = follower_page(50);
    let report = collector
        .run_session(&mut page, &scope(), Some(30))
        .await
        .expect("first session");
    assert_eq!(handles(&report.new_records), expected_handles(1..=30));

    let mut page = follower_page(50);
    let report = collector
        .run_session(&mut page, &scope(), None)
        .await
        .expect("resumed session");
    assert_eq!(
        handles(&report.new_records),
        expected_handles(31..=50),
        "the first thirty are never re-emitted"
    );
}

#[tokio::test]
async fn checkpoint_alone_recovers_progress_when_the_sink_is_lost() {
    let dir = tempdir().expect("tempdir");
    let collector = Collector::new(test_config(dir.path())).await.expect("collector");

    let mut page = follower_page(40);
    collector
        .run_session(&mut page, &scope(), Some(25))
        .await
        .expect("first session");

    // Losing the data shards leaves the checkpoint as the only memory.
    std::fs::remove_dir_all(dir.path().join("data")).expect("drop data dir");

    let mut page = follower_page(40);
    let report = collector
        .run_session(&mut page, &scope(), None)
        .await
        .expect("session after sink loss");
    assert_eq!(handles(&report.new_records), expected_handles(26..=40));
}

#[tokio::test]
async fn job_reaches_its_target_in_exactly_four_sessions() {
    let dir = tempdir().expect("tempdir");
    let collector = Collector::new(test_config(dir.path())).await.expect("collector");
    let spec = JobSpec {
        task: TaskKind::Followers,
        target: "@MindAIProject".to_string(),
        total_target: 100,
        session_limit: 30,
    };

    let mut page = follower_page(200);
    let report = collector.run_job(&mut page, &spec).await.expect("job");
    assert!(report.completed);
    assert_eq!(report.sessions_run, 4, "30 + 30 + 30 + 10");
    assert_eq!(report.total_committed, 100);

    let report = collector.run_job(&mut page, &spec).await.expect("re-run");
    assert!(report.completed);
    assert_eq!(report.sessions_run, 0, "a finished job is a no-op");
    assert_eq!(report.total_committed, 100);
}

#[tokio::test]
async fn two_capped_invocations_split_u1_to_u100() {
    let dir = tempdir().expect("tempdir");
    let collector = Collector::new(test_config(dir.path())).await.expect("collector");
    let checkpoints = CheckpointStore::new(dir.path().join("checkpoints"));

    let mut page = follower_page(250);
    let report = collector
        .run_session(&mut page, &scope(), Some(50))
        .await
        .expect("first invocation");
    assert_eq!(handles(&report.new_records), expected_handles(1..=50));

    let committed = checkpoints.load(&scope()).await;
    let expected: HashSet<String> = expected_handles(1..=50).into_iter().collect();
    assert_eq!(committed, expected, "checkpoint holds exactly the first fifty");

    let mut page = follower_page(250);
    let report = collector
        .run_session(&mut page, &scope(), Some(50))
        .await
        .expect("second invocation");
    assert_eq!(handles(&report.new_records), expected_handles(51..=100));
    assert_eq!(checkpoints.load(&scope()).await.len(), 100);
}

#[tokio::test]
async fn navigation_failure_ends_the_session_and_job_cleanly() {
    let dir = tempdir().expect("tempdir");
    let collector = Collector::new(test_config(dir.path())).await.expect("collector");

    let mut page = ScriptedPageSource::new(Vec::new()).failing_navigation();
    let report = collector
        .run_session(&mut page, &scope(), None)
        .await
        .expect("session survives navigation failure");
    assert!(report.new_records.is_empty());
    assert_eq!(report.end, SessionEnd::Exhausted);

    let spec = JobSpec {
        task: TaskKind::Followers,
        target: "@MindAIProject".to_string(),
        total_target: 100,
        session_limit: 30,
    };
    let mut page = ScriptedPageSource::new(Vec::new()).failing_navigation();
    let report = collector.run_job(&mut page, &spec).await.expect("job");
    assert_eq!(report.sessions_run, 1, "the exhaustion heuristic stops the job");
    assert!(!report.completed);
}

#[tokio::test]
async fn rerendered_overlap_is_collected_once() {
    let dir = tempdir().expect("tempdir");
    let collector = Collector::new(test_config(dir.path())).await.expect("collector");

    let mut page = follower_page(10)
        .with_reveal_per_extend(0)
        .with_rerender_overlap(3);
    let report = collector
        .run_session(&mut page, &scope(), None)
        .await
        .expect("session");
    assert_eq!(report.new_records.len(), 10);

    let text = std::fs::read_to_string(
        dir.path().join("data").join("MindAIProject_followers_1.csv"),
    )
    .expect("read shard");
    assert_eq!(text.lines().count(), 11, "header plus one row per unique id");
}

struct FlakySink {
    inner: CsvSink,
    failures_left: AtomicUsize,
}

#[async_trait]
impl RecordSink for FlakySink {
    async fn commit(&self, scope: &Scope, records: &[Record]) -> Result<usize, SinkError> {
        if self.failures_left.load(Ordering::SeqCst) > 0 {
            self.failures_left.fetch_sub(1, Ordering::SeqCst);
            return Err(SinkError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "transient sink failure",
            )));
        }
        self.inner.commit(scope, records).await
    }

    async fn seen_ids(&self, scope: &Scope) -> Result<HashSet<String>, SinkError> {
        self.inner.seen_ids(scope).await
    }
}

#[tokio::test]
async fn failed_batch_stays_buffered_and_lands_on_a_later_flush() {
    let dir = tempdir().expect("tempdir");
    let driver = PaginationDriver::new(snappy_tuning(5), Pacer::disabled());
    let checkpoints = CheckpointStore::new(dir.path().join("checkpoints"));
    let sink = FlakySink {
        inner: CsvSink::new(dir.path().join("data"), 1_000_000),
        failures_left: AtomicUsize::new(1),
    };
    let extractor = UserCellExtractor::new(DetailLevel::Full);
    let mut seen = SeenSet::new();

    let mut page = follower_page(12);
    let report = driver
        .run_session(
            &mut page,
            &extractor,
            &scope(),
            "https://x.com/MindAIProject/followers",
            &mut seen,
            &checkpoints,
            &sink,
            None,
        )
        .await
        .expect("session");

    assert_eq!(report.new_records.len(), 12);
    let committed = sink.inner.seen_ids(&scope()).await.expect("seen ids");
    assert_eq!(
        committed.len(),
        12,
        "the rejected batch was retried and every record landed exactly once"
    );
}
