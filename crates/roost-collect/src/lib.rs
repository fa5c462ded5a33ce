//! Session driver and cross-session job orchestration for roost.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use roost_adapters::{
    extractor_for_task, DetailLevel, Extraction, ItemExtractor, PageSource, ScopeContext,
};
use roost_core::{Record, Scope, TaskKind};
use roost_storage::{
    CheckpointStore, ChunkedWriter, CsvSink, RecordSink, SeenSet, SinkError, SqliteSink,
};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "roost-collect";

/// Knobs for one session's scan/extend loop.
#[derive(Debug, Clone)]
pub struct DriverTuning {
    /// Hard cap on content extensions per session.
    pub max_extend_attempts: usize,
    /// Consecutive zero-new-item scans tolerated before giving up.
    pub patience: usize,
    /// Buffered records per sink write.
    pub chunk_size: usize,
    /// Bounded wait for the first item marker after navigation.
    pub initial_wait: Duration,
    /// Bounded wait for the item count to grow after an extension.
    pub growth_wait: Duration,
    /// Poll interval inside the bounded waits.
    pub poll_interval: Duration,
}

impl Default for DriverTuning {
    fn default() -> Self {
        Self {
            max_extend_attempts: 100,
            patience: 10,
            chunk_size: 100,
            initial_wait: Duration::from_secs(10),
            growth_wait: Duration::from_secs(5),
            poll_interval: Duration::from_millis(500),
        }
    }
}

/// Courtesy pacing between content extensions. Delays are jittered to look
/// less mechanical, with a longer pause on a fixed cadence of extends.
/// Pacing is a politeness measure, not a correctness requirement.
#[derive(Debug, Clone)]
pub struct Pacer {
    pub enabled: bool,
    pub between_extends: (Duration, Duration),
    pub long_pause_every: usize,
    pub long_pause: (Duration, Duration),
}

impl Default for Pacer {
    fn default() -> Self {
        Self {
            enabled: true,
            between_extends: (Duration::from_millis(1500), Duration::from_millis(3500)),
            long_pause_every: 20,
            long_pause: (Duration::from_secs(45), Duration::from_secs(90)),
        }
    }
}

impl Pacer {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    async fn rest(&self, extend_attempts: usize) {
        if !self.enabled {
            return;
        }
        tokio::time::sleep(jitter(self.between_extends)).await;
        if self.long_pause_every > 0 && extend_attempts % self.long_pause_every == 0 {
            let pause = jitter(self.long_pause);
            info!(?pause, extend_attempts, "long pacing pause to respect rate limits");
            tokio::time::sleep(pause).await;
        }
    }
}

fn jitter((lo, hi): (Duration, Duration)) -> Duration {
    if hi <= lo {
        return lo;
    }
    let span = (hi - lo).as_millis() as u64;
    lo + Duration::from_millis(rand::rng().random_range(0..=span))
}

/// Driver states for one bounded session against a scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Initializing,
    Scanning,
    Extending,
    Stalled,
    LimitReached,
    Exhausted,
}

/// How a session terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    LimitReached,
    Exhausted,
}

#[derive(Debug)]
pub struct SessionReport {
    pub run_id: Uuid,
    pub scope: Scope,
    pub new_records: Vec<Record>,
    pub end: SessionEnd,
    pub extend_attempts: usize,
}

fn at_cap(max_items: Option<usize>, collected: usize) -> bool {
    max_items.is_some_and(|m| collected >= m)
}

/// Commit a flush outcome: merge flushed ids into the seen-set and persist
/// the checkpoint; a failed batch stays buffered and its ids uncommitted.
async fn settle_flush(
    run_id: Uuid,
    outcome: Result<Option<Vec<Record>>, SinkError>,
    buffered: usize,
    scope: &Scope,
    seen: &mut SeenSet,
    checkpoints: &CheckpointStore,
) {
    match outcome {
        Ok(Some(records)) => {
            seen.commit(records.iter().map(|r| r.id.clone()));
            if let Err(err) = checkpoints.save(scope, seen.ids()).await {
                warn!(%run_id, %err, "failed to persist checkpoint after flush");
            }
            info!(%run_id, flushed = records.len(), total_committed = seen.len(), "flushed chunk");
        }
        Ok(None) => {}
        Err(err) => {
            warn!(%run_id, buffered, %err, "batch write failed; records remain buffered for retry");
        }
    }
}

/// Drives one bounded session: navigate, scan the visible items, extend the
/// source, and stop once the cap of newly collected records is reached or
/// the source stops yielding anything new.
#[derive(Debug, Clone)]
pub struct PaginationDriver {
    tuning: DriverTuning,
    pacer: Pacer,
}

impl PaginationDriver {
    pub fn new(tuning: DriverTuning, pacer: Pacer) -> Self {
        Self { tuning, pacer }
    }

    async fn wait_for_items(&self, page: &dyn PageSource, selector: &str, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if page.item_count(selector) > 0 {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.tuning.poll_interval).await;
        }
    }

    async fn wait_for_growth(
        &self,
        page: &dyn PageSource,
        selector: &str,
        previous: usize,
        wait: Duration,
    ) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            if page.item_count(selector) > previous {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.tuning.poll_interval).await;
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn run_session(
        &self,
        page: &mut dyn PageSource,
        extractor: &dyn ItemExtractor,
        scope: &Scope,
        url: &str,
        seen: &mut SeenSet,
        checkpoints: &CheckpointStore,
        sink: &dyn RecordSink,
        max_items: Option<usize>,
    ) -> Result<SessionReport> {
        let run_id = Uuid::new_v4();
        let ctx = ScopeContext::for_scope(scope);
        let selector = extractor.item_selector();
        let mut writer = ChunkedWriter::new(self.tuning.chunk_size);
        let mut collected: Vec<Record> = Vec::new();
        let mut collected_ids: HashSet<String> = HashSet::new();
        let mut stalled_scans = 0usize;
        let mut extend_attempts = 0usize;
        let mut state = SessionState::Initializing;

        info!(
            %run_id,
            task = %scope.task,
            target = %scope.target,
            already_committed = seen.len(),
            ?max_items,
            "starting session"
        );

        loop {
            match state {
                SessionState::Initializing => {
                    if let Err(err) = page.navigate(url).await {
                        warn!(%run_id, url, %err, "navigation failed; treating scope as empty");
                        state = SessionState::Exhausted;
                        continue;
                    }
                    if self.wait_for_items(&*page, selector, self.tuning.initial_wait).await {
                        state = SessionState::Scanning;
                    } else {
                        warn!(%run_id, url, "no items appeared within the initial wait");
                        state = SessionState::Exhausted;
                    }
                }
                SessionState::Scanning => {
                    let mut new_this_scan = 0usize;
                    for raw in page.visible_items(selector) {
                        if at_cap(max_items, collected.len()) {
                            break;
                        }
                        match extractor.extract(&raw, &ctx) {
                            Extraction::Extracted(record) => {
                                // New means: not committed before AND not
                                // already taken this session — a re-rendering
                                // source can show the same cell twice per scan.
                                if seen.contains(&record.id) || collected_ids.contains(&record.id)
                                {
                                    continue;
                                }
                                debug!(%run_id, id = %record.id, "collected new item");
                                collected_ids.insert(record.id.clone());
                                collected.push(record.clone());
                                writer.accept(record);
                                new_this_scan += 1;

                                let buffered = writer.len();
                                let outcome = writer.flush_if_full(sink, scope).await;
                                settle_flush(run_id, outcome, buffered, scope, seen, checkpoints)
                                    .await;
                            }
                            Extraction::NoMatch => {
                                debug!(%run_id, "element did not match the item shape");
                            }
                            Extraction::Malformed(reason) => {
                                warn!(%run_id, %reason, "skipping malformed item");
                            }
                        }
                    }

                    if at_cap(max_items, collected.len()) {
                        state = SessionState::LimitReached;
                    } else if new_this_scan == 0 {
                        stalled_scans += 1;
                        debug!(%run_id, stalled_scans, "scan produced no new items");
                        state = SessionState::Stalled;
                    } else {
                        stalled_scans = 0;
                        debug!(%run_id, new_this_scan, collected = collected.len(), "scan done");
                        state = SessionState::Extending;
                    }
                }
                SessionState::Extending => {
                    if extend_attempts >= self.tuning.max_extend_attempts {
                        info!(%run_id, extend_attempts, "extend attempt cap reached");
                        state = SessionState::Exhausted;
                        continue;
                    }
                    let before = page.item_count(selector);
                    extend_attempts += 1;
                    if let Err(err) = page.extend().await {
                        warn!(%run_id, %err, "content extension failed");
                        stalled_scans += 1;
                        state = SessionState::Stalled;
                        continue;
                    }
                    let grew = self
                        .wait_for_growth(&*page, selector, before, self.tuning.growth_wait)
                        .await;
                    if grew {
                        // The source is still rendering more content, even if
                        // everything visible so far was already committed —
                        // resumed sessions scan past seen pages this way.
                        stalled_scans = 0;
                    }
                    self.pacer.rest(extend_attempts).await;
                    state = SessionState::Scanning;
                }
                SessionState::Stalled => {
                    if stalled_scans >= self.tuning.patience {
                        info!(
                            %run_id,
                            stalled_scans,
                            "no new items after repeated scans; source exhausted"
                        );
                        state = SessionState::Exhausted;
                    } else {
                        // Nudge the source again before the next scan.
                        state = SessionState::Extending;
                    }
                }
                SessionState::LimitReached | SessionState::Exhausted => {
                    let buffered = writer.len();
                    let outcome = writer.flush_remaining(sink, scope).await;
                    settle_flush(run_id, outcome, buffered, scope, seen, checkpoints).await;

                    let end = if state == SessionState::LimitReached {
                        SessionEnd::LimitReached
                    } else {
                        SessionEnd::Exhausted
                    };
                    info!(
                        %run_id,
                        collected = collected.len(),
                        total_committed = seen.len(),
                        extend_attempts,
                        ?end,
                        "session finished"
                    );
                    return Ok(SessionReport {
                        run_id,
                        scope: scope.clone(),
                        new_records: collected,
                        end,
                        extend_attempts,
                    });
                }
            }
        }
    }
}

/// A cross-session goal for one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobSpec {
    pub task: TaskKind,
    pub target: String,
    pub total_target: usize,
    pub session_limit: usize,
}

impl JobSpec {
    pub fn scope(&self) -> Scope {
        Scope::new(self.task, self.target.clone())
    }
}

/// Durable per-job progress, mutated across invocations, never auto-deleted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobState {
    pub total_target: usize,
    pub session_limit: usize,
    pub completed_sessions: usize,
}

/// One JSON file per job under the jobs directory.
#[derive(Debug, Clone)]
pub struct JobStateStore {
    dir: PathBuf,
}

impl JobStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, scope: &Scope) -> PathBuf {
        self.dir.join(format!("{}.json", scope.job_name()))
    }

    pub async fn load(&self, scope: &Scope) -> Option<JobState> {
        let path = self.path_for(scope);
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
            Err(err) => {
                warn!(path = %path.display(), %err, "failed to read job state");
                return None;
            }
        };
        match serde_json::from_str(&text) {
            Ok(state) => Some(state),
            Err(err) => {
                warn!(path = %path.display(), %err, "corrupt job state; reinitializing");
                None
            }
        }
    }

    pub async fn save(&self, scope: &Scope, state: &JobState) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating jobs directory {}", self.dir.display()))?;
        let path = self.path_for(scope);
        let body = serde_json::to_vec_pretty(state).context("serializing job state")?;
        fs::write(&path, body)
            .await
            .with_context(|| format!("writing job state {}", path.display()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobReport {
    pub scope: Scope,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub total_committed: usize,
    pub sessions_run: usize,
    pub completed: bool,
}

/// Environment-driven configuration for the collector.
#[derive(Debug, Clone)]
pub struct CollectConfig {
    pub data_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub jobs_dir: PathBuf,
    /// Present selects the SQLite sink; absent writes CSV shards.
    pub database_url: Option<String>,
    pub max_rows_per_file: usize,
    pub detail_level: DetailLevel,
    pub tuning: DriverTuning,
    pub pacer: Pacer,
}

impl CollectConfig {
    pub fn from_env() -> Self {
        let mut tuning = DriverTuning::default();
        if let Some(chunk_size) = env_usize("ROOST_CHUNK_SIZE") {
            tuning.chunk_size = chunk_size;
        }
        if let Some(patience) = env_usize("ROOST_PATIENCE") {
            tuning.patience = patience;
        }
        if let Some(max_extends) = env_usize("ROOST_MAX_EXTENDS") {
            tuning.max_extend_attempts = max_extends;
        }

        let mut pacer = Pacer::default();
        if env_flag("ROOST_PACING_DISABLED") {
            pacer.enabled = false;
        }

        Self {
            data_dir: env_path("ROOST_DATA_DIR", "./data"),
            checkpoint_dir: env_path("ROOST_CHECKPOINT_DIR", "./checkpoints"),
            jobs_dir: env_path("ROOST_JOBS_DIR", "./jobs"),
            database_url: std::env::var("DATABASE_URL").ok(),
            max_rows_per_file: env_usize("ROOST_MAX_ROWS_PER_FILE").unwrap_or(1_000_000),
            detail_level: match std::env::var("ROOST_DETAIL_LEVEL").as_deref() {
                Ok("fast") => DetailLevel::Fast,
                _ => DetailLevel::Full,
            },
            tuning,
            pacer,
        }
    }

    /// All state directories rooted under one path; handy for tests and
    /// scratch runs.
    pub fn rooted_at(root: impl AsRef<Path>) -> Self {
        let root = root.as_ref();
        Self {
            data_dir: root.join("data"),
            checkpoint_dir: root.join("checkpoints"),
            jobs_dir: root.join("jobs"),
            database_url: None,
            max_rows_per_file: 1_000_000,
            detail_level: DetailLevel::Full,
            tuning: DriverTuning::default(),
            pacer: Pacer::default(),
        }
    }
}

fn env_path(key: &str, default: &str) -> PathBuf {
    std::env::var(key)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(default))
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

/// The collect pipeline: owns the sink, checkpoint store, and driver, and
/// runs sessions or whole jobs against a supplied page source.
pub struct Collector {
    config: CollectConfig,
    checkpoints: CheckpointStore,
    jobs: JobStateStore,
    sink: Box<dyn RecordSink>,
    driver: PaginationDriver,
}

impl Collector {
    pub async fn new(config: CollectConfig) -> Result<Self> {
        let checkpoints = CheckpointStore::new(&config.checkpoint_dir);
        let jobs = JobStateStore::new(&config.jobs_dir);
        let sink: Box<dyn RecordSink> = match &config.database_url {
            Some(url) => Box::new(
                SqliteSink::connect(url)
                    .await
                    .context("connecting record database")?,
            ),
            None => Box::new(CsvSink::new(&config.data_dir, config.max_rows_per_file)),
        };
        let driver = PaginationDriver::new(config.tuning.clone(), config.pacer.clone());
        Ok(Self {
            config,
            checkpoints,
            jobs,
            sink,
            driver,
        })
    }

    /// The page a task starts from.
    pub fn scope_url(scope: &Scope) -> String {
        let account = scope.target.trim_start_matches('@');
        match scope.task {
            TaskKind::Followers => format!("https://x.com/{account}/followers"),
            TaskKind::Following => format!("https://x.com/{account}/following"),
            TaskKind::Tweets => format!("https://x.com/{account}"),
            TaskKind::Likers => format!("{}/likes", scope.target.trim_end_matches('/')),
            TaskKind::Retweeters => format!("{}/retweets", scope.target.trim_end_matches('/')),
        }
    }

    /// Union of the checkpoint file and the sink's committed ids.
    async fn load_seen(&self, scope: &Scope) -> SeenSet {
        let mut seen = SeenSet::from_ids(self.checkpoints.load(scope).await);
        match self.sink.seen_ids(scope).await {
            Ok(ids) => seen.commit(ids),
            Err(err) => {
                warn!(%err, "could not load committed ids from sink; relying on checkpoint only")
            }
        }
        seen
    }

    /// The sink is authoritative for cross-session progress: other
    /// invocations may have contributed to it.
    async fn committed_count(&self, scope: &Scope) -> Result<usize> {
        Ok(self
            .sink
            .seen_ids(scope)
            .await
            .context("querying sink for committed ids")?
            .len())
    }

    /// Run one bounded session against a scope.
    pub async fn run_session(
        &self,
        page: &mut dyn PageSource,
        scope: &Scope,
        max_items: Option<usize>,
    ) -> Result<SessionReport> {
        let mut seen = self.load_seen(scope).await;
        let extractor = extractor_for_task(scope.task, self.config.detail_level);
        let url = Self::scope_url(scope);
        self.driver
            .run_session(
                page,
                extractor.as_ref(),
                scope,
                &url,
                &mut seen,
                &self.checkpoints,
                self.sink.as_ref(),
                max_items,
            )
            .await
    }

    /// Run sessions until the job's total target is met or the source runs
    /// dry. Re-running a finished job is a no-op.
    pub async fn run_job(&self, page: &mut dyn PageSource, spec: &JobSpec) -> Result<JobReport> {
        let scope = spec.scope();
        let started_at = Utc::now();
        let mut state = self.jobs.load(&scope).await.unwrap_or(JobState {
            total_target: spec.total_target,
            session_limit: spec.session_limit,
            completed_sessions: 0,
        });
        let mut sessions_run = 0usize;

        loop {
            let committed = self.committed_count(&scope).await?;
            if committed >= state.total_target {
                info!(job = %scope.job_name(), committed, target = state.total_target, "job target reached");
                return Ok(JobReport {
                    scope,
                    started_at,
                    finished_at: Utc::now(),
                    total_committed: committed,
                    sessions_run,
                    completed: true,
                });
            }

            let cap = (state.total_target - committed).min(state.session_limit);
            info!(job = %scope.job_name(), committed, cap, "starting job session");
            let report = self.run_session(page, &scope, Some(cap)).await?;

            state.completed_sessions += 1;
            sessions_run += 1;
            self.jobs.save(&scope, &state).await?;

            if report.new_records.len() < cap {
                // Heuristic, not a guarantee: a short session is read as the
                // source running dry, though a transient stall looks the same.
                info!(
                    job = %scope.job_name(),
                    collected = report.new_records.len(),
                    cap,
                    "session fell short of its cap; treating source as exhausted"
                );
                let committed = self.committed_count(&scope).await?;
                return Ok(JobReport {
                    completed: committed >= state.total_target,
                    scope,
                    started_at,
                    finished_at: Utc::now(),
                    total_committed: committed,
                    sessions_run,
                });
            }
        }
    }
}

/// The `jobs.yaml` registry: the set of jobs an invocation should work
/// through, in order.
#[derive(Debug, Clone, Deserialize)]
pub struct JobRegistry {
    pub jobs: Vec<JobEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobEntry {
    pub task: TaskKind,
    pub target: String,
    pub total_target: usize,
    pub session_limit: usize,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

pub async fn load_job_registry(path: impl AsRef<Path>) -> Result<JobRegistry> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

/// Work through every enabled job in sequence. The page session is a
/// singular stateful resource, so there is no cross-job fan-out.
pub async fn run_registry(
    collector: &Collector,
    page: &mut dyn PageSource,
    registry: &JobRegistry,
) -> Result<Vec<JobReport>> {
    let mut reports = Vec::new();
    for entry in &registry.jobs {
        if !entry.enabled {
            debug!(task = %entry.task, target = %entry.target, "skipping disabled job");
            continue;
        }
        let spec = JobSpec {
            task: entry.task,
            target: entry.target.clone(),
            total_target: entry.total_target,
            session_limit: entry.session_limit,
        };
        reports.push(collector.run_job(page, &spec).await?);
    }
    Ok(reports)
}
