//! Client for the query-execution service.
//!
//! The service runs named, parameterized queries asynchronously: submitting a
//! query starts (or refreshes) a remote job, the job is polled until it
//! reports success or failure, and a finished job's result set is downloaded
//! as delimited text. There is no push notification, so a batch of queries is
//! driven by one loop that submits everything up front and then polls every
//! in-flight job on a short interval. Batch latency is bounded by the slowest
//! query rather than the sum of all of them.
//!
//! Failures are per-query and non-fatal: a failed submission, a failed remote
//! job, or a failed download all degrade to an empty [`ResultTable`] so the
//! report layer can produce a best-effort artifact with gaps instead of no
//! artifact at all.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::table::ResultTable;

/// Remote job status code meaning the job finished successfully.
const JOB_STATUS_SUCCESS: i32 = 3;
/// Remote job status code meaning the job failed to execute.
const JOB_STATUS_FAILURE: i32 = 4;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// One query parameter value. The recognized parameter vocabulary belongs to
/// the service; this crate only carries values through.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum ParamValue {
    Str(String),
    Int(i64),
    DateRange { start: String, end: String },
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        ParamValue::Str(s.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        ParamValue::Str(s)
    }
}

impl From<i64> for ParamValue {
    fn from(n: i64) -> Self {
        ParamValue::Int(n)
    }
}

impl ParamValue {
    pub fn date_range(start: impl Into<String>, end: impl Into<String>) -> Self {
        ParamValue::DateRange {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// One analytical query to execute, identified by the service's opaque
/// numeric id. Immutable once built.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub query_id: u32,
    pub parameters: BTreeMap<String, ParamValue>,
}

impl QueryRequest {
    pub fn new(query_id: u32) -> Self {
        Self {
            query_id,
            parameters: BTreeMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }
}

/// Lifecycle of one submitted query within a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Tracks the remote job driving one query to completion.
#[derive(Debug, Clone)]
pub struct JobHandle {
    pub query_id: u32,
    pub remote_job_id: Option<String>,
    pub state: JobState,
    pub result_id: Option<i64>,
}

/// Remote job descriptor as returned by the service.
#[derive(Debug, Clone, Deserialize)]
pub struct Job {
    pub id: String,
    pub status: i32,
    #[serde(default)]
    pub query_result_id: Option<i64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobEnvelope {
    job: Job,
}

/// Per-batch polling state, keyed by query id. Owned by the caller so that
/// two batches never share state; at most one in-flight job per query id is
/// tracked at a time within a batch.
#[derive(Debug, Default)]
pub struct Batch {
    handles: HashMap<u32, JobHandle>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&self, query_id: u32) -> Option<&JobHandle> {
        self.handles.get(&query_id)
    }

    pub fn state(&self, query_id: u32) -> Option<JobState> {
        self.handles.get(&query_id).map(|h| h.state)
    }

    fn running_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self
            .handles
            .values()
            .filter(|h| h.state == JobState::Running)
            .map(|h| h.query_id)
            .collect();
        ids.sort_unstable();
        ids
    }

    // Remote job descriptors are only needed while polling; terminal state
    // and result ids stay behind for fetching.
    fn drop_remote_jobs(&mut self) {
        for handle in self.handles.values_mut() {
            handle.remote_job_id = None;
        }
    }
}

/// The three outbound calls the service exposes. Split out as a trait so the
/// polling state machine can be driven by a scripted transport in tests.
pub trait QueryService {
    fn submit(
        &self,
        query_id: u32,
        parameters: &BTreeMap<String, ParamValue>,
    ) -> impl std::future::Future<Output = Result<Job>> + Send;

    fn job_status(&self, job_id: &str) -> impl std::future::Future<Output = Result<Job>> + Send;

    fn fetch_csv(
        &self,
        query_id: u32,
        result_id: Option<i64>,
    ) -> impl std::future::Future<Output = Result<String>> + Send;
}

/// HTTP transport against a Redash-compatible query service. A static API
/// key is attached to every request; every call has a bounded timeout.
pub struct RedashService {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl RedashService {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("building HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }

    /// Reads `REDASH_BASE_URL` and `REDASH_API_KEY`.
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("REDASH_BASE_URL").context("REDASH_BASE_URL not set")?;
        let api_key = std::env::var("REDASH_API_KEY").context("REDASH_API_KEY not set")?;
        Self::new(base_url, api_key)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}?api_key={}", self.base_url, path, self.api_key)
    }
}

#[derive(Serialize)]
struct SubmitPayload<'a> {
    max_age: u32,
    parameters: &'a BTreeMap<String, ParamValue>,
}

impl QueryService for RedashService {
    async fn submit(
        &self,
        query_id: u32,
        parameters: &BTreeMap<String, ParamValue>,
    ) -> Result<Job> {
        // max_age 0 forces a fresh execution instead of a cached result.
        let payload = SubmitPayload {
            max_age: 0,
            parameters,
        };
        let response = self
            .http
            .post(self.url(&format!("api/queries/{query_id}/results")))
            .json(&payload)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("submit returned {status}: {body}");
        }
        let envelope: JobEnvelope = response.json().await?;
        Ok(envelope.job)
    }

    async fn job_status(&self, job_id: &str) -> Result<Job> {
        let response = self
            .http
            .get(self.url(&format!("api/jobs/{job_id}")))
            .send()
            .await?;
        if !response.status().is_success() {
            anyhow::bail!("job status returned {}", response.status());
        }
        let envelope: JobEnvelope = response.json().await?;
        Ok(envelope.job)
    }

    async fn fetch_csv(&self, query_id: u32, result_id: Option<i64>) -> Result<String> {
        let path = match result_id {
            Some(id) => format!("api/queries/{query_id}/results/{id}.csv"),
            None => format!("api/queries/{query_id}/results.csv"),
        };
        let response = self.http.get(self.url(&path)).send().await?;
        if !response.status().is_success() {
            anyhow::bail!("result download returned {}", response.status());
        }
        Ok(response.text().await?)
    }
}

/// Drives batches of queries from submission to a terminal state.
pub struct QueryRunner<S: QueryService> {
    service: S,
    poll_interval: Duration,
}

impl<S: QueryService> QueryRunner<S> {
    pub fn new(service: S) -> Self {
        Self {
            service,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Submit one request. A transport error or non-success response marks
    /// the query failed; there is no retry. The service is authoritative and
    /// rerunning later is the caller's concern.
    pub async fn submit(&self, batch: &mut Batch, request: &QueryRequest) {
        let query_id = request.query_id;
        batch.handles.insert(
            query_id,
            JobHandle {
                query_id,
                remote_job_id: None,
                state: JobState::Pending,
                result_id: None,
            },
        );

        match self.service.submit(query_id, &request.parameters).await {
            Ok(job) => {
                if let Some(handle) = batch.handles.get_mut(&query_id) {
                    handle.remote_job_id = Some(job.id);
                    handle.state = JobState::Running;
                }
            }
            Err(e) => {
                warn!(query_id, error = %e, "query submission failed");
                if let Some(handle) = batch.handles.get_mut(&query_id) {
                    handle.state = JobState::Failed;
                }
            }
        }
    }

    /// Poll one running query. A still-in-progress job stays running; the
    /// caller polls again later.
    pub async fn poll(&self, batch: &mut Batch, query_id: u32) {
        let Some(job_id) = batch
            .handles
            .get(&query_id)
            .filter(|h| h.state == JobState::Running)
            .and_then(|h| h.remote_job_id.clone())
        else {
            return;
        };

        let job = match self.service.job_status(&job_id).await {
            Ok(job) => job,
            Err(e) => {
                warn!(query_id, error = %e, "job status check failed");
                if let Some(handle) = batch.handles.get_mut(&query_id) {
                    handle.state = JobState::Failed;
                }
                return;
            }
        };

        let Some(handle) = batch.handles.get_mut(&query_id) else {
            return;
        };
        match job.status {
            JOB_STATUS_SUCCESS => {
                handle.result_id = job.query_result_id;
                handle.state = JobState::Succeeded;
                info!(query_id, "query completed");
            }
            JOB_STATUS_FAILURE => {
                warn!(query_id, error = ?job.error, "query execution failed");
                handle.state = JobState::Failed;
            }
            _ => {
                handle.remote_job_id = Some(job.id);
            }
        }
    }

    /// Submit every request once, then poll all in-flight jobs on a fixed
    /// interval until each has succeeded or failed. One failed query never
    /// aborts polling of the others. Returns only when nothing is left
    /// running; the terminal states and result ids remain in `batch`.
    pub async fn run_all(&self, batch: &mut Batch, requests: &[QueryRequest]) {
        for request in requests {
            self.submit(batch, request).await;
        }

        loop {
            let running = batch.running_ids();
            if running.is_empty() {
                break;
            }
            for query_id in running {
                self.poll(batch, query_id).await;
            }
            tokio::time::sleep(self.poll_interval).await;
        }

        batch.drop_remote_jobs();
    }

    /// Download and parse a finished query's result set. Any failure, and
    /// asking for a query that never succeeded, yields an empty table:
    /// downstream consumers treat missing data as "value unavailable".
    pub async fn fetch_result(&self, batch: &Batch, query_id: u32) -> ResultTable {
        let result_id = match batch.handle(query_id) {
            Some(handle) if handle.state == JobState::Succeeded => handle.result_id,
            other => {
                warn!(
                    query_id,
                    state = ?other.map(|h| h.state),
                    "result requested for a query that did not succeed"
                );
                return ResultTable::empty();
            }
        };

        let text = match self.service.fetch_csv(query_id, result_id).await {
            Ok(text) => text,
            Err(e) => {
                warn!(query_id, error = %e, "result download failed");
                return ResultTable::empty();
            }
        };

        match ResultTable::from_csv(&text) {
            Ok(table) => table,
            Err(e) => {
                warn!(query_id, error = %e, "result parsing failed");
                ResultTable::empty()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted transport: canned submit responses, per-job status
    /// sequences, and canned result downloads.
    #[derive(Default)]
    struct MockService {
        submits: Mutex<HashMap<u32, Result<Job, String>>>,
        statuses: Mutex<HashMap<String, VecDeque<Job>>>,
        results: Mutex<HashMap<u32, Result<String, String>>>,
        status_calls: Mutex<HashMap<String, usize>>,
    }

    fn job(id: &str, status: i32, result_id: Option<i64>) -> Job {
        Job {
            id: id.to_string(),
            status,
            query_result_id: result_id,
            error: None,
        }
    }

    impl MockService {
        fn on_submit(&self, query_id: u32, response: Result<Job, &str>) {
            self.submits
                .lock()
                .unwrap()
                .insert(query_id, response.map_err(|e| e.to_string()));
        }

        fn on_status(&self, job_id: &str, sequence: Vec<Job>) {
            self.statuses
                .lock()
                .unwrap()
                .insert(job_id.to_string(), sequence.into());
        }

        fn on_result(&self, query_id: u32, response: Result<&str, &str>) {
            self.results.lock().unwrap().insert(
                query_id,
                response.map(|s| s.to_string()).map_err(|e| e.to_string()),
            );
        }

        fn status_calls(&self, job_id: &str) -> usize {
            *self.status_calls.lock().unwrap().get(job_id).unwrap_or(&0)
        }
    }

    impl QueryService for MockService {
        async fn submit(
            &self,
            query_id: u32,
            _parameters: &BTreeMap<String, ParamValue>,
        ) -> Result<Job> {
            match self.submits.lock().unwrap().get(&query_id) {
                Some(Ok(job)) => Ok(job.clone()),
                Some(Err(e)) => Err(anyhow::anyhow!(e.clone())),
                None => Err(anyhow::anyhow!("unexpected submit for query {query_id}")),
            }
        }

        async fn job_status(&self, job_id: &str) -> Result<Job> {
            *self
                .status_calls
                .lock()
                .unwrap()
                .entry(job_id.to_string())
                .or_insert(0) += 1;
            self.statuses
                .lock()
                .unwrap()
                .get_mut(job_id)
                .and_then(|seq| seq.pop_front())
                .ok_or_else(|| anyhow::anyhow!("no scripted status for job {job_id}"))
        }

        async fn fetch_csv(&self, query_id: u32, _result_id: Option<i64>) -> Result<String> {
            match self.results.lock().unwrap().get(&query_id) {
                Some(Ok(text)) => Ok(text.clone()),
                Some(Err(e)) => Err(anyhow::anyhow!(e.clone())),
                None => Err(anyhow::anyhow!("unexpected fetch for query {query_id}")),
            }
        }
    }

    fn runner(service: MockService) -> QueryRunner<MockService> {
        QueryRunner::new(service).with_poll_interval(Duration::from_millis(1))
    }

    const IN_PROGRESS: i32 = 2;

    #[tokio::test]
    async fn test_run_all_reaches_terminal_states() {
        let service = MockService::default();
        service.on_submit(1, Ok(job("job-1", IN_PROGRESS, None)));
        service.on_status(
            "job-1",
            vec![job("job-1", IN_PROGRESS, None), job("job-1", JOB_STATUS_SUCCESS, Some(77))],
        );
        service.on_submit(2, Ok(job("job-2", IN_PROGRESS, None)));
        service.on_status("job-2", vec![job("job-2", JOB_STATUS_FAILURE, None)]);

        let runner = runner(service);
        let mut batch = Batch::new();
        runner
            .run_all(&mut batch, &[QueryRequest::new(1), QueryRequest::new(2)])
            .await;

        assert_eq!(batch.state(1), Some(JobState::Succeeded));
        assert_eq!(batch.state(2), Some(JobState::Failed));
        assert!(batch.running_ids().is_empty());
        assert_eq!(batch.handle(1).unwrap().result_id, Some(77));
    }

    #[tokio::test]
    async fn test_failed_submission_is_never_polled() {
        let service = MockService::default();
        service.on_submit(5, Err("503 service unavailable"));

        let runner = runner(service);
        let mut batch = Batch::new();
        runner.run_all(&mut batch, &[QueryRequest::new(5)]).await;

        assert_eq!(batch.state(5), Some(JobState::Failed));
        assert_eq!(runner.service.status_calls("job-5"), 0);
    }

    #[tokio::test]
    async fn test_slow_job_is_polled_until_success() {
        let service = MockService::default();
        service.on_submit(9, Ok(job("job-9", IN_PROGRESS, None)));
        let mut sequence: Vec<Job> = (0..5).map(|_| job("job-9", IN_PROGRESS, None)).collect();
        sequence.push(job("job-9", JOB_STATUS_SUCCESS, Some(1)));
        service.on_status("job-9", sequence);

        let runner = runner(service);
        let mut batch = Batch::new();
        runner.run_all(&mut batch, &[QueryRequest::new(9)]).await;

        assert_eq!(batch.state(9), Some(JobState::Succeeded));
        assert_eq!(runner.service.status_calls("job-9"), 6);
    }

    #[tokio::test]
    async fn test_fetch_result_without_success_is_empty() {
        let runner = runner(MockService::default());
        let batch = Batch::new();
        // Never submitted at all.
        assert!(runner.fetch_result(&batch, 42).await.is_empty());
    }

    #[tokio::test]
    async fn test_mixed_batch_end_to_end() {
        let service = MockService::default();
        // A succeeds and has a one-row result.
        service.on_submit(1, Ok(job("job-a", IN_PROGRESS, None)));
        service.on_status("job-a", vec![job("job-a", JOB_STATUS_SUCCESS, Some(10))]);
        service.on_result(1, Ok("city,trips\nSIN,42\n"));
        // B fails at submission.
        service.on_submit(2, Err("400 bad request"));
        // C succeeds but its result download fails.
        service.on_submit(3, Ok(job("job-c", IN_PROGRESS, None)));
        service.on_status("job-c", vec![job("job-c", JOB_STATUS_SUCCESS, Some(11))]);
        service.on_result(3, Err("500 internal error"));

        let runner = runner(service);
        let mut batch = Batch::new();
        let requests: Vec<QueryRequest> = [1, 2, 3]
            .iter()
            .map(|id| QueryRequest::new(*id).param("date", "2024-03-01"))
            .collect();
        runner.run_all(&mut batch, &requests).await;

        let a = runner.fetch_result(&batch, 1).await;
        assert_eq!(a.row_count(), 1);
        assert_eq!(a.number("trips"), Some(42.0));
        assert!(runner.fetch_result(&batch, 2).await.is_empty());
        assert!(runner.fetch_result(&batch, 3).await.is_empty());
    }

    #[test]
    fn test_parameter_serialization() {
        let request = QueryRequest::new(4814)
            .param("region", 8i64)
            .param("date", "2024-03-01")
            .param(
                "Date Range",
                ParamValue::date_range("2024-03-01", "2024-03-31"),
            );
        let value = serde_json::to_value(&request.parameters).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "region": 8,
                "date": "2024-03-01",
                "Date Range": {"start": "2024-03-01", "end": "2024-03-31"},
            })
        );
    }
}
