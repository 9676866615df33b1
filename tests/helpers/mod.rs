//! Shared doubles for the pipeline integration tests.
//!
//! Everything here is in-memory: stub provider adapters, an object store that
//! records what happened to each key, a queue with explicit redelivery and a
//! notification sink that can be told to fail.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use photo_pipeline::models::batch::Batch;
use photo_pipeline::models::job::Job;
use photo_pipeline::models::message::{NotificationEvent, ObjectKey};
use photo_pipeline::services::job_store::{InMemoryJobStore, JobStore};
use photo_pipeline::services::notification::{
    NotificationDispatcher, NotificationSink, NotifyError, NotifySettings,
};
use photo_pipeline::services::orchestrator::{JobOrchestrator, OrchestratorSettings};
use photo_pipeline::services::provider::circuit_breaker::CircuitBreakerConfig;
use photo_pipeline::services::provider::retry::BackoffPolicy;
use photo_pipeline::services::provider::{
    GatewaySettings, ProviderAdapter, ProviderError, ProviderErrorKind, ProviderGateway,
    ProviderKind, ProviderRequest, ProviderResult,
};
use photo_pipeline::services::queue::{MessageSource, QueueError, ReceivedMessage};
use photo_pipeline::services::storage::{ObjectStore, StorageError};
use photo_pipeline::services::worker::{QueueWorker, WorkerSettings};

// ── Provider ────────────────────────────────────────────────────

type Outcome = Result<ProviderResult, ProviderError>;

/// Adapter that plays back a script of outcomes, then repeats a fallback.
pub struct StubAdapter {
    script: Mutex<VecDeque<Outcome>>,
    fallback: Outcome,
    delay: Option<Duration>,
    /// Fail with this kind whenever the image URL contains the marker.
    fail_marker: Option<(String, ProviderErrorKind)>,
    calls: AtomicU32,
}

pub fn ok_result(result_ref: &str) -> Outcome {
    Ok(ProviderResult {
        result_ref: result_ref.to_string(),
        metadata: serde_json::json!({ "analysis": "a dog on a beach" }),
    })
}

pub fn provider_error(kind: ProviderErrorKind) -> Outcome {
    Err(ProviderError::new(kind, format!("stubbed {}", kind)))
}

impl StubAdapter {
    pub fn scripted(script: Vec<Outcome>, fallback: Outcome) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into()),
            fallback,
            delay: None,
            fail_marker: None,
            calls: AtomicU32::new(0),
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::scripted(Vec::new(), ok_result("result-1"))
    }

    pub fn failing(kind: ProviderErrorKind) -> Arc<Self> {
        Self::scripted(Vec::new(), provider_error(kind))
    }

    /// Succeeds, but only after `delay`.
    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: ok_result("slow-result"),
            delay: Some(delay),
            fail_marker: None,
            calls: AtomicU32::new(0),
        })
    }

    /// Succeeds unless the photo's URL contains `marker`.
    pub fn failing_when(marker: &str, kind: ProviderErrorKind) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            fallback: ok_result("result-1"),
            delay: None,
            fail_marker: Some((marker.to_string(), kind)),
            calls: AtomicU32::new(0),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProviderAdapter for StubAdapter {
    async fn submit(&self, request: &ProviderRequest, _timeout: Duration) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some((marker, kind)) = &self.fail_marker {
            if request.image_ref.contains(marker.as_str()) {
                return provider_error(*kind);
            }
        }
        let next = self.script.lock().pop_front();
        next.unwrap_or_else(|| self.fallback.clone())
    }
}

/// Gateway settings that keep tests fast: tiny backoff, short timeout.
pub fn fast_gateway_settings() -> GatewaySettings {
    GatewaySettings {
        timeout: Duration::from_millis(200),
        max_attempts: 3,
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            multiplier: 2.0,
            max: Duration::from_millis(5),
            jitter: 0.2,
        },
        breaker: CircuitBreakerConfig {
            window_size: 10,
            failure_rate_threshold: 0.5,
            cooldown: Duration::from_secs(60),
        },
    }
}

// ── Object store ────────────────────────────────────────────────

#[derive(Default)]
struct Objects {
    keys: HashSet<String>,
    finalize_calls: u32,
    cleanup_calls: u32,
    transient_failures: u32,
}

/// Object store backed by a set of keys, recording every lifecycle call.
#[derive(Default)]
pub struct RecordingObjectStore {
    inner: Mutex<Objects>,
}

impl RecordingObjectStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put(&self, key: &str) {
        self.inner.lock().keys.insert(key.to_string());
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.lock().keys.contains(key)
    }

    pub fn finalize_calls(&self) -> u32 {
        self.inner.lock().finalize_calls
    }

    pub fn cleanup_calls(&self) -> u32 {
        self.inner.lock().cleanup_calls
    }

    /// Make the next `n` finalize calls fail with a retryable error.
    pub fn fail_next_finalizes(&self, n: u32) {
        self.inner.lock().transient_failures = n;
    }
}

#[async_trait]
impl ObjectStore for RecordingObjectStore {
    async fn finalize(&self, key: &ObjectKey) -> Result<String, StorageError> {
        let mut inner = self.inner.lock();
        inner.finalize_calls += 1;
        if inner.transient_failures > 0 {
            inner.transient_failures -= 1;
            return Err(StorageError::S3(s3::error::S3Error::HttpFailWithBody(
                503,
                "slow down".to_string(),
            )));
        }

        let (temp, fin) = (key.temp_key(), key.final_key());
        if inner.keys.remove(&temp) {
            inner.keys.insert(fin.clone());
            return Ok(fin);
        }
        if inner.keys.contains(&fin) {
            return Ok(fin);
        }
        Err(StorageError::MissingObject(temp))
    }

    async fn cleanup(&self, key: &ObjectKey) -> Result<(), StorageError> {
        let mut inner = self.inner.lock();
        inner.cleanup_calls += 1;
        inner.keys.remove(&key.temp_key());
        inner.keys.remove(&key.final_key());
        Ok(())
    }

    async fn presign_source(&self, key: &ObjectKey, _ttl: Duration) -> Result<String, StorageError> {
        Ok(format!("https://r2.test/{}", key.temp_key()))
    }

    async fn presign_download(
        &self,
        job_id: &str,
        _ttl: Duration,
    ) -> Result<Option<String>, StorageError> {
        let prefix = format!("final/{}/", job_id);
        Ok(self
            .inner
            .lock()
            .keys
            .iter()
            .find(|k| k.starts_with(&prefix))
            .map(|k| format!("https://r2.test/{}", k)))
    }
}

// ── Notifications ───────────────────────────────────────────────

/// Sink that records delivered events and fails the first `failures` publishes.
pub struct RecordingSink {
    events: Arc<Mutex<Vec<NotificationEvent>>>,
    failures: AtomicU32,
}

impl RecordingSink {
    pub fn new(failures: u32) -> (Self, Arc<Mutex<Vec<NotificationEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: events.clone(),
                failures: AtomicU32::new(failures),
            },
            events,
        )
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, _key: &str, event: &NotificationEvent) -> Result<bool, NotifyError> {
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(NotifyError::Unavailable("sink down".to_string()));
        }
        self.events.lock().push(event.clone());
        Ok(true)
    }
}

// ── Queue ───────────────────────────────────────────────────────

#[derive(Default)]
struct QueueState {
    next_id: u64,
    bodies: HashMap<String, String>,
    pending: VecDeque<String>,
    in_flight: Vec<String>,
    deliveries: HashMap<String, u32>,
    acked: Vec<String>,
    dead: Vec<String>,
}

/// Queue whose visibility timeout expires whenever the test says so.
/// Like the Redis queue, every push gets its own id.
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
    max_deliveries: u32,
}

impl InMemoryQueue {
    pub fn new(max_deliveries: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState::default()),
            max_deliveries,
        })
    }

    pub fn push(&self, payload: impl Into<String>) {
        let mut state = self.state.lock();
        state.next_id += 1;
        let id = format!("m{}", state.next_id);
        state.bodies.insert(id.clone(), payload.into());
        state.pending.push_back(id);
    }

    /// Payloads of acked messages, in ack order.
    pub fn acked(&self) -> Vec<String> {
        self.state.lock().acked.clone()
    }

    /// Payloads of delivered, un-acked messages.
    pub fn in_flight(&self) -> Vec<String> {
        let state = self.state.lock();
        state.in_flight.iter().map(|id| state.bodies[id].clone()).collect()
    }

    pub fn dead_letters(&self) -> Vec<String> {
        self.state.lock().dead.clone()
    }
}

#[async_trait]
impl MessageSource for InMemoryQueue {
    async fn receive(&self, max: usize) -> Result<Vec<ReceivedMessage>, QueueError> {
        let mut state = self.state.lock();
        let mut out = Vec::new();
        while out.len() < max {
            let Some(id) = state.pending.pop_front() else { break };
            let count = state.deliveries.entry(id.clone()).or_insert(0);
            *count += 1;
            let delivery_count = *count;
            state.in_flight.push(id.clone());
            out.push(ReceivedMessage {
                payload: state.bodies[&id].clone(),
                id,
                delivery_count,
            });
        }
        Ok(out)
    }

    async fn ack(&self, message: &ReceivedMessage) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.in_flight.retain(|id| id != &message.id);
        state.deliveries.remove(&message.id);
        if let Some(payload) = state.bodies.remove(&message.id) {
            state.acked.push(payload);
        }
        Ok(())
    }

    /// Every un-acked message is treated as expired.
    async fn reclaim_expired(&self) -> Result<u64, QueueError> {
        let mut state = self.state.lock();
        let expired: Vec<String> = state.in_flight.drain(..).collect();
        let moved = expired.len() as u64;
        for id in expired {
            let deliveries = state.deliveries.get(&id).copied().unwrap_or(0);
            if deliveries >= self.max_deliveries {
                state.deliveries.remove(&id);
                if let Some(payload) = state.bodies.remove(&id) {
                    state.dead.push(payload);
                }
            } else {
                state.pending.push_back(id);
            }
        }
        Ok(moved)
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state.lock().pending.len() as u64)
    }
}

// ── Harness ─────────────────────────────────────────────────────

pub fn upload_payload(job_id: &str, batch_id: Option<&str>, filename: &str) -> String {
    let mut body = serde_json::json!({
        "jobId": job_id,
        "objectKey": format!("temp/{}/{}", job_id, filename),
        "eventType": "object-uploaded",
    });
    if let Some(batch_id) = batch_id {
        body["batchId"] = serde_json::Value::String(batch_id.to_string());
    }
    body.to_string()
}

/// A full orchestrator over in-memory collaborators.
pub struct Harness {
    pub store: Arc<InMemoryJobStore>,
    pub objects: Arc<RecordingObjectStore>,
    pub adapter: Arc<StubAdapter>,
    pub gateway: Arc<ProviderGateway>,
    pub notifications: Arc<Mutex<Vec<NotificationEvent>>>,
    pub orchestrator: Arc<JobOrchestrator>,
}

pub struct HarnessBuilder {
    adapter: Arc<StubAdapter>,
    max_attempts: u32,
    gateway: GatewaySettings,
    sink_failures: u32,
}

impl Default for HarnessBuilder {
    fn default() -> Self {
        Self {
            adapter: StubAdapter::succeeding(),
            max_attempts: 3,
            gateway: fast_gateway_settings(),
            sink_failures: 0,
        }
    }
}

impl HarnessBuilder {
    pub fn adapter(mut self, adapter: Arc<StubAdapter>) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn gateway(mut self, gateway: GatewaySettings) -> Self {
        self.gateway = gateway;
        self
    }

    pub fn sink_failures(mut self, failures: u32) -> Self {
        self.sink_failures = failures;
        self
    }

    pub fn build(self) -> Harness {
        let store = InMemoryJobStore::arc();
        let objects = RecordingObjectStore::new();
        let gateway = Arc::new(
            ProviderGateway::new(self.gateway).with_adapter(ProviderKind::WorkersAi, self.adapter.clone()),
        );
        let (sink, notifications) = RecordingSink::new(self.sink_failures);
        let notifier = Arc::new(NotificationDispatcher::new(
            Box::new(sink),
            NotifySettings {
                retry_delay: Duration::from_millis(1),
                ..NotifySettings::default()
            },
        ));
        let settings = OrchestratorSettings {
            max_attempts: self.max_attempts,
            storage_retry_delay: Duration::from_millis(1),
            ..OrchestratorSettings::default()
        };
        let orchestrator = Arc::new(JobOrchestrator::new(
            store.clone(),
            objects.clone(),
            gateway.clone(),
            notifier,
            settings,
        ));

        Harness {
            store,
            objects,
            adapter: self.adapter,
            gateway,
            notifications,
            orchestrator,
        }
    }
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Create a PENDING job, as the presign flow would, and drop its photo in `temp/`.
    pub async fn presign(&self, job_id: &str, batch_id: Option<&str>, filename: &str) -> Job {
        let job = Job::new(job_id, batch_id.map(str::to_string));
        self.store.insert_job(&job).await.expect("insert job");
        self.objects.put(&format!("temp/{}/{}", job_id, filename));
        job
    }

    pub async fn presign_batch(&self, batch_id: &str, job_ids: &[&str]) {
        self.store
            .insert_batch(&Batch::new(batch_id, job_ids.len() as u32))
            .await
            .expect("insert batch");
        for job_id in job_ids {
            self.presign(job_id, Some(batch_id), "photo.jpg").await;
        }
    }

    pub async fn job(&self, job_id: &str) -> Job {
        self.store
            .get_job(job_id)
            .await
            .expect("get job")
            .expect("job exists")
    }

    pub async fn batch(&self, batch_id: &str) -> Batch {
        self.store
            .get_batch(batch_id)
            .await
            .expect("get batch")
            .expect("batch exists")
    }

    pub fn notification_keys(&self) -> Vec<String> {
        self.notifications
            .lock()
            .iter()
            .map(NotificationEvent::idempotency_key)
            .collect()
    }

    pub fn worker(&self, queue: Arc<InMemoryQueue>) -> QueueWorker {
        QueueWorker::new(
            queue,
            self.orchestrator.clone(),
            WorkerSettings {
                prefetch: 4,
                poll_interval: Duration::from_millis(5),
                conflict_retries: 3,
            },
        )
    }
}
