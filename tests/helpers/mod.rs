//! In-memory collaborators for pipeline tests.
#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::Array4;
use uuid::Uuid;

use pic_analyzer::db::repository::{
    CreatedJob, JobFacets, JobFilter, JobRepository, NewAnalysis, RepoError, SortOrder,
};
use pic_analyzer::models::job::{AnalysisJob, FailureDetail, ImageRef, JobStatus};
use pic_analyzer::services::analysis::AnalysisWorker;
use pic_analyzer::services::artifacts::{ArtifactSource, ArtifactStore, REMOTE_PREFIX};
use pic_analyzer::services::categories::CategoryTable;
use pic_analyzer::services::dispatcher::{Dispatcher, DispatcherSettings, UploadedImage};
use pic_analyzer::services::fetch::{FetchError, ImageSource};
use pic_analyzer::services::inference::{InferenceEngine, InferenceError, ModelBackend};
use pic_analyzer::services::queue::{
    Delivery, QueueError, QueueName, TaskMessage, TaskQueue,
};
use pic_analyzer::services::registry::{
    self, LabelCatalog, LabelIndex, LabelSet, ModelKind, ModelSpec,
};
use pic_analyzer::services::storage::{ObjectStorage, StorageError};
use pic_analyzer::services::worker::Consumer;

pub const IMAGENET_LABELS: [&str; 4] = ["vestment", "academic_gown", "tabby", "laptop"];
pub const HUMAN_LABELS: [&str; 3] = ["person", "tabby", "laptop"];
pub const FIVE_CLASS_LABELS: [&str; 5] = ["animal", "sports", "machine", "landscape", "human"];

pub const TEST_USER: i64 = 42;

/// PNG bytes of a small solid image.
pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([200, 120, 40])));
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode test png");
    out.into_inner()
}

pub fn upload(name: &str) -> UploadedImage {
    UploadedImage {
        file_name: name.to_string(),
        bytes: png_bytes(16, 12),
    }
}

pub fn corrupt_upload(name: &str) -> UploadedImage {
    UploadedImage {
        file_name: name.to_string(),
        bytes: b"definitely not an image".to_vec(),
    }
}

pub fn catalog() -> LabelCatalog {
    LabelCatalog::new()
        .with(LabelSet::ImageNet, LabelIndex::from_labels(IMAGENET_LABELS))
        .with(LabelSet::ImageNetHuman, LabelIndex::from_labels(HUMAN_LABELS))
        .with(LabelSet::FiveClass, LabelIndex::from_labels(FIVE_CLASS_LABELS))
}

pub fn num_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0)
}

// ---------------------------------------------------------------------------
// Repository

#[derive(Default)]
pub struct MemoryJobRepository {
    /// Insertion order doubles as submission order.
    jobs: Mutex<Vec<AnalysisJob>>,
    fail_terminal_saves: AtomicBool,
}

impl MemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every save of a Succeeded/Failed job fail with a database error.
    pub fn fail_terminal_saves(&self, fail: bool) {
        self.fail_terminal_saves.store(fail, Ordering::SeqCst);
    }

    pub fn all(&self) -> Vec<AnalysisJob> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn job(&self, id: Uuid) -> AnalysisJob {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .find(|job| job.id == id)
            .cloned()
            .expect("job exists")
    }

    /// Simulate a concurrent writer touching the job.
    pub fn bump_version(&self, id: Uuid) {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(job) = jobs.iter_mut().find(|job| job.id == id) {
            job.version += 1;
        }
    }

    /// Overwrite a stored job as-is.
    pub fn put(&self, job: AnalysisJob) {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.iter_mut().find(|stored| stored.id == job.id) {
            Some(stored) => *stored = job,
            None => jobs.push(job),
        }
    }
}

#[async_trait]
impl JobRepository for MemoryJobRepository {
    async fn create(&self, new: NewAnalysis) -> Result<CreatedJob, RepoError> {
        let mut jobs = self.jobs.lock().unwrap();
        if let Some(existing) = jobs.iter().find(|job| job.image.key == new.image_key) {
            return Ok(CreatedJob {
                job: existing.clone(),
                inserted: false,
            });
        }

        let job = AnalysisJob::new(
            Uuid::new_v4(),
            ImageRef {
                image_id: Uuid::new_v4(),
                key: new.image_key,
            },
            new.user_id,
            Utc::now(),
            new.model_name,
            new.use_category,
        );
        jobs.push(job.clone());
        Ok(CreatedJob {
            job,
            inserted: true,
        })
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<AnalysisJob>, RepoError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .find(|job| job.id == job_id)
            .cloned())
    }

    async fn save(&self, job: &mut AnalysisJob) -> Result<(), RepoError> {
        if job.status.is_terminal() && self.fail_terminal_saves.load(Ordering::SeqCst) {
            return Err(RepoError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut jobs = self.jobs.lock().unwrap();
        let stored = jobs
            .iter_mut()
            .find(|stored| stored.id == job.id)
            .ok_or(RepoError::Conflict(job.id))?;
        if stored.version != job.version {
            return Err(RepoError::Conflict(job.id));
        }

        job.version += 1;
        *stored = job.clone();
        Ok(())
    }

    async fn mark_ended(
        &self,
        job_id: Uuid,
        expected_version: i64,
        failure: &FailureDetail,
        at: DateTime<Utc>,
    ) -> Result<(), RepoError> {
        let mut jobs = self.jobs.lock().unwrap();
        let stored = jobs
            .iter_mut()
            .find(|stored| stored.id == job_id && stored.version == expected_version)
            .ok_or(RepoError::Conflict(job_id))?;

        stored.status = JobStatus::Failed;
        stored.label = None;
        stored.reliability = None;
        stored.top_predictions = None;
        stored.error_kind = Some(failure.kind.clone());
        stored.error_detail = Some(failure.detail.clone());
        stored.ended_at = Some(at);
        stored.version += 1;
        Ok(())
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<AnalysisJob>, RepoError> {
        let mut jobs: Vec<AnalysisJob> = self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        if filter.sort == SortOrder::Desc {
            jobs.reverse();
        }
        Ok(jobs)
    }

    async fn pending_order(&self) -> Result<Vec<Uuid>, RepoError> {
        Ok(self
            .jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|job| job.status == JobStatus::Pending)
            .map(|job| job.id)
            .collect())
    }

    async fn facets(&self, user_id: Option<i64>) -> Result<JobFacets, RepoError> {
        let jobs = self.jobs.lock().unwrap();
        let scoped: Vec<&AnalysisJob> = jobs
            .iter()
            .filter(|job| user_id.is_none_or(|id| job.user_id == id))
            .collect();

        let distinct = |values: Vec<String>| {
            let mut values = values;
            values.sort();
            values.dedup();
            values
        };

        Ok(JobFacets {
            labels: distinct(scoped.iter().filter_map(|j| j.label.clone()).collect()),
            models: distinct(scoped.iter().map(|j| j.model_name.clone()).collect()),
            error_kinds: distinct(scoped.iter().filter_map(|j| j.error_kind.clone()).collect()),
        })
    }

    async fn delete_image(&self, image_id: Uuid) -> Result<Option<ImageRef>, RepoError> {
        let mut jobs = self.jobs.lock().unwrap();
        let position = jobs.iter().position(|job| job.image.image_id == image_id);
        Ok(position.map(|index| jobs.remove(index).image))
    }

    async fn health_check(&self) -> Result<(), RepoError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Queue

/// Mirrors the Redis list protocol: enqueue at the head, receive from the
/// tail into a processing list, ack removes from the processing list.
#[derive(Default)]
pub struct MemoryQueue {
    ready: Mutex<HashMap<QueueName, VecDeque<String>>>,
    processing: Mutex<HashMap<QueueName, Vec<String>>>,
    unavailable: Mutex<Option<QueueName>>,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every enqueue onto `queue` fail, or none with `None`.
    pub fn fail_enqueue(&self, queue: Option<QueueName>) {
        *self.unavailable.lock().unwrap() = queue;
    }

    pub fn push_raw(&self, queue: QueueName, payload: &str) {
        self.ready
            .lock()
            .unwrap()
            .entry(queue)
            .or_default()
            .push_front(payload.to_string());
    }

    /// Messages waiting on `queue`, oldest first.
    pub fn pending(&self, queue: QueueName) -> Vec<TaskMessage> {
        self.ready
            .lock()
            .unwrap()
            .get(&queue)
            .map(|items| {
                items
                    .iter()
                    .rev()
                    .filter_map(|payload| serde_json::from_str(payload).ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn in_flight(&self, queue: QueueName) -> usize {
        self.processing
            .lock()
            .unwrap()
            .get(&queue)
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, message: &TaskMessage) -> Result<(), QueueError> {
        if *self.unavailable.lock().unwrap() == Some(message.queue()) {
            return Err(QueueError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        let payload = serde_json::to_string(message).map_err(QueueError::Serialize)?;
        self.push_raw(message.queue(), &payload);
        Ok(())
    }

    async fn receive(
        &self,
        queue: QueueName,
        _timeout: Duration,
    ) -> Result<Option<Delivery>, QueueError> {
        let Some(payload) = self
            .ready
            .lock()
            .unwrap()
            .get_mut(&queue)
            .and_then(VecDeque::pop_back)
        else {
            return Ok(None);
        };

        match serde_json::from_str::<TaskMessage>(&payload) {
            Ok(message) => {
                self.processing
                    .lock()
                    .unwrap()
                    .entry(queue)
                    .or_default()
                    .push(payload.clone());
                Ok(Some(Delivery {
                    queue,
                    message,
                    payload,
                }))
            }
            Err(e) => Err(QueueError::Malformed {
                queue,
                reason: e.to_string(),
            }),
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut processing = self.processing.lock().unwrap();
        if let Some(items) = processing.get_mut(&delivery.queue) {
            if let Some(index) = items.iter().position(|p| *p == delivery.payload) {
                items.remove(index);
            }
        }
        Ok(())
    }

    async fn requeue_in_flight(&self, queue: QueueName) -> Result<u64, QueueError> {
        let items = self
            .processing
            .lock()
            .unwrap()
            .remove(&queue)
            .unwrap_or_default();
        let moved = items.len() as u64;
        let mut ready = self.ready.lock().unwrap();
        let list = ready.entry(queue).or_default();
        for payload in items {
            list.push_back(payload);
        }
        Ok(moved)
    }

    async fn depth(&self, queue: QueueName) -> Result<u64, QueueError> {
        Ok(self
            .ready
            .lock()
            .unwrap()
            .get(&queue)
            .map_or(0, |items| items.len() as u64))
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Storage

const SIGNED_SCHEME: &str = "memory://";

#[derive(Default)]
pub struct MemoryStorage {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    fail_puts: AtomicBool,
    downloads: AtomicUsize,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Storage seeded with a stand-in file for every registry artifact.
    pub fn with_artifacts() -> Self {
        let storage = Self::new();
        for name in registry::all_artifacts() {
            storage.insert(&format!("{}/{}", REMOTE_PREFIX, name), b"artifact".to_vec());
        }
        storage
    }

    pub fn insert(&self, key: &str, data: Vec<u8>) {
        self.objects.lock().unwrap().insert(key.to_string(), data);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.objects.lock().unwrap().contains_key(key)
    }

    pub fn remove(&self, key: &str) {
        self.objects.lock().unwrap().remove(key);
    }

    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStorage for MemoryStorage {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(StorageError::Status {
                operation: "put",
                key: key.to_string(),
                status: 503,
            });
        }
        self.insert(key, data.to_vec());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }

    async fn signed_url(&self, key: &str, ttl_secs: u64) -> Result<String, StorageError> {
        Ok(format!("{}{}?ttl={}", SIGNED_SCHEME, key, ttl_secs))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        self.objects
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::NotFound(key.to_string()))
    }
}

#[async_trait]
impl ArtifactSource for MemoryStorage {
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        self.get(key).await
    }
}

/// Resolves signed URLs handed out by [`MemoryStorage`] back to its objects.
pub struct StorageImageSource {
    storage: Arc<MemoryStorage>,
}

impl StorageImageSource {
    pub fn new(storage: Arc<MemoryStorage>) -> Self {
        Self { storage }
    }
}

#[async_trait]
impl ImageSource for StorageImageSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>, FetchError> {
        let key = url
            .strip_prefix(SIGNED_SCHEME)
            .and_then(|rest| rest.split('?').next())
            .ok_or(FetchError::Status(400))?;
        let bytes = ObjectStorage::get(self.storage.as_ref(), key)
            .await
            .map_err(|_| FetchError::Status(404))?;
        if bytes.is_empty() {
            return Err(FetchError::Empty);
        }
        Ok(bytes)
    }
}

// ---------------------------------------------------------------------------
// Inference

type PredictHook = Box<dyn Fn() + Send + Sync>;

/// Backend with a fixed probability vector per model.
#[derive(Default)]
pub struct ScriptedBackend {
    outputs: Mutex<HashMap<ModelKind, Vec<f32>>>,
    calls: Mutex<Vec<ModelKind>>,
    hook: Mutex<Option<PredictHook>>,
}

impl ScriptedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, kind: ModelKind, output: Vec<f32>) -> &Self {
        self.outputs.lock().unwrap().insert(kind, output);
        self
    }

    /// Run `hook` inside every predict call, while the job is Running.
    pub fn on_predict(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> Vec<ModelKind> {
        self.calls.lock().unwrap().clone()
    }
}

impl ModelBackend for ScriptedBackend {
    fn predict(&self, spec: &ModelSpec, _input: &Array4<f32>) -> Result<Vec<f32>, InferenceError> {
        self.calls.lock().unwrap().push(spec.kind);
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook();
        }
        self.outputs
            .lock()
            .unwrap()
            .get(&spec.kind)
            .cloned()
            .ok_or_else(|| InferenceError::Runtime(format!("no output scripted for {}", spec.kind)))
    }
}

// ---------------------------------------------------------------------------
// Wiring

pub const TOP_K: usize = 30;
pub const SIGNED_URL_TTL_SECS: u64 = 86_400;

/// Dispatcher, worker and consumer wired to in-memory collaborators.
pub struct Pipeline {
    pub jobs: Arc<MemoryJobRepository>,
    pub storage: Arc<MemoryStorage>,
    pub queue: Arc<MemoryQueue>,
    pub backend: Arc<ScriptedBackend>,
    pub dispatcher: Arc<Dispatcher>,
    pub consumer: Consumer,
    pub upload_dir: tempfile::TempDir,
    pub model_dir: tempfile::TempDir,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::with_max_images(3)
    }

    pub fn with_max_images(max_images: usize) -> Self {
        let jobs = Arc::new(MemoryJobRepository::new());
        let storage = Arc::new(MemoryStorage::with_artifacts());
        let queue = Arc::new(MemoryQueue::new());
        let backend = Arc::new(ScriptedBackend::new());
        let upload_dir = tempfile::tempdir().expect("upload dir");
        let model_dir = tempfile::tempdir().expect("model dir");

        let dispatcher = Arc::new(Dispatcher::new(
            jobs.clone(),
            storage.clone(),
            queue.clone(),
            DispatcherSettings {
                max_images,
                signed_url_ttl_secs: SIGNED_URL_TTL_SECS,
                upload_tmp_dir: upload_dir.path().to_path_buf(),
            },
        ));

        let engine = InferenceEngine::new(
            Arc::new(catalog()),
            CategoryTable::builtin().expect("builtin categories"),
            backend.clone(),
        );
        let artifacts = ArtifactStore::new(storage.clone(), model_dir.path());
        let analysis = AnalysisWorker::new(
            jobs.clone(),
            Arc::new(StorageImageSource::new(storage.clone())),
            Arc::new(artifacts),
            Arc::new(engine),
            TOP_K,
        );

        let consumer = Consumer::new(queue.clone(), dispatcher.clone(), Arc::new(analysis));

        Self {
            jobs,
            storage,
            queue,
            backend,
            dispatcher,
            consumer,
            upload_dir,
            model_dir,
        }
    }

    /// Process messages on `queue` until it is empty. Returns how many
    /// were handled.
    pub async fn drain(&self, queue: QueueName) -> usize {
        let mut handled = 0;
        while self
            .consumer
            .process_next(queue, Duration::ZERO)
            .await
            .expect("queue error")
        {
            handled += 1;
        }
        handled
    }

    /// Submit, ingest and return the created jobs.
    pub async fn ingest(&self, images: Vec<UploadedImage>, model: &str, use_category: bool) -> Vec<AnalysisJob> {
        self.dispatcher
            .submit(TEST_USER, images, model, use_category)
            .await
            .expect("submission accepted");
        self.drain(QueueName::Ingest).await;
        self.jobs.all()
    }
}

// ---------------------------------------------------------------------------
// HTTP (end-to-end)

/// Bearer token for `user_id`, signed with `JWT_SECRET` from the environment.
pub fn bearer_token(user_id: i64, is_staff: bool) -> String {
    let secret = std::env::var("JWT_SECRET").expect("JWT_SECRET must be set for e2e tests");
    let claims = pic_analyzer::auth::Claims {
        sub: user_id.to_string(),
        is_staff,
        exp: (Utc::now().timestamp() + 3600) as u64,
    };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("sign token")
}

/// Response from POST /api/v1/analyses
#[derive(Debug, serde::Deserialize)]
pub struct SubmitBody {
    pub accepted: usize,
    pub skipped: usize,
    pub status: String,
}

/// One entry of GET /api/v1/analyses
#[derive(Debug, Clone, serde::Deserialize)]
pub struct AnalysisBody {
    pub id: Uuid,
    pub status: String,
    pub label: Option<String>,
    pub reliability: Option<f64>,
    pub error_kind: Option<String>,
    pub waiting_position: Option<usize>,
}

#[derive(Debug, serde::Deserialize)]
pub struct ListBody {
    pub analyses: Vec<AnalysisBody>,
}

/// Upload images to the submission endpoint.
pub async fn submit_images(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    images: Vec<UploadedImage>,
    model: &str,
    use_category: bool,
) -> Result<SubmitBody, Box<dyn std::error::Error + Send + Sync>> {
    let mut form = reqwest::multipart::Form::new()
        .text("model", model.to_string())
        .text("use_category", if use_category { "on" } else { "off" }.to_string());
    for image in images {
        form = form.part(
            "images",
            reqwest::multipart::Part::bytes(image.bytes)
                .file_name(image.file_name)
                .mime_str("image/png")?,
        );
    }

    let response = client
        .post(format!("{}/api/v1/analyses", base_url))
        .bearer_auth(token)
        .multipart(form)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await?;
        return Err(format!("Upload failed with status {}: {}", status, error_text).into());
    }

    Ok(response.json::<SubmitBody>().await?)
}

pub async fn list_analyses(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
) -> Result<Vec<AnalysisBody>, Box<dyn std::error::Error + Send + Sync>> {
    let response = client
        .get(format!("{}/api/v1/analyses", base_url))
        .bearer_auth(token)
        .send()
        .await?;

    if !response.status().is_success() {
        let error_text = response.text().await?;
        return Err(format!("Listing failed: {}", error_text).into());
    }

    Ok(response.json::<ListBody>().await?.analyses)
}

/// Poll the caller's listing until `expected` jobs exist and all of them
/// are finished.
pub async fn wait_for_finished(
    client: &reqwest::Client,
    base_url: &str,
    token: &str,
    expected: usize,
    timeout_secs: u64,
) -> Result<Vec<AnalysisBody>, Box<dyn std::error::Error + Send + Sync>> {
    let max_attempts = timeout_secs * 2; // Poll every 500ms

    for attempt in 0..max_attempts {
        let analyses = list_analyses(client, base_url, token).await?;
        let finished = analyses
            .iter()
            .filter(|a| a.status == "succeeded" || a.status == "failed")
            .count();
        if analyses.len() >= expected && finished == analyses.len() {
            return Ok(analyses);
        }
        if attempt % 10 == 0 && attempt > 0 {
            println!("  ... still waiting (attempt {}/{})", attempt, max_attempts);
        }
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    Err(format!("Jobs did not finish within {} seconds", timeout_secs).into())
}
