//! Stage pipeline behaviour against in-memory collaborators.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mockall::mock;

use vgen_models::{
    GenerationConfig, JobId, JobPatch, JobRecord, JobStatus, ProgressStatus, Scene, Script,
    SpeechAsset, Stage,
};
use vgen_providers::{ProviderResult, ScriptGenerator, SpeechSynthesizer};
use vgen_queue::{ProgressBus, RateLimitedQueue};
use vgen_storage::{MemoryObjectStorage, ObjectStorage};
use vgen_store::{JobRepository, MemoryStore};
use vgen_worker::{
    PipelineConfig, Providers, StageExecutor, StagePipeline, StageResult, StageTable, WorkerConfig,
    WorkerError,
};

use common::{config, drain, image_url, prompt, test_queue_config, FakeProviders};

mock! {
    pub Script {}

    #[async_trait]
    impl ScriptGenerator for Script {
        async fn generate_script(&self, config: &GenerationConfig) -> ProviderResult<Vec<Scene>>;
    }
}

mock! {
    pub Speech {}

    #[async_trait]
    impl SpeechSynthesizer for Speech {
        async fn synthesize(&self, text: &str) -> ProviderResult<String>;
    }
}

struct Harness {
    pipeline: StagePipeline,
    jobs: JobRepository,
    bus: ProgressBus,
    storage: Arc<MemoryObjectStorage>,
}

fn harness(providers: Providers, worker: WorkerConfig, override_stage: Option<Box<dyn StageExecutor>>) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let storage = Arc::new(MemoryObjectStorage::new());
    let bus = ProgressBus::new();
    let jobs = JobRepository::new(store);
    let queue = Arc::new(RateLimitedQueue::new("images", test_queue_config()).with_progress_bus(bus.clone()));

    let mut stages = StageTable::new(providers, storage.clone(), queue, bus.clone(), &worker);
    if let Some(executor) = override_stage {
        stages = stages.with_executor(executor);
    }
    let pipeline = StagePipeline::new(jobs.clone(), bus.clone(), stages, PipelineConfig::from(&worker));

    Harness {
        pipeline,
        jobs,
        bus,
        storage,
    }
}

fn fake_harness(fake: &Arc<FakeProviders>, worker: WorkerConfig) -> Harness {
    harness(Providers::from_client(fake.clone()), worker, None)
}

fn job_id() -> JobId {
    JobId::for_request(&config(), "u1")
}

#[tokio::test]
async fn test_full_run_produces_every_artifact() {
    let fake = Arc::new(FakeProviders::new(3));
    let h = fake_harness(&fake, WorkerConfig::default());
    let mut events = h.bus.subscribe(&job_id()).await;

    let record = h.pipeline.run(&job_id(), &config(), "u1").await.unwrap();

    assert_eq!(record.status, JobStatus::Complete);
    assert_eq!(record.images.len(), record.scene_count());
    assert_eq!(record.images, (0..3).map(image_url).collect::<Vec<_>>());
    assert!(record.speech.is_some());
    assert!(record.captions.is_some());
    assert!(record.error.is_none());
    assert!(h.storage.contains(&format!("speech/{}.mp3", job_id())));
    assert!(h.storage.contains(&format!("captions/{}.json", job_id())));

    // One success event per stage, in stage order
    let successes: Vec<String> = drain(&mut events)
        .into_iter()
        .filter(|e| e.status == ProgressStatus::Success)
        .map(|e| e.stage)
        .collect();
    assert_eq!(successes, vec!["SCRIPT", "SPEECH", "IMAGES", "CAPTIONS"]);
}

#[tokio::test]
async fn test_resume_skips_completed_stages() {
    let fake = Arc::new(FakeProviders::new(2));
    let mut script = MockScript::new();
    script.expect_generate_script().never();
    let mut speech = MockSpeech::new();
    speech.expect_synthesize().never();

    let providers = Providers {
        script: Arc::new(script),
        speech: Arc::new(speech),
        images: fake.clone(),
        captions: fake.clone(),
    };
    let h = harness(providers, WorkerConfig::default(), None);

    let id = job_id();
    h.jobs.create_if_absent(&id, "u1", &config()).await.unwrap();
    let scenes = (0..2)
        .map(|i| Scene {
            image_prompt: prompt(i),
            text_content: format!("Scene {}.", i),
        })
        .collect();
    h.storage
        .put("speech/a.mp3", b"ID3".to_vec(), "audio/mpeg")
        .await
        .unwrap();
    h.jobs
        .save(
            &id,
            JobPatch::advance(JobStatus::SpeechReady)
                .with_script(Script::new(scenes))
                .with_speech(SpeechAsset {
                    key: "speech/a.mp3".into(),
                    url: "memory://speech/a.mp3".into(),
                    signed_url: "memory://speech/a.mp3?expires=1".into(),
                }),
        )
        .await
        .unwrap();

    let record = h.pipeline.run(&id, &config(), "u1").await.unwrap();

    assert_eq!(record.status, JobStatus::Complete);
    assert_eq!(FakeProviders::calls(&fake.image_calls), 2);
    assert_eq!(FakeProviders::calls(&fake.caption_calls), 1);

    // Captions get a freshly signed audio URL, not the stored one
    let urls = fake.caption_audio_urls.lock().clone();
    assert_eq!(urls.len(), 1);
    assert!(urls[0].starts_with("memory://speech/a.mp3?expires="));
    assert_ne!(urls[0], "memory://speech/a.mp3?expires=1");
}

#[tokio::test]
async fn test_rejected_image_prompt_is_not_retried() {
    let fake = Arc::new(FakeProviders::new(3));
    fake.reject_prompt(1);
    let h = fake_harness(&fake, WorkerConfig::default());
    let id = job_id();

    let err = h.pipeline.run(&id, &config(), "u1").await.unwrap_err();

    assert_eq!(err.kind(), "provider");
    assert!(!err.is_retryable());
    // One request per scene; the rejected prompt is not repeated
    assert_eq!(FakeProviders::calls(&fake.image_calls), 3);
    let failed = h.jobs.load(&id).await.unwrap().unwrap();
    assert_eq!(failed.images, vec![image_url(0)]);
}

#[tokio::test]
async fn test_partial_images_are_kept_and_resumed() {
    let fake = Arc::new(FakeProviders::new(4));
    fake.fail_prompt(2);
    let h = fake_harness(&fake, WorkerConfig::default());
    let id = job_id();
    let mut events = h.bus.subscribe(&id).await;

    let err = h.pipeline.run(&id, &config(), "u1").await.unwrap_err();
    assert_eq!(err.kind(), "provider");

    let failed = h.jobs.load(&id).await.unwrap().unwrap();
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.images, vec![image_url(0), image_url(1)]);
    assert!(failed.error.is_some());

    let errors = drain(&mut events)
        .into_iter()
        .filter(|e| e.status == ProgressStatus::Error)
        .count();
    assert_eq!(errors, 1);

    fake.clear_failures();
    let calls_before = FakeProviders::calls(&fake.image_calls);
    let record = h.pipeline.run(&id, &config(), "u1").await.unwrap();

    // Only scenes 2 and 3 were requested again
    assert_eq!(FakeProviders::calls(&fake.image_calls) - calls_before, 2);
    assert_eq!(record.images, (0..4).map(image_url).collect::<Vec<_>>());
    assert_eq!(record.status, JobStatus::Complete);
    assert!(record.error.is_none());
    assert_eq!(FakeProviders::calls(&fake.script_calls), 1);
    assert_eq!(FakeProviders::calls(&fake.speech_calls), 1);
}

#[tokio::test]
async fn test_batched_images_take_several_passes() {
    let fake = Arc::new(FakeProviders::new(5));
    let worker = WorkerConfig {
        image_batch_size: Some(2),
        ..Default::default()
    };
    let h = fake_harness(&fake, worker);

    let record = h.pipeline.run(&job_id(), &config(), "u1").await.unwrap();

    assert_eq!(record.images, (0..5).map(image_url).collect::<Vec<_>>());
    assert_eq!(FakeProviders::calls(&fake.image_calls), 5);
}

#[tokio::test]
async fn test_missing_captions_complete_the_job() {
    let fake = Arc::new(FakeProviders::new(2).without_captions());
    let h = fake_harness(&fake, WorkerConfig::default());

    let record = h.pipeline.run(&job_id(), &config(), "u1").await.unwrap();

    assert_eq!(record.status, JobStatus::Complete);
    assert!(record.captions.is_none());
    assert!(record.captions_skipped);
}

#[tokio::test]
async fn test_required_captions_fail_the_job() {
    let fake = Arc::new(FakeProviders::new(2).without_captions());
    let worker = WorkerConfig {
        captions_required: true,
        ..Default::default()
    };
    let h = fake_harness(&fake, worker);

    let err = h.pipeline.run(&job_id(), &config(), "u1").await.unwrap_err();
    assert_eq!(err.kind(), "provider");

    let record = h.jobs.load(&job_id()).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert_eq!(record.images.len(), 2);
}

/// Images executor that returns without producing anything.
struct StalledImages {
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl StageExecutor for StalledImages {
    fn stage(&self) -> Stage {
        Stage::Images
    }

    async fn execute(&self, _record: &JobRecord) -> StageResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(JobPatch::default())
    }
}

#[tokio::test]
async fn test_stalled_stage_hits_iteration_cap() {
    let fake = Arc::new(FakeProviders::new(2));
    let calls = Arc::new(AtomicUsize::new(0));
    let stalled = StalledImages {
        calls: calls.clone(),
    };
    let h = harness(
        Providers::from_client(fake.clone()),
        WorkerConfig::default(),
        Some(Box::new(stalled)),
    );
    let mut events = h.bus.subscribe(&job_id()).await;

    let err = h.pipeline.run(&job_id(), &config(), "u1").await.unwrap_err();

    assert!(matches!(err, WorkerError::MaxIterationsExceeded(3)));
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let record = h.jobs.load(&job_id()).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    // Earlier checkpoints survive the failure
    assert!(record.speech.is_some());

    let last = drain(&mut events).pop().unwrap();
    assert_eq!(last.status, ProgressStatus::Error);
    assert_eq!(last.stage, "IMAGES");
}

#[tokio::test(start_paused = true)]
async fn test_stage_timeout_fails_then_resumes() {
    let fake = Arc::new(FakeProviders::new(2).with_script_delay(Duration::from_secs(600)));
    let worker = WorkerConfig {
        stage_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let h = fake_harness(&fake, worker);
    let mut events = h.bus.subscribe(&job_id()).await;

    let err = h.pipeline.run(&job_id(), &config(), "u1").await.unwrap_err();
    assert_eq!(err.kind(), "timeout");

    let record = h.jobs.load(&job_id()).await.unwrap().unwrap();
    assert_eq!(record.status, JobStatus::Failed);
    assert!(record.error.as_deref().unwrap().contains("timed out"));

    let last = drain(&mut events).pop().unwrap();
    assert_eq!(last.status, ProgressStatus::Error);
    assert_eq!(last.stage, "SCRIPT");

    fake.script_delay_ms.store(0, Ordering::SeqCst);
    let record = h.pipeline.run(&job_id(), &config(), "u1").await.unwrap();
    assert_eq!(record.status, JobStatus::Complete);
    assert!(record.error.is_none());
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let fake = Arc::new(FakeProviders::new(2));
    let h = fake_harness(&fake, WorkerConfig::default());
    let bad = GenerationConfig::new("", 30_000, "anime");
    let id = JobId::for_request(&bad, "u1");
    let mut events = h.bus.subscribe(&id).await;

    let err = h.pipeline.run(&id, &bad, "u1").await.unwrap_err();

    assert_eq!(err.kind(), "validation");
    assert!(!err.is_retryable());
    assert!(h.jobs.load(&id).await.unwrap().is_none());
    assert_eq!(FakeProviders::calls(&fake.script_calls), 0);

    let seen = drain(&mut events);
    assert_eq!(seen.len(), 1);
    assert!(seen[0].is_terminal());
}

#[tokio::test]
async fn test_rerun_of_complete_job_does_nothing() {
    let fake = Arc::new(FakeProviders::new(2));
    let h = fake_harness(&fake, WorkerConfig::default());

    let first = h.pipeline.run(&job_id(), &config(), "u1").await.unwrap();
    let second = h.pipeline.run(&job_id(), &config(), "u1").await.unwrap();

    assert_eq!(first.images, second.images);
    assert_eq!(FakeProviders::calls(&fake.script_calls), 1);
    assert_eq!(FakeProviders::calls(&fake.image_calls), 2);
    assert_eq!(FakeProviders::calls(&fake.caption_calls), 1);
}
