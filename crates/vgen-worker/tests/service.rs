//! End-to-end flows through `GenerationService`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;

use vgen_models::progress::{STAGE_COMPLETE, STAGE_RENDER};
use vgen_models::{JobId, JobPatch, JobStatus, ProgressStatus};
use vgen_providers::Renderer;
use vgen_storage::MemoryObjectStorage;
use vgen_store::MemoryStore;
use vgen_worker::{GenerationService, Providers, WorkerConfig};

use common::{config, drain, test_queue_config, CountingRenderer, FakeProviders};

struct Harness {
    service: GenerationService,
    fake: Arc<FakeProviders>,
    renderer: Arc<CountingRenderer>,
    _dir: tempfile::TempDir,
}

fn harness(fake: FakeProviders) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let worker = WorkerConfig {
        render_dir: dir.path().join("renders"),
        ..Default::default()
    };
    let fake = Arc::new(fake);
    let renderer = Arc::new(CountingRenderer::default());
    let service = GenerationService::new(
        worker,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryObjectStorage::new()),
        Providers::from_client(fake.clone()),
        renderer.clone() as Arc<dyn Renderer>,
        test_queue_config(),
    );
    Harness {
        service,
        fake,
        renderer,
        _dir: dir,
    }
}

#[tokio::test]
async fn test_generate_then_render() {
    let h = harness(FakeProviders::new(3));
    let job_id = JobId::for_request(&config(), "u1");
    let mut events = h.service.subscribe_progress(&job_id).await;

    let handle = h
        .service
        .start_generation(job_id.clone(), config(), "u1")
        .await
        .unwrap()
        .unwrap();
    let record = handle.await.unwrap().unwrap();

    assert_eq!(record.status, JobStatus::Complete);
    assert_eq!(record.images.len(), record.scene_count());
    assert!(record.speech.is_some());
    assert!(record.captions.is_some());

    let path = h.service.render_video(&job_id).await.unwrap();
    assert!(path.exists());
    assert_eq!(h.renderer.calls(), 1);

    // A second request serves the same file
    assert_eq!(h.service.render_video(&job_id).await.unwrap(), path);
    assert_eq!(h.renderer.calls(), 1);

    let file = h.service.get_rendered_file(&job_id).await.unwrap().unwrap();
    assert_eq!(file.path, path);
    assert_eq!(file.size, 8);

    let seen = drain(&mut events);
    let progress: Vec<u8> = seen.iter().filter_map(|e| e.progress).collect();
    assert!(progress.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", progress);

    let last = seen.last().unwrap();
    assert_eq!(last.stage, STAGE_COMPLETE);
    assert_eq!(last.progress, Some(100));
    assert!(seen.iter().any(|e| e.stage == STAGE_RENDER
        && e.details.get("renderedFrames").is_some()));
    assert!(!seen.iter().any(|e| e.status == ProgressStatus::Error));
}

#[tokio::test]
async fn test_render_uses_freshly_signed_asset_urls() {
    let h = harness(FakeProviders::new(2));
    let job_id = JobId::for_request(&config(), "u1");
    let handle = h
        .service
        .start_generation(job_id.clone(), config(), "u1")
        .await
        .unwrap()
        .unwrap();
    let record = handle.await.unwrap().unwrap();

    // Simulate URLs that expired since generation
    let mut speech = record.speech.clone().unwrap();
    speech.signed_url = format!("memory://{}?expires=1", speech.key);
    let mut captions = record.captions.clone().unwrap();
    captions.signed_url = format!("memory://{}?expires=1", captions.key);
    h.service
        .jobs()
        .save(
            &job_id,
            JobPatch::default().with_speech(speech.clone()).with_captions(captions.clone()),
        )
        .await
        .unwrap();

    h.service.render_video(&job_id).await.unwrap();

    let inputs = h.renderer.last_inputs.lock().clone().unwrap();
    assert!(inputs.speech_url.starts_with(&format!("memory://{}?expires=", speech.key)));
    assert_ne!(inputs.speech_url, speech.signed_url);
    let captions_url = inputs.captions_url.unwrap();
    assert!(captions_url.starts_with(&format!("memory://{}?expires=", captions.key)));
    assert_ne!(captions_url, captions.signed_url);
}

#[tokio::test]
async fn test_concurrent_render_requests_share_one_render() {
    let h = harness(FakeProviders::new(2));
    let job_id = JobId::for_request(&config(), "u1");
    let handle = h
        .service
        .start_generation(job_id.clone(), config(), "u1")
        .await
        .unwrap()
        .unwrap();
    handle.await.unwrap().unwrap();

    let (a, b) = tokio::join!(
        h.service.render_video(&job_id),
        h.service.render_video(&job_id)
    );

    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(h.renderer.calls(), 1);
}

#[tokio::test]
async fn test_second_start_while_running_is_ignored() {
    let h = harness(FakeProviders::new(2).with_script_delay(Duration::from_millis(200)));
    let job_id = JobId::for_request(&config(), "u1");

    let first = h
        .service
        .start_generation(job_id.clone(), config(), "u1")
        .await
        .unwrap();
    let second = h
        .service
        .start_generation(job_id.clone(), config(), "u1")
        .await
        .unwrap();

    assert!(first.is_some());
    assert!(second.is_none());
    assert!(h.service.is_running(&job_id));

    first.unwrap().await.unwrap().unwrap();
    assert!(!h.service.is_running(&job_id));
    assert_eq!(FakeProviders::calls(&h.fake.script_calls), 1);
}

#[tokio::test]
async fn test_render_before_generation_is_not_ready() {
    let h = harness(FakeProviders::new(2));
    let job_id = JobId::from_string("unknown");

    let err = h.service.render_video(&job_id).await.unwrap_err();

    assert_eq!(err.kind(), "not_ready");
    assert_eq!(h.renderer.calls(), 0);
    assert!(h.service.get_rendered_file(&job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_request_is_rejected_before_starting() {
    let h = harness(FakeProviders::new(2));
    let bad = vgen_models::GenerationConfig::new("x", 1_000, "anime");
    let job_id = JobId::for_request(&bad, "u1");

    let err = h
        .service
        .start_generation(job_id.clone(), bad, "u1")
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "validation");
    assert!(!h.service.is_running(&job_id));
}

#[tokio::test]
async fn test_late_subscriber_sees_latest_event() {
    let h = harness(FakeProviders::new(2));
    let job_id = JobId::for_request(&config(), "u1");
    let handle = h
        .service
        .start_generation(job_id.clone(), config(), "u1")
        .await
        .unwrap()
        .unwrap();
    handle.await.unwrap().unwrap();

    let mut late = h.service.subscribe_progress(&job_id).await;
    let first = late.next().await.unwrap();

    assert_eq!(first.stage, "CAPTIONS");
    assert_eq!(first.status, ProgressStatus::Success);
    assert_eq!(first.progress, Some(50));
}

#[tokio::test]
async fn test_cleanup_keeps_recent_renders() {
    let h = harness(FakeProviders::new(1));
    let job_id = JobId::for_request(&config(), "u1");
    let handle = h
        .service
        .start_generation(job_id.clone(), config(), "u1")
        .await
        .unwrap()
        .unwrap();
    handle.await.unwrap().unwrap();
    let path = h.service.render_video(&job_id).await.unwrap();

    let evicted = h
        .service
        .cleanup_old_renders(Duration::from_secs(3600))
        .await
        .unwrap();
    assert_eq!(evicted, 0);
    assert!(path.exists());

    let evicted = h.service.cleanup_old_renders(Duration::ZERO).await.unwrap();
    assert_eq!(evicted, 1);
    assert!(!path.exists());
    assert!(h.service.get_rendered_file(&job_id).await.unwrap().is_none());
}
