//! Shared fakes for worker integration tests.

#![allow(dead_code)]

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use futures_util::{FutureExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::mpsc;

use vgen_models::{CaptionWord, GenerationConfig, ProgressEvent, RenderInputs, Scene};
use vgen_providers::{
    CaptionGenerator, ImageGenerator, ProviderError, ProviderResult, RenderProgress, RenderRequest,
    Renderer, ScriptGenerator, SpeechSynthesizer,
};
use vgen_queue::{ProgressSubscription, QueueConfig, RetryPolicy};

/// Counting generators with switchable failures.
pub struct FakeProviders {
    pub scenes: usize,
    pub script_calls: AtomicUsize,
    pub speech_calls: AtomicUsize,
    pub image_calls: AtomicUsize,
    pub caption_calls: AtomicUsize,
    /// Delay before the script is returned, in milliseconds
    pub script_delay_ms: AtomicU64,
    /// Image prompts that fail with a transient error
    pub failing_prompts: Mutex<HashSet<String>>,
    /// Image prompts the provider rejects outright
    pub rejected_prompts: Mutex<HashSet<String>>,
    /// Audio URLs the caption generator was called with
    pub caption_audio_urls: Mutex<Vec<String>>,
    /// Whether the caption generator returns words
    pub caption_words: bool,
}

impl FakeProviders {
    pub fn new(scenes: usize) -> Self {
        Self {
            scenes,
            script_calls: AtomicUsize::new(0),
            speech_calls: AtomicUsize::new(0),
            image_calls: AtomicUsize::new(0),
            caption_calls: AtomicUsize::new(0),
            script_delay_ms: AtomicU64::new(0),
            failing_prompts: Mutex::new(HashSet::new()),
            rejected_prompts: Mutex::new(HashSet::new()),
            caption_audio_urls: Mutex::new(Vec::new()),
            caption_words: true,
        }
    }

    pub fn without_captions(mut self) -> Self {
        self.caption_words = false;
        self
    }

    pub fn with_script_delay(self, delay: Duration) -> Self {
        self.script_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
        self
    }

    pub fn fail_prompt(&self, index: usize) {
        self.failing_prompts.lock().insert(prompt(index));
    }

    pub fn reject_prompt(&self, index: usize) {
        self.rejected_prompts.lock().insert(prompt(index));
    }

    pub fn clear_failures(&self) {
        self.failing_prompts.lock().clear();
        self.rejected_prompts.lock().clear();
    }

    pub fn calls(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub fn prompt(index: usize) -> String {
    format!("scene {} prompt", index)
}

pub fn image_url(index: usize) -> String {
    format!("https://img.example/{}.png", index)
}

#[async_trait]
impl ScriptGenerator for FakeProviders {
    async fn generate_script(&self, _config: &GenerationConfig) -> ProviderResult<Vec<Scene>> {
        self.script_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.script_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        Ok((0..self.scenes)
            .map(|i| Scene {
                image_prompt: prompt(i),
                text_content: format!("Narration for scene {}.", i),
            })
            .collect())
    }
}

#[async_trait]
impl SpeechSynthesizer for FakeProviders {
    async fn synthesize(&self, _text: &str) -> ProviderResult<String> {
        self.speech_calls.fetch_add(1, Ordering::SeqCst);
        Ok(BASE64_STANDARD.encode(b"ID3 fake audio"))
    }
}

#[async_trait]
impl ImageGenerator for FakeProviders {
    async fn generate_image(&self, prompt: &str, _style: &str) -> ProviderResult<Vec<String>> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_prompts.lock().contains(prompt) {
            return Err(ProviderError::Throttled(format!("quota exceeded for '{}'", prompt)));
        }
        if self.rejected_prompts.lock().contains(prompt) {
            return Err(ProviderError::invalid_response(format!("prompt '{}' rejected", prompt)));
        }
        let index: usize = prompt
            .split_whitespace()
            .nth(1)
            .and_then(|n| n.parse().ok())
            .unwrap_or(usize::MAX);
        Ok(vec![image_url(index)])
    }
}

#[async_trait]
impl CaptionGenerator for FakeProviders {
    async fn generate_captions(&self, audio_url: &str) -> ProviderResult<Vec<CaptionWord>> {
        self.caption_calls.fetch_add(1, Ordering::SeqCst);
        self.caption_audio_urls.lock().push(audio_url.to_string());
        if !self.caption_words {
            return Ok(Vec::new());
        }
        Ok(vec![
            CaptionWord {
                text: "Narration".into(),
                start_ms: 0,
                end_ms: 400,
            },
            CaptionWord {
                text: "for".into(),
                start_ms: 400,
                end_ms: 550,
            },
        ])
    }
}

/// Renderer that writes a small file and counts invocations.
#[derive(Default)]
pub struct CountingRenderer {
    pub calls: AtomicUsize,
    /// Inputs of the most recent render
    pub last_inputs: Mutex<Option<RenderInputs>>,
}

impl CountingRenderer {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Renderer for CountingRenderer {
    async fn render(
        &self,
        request: RenderRequest,
        progress: mpsc::UnboundedSender<RenderProgress>,
    ) -> ProviderResult<PathBuf> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_inputs.lock() = Some(request.inputs.clone());
        for step in 1..=4u64 {
            let _ = progress.send(RenderProgress {
                progress: step as f64 / 4.0,
                stage: "encoding".into(),
                rendered_frames: step * 225,
                encoded_frames: step * 200,
            });
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        tokio::fs::write(&request.output_path, b"fake mp4").await?;
        Ok(request.output_path)
    }
}

/// Queue limits loose enough for tests, with one fast retry.
pub fn test_queue_config() -> QueueConfig {
    QueueConfig {
        concurrency: 4,
        interval_cap: 100,
        interval: Duration::from_secs(1),
        retry: RetryPolicy::new(1, Duration::from_millis(10)),
    }
}

pub fn config() -> GenerationConfig {
    GenerationConfig::new("x", 30_000, "anime")
}

/// Events already delivered to `events`, without waiting for more.
pub fn drain(events: &mut ProgressSubscription) -> Vec<ProgressEvent> {
    let mut seen = Vec::new();
    while let Some(Some(event)) = events.next().now_or_never() {
        seen.push(event);
    }
    seen
}
