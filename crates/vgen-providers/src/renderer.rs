//! External render process runner.
//!
//! The renderer is invoked as
//! `<program> [args..] <composition_id> <output_path> --props=<props.json>`.
//! Each stdout line that parses as a [`RenderProgress`] JSON object is
//! forwarded as progress; anything else is treated as log output.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{ProviderError, ProviderResult};
use crate::traits::{RenderProgress, RenderRequest, Renderer};

/// Number of stderr lines kept for error messages.
const STDERR_TAIL_LINES: usize = 20;

/// How long output readers may run after the renderer exits.
const PIPE_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Configuration for [`CommandRenderer`].
#[derive(Debug, Clone)]
pub struct CommandRendererConfig {
    /// Program to run, resolved through `PATH`
    pub program: String,
    /// Arguments placed before the composition id
    pub args: Vec<String>,
}

impl Default for CommandRendererConfig {
    fn default() -> Self {
        Self {
            program: "npx".to_string(),
            args: vec!["remotion".to_string(), "render".to_string()],
        }
    }
}

impl CommandRendererConfig {
    /// Create from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            program: std::env::var("RENDERER_BIN").unwrap_or(defaults.program),
            args: std::env::var("RENDERER_ARGS")
                .map(|s| s.split_whitespace().map(str::to_string).collect())
                .unwrap_or(defaults.args),
        }
    }
}

/// [`Renderer`] backed by an external process.
pub struct CommandRenderer {
    config: CommandRendererConfig,
}

impl CommandRenderer {
    pub fn new(config: CommandRendererConfig) -> Self {
        Self { config }
    }

    pub fn from_env() -> Self {
        Self::new(CommandRendererConfig::from_env())
    }

    /// Check the renderer program is available.
    pub fn check(&self) -> ProviderResult<PathBuf> {
        which::which(&self.config.program)
            .map_err(|_| ProviderError::RendererNotFound(self.config.program.clone()))
    }

    fn build_args(&self, request: &RenderRequest, props_path: &Path) -> Vec<String> {
        let mut args = self.config.args.clone();
        args.push(request.composition_id.clone());
        args.push(request.output_path.to_string_lossy().to_string());
        args.push(format!("--props={}", props_path.to_string_lossy()));
        args
    }
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(
        &self,
        request: RenderRequest,
        progress: mpsc::UnboundedSender<RenderProgress>,
    ) -> ProviderResult<PathBuf> {
        let program = self.check()?;

        if let Some(parent) = request.output_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let props_path = request.output_path.with_extension("props.json");
        tokio::fs::write(&props_path, serde_json::to_vec(&request.inputs)?).await?;

        let args = self.build_args(&request, &props_path);
        info!(
            job_id = %request.inputs.job_id,
            composition = request.composition_id.as_str(),
            "Starting renderer"
        );
        debug!("Running renderer: {} {}", program.display(), args.join(" "));

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::render_failed("Renderer stdout not captured", None))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProviderError::render_failed("Renderer stderr not captured", None))?;

        let stdout_handle = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                match parse_progress_line(&line) {
                    Some(update) => {
                        // Receiver may be gone if the caller stopped listening
                        let _ = progress.send(update);
                    }
                    None => debug!("renderer: {}", line.trim()),
                }
            }
        });

        let stderr_handle = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(trimmed.to_string());
            }
            tail.into_iter().collect::<Vec<_>>()
        });

        let status = child.wait().await;
        // A process the renderer spawned can keep the pipes open after it exits
        let mut stdout_handle = stdout_handle;
        if tokio::time::timeout(PIPE_DRAIN_GRACE, &mut stdout_handle).await.is_err() {
            warn!("Renderer stdout still open after exit, detaching reader");
            stdout_handle.abort();
        }
        let mut stderr_handle = stderr_handle;
        let stderr_tail = match tokio::time::timeout(PIPE_DRAIN_GRACE, &mut stderr_handle).await {
            Ok(tail) => tail.unwrap_or_default(),
            Err(_) => {
                stderr_handle.abort();
                Vec::new()
            }
        };

        if let Err(e) = tokio::fs::remove_file(&props_path).await {
            warn!("Failed to remove renderer props file {}: {}", props_path.display(), e);
        }

        let status = status?;
        if !status.success() {
            return Err(ProviderError::render_failed(
                format!("Renderer exited with {}: {}", status, stderr_tail.join("\n")),
                status.code(),
            ));
        }

        if !tokio::fs::try_exists(&request.output_path).await? {
            return Err(ProviderError::render_failed(
                format!(
                    "Renderer finished without writing {}",
                    request.output_path.display()
                ),
                status.code(),
            ));
        }

        Ok(request.output_path)
    }
}

/// Parse a JSON progress line from renderer stdout.
fn parse_progress_line(line: &str) -> Option<RenderProgress> {
    let line = line.trim();
    if !line.starts_with('{') {
        return None;
    }
    serde_json::from_str(line).ok()
}
