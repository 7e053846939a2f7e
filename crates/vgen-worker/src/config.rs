//! Worker configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Budget for a single stage attempt
    pub stage_timeout: Duration,
    /// Consecutive passes without progress before a run is abandoned
    pub max_stalled_passes: u32,
    /// Fail the job when the caption provider returns no words
    pub captions_required: bool,
    /// Maximum images requested in one pass (None = all missing)
    pub image_batch_size: Option<usize>,
    /// Lifetime of signed asset URLs handed to providers and the renderer
    pub signed_url_ttl: Duration,
    /// Directory for rendered videos
    pub render_dir: PathBuf,
    /// Composition rendered by the external renderer
    pub composition_id: String,
    /// Budget for one render
    pub render_timeout: Duration,
    /// Rendered files not accessed within this window are evicted
    pub render_retention: Duration,
    /// How often the cleanup loop runs
    pub cleanup_interval: Duration,
    /// Also upload finished renders to object storage
    pub render_upload: bool,
    /// Lifetime of stored progress snapshots
    pub snapshot_ttl: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(300), // 5 minutes
            max_stalled_passes: 3,
            captions_required: false,
            image_batch_size: None,
            signed_url_ttl: Duration::from_secs(3600),
            render_dir: PathBuf::from("/tmp/vgen/renders"),
            composition_id: "ShortVideo".to_string(),
            render_timeout: Duration::from_secs(1800),
            render_retention: Duration::from_secs(86_400), // 24 hours
            cleanup_interval: Duration::from_secs(3600),
            render_upload: false,
            snapshot_ttl: Duration::from_secs(3600),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_secs(name: &str, default: Duration) -> Duration {
    env_parse(name).map(Duration::from_secs).unwrap_or(default)
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            stage_timeout: env_secs("PIPELINE_STAGE_TIMEOUT_SECS", defaults.stage_timeout),
            max_stalled_passes: env_parse::<u32>("PIPELINE_MAX_STALLED_PASSES")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.max_stalled_passes),
            captions_required: env_parse("CAPTIONS_REQUIRED").unwrap_or(defaults.captions_required),
            image_batch_size: env_parse::<usize>("IMAGE_BATCH_SIZE").filter(|n| *n > 0),
            signed_url_ttl: env_secs("SIGNED_URL_TTL_SECS", defaults.signed_url_ttl),
            render_dir: std::env::var("RENDER_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.render_dir),
            composition_id: std::env::var("RENDER_COMPOSITION_ID")
                .unwrap_or(defaults.composition_id),
            render_timeout: env_secs("RENDER_TIMEOUT_SECS", defaults.render_timeout),
            render_retention: env_secs("RENDER_RETENTION_SECS", defaults.render_retention),
            cleanup_interval: env_secs("RENDER_CLEANUP_INTERVAL_SECS", defaults.cleanup_interval),
            render_upload: env_parse("RENDER_UPLOAD").unwrap_or(defaults.render_upload),
            snapshot_ttl: env_secs("PROGRESS_SNAPSHOT_TTL_SECS", defaults.snapshot_ttl),
        }
    }
}
