use std::env;

use serde::Deserialize;

pub const ENV_PREFIX: &str = "SLIPWAY";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Host the API server binds.
    pub http_host: String,
    /// Port the API server binds.
    pub http_port: u16,
    pub metrics_host: String,
    pub metrics_port: u16,
    /// SQLite connection string for the durable status store.
    pub store_url: String,
    /// Directory where uploaded archives land before extraction.
    pub upload_dir: String,
    /// Root directory for per-deployment extracted workspaces.
    pub workspace_dir: String,
    /// Inclusive host port range handed out to deployments.
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Default in-container listening port baked into generated Dockerfiles.
    pub container_port: u16,
    /// Host name used when rendering public deployment URLs.
    #[serde(default)]
    pub public_host: Option<String>,
    /// When true, submissions park in `pending` until approved.
    #[serde(default)]
    pub require_approval: bool,
    /// Backoff applied when a worker iteration hits an unexpected error.
    pub worker_error_backoff_ms: u64,
    #[serde(default)]
    pub cleanup_on_shutdown: bool,
}

// (ENV_NAME, config_key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("SLIPWAY_HTTP_HOST", "http_host"),
    ("SLIPWAY_HTTP_PORT", "http_port"),
    ("SLIPWAY_METRICS_HOST", "metrics_host"),
    ("SLIPWAY_METRICS_PORT", "metrics_port"),
    ("SLIPWAY_STORE_URL", "store_url"),
    ("SLIPWAY_UPLOAD_DIR", "upload_dir"),
    ("SLIPWAY_WORKSPACE_DIR", "workspace_dir"),
    ("SLIPWAY_PORT_RANGE_START", "port_range_start"),
    ("SLIPWAY_PORT_RANGE_END", "port_range_end"),
    ("SLIPWAY_CONTAINER_PORT", "container_port"),
    ("SLIPWAY_PUBLIC_HOST", "public_host"),
    ("SLIPWAY_REQUIRE_APPROVAL", "require_approval"),
    ("SLIPWAY_WORKER_ERROR_BACKOFF_MS", "worker_error_backoff_ms"),
    ("SLIPWAY_CLEANUP_ON_SHUTDOWN", "cleanup_on_shutdown"),
];

impl AppConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.port_range_start == 0 {
            anyhow::bail!("port_range_start must be > 0");
        }
        if self.port_range_end < self.port_range_start {
            anyhow::bail!(
                "port_range_end ({}) must not be below port_range_start ({})",
                self.port_range_end,
                self.port_range_start
            );
        }
        if self.container_port == 0 {
            anyhow::bail!("container_port must be > 0");
        }
        if self.store_url.trim().is_empty() {
            anyhow::bail!("store_url cannot be empty");
        }
        if self.upload_dir.trim().is_empty() || self.workspace_dir.trim().is_empty() {
            anyhow::bail!("upload_dir and workspace_dir cannot be empty");
        }
        Ok(())
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("slipway").required(false))
        .set_default("http_host", "0.0.0.0")?
        .set_default("http_port", 5000)?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9091)?
        .set_default("store_url", "sqlite://slipway.db?mode=rwc")?
        .set_default("upload_dir", "uploads")?
        .set_default("workspace_dir", "extracted")?
        .set_default("port_range_start", 3000)?
        .set_default("port_range_end", 4000)?
        .set_default("container_port", 3000)?
        .set_default("public_host", Option::<String>::None)?
        .set_default("require_approval", false)?
        .set_default("worker_error_backoff_ms", 1_000)?
        .set_default("cleanup_on_shutdown", false)?;

    for (env_key, cfg_key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            builder = builder.set_override(*cfg_key, value)?;
        }
    }

    let app: AppConfig = builder.build()?.try_deserialize()?;
    app.validate()?;
    Ok(app)
}
