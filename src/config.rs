use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub blob_dir: String,
    pub staging_dir: String,
    pub database_url: String,
    pub hash_concurrency: usize,
    pub max_upload_bytes: usize,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Content-addressed release registry")]
pub struct Args {
    /// Host to bind to (overrides RELEASE_REGISTRY_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides RELEASE_REGISTRY_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where manifest and archive blobs are stored (overrides RELEASE_REGISTRY_BLOB_DIR)
    #[arg(long)]
    pub blob_dir: Option<String>,

    /// Directory uploads are staged and extracted in (overrides RELEASE_REGISTRY_STAGING_DIR)
    #[arg(long)]
    pub staging_dir: Option<String>,

    /// Database URL (overrides RELEASE_REGISTRY_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Maximum number of files hashed at once (overrides RELEASE_REGISTRY_HASH_CONCURRENCY)
    #[arg(long)]
    pub hash_concurrency: Option<usize>,

    /// Maximum accepted upload body size in bytes (overrides RELEASE_REGISTRY_MAX_UPLOAD_BYTES)
    #[arg(long)]
    pub max_upload_bytes: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        let args = Args::parse();
        let migrate = args.migrate;
        Ok((Self::from_args(args)?, migrate))
    }

    /// Merge parsed CLI args over environment values and defaults.
    pub fn from_args(args: Args) -> Result<Self> {
        // --- Environment fallback ---
        let env_host = env::var("RELEASE_REGISTRY_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_env("RELEASE_REGISTRY_PORT", 3000)?;
        let env_blob_dir =
            env::var("RELEASE_REGISTRY_BLOB_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_staging_dir =
            env::var("RELEASE_REGISTRY_STAGING_DIR").unwrap_or_else(|_| "./data/staging".into());
        let env_db = env::var("RELEASE_REGISTRY_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/release_registry.db".into());
        let env_concurrency = parse_env("RELEASE_REGISTRY_HASH_CONCURRENCY", 16)?;
        let env_max_upload = parse_env("RELEASE_REGISTRY_MAX_UPLOAD_BYTES", 256 * 1024 * 1024)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            blob_dir: args.blob_dir.unwrap_or(env_blob_dir),
            staging_dir: args.staging_dir.unwrap_or(env_staging_dir),
            database_url: args.database_url.unwrap_or(env_db),
            hash_concurrency: args.hash_concurrency.unwrap_or(env_concurrency),
            max_upload_bytes: args.max_upload_bytes.unwrap_or(env_max_upload),
        };

        if cfg.hash_concurrency == 0 {
            anyhow::bail!("hash concurrency must be at least 1");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}
