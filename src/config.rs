use anyhow::{Context, Result};
use clap::Parser;
use std::{env, str::FromStr, time::Duration};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Seconds without activity before an upload session is evicted.
    pub idle_timeout_secs: u64,
    /// Largest upload a session may declare or grow to, in bytes.
    pub max_upload_size: u64,
    /// Largest single chunk body accepted by the ingestion endpoint, in bytes.
    pub max_chunk_size: u64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Resumable media upload and streaming service")]
pub struct Args {
    /// Host to bind to (overrides MEDIA_STORE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides MEDIA_STORE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where uploads are staged and stored (overrides MEDIA_STORE_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides MEDIA_STORE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Idle session timeout in seconds (overrides MEDIA_STORE_IDLE_TIMEOUT_SECS)
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Maximum upload size in bytes (overrides MEDIA_STORE_MAX_UPLOAD_SIZE)
    #[arg(long)]
    pub max_upload_size: Option<u64>,

    /// Maximum chunk size in bytes (overrides MEDIA_STORE_MAX_CHUNK_SIZE)
    #[arg(long)]
    pub max_chunk_size: Option<u64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 60 * 60;
const DEFAULT_MAX_UPLOAD_SIZE: u64 = 500 * 1024 * 1024;
const DEFAULT_MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();
        let migrate = args.migrate;
        let cfg = Self::resolve(args, |key| env::var(key))?;
        Ok((cfg, migrate))
    }

    /// Merge CLI arguments over values looked up through `lookup`, falling
    /// back to defaults.
    pub fn resolve<F>(args: Args, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        // --- Environment fallback ---
        let env_host = lookup("MEDIA_STORE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = parse_var(&lookup, "MEDIA_STORE_PORT", DEFAULT_PORT)?;
        let env_storage =
            lookup("MEDIA_STORE_STORAGE_DIR").unwrap_or_else(|_| "./uploads".into());
        let env_db = lookup("MEDIA_STORE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/media_store.db".into());
        let env_idle = parse_var(
            &lookup,
            "MEDIA_STORE_IDLE_TIMEOUT_SECS",
            DEFAULT_IDLE_TIMEOUT_SECS,
        )?;
        let env_max_upload = parse_var(
            &lookup,
            "MEDIA_STORE_MAX_UPLOAD_SIZE",
            DEFAULT_MAX_UPLOAD_SIZE,
        )?;
        let env_max_chunk =
            parse_var(&lookup, "MEDIA_STORE_MAX_CHUNK_SIZE", DEFAULT_MAX_CHUNK_SIZE)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            idle_timeout_secs: args.idle_timeout_secs.unwrap_or(env_idle),
            max_upload_size: args.max_upload_size.unwrap_or(env_max_upload),
            max_chunk_size: args.max_chunk_size.unwrap_or(env_max_chunk),
        };

        if cfg.max_chunk_size == 0 {
            anyhow::bail!("max chunk size must be greater than zero");
        }

        Ok(cfg)
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Result<String, env::VarError>,
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", key, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(
        vars: &[(&str, &str)],
    ) -> impl Fn(&str) -> Result<String, env::VarError> + use<> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_apply_without_env_or_args() {
        let cfg = AppConfig::resolve(Args::default(), lookup_from(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:5000");
        assert_eq!(cfg.storage_dir, "./uploads");
        assert_eq!(cfg.idle_timeout(), Duration::from_secs(3600));
        assert_eq!(cfg.max_upload_size, 500 * 1024 * 1024);
    }

    #[test]
    fn cli_args_override_environment() {
        let args = Args {
            port: Some(7000),
            max_upload_size: Some(1024),
            ..Args::default()
        };
        let cfg = AppConfig::resolve(
            args,
            lookup_from(&[
                ("MEDIA_STORE_PORT", "6000"),
                ("MEDIA_STORE_IDLE_TIMEOUT_SECS", "30"),
                ("MEDIA_STORE_MAX_UPLOAD_SIZE", "2048"),
            ]),
        )
        .unwrap();
        assert_eq!(cfg.port, 7000);
        assert_eq!(cfg.idle_timeout_secs, 30);
        assert_eq!(cfg.max_upload_size, 1024);
    }

    #[test]
    fn malformed_numbers_are_reported() {
        let err = AppConfig::resolve(
            Args::default(),
            lookup_from(&[("MEDIA_STORE_PORT", "eighty")]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("MEDIA_STORE_PORT"));
    }
}
