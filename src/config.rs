use crate::services::upload_tracker::DEFAULT_CHUNK_SIZE;
use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use std::{env, fmt, str::FromStr};

/// Which `RemoteDrive` implementation backs the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum DriveBackend {
    Google,
    Mock,
}

impl FromStr for DriveBackend {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_ascii_lowercase().as_str() {
            "google" => Ok(DriveBackend::Google),
            "mock" => Ok(DriveBackend::Mock),
            other => bail!("unknown drive backend `{}` (expected google or mock)", other),
        }
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub jwt_secret: String,
    pub drive_backend: DriveBackend,
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_redirect_uri: String,
    pub chunk_size: usize,
    pub max_upload_bytes: usize,
    pub bcrypt_cost: u32,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "DriveMerge: one upload target across many Google Drives")]
pub struct Args {
    /// Host to bind to (overrides DRIVEMERGE_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides DRIVEMERGE_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides DRIVEMERGE_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Remote drive implementation (overrides DRIVEMERGE_DRIVE_BACKEND)
    #[arg(long, value_enum)]
    pub drive_backend: Option<DriveBackend>,

    /// Upload chunk size in bytes (overrides DRIVEMERGE_CHUNK_SIZE).
    /// Rounded up to the drive's alignment (256 KiB for Google); progress is
    /// reported once per effective chunk.
    #[arg(long)]
    pub chunk_size: Option<usize>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("DRIVEMERGE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_parse("DRIVEMERGE_PORT", 3000u16)?;
        let env_db = env::var("DRIVEMERGE_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/drive_merge.db".into());
        let env_backend = env_parse("DRIVEMERGE_DRIVE_BACKEND", DriveBackend::Google)?;
        let env_chunk = env_parse("DRIVEMERGE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;

        let jwt_secret = match env::var("DRIVEMERGE_JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => secret,
            _ => bail!("DRIVEMERGE_JWT_SECRET must be set"),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            jwt_secret,
            drive_backend: args.drive_backend.unwrap_or(env_backend),
            google_client_id: env::var("DRIVEMERGE_GOOGLE_CLIENT_ID").unwrap_or_default(),
            google_client_secret: env::var("DRIVEMERGE_GOOGLE_CLIENT_SECRET").unwrap_or_default(),
            google_redirect_uri: env::var("DRIVEMERGE_GOOGLE_REDIRECT_URI")
                .unwrap_or_else(|_| "http://localhost:3000/accounts/callback".into()),
            chunk_size: args.chunk_size.unwrap_or(env_chunk),
            max_upload_bytes: env_parse("DRIVEMERGE_MAX_UPLOAD_BYTES", 2 * 1024 * 1024 * 1024)?,
            bcrypt_cost: env_parse("DRIVEMERGE_BCRYPT_COST", bcrypt::DEFAULT_COST)?,
        };

        if cfg.drive_backend == DriveBackend::Google && cfg.google_client_id.is_empty() {
            bail!("DRIVEMERGE_GOOGLE_CLIENT_ID must be set for the google drive backend");
        }
        if cfg.chunk_size == 0 {
            bail!("chunk size must be greater than zero");
        }

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read and parse an optional environment variable, falling back to `default`.
fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map_err(|err| anyhow::anyhow!("{}", err))
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drive_backend_parses_case_insensitively() {
        assert_eq!("Google".parse::<DriveBackend>().unwrap(), DriveBackend::Google);
        assert_eq!("mock".parse::<DriveBackend>().unwrap(), DriveBackend::Mock);
        assert!("dropbox".parse::<DriveBackend>().is_err());
    }

    #[test]
    fn unset_variables_use_the_default() {
        let value: u16 = env_parse("DRIVEMERGE_TEST_SURELY_UNSET", 42).unwrap();
        assert_eq!(value, 42);
    }
}
