use anyhow::{Context, Result, bail};
use clap::Parser;
use std::{env, fmt, str::FromStr};

/// Which object storage the gateway writes papers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackendKind {
    /// Directory tree under `storage_dir`.
    Local,
    /// Hosted storage REST API at `storage_url`.
    Rest,
}

impl FromStr for StorageBackendKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "rest" => Ok(Self::Rest),
            other => bail!("unknown storage backend `{}` (expected `local` or `rest`)", other),
        }
    }
}

impl fmt::Display for StorageBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Local => "local",
            Self::Rest => "rest",
        })
    }
}

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    pub storage_backend: StorageBackendKind,
    pub storage_dir: String,
    pub storage_url: Option<String>,
    pub service_key: Option<String>,
    pub public_base_url: String,
    pub bucket_name: String,
    pub admin_email: Option<String>,
    pub max_file_size: u64,
    pub max_field_size: u64,
}

// Hand-written so the service key never reaches the logs.
impl fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("storage_backend", &self.storage_backend)
            .field("storage_dir", &self.storage_dir)
            .field("storage_url", &self.storage_url)
            .field("service_key", &self.service_key.as_ref().map(|_| "<redacted>"))
            .field("public_base_url", &self.public_base_url)
            .field("bucket_name", &self.bucket_name)
            .field("admin_email", &self.admin_email)
            .field("max_file_size", &self.max_file_size)
            .field("max_field_size", &self.max_field_size)
            .finish()
    }
}

/// One-shot maintenance tasks requested on the command line.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tasks {
    pub migrate: bool,
    pub grant_admin: Option<String>,
    pub seed_subjects: bool,
}

impl Tasks {
    /// True when the process should exit after running the tasks.
    pub fn any(&self) -> bool {
        self.migrate || self.grant_admin.is_some() || self.seed_subjects
    }
}

/// Command-line + environment configuration.
#[derive(Parser, Debug, Default)]
#[command(author, version, about = "Exam paper upload gateway")]
pub struct Args {
    /// Host to bind to (overrides EXAM_VAULT_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides EXAM_VAULT_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Database URL (overrides EXAM_VAULT_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Storage backend, `local` or `rest` (overrides EXAM_VAULT_STORAGE_BACKEND)
    #[arg(long)]
    pub storage_backend: Option<String>,

    /// Directory for the local backend (overrides EXAM_VAULT_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Base URL of the REST storage API (overrides EXAM_VAULT_STORAGE_URL)
    #[arg(long)]
    pub storage_url: Option<String>,

    /// Origin used in public object URLs (overrides EXAM_VAULT_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Email treated as admin (overrides EXAM_VAULT_ADMIN_EMAIL)
    #[arg(long)]
    pub admin_email: Option<String>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,

    /// Create or promote an admin user, print a session token and exit
    #[arg(long, value_name = "EMAIL")]
    pub grant_admin: Option<String>,

    /// Insert the default subject catalogue and exit
    #[arg(long)]
    pub seed_subjects: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the requested tasks.
    pub fn from_env_and_args() -> Result<(Self, Tasks)> {
        Self::from_args(Args::parse(), |key| env::var(key))
    }

    /// Merge `args` over values read through `env`; CLI wins.
    pub fn from_args<F>(args: Args, env: F) -> Result<(Self, Tasks)>
    where
        F: Fn(&str) -> Result<String, env::VarError>,
    {
        let var = |key: &str| -> Result<Option<String>> {
            match env(key) {
                Ok(value) => Ok(Some(value).filter(|v| !v.trim().is_empty())),
                Err(env::VarError::NotPresent) => Ok(None),
                Err(err) => Err(err).with_context(|| format!("reading {}", key)),
            }
        };
        let parsed = |key: &str, default: u64| -> Result<u64> {
            match var(key)? {
                Some(value) => value
                    .parse::<u64>()
                    .with_context(|| format!("parsing {} value `{}`", key, value)),
                None => Ok(default),
            }
        };

        // --- Environment fallback ---
        let env_host = var("EXAM_VAULT_HOST")?.unwrap_or_else(|| "0.0.0.0".into());
        let env_port = match var("EXAM_VAULT_PORT")? {
            Some(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing EXAM_VAULT_PORT value `{}`", value))?,
            None => 3000,
        };
        let env_db = var("EXAM_VAULT_DATABASE_URL")?
            .unwrap_or_else(|| "sqlite://./data/meta/exam_vault.db".into());
        let env_backend = var("EXAM_VAULT_STORAGE_BACKEND")?.unwrap_or_else(|| "local".into());
        let env_storage =
            var("EXAM_VAULT_STORAGE_DIR")?.unwrap_or_else(|| "./data/objects".into());

        // --- Merge ---
        let port = args.port.unwrap_or(env_port);
        let storage_backend: StorageBackendKind =
            args.storage_backend.unwrap_or(env_backend).parse()?;
        let storage_url = args.storage_url.or(var("EXAM_VAULT_STORAGE_URL")?);
        let service_key = var("EXAM_VAULT_SERVICE_KEY")?;

        if storage_backend == StorageBackendKind::Rest
            && (storage_url.is_none() || service_key.is_none())
        {
            bail!(
                "the rest storage backend needs EXAM_VAULT_STORAGE_URL and EXAM_VAULT_SERVICE_KEY"
            );
        }

        let public_base_url = args
            .public_base_url
            .or(var("EXAM_VAULT_PUBLIC_BASE_URL")?)
            .unwrap_or_else(|| format!("http://localhost:{}", port));

        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port,
            database_url: args.database_url.unwrap_or(env_db),
            storage_backend,
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            storage_url,
            service_key,
            public_base_url,
            bucket_name: var("EXAM_VAULT_BUCKET")?.unwrap_or_else(|| "papers".into()),
            admin_email: args.admin_email.or(var("EXAM_VAULT_ADMIN_EMAIL")?),
            max_file_size: parsed("EXAM_VAULT_MAX_FILE_SIZE", 50 * 1024 * 1024)?,
            max_field_size: parsed("EXAM_VAULT_MAX_FIELD_SIZE", 10 * 1024 * 1024)?,
        };

        let tasks = Tasks {
            migrate: args.migrate,
            grant_admin: args.grant_admin,
            seed_subjects: args.seed_subjects,
        };

        Ok((cfg, tasks))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Result<String, env::VarError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned().ok_or(env::VarError::NotPresent)
    }

    #[test]
    fn defaults_without_env_or_flags() {
        let (cfg, tasks) = AppConfig::from_args(Args::default(), env_of(&[])).unwrap();
        assert_eq!(cfg.addr(), "0.0.0.0:3000");
        assert_eq!(cfg.storage_backend, StorageBackendKind::Local);
        assert_eq!(cfg.bucket_name, "papers");
        assert_eq!(cfg.public_base_url, "http://localhost:3000");
        assert_eq!(cfg.max_file_size, 52_428_800);
        assert_eq!(cfg.max_field_size, 10_485_760);
        assert!(!tasks.any());
    }

    #[test]
    fn flags_override_env() {
        let args = Args {
            port: Some(8080),
            admin_email: Some("cli@example.com".into()),
            migrate: true,
            ..Args::default()
        };
        let env = env_of(&[
            ("EXAM_VAULT_PORT", "9000"),
            ("EXAM_VAULT_HOST", "127.0.0.1"),
            ("EXAM_VAULT_ADMIN_EMAIL", "env@example.com"),
        ]);
        let (cfg, tasks) = AppConfig::from_args(args, env).unwrap();
        assert_eq!(cfg.addr(), "127.0.0.1:8080");
        assert_eq!(cfg.admin_email.as_deref(), Some("cli@example.com"));
        assert!(tasks.migrate && tasks.any());
    }

    #[test]
    fn rest_backend_requires_url_and_key() {
        let env = env_of(&[("EXAM_VAULT_STORAGE_BACKEND", "rest")]);
        assert!(AppConfig::from_args(Args::default(), env).is_err());

        let env = env_of(&[
            ("EXAM_VAULT_STORAGE_BACKEND", "REST"),
            ("EXAM_VAULT_STORAGE_URL", "https://storage.example.com"),
            ("EXAM_VAULT_SERVICE_KEY", "secret"),
        ]);
        let (cfg, _) = AppConfig::from_args(Args::default(), env).unwrap();
        assert_eq!(cfg.storage_backend, StorageBackendKind::Rest);
        assert!(!format!("{:?}", cfg).contains("secret"));
    }

    #[test]
    fn rejects_malformed_numbers() {
        let env = env_of(&[("EXAM_VAULT_PORT", "eighty")]);
        assert!(AppConfig::from_args(Args::default(), env).is_err());
        let env = env_of(&[("EXAM_VAULT_MAX_FILE_SIZE", "-1")]);
        assert!(AppConfig::from_args(Args::default(), env).is_err());
    }
}
