use anyhow::Result;
use axum::Router;
use chrono::Duration;
use exam_vault::{
    config::{AppConfig, StorageBackendKind, Tasks},
    models::bucket::BucketConfig,
    routes,
    services::{
        identity_service::IdentityService, local_backend::LocalStorageBackend,
        metadata_service::MetadataStore, object_store::ObjectStore,
        provisioner::StorageProvisioner, rest_backend::RestStorageBackend,
        storage_backend::StorageBackend, upload_gateway::{UploadGateway, UploadLimits},
    },
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Lifetime of sessions minted by `--grant-admin`.
const ADMIN_SESSION_DAYS: i64 = 30;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + tasks ---
    let (cfg, tasks) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting exam-vault with config: {:?}", cfg);

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    ensure_sqlite_file(db_url)?;
    let metadata = MetadataStore::connect(db_url, 5).await?;
    metadata.migrate().await?;

    // --- Handle one-shot tasks ---
    if tasks.any() {
        run_tasks(&metadata, &tasks).await?;
        return Ok(()); // exit after maintenance
    }

    // --- Initialize storage backend ---
    let backend: Arc<dyn StorageBackend> = match cfg.storage_backend {
        StorageBackendKind::Local => {
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            Arc::new(LocalStorageBackend::new(
                cfg.storage_dir.clone(),
                cfg.public_base_url.clone(),
            ))
        }
        StorageBackendKind::Rest => {
            let (Some(url), Some(key)) = (&cfg.storage_url, &cfg.service_key) else {
                anyhow::bail!("rest storage backend is missing its URL or service key");
            };
            Arc::new(RestStorageBackend::new(url.clone(), key.clone())?)
        }
    };
    tracing::info!("Using {} storage backend", backend.name());

    // --- Initialize core services ---
    let limits = UploadLimits {
        max_file_size: cfg.max_file_size,
        max_field_size: cfg.max_field_size,
    };
    let gateway = UploadGateway {
        identity: IdentityService::new(metadata.clone(), cfg.admin_email.clone()),
        provisioner: StorageProvisioner::new(
            backend.clone(),
            BucketConfig::new(cfg.bucket_name.clone(), limits.max_file_size),
        ),
        objects: ObjectStore::new(backend, cfg.bucket_name.clone()),
        metadata,
        limits,
    };

    // --- Build router ---
    let app: Router = routes::routes::routes(limits.body_limit()).with_state(gateway);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Create the SQLite file and its parent directory so the pool can open it.
fn ensure_sqlite_file(db_url: &str) -> Result<()> {
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if db_path.is_empty() || db_path.starts_with(":memory:") {
        return Ok(());
    }
    let db_path = db_path.split('?').next().unwrap_or(db_path);
    tracing::debug!("Interpreted SQLite path => {}", db_path);

    let db_path_obj = Path::new(db_path);
    if let Some(parent) = db_path_obj.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    match fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(db_path_obj)
    {
        Ok(_) => tracing::debug!("Database file can be created/opened."),
        Err(e) => tracing::warn!("Failed to open database file manually: {}", e),
    }
    Ok(())
}

async fn run_tasks(metadata: &MetadataStore, tasks: &Tasks) -> Result<()> {
    if tasks.migrate {
        tracing::info!("Database migration complete.");
    }

    if tasks.seed_subjects {
        let inserted = metadata.seed_subjects().await?;
        tracing::info!("Seeded {} subjects", inserted);
    }

    if let Some(email) = &tasks.grant_admin {
        let user = metadata.upsert_user(email, true).await?;
        let token = metadata
            .create_session(user.id, Duration::days(ADMIN_SESSION_DAYS))
            .await?;
        tracing::info!(user_id = %user.id, "granted admin to {}", user.email);
        println!("{}", token);
    }

    Ok(())
}
