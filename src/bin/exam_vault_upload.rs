use anyhow::{Context, Result, bail};
use clap::Parser;
use exam_vault::client::{
    DocumentFile, HttpTransferChannel, SubjectRef, UploadClient, UploadRequest,
    request::ACCEPTED_CONTENT_TYPE,
};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::io::AsyncReadExt;
use tracing_subscriber::EnvFilter;

/// Command-line uploader for exam papers.
#[derive(Parser, Debug)]
#[command(author, version, about = "Upload an exam paper to an exam-vault gateway")]
struct Args {
    /// Gateway base URL
    #[arg(long, default_value = "http://localhost:3000")]
    server: String,

    /// Session token of an admin user (falls back to EXAM_VAULT_TOKEN)
    #[arg(long)]
    token: Option<String>,

    /// Provision the papers bucket before uploading
    #[arg(long)]
    init_storage: bool,

    /// Subject id
    #[arg(long)]
    subject: Option<String>,

    /// The subject is split into subcategories
    #[arg(long)]
    subject_has_subcategories: bool,

    /// Subcategory id
    #[arg(long)]
    sub_category: Option<String>,

    /// Exam year, four digits
    #[arg(long)]
    year: Option<String>,

    /// Optional topic
    #[arg(long)]
    topic: Option<String>,

    /// The PDF to upload
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let token = args
        .token
        .or_else(|| std::env::var("EXAM_VAULT_TOKEN").ok())
        .filter(|t| !t.trim().is_empty());

    let channel = Arc::new(
        HttpTransferChannel::new(&args.server, token).context("Failed to create HTTP client")?,
    );

    let admin = channel
        .check_admin()
        .await
        .context("Failed to check admin status")?;
    if !admin.is_admin {
        bail!("this token does not belong to an admin");
    }

    if args.init_storage {
        let response = channel
            .init_storage()
            .await
            .context("Failed to initialize storage")?;
        let message = response.body["message"]
            .as_str()
            .unwrap_or("Storage system is ready for uploads.");
        println!("{}", message);
    }

    let Some(path) = args.file else {
        if args.init_storage {
            return Ok(());
        }
        bail!("no file given");
    };

    let content_type = detect_content_type(&path).await?;
    let file = DocumentFile::from_path(&path, content_type)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let request = UploadRequest {
        file: Some(file),
        subject: args.subject.map(|id| SubjectRef {
            id,
            has_subcategories: args.subject_has_subcategories,
        }),
        sub_category_id: args.sub_category,
        year: args.year,
        topic: args.topic,
    };

    let mut client = UploadClient::new(channel).on_progress(|progress| {
        tracing::info!(
            attempt = progress.attempt + 1,
            percent = progress.percent,
            "upload progress"
        );
    });

    let cancel = client.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    match client.upload(&request).await {
        Ok(receipt) => {
            match receipt.paper {
                Some(paper) => println!("Uploaded paper {} -> {}", paper.id, paper.file_url),
                None => println!("Upload complete"),
            }
            Ok(())
        }
        Err(failure) => {
            tracing::debug!(error = %failure, "upload failed");
            bail!("{}", failure.user_message())
        }
    }
}

/// PDF by extension or by the `%PDF-` signature; anything else is
/// reported as generic bytes and rejected by validation.
async fn detect_content_type(path: &Path) -> Result<&'static str> {
    let by_extension = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("pdf"));
    if by_extension {
        return Ok(ACCEPTED_CONTENT_TYPE);
    }

    let mut magic = [0u8; 5];
    let mut handle = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("Failed to open {}", path.display()))?;
    let read = handle.read(&mut magic).await?;
    if &magic[..read] == b"%PDF-" {
        Ok(ACCEPTED_CONTENT_TYPE)
    } else {
        Ok("application/octet-stream")
    }
}
