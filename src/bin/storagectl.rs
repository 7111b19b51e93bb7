//! Command-line access to the configured storage backend
//!
//! Usage: cargo run --bin storagectl -- <command>
//!
//! Configuration is read from the environment (and a `.env` file, if present)
//! exactly as applications see it, so this is also a quick way to check that a
//! deployment's storage settings validate.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

use stowage::{
    Environment, SignedUrlRequest, StorageBackend, StorageContext, StorageError, UploadBody,
    UploadRequest,
};

#[derive(Parser)]
#[command(name = "storagectl")]
#[command(about = "Inspect and operate on the configured storage backend")]
struct Args {
    /// Use this backend instead of the one selected by STORAGE_BACKEND
    #[arg(short, long, global = true)]
    backend: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and print it with secrets redacted
    Config,

    /// List registered backend identifiers
    Backends,

    /// Upload a local file
    Put {
        key: String,
        file: PathBuf,
        /// Defaults to a guess from the file extension
        #[arg(long)]
        content_type: Option<String>,
    },

    /// Download an object to a file, or to stdout
    Get {
        key: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Delete an object
    Rm { key: String },

    /// Exit with status 0 if the object exists, 1 otherwise
    Exists { key: String },

    /// Print a time-limited URL for an object
    Sign {
        key: String,
        /// Sign an upload URL instead of a download URL
        #[arg(long, requires = "content_type")]
        write: bool,
        #[arg(long)]
        content_type: Option<String>,
        /// Lifetime in seconds (defaults to STORAGE_SIGNED_URL_TTL)
        #[arg(long)]
        expires_in: Option<u64>,
    },
}

fn resolve_backend(context: &StorageContext, identifier: Option<&str>) -> Result<Arc<dyn StorageBackend>> {
    let backend = match identifier {
        Some(identifier) => context.get_backend(identifier),
        None => context.backend(),
    };
    backend.map_err(report)
}

/// Log a storage error with its structured details before handing it to anyhow
fn report(err: StorageError) -> anyhow::Error {
    error!("{} ({}): {}", err.kind().code(), err.http_status(), err.details());
    anyhow::Error::new(err)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let context = StorageContext::with_builtin_backends(Environment::process_with_dotenv());

    match args.command {
        Command::Config => {
            let config = context.config().map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&config.common)?);
            let identifier = &config.common.backend_identifier;
            match config.backend_summary(identifier) {
                Some(summary) => println!("{}: {}", identifier, summary),
                None => println!("{}: no settings schema registered", identifier),
            }
        }

        Command::Backends => {
            for identifier in context.registry().list_registered() {
                println!("{}", identifier);
            }
        }

        Command::Put {
            key,
            file,
            content_type,
        } => {
            let backend = resolve_backend(&context, args.backend.as_deref())?;
            let content_type = content_type.unwrap_or_else(|| {
                mime_guess::from_path(&file)
                    .first_or_octet_stream()
                    .essence_str()
                    .to_string()
            });

            let handle = tokio::fs::File::open(&file)
                .await
                .with_context(|| format!("failed to open {}", file.display()))?;
            let length = handle.metadata().await?.len();

            let request = UploadRequest::new(&key, UploadBody::from_stream(ReaderStream::new(handle)), content_type)
                .with_content_length(length);
            let result = backend.upload(request).await.map_err(report)?;

            info!("Uploaded {} to '{}' via {}", file.display(), result.key, backend.name());
            println!("{}", serde_json::to_string_pretty(&result)?);
        }

        Command::Get { key, output } => {
            let backend = resolve_backend(&context, args.backend.as_deref())?;
            let mut stream = backend.download(&key).await.map_err(report)?;

            let mut sink: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match &output {
                Some(path) => Box::new(
                    tokio::fs::File::create(path)
                        .await
                        .with_context(|| format!("failed to create {}", path.display()))?,
                ),
                None => Box::new(tokio::io::stdout()),
            };

            let mut written: u64 = 0;
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.with_context(|| format!("failed reading '{}'", key))?;
                written += chunk.len() as u64;
                sink.write_all(&chunk).await?;
            }
            sink.flush().await?;
            info!("Downloaded '{}' ({} bytes)", key, written);
        }

        Command::Rm { key } => {
            let backend = resolve_backend(&context, args.backend.as_deref())?;
            backend.delete(&key).await.map_err(report)?;
            info!("Deleted '{}'", key);
        }

        Command::Exists { key } => {
            let backend = resolve_backend(&context, args.backend.as_deref())?;
            let exists = backend.exists(&key).await.map_err(report)?;
            println!("{}", exists);
            if !exists {
                std::process::exit(1);
            }
        }

        Command::Sign {
            key,
            write,
            content_type,
            expires_in,
        } => {
            let backend = resolve_backend(&context, args.backend.as_deref())?;
            let mut request = if write {
                SignedUrlRequest::write(&key, content_type.unwrap_or_default())
            } else {
                SignedUrlRequest::read(&key)
            };
            if let Some(seconds) = expires_in {
                request = request.expires_in(seconds);
            }

            let signed = backend.get_signed_url(request).await.map_err(report)?;
            println!("{}", serde_json::to_string_pretty(&signed)?);
        }
    }

    Ok(())
}
