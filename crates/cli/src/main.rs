use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use cloudstash_engine::{
    ListOptions, Method, SignedUrlOptions, StorageConfig, StorageService, UploadOptions, validate,
};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod settings;

const DEFAULT_LOG_LEVEL: &str = "warn";

use settings::{CliConfig, parse_key_value};

#[derive(Parser, Debug)]
#[command(author, version, about = "Cloudstash - upload, inspect and share objects on OSS and COS", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// TOML configuration file; STORAGE_* environment variables otherwise.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Overrides `log_level` from the config file. Defaults to `warn`.
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Check the configuration without contacting the provider.
    Validate,
    Upload {
        file: PathBuf,
        #[arg(long, default_value = "uploads")]
        category: String,
        #[arg(long)]
        content_type: Option<String>,
        #[arg(long)]
        public: bool,
        #[arg(long = "meta", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
        /// Use multipart upload regardless of size.
        #[arg(long)]
        multipart: bool,
    },
    Head {
        key: String,
    },
    Exists {
        key: String,
    },
    Ls {
        #[arg(long)]
        prefix: Option<String>,
        #[arg(long)]
        delimiter: Option<String>,
        #[arg(long)]
        max_keys: Option<u32>,
        #[arg(long)]
        marker: Option<String>,
        /// Follow continuation markers until the listing is exhausted.
        #[arg(long, conflicts_with_all = ["delimiter", "max_keys", "marker"])]
        all: bool,
    },
    Rm {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    Cp {
        source: String,
        target: String,
    },
    Mv {
        source: String,
        target: String,
    },
    Url {
        key: String,
        /// Time-limited signed URL.
        #[arg(long, conflicts_with = "best")]
        signed: bool,
        #[arg(long, help = "Signed URL lifetime in seconds")]
        expires: Option<u64>,
        #[arg(long, default_value = "GET")]
        method: String,
        #[arg(long)]
        response_content_type: Option<String>,
        #[arg(long)]
        response_content_disposition: Option<String>,
        /// CDN URL for large objects, public URL otherwise.
        #[arg(long)]
        best: bool,
        #[arg(long, help = "Known object size in bytes, skips the metadata lookup")]
        size: Option<u64>,
    },
    /// Discard an unfinished multipart upload.
    Abort {
        key: String,
        upload_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load(cli.config.as_deref()).await?;

    setup_tracing(log_level(cli.log_level.as_deref(), config.log_level.as_deref()));

    match cli.command {
        Commands::Validate => run_validate(&config),
        command => {
            let storage = StorageConfig::from_settings(config.storage).context(
                "storage configuration is invalid, run `cloudstash validate` for details",
            )?;
            execute(command, StorageService::new(storage)?).await
        }
    }
}

async fn execute(command: Commands, service: StorageService) -> Result<()> {
    match command {
        // Needs no connection; handled in main.
        Commands::Validate => {}
        Commands::Upload {
            file,
            category,
            content_type,
            public,
            metadata,
            multipart,
        } => {
            let data = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let filename = file
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
                .to_string();

            let mut options = UploadOptions::new(category)
                .public(public)
                .on_progress(|p| {
                    tracing::info!(
                        completed_parts = p.completed_parts,
                        total_parts = p.total_parts,
                        bytes_uploaded = p.bytes_uploaded,
                        total_bytes = p.total_bytes,
                        "Upload progress"
                    );
                });
            if let Some(content_type) = content_type {
                options = options.content_type(content_type);
            }
            options.metadata.extend(metadata);

            let result = if multipart {
                service.upload_multipart(data, &filename, options).await?
            } else {
                service.upload(data, &filename, options).await?
            };
            print_json(&result)?;
        }
        Commands::Head { key } => {
            print_json(&service.get_metadata(&key).await?)?;
        }
        Commands::Exists { key } => {
            let exists = service.exists(&key).await;
            println!("{}", exists);
            if !exists {
                std::process::exit(1);
            }
        }
        Commands::Ls {
            prefix,
            delimiter,
            max_keys,
            marker,
            all,
        } => {
            if all {
                let objects = service.list_all(prefix.as_deref().unwrap_or_default()).await?;
                print_json(&objects)?;
            } else {
                let options = ListOptions {
                    prefix,
                    delimiter,
                    max_keys,
                    marker,
                };
                print_json(&service.list(&options).await?)?;
            }
        }
        Commands::Rm { keys } => {
            if let [key] = keys.as_slice() {
                service.delete(key).await?;
            } else {
                let failures = service.delete_multiple(&keys).await?;
                if !failures.is_empty() {
                    print_json(&failures)?;
                    bail!("{} of {} objects could not be deleted", failures.len(), keys.len());
                }
            }
        }
        Commands::Cp { source, target } => {
            let etag = service.copy(&source, &target).await?;
            print_json(&serde_json::json!({ "objectKey": target, "etag": etag }))?;
        }
        Commands::Mv { source, target } => {
            let etag = service.move_object(&source, &target).await?;
            print_json(&serde_json::json!({ "objectKey": target, "etag": etag }))?;
        }
        Commands::Url {
            key,
            signed,
            expires,
            method,
            response_content_type,
            response_content_disposition,
            best,
            size,
        } => {
            let url = if signed {
                let options = SignedUrlOptions {
                    expires_in: expires
                        .map(Duration::from_secs)
                        .unwrap_or_else(|| service.config().tuning().signed_url_ttl()),
                    method: method.parse::<Method>()?,
                    response_content_type,
                    response_content_disposition,
                };
                service.signed_url(&key, &options)
            } else if best {
                service.best_url(&key, size).await
            } else {
                service.public_url(&key)
            };
            println!("{}", url);
        }
        Commands::Abort { key, upload_id } => {
            service.abort_multipart(&key, &upload_id).await?;
        }
    }

    Ok(())
}

fn run_validate(config: &CliConfig) -> Result<()> {
    let report = validate(&config.storage);

    for warning in &report.warnings {
        eprintln!("warning: {}", warning);
    }
    for error in &report.errors {
        eprintln!("error: {}", error);
    }

    if !report.valid {
        bail!("configuration has {} error(s)", report.errors.len());
    }

    println!("configuration is valid");
    Ok(())
}

/// Flag first, then the config file.
fn log_level<'a>(flag: Option<&'a str>, file: Option<&'a str>) -> &'a str {
    flag.or(file).unwrap_or(DEFAULT_LOG_LEVEL)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn setup_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    // stdout carries command output.
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
