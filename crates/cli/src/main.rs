//! `qcretry`: inspect and retry failed images in a JSON QC store.

mod processor;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use qcretry_core::{ExecutionId, FailurePolicy, ImageId, ImageRecord, ProcessingSettings, QcStatus, Step};
use qcretry_events::RetryEventPayload;
use qcretry_infra::{JsonFileQcStore, QcStatusStore, RetryConfig, RetryRequest, RetryService};
use qcretry_observability::LogFormat;

use crate::processor::LocalCopyProcessor;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path of the JSON QC store
    #[arg(long, env = "QCRETRY_STORE_PATH", global = true)]
    store: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Log as JSON lines instead of human-readable text
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Add image records from a JSON array file
    Import { file: PathBuf },
    /// List images by QC status (default: qc_failed)
    List {
        #[arg(long, default_value = "qc_failed")]
        status: QcStatus,
        /// Only images from this execution
        #[arg(long)]
        execution: Option<String>,
    },
    /// Show one image record
    Show { id: String },
    /// Approve a failed image without reprocessing
    Approve { id: String },
    /// Send an image back to the failed pool
    Reject {
        id: String,
        #[arg(long)]
        reason: String,
    },
    /// Delete an image record
    Delete { id: String },
    /// Retry images and wait for the batch to finish
    Retry {
        #[arg(required = true)]
        ids: Vec<String>,
        /// Settings JSON applied to every image instead of the stored ones
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        include_metadata: bool,
        /// Steps that hard-fail (enables the explicit failure policy)
        #[arg(long, value_delimiter = ',')]
        hard_fail: Vec<Step>,
        /// Where retried images are written
        #[arg(long, env = "QCRETRY_OUTPUT_DIR")]
        output_dir: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    qcretry_observability::init_with(if args.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let config = RetryConfig::from_env();
    let store_path = args
        .store
        .clone()
        .or_else(|| config.store_path.clone())
        .context("no QC store given (use --store or QCRETRY_STORE_PATH)")?;
    let store = Arc::new(
        JsonFileQcStore::open(&store_path)
            .with_context(|| format!("opening QC store {}", store_path.display()))?,
    );
    let service = RetryService::in_memory(store.clone());

    match args.command {
        Command::Import { file } => {
            let raw = std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let records: Vec<ImageRecord> = serde_json::from_slice(&raw)
                .with_context(|| format!("parsing {}", file.display()))?;
            let count = records.len();
            for record in records {
                let id = record.id.clone();
                store
                    .insert(record)
                    .with_context(|| format!("importing {id}"))?;
            }
            info!(count, "imported image records");
            print(args.json, &serde_json::json!({ "imported": count }), || {
                format!("imported {count} image(s)")
            })?;
        }
        Command::List { status, execution } => {
            let mut records = service.get_images_by_status(status)?;
            if let Some(execution) = execution {
                let execution = ExecutionId::parse(execution)?;
                records.retain(|r| r.execution_id == execution);
            }
            print(args.json, &records, || {
                records
                    .iter()
                    .map(|r| {
                        format!(
                            "{}\t{}\t{}",
                            r.id,
                            r.qc_status,
                            r.qc_reason.as_deref().unwrap_or("-")
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n")
            })?;
        }
        Command::Show { id } => {
            let record = service.get_image(&ImageId::parse(id)?)?;
            print(true, &record, String::new)?;
        }
        Command::Approve { id } => {
            let record = service.approve_image(&ImageId::parse(id)?)?;
            print(args.json, &record, || format!("{} approved", record.id))?;
        }
        Command::Reject { id, reason } => {
            let record = service.reject_image(&ImageId::parse(id)?, reason)?;
            print(args.json, &record, || format!("{} returned to qc_failed", record.id))?;
        }
        Command::Delete { id } => {
            let record = service.delete_image(&ImageId::parse(id)?)?;
            print(args.json, &record, || format!("{} deleted", record.id))?;
        }
        Command::Retry {
            ids,
            settings,
            include_metadata,
            hard_fail,
            output_dir,
        } => {
            let image_ids = ids
                .into_iter()
                .map(ImageId::parse)
                .collect::<Result<Vec<_>, _>>()?;
            let mut request = match settings {
                Some(path) => {
                    let raw = std::fs::read(&path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    let settings: ProcessingSettings = serde_json::from_slice(&raw)
                        .with_context(|| format!("parsing {}", path.display()))?;
                    RetryRequest::modified(image_ids, settings)
                }
                None => RetryRequest::original(image_ids),
            }
            .with_metadata(include_metadata);
            if !hard_fail.is_empty() {
                request = request.with_failure_policy(FailurePolicy::hard_fail_on(hard_fail));
            }

            let output_dir = output_dir
                .or_else(|| config.output_dir.clone())
                .or_else(|| store_path.parent().map(|p| p.join("retried")))
                .context("no output directory")?;
            let config = config.with_output_dir(output_dir.clone());

            if !args.json {
                service.on_progress(|event| {
                    if let RetryEventPayload::ImageCompleted(done) = &event.payload {
                        eprintln!(
                            "{}: {:?}{}",
                            done.image_id,
                            done.outcome,
                            done.reason
                                .as_deref()
                                .map(|r| format!(" ({r})"))
                                .unwrap_or_default()
                        );
                    }
                });
            }

            let job = service.submit(request)?;
            let worker = service.worker(Arc::new(LocalCopyProcessor::new(output_dir)), config);
            worker.run_until_idle()?;

            let job = service.get_job(job.id)?;
            if let Some(error) = &job.error {
                bail!("retry job {} failed: {error}", job.id);
            }
            print(args.json, &job, || {
                format!(
                    "job {}: {} approved, {} failed, {} skipped",
                    job.id,
                    job.success_count,
                    job.failure_count,
                    job.skipped_image_ids.len()
                )
            })?;
        }
    }

    Ok(())
}

fn print<T: Serialize>(json: bool, value: &T, text: impl FnOnce() -> String) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(value)?);
    } else {
        println!("{}", text());
    }
    Ok(())
}
