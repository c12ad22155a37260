#![forbid(unsafe_code)]

//! `lab-orchestrator-ctl` — operator CLI for `lab-orchestrator`.
//!
//! Works directly against the status database: registers and releases
//! pool instances, seeds the template catalog, and inspects sessions.
//! Output is pretty-printed JSON.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use lab_orchestrator::models::pool::PoolInstance;
use lab_orchestrator::models::template::LabTemplate;
use lab_orchestrator::persistence::db;
use lab_orchestrator::persistence::pool_repo::PoolRepo;
use lab_orchestrator::persistence::session_repo::SessionRepo;
use lab_orchestrator::persistence::template_repo::TemplateRepo;
use lab_orchestrator::{AppError, Result};

#[derive(Debug, Parser)]
#[command(
    name = "lab-orchestrator-ctl",
    about = "Operator CLI for lab-orchestrator",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the `SQLite` status database.
    #[arg(long, default_value = "data/lab-orchestrator.db")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Manage the shared instance pool.
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },

    /// Manage the lab template catalog.
    Templates {
        #[command(subcommand)]
        action: TemplateAction,
    },

    /// Inspect pooled sessions.
    Sessions {
        #[command(subcommand)]
        action: SessionAction,
    },
}

#[derive(Debug, Subcommand)]
enum PoolAction {
    /// Add an instance to the pool as `available`.
    Register {
        /// Compute backend instance identifier.
        instance_id: String,
    },

    /// List every pool instance.
    List,

    /// Force an instance back to `available`.
    Release {
        /// Compute backend instance identifier.
        instance_id: String,
    },
}

#[derive(Debug, Subcommand)]
enum TemplateAction {
    /// Insert or update templates from a JSON array file.
    Seed {
        /// JSON file holding an array of templates.
        file: PathBuf,
    },

    /// List active templates.
    List {
        /// Only templates of this lab type.
        #[arg(long = "type")]
        lab_type: Option<String>,
    },
}

#[derive(Debug, Subcommand)]
enum SessionAction {
    /// List a student's sessions, newest first.
    List {
        /// Owning student.
        #[arg(long)]
        student: String,
    },
}

fn main() {
    let args = Cli::parse();

    let outcome = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))
        .and_then(|runtime| runtime.block_on(run(args)));

    if let Err(err) = outcome {
        eprintln!("Error: {err}");
        std::process::exit(1);
    }
}

async fn run(args: Cli) -> Result<()> {
    let db_path = args.db.to_string_lossy().to_string();
    let db = Arc::new(db::connect(&db_path).await?);

    match args.command {
        Command::Pool { action } => {
            let repo = PoolRepo::new(db);
            match action {
                PoolAction::Register { instance_id } => {
                    let inserted = repo
                        .register(&PoolInstance::available(instance_id.clone()))
                        .await?;
                    if !inserted {
                        return Err(AppError::Validation(format!(
                            "instance {instance_id} is already registered"
                        )));
                    }
                    print_json(&repo.get(&instance_id).await?)
                }
                PoolAction::List => print_json(&repo.list_all().await?),
                PoolAction::Release { instance_id } => {
                    if !repo.force_release(&instance_id).await? {
                        return Err(AppError::NotFound(format!(
                            "pool instance {instance_id} not found"
                        )));
                    }
                    print_json(&repo.get(&instance_id).await?)
                }
            }
        }
        Command::Templates { action } => {
            let repo = TemplateRepo::new(db);
            match action {
                TemplateAction::Seed { file } => {
                    let raw = std::fs::read_to_string(&file)
                        .map_err(|err| AppError::Io(format!("cannot read {}: {err}", file.display())))?;
                    let templates: Vec<LabTemplate> = serde_json::from_str(&raw).map_err(|err| {
                        AppError::Validation(format!("invalid template file: {err}"))
                    })?;
                    for template in &templates {
                        repo.upsert(template).await?;
                    }
                    println!("seeded {} templates", templates.len());
                    Ok(())
                }
                TemplateAction::List { lab_type } => {
                    print_json(&repo.list_active(lab_type.as_deref()).await?)
                }
            }
        }
        Command::Sessions { action } => match action {
            SessionAction::List { student } => {
                let repo = SessionRepo::new(db);
                print_json(&repo.list_by_student(&student).await?)
            }
        },
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let rendered = serde_json::to_string_pretty(value)
        .map_err(|err| AppError::Io(format!("failed to render output: {err}")))?;
    println!("{rendered}");
    Ok(())
}
