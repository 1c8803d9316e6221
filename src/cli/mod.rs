//! Command-line interface for stagehand.
//!
//! Provides commands for running a stage, previewing its settle order,
//! inspecting and clearing recorded signatures, and listing stages.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::error;

use crate::config::ResolvedConfig;
use crate::core::{
    settle_order, EngineError, Orchestrator, RunLock, SignatureStore, SqliteSignatureStore,
};
use crate::domain::{RunReport, StageId};
use crate::stages::StageFile;

/// stagehand - Signature-based incremental stage runner
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Stage file to use (overrides config and STAGEHAND_STAGES)
    #[arg(long, global = true)]
    pub stages: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Bring a stage and its dependencies up to date
    Run {
        /// Stage name
        stage: String,

        /// Invalidate and re-execute the stage even if its signature is unchanged
        #[arg(short, long)]
        force: bool,
    },

    /// Show the order stages would be settled in
    Plan {
        /// Stage name
        stage: String,
    },

    /// Show recorded signatures
    Status,

    /// Drop the recorded signature of a stage so the next run re-executes it
    Forget {
        /// Stage name
        stage: String,
    },

    /// List stages defined in the stage file
    Stages,

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        let mut config = ResolvedConfig::load()?;
        if let Some(stages) = self.stages {
            config.stages_file = stages;
        }

        match self.command {
            Commands::Run { stage, force } => run_stage(&config, &stage, force).await,
            Commands::Plan { stage } => show_plan(&config, &stage),
            Commands::Status => show_status(&config),
            Commands::Forget { stage } => forget_stage(&config, &stage),
            Commands::Stages => list_stages(&config),
            Commands::Config => show_config(&config),
        }
    }
}

/// Load and validate the stage file
fn load_stage_file(config: &ResolvedConfig) -> Result<StageFile> {
    let file = StageFile::from_file(&config.stages_file)?;
    file.validate()
        .with_context(|| format!("Invalid stage file: {}", config.stages_file.display()))?;
    Ok(file)
}

fn open_store(config: &ResolvedConfig) -> Result<SqliteSignatureStore> {
    let path = config.database_path();
    SqliteSignatureStore::open(&path)
        .with_context(|| format!("Failed to open signature store: {}", path.display()))
}

/// Run a stage
async fn run_stage(config: &ResolvedConfig, stage: &str, force: bool) -> Result<()> {
    let file = load_stage_file(config)?;
    let registry = file.registry();
    let _lock = RunLock::acquire(config.lock_path())?;
    let mut store = open_store(config)?;

    let root = StageId::from(stage);
    let mut orchestrator = Orchestrator::new(&registry, config, &mut store);

    match orchestrator.run(&root, force).await {
        Ok(report) => {
            print_report(&report);
            Ok(())
        }
        Err(e) => {
            let failed = e.stage().map(StageId::to_string);
            error!(stage = failed.as_deref().unwrap_or("-"), "Run failed");
            eprintln!(
                "\n[Run of '{}' failed at stage '{}']",
                root,
                failed.as_deref().unwrap_or(root.as_str())
            );
            Err(anyhow::Error::new(e))
        }
    }
}

fn print_report(report: &RunReport) {
    for stage in &report.stages {
        let verb = if stage.executed() {
            if stage.previous.is_some() {
                "rebuilt"
            } else {
                "built"
            }
        } else {
            "up to date"
        };
        println!(
            "{:<12} {} [{}] ({}ms)",
            verb,
            stage.stage,
            stage.signature.digest(),
            stage.duration_ms
        );
    }

    eprintln!(
        "\n[Run {} completed: {} executed, {} skipped]",
        report.run_id,
        report.executed().len(),
        report.skipped().len()
    );
}

/// Show settle order for a stage
fn show_plan(config: &ResolvedConfig, stage: &str) -> Result<()> {
    let file = load_stage_file(config)?;
    let registry = file.registry();

    let order =
        settle_order(&registry, config, &StageId::from(stage)).map_err(anyhow::Error::new)?;

    for (i, id) in order.iter().enumerate() {
        println!("{:>3}. {}", i + 1, id);
    }

    Ok(())
}

/// Show recorded signatures
fn show_status(config: &ResolvedConfig) -> Result<()> {
    if !config.database_path().exists() {
        println!("No stages recorded yet.");
        return Ok(());
    }

    let mut store = open_store(config)?;
    let store: &mut dyn SignatureStore = &mut store;
    let records = store.with_transaction(|tx| tx.records())?;

    if records.is_empty() {
        println!("No stages recorded yet.");
        return Ok(());
    }

    println!("{:<30} {:<18} RECORDED", "STAGE", "SIGNATURE");
    println!("{}", "-".repeat(72));
    for record in records {
        println!(
            "{:<30} {:<18} {}",
            record.stage,
            record.signature.digest(),
            record.recorded_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Delete the record of a stage
fn forget_stage(config: &ResolvedConfig, stage: &str) -> Result<()> {
    let _lock = RunLock::acquire(config.lock_path())?;
    let mut store = open_store(config)?;
    let store: &mut dyn SignatureStore = &mut store;
    let id = StageId::from(stage);

    let existed = store.with_transaction(|tx| -> Result<bool, EngineError> {
        let existed = tx.get(&id)?.is_some();
        tx.delete(&id)?;
        Ok(existed)
    })?;

    if existed {
        println!("Forgot stage '{}'; it will re-execute on the next run", id);
    } else {
        println!("Stage '{}' has no recorded signature", id);
    }

    Ok(())
}

/// List stages from the stage file
fn list_stages(config: &ResolvedConfig) -> Result<()> {
    let file = load_stage_file(config)?;

    for stage in &file.stages {
        if stage.depends_on.is_empty() {
            println!("{} ({:?})", stage.name, stage.kind);
        } else {
            println!(
                "{} ({:?}) <- {}",
                stage.name,
                stage.kind,
                stage.depends_on.join(", ")
            );
        }
    }

    Ok(())
}

/// Show resolved configuration
fn show_config(config: &ResolvedConfig) -> Result<()> {
    println!("Project root: {}", config.project_root.display());
    println!("Home:         {}", config.home.display());
    println!("Stage file:   {}", config.stages_file.display());
    println!("Database:     {}", config.database_path().display());
    println!("Shell:        {}", config.shell);
    match config.timeout_seconds {
        Some(seconds) => println!("Timeout:      {}s", seconds),
        None => println!("Timeout:      none"),
    }
    match &config.config_file {
        Some(path) => println!("Config file:  {}", path.display()),
        None => println!("Config file:  (none, using defaults)"),
    }

    Ok(())
}
