//! Command-line interface for exportd
//!
//! This module handles:
//! - Command-line argument parsing using clap
//! - Configuration loading and CLI overrides
//! - Dispatch of subcommands to the export service

pub mod completion;
pub mod watch;

use clap::{Parser, Subcommand};
use clap_complete::Shell;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::config::{Config, LogLevel, StoreBackend};
use crate::error::{ConfigError, Result};
use crate::formatter::{Formatter, OutputMode};
use crate::model::{ExportFilters, ExportFormat, JobPriority, JobStatus, TaskRecord};
use crate::service::{Exporter, wait_terminal};
use crate::store::MemoryRecordStore;

/// Resumable background exports of task records to CSV and JSON
#[derive(Parser, Debug)]
#[command(
    name = "exportd",
    version,
    about = "Resumable background export service",
    long_about = "Runs and controls resumable CSV/JSON exports: a priority job queue, a worker \
pool, and a checkpointed streaming pipeline with pause, resume and cancel."
)]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short = 'c', long = "config", value_name = "FILE", global = true)]
    pub config_file: Option<PathBuf>,

    /// Storage backend
    #[arg(long, value_enum, global = true)]
    pub backend: Option<StoreBackend>,

    /// MongoDB connection URI
    #[arg(long, value_name = "URI", global = true)]
    pub uri: Option<String>,

    /// Database holding jobs and records
    #[arg(long, value_name = "NAME", global = true)]
    pub database: Option<String>,

    /// Number of export workers
    #[arg(long, value_name = "N", global = true)]
    pub workers: Option<usize>,

    /// Directory for export artifacts
    #[arg(long, value_name = "DIR", global = true)]
    pub temp_dir: Option<PathBuf>,

    /// JSON file with task records (memory backend)
    #[arg(long, value_name = "FILE", global = true)]
    pub records: Option<PathBuf>,

    /// Print machine-readable JSON
    #[arg(long, global = true)]
    pub json: bool,

    /// Disable colored output
    #[arg(long = "no-color", global = true)]
    pub no_color: bool,

    /// Verbose mode (debug logging)
    #[arg(short = 'v', long, global = true)]
    pub verbose: bool,

    /// Very verbose mode (trace logging)
    #[arg(long = "vv", global = true)]
    pub very_verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands for exportd
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run workers, recovery, stall monitor and sweeper until Ctrl+C
    Serve {
        /// Print every status event
        #[arg(long)]
        events: bool,
    },

    /// Request an export
    Export {
        /// Output format (csv, json)
        #[arg(short = 'f', long, default_value = "csv")]
        format: ExportFormat,

        /// Filters as a JSON object
        #[arg(long, value_name = "JSON", conflicts_with = "filters_file")]
        filters: Option<String>,

        /// Filters from a JSON file
        #[arg(long, value_name = "FILE")]
        filters_file: Option<PathBuf>,

        /// Queue priority (high, normal, low)
        #[arg(short = 'p', long, default_value = "normal")]
        priority: JobPriority,

        /// Owning client reference
        #[arg(long, value_name = "ID")]
        client: Option<String>,

        /// Follow progress until the job finishes; Ctrl+C pauses it
        #[arg(short = 'w', long)]
        watch: bool,

        /// Run the job in this process instead of a separate `serve`
        #[arg(long)]
        local: bool,

        /// Save the finished artifact here
        #[arg(short = 'o', long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Show one job
    Status {
        job_id: String,
    },

    /// List jobs, newest first
    History {
        #[arg(long, default_value_t = 1)]
        page: u64,

        #[arg(long, default_value_t = 20)]
        limit: u64,
    },

    /// Pause a processing job
    Pause {
        job_id: String,
    },

    /// Resume a paused job
    Resume {
        job_id: String,
    },

    /// Cancel a processing or paused job
    Cancel {
        job_id: String,
    },

    /// Save the artifact of a completed job
    Download {
        job_id: String,

        /// Destination path (defaults to the export's filename)
        #[arg(short = 'o', long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Run one artifact sweep
    Sweep,

    /// Show configuration
    Config {
        /// Show effective configuration
        #[arg(long)]
        show: bool,

        /// Validate configuration file
        #[arg(long)]
        validate: bool,
    },

    /// Generate shell completion script
    Completion {
        #[arg(value_enum, value_name = "SHELL")]
        shell: Shell,
    },

    /// Show version information
    Version,
}

/// CLI interface handler
pub struct CliInterface {
    args: CliArgs,
    config: Config,
    formatter: Formatter,
}

impl CliInterface {
    /// Parse arguments and load configuration
    pub fn new() -> Result<Self> {
        Self::from_args(CliArgs::parse())
    }

    pub fn from_args(args: CliArgs) -> Result<Self> {
        let mut config = Config::load(args.config_file.as_deref())?;
        Self::apply_args_to_config(&mut config, &args);
        config.validate()?;

        let mode = if args.json {
            OutputMode::Json
        } else {
            OutputMode::Table
        };
        let formatter = Formatter::new(mode, !args.no_color);
        Ok(Self {
            args,
            config,
            formatter,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn args(&self) -> &CliArgs {
        &self.args
    }

    /// Override configuration values with flags that were given
    fn apply_args_to_config(config: &mut Config, args: &CliArgs) {
        if let Some(backend) = args.backend {
            config.store.backend = backend;
        }
        if let Some(ref uri) = args.uri {
            config.store.uri = uri.clone();
        }
        if let Some(ref database) = args.database {
            config.store.database = database.clone();
        }
        if let Some(workers) = args.workers {
            config.workers.count = workers;
        }
        if let Some(ref dir) = args.temp_dir {
            config.pipeline.temp_dir = dir.clone();
        }

        config.logging.level = if args.very_verbose {
            LogLevel::Trace
        } else if args.verbose {
            LogLevel::Debug
        } else {
            config.logging.level
        };
    }

    /// Run the selected subcommand
    pub async fn run(&self) -> Result<()> {
        match &self.args.command {
            Commands::Version => {
                self.show_version();
                Ok(())
            }
            Commands::Completion { shell } => {
                completion::generate_completion(*shell);
                Ok(())
            }
            Commands::Config { show, validate } => self.handle_config_command(*show, *validate),
            Commands::Serve { events } => self.serve(*events).await,
            Commands::Export {
                format,
                filters,
                filters_file,
                priority,
                client,
                watch,
                local,
                output,
            } => {
                let filters = parse_filters(filters.as_deref(), filters_file.as_deref())?;
                let request = ExportRequest {
                    format: *format,
                    filters,
                    priority: *priority,
                    client: client.clone(),
                    watch: *watch,
                    local: *local,
                    output: output.clone(),
                };
                self.export(request).await
            }
            Commands::Status { job_id } => {
                let exporter = self.connect().await?;
                let result = exporter.get_status(job_id).await;
                self.finish(&exporter, result.and_then(|job| self.formatter.format_job(&job)))
                    .await
            }
            Commands::History { page, limit } => {
                let exporter = self.connect().await?;
                let result = exporter.get_history(*page, *limit).await;
                self.finish(
                    &exporter,
                    result.and_then(|page| self.formatter.format_history(&page)),
                )
                .await
            }
            Commands::Pause { job_id } => {
                let exporter = self.connect().await?;
                let result = exporter.pause_export(job_id).await;
                self.finish(&exporter, result.and_then(|job| self.formatter.format_job(&job)))
                    .await
            }
            Commands::Resume { job_id } => {
                let exporter = self.connect().await?;
                let result = exporter.resume_export(job_id).await;
                self.finish(&exporter, result.and_then(|job| self.formatter.format_job(&job)))
                    .await
            }
            Commands::Cancel { job_id } => {
                let exporter = self.connect().await?;
                let result = exporter.cancel_export(job_id).await;
                self.finish(&exporter, result.and_then(|job| self.formatter.format_job(&job)))
                    .await
            }
            Commands::Download { job_id, output } => {
                let exporter = self.connect().await?;
                let result = self.download(&exporter, job_id, output.as_deref()).await;
                self.finish(&exporter, result).await
            }
            Commands::Sweep => {
                let exporter = self.connect().await?;
                let result = exporter.sweep().await;
                self.finish(
                    &exporter,
                    result.and_then(|report| self.formatter.format_sweep(&report)),
                )
                .await
            }
        }
    }

    /// Build the service for the configured backend
    async fn connect(&self) -> Result<Exporter> {
        match self.config.store.backend {
            StoreBackend::Memory => {
                let records = match self.args.records {
                    Some(ref path) => load_records(path).await?,
                    None => Vec::new(),
                };
                info!(records = records.len(), "using in-memory store");
                let store = Arc::new(MemoryRecordStore::with_records(records));
                Ok(Exporter::in_memory(self.config.clone(), store))
            }
            StoreBackend::Mongodb => Exporter::connect(self.config.clone()).await,
        }
    }

    /// Print the output, shut the service down, then surface any error
    async fn finish(&self, exporter: &Exporter, output: Result<String>) -> Result<()> {
        let printed = output.map(|text| println!("{text}"));
        exporter.shutdown().await;
        printed
    }

    async fn serve(&self, print_events: bool) -> Result<()> {
        let exporter = self.connect().await?;
        let mut events = exporter.subscribe();
        let report = exporter.start().await?;
        println!("{}", self.formatter.format_recovery(&report)?);

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                event = events.recv() => match event {
                    Ok(event) if print_events => println!("{}", self.formatter.format_event(&event)?),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
        exporter.shutdown().await;
        Ok(())
    }

    async fn export(&self, request: ExportRequest) -> Result<()> {
        let exporter = self.connect().await?;
        let local = request.local || self.config.store.backend == StoreBackend::Memory;
        if local {
            exporter.start().await?;
        }
        let result = self.run_export(&exporter, &request, local).await;
        exporter.shutdown().await;
        result
    }

    async fn run_export(&self, exporter: &Exporter, request: &ExportRequest, local: bool) -> Result<()> {
        let mut events = exporter.subscribe();
        let lookup = exporter
            .start_export_with(
                request.format,
                request.filters.clone(),
                request.client.clone(),
                request.priority,
            )
            .await?;
        println!("{}", self.formatter.format_lookup(&lookup)?);
        let job_id = lookup.job().id.clone();

        if request.watch {
            let show_bar = self.formatter.mode() == OutputMode::Table;
            let job = watch::watch_job(exporter, &job_id, show_bar).await?;
            println!("{}", self.formatter.format_job(&job)?);
        } else if local || request.output.is_some() {
            // A local run ends with the process, so wait for it.
            if !exporter.get_status(&job_id).await?.status.is_terminal() {
                wait_terminal(&mut events, &job_id).await;
            }
        }

        if let Some(ref output) = request.output {
            let job = exporter.get_status(&job_id).await?;
            if job.status == JobStatus::Completed {
                println!("{}", self.download(exporter, &job_id, Some(output)).await?);
            }
        }
        Ok(())
    }

    async fn download(&self, exporter: &Exporter, job_id: &str, output: Option<&Path>) -> Result<String> {
        let download = exporter.download_export(job_id).await?;
        let dest = match output {
            Some(path) if path.is_dir() => path.join(&download.filename),
            Some(path) => path.to_path_buf(),
            None => PathBuf::from(&download.filename),
        };
        let content_type = download.content_type;
        let bytes = download.save_to(&dest).await?;
        self.formatter.format_message(&format!(
            "Saved {} ({}, {} bytes)",
            dest.display(),
            content_type,
            bytes
        ))
    }

    fn show_version(&self) {
        println!("exportd version {}", env!("CARGO_PKG_VERSION"));
        println!("Rust version: {}", env!("CARGO_PKG_RUST_VERSION"));
    }

    fn handle_config_command(&self, show: bool, validate: bool) -> Result<()> {
        if validate {
            let path = self
                .args
                .config_file
                .clone()
                .unwrap_or_else(Config::default_path);
            if !path.exists() {
                return Err(ConfigError::FileNotFound(path.display().to_string()).into());
            }
            Config::from_file(&path)?.validate()?;
            println!("Configuration file is valid: {}", path.display());
        }
        if show || !validate {
            print!("{}", self.config.to_toml()?);
        }
        Ok(())
    }
}

/// Parameters of `exportd export`
#[derive(Debug)]
struct ExportRequest {
    format: ExportFormat,
    filters: ExportFilters,
    priority: JobPriority,
    client: Option<String>,
    watch: bool,
    local: bool,
    output: Option<PathBuf>,
}

fn parse_filters(inline: Option<&str>, file: Option<&Path>) -> Result<ExportFilters> {
    let text = match (inline, file) {
        (Some(text), _) => text.to_string(),
        (None, Some(path)) => std::fs::read_to_string(path)?,
        (None, None) => return Ok(ExportFilters::default()),
    };
    Ok(serde_json::from_str(&text)?)
}

async fn load_records(path: &Path) -> Result<Vec<TaskRecord>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}
