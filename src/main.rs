// Copyright (c) 2024-2025 Jesse Morgan
// Licensed under the MIT License. See LICENSE file for details.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use playground::config::Settings;
use playground::download::{
    DownloadJob, DownloadManager, DownloadRequest, DownloadStatus, HubTransfer, ModelActivator,
};
use playground::local::LocalModelRegistry;
use playground::server::Server;

const VERSION: &str = env!("CARGO_PKG_VERSION");

// How often the download command refreshes its progress bar
const POLL_INTERVAL_MS: u64 = 200;
// Polls to wait for the activation note after completion
const ACTIVATION_WAIT_POLLS: u32 = 25;

// ANSI color codes for terminal output
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BOLD: &str = "\x1b[1m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const CYAN: &str = "\x1b[36m";
    pub const WHITE: &str = "\x1b[37m";
}

use colors::*;

/// Exit codes following sysexits.h conventions
mod exit_codes {
    /// General error - unspecified error
    pub const ERROR: i32 = 1;
    /// Configuration error - invalid or missing config
    pub const CONFIG: i32 = 78;
}

/// playground - model playground backend.
#[derive(Parser)]
#[command(name = "playground")]
#[command(version = VERSION)]
#[command(about = "Model playground backend with background Hugging Face downloads.")]
#[command(long_about = "playground - model playground backend\n\n\
    Start the API server:   playground serve\n\
    Download a model:       playground download Qwen/Qwen2.5-0.5B-Instruct\n\
    Show settings:          playground config\n\n\
    Settings come from <config dir>/playground/config.json and the environment.")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP API server
    ///
    /// Examples:
    ///   playground serve
    ///   playground serve --port 8080 --parallel 2
    Serve {
        /// Address to bind to
        #[arg(long)]
        host: Option<String>,
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,
        /// Concurrently running downloads (1 to 4)
        #[arg(long)]
        parallel: Option<usize>,
    },

    /// Download a model snapshot in the foreground
    ///
    /// Examples:
    ///   playground download Qwen/Qwen2.5-0.5B-Instruct
    ///   playground download meta-llama/Llama-3.2-1B --token hf_xxx --no-auto-load
    Download {
        /// Hub repository id (e.g. org/model)
        model_id: String,
        /// Branch, tag, or commit (defaults to main)
        #[arg(short, long)]
        revision: Option<String>,
        /// Hub access token (overrides HUGGINGFACE_TOKEN)
        #[arg(long)]
        token: Option<String>,
        /// Do not activate the model after download
        #[arg(long)]
        no_auto_load: bool,
        /// Print the final job record as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print effective settings (secrets masked)
    Config,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{RED}[✗]{RESET} Invalid configuration: {}", e);
            std::process::exit(exit_codes::CONFIG);
        }
    };

    match cli.command {
        Commands::Config => {
            show_config(&settings)?;
            Ok(())
        }
        command => {
            let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            runtime.block_on(run_async_command(command, settings))
        }
    }
}

async fn run_async_command(command: Commands, mut settings: Settings) -> Result<()> {
    match command {
        Commands::Serve { host, port, parallel } => {
            if let Some(host) = host {
                settings.backend_host = host;
            }
            if let Some(port) = port {
                settings.backend_port = port;
            }
            if let Some(parallel) = parallel {
                settings.huggingface_max_parallel_downloads = parallel;
            }
            if let Err(e) = settings.validate() {
                eprintln!("{RED}[✗]{RESET} {}", e);
                std::process::exit(exit_codes::CONFIG);
            }
            serve(settings).await
        }
        Commands::Download {
            model_id,
            revision,
            token,
            no_auto_load,
            json,
        } => {
            let mut request = DownloadRequest::new(model_id).with_auto_load(!no_auto_load);
            if let Some(revision) = revision {
                request = request.with_revision(revision);
            }
            if let Some(token) = token {
                request = request.with_token(token);
            }

            let job = download(settings, request, json).await?;
            if job.status != DownloadStatus::Completed {
                std::process::exit(exit_codes::ERROR);
            }
            Ok(())
        }
        Commands::Config => show_config(&settings),
    }
}

fn build_manager(settings: &Settings, registry: Arc<LocalModelRegistry>) -> DownloadManager {
    let transfer = Arc::new(HubTransfer::with_endpoint(settings.huggingface_endpoint.clone()));
    let activator: Arc<dyn ModelActivator> = registry;
    DownloadManager::new(settings.download_config(), transfer, Some(activator))
}

async fn serve(settings: Settings) -> Result<()> {
    let registry = Arc::new(LocalModelRegistry::new(settings.huggingface_download_path.clone()));
    let manager = build_manager(&settings, registry.clone());

    tracing::info!(
        download_path = %registry.root().display(),
        parallel = manager.max_parallel(),
        "Download manager ready"
    );

    Server::new(settings.backend_port, manager, registry)
        .with_bind_address(settings.backend_host.clone())
        .with_default_provider(settings.default_provider)
        .start()
        .await
}

/// Run a single download with a progress bar; Ctrl+C cancels it.
async fn download(settings: Settings, request: DownloadRequest, json: bool) -> Result<DownloadJob> {
    use indicatif::{ProgressBar, ProgressStyle};

    let registry = Arc::new(LocalModelRegistry::new(settings.huggingface_download_path.clone()));
    let manager = build_manager(&settings, registry);

    if !json {
        println!();
        println!(
            "{CYAN}[↓]{RESET} Downloading {WHITE}{BOLD}{}{RESET} into {}",
            request.model_id,
            settings.huggingface_download_path.display()
        );
        println!();
    }

    let job = manager.submit(request).await?;

    let pb = if json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(0)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("  {spinner:.green} [{bar:40.cyan/blue}] {bytes}/{total_bytes} | {msg}")
            .context("Invalid progress bar template")?
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));
    pb.set_message("Queued");

    let mut interval = tokio::time::interval(Duration::from_millis(POLL_INTERVAL_MS));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cancel_requested = false;

    let finished = loop {
        tokio::select! {
            result = &mut ctrl_c, if !cancel_requested => {
                cancel_requested = true;
                if let Err(e) = result {
                    tracing::warn!("Failed to listen for Ctrl+C: {}", e);
                    continue;
                }
                pb.set_message("Cancelling...");
                manager.cancel(&job.id).await?;
            }
            _ = interval.tick() => {
                let Some(current) = manager.get(&job.id).await? else {
                    anyhow::bail!("Download job {} disappeared", job.id);
                };

                if let Some(total) = current.total_bytes {
                    pb.set_length(total);
                }
                pb.set_position(current.downloaded_bytes);
                if !cancel_requested {
                    pb.set_message(current.status.to_string());
                }

                // A cancelled running job is terminal before its worker stops
                if current.is_terminal() && current.completed_at.is_some() {
                    break current;
                }
            }
        }
    };
    pb.finish_and_clear();

    let finished = if finished.status == DownloadStatus::Completed && finished.request.auto_load {
        await_activation_note(&manager, finished).await?
    } else {
        finished
    };
    manager.shutdown().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&finished)?);
    } else {
        print_outcome(&finished);
    }
    Ok(finished)
}

/// Wait briefly for the post-completion note that replaces the completion message.
async fn await_activation_note(manager: &DownloadManager, completed: DownloadJob) -> Result<DownloadJob> {
    for _ in 0..ACTIVATION_WAIT_POLLS {
        tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS)).await;
        match manager.get(&completed.id).await? {
            Some(current) if current.message != completed.message => return Ok(current),
            _ => {}
        }
    }
    Ok(completed)
}

fn print_outcome(job: &DownloadJob) {
    let message = job.message.as_deref().unwrap_or_default();
    match job.status {
        DownloadStatus::Completed => println!("{GREEN}[✓]{RESET} {}", message),
        DownloadStatus::Cancelled => println!("{YELLOW}[!]{RESET} {}", message),
        _ => println!("{RED}[✗]{RESET} {}", message),
    }
}

fn show_config(settings: &Settings) -> Result<()> {
    let path = playground::config::config_dir()
        .map(|dir| dir.join("config.json"))
        .unwrap_or_else(|_| PathBuf::from("config.json"));

    println!("{CYAN}Config file:{RESET} {}", path.display());
    println!("{}", serde_json::to_string_pretty(&settings.to_masked_json())?);
    Ok(())
}
