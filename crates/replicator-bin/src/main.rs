use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

use replicator_core::config::{Isolation, ReplicatorConfig};
use replicator_core::registry::WindowRegistry;
use replicator_core::worker;
use replicator_platform::screen::{CaptureBackend, CaptureError, CaptureRegion};
use replicator_platform::window::{WindowEnumerator, WindowHandle};

mod app;

#[derive(Parser, Debug)]
#[command(name = "screen-replicator")]
#[command(about = "Mirror the live contents of one desktop window into a viewer window")]
#[command(version)]
struct Cli {
    /// Path to config file
    #[arg(long, env = "REPLICATOR_CONFIG_PATH", global = true)]
    config_path: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "REPLICATOR_LOG_LEVEL", global = true)]
    log_level: String,

    /// Also write INFO and above to this file (truncated on start)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    /// Title of the window to replicate; prompts for one when omitted
    #[arg(long)]
    window: Option<String>,

    /// Capture only this part of the client area: x,y,width,height
    #[arg(long, allow_hyphen_values = true)]
    region: Option<CaptureRegion>,

    /// Display refresh rate
    #[arg(long)]
    fps: Option<u32>,

    /// Where the capture loop runs (process or thread)
    #[arg(long)]
    isolation: Option<Isolation>,

    /// Run as capture worker (spawned by the viewer, not user-facing)
    #[arg(long, hide = true)]
    worker_mode: bool,

    /// Raw handle of the window to capture (used with --worker-mode)
    #[arg(long, hide = true, allow_hyphen_values = true)]
    window_handle: Option<WindowHandle>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the titles of all visible top-level windows
    List {
        /// Print a JSON array instead of one title per line
        #[arg(long)]
        json: bool,
    },
    /// Print the effective configuration
    Config {
        /// Write it to the config file
        #[arg(long)]
        save: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_file.as_deref())?;

    // Worker mode: stdout carries the frame stream, nothing else runs.
    if cli.worker_mode {
        let handle = cli
            .window_handle
            .context("--window-handle is required with --worker-mode")?;
        return worker::run_worker_stdio(handle, cli.region, open_capture_backend);
    }

    info!(
        "screen-replicator v{} starting (os={}, arch={})",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH,
    );

    let config_path = cli
        .config_path
        .clone()
        .unwrap_or_else(ReplicatorConfig::default_path);

    let mut config = ReplicatorConfig::load_or_default(&config_path)?;

    // CLI args override config file
    if let Some(title) = cli.window {
        config.window_title = Some(title);
    }
    if let Some(region) = cli.region {
        config.region = Some(region);
    }
    if let Some(fps) = cli.fps {
        config.target_fps = fps;
    }
    if let Some(isolation) = cli.isolation {
        config.isolation = isolation;
    }
    config.validate().context("invalid configuration")?;

    match cli.command {
        Some(Commands::List { json }) => list_windows(json),
        Some(Commands::Config { save }) => show_config(&config, &config_path, save),
        None => run_viewer(config),
    }
}

fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(env_filter);

    let file_layer = match log_file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("failed to create log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(false)
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(LevelFilter::INFO),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .init();
    Ok(())
}

fn list_windows(json: bool) -> Result<()> {
    let registry = WindowRegistry::new(create_window_enumerator()?);
    let titles = registry
        .list_visible_windows()
        .context("failed to list windows")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&titles)?);
    } else {
        for title in titles {
            println!("{}", title);
        }
    }
    Ok(())
}

fn show_config(config: &ReplicatorConfig, path: &Path, save: bool) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    if save {
        config.save(path)?;
        info!("config saved to {}", path.display());
    }
    Ok(())
}

fn run_viewer(config: ReplicatorConfig) -> Result<()> {
    let registry = WindowRegistry::new(create_window_enumerator()?);

    // The capture context's async side lives on its own runtime; the event
    // loop stays on the main thread.
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("replicator-rt")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;
    let rt_handle = runtime.handle().clone();

    let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let app_failure = Arc::clone(&failure);

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default()
            .with_title(app::WINDOW_TITLE)
            .with_inner_size([480.0, 360.0])
            .with_resizable(true),
        ..Default::default()
    };

    eframe::run_native(
        app::WINDOW_TITLE,
        options,
        Box::new(move |cc| {
            Ok(Box::new(app::ReplicatorApp::new(
                cc,
                config,
                registry,
                open_capture_backend,
                rt_handle,
                app_failure,
            )))
        }),
    )
    .map_err(|e| anyhow::anyhow!("viewer window failed: {}", e))?;

    runtime.shutdown_timeout(std::time::Duration::from_secs(1));

    let failure = failure.lock().ok().and_then(|mut f| f.take());
    match failure {
        Some(message) => anyhow::bail!(message),
        None => {
            info!("viewer closed");
            Ok(())
        }
    }
}

#[cfg(target_os = "windows")]
fn create_window_enumerator() -> Result<Box<dyn WindowEnumerator>> {
    replicator_windows::registry::create_window_enumerator()
}

#[cfg(not(target_os = "windows"))]
fn create_window_enumerator() -> Result<Box<dyn WindowEnumerator>> {
    anyhow::bail!("window enumeration not supported on this platform")
}

#[cfg(target_os = "windows")]
fn open_capture_backend(handle: WindowHandle) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    replicator_windows::capture::open_window_capture(handle)
}

#[cfg(not(target_os = "windows"))]
fn open_capture_backend(_handle: WindowHandle) -> Result<Box<dyn CaptureBackend>, CaptureError> {
    Err(CaptureError::Unsupported)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_worker_flags_round_trip() {
        let args = worker::worker_args(WindowHandle(-42), Some(CaptureRegion::new(-8, 0, 640, 480)));
        let cli = Cli::try_parse_from(std::iter::once("screen-replicator".to_string()).chain(args)).unwrap();

        assert!(cli.worker_mode);
        assert_eq!(cli.window_handle, Some(WindowHandle(-42)));
        assert_eq!(cli.region, Some(CaptureRegion::new(-8, 0, 640, 480)));
    }

    #[test]
    fn test_cli_overrides() {
        let cli = Cli::try_parse_from([
            "screen-replicator",
            "--window",
            "Untitled - Notepad",
            "--fps",
            "30",
            "--isolation",
            "thread",
            "list",
            "--json",
        ])
        .unwrap();

        assert_eq!(cli.window.as_deref(), Some("Untitled - Notepad"));
        assert_eq!(cli.fps, Some(30));
        assert_eq!(cli.isolation, Some(Isolation::Thread));
        assert!(matches!(cli.command, Some(Commands::List { json: true })));
    }

    #[test]
    fn test_cli_rejects_bad_region() {
        assert!(Cli::try_parse_from(["screen-replicator", "--region", "1,2,3"]).is_err());
    }
}
