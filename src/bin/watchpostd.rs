//! watchpostd - multi-camera surveillance daemon
//!
//! This daemon:
//! 1. Loads the configuration (file + environment overrides)
//! 2. Starts one capture/detect loop per configured source
//! 3. Serves the loopback status API
//! 4. Logs every trigger until Ctrl-C, then stops all pipelines

use anyhow::{Context, Result};
use clap::Parser;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use watchpost::api::ApiServer;
use watchpost::ui::{trigger_line, Ui, UiMode};
use watchpost::{SurveillanceConfig, SurveillanceSupervisor};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera surveillance daemon")]
struct Args {
    /// Path to a JSON or TOML config file.
    #[arg(long, env = "WATCHPOST_CONFIG")]
    config: Option<PathBuf>,

    /// Terminal output style.
    #[arg(long, value_enum, default_value = "auto")]
    ui: UiMode,

    /// Do not start the status API.
    #[arg(long)]
    no_api: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    let ui = Ui::new(args.ui, std::io::stderr().is_terminal());

    let cfg = {
        let _stage = ui.stage("Load configuration");
        SurveillanceConfig::load_from(args.config.as_deref())?
    };

    let supervisor = Arc::new(SurveillanceSupervisor::new());
    let triggers = supervisor.subscribe();
    {
        let _stage = ui.stage("Start pipelines");
        supervisor.start_all(cfg.clone())?;
    }
    eprint!("{}", ui.status_table(&supervisor.status()));

    let api_handle = if args.no_api {
        None
    } else {
        let _stage = ui.stage("Start status API");
        let handle = ApiServer::new(cfg.api.clone(), supervisor.clone()).spawn()?;
        log::info!("status api listening on {}", handle.addr);
        if let Some(path) = &handle.token_path {
            log::info!("status api capability token written to {}", path.display());
        } else {
            log::warn!(
                "status api capability token (handle securely): {}",
                handle.token
            );
        }
        Some(handle)
    };

    let (tx, shutdown) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .context("install Ctrl-C handler")?;

    log::info!("watchpostd running; press Ctrl-C to stop");
    let mut last_status_log = Instant::now();
    loop {
        match shutdown.recv_timeout(Duration::from_millis(250)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        while let Ok(event) = triggers.try_recv() {
            log::info!("{}", trigger_line(&event));
        }
        if last_status_log.elapsed() >= STATUS_LOG_INTERVAL {
            last_status_log = Instant::now();
            for line in ui.status_table(&supervisor.status()).lines() {
                log::info!("{}", line);
            }
        }
    }

    log::info!("shutdown signal received, stopping pipelines...");
    if let Some(handle) = api_handle {
        handle.stop()?;
    }
    {
        let _stage = ui.stage("Stop pipelines");
        supervisor.stop_all()?;
    }
    eprint!("{}", ui.status_table(&supervisor.status()));
    Ok(())
}
