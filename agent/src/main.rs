//! IoT Agent - Entry Point
//!
//! Keeps a single containerized workload on an edge device up to date,
//! reports heartbeats and host health to the backend, and takes remote
//! commands over MQTT.

use std::collections::HashMap;
use std::env;

use iotagent::app::options::AppOptions;
use iotagent::app::run::run;
use iotagent::filesys::file::File;
use iotagent::logs::{init_logging, LogOptions};
use iotagent::storage::layout::StorageLayout;
use iotagent::storage::settings::Settings;
use iotagent::telemetry::{SystemMonitor, Thresholds};
use iotagent::utils::{run_diagnostic, version_info};

use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{json}"),
            Err(_) => println!("{}", version.version),
        }
        return;
    }

    // Settings file, then environment overrides on top
    let settings_file = match cli_args.get("config") {
        Some(path) => File::new(path),
        None => StorageLayout::default().settings_file(),
    };
    let (mut settings, mut warnings) = Settings::load(&settings_file).await;
    warnings.extend(settings.apply_env());
    warnings.extend(settings.validate());

    let options = AppOptions::from_settings(&settings);

    // Run diagnostics
    if cli_args.contains_key("diagnostic") || cli_args.contains_key("diag") {
        for warning in &warnings {
            println!("{warning}");
        }
        let passed = run_diagnostic(&options).await;
        std::process::exit(if passed { 0 } else { 1 });
    }

    // Initialize logging
    let log_options = LogOptions {
        log_level: settings.log.level,
        stdout: settings.log.stdout,
        log_dir: settings.log.dir.clone(),
        json_format: settings.log.json,
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    for warning in &warnings {
        warn!("{}", warning);
    }

    log_startup(&options).await;

    info!("Running IoT agent with options: {:?}", options);
    let result = run(version.version, options, await_shutdown_signal()).await;
    if let Err(e) = result {
        error!("Failed to run the agent: {e}");
        std::process::exit(1);
    }
}

async fn log_startup(options: &AppOptions) {
    let version = version_info();
    info!(
        "IoT agent {} ({}, built {})",
        version.version, version.git_hash, version.build_time
    );
    info!(
        "Device: {} (id {}), backend: {}",
        options.identity.device_name, options.identity.device_id, options.identity.backend_url
    );

    match SystemMonitor::new(Thresholds::default()).system_info().await {
        Ok(info) => info!(
            "Host {}: {} CPUs at {:.1}%, memory {:.1}% of {} MiB, disk {:.1}% of {} GiB",
            info.system.hostname,
            info.cpu.count,
            info.cpu.percent,
            info.memory.percent,
            info.memory.total / (1024 * 1024),
            info.disk.percent,
            info.disk.total / (1024 * 1024 * 1024)
        ),
        Err(e) => warn!("Unable to collect host information: {}", e),
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                _ => {
                    warn!("Unable to install signal handlers, falling back to Ctrl+C");
                    let _ = tokio::signal::ctrl_c().await;
                    info!("Ctrl+C received, shutting down...");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
        }
        info!("Ctrl+C received, shutting down...");
    }
}
