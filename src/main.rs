use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Arg, Command};
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use yggdrasil_config::AppConfig;

mod app;
mod shutdown;

use app::Application;
use shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> ExitCode {
    let matches = Command::new("yggdrasil")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Homelab task dispatcher")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path (YAML)"),
        )
        .arg(
            Arg::new("log-level")
                .short('l')
                .long("log-level")
                .value_name("LEVEL")
                .value_parser(["trace", "debug", "info", "warn", "error"])
                .default_value("info"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .value_name("FORMAT")
                .value_parser(["json", "pretty"])
                .default_value("pretty"),
        )
        .get_matches();

    let log_level = matches.get_one::<String>("log-level").unwrap();
    let log_format = matches.get_one::<String>("log-format").unwrap();
    if let Err(e) = init_logging(log_level, log_format) {
        eprintln!("failed to initialize logging: {e}");
        return ExitCode::from(1);
    }

    let config_path = matches.get_one::<String>("config").map(String::as_str);
    let config = match AppConfig::load(config_path) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            return ExitCode::from(2);
        }
    };
    let shutdown_timeout = config.shutdown_timeout();

    let app = match Application::new(config).await {
        Ok(app) => app,
        Err(e) => {
            error!(error = %e, "ledger unavailable");
            return ExitCode::from(3);
        }
    };

    let shutdown = ShutdownManager::new();
    let mut app_handle = tokio::spawn(app.run(shutdown.clone()));

    let early_exit = tokio::select! {
        _ = wait_for_shutdown_signal() => None,
        result = &mut app_handle => Some(result),
    };

    let result = match early_exit {
        Some(result) => result,
        None => {
            info!("shutdown signal received");
            shutdown.shutdown();

            // Grace window plus margin for draining observability tasks.
            let join_window = shutdown_timeout + Duration::from_secs(30);
            match tokio::time::timeout(join_window, &mut app_handle).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("dispatcher did not stop within the grace window");
                    return ExitCode::from(1);
                }
            }
        }
    };

    match result {
        Ok(Ok(())) => {
            info!("dispatcher exited cleanly");
            ExitCode::SUCCESS
        }
        Ok(Err(e)) => {
            error!(error = %e, "dispatcher failed");
            ExitCode::from(1)
        }
        Err(e) => {
            error!(error = %e, "dispatcher task panicked");
            ExitCode::from(1)
        }
    }
}

fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => registry
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .context("failed to initialize json logging")?,
        _ => registry
            .with(tracing_subscriber::fmt::layer().pretty())
            .try_init()
            .context("failed to initialize pretty logging")?,
    }
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("received Ctrl+C");
        }
        _ = terminate => {
            info!("received SIGTERM");
        }
    }
}
