use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use futures_util::future::BoxFuture;
use tracing_subscriber::EnvFilter;

use carapace::cli::{Cli, Command};
use carapace::error::CarapaceError;
use carapace::pool::{PoolConfig, WarmPool};
use carapace::runner::{RunnerConfig, VmRunner, run_isolated};
use carapace::seed::{SeedOptions, build_seed};
use carapace::server::{self, AppState};

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env()
            .add_directive("carapace=info".parse().expect("valid log directive"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Serve {
            image,
            bind,
            pool_size,
            max_size,
            memory_mb,
        } => {
            let mut runner_config = RunnerConfig::new(resolve_image(image)?);
            runner_config.memory_mb = memory_mb;

            let boot_config = runner_config.clone();
            let boot = Arc::new(move || -> BoxFuture<'static, Result<Arc<VmRunner>, CarapaceError>> {
                let config = boot_config.clone();
                Box::pin(async move {
                    let runner = Arc::new(VmRunner::new(config));
                    runner.boot().await?;
                    Ok(runner)
                })
            });

            let pool_config = PoolConfig {
                target_size: pool_size,
                max_size,
                ..PoolConfig::default()
            };
            let pool = WarmPool::new(pool_config, boot);
            pool.start().await?;
            tracing::info!("{}", pool.status_line());

            let state = AppState::new(pool);
            server::serve(state, bind, shutdown_signal()).await?;
        }

        Command::Run { image, command } => {
            let config = RunnerConfig::new(resolve_image(image)?);
            let result = run_isolated(config, &command).await?;
            if !result.stdout.is_empty() {
                println!("{}", result.stdout);
            }
            if !result.stderr.is_empty() {
                eprintln!("{}", result.stderr);
            }
            std::process::exit(result.exit_code);
        }

        Command::Seed { key, out, hostname } => {
            let public_key = std::fs::read_to_string(&key)
                .map_err(|e| CarapaceError::io(format!("reading key {}", key.display()), e))?;
            let mut opts = SeedOptions::new(public_key.trim(), &out);
            opts.hostname = hostname.as_deref();
            build_seed(opts).await?;
            println!("Wrote seed ISO to {}", out.display());
        }
    }

    Ok(())
}

/// Image resolution order: CLI flag, `CARAPACE_IMAGE`, legacy `IMAGE_PATH`.
fn resolve_image(flag: Option<PathBuf>) -> Result<PathBuf, CarapaceError> {
    if let Some(path) = flag {
        return Ok(path);
    }
    for var in ["CARAPACE_IMAGE", "IMAGE_PATH"] {
        if let Ok(value) = std::env::var(var)
            && !value.is_empty()
        {
            return Ok(PathBuf::from(value));
        }
    }
    Err(CarapaceError::Validation {
        message: "no base image: pass --image or set CARAPACE_IMAGE".into(),
    })
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .expect("registering SIGTERM handler");
    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
    }
}
