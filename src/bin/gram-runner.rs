//! Gram function runner

use std::process::ExitCode;

use anyhow::{Context, bail};
use clap::Parser;
use tracing::{error, info};

use gram_gateway::{
    cli::RunnerCli,
    runner::{BootstrapConfig, RunnerOptions, initialize, run},
    secret::Secret,
    setup_tracing,
};

const AUTH_SECRET_VAR: &str = "GRAM_FUNCTION_AUTH_SECRET";

#[tokio::main]
async fn main() -> ExitCode {
    let cli = RunnerCli::parse();

    let pretty = std::env::var("GRAM_LOG_PRETTY").is_ok_and(|v| !v.is_empty());
    if let Err(e) = setup_tracing("info", if pretty { None } else { Some("json") }) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = if cli.init { init(&cli) } else { serve(cli).await };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn init(cli: &RunnerCli) -> anyhow::Result<()> {
    let config = BootstrapConfig {
        language: cli.language,
        code_path: cli.code_path.clone(),
        work_dir: cli.work_dir.clone(),
    };
    let program = initialize(&config).context("initialize work dir")?;
    info!(command = %program.command, work_dir = %cli.work_dir.display(), "Work dir ready");
    Ok(())
}

async fn serve(cli: RunnerCli) -> anyhow::Result<()> {
    let secret = match std::env::var(AUTH_SECRET_VAR) {
        Ok(v) if !v.trim().is_empty() => Secret::new(v),
        _ => bail!("{AUTH_SECRET_VAR} must be set"),
    };
    let options = RunnerOptions::new(cli.listen, cli.language, cli.work_dir, secret);
    run(options).await.context("runner failed")
}
