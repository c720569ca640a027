//! Gram gateway - OpenAPI tools with credential injection and an OAuth 2.1 proxy

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{error, info};
use uuid::Uuid;

use gram_gateway::{
    cli::{Cli, Command},
    config::Config,
    encryption::Encryption,
    gateway::Gateway,
    openapi::{DocumentScope, ExtractTask, extract_document},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Some(Command::Extract {
            ref file,
            ref slug,
            ref project_id,
        }) => run_extract(file, slug, project_id).await,
        Some(Command::Keygen) => {
            println!("{}", Encryption::generate_key());
            Ok(())
        }
        Some(Command::Serve) | None => run_server(&cli).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

/// Print the tools one document would produce
async fn run_extract(file: &Path, slug: &str, project_id: &str) -> anyhow::Result<()> {
    let content = tokio::fs::read(file)
        .await
        .with_context(|| format!("read {}", file.display()))?;
    let task = ExtractTask {
        scope: DocumentScope {
            project_id: project_id.to_string(),
            deployment_id: "local".to_string(),
            document_id: Uuid::new_v4(),
            slug: slug.to_string(),
        },
        name: file.display().to_string(),
        content,
    };
    let outcome = extract_document(&task).with_context(|| format!("extract {}", file.display()))?;

    let out = json!({
        "upgraded": outcome.upgraded,
        "tools": outcome.tools,
        "security": outcome.security,
        "events": outcome.events,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}

/// Run the gateway server
async fn run_server(cli: &Cli) -> anyhow::Result<()> {
    let mut config = Config::load(cli.config.as_deref()).context("load configuration")?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(ref host) = cli.host {
        config.server.host.clone_from(host);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        port = config.server.port,
        toolsets = config.toolsets.len(),
        "Starting gateway"
    );

    let gateway = Gateway::new(config).await.context("create gateway")?;
    gateway.run().await.context("gateway error")?;

    info!("Gateway shutdown complete");
    Ok(())
}
