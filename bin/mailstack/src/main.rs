//! mailstack deploys the messaging core contracts on every configured chain
//! and converges what earlier runs left behind.

mod cli;

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::Table;
use comfy_table::presets::UTF8_FULL;
use figment::Figment;
use figment::providers::{Env, Format, Toml};

use cli::{Cli, ReportFormat};
use mailstack_deploy::{
    ArtifactHookDeployer, ArtifactModuleDeployer, BatchReport, ChainOutcome, ChainTarget,
    ContractArtifacts, CoreDeployer, DeploymentConfig, DeploymentOutput, JsonRpcChainClient,
    LoggingVerifier, config::CONFIG_FILENAME,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let config = load_config(&cli)?.select(&cli.chains)?;
    let artifacts = ContractArtifacts::load_from_dir(&cli.artifacts)?;
    let mut output = DeploymentOutput::load(&cli.outdata)?;

    let mut targets = Vec::with_capacity(config.chains.len());
    for (name, chain) in config.chains {
        let signer = chain
            .signer
            .resolve_address()
            .with_context(|| format!("Failed to resolve signer of chain {name}"))?;
        let client = JsonRpcChainClient::new(chain.rpc_url.clone(), signer, chain.overrides)?;

        tracing::info!(chain = %name, rpc_url = %chain.rpc_url, signer = %signer, "Chain configured");
        targets.push(ChainTarget {
            name,
            domain_id: chain.domain_id,
            client,
            core: chain.core,
        });
    }

    let deployer = CoreDeployer::new(
        artifacts.clone(),
        ArtifactModuleDeployer::new(artifacts.clone()),
        ArtifactHookDeployer::new(artifacts),
        LoggingVerifier,
    )
    .with_chain_timeout(Duration::from_secs(cli.timeout_secs))
    .with_redeploy_implementations(cli.redeploy_implementation)
    .with_output_dir(&cli.outdata);

    tracing::info!(
        chains = targets.len(),
        outdata = %cli.outdata.display(),
        "Starting deployment..."
    );
    let report = deployer.deploy_all(&targets, &mut output).await?;

    match cli.report {
        ReportFormat::Table => println!("{}", summary_table(&report)),
        ReportFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&report).context("Failed to serialize report")?
        ),
    }

    let failed = report.failed().count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} chains failed", report.len());
    }

    Ok(())
}

/// Load the configuration file, merged with `MAILSTACK_` environment overrides.
fn load_config(cli: &Cli) -> Result<DeploymentConfig> {
    let path = if cli.config.is_dir() {
        cli.config.join(CONFIG_FILENAME)
    } else {
        cli.config.clone()
    };
    if !path.exists() {
        anyhow::bail!("Configuration file not found: {}", path.display());
    }

    let config: DeploymentConfig = Figment::new()
        .merge(Toml::file(&path))
        .merge(
            Env::prefixed("MAILSTACK_")
                .filter(|key| key.starts_with("chains__"))
                .split("__"),
        )
        .extract()
        .with_context(|| format!("Failed to load configuration from {}", path.display()))?;

    tracing::info!(path = %path.display(), chains = config.chains.len(), "Configuration loaded");
    Ok(config)
}

fn summary_table(report: &BatchReport) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL).set_header(vec![
        "Chain",
        "Stage",
        "Status",
        "Contracts",
        "Unreconciled",
        "Error",
    ]);

    for (chain, chain_report) in report.iter() {
        let (status, error) = match &chain_report.outcome {
            ChainOutcome::Done => ("ok".to_string(), String::new()),
            ChainOutcome::Failed { stage, failure } => {
                (format!("failed in {stage}"), failure.to_string())
            }
        };
        let unreconciled = chain_report
            .unreconciled
            .iter()
            .map(|item| item.item.as_str())
            .collect::<Vec<_>>()
            .join(", ");

        table.add_row(vec![
            chain.clone(),
            chain_report.stage.to_string(),
            status,
            chain_report.contracts.len().to_string(),
            unreconciled,
            error,
        ]);
    }

    table
}
