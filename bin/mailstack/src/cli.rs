use std::path::PathBuf;

use clap::Parser;
use tracing::level_filters::LevelFilter;

/// The default output data directory.
const DEFAULT_OUTDATA: &str = "./deployments";

/// The default directory of contract artifacts.
const DEFAULT_ARTIFACTS: &str = "./artifacts";

/// The default per-chain wall-clock budget, in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 15 * 60;

/// How the run summary is printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum ReportFormat {
    Table,
    Json,
}

#[derive(Parser)]
#[command(name = "mailstack")]
#[command(
    author,
    version,
    about = "Deploy and reconcile the messaging core contracts across many chains"
)]
pub struct Cli {
    /// The verbosity level.
    #[arg(short, long, env = "MAILSTACK_VERBOSITY", default_value_t = LevelFilter::INFO)]
    pub verbosity: LevelFilter,

    /// Path to the deployment configuration (a Mailstack.toml file or its directory).
    ///
    /// Values can be overridden with `MAILSTACK_`-prefixed environment variables,
    /// nested keys separated by `__` (e.g. `MAILSTACK_CHAINS__ALPHA__RPC_URL`).
    #[arg(long, alias = "conf", env = "MAILSTACK_CONFIG")]
    pub config: PathBuf,

    /// Chains to deploy on. Defaults to every configured chain.
    #[arg(long, value_delimiter = ',', env = "MAILSTACK_CHAINS")]
    pub chains: Vec<String>,

    /// The path to the output data directory.
    ///
    /// Addresses of a previous run found there are reused.
    #[arg(long, env = "MAILSTACK_OUTDATA", default_value = DEFAULT_OUTDATA)]
    pub outdata: PathBuf,

    /// Directory of `<Contract>.json` bytecode artifacts.
    #[arg(long, env = "MAILSTACK_ARTIFACTS", default_value = DEFAULT_ARTIFACTS)]
    pub artifacts: PathBuf,

    /// Wall-clock budget of each chain, in seconds.
    #[arg(long, env = "MAILSTACK_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_secs: u64,

    /// Deploy fresh implementations for existing proxies and upgrade them.
    #[arg(long, env = "MAILSTACK_REDEPLOY_IMPLEMENTATION", default_value_t = false)]
    pub redeploy_implementation: bool,

    /// How to print the run summary.
    #[arg(long, env = "MAILSTACK_REPORT", default_value_t = ReportFormat::Table)]
    pub report: ReportFormat,
}
