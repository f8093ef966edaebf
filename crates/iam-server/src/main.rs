use std::env;
use std::process::ExitCode;

use anyhow::Context;
use iam_server::ServerBuilder;
use iam_server::config::loader::load_config;
use iam_server::observability;

const CONFIG_ENV: &str = "IAM_CONFIG";
const DEFAULT_CONFIG: &str = "iam.toml";

#[tokio::main]
async fn main() -> ExitCode {
    // .env is optional; only report files that exist but fail to load
    if let Err(e) = dotenvy::dotenv()
        && !e.not_found()
    {
        eprintln!("Warning: failed to load .env file: {e}");
    }

    observability::init_tracing();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = format!("{e:#}"), "iam server stopped");
            eprintln!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let path = config_path(env::args().skip(1));
    let cfg = load_config(Some(&path))
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("invalid configuration in {path}"))?;
    observability::apply_logging_level(&cfg.logging.level);
    tracing::info!(path = %path, debug = cfg.debug, "configuration loaded");

    ServerBuilder::new()
        .with_config(cfg)
        .build()
        .await
        .context("server initialization failed")?
        .run()
        .await
}

/// `--config <path>`, then `IAM_CONFIG`, then `iam.toml`.
fn config_path(mut args: impl Iterator<Item = String>) -> String {
    while let Some(arg) = args.next() {
        if arg == "--config"
            && let Some(path) = args.next()
        {
            return path;
        }
    }
    env::var(CONFIG_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| DEFAULT_CONFIG.to_string())
}
