//! Money market scenario runner
//!
//! Builds a deployment from the config directory, runs a scripted scenario
//! against it and prints the JSON report on stdout.
//!
//! Usage: `moneymarket [DEPLOYMENT] [SCENARIO]`

use anyhow::{Context, Result};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use moneymarket_core::config::{config_dir_from_env, DEFAULT_DEPLOYMENT};
use moneymarket_core::{Deployment, DeploymentLoader};

/// Environment variable names.
mod env {
    pub const DEPLOYMENT: &str = "DEPLOYMENT";
    pub const SCENARIO: &str = "SCENARIO";
    pub const LOG_FORMAT: &str = "LOG_FORMAT";
}

fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    init_tracing();
    print_banner();

    let mut args = std::env::args().skip(1);
    let deployment_name = args
        .next()
        .or_else(|| std::env::var(env::DEPLOYMENT).ok())
        .unwrap_or_else(|| DEFAULT_DEPLOYMENT.to_string());

    let loader = DeploymentLoader::new(config_dir_from_env());
    info!(config_dir = ?loader.config_dir(), deployment = %deployment_name, "Loading configuration");
    let resolved = loader.load(&deployment_name)?;
    resolved.engine.log_config();

    let scenario_name = args
        .next()
        .or_else(|| std::env::var(env::SCENARIO).ok())
        .or_else(|| resolved.default_scenario.clone())
        .context("No scenario given: pass one as the second argument or set SCENARIO")?;
    let scenario = loader.load_scenario(&scenario_name)?;

    let mut deployment = Deployment::from_resolved(&resolved)?;
    let report = deployment.run_scenario(&scenario)?;

    for liquidation in &report.flash_liquidations {
        info!(
            borrower = %liquidation.borrower,
            repaid = %liquidation.repaid,
            profit = %liquidation.profit,
            "Flash liquidation executed"
        );
    }
    info!(
        steps = report.steps.len(),
        liquidations = report.liquidations.len() + report.flash_liquidations.len(),
        "Scenario finished"
    );

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Logs go to stderr so stdout carries only the report. `LOG_FORMAT=json`
/// switches to JSON lines.
fn init_tracing() {
    let json = std::env::var(env::LOG_FORMAT).is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json().with_writer(std::io::stderr)))
        .with((!json).then(|| fmt::layer().with_writer(std::io::stderr)))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,moneymarket_core=debug")),
        )
        .init();
}

/// Print startup banner.
fn print_banner() {
    eprintln!(
        r#"
    ┌┬┐┌─┐┌┐┌┌─┐┬ ┬  ┌┬┐┌─┐┬─┐┬┌─┌─┐┌┬┐
    ││││ ││││├┤ └┬┘  │││├─┤├┬┘├┴┐├┤  │
    ┴ ┴└─┘┘└┘└─┘ ┴   ┴ ┴┴ ┴┴└─┴ ┴└─┘ ┴
    Scenario Runner v0.1.0
    "#
    );
}
