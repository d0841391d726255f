//! Run one launch plan from the command line
//!
//! Usage: `launch-once [PLAN_FILE] [--check]`
//!
//! Prints the launch report as JSON on stdout. On success the runtimes are
//! held until Ctrl+C (or torn down right away with `--check`); the exit code
//! is non-zero unless every required stage succeeded.

use router_launcher::cancel::CancellationToken;
use router_launcher::config::Config;
use router_launcher::orchestrator::{Orchestrator, PlanConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::from_env();
    let mut check_only = false;
    let mut plan_arg = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--check" => check_only = true,
            _ => plan_arg = Some(PathBuf::from(arg)),
        }
    }
    let path = plan_arg
        .or_else(|| config.launch.plan_path.clone())
        .ok_or_else(|| anyhow::anyhow!("No plan file given and LAUNCH_PLAN is not set"))?;

    let plan = PlanConfig::load(&path)?.into_plan(&config.launch_defaults())?;
    let orchestrator = Orchestrator::new();

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling launch");
            on_interrupt.cancel();
        }
    });

    let report = orchestrator.run(&plan, &cancel).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.is_success() && !check_only && !cancel.is_cancelled() {
        info!("All required stages ready, press Ctrl+C to stop");
        cancel.cancelled().await;
    }

    let teardown = orchestrator.teardown(&plan).await;
    if !teardown.is_clean() {
        eprintln!("{}", serde_json::to_string_pretty(&teardown)?);
    }

    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}
