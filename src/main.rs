#![deny(warnings)]
#![deny(clippy::unwrap_used)]

use std::fs;
use std::sync::Arc;

use dotenv::dotenv;
use futures::future::join_all;
use regex::Regex;
use tracing::{error, info, warn};

use ssh_deploy::engine::{
    CommandTokenStrategy, DeploymentPlan, EngineConfig, EngineError, Fleet, ShellCommand,
    SshConnector, TracingNotifier,
};

/// Environment variable naming the JSON deployment plan
const PLAN_ENV_VAR: &str = "DEPLOY_PLAN";

fn load_plan() -> Result<DeploymentPlan, EngineError> {
    let path = std::env::var(PLAN_ENV_VAR)
        .map_err(|_| EngineError::Config(format!("{} is not set", PLAN_ENV_VAR)))?;
    let text = fs::read_to_string(&path)
        .map_err(|e| EngineError::Config(format!("Unable to read plan {}: {}", path, e)))?;
    serde_json::from_str(&text)
        .map_err(|e| EngineError::Config(format!("Invalid plan {}: {}", path, e)))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    // Initialize logging with proper tracing default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().expect("valid directive")),
        )
        .init();

    let config = EngineConfig::from_env()?;
    let plan = load_plan()?;

    let mut strategy = CommandTokenStrategy::new();
    if let Some(launcher) = &plan.launcher {
        strategy = strategy.with_launcher(Regex::new(&format!("^(?:{})", launcher))?);
    }

    let fleet = Fleet::new(
        plan.subsystem.clone(),
        config,
        Arc::new(TracingNotifier),
        Arc::new(SshConnector),
    )
    .with_stop_strategy(Arc::new(strategy));

    info!(
        "Deploying subsystem '{}' to {} host(s)",
        plan.subsystem,
        plan.hosts.len()
    );
    let reports = fleet.deploy(plan.hosts).await;
    for report in reports.iter().filter(|r| !r.ready) {
        error!(
            host = %report.host,
            "Not deployed: {}",
            report.error.as_deref().unwrap_or("unknown error")
        );
    }

    let mut pending = Vec::new();
    for planned in &plan.commands {
        let Some(handler) = fleet.handler(&planned.host) else {
            warn!(host = %planned.host, "Skipping '{}': host not ready", planned.command);
            continue;
        };

        let mut command = ShellCommand::new(planned.descriptor());
        if let Some(pattern) = &planned.expect {
            command = command.expecting(Regex::new(pattern)?);
        }

        match handler.execute_command(command) {
            Ok(handle) => pending.push(handle.wait()),
            Err(e) => error!(host = %planned.host, "Unable to queue '{}': {}", planned.command, e),
        }
    }

    let results = join_all(pending).await;
    let failed = results.iter().filter(|r| r.is_err()).count();
    info!(
        "{} command(s) finished, {} failed",
        results.len() - failed,
        failed
    );

    if plan.stop_on_exit {
        let stopped = fleet.stop_executions().await;
        info!("Stopped {} component(s)", stopped);
    }

    fleet.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}
