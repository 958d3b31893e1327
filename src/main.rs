//! Cadence 命令行入口
//!
//! 用法：`cadence <query...>`；配置来自 config/default.toml、CADENCE_CONFIG 指向的文件与 CADENCE__* 环境变量。

use std::path::PathBuf;

use anyhow::Context;
use cadence::config::load_config;
use cadence::Orchestrator;
use serde_json::Map;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cadence::observability::init();

    let query = std::env::args().skip(1).collect::<Vec<_>>().join(" ");
    if query.trim().is_empty() {
        anyhow::bail!("usage: cadence <query>");
    }

    let config_path = std::env::var("CADENCE_CONFIG").ok().map(PathBuf::from);
    let cfg = load_config(config_path).context("failed to load configuration")?;
    let orchestrator = Orchestrator::from_config(&cfg).context("invalid configuration")?;

    let supervisor = orchestrator.supervisor().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling run");
            supervisor.cancel();
        }
    });

    let result = orchestrator.run(&query, Map::new()).await;
    let report = orchestrator.monitor().report();
    tracing::info!(
        status = ?report.health.status,
        success_rate = report.health.success_rate,
        "run health"
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("failed to encode result")?
    );
    Ok(())
}
