//! 元数据测试引擎命令行入口

use anyhow::{Context, Result};
use catalog_shared::config::AppConfig;
use catalog_shared::observability;
use clap::Parser;
use test_engine::cli::{Cli, execute};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load("metadata-test-engine").unwrap_or_else(|e| {
        eprintln!("Failed to load config, using defaults: {}", e);
        AppConfig::default()
    });
    let _guard = observability::init(&config.service_name, &config.observability)?;

    info!(command = ?cli.command, "Starting metadata test engine");
    let output = execute(cli.command, &config.test_engine).await?;

    let rendered = serde_json::to_string_pretty(&output).context("序列化输出失败")?;
    println!("{}", rendered);
    Ok(())
}
